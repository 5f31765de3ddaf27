use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use contact_identity_api::ContactIdentityApi;
use contact_identity_core::{IdentifyPolicy, IdentifyRequest, IdentifyResponse};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cid")]
#[command(about = "Contact identity resolution CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_DB", default_value = "./contact_identity.sqlite3")]
    db: PathBuf,

    /// Total tries per identify call when the store reports a conflict.
    #[arg(long, env = "IDENTITY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number to its contact cluster.
    Identify(IdentifyArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long = "phone")]
    phone_number: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let policy = IdentifyPolicy { max_attempts: cli.max_attempts };
    let api = ContactIdentityApi::open(&cli.db, policy)?;
    match cli.command {
        Command::Identify(args) => run_identify(&api, args).await,
        Command::Db { command } => run_db(&api, command).await,
    }
}

async fn run_identify(api: &ContactIdentityApi, args: IdentifyArgs) -> Result<()> {
    let request = IdentifyRequest { email: args.email, phone_number: args.phone_number };
    let resolution = api.identify(&request).await.context("identify failed")?;
    let outcome = resolution.outcome();

    let mut body = serde_json::to_value(IdentifyResponse::from(resolution.view))?;
    if let Value::Object(object) = &mut body {
        object.insert("outcome".to_string(), Value::String(outcome.as_str().to_string()));
    }
    emit_json(body)
}

async fn run_db(api: &ContactIdentityApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status().await?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy,
                "legacy_table_present": status.legacy_table_present
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run).await?;
            emit_json(serde_json::to_value(result)?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check().await?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}
