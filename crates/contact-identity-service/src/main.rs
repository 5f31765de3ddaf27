use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_api::{ApiError, ContactIdentityApi, MigrateResult, API_CONTRACT_VERSION};
use contact_identity_core::{IdentifyPolicy, IdentifyRequest, IdentifyResponse};
use contact_identity_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: ContactIdentityApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

/// Error body of the public `/identify` route.
#[derive(Debug, Clone, Serialize)]
struct IdentifyError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "HTTP service resolving contact observations to identity clusters")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./contact_identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Total tries per identify call when the store reports a conflict.
    #[arg(long, env = "IDENTITY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,
    /// Used when `RUST_LOG` is unset.
    #[arg(long, env = "IDENTITY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl IntoResponse for IdentifyError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        error!(error = %format!("{err:#}"), "admin request failed");
        ServiceError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
    }
}

impl From<JsonRejection> for IdentifyError {
    fn from(rejection: JsonRejection) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: rejection.body_text() }
    }
}

impl From<ApiError> for IdentifyError {
    fn from(err: ApiError) -> Self {
        if err.is_client_error() {
            return Self { status: StatusCode::BAD_REQUEST, error: err.to_string() };
        }
        error!(error = %err, "identify request failed");
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: err.to_string() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let policy = IdentifyPolicy { max_attempts: args.max_attempts };
    let api = ContactIdentityApi::open(&args.db, policy)?;
    let summary = api.migrate(false).await.context("failed to migrate contact database")?;
    info!(
        db = %args.db.display(),
        schema_version = ?summary.after_version,
        legacy_rows_imported = ?summary.legacy_rows_imported,
        "contact database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, max_attempts = args.max_attempts, "contact identity service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, IdentifyError> {
    let Json(request) = payload?;
    let resolution = state.api.identify(&request).await?;
    Ok(Json(IdentifyResponse::from(resolution.view)))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().await.map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).await.map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check().await.map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(report)))
}
