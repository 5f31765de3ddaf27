use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use contact_identity_core::{identify, IdentifyPolicy, IdentifyRequest, IdentityError, Resolution};
use contact_identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteContactStore};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub legacy_table_present: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
    pub legacy_rows_imported: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// Opening or migrating the store failed.
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Identity(err) if err.is_client_error())
    }
}

/// Facade shared by the CLI and the HTTP service.
///
/// One instance owns one store handle, so every `identify` issued through it
/// (and its clones) is serialized in-process as well as through SQLite.
#[derive(Clone)]
pub struct ContactIdentityApi {
    db_path: PathBuf,
    store: SqliteContactStore,
    policy: IdentifyPolicy,
    migrated: Arc<OnceCell<()>>,
}

impl ContactIdentityApi {
    /// Open the database at `db_path` without migrating it.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened.
    pub fn open(db_path: &Path, policy: IdentifyPolicy) -> Result<Self> {
        Ok(Self {
            db_path: db_path.to_path_buf(),
            store: SqliteContactStore::open(db_path)?,
            policy,
            migrated: Arc::new(OnceCell::new()),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn policy(&self) -> IdentifyPolicy {
        self.policy
    }

    async fn ensure_migrated(&self) -> Result<()> {
        self.migrated
            .get_or_try_init(|| async { self.store.migrate().await.map(|_| ()) })
            .await?;
        Ok(())
    }

    /// Resolve one observation to its consolidated contact cluster.
    ///
    /// Pending migrations are applied before the first resolution.
    ///
    /// # Errors
    /// Returns [`ApiError::Identity`] for validation, storage, and consistency
    /// failures, or [`ApiError::Setup`] when the schema cannot be migrated.
    pub async fn identify(&self, request: &IdentifyRequest) -> Result<Resolution, ApiError> {
        // Validation failures never touch the database file.
        request.validate()?;
        self.ensure_migrated().await?;
        Ok(identify(&self.store, request, self.policy).await?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be queried.
    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.schema_status().await
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub async fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let before = self.store.schema_status().await?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                legacy_table_present: before.legacy_table_present,
                after_version: None,
                up_to_date: None,
                legacy_rows_imported: None,
            });
        }

        let summary = self.store.migrate().await?;
        let after = self.store.schema_status().await?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            legacy_table_present: before.legacy_table_present,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
            legacy_rows_imported: Some(summary.legacy_rows_imported),
        })
    }

    /// Run database and cluster-shape health probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.integrity_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("contact-identity-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn remove_db_files(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    // Test IDs: TAPI-001
    #[tokio::test]
    async fn api_identify_migrates_and_resolves() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ContactIdentityApi::open(&db_path, IdentifyPolicy::default())?;

        let created = api
            .identify(&IdentifyRequest::new(Some("lorraine@hillvalley.edu"), Some("123456")))
            .await?;
        let extended = api
            .identify(&IdentifyRequest::new(Some("mcfly@hillvalley.edu"), Some("123456")))
            .await?;

        assert_eq!(extended.view.primary_contact_id, created.view.primary_contact_id);
        let body = serde_json::to_value(contact_identity_core::IdentifyResponse::from(
            extended.view,
        ))?;
        assert_eq!(
            body["contact"]["emails"],
            serde_json::json!(["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"])
        );

        let status = api.schema_status().await?;
        assert!(status.pending_versions.is_empty());

        remove_db_files(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[tokio::test]
    async fn api_migrate_dry_run_plans_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ContactIdentityApi::open(&db_path, IdentifyPolicy::default())?;

        let planned = api.migrate(true).await?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);
        assert_eq!(api.schema_status().await?.current_version, 0);

        let applied = api.migrate(false).await?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));
        assert_eq!(applied.legacy_rows_imported, Some(0));

        let report = api.integrity_check().await?;
        assert!(report.is_healthy());

        remove_db_files(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[tokio::test]
    async fn api_rejects_empty_request_before_migrating() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = ContactIdentityApi::open(&db_path, IdentifyPolicy::default())?;

        let err = match api.identify(&IdentifyRequest::default()).await {
            Ok(resolution) => panic!("expected validation error, got {resolution:?}"),
            Err(err) => err,
        };
        assert!(err.is_client_error());
        assert_eq!(api.schema_status().await?.current_version, 0);

        remove_db_files(&db_path);
        Ok(())
    }
}
