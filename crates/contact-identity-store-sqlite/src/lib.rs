use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    ContactId, ContactRecord, ContactStore, ContactTx, LinkPrecedence, NewContact, StoreError,
};
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

const LATEST_SCHEMA_VERSION: i64 = 1;

const LEGACY_CONTACT_TABLE: &str = "Contact";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  linked_id INTEGER REFERENCES contacts(id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  )
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at";

type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite-backed contact store.
///
/// Clones share one connection. Guarded sections opened through any clone are
/// serialized by an async gate and run as `BEGIN IMMEDIATE` transactions, so
/// separate processes on the same file serialize through SQLite's write lock.
#[derive(Clone)]
pub struct SqliteContactStore {
    conn: SharedConnection,
    gate: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    /// A pre-migration `Contact` table is present in the database file.
    pub legacy_table_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationSummary {
    pub applied_versions: Vec<i64>,
    pub legacy_rows_imported: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterViolationKind {
    MissingPrimary,
    LinkedToSecondary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterViolation {
    pub contact_id: i64,
    pub linked_id: i64,
    pub kind: ClusterViolationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub cluster_violations: Vec<ClusterViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.cluster_violations.is_empty()
    }
}

impl SqliteContactStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), gate: Arc::new(tokio::sync::Mutex::new(())) })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        let _permit = self.gate.lock().await;
        admin_on_blocking_pool(&self.conn, |conn| schema_status_of(conn)).await
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping, legacy import, or any
    /// migration step fails. A failed step leaves the database unchanged.
    pub async fn migrate(&self) -> Result<MigrationSummary> {
        let _permit = self.gate.lock().await;
        admin_on_blocking_pool(&self.conn, migrate_connection).await
    }

    /// Run quick-check, foreign-key-check, cluster-shape, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        let _permit = self.gate.lock().await;
        admin_on_blocking_pool(&self.conn, |conn| integrity_report_of(conn)).await
    }

    /// Load every persisted contact ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub async fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let _permit = self.gate.lock().await;
        admin_on_blocking_pool(&self.conn, |conn| {
            let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC");
            query_contacts(conn, &sql, []).map_err(|err| anyhow!("failed to list contacts: {err}"))
        })
        .await
    }
}

impl ContactStore for SqliteContactStore {
    type Tx = SqliteContactTx;

    async fn begin(&self) -> Result<SqliteContactTx, StoreError> {
        let permit = Arc::clone(&self.gate).lock_owned().await;
        // Built before the first await so a cancelled `begin` still rolls back
        // whatever the blocking task manages to open.
        let tx =
            SqliteContactTx { conn: Arc::clone(&self.conn), finished: false, permit: Some(permit) };
        on_blocking_pool(&tx.conn, |conn| {
            roll_back_open_transaction(conn);
            conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqlite_error)
        })
        .await?;
        Ok(tx)
    }
}

/// One `BEGIN IMMEDIATE` transaction; rolled back on drop unless committed.
///
/// The gate permit travels with the rollback, so the next guarded section
/// cannot start before an abandoned one is undone.
pub struct SqliteContactTx {
    conn: SharedConnection,
    finished: bool,
    permit: Option<OwnedMutexGuard<()>>,
}

impl ContactTx for SqliteContactTx {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        let email = email.map(str::to_string);
        let phone_number = phone_number.map(str::to_string);
        on_blocking_pool(&self.conn, move |conn| {
            let sql = format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE (?1 IS NOT NULL AND email = ?1)
                    OR (?2 IS NOT NULL AND phone_number = ?2)
                 ORDER BY id ASC"
            );
            query_contacts(conn, &sql, params![email, phone_number])
        })
        .await
    }

    async fn find_by_ids_or_linked_ids(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.iter().map(|id| id.0).collect::<Vec<_>>();
        on_blocking_pool(&self.conn, move |conn| {
            let placeholders =
                (1..=ids.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE id IN ({placeholders}) OR linked_id IN ({placeholders})
                 ORDER BY id ASC"
            );
            query_contacts(conn, &sql, params_from_iter(ids.iter()))
        })
        .await
    }

    async fn insert(&mut self, contact: NewContact) -> Result<ContactRecord, StoreError> {
        on_blocking_pool(&self.conn, move |conn| {
            let now = OffsetDateTime::now_utc();
            let stamp = format_timestamp(now)?;
            conn.execute(
                "INSERT INTO contacts(
                    email, phone_number, link_precedence, linked_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.precedence.as_str(),
                    contact.precedence.linked_id().map(|id| id.0),
                    stamp,
                ],
            )
            .map_err(map_sqlite_error)?;

            Ok(ContactRecord {
                id: ContactId(conn.last_insert_rowid()),
                email: contact.email,
                phone_number: contact.phone_number,
                precedence: contact.precedence,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
        })
        .await
    }

    async fn update_to_secondary(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
    ) -> Result<(), StoreError> {
        if id == linked_id {
            return Err(StoreError::Backend(format!("contact {id} cannot link to itself")));
        }
        on_blocking_pool(&self.conn, move |conn| {
            let stamp = format_timestamp(OffsetDateTime::now_utc())?;
            let changed = conn
                .execute(
                    "UPDATE contacts
                     SET link_precedence = 'secondary', linked_id = ?2, updated_at = ?3
                     WHERE id = ?1",
                    params![id.0, linked_id.0, stamp],
                )
                .map_err(map_sqlite_error)?;
            if changed == 1 {
                Ok(())
            } else {
                Err(StoreError::Backend(format!("contact {id} does not exist")))
            }
        })
        .await
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        on_blocking_pool(&self.conn, |conn| conn.execute_batch("COMMIT").map_err(map_sqlite_error))
            .await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteContactTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let conn = Arc::clone(&self.conn);
        let permit = self.permit.take();
        let rollback = move || {
            let _permit = permit;
            match conn.lock() {
                Ok(conn) => roll_back_open_transaction(&conn),
                Err(_) => {
                    warn!("sqlite connection mutex poisoned; abandoned transaction not rolled back");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn_blocking(rollback));
            }
            Err(_) => rollback(),
        }
    }
}

/// Undo a transaction left open on the connection, if any.
fn roll_back_open_transaction(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(error = %err, "failed to roll back abandoned contact transaction");
    }
}

async fn on_blocking_pool<T, F>(conn: &SharedConnection, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
        op(&guard)
    })
    .await
    .map_err(|err| StoreError::Backend(format!("sqlite worker task failed: {err}")))?
}

async fn admin_on_blocking_pool<T, F>(conn: &SharedConnection, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
        op(&mut guard)
    })
    .await
    .context("sqlite admin task failed")?
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation) => {
            StoreError::Conflict(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone_number: Option<String>,
    link_precedence: String,
    linked_id: Option<i64>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl ContactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone_number: row.get(2)?,
            link_precedence: row.get(3)?,
            linked_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<ContactRecord, StoreError> {
        let precedence =
            LinkPrecedence::from_columns(&self.link_precedence, self.linked_id.map(ContactId))
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "contact {} has link_precedence {:?} with linked_id {:?}",
                        self.id, self.link_precedence, self.linked_id
                    ))
                })?;

        Ok(ContactRecord {
            id: ContactId(self.id),
            email: self.email,
            phone_number: self.phone_number,
            precedence,
            created_at: parse_stored_timestamp(self.id, &self.created_at)?,
            updated_at: parse_stored_timestamp(self.id, &self.updated_at)?,
            deleted_at: self
                .deleted_at
                .as_deref()
                .map(|value| parse_stored_timestamp(self.id, value))
                .transpose()?,
        })
    }
}

fn query_contacts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ContactRecord>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let rows = stmt.query_map(params, ContactRow::from_row).map_err(map_sqlite_error)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(map_sqlite_error)?.into_record()?);
    }
    Ok(records)
}

fn migrate_connection(conn: &mut Connection) -> Result<MigrationSummary> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let mut summary = MigrationSummary { applied_versions: Vec::new(), legacy_rows_imported: 0 };
    let mut version = current_schema_version(conn)?;

    if version == 0 && table_exists(conn, "contacts")? {
        if !table_has_column(conn, "contacts", "link_precedence")? {
            return Err(anyhow!("database schema is invalid: contacts has no link_precedence column"));
        }
        // Table created by an earlier build without migration bookkeeping.
        record_schema_version(conn, 1)?;
        version = 1;
    }

    if version < 1 {
        summary.legacy_rows_imported = apply_migration_1(conn)?;
        summary.applied_versions.push(1);
        version = current_schema_version(conn)?;
    }

    if version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        ));
    }

    if !summary.applied_versions.is_empty() {
        info!(
            applied = ?summary.applied_versions,
            legacy_rows_imported = summary.legacy_rows_imported,
            "contact schema migrated"
        );
    }
    Ok(summary)
}

fn apply_migration_1(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction().context("failed to start migration v1 transaction")?;
    tx.execute_batch(MIGRATION_001_SQL).context("failed to create contacts table")?;

    let imported = if table_exists(&tx, LEGACY_CONTACT_TABLE)? {
        import_legacy_contacts(&tx)?
    } else {
        0
    };

    record_schema_version(&tx, 1)?;
    tx.commit().context("failed to commit migration v1")?;
    Ok(imported)
}

struct LegacyContactRow {
    id: i64,
    email: Option<String>,
    phone_number: Option<String>,
    link_precedence: Option<String>,
    linked_id: Option<i64>,
    created_at: Option<String>,
    updated_at: Option<String>,
    deleted_at: Option<String>,
}

/// Copy rows of the pre-migration `Contact` table into `contacts`.
///
/// Ids are preserved and every secondary is re-pointed at the primary its
/// link chain ends on.
fn import_legacy_contacts(conn: &Connection) -> Result<usize> {
    for column in ["email", "phoneNumber", "linkedId", "linkPrecedence", "createdAt"] {
        if !table_has_column(conn, LEGACY_CONTACT_TABLE, column)? {
            return Err(anyhow!("legacy Contact table is missing column {column}"));
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, email, phoneNumber, linkPrecedence, linkedId, createdAt, updatedAt, deletedAt
             FROM Contact
             ORDER BY id ASC",
        )
        .context("failed to read legacy Contact rows")?;
    let rows = stmt.query_map([], |row| {
        Ok(LegacyContactRow {
            id: row.get(0)?,
            email: row.get(1)?,
            phone_number: row.get(2)?,
            link_precedence: row.get(3)?,
            linked_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    })?;

    let mut legacy = BTreeMap::new();
    for row in rows {
        let row = row?;
        legacy.insert(row.id, row);
    }

    let mut secondaries = Vec::new();
    for row in legacy.values() {
        let root = legacy_root(&legacy, row.id)?;
        if root == row.id {
            insert_legacy_row(conn, row, None)?;
        } else {
            secondaries.push((row, root));
        }
    }
    for (row, root) in &secondaries {
        insert_legacy_row(conn, row, Some(*root))?;
    }

    Ok(legacy.len())
}

fn legacy_root(legacy: &BTreeMap<i64, LegacyContactRow>, start: i64) -> Result<i64> {
    let mut current = start;
    for _ in 0..=legacy.len() {
        let Some(row) = legacy.get(&current) else {
            return Err(anyhow!(
                "legacy contact {start} links to missing contact {current}; migration aborted"
            ));
        };
        match (row.link_precedence.as_deref(), row.linked_id) {
            (Some("primary"), _) => return Ok(current),
            (Some("secondary"), Some(next)) => current = next,
            (precedence, linked_id) => {
                return Err(anyhow!(
                    "legacy contact {current} has link_precedence {precedence:?} with linked_id {linked_id:?}; migration aborted"
                ));
            }
        }
    }
    Err(anyhow!("legacy contact {start} sits on a link cycle; migration aborted"))
}

fn insert_legacy_row(conn: &Connection, row: &LegacyContactRow, root: Option<i64>) -> Result<()> {
    let created_at = match row.created_at.as_deref() {
        Some(value) => parse_legacy_timestamp(value)?,
        None => OffsetDateTime::UNIX_EPOCH,
    };
    let updated_at = match row.updated_at.as_deref() {
        Some(value) => parse_legacy_timestamp(value)?,
        None => created_at,
    };
    let deleted_at = row.deleted_at.as_deref().map(parse_legacy_timestamp).transpose()?;
    let precedence = if root.is_some() { "secondary" } else { "primary" };

    conn.execute(
        "INSERT INTO contacts(
            id, email, phone_number, link_precedence, linked_id, created_at, updated_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.id,
            row.email,
            row.phone_number,
            precedence,
            root,
            rfc3339(created_at)?,
            rfc3339(updated_at)?,
            deleted_at.map(rfc3339).transpose()?,
        ],
    )
    .with_context(|| format!("failed to import legacy contact {}", row.id))?;
    Ok(())
}

fn schema_status_of(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let (current_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
        legacy_table_present: table_exists(conn, LEGACY_CONTACT_TABLE)?,
    })
}

fn integrity_report_of(conn: &Connection) -> Result<IntegrityReport> {
    let quick_check_message: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
        .context("failed to run PRAGMA quick_check")?;

    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .context("failed to prepare PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut foreign_key_violations = Vec::new();
    for row in rows {
        foreign_key_violations.push(row?);
    }

    let cluster_violations =
        if table_exists(conn, "contacts")? { cluster_violations_of(conn)? } else { Vec::new() };

    let schema_status = schema_status_of(conn)?;
    Ok(IntegrityReport {
        quick_check_ok: quick_check_message == "ok",
        quick_check_message,
        foreign_key_violations,
        cluster_violations,
        schema_status,
    })
}

fn cluster_violations_of(conn: &Connection) -> Result<Vec<ClusterViolation>> {
    let mut stmt = conn
        .prepare(
            "SELECT child.id, child.linked_id, parent.link_precedence
             FROM contacts AS child
             LEFT JOIN contacts AS parent ON parent.id = child.linked_id
             WHERE child.link_precedence = 'secondary'
               AND (parent.id IS NULL OR parent.link_precedence <> 'primary')
             ORDER BY child.id ASC",
        )
        .context("failed to prepare cluster shape probe")?;
    let rows = stmt.query_map([], |row| {
        let parent_precedence: Option<String> = row.get(2)?;
        Ok(ClusterViolation {
            contact_id: row.get(0)?,
            linked_id: row.get(1)?,
            kind: if parent_precedence.is_some() {
                ClusterViolationKind::LinkedToSecondary
            } else {
                ClusterViolationKind::MissingPrimary
            },
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "contacts")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "contacts", "link_precedence")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: contacts has no link_precedence column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn format_timestamp(value: OffsetDateTime) -> Result<String, StoreError> {
    value
        .format(&Rfc3339)
        .map_err(|err| StoreError::Backend(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_stored_timestamp(id: i64, value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        StoreError::Corrupt(format!("contact {id} has invalid timestamp {value:?}: {err}"))
    })
}

/// Accepts SQLite `CURRENT_TIMESTAMP` text (`YYYY-MM-DD HH:MM:SS`, UTC) or RFC3339.
fn parse_legacy_timestamp(value: &str) -> Result<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(parsed);
    }
    let format = time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .context("failed to build legacy timestamp format")?;
    let parsed = PrimitiveDateTime::parse(value, &format)
        .with_context(|| format!("invalid legacy timestamp: {value}"))?;
    Ok(parsed.assume_utc())
}
