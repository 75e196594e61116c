use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    identity_view, link_violations, resolve, Contact, ContactId, ContactStore, IdentifyRequest,
    IdentityError, IdentityView, LinkPrecedence, LinkViolation, NewContact, Resolution,
    ResolverConfig,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, PrimitiveDateTime};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  phone_number TEXT,
  email TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACTS_EXPORT_FILE: &str = "contacts.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.link_violations.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
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
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "contacts")? {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied contacts schema migration");
            return Ok(1);
        }

        if table_has_column(&self.conn, "contacts", "link_precedence")? {
            // Contacts table created before migrations were tracked.
            record_schema_version(&self.conn, 1)?;
            tracing::info!("adopted legacy contacts table as schema version 1");
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: contacts has no link_precedence column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create contact lookup indexes")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(version = 2, "applied contacts schema migration");
        Ok(())
    }

    /// Resolve one request inside an immediate write transaction.
    ///
    /// The transaction takes the database write lock before the lookup, so
    /// concurrent resolutions against the same file run one at a time and a new
    /// primary is committed together with its self-link.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidInput`] before opening a transaction when
    /// both identifiers are absent, [`IdentityError::StoreUnavailable`] for any
    /// `SQLite` failure, and [`IdentityError::InconsistentLink`] for broken chains.
    pub fn identify(
        &mut self,
        request: &IdentifyRequest,
        config: &ResolverConfig,
    ) -> Result<Resolution, IdentityError> {
        request.identifiers()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;
        let resolution = resolve(&mut SqliteContacts { conn: &tx }, request, config)?;
        tx.commit().map_err(store_error)?;
        Ok(resolution)
    }

    /// Consolidated view of the identity containing `contact_id`, without writing.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] for `SQLite` failures and
    /// [`IdentityError::InconsistentLink`] for broken chains.
    pub fn view_identity(
        &self,
        contact_id: ContactId,
    ) -> Result<Option<IdentityView>, IdentityError> {
        identity_view(&SqliteContacts { conn: &self.conn }, contact_id)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        SqliteContacts { conn: &self.conn }
            .get_by_id(id)
            .with_context(|| format!("failed to load contact {id}"))
    }

    /// Load every contact ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt =
            self.conn.prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"))?;
        let rows = stmt.query_map([], contact_from_row)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.context("failed to decode contact row")?);
        }
        Ok(contacts)
    }

    /// Export contacts as deterministic NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let contacts = self.list_contacts()?;
        let contacts_path = out_dir.join(CONTACTS_EXPORT_FILE);
        let (sha256, records) = write_ndjson_file(&contacts_path, &contacts)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest {
                path: CONTACTS_EXPORT_FILE.to_string(),
                sha256,
                records,
            }],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, link invariant, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
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

        let schema_status = self.schema_status()?;
        let link_violations = if table_exists(&self.conn, "contacts")? {
            link_violations(&self.list_contacts()?)
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations,
            schema_status,
        })
    }
}

/// [`ContactStore`] view over a borrowed connection or open transaction.
struct SqliteContacts<'c> {
    conn: &'c Connection,
}

impl SqliteContacts<'_> {
    fn query_contacts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Contact>, IdentityError> {
        let mut stmt = self.conn.prepare(sql).map_err(store_error)?;
        let rows = stmt.query_map(params, contact_from_row).map_err(store_error)?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.map_err(store_error)?);
        }
        Ok(contacts)
    }
}

impl ContactStore for SqliteContacts<'_> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        self.query_contacts(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE (?1 IS NOT NULL AND email = ?1)
                    OR (?2 IS NOT NULL AND phone_number = ?2)
                 ORDER BY id ASC"
            ),
            params![email, phone_number],
        )
    }

    fn find_by_linked_id(&self, primary_id: ContactId) -> Result<Vec<Contact>, IdentityError> {
        self.query_contacts(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE linked_id = ?1 ORDER BY id ASC"),
            params![primary_id.0],
        )
    }

    fn get_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
        self.conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.0],
                contact_from_row,
            )
            .optional()
            .map_err(store_error)
    }

    fn insert(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        let now = OffsetDateTime::now_utc();
        let now_raw = rfc3339(now).map_err(|err| IdentityError::StoreUnavailable(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, linked_id, link_precedence, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|id| id.0),
                    contact.link_precedence.as_str(),
                    now_raw,
                ],
            )
            .map_err(store_error)?;

        Ok(Contact {
            id: ContactId(self.conn.last_insert_rowid()),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    fn set_linked_id(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        link_precedence: LinkPrecedence,
    ) -> Result<(), IdentityError> {
        let now_raw =
            now_rfc3339().map_err(|err| IdentityError::StoreUnavailable(err.to_string()))?;
        let updated = self
            .conn
            .execute(
                "UPDATE contacts SET linked_id = ?1, link_precedence = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![linked_id.0, link_precedence.as_str(), now_raw, id.0],
            )
            .map_err(store_error)?;
        if updated == 0 {
            return Err(IdentityError::StoreUnavailable(format!("contact {id} does not exist")));
        }
        Ok(())
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: rusqlite::Error) -> IdentityError {
    IdentityError::StoreUnavailable(err.to_string())
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let precedence_raw: String = row.get(4)?;
    let link_precedence = LinkPrecedence::parse(&precedence_raw.to_ascii_lowercase())
        .ok_or_else(|| conversion_error(4, format!("unknown link_precedence: {precedence_raw}")))?;
    let deleted_at = row
        .get::<_, Option<String>>(7)?
        .map(|raw| parse_timestamp(&raw).map_err(|err| conversion_error(7, err.to_string())))
        .transpose()?;

    Ok(Contact {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get::<_, Option<i64>>(3)?.map(ContactId),
        link_precedence,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)
            .map_err(|err| conversion_error(5, err.to_string()))?,
        updated_at: parse_timestamp(&row.get::<_, String>(6)?)
            .map_err(|err| conversion_error(6, err.to_string()))?,
        deleted_at,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
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
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

/// Parse RFC3339, falling back to the naive `YYYY-MM-DD HH:MM:SS[.ffffff]`
/// layout found in legacy contacts tables (read as UTC).
fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
    {
        return Ok(parsed);
    }

    for layout in [
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]",
        "[year]-[month]-[day] [hour]:[minute]:[second]",
    ] {
        let format = time::format_description::parse(layout)
            .with_context(|| format!("invalid timestamp layout: {layout}"))?;
        if let Ok(parsed) = PrimitiveDateTime::parse(value, &format) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(anyhow!("invalid timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write NDJSON row to {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write NDJSON newline to {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

/// Read an exported NDJSON contacts file back into memory.
///
/// # Errors
/// Returns an error when the file cannot be opened or a row fails to parse.
pub fn read_contacts_ndjson(path: &Path) -> Result<Vec<Contact>> {
    let file =
        File::open(path).with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut contacts = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {} of NDJSON", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let contact = serde_json::from_str::<Contact>(&line)
            .with_context(|| format!("failed to parse NDJSON row {}", index + 1))?;
        contacts.push(contact);
    }
    Ok(contacts)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use identity_kernel_core::{LinkViolationKind, MergePolicy, ResolutionOutcome};

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn unique_temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", ulid::Ulid::new()))
    }

    fn cleanup_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn identify(
        store: &mut SqliteStore,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Resolution> {
        store
            .identify(&IdentifyRequest::new(email, phone_number), &ResolverConfig::default())
            .map_err(|err| anyhow!("identify failed: {err}"))
    }

    #[test]
    fn migrate_creates_schema_and_reports_up_to_date() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);
        assert!(table_exists(&store.conn, "contacts")?);
        Ok(())
    }

    #[test]
    fn legacy_contacts_table_is_adopted_and_upgraded() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(
            "CREATE TABLE contacts (
                id INTEGER PRIMARY KEY,
                phone_number VARCHAR,
                email VARCHAR,
                linked_id INTEGER REFERENCES contacts(id),
                link_precedence VARCHAR(9),
                created_at DATETIME,
                updated_at DATETIME,
                deleted_at DATETIME
            );
            INSERT INTO contacts(
                id, phone_number, email, linked_id, link_precedence, created_at, updated_at
            )
            VALUES (1, '2222222222', 'legacy@example.com', 1, 'PRIMARY',
                    '2024-03-01 10:00:00.123456', '2024-03-01 10:00:00.123456');",
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);

        let resolution = identify(&mut store, Some("new@example.com"), Some("2222222222"))?;
        assert_eq!(resolution.view.primary_contact_id, ContactId(1));
        assert_eq!(resolution.outcome, ResolutionOutcome::CreatedSecondary);
        Ok(())
    }

    #[test]
    fn migrate_rejects_contacts_table_without_precedence() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE contacts (id INTEGER PRIMARY KEY, email TEXT);")?;
        assert!(store.migrate().is_err());
        Ok(())
    }

    #[test]
    fn sqlite_checks_reject_invalid_precedence_and_empty_identifiers() -> Result<()> {
        let store = migrated_memory_store()?;

        let bad_precedence = store.conn.execute(
            "INSERT INTO contacts(email, link_precedence, created_at, updated_at)
             VALUES ('a@x.com', 'tertiary', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad_precedence.is_err());

        let no_identifiers = store.conn.execute(
            "INSERT INTO contacts(link_precedence, created_at, updated_at)
             VALUES ('primary', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(no_identifiers.is_err());

        let dangling = store.conn.execute(
            "INSERT INTO contacts(email, linked_id, link_precedence, created_at, updated_at)
             VALUES ('b@x.com', 404, 'secondary', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(dangling.is_err());
        Ok(())
    }

    #[test]
    fn identify_persists_self_linked_primary() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let resolution = identify(&mut store, Some("a@x.com"), Some("1111111111"))?;
        assert_eq!(resolution.outcome, ResolutionOutcome::CreatedPrimary);

        let contacts = store.list_contacts()?;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, resolution.view.primary_contact_id);
        assert_eq!(contacts[0].linked_id, Some(contacts[0].id));
        assert_eq!(contacts[0].link_precedence, LinkPrecedence::Primary);
        assert!(store.integrity_check()?.is_clean());
        Ok(())
    }

    #[test]
    fn identify_adds_one_secondary_then_stays_idempotent() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let primary = identify(&mut store, Some("p@x.com"), Some("2222222222"))?;

        let partial = identify(&mut store, Some("new@x.com"), Some("2222222222"))?;
        assert_eq!(partial.outcome, ResolutionOutcome::CreatedSecondary);
        assert_eq!(partial.view.primary_contact_id, primary.view.primary_contact_id);
        assert_eq!(partial.view.secondary_contact_ids.len(), 1);

        let repeat = identify(&mut store, Some("new@x.com"), Some("2222222222"))?;
        assert_eq!(repeat.outcome, ResolutionOutcome::MatchedExisting);
        assert_eq!(repeat.view, partial.view);
        assert_eq!(store.list_contacts()?.len(), 2);

        let secondary = store
            .get_contact(partial.view.secondary_contact_ids[0])?
            .ok_or_else(|| anyhow!("secondary contact should exist"))?;
        assert_eq!(secondary.linked_id, Some(primary.view.primary_contact_id));
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
        Ok(())
    }

    #[test]
    fn invalid_input_is_rejected_without_writing() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let result = store.identify(&IdentifyRequest::default(), &ResolverConfig::default());
        assert!(matches!(result, Err(IdentityError::InvalidInput(_))));
        assert!(store.list_contacts()?.is_empty());
        Ok(())
    }

    #[test]
    fn store_errors_surface_as_store_unavailable() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let result = store.identify(
            &IdentifyRequest::new(Some("a@x.com"), None),
            &ResolverConfig::default(),
        );
        assert!(matches!(result, Err(IdentityError::StoreUnavailable(_))));
        Ok(())
    }

    #[test]
    fn merge_policy_relinks_younger_group_in_one_transaction() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let old = identify(&mut store, Some("old@x.com"), Some("1000000001"))?;
        let young = identify(&mut store, Some("young@x.com"), Some("2000000002"))?;
        let young_secondary = identify(&mut store, Some("young2@x.com"), Some("2000000002"))?;

        let merged = store
            .identify(
                &IdentifyRequest::new(Some("old@x.com"), Some("2000000002")),
                &ResolverConfig { merge_policy: MergePolicy::Merge },
            )
            .map_err(|err| anyhow!("merge identify failed: {err}"))?;

        assert_eq!(merged.view.primary_contact_id, old.view.primary_contact_id);
        assert_eq!(merged.merged_primary_ids, vec![young.view.primary_contact_id]);
        let secondary_ids =
            merged.view.secondary_contact_ids.iter().copied().collect::<BTreeSet<_>>();
        assert!(secondary_ids.contains(&young.view.primary_contact_id));
        assert!(young_secondary
            .created_contact_id
            .is_some_and(|id| secondary_ids.contains(&id)));

        let primaries = store.list_contacts()?.into_iter().filter(Contact::is_primary).count();
        assert_eq!(primaries, 1);
        assert!(store.integrity_check()?.is_clean());
        Ok(())
    }

    #[test]
    fn view_identity_resolves_from_any_member() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let _ = identify(&mut store, Some("a@x.com"), Some("1111111111"))?;
        let second = identify(&mut store, Some("b@x.com"), Some("1111111111"))?;
        let secondary_id = second
            .created_contact_id
            .ok_or_else(|| anyhow!("second call should create a secondary"))?;

        let view = store
            .view_identity(secondary_id)
            .map_err(|err| anyhow!("view failed: {err}"))?
            .ok_or_else(|| anyhow!("identity should exist"))?;
        assert_eq!(view, second.view);
        assert_eq!(
            store.view_identity(ContactId(999)).map_err(|err| anyhow!("{err}"))?,
            None
        );
        Ok(())
    }

    #[test]
    fn integrity_check_reports_dangling_links() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let _ = identify(&mut store, Some("a@x.com"), None)?;
        store.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        store.conn.execute(
            "INSERT INTO contacts(email, linked_id, link_precedence, created_at, updated_at)
             VALUES ('orphan@x.com', 77, 'secondary',
                     '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )?;

        let report = store.integrity_check()?;
        assert!(!report.is_clean());
        assert_eq!(report.foreign_key_violations.len(), 1);
        assert_eq!(report.link_violations.len(), 1);
        assert_eq!(report.link_violations[0].kind, LinkViolationKind::DanglingLink);

        let result = store.identify(
            &IdentifyRequest::new(Some("orphan@x.com"), None),
            &ResolverConfig::default(),
        );
        assert!(matches!(result, Err(IdentityError::InconsistentLink { .. })));
        Ok(())
    }

    #[test]
    fn export_snapshot_writes_contacts_and_digest_manifest() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let _ = identify(&mut store, Some("a@x.com"), Some("1111111111"))?;
        let _ = identify(&mut store, Some("b@x.com"), Some("1111111111"))?;

        let out_dir = unique_temp_path("identitykernel-export", "d");
        let manifest = store.export_snapshot(&out_dir)?;
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 2);

        let bytes = fs::read(out_dir.join(CONTACTS_EXPORT_FILE))?;
        assert_eq!(format!("{:x}", Sha256::digest(&bytes)), manifest.files[0].sha256);
        let exported = read_contacts_ndjson(&out_dir.join(CONTACTS_EXPORT_FILE))?;
        assert_eq!(exported, store.list_contacts()?);

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    #[test]
    fn backup_database_copies_contacts() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let _ = identify(&mut store, Some("a@x.com"), Some("1111111111"))?;

        let backup_path = unique_temp_path("identitykernel-backup", "sqlite3");
        store.backup_database(&backup_path)?;

        let restored = SqliteStore::open(&backup_path)?;
        assert_eq!(restored.list_contacts()?, store.list_contacts()?);
        drop(restored);
        cleanup_sqlite_files(&backup_path)?;
        Ok(())
    }

    #[test]
    fn concurrent_identify_of_unseen_identifier_creates_one_primary() -> Result<()> {
        let db_path = unique_temp_path("identitykernel-concurrency", "sqlite3");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let mut handles = Vec::new();
        for _ in 0..workers {
            let worker_path = db_path.clone();
            let worker_barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || -> Result<ContactId> {
                let mut store = SqliteStore::open(&worker_path)?;
                worker_barrier.wait();
                let resolution = identify(&mut store, Some("race@x.com"), Some("3333333333"))?;
                Ok(resolution.view.primary_contact_id)
            }));
        }

        let mut primary_ids = BTreeSet::new();
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            primary_ids.insert(thread_result?);
        }

        let store = SqliteStore::open(&db_path)?;
        let contacts = store.list_contacts()?;
        assert_eq!(primary_ids.len(), 1);
        assert_eq!(contacts.len(), 1);
        assert!(store.integrity_check()?.is_clean());

        drop(store);
        cleanup_sqlite_files(&db_path)?;
        Ok(())
    }
}
