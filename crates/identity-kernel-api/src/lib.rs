use std::path::{Path, PathBuf};

use identity_kernel_core::{
    Contact, ContactId, IdentifyRequest, IdentityError, IdentityView, Resolution, ResolverConfig,
};
use identity_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub mod validate;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("contact {0} not found")]
    NotFound(ContactId),
    #[error(transparent)]
    Resolution(IdentityError),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidInput(message) => Self::InvalidInput(message),
            other => Self::Resolution(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct IdentityKernelApi {
    db_path: PathBuf,
    config: ResolverConfig,
}

impl IdentityKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, ResolverConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: ResolverConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        Ok(SqliteStore::open(&self.db_path)?)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Validate the request, then resolve it against the configured database.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidInput`] or [`ApiError::Validation`] for bad
    /// input, [`ApiError::Storage`] when the database cannot be opened or
    /// migrated, and [`ApiError::Resolution`] when resolution fails.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<Resolution, ApiError> {
        let request = validate::identify_request(request)?;
        let mut store = self.open_migrated_store()?;
        let resolution = store.identify(&request, &self.config)?;
        tracing::debug!(
            outcome = resolution.outcome.as_str(),
            primary_contact_id = %resolution.view.primary_contact_id,
            "identify resolved"
        );
        Ok(resolution)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ApiError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when no contact has `id`.
    pub fn contact_show(&self, id: ContactId) -> Result<Contact, ApiError> {
        let store = self.open_migrated_store()?;
        store.get_contact(id)?.ok_or(ApiError::NotFound(id))
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or read.
    pub fn contact_list(&self) -> Result<Vec<Contact>, ApiError> {
        let store = self.open_migrated_store()?;
        Ok(store.list_contacts()?)
    }

    /// Consolidated view of the identity that `contact_id` belongs to.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when no contact has `contact_id`.
    pub fn identity_show(&self, contact_id: ContactId) -> Result<IdentityView, ApiError> {
        let store = self.open_migrated_store()?;
        store.view_identity(contact_id)?.ok_or(ApiError::NotFound(contact_id))
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport, ApiError> {
        let store = self.open_store()?;
        Ok(store.integrity_check()?)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<(), ApiError> {
        let store = self.open_migrated_store()?;
        Ok(store.backup_database(out_file)?)
    }

    /// # Errors
    /// Returns an error when export files cannot be written.
    pub fn export(
        &self,
        out_dir: &Path,
    ) -> Result<identity_kernel_store_sqlite::ExportManifest, ApiError> {
        let store = self.open_migrated_store()?;
        Ok(store.export_snapshot(out_dir)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_kernel_core::{MergePolicy, ResolutionOutcome, MISSING_IDENTIFIERS_MESSAGE};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("identitykernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    #[test]
    fn api_identify_then_show_contact_and_identity() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let first =
            api.identify(&IdentifyRequest::new(Some("doc@hillvalley.edu"), Some("1234567890")))?;
        assert_eq!(first.outcome, ResolutionOutcome::CreatedPrimary);

        let second =
            api.identify(&IdentifyRequest::new(Some("emmett@hillvalley.edu"), Some("1234567890")))?;
        assert_eq!(second.outcome, ResolutionOutcome::CreatedSecondary);
        assert_eq!(
            second.view.emails,
            vec!["doc@hillvalley.edu".to_string(), "emmett@hillvalley.edu".to_string()]
        );

        let primary = api.contact_show(first.view.primary_contact_id)?;
        assert!(primary.is_primary());

        let Some(secondary_id) = second.created_contact_id else {
            panic!("second identify should create a secondary");
        };
        assert_eq!(api.identity_show(secondary_id)?, second.view);
        assert_eq!(api.contact_list()?.len(), 2);
        assert!(api.integrity_check()?.is_clean());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_rejects_missing_and_malformed_identifiers_before_touching_storage() {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let missing = api.identify(&IdentifyRequest::default());
        assert!(matches!(
            missing,
            Err(ApiError::InvalidInput(message)) if message == MISSING_IDENTIFIERS_MESSAGE
        ));

        let malformed = api.identify(&IdentifyRequest::new(None, Some("12345")));
        assert!(matches!(malformed, Err(ApiError::Validation { field: "phoneNumber", .. })));
        assert!(!db_path.exists());
    }

    #[test]
    fn api_reports_missing_contacts_as_not_found() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        assert!(matches!(api.contact_show(ContactId(42)), Err(ApiError::NotFound(ContactId(42)))));
        assert!(matches!(api.identity_show(ContactId(42)), Err(ApiError::NotFound(_))));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_then_apply() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_merge_config_joins_groups() -> Result<(), ApiError> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::with_config(
            db_path.clone(),
            ResolverConfig { merge_policy: MergePolicy::Merge },
        );

        let george = api
            .identify(&IdentifyRequest::new(Some("george@hillvalley.edu"), Some("9191919191")))?;
        let biff = api
            .identify(&IdentifyRequest::new(Some("biffsucks@hillvalley.edu"), Some("7171717171")))?;
        let merged = api
            .identify(&IdentifyRequest::new(Some("george@hillvalley.edu"), Some("7171717171")))?;

        assert_eq!(merged.view.primary_contact_id, george.view.primary_contact_id);
        assert_eq!(merged.merged_primary_ids, vec![biff.view.primary_contact_id]);
        assert!(merged.view.secondary_contact_ids.contains(&biff.view.primary_contact_id));
        assert!(api.integrity_check()?.is_clean());

        cleanup(&db_path);
        Ok(())
    }
}
