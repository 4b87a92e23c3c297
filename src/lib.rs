pub mod config;
pub mod database;
pub mod error;
pub mod image_processing;
pub mod parser;
pub mod scanner;
pub mod sync;

use config::{ConfigProvider, ConfigStore};
use database::{Database, ImageAttributeRecord, WordCount};
use error::CatalogError;
use std::path::Path;
use sync::{SyncHandle, SyncOptions, SyncOrchestrator, SyncProgress, SyncReport};

/// Application context: the store, the orchestrator and the settings they
/// were built from, constructed once at startup and passed to callers.
pub struct Catalog {
    db: Database,
    orchestrator: SyncOrchestrator,
    config: ConfigStore,
}

impl Catalog {
    /// Opens the configured store and prepares the sync worker pool.
    pub fn open(config: ConfigStore) -> Result<Self, CatalogError> {
        let settings = config.config();
        let db_path = settings.resolved_database_path();
        let db = Database::open(&db_path, settings.sync.connect_attempts)?;
        log::info!("Catalog store: {}", db_path.display());

        let orchestrator = SyncOrchestrator::new(db.clone(), SyncOptions::from(settings))?;
        Ok(Self {
            db,
            orchestrator,
            config,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn sync_handle(&self) -> SyncHandle {
        self.orchestrator.handle()
    }

    pub fn sync_directory(&self, root: &Path) -> Result<SyncReport, CatalogError> {
        self.orchestrator.sync_directory(root)
    }

    pub fn sync_directory_with_progress(
        &self,
        root: &Path,
        progress: &dyn Fn(&SyncProgress),
    ) -> Result<SyncReport, CatalogError> {
        self.orchestrator.sync_directory_with_progress(root, progress)
    }

    /// Re-syncs the last opened root, if one is recorded.
    pub fn resume_last_directory(&self) -> Option<Result<SyncReport, CatalogError>> {
        let directory = self.config.get_directory()?;
        log::info!("Resuming last directory {}", directory.display());
        Some(self.sync_directory(&directory))
    }

    pub fn remember_directory(&mut self, root: &Path) -> Result<(), CatalogError> {
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        self.config.set_directory(&root)?;
        Ok(())
    }

    pub fn list_attributes(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ImageAttributeRecord>, CatalogError> {
        Ok(self.db.list_attributes(filter)?)
    }

    /// Word list of the listed prompts, split on the configured delimiter.
    /// `root` limits it to records at or below that directory.
    pub fn prompt_word_counts(
        &self,
        root: Option<&Path>,
        filter: Option<&str>,
    ) -> Result<Vec<WordCount>, CatalogError> {
        let root = root.map(|root| {
            std::path::absolute(root)
                .unwrap_or_else(|_| root.to_path_buf())
                .to_string_lossy()
                .to_string()
        });
        Ok(self
            .db
            .prompt_word_counts(root.as_deref(), filter, self.config.delimiter())?)
    }

    /// Splits user-typed tags on the configured delimiter.
    pub fn split_tag_input(&self, raw: &str) -> Vec<String> {
        let delimiter = self.config.delimiter();
        if delimiter.is_empty() {
            return vec![raw.to_string()];
        }
        raw.split(delimiter).map(str::to_string).collect()
    }
}
