//! Persistent user settings: JSON file plus `GENCAT_*` environment overrides.

use crate::database::DEFAULT_CONNECT_ATTEMPTS;
use crate::error::ConfigError;
use crate::image_processing::{ThumbnailBounds, THUMB_JPEG_QUALITY_DEFAULT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "gen-image-catalog";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "catalog.db";
const DEFAULT_DELIMITER: &str = ",";
const DEFAULT_CHUNK_SIZE: usize = 64;

pub const ENV_DB_PATH: &str = "GENCAT_DB_PATH";
pub const ENV_THUMB_JPEG_QUALITY: &str = "GENCAT_THUMB_JPEG_QUALITY";
pub const ENV_WORKER_THREADS: &str = "GENCAT_WORKER_THREADS";

/// Source of the last-opened root, used to resume a sync on startup.
pub trait ConfigProvider {
    fn get_directory(&self) -> Option<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailSettings {
    pub jpeg_quality: u8,
    /// Explicit bounding box. `None` means half the native resolution.
    pub max_size: Option<ThumbnailBounds>,
}

impl Default for ThumbnailSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: THUMB_JPEG_QUALITY_DEFAULT,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// `None` sizes the pool from available parallelism.
    pub worker_threads: Option<usize>,
    pub chunk_size: usize,
    pub connect_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            worker_threads: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
        }
    }
}

impl SyncSettings {
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub delimiter: String,
    pub last_directory: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub thumbnail: ThumbnailSettings,
    pub sync: SyncSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            last_directory: None,
            database_path: None,
            thumbnail: ThumbnailSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl AppConfig {
    /// Applies `GENCAT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DB_PATH) {
            if !raw.trim().is_empty() {
                self.database_path = Some(PathBuf::from(raw.trim()));
            }
        }
        if let Some(raw) = lookup(ENV_THUMB_JPEG_QUALITY) {
            if let Ok(parsed) = raw.trim().parse::<u8>() {
                self.thumbnail.jpeg_quality = parsed.clamp(40, 95);
            }
        }
        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            if let Ok(parsed) = raw.trim().parse::<usize>() {
                self.sync.worker_threads = Some(parsed.clamp(1, 32));
            }
        }
    }

    /// Configured store location, or the platform data directory default.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| app_dir(dirs::data_dir()).join(DATABASE_FILE))
    }
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Default location of the config file under the platform config directory.
pub fn default_config_path() -> PathBuf {
    app_dir(dirs::config_dir()).join(CONFIG_FILE)
}

/// Reads the config file. Missing or unreadable files yield defaults.
pub fn load_config(path: &Path) -> AppConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("cannot read config {}: {}", path.display(), err);
            }
            return AppConfig::default();
        }
    };

    serde_json::from_str::<AppConfig>(&content).unwrap_or_else(|err| {
        log::warn!("ignoring malformed config {}: {}", path.display(), err);
        AppConfig::default()
    })
}

pub fn persist_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let payload = serde_json::to_string_pretty(config)?;
    std::fs::write(path, payload).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Config bound to its file; every setter persists immediately.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    /// Loads `path` and layers environment overrides on top. Overrides are
    /// not written back on save.
    pub fn load(path: &Path) -> Self {
        let mut config = load_config(path);
        config.apply_env_overrides();
        Self {
            path: path.to_path_buf(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Points this session at another store without touching the file.
    pub fn override_database_path(&mut self, path: PathBuf) {
        self.config.database_path = Some(path);
    }

    pub fn delimiter(&self) -> &str {
        &self.config.delimiter
    }

    pub fn set_directory(&mut self, directory: &Path) -> Result<(), ConfigError> {
        let mut on_disk = load_config(&self.path);
        on_disk.last_directory = Some(directory.to_path_buf());
        persist_config(&self.path, &on_disk)?;
        self.config.last_directory = Some(directory.to_path_buf());
        Ok(())
    }
}

impl ConfigProvider for ConfigStore {
    fn get_directory(&self) -> Option<PathBuf> {
        self.config.last_directory.clone()
    }
}
