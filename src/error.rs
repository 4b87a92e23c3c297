//! Error taxonomy for the catalog core.
//!
//! "No metadata" and "malformed payload" are not errors here: the extractor
//! reports them as `Ok(None)` and the parser as empty attributes. Only
//! conditions the caller has to act on get a variant.

use std::path::PathBuf;
use thiserror::Error;

/// Failure reading an image file while looking for embedded metadata.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("image file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn from_io(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Failure producing a thumbnail blob.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("thumbnail source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode thumbnail for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Failure talking to the attribute store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot reach store at {path} after {attempts} attempts: {reason}")]
    Unavailable {
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("store connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("store query failed: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    /// Connectivity failures abort a whole sync; query failures only fail
    /// the file being written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Pool(_))
    }
}

/// Failure loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single file could not be brought up to date.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Thumbnail(#[from] ThumbnailError),
}

/// Crate-level error surfaced to the presentation layer.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid directory: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}
