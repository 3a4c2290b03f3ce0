//! # Error Types
//!
//! Custom error types for the capture agent using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the capture agent
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Bus transport open/read failure (not a receive timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bus source ended (e.g. the capture process exited)
    #[error("Transport closed by the data source")]
    TransportClosed,

    /// A bus record could not be parsed or violates frame limits
    #[error("Frame error: {0}")]
    Frame(String),

    /// Rotation, finalize or rename failure; durability cannot be guaranteed
    #[error("Filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote store rejected our credentials
    #[error("Upload rejected credentials: {0}")]
    UploadAuth(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Wrap an I/O error with the path it happened on
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should stop the ingestion loop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Frame(_))
    }
}

/// Result type alias for the capture agent
pub type Result<T> = std::result::Result<T, CaptureError>;
