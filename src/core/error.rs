//! Error types for the tile streaming pipeline

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    /// Brick data source unreachable, missing or truncated
    #[error("Load I/O error for {brick}: {source}")]
    LoadIo {
        brick: String,
        #[source]
        source: std::io::Error,
    },

    /// Brick payload read but malformed
    #[error("Load decode error for {brick}: {reason}")]
    LoadDecode { brick: String, reason: String },

    /// Load superseded or no longer desired
    #[error("Load canceled")]
    Canceled,

    /// Invalid budget or configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Display device failed to accept a brick
    #[error("GPU upload error: {0}")]
    Upload(String),

    /// Worker runtime could not be started
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a load I/O error tagged with the brick it concerns
    pub fn load_io(brick: impl Into<String>, source: std::io::Error) -> Self {
        Self::LoadIo { brick: brick.into(), source }
    }

    /// Build a decode error tagged with the brick it concerns
    pub fn load_decode(brick: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadDecode { brick: brick.into(), reason: reason.into() }
    }

    /// Whether this error means the load was abandoned rather than failed
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
