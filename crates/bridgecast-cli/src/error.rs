//! Error handling for the bridgecast CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Bridgecast error: {0}")]
    Broadcast(#[from] bridgecast_core::BroadcastError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration loading failed: {0}")]
    Figment(#[from] figment::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
