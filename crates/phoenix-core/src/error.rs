//! Error types for Phoenix boundary operations

use thiserror::Error;

/// Result type for provider and storage operations
pub type Result<T> = std::result::Result<T, PhoenixError>;

/// Core error type raised by capability providers and domain records
#[derive(Error, Debug)]
pub enum PhoenixError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhoenixError {
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }
}
