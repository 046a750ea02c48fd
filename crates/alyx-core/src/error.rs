//! Error types for alyx-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type for alyx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for alyx-core
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config not found. Searched: {searched:?}")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid manifest at {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Webhook endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Function {function} timed out after {timeout_secs}s")]
    Timeout { function: String, timeout_secs: u64 },

    #[error("Function {function} exited with code {code:?}: {stderr}")]
    FunctionExit {
        function: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Runtime error for {function}: {message}")]
    Runtime { function: String, message: String },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Token expired")]
    ExpiredToken,

    #[error("Upload {upload_id}: offset mismatch (expected {expected}, got {got})")]
    OffsetMismatch {
        upload_id: String,
        expected: i64,
        got: i64,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors whose HTTP encoding is 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::FunctionNotFound(_)
                | Error::FileNotFound(_)
                | Error::UploadNotFound(_)
                | Error::EndpointNotFound(_)
        )
    }
}
