use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source file not found: {path}")]
    SourceNotFound { path: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Conflict at {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("Checksum mismatch for {path}: {field} expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation {operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::SourceNotFound { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Other(format!("Blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
