//! Error types for the Strata engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for the Strata engine.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found errors
    #[error("Not found: {resource} at {path}")]
    NotFound { resource: String, path: PathBuf },

    /// Permission errors
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Syntax errors in the analyzed source file
    #[error("Syntax error in {path} at line {line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The parser or the admission controller ran out of memory
    #[error("Memory exhausted: {0}")]
    MemoryExhausted(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Broken cache payload or index
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// Failures in the scheduling layer itself
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure taxonomy used by the recovery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    FileNotFound,
    PermissionDenied,
    Syntax,
    MemoryExhaustion,
    Timeout,
    CacheCorruption,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "file-not-found",
            Self::PermissionDenied => "permission-denied",
            Self::Syntax => "syntax",
            Self::MemoryExhaustion => "memory-exhaustion",
            Self::Timeout => "timeout",
            Self::CacheCorruption => "cache-corruption",
            Self::Unknown => "unknown",
        }
    }

    fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::OutOfMemory => Self::MemoryExhaustion,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StrataError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            path: path.into(),
        }
    }

    /// Create a new syntax error
    pub fn syntax(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a new memory exhaustion error
    pub fn memory(msg: impl Into<String>) -> Self {
        Self::MemoryExhausted(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new cache corruption error
    pub fn cache_corruption(msg: impl Into<String>) -> Self {
        Self::CacheCorruption(msg.into())
    }

    /// Create a new scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error into the recovery taxonomy.
    ///
    /// Wrapped `anyhow` errors are searched along their cause chain for an
    /// IO error or a nested `StrataError`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) => ErrorKind::from_io(e),
            Self::NotFound { .. } => ErrorKind::FileNotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::MemoryExhausted(_) => ErrorKind::MemoryExhaustion,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::CacheCorruption(_) => ErrorKind::CacheCorruption,
            Self::Other(err) => {
                for cause in err.chain() {
                    if let Some(inner) = cause.downcast_ref::<StrataError>() {
                        return inner.kind();
                    }
                    if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                        return ErrorKind::from_io(io);
                    }
                }
                ErrorKind::Unknown
            }
            Self::Serialization(_) | Self::Config(_) | Self::Scheduler(_) | Self::Internal(_) => {
                ErrorKind::Unknown
            }
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::FileNotFound
    }
}
