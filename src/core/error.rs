//! Error type system for Tsukiyo
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the kinds a caller has to tell apart: "try again later" conditions
//! (rate limiting, connectivity, deadlines), broken extensions, and ordinary
//! local failures.

/// Main error type for the Tsukiyo runtime
#[derive(Debug, thiserror::Error)]
pub enum TsukiyoError {
    // Source-level conditions
    #[error("Source '{source_id}' is rate limited, retry in {retry_after_ms} ms")]
    RateLimited { source_id: String, retry_after_ms: u64 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("No network connection available")]
    NotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    // Extension-related errors
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Extension evaluation failed: {0}")]
    ExtensionEvaluationFailed(String),

    #[error("Invalid extension format: {0}")]
    InvalidExtensionFormat(String),

    #[error("Integrity check failed: {0}")]
    IntegrityMismatch(String),

    #[error("Extension call failed: {0}")]
    ExtensionCallFailed(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // System-level errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Task error: {0}")]
    TaskError(String),
}

impl TsukiyoError {
    /// Get the stable error type name
    pub fn error_type(&self) -> &'static str {
        match self {
            TsukiyoError::RateLimited { .. } => "RateLimited",
            TsukiyoError::NetworkError(_) => "NetworkError",
            TsukiyoError::NotConnected => "NotConnected",
            TsukiyoError::Timeout(_) => "Timeout",
            TsukiyoError::DownloadFailed(_) => "DownloadFailed",
            TsukiyoError::ExtensionEvaluationFailed(_) => "ExtensionEvaluationFailed",
            TsukiyoError::InvalidExtensionFormat(_) => "InvalidExtensionFormat",
            TsukiyoError::IntegrityMismatch(_) => "IntegrityMismatch",
            TsukiyoError::ExtensionCallFailed(_) => "ExtensionCallFailed",
            TsukiyoError::SourceNotFound(_) => "SourceNotFound",
            TsukiyoError::PermissionDenied(_) => "PermissionDenied",
            TsukiyoError::ConfigError(_) => "ConfigError",
            TsukiyoError::DatabaseError(_) => "DatabaseError",
            TsukiyoError::IoError(_) => "IoError",
            TsukiyoError::SerializationError(_) => "SerializationError",
            TsukiyoError::ValidationError(_) => "ValidationError",
            TsukiyoError::TaskError(_) => "TaskError",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TsukiyoError::DatabaseError(_)
                | TsukiyoError::NetworkError(_)
                | TsukiyoError::Timeout(_)
                | TsukiyoError::RateLimited { .. }
                | TsukiyoError::NotConnected
        )
    }

    /// Conditions a user should be told to "try again later"
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TsukiyoError::RateLimited { .. } | TsukiyoError::NotConnected | TsukiyoError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for TsukiyoError {
    fn from(err: serde_json::Error) -> Self {
        TsukiyoError::SerializationError(err.to_string())
    }
}

impl From<r2d2::Error> for TsukiyoError {
    fn from(err: r2d2::Error) -> Self {
        TsukiyoError::TaskError(format!("Connection pool error: {}", err))
    }
}

impl From<tokio::task::JoinError> for TsukiyoError {
    fn from(err: tokio::task::JoinError) -> Self {
        TsukiyoError::TaskError(err.to_string())
    }
}

/// Result type alias for operations that can fail with TsukiyoError
pub type Result<T> = std::result::Result<T, TsukiyoError>;
