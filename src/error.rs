use thiserror::Error;

/// Engine error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("No accelerometer available")]
    SensorUnavailable,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// A 2xx answer whose body could not be read. The server accepted the
    /// request, so it is never sent again.
    #[error("Unreadable response ({status}): {message}")]
    InvalidResponse { status: u16, message: String },

    #[error("Call could not be initiated: {0}")]
    CallInitiation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Monitoring already running")]
    AlreadyRunning,

    #[error("Monitoring not running")]
    NotRunning,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Client errors (auth, validation) are final; transport and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Api { status, .. } => !(400..500).contains(status),
            EngineError::Network(_) | EngineError::Timeout(_) => true,
            _ => false,
        }
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        EngineError::Internal(format!("Failed to acquire {} lock", what))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            EngineError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("JSON: {}", err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}
