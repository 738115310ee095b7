//! Error types for shelly-rpc
//!
//! One enum covers every fault a caller can observe. Transport faults never
//! reach `send` callers directly; they drive the reconnect loop and surface
//! as timeouts on in-flight calls.

use crate::protocol::ErrorBody;

/// Classification of device-side error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    FailedPrecondition,
    Unavailable,
    NotImplemented,
    Unauthenticated,
    Other,
}

impl ErrorKind {
    /// Map a wire error code to its kind.
    pub fn from_code(code: i64) -> Self {
        match code {
            -103 => Self::InvalidArgument,
            -104 => Self::DeadlineExceeded,
            -105 => Self::NotFound,
            -108 => Self::ResourceExhausted,
            -109 => Self::FailedPrecondition,
            -114 => Self::Unavailable,
            404 => Self::NotImplemented,
            401 => Self::Unauthenticated,
            _ => Self::Other,
        }
    }
}

/// Main error type for RPC operations
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} is required to answer the authentication challenge")]
    CredentialsRequired(&'static str),

    #[error("Malformed authentication challenge: {0}")]
    Challenge(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Device error {code}: {message}")]
    Device { code: i64, message: String },

    #[error("Timeout waiting for response to {method} after {attempts} attempt(s)")]
    Timeout { method: String, attempts: u32 },

    #[error("Connection closed")]
    Closed,

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Response to {0} is missing a result")]
    MissingResult(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Kind of a device error, if this is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Device { code, .. } => Some(ErrorKind::from_code(*code)),
            Self::AuthRejected(_) => Some(ErrorKind::Unauthenticated),
            _ => None,
        }
    }

    /// True for shutdown faults: the handle or client is closed, or the caller gave up.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<ErrorBody> for RpcError {
    fn from(body: ErrorBody) -> Self {
        Self::Device {
            code: body.code,
            message: body.message,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
