//! Shelly Gen2 Wire Protocol
//!
//! Single responsibility: the JSON envelope shared by every component call.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {
//!     "id": <u64>,                    // Correlation id, stamped by the transport
//!     "method": "<Component>.<Verb>",
//!     "params": { ... },              // Omitted when absent
//!     "auth": { ... }                 // Omitted until a credential is cached
//! }
//! ```
//!
//! ## Response
//! ```text
//! {
//!     "id": <u64>,                    // Matches the request id
//!     "src": "<device id>",
//!     "error": { "code": <int>, "message": "<string>" },   // Only on failure
//!     ...                             // Component-specific fields, untouched here
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthCredential;
use crate::error::Result;

/// Error code the device uses to issue an authentication challenge.
pub const AUTH_CHALLENGE_CODE: i64 = 401;

/// A generic RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthCredential>,
}

impl Request {
    /// Create a request for `method` with no params.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: None,
            auth: None,
        }
    }

    /// Attach params, serialized from any serde type.
    pub fn with_params<P: Serialize>(mut self, params: P) -> Result<Self> {
        self.params = Some(serde_json::to_value(params)?);
        Ok(self)
    }

    /// Serialize to the text frame written on the socket.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generic response envelope.
///
/// Only the fields the transport needs for routing and error detection.
/// Callers decode the raw bytes into their own result types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Error object carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl ErrorBody {
    pub fn is_auth_challenge(&self) -> bool {
        self.code == AUTH_CHALLENGE_CODE
    }
}
