use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Business code for a successful call
pub const CODE_SUCCESS: i64 = 200;

/// Business code signalling an invalid or expired token
pub const CODE_UNAUTHORIZED: i64 = 401;

/// Business code for an account disabled by the server
pub const CODE_ACCOUNT_DISABLED: i64 = 10003;

/// Response wrapper used by every backend endpoint:
/// `{ "code": 200, "message": "success", "data": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// How the dispatcher should treat an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStatus {
    Success,
    Unauthorized,
    Failure(i64),
}

impl<T> Envelope<T> {
    pub fn status(&self) -> EnvelopeStatus {
        match self.code {
            CODE_SUCCESS => EnvelopeStatus::Success,
            CODE_UNAUTHORIZED => EnvelopeStatus::Unauthorized,
            code => EnvelopeStatus::Failure(code),
        }
    }
}

impl Envelope<Value> {
    /// Successful envelope carrying `data`
    pub fn ok(data: Value) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: Some("success".to_string()),
            data: Some(data),
        }
    }

    /// Failed envelope with a code and message
    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: None,
        }
    }
}
