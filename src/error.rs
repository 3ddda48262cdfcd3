// Error handling module
// Defines the error taxonomy surfaced to callers of the request pipeline

use std::fmt;

use thiserror::Error;

/// Category of a transport-level failure (no HTTP response was obtained)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request did not complete within its timeout
    Timeout,

    /// The remote host could not be reached
    Connection,

    /// TLS certificate validation failed
    Certificate,

    /// Any other network failure
    Network,
}

impl TransportErrorKind {
    /// Short machine-readable label, used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connection => "connection_failed",
            TransportErrorKind::Certificate => "certificate",
            TransportErrorKind::Network => "network",
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "Request timed out, please try again",
            TransportErrorKind::Connection => "Network unavailable, please check your connection",
            TransportErrorKind::Certificate => {
                "SSL certificate verification failed, please check your network settings"
            }
            TransportErrorKind::Network => "Network error, please check your connection",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the request pipeline
///
/// Authentication failures never appear here directly: they are resolved
/// by a token refresh, and only an unrecoverable session surfaces as
/// [`ApiError::AuthExpired`].
#[derive(Error, Debug)]
pub enum ApiError {
    /// No response was obtained from the server
    #[error("Network error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Non-2xx response other than 401/403
    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// HTTP 403
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Envelope code other than success or unauthorized
    #[error("Business error {code}: {message}")]
    Business { code: i64, message: String },

    /// Token refresh failed or was exhausted; the user must log in again
    #[error("Session expired: {0}")]
    AuthExpired(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Whether the session is gone and an interactive login is required
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ApiError::AuthExpired(_))
    }

    /// Message suitable for a toast or dialog
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Transport { kind, .. } => kind.user_message().to_string(),
            ApiError::HttpStatus { message, .. } => message.clone(),
            ApiError::Permission(message) => message.clone(),
            ApiError::Business { message, .. } => message.clone(),
            ApiError::AuthExpired(_) => "Your session has expired, please log in again".to_string(),
            ApiError::Decode(_) => "Unexpected response from server".to_string(),
            ApiError::Internal(_) => "Internal error".to_string(),
        }
    }
}

/// Message shown for an HTTP status code
pub fn status_message(status: u16) -> String {
    let known = match status {
        400 => "Invalid request parameters",
        401 => "Authentication failed",
        403 => "You do not have permission to access this resource",
        404 => "The requested resource does not exist",
        405 => "Request method not allowed",
        408 => "Request timed out",
        429 => "Too many requests, please try again later",
        500 => "Internal server error",
        502 => "Bad gateway",
        503 => "Service temporarily unavailable",
        504 => "Gateway timeout",
        _ => return format!("HTTP error {}", status),
    };
    known.to_string()
}

/// Message shown for a known business error code
pub fn business_message(code: i64) -> Option<&'static str> {
    match code {
        10001 => Some("User does not exist"),
        10002 => Some("Incorrect password"),
        10003 => Some("This account has been disabled"),
        20001 => Some("Diary entry does not exist"),
        20002 => Some("You do not have permission to modify this diary entry"),
        30001 => Some("Ledger does not exist"),
        30002 => Some("Insufficient balance"),
        _ => None,
    }
}
