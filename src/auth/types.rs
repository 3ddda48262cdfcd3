// Authentication types

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One authentication session as persisted in the credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds
    pub expires_at_ms: i64,
    /// Authorization scheme, e.g. `Bearer`
    pub token_type: String,
}

impl CredentialRecord {
    /// Record issued at `now_ms` that lives for `ttl_secs`
    pub fn issue(
        access_token: &str,
        refresh_token: &str,
        ttl_secs: u64,
        now_ms: i64,
        token_type: &str,
    ) -> Self {
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        Self {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            token_type: token_type.to_string(),
        }
    }
}

/// Point in the credential state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Absent,
    Valid,
    NearExpiry,
    Refreshing,
}

/// Snapshot of the stored credential's validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    pub present: bool,
    pub expired: bool,
    pub near_expiry: bool,
    /// Milliseconds until expiry, clamped at zero
    pub remaining_ms: i64,
    pub expires_at_ms: Option<i64>,
}

impl TokenStatus {
    /// Status when no credential is stored
    pub fn absent() -> Self {
        Self {
            present: false,
            expired: true,
            near_expiry: true,
            remaining_ms: 0,
            expires_at_ms: None,
        }
    }

    /// Status of a credential expiring at `expires_at_ms`, observed at `now_ms`
    pub fn compute(expires_at_ms: i64, now_ms: i64, lead_ms: i64) -> Self {
        let remaining_ms = expires_at_ms.saturating_sub(now_ms).max(0);
        Self {
            present: true,
            expired: remaining_ms <= 0,
            near_expiry: remaining_ms <= lead_ms,
            remaining_ms,
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// Present and not yet expired
    pub fn is_valid(&self) -> bool {
        self.present && !self.expired
    }

    /// Remaining lifetime rounded to whole minutes
    pub fn remaining_minutes(&self) -> i64 {
        (self.remaining_ms + 30_000) / 60_000
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if !self.present {
            Lifecycle::Absent
        } else if self.near_expiry {
            Lifecycle::NearExpiry
        } else {
            Lifecycle::Valid
        }
    }

    /// Expiry rendered as RFC 3339, for logs and the CLI
    pub fn expires_at_rfc3339(&self) -> Option<String> {
        self.expires_at_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|dt| dt.to_rfc3339())
    }
}

/// Result of the external re-authentication procedure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReauthOutcome {
    pub success: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub ttl_secs: Option<u64>,
}

impl ReauthOutcome {
    pub fn success(access_token: impl Into<String>, refresh_token: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            success: true,
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
            ttl_secs: Some(ttl_secs),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

/// Performs a silent login and returns fresh credentials
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn reauthenticate(&self) -> Result<ReauthOutcome>;
}

/// Invoked by the token manager when the access token nears expiry.
/// Returns whether new credentials were obtained.
#[async_trait]
pub trait RefreshHook: Send + Sync {
    async fn refresh(&self) -> Result<bool>;
}

/// Invoked once refresh retries are exhausted
pub trait ExpiredHook: Send + Sync {
    fn on_expired(&self);
}

/// Callbacks registered through `TokenManager::init`
#[derive(Clone, Default)]
pub struct TokenCallbacks {
    pub on_refresh: Option<Arc<dyn RefreshHook>>,
    pub on_expired: Option<Arc<dyn ExpiredHook>>,
}
