// Silent re-authentication
// Exchanges a login code for a fresh session token

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

use super::manager::token_prefix;
use super::types::{ReauthOutcome, Reauthenticator};
use crate::models::{Envelope, EnvelopeStatus, LoginData, LoginRequest};
use crate::transport::{Transport, TransportRequest};

/// Posts `{code}` to the login endpoint and reads `data.token`.
///
/// The backend issues a single token, so it doubles as the refresh token.
pub struct CodeLogin {
    transport: Arc<dyn Transport>,
    login_url: String,
    code: Option<String>,
    ttl_secs: u64,
    timeout: Duration,
}

impl CodeLogin {
    pub fn new(
        transport: Arc<dyn Transport>,
        login_url: impl Into<String>,
        code: Option<String>,
        ttl_secs: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            login_url: login_url.into(),
            code,
            ttl_secs,
            timeout,
        }
    }

    /// Run the login exchange with an explicit code
    pub async fn login(&self, code: &str) -> Result<(ReauthOutcome, Option<LoginData>)> {
        tracing::info!("Logging in via {}", self.login_url);

        let body = serde_json::to_value(LoginRequest {
            code: code.to_string(),
        })
        .context("Failed to encode login request")?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let request = TransportRequest {
            method: Method::POST,
            url: self.login_url.clone(),
            headers,
            body: Some(body),
            timeout: self.timeout,
        };

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send login request")?;

        if !(200..300).contains(&response.status) {
            let text = String::from_utf8_lossy(&response.body);
            anyhow::bail!("Login failed: HTTP {} - {}", response.status, text);
        }

        let envelope: Envelope<LoginData> =
            serde_json::from_slice(&response.body).context("Failed to parse login response")?;

        match envelope.status() {
            EnvelopeStatus::Success => {}
            _ => {
                tracing::warn!(
                    code = envelope.code,
                    message = envelope.message.as_deref().unwrap_or(""),
                    "Login rejected"
                );
                return Ok((ReauthOutcome::failed(), None));
            }
        }

        let data = envelope
            .data
            .context("Login response does not contain data")?;
        if data.token.is_empty() {
            anyhow::bail!("Login response does not contain a token");
        }

        tracing::info!(token = %token_prefix(&data.token), "Login succeeded");

        let outcome = ReauthOutcome::success(data.token.clone(), data.token.clone(), self.ttl_secs);
        Ok((outcome, Some(data)))
    }
}

#[async_trait]
impl Reauthenticator for CodeLogin {
    async fn reauthenticate(&self) -> Result<ReauthOutcome> {
        let code = self
            .code
            .as_deref()
            .context("No login code configured for silent re-authentication")?;
        let (outcome, _) = self.login(code).await?;
        Ok(outcome)
    }
}
