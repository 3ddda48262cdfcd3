// Authenticated request pipeline
// Wires the token manager and the dispatcher together with an explicit lifetime

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::auth::{
    Clock, CodeLogin, KeyValueStore, Reauthenticator, Scheduler, SqliteStore, SystemClock, TokenManager,
    TokenSettings, TokenStatus, TokioScheduler,
};
use crate::config::Config;
use crate::http_client::{ApiClient, ClientHooks, ClientSettings};
use crate::models::{LoginData, LoginRequest, RequestSpec};
use crate::transport::{ReqwestTransport, Transport};

/// Collaborators the pipeline is built from
pub struct PipelineDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub reauth: Arc<dyn Reauthenticator>,
    pub hooks: ClientHooks,
}

/// Token manager plus dispatcher, started and shut down together
pub struct AuthPipeline {
    tokens: Arc<TokenManager>,
    client: Arc<ApiClient>,
}

impl AuthPipeline {
    /// Build the pipeline and act on any credentials already stored
    pub fn start(deps: PipelineDeps, client_settings: ClientSettings, token_settings: TokenSettings) -> Self {
        let tokens = TokenManager::new(deps.store, deps.clock, deps.scheduler, token_settings);
        let client = ApiClient::new(client_settings, tokens.clone(), deps.transport, deps.reauth, deps.hooks);

        tokens.init(client.token_callbacks());
        tracing::info!(base_url = %client.settings().base_url, "Request pipeline started");

        Self { tokens, client }
    }

    /// Production pipeline: SQLite credentials, reqwest transport, tokio timers
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(&config.db_file).context("Failed to open credential store")?;
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.http_timeout())?);
        let reauth = CodeLogin::new(
            transport.clone(),
            config.login_url(),
            config.login_code.clone(),
            config.token_ttl_secs,
            config.http_timeout(),
        );

        let deps = PipelineDeps {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            transport,
            reauth: Arc::new(reauth),
            hooks: ClientHooks::default(),
        };

        Ok(Self::start(deps, config.client_settings(), config.token_settings()))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    /// Exchange a login code for a session and store it
    pub async fn login(&self, code: &str) -> Result<(LoginData, TokenStatus)> {
        let settings = self.client.settings();
        let body = serde_json::to_value(LoginRequest {
            code: code.to_string(),
        })
        .context("Failed to encode login request")?;
        let spec = RequestSpec::post(settings.login_path.clone(), body).skip_auth();

        let data: LoginData = self.client.request(spec).await.context("Login failed")?;
        if data.token.is_empty() {
            anyhow::bail!("Login response does not contain a token");
        }

        // A single token serves as both access and refresh secret
        let status = self
            .tokens
            .start_session(&data.token, &data.token, settings.default_ttl_secs)?;
        Ok((data, status))
    }

    /// Drop the stored session
    pub fn logout(&self) -> Result<()> {
        self.tokens.clear_credentials()?;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Stop the refresh timer and release the token hooks
    pub fn shutdown(&self) {
        self.tokens.shutdown();
        tracing::info!("Request pipeline stopped");
    }
}

impl Drop for AuthPipeline {
    fn drop(&mut self) {
        self.tokens.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ManualClock, ManualScheduler, MemoryStore, ReauthOutcome};
    use crate::transport::{TransportError, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use serde_json::json;

    struct LoginBackend;

    #[async_trait]
    impl Transport for LoginBackend {
        async fn send(&self, request: TransportRequest) -> std::result::Result<TransportResponse, TransportError> {
            if request.url.ends_with("/auth/wx-login") {
                let code = request.body.as_ref().and_then(|b| b["code"].as_str()).unwrap_or("");
                if code == "good" {
                    return Ok(TransportResponse::json(
                        200,
                        &json!({"code": 200, "data": {"token": "session-1", "user": {"id": 7}}}),
                    ));
                }
                return Ok(TransportResponse::json(200, &json!({"code": 10001, "message": "bad code"})));
            }
            Ok(TransportResponse::json(200, &json!({"code": 200, "data": "pong"})))
        }
    }

    struct NoReauth;

    #[async_trait]
    impl Reauthenticator for NoReauth {
        async fn reauthenticate(&self) -> Result<ReauthOutcome> {
            Ok(ReauthOutcome::failed())
        }
    }

    fn pipeline(store: Arc<MemoryStore>, scheduler: Arc<ManualScheduler>) -> AuthPipeline {
        AuthPipeline::start(
            PipelineDeps {
                store,
                clock: Arc::new(ManualClock::new(0)),
                scheduler,
                transport: Arc::new(LoginBackend),
                reauth: Arc::new(NoReauth),
                hooks: ClientHooks::default(),
            },
            ClientSettings::default(),
            TokenSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_login_then_logout() {
        let scheduler = Arc::new(ManualScheduler::new());
        let pipeline = pipeline(Arc::new(MemoryStore::new()), scheduler.clone());

        let (data, status) = pipeline.login("good").await.unwrap();
        assert_eq!(data.token, "session-1");
        assert!(status.is_valid());
        assert_eq!(status.remaining_minutes(), 120);
        assert_eq!(pipeline.tokens().access_token().as_deref(), Some("session-1"));
        assert_eq!(pipeline.tokens().refresh_token().as_deref(), Some("session-1"));
        assert_eq!(scheduler.pending().len(), 1);

        assert_eq!(pipeline.client().get("/ping", &[]).await.unwrap(), json!("pong"));

        pipeline.logout().unwrap();
        assert!(!pipeline.tokens().status().present);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_login_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), Arc::new(ManualScheduler::new()));

        let err = pipeline.login("bad").await.unwrap_err();
        assert!(format!("{:#}", err).contains("User does not exist"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_start_resumes_stored_session() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(ManualScheduler::new());
        {
            let first = pipeline(store.clone(), scheduler.clone());
            first.tokens().set_credentials("kept", "kept", 7200).unwrap();
            first.shutdown();
        }
        assert!(scheduler.pending().is_empty());

        let second = pipeline(store, scheduler.clone());
        assert_eq!(second.tokens().access_token().as_deref(), Some("kept"));
        assert_eq!(scheduler.pending().len(), 1);

        drop(second);
        assert!(scheduler.pending().is_empty());
    }
}
