// HTTP request dispatcher
// Attaches credentials, interprets the response envelope and recovers from
// authentication failures with a single shared token refresh

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::auth::{ExpiredHook, Reauthenticator, RefreshHook, TokenCallbacks, TokenManager};
use crate::error::{business_message, status_message, ApiError};
use crate::hooks::{LogNavigator, LogNotifier, Navigator, Notifier};
use crate::models::{Envelope, EnvelopeStatus, RequestSpec, CODE_ACCOUNT_DISABLED};
use crate::transport::{Transport, TransportRequest};

/// Dispatcher tunables
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Prefix for every path that is not already an absolute URL
    pub base_url: String,
    /// Path of the code-for-token login endpoint
    pub login_path: String,
    /// Default per-request timeout
    pub timeout: Duration,
    /// URL fragments that never carry the Authorization header
    pub no_auth_urls: Vec<String>,
    /// URL fragments whose errors are not shown to the user
    pub silent_error_urls: Vec<String>,
    pub client_type: String,
    pub app_version: String,
    /// Lifetime assumed when re-authentication does not report one
    pub default_ttl_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8020/api/v1".to_string(),
            login_path: "/auth/wx-login".to_string(),
            timeout: Duration::from_millis(10_000),
            no_auth_urls: vec!["/auth/wx-login".to_string()],
            silent_error_urls: vec!["/auth/wx-login".to_string()],
            client_type: "miniprogram".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            default_ttl_secs: 7200,
        }
    }
}

/// User-facing surfaces the dispatcher reports to
#[derive(Clone)]
pub struct ClientHooks {
    pub navigator: Arc<dyn Navigator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for ClientHooks {
    fn default() -> Self {
        Self {
            navigator: Arc::new(LogNavigator),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Device description sent with every request
#[derive(Debug, Clone)]
struct DeviceInfo {
    device_type: String,
    device_model: String,
}

impl DeviceInfo {
    fn detect() -> Self {
        let device_model = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            device_type: std::env::consts::OS.to_string(),
            device_model,
        }
    }
}

/// Outcome shared with every caller waiting on a refresh
type RefreshResult = Result<(), String>;

/// Caller parked behind an in-flight refresh
enum Waiter {
    /// Request replayed by the leader once the refresh settles
    Request {
        spec: RequestSpec,
        reply: oneshot::Sender<Result<Value, ApiError>>,
    },
    /// Timer-driven refresh that only needs the outcome
    Refresh(oneshot::Sender<RefreshResult>),
}

/// In-flight marker plus the callers queued behind it
#[derive(Default)]
struct RefreshGate {
    in_flight: bool,
    waiters: VecDeque<Waiter>,
}

/// What a caller does on reaching the gate
enum Turn<L, W> {
    Lead(L),
    Wait(oneshot::Receiver<W>),
}

/// Who started a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOrigin {
    /// A request hit an authentication failure
    Request,
    /// The token manager's near-expiry timer
    Timer,
}

/// Interpreted response that did not end in an error
enum Reply {
    Data(Value),
    AuthFailure,
}

/// Authenticated API client
pub struct ApiClient {
    settings: ClientSettings,
    tokens: Arc<TokenManager>,
    transport: Arc<dyn Transport>,
    reauth: Arc<dyn Reauthenticator>,
    hooks: ClientHooks,
    device: DeviceInfo,
    gate: Mutex<RefreshGate>,
}

impl ApiClient {
    /// Create a new client
    pub fn new(
        settings: ClientSettings,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn Transport>,
        reauth: Arc<dyn Reauthenticator>,
        hooks: ClientHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            tokens,
            transport,
            reauth,
            hooks,
            device: DeviceInfo::detect(),
            gate: Mutex::new(RefreshGate::default()),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Callbacks that route the token manager's refresh and expiry through this client
    pub fn token_callbacks(self: &Arc<Self>) -> TokenCallbacks {
        TokenCallbacks {
            on_refresh: Some(Arc::new(TimerRefresh(Arc::downgrade(self)))),
            on_expired: Some(Arc::new(SessionExpiry(Arc::downgrade(self)))),
        }
    }

    // === Public request API ===

    /// Send a request and return the envelope's `data` (null when absent)
    pub async fn dispatch(&self, spec: RequestSpec) -> Result<Value, ApiError> {
        match self.send_once(&spec).await {
            Ok(Reply::Data(data)) => Ok(data),
            Ok(Reply::AuthFailure) => {
                tracing::info!(path = %spec.path, "Authentication failed, refreshing token");
                self.recover(spec).await
            }
            Err(e) => {
                self.report(&spec, &e);
                Err(e)
            }
        }
    }

    /// Dispatch and decode `data` into `T`
    pub async fn request<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, ApiError> {
        let data = self.dispatch(spec).await?;
        serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let spec = query
            .iter()
            .fold(RequestSpec::get(path), |spec, (k, v)| spec.with_query(*k, *v));
        self.dispatch(spec).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.dispatch(RequestSpec::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.dispatch(RequestSpec::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.dispatch(RequestSpec::delete(path)).await
    }

    /// End the session: drop credentials and send the user to login
    pub fn expire_session(&self) {
        if let Err(e) = self.tokens.clear_credentials() {
            tracing::error!(error = %e, "Failed to clear credentials");
        }
        self.hooks.navigator.redirect_to_login();
    }

    // === Request preparation ===

    fn resolve_url(&self, spec: &RequestSpec) -> Result<String, ApiError> {
        let url = if spec.path.starts_with("http") {
            spec.path.clone()
        } else {
            format!("{}{}", self.settings.base_url, spec.path)
        };

        if spec.query.is_empty() {
            return Ok(url);
        }

        let mut parsed = Url::parse(&url)
            .map_err(|e| ApiError::Internal(anyhow!("Invalid request URL {}: {}", url, e)))?;
        {
            let mut pairs = parsed.query_pairs_mut();
            for (key, value) in &spec.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(parsed.to_string())
    }

    fn requires_auth(&self, url: &str) -> bool {
        !self.settings.no_auth_urls.iter().any(|p| url.contains(p.as_str()))
    }

    fn is_silent(&self, spec: &RequestSpec) -> bool {
        spec.skip_auth
            || self
                .settings
                .silent_error_urls
                .iter()
                .any(|p| spec.path.contains(p.as_str()))
    }

    fn prepare(&self, spec: &RequestSpec) -> Result<TransportRequest, ApiError> {
        let url = self.resolve_url(spec)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        put_header(&mut headers, "X-Device-Type", &self.device.device_type);
        put_header(&mut headers, "X-Device-Model", &self.device.device_model);
        put_header(&mut headers, "X-App-Version", &self.settings.app_version);
        put_header(&mut headers, "X-Client-Type", &self.settings.client_type);
        put_header(
            &mut headers,
            "X-Timestamp",
            &chrono::Utc::now().timestamp_millis().to_string(),
        );
        put_header(&mut headers, "X-Request-Id", &uuid::Uuid::new_v4().to_string());

        for (name, value) in &spec.headers {
            put_header(&mut headers, name, value);
        }

        if spec.skip_auth {
            tracing::debug!(url = %url, "Skipping authorization");
        } else if self.requires_auth(&url) {
            match self.tokens.authorization_header() {
                Some(value) => put_header(&mut headers, AUTHORIZATION.as_str(), &value),
                None => tracing::warn!(url = %url, "Endpoint requires authorization but no token is stored"),
            }
        }

        Ok(TransportRequest {
            method: spec.method.clone(),
            url,
            headers,
            body: spec.body.clone(),
            timeout: spec.timeout.unwrap_or(self.settings.timeout),
        })
    }

    // === Sending and interpretation ===

    async fn send_once(&self, spec: &RequestSpec) -> Result<Reply, ApiError> {
        let request = self.prepare(spec)?;
        let method = request.method.clone();
        let url = request.url.clone();

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let response = self.transport.send(request).await?;

        tracing::debug!(method = %method, url = %url, status = response.status, "Received HTTP response");

        self.interpret(response.status, &response.body)
    }

    fn interpret(&self, status: u16, body: &[u8]) -> Result<Reply, ApiError> {
        match status {
            200..=299 => {
                let envelope: Envelope =
                    serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;

                match envelope.status() {
                    EnvelopeStatus::Success => Ok(Reply::Data(envelope.data.unwrap_or(Value::Null))),
                    EnvelopeStatus::Unauthorized => Ok(Reply::AuthFailure),
                    EnvelopeStatus::Failure(code) => Err(self.business_error(code, envelope.message)),
                }
            }
            401 => Ok(Reply::AuthFailure),
            403 => Err(ApiError::Permission(status_message(403))),
            _ => {
                let text = String::from_utf8_lossy(body);
                tracing::error!(status = status, response_body = %text, "HTTP request failed with error response");
                Err(ApiError::HttpStatus {
                    status,
                    message: status_message(status),
                })
            }
        }
    }

    fn business_error(&self, code: i64, message: Option<String>) -> ApiError {
        let message = business_message(code)
            .map(str::to_string)
            .or(message)
            .unwrap_or_else(|| "Operation failed".to_string());

        tracing::warn!(code = code, message = %message, "Business error");

        if code == CODE_ACCOUNT_DISABLED {
            tracing::error!("Account disabled by server");
            self.expire_session();
        }

        ApiError::Business { code, message }
    }

    fn report(&self, spec: &RequestSpec, err: &ApiError) {
        let notify = matches!(
            err,
            ApiError::Transport { .. }
                | ApiError::HttpStatus { .. }
                | ApiError::Permission(_)
                | ApiError::Business { .. }
        );

        if !notify {
            return;
        }
        if self.is_silent(spec) {
            tracing::debug!(path = %spec.path, error = %err, "Suppressed error notification");
            return;
        }
        self.hooks.notifier.notify(&err.user_message());
    }

    // === Single-flight refresh ===

    fn gate(&self) -> MutexGuard<'_, RefreshGate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_gate(&self, gate: &mut RefreshGate) {
        gate.in_flight = true;
        self.tokens.mark_refreshing(true);
    }

    /// Clear the in-flight marker and take the queued callers in arrival order
    fn close_gate(&self) -> VecDeque<Waiter> {
        let mut gate = self.gate();
        gate.in_flight = false;
        self.tokens.mark_refreshing(false);
        std::mem::take(&mut gate.waiters)
    }

    /// Refresh after an authentication failure, then retry `spec` once.
    /// Joins the in-flight refresh if there is one; the leader replays every queued request.
    async fn recover(&self, spec: RequestSpec) -> Result<Value, ApiError> {
        let turn = {
            let mut gate = self.gate();
            if gate.in_flight {
                let (reply, rx) = oneshot::channel();
                gate.waiters.push_back(Waiter::Request { spec, reply });
                Turn::Wait(rx)
            } else {
                self.open_gate(&mut gate);
                Turn::Lead(spec)
            }
        };

        let spec = match turn {
            Turn::Lead(spec) => spec,
            Turn::Wait(rx) => {
                tracing::debug!("Token refresh in flight, queued for retry");
                return rx.await.unwrap_or_else(|_| {
                    Err(ApiError::AuthExpired("token refresh was abandoned".to_string()))
                });
            }
        };

        tracing::info!(origin = ?RefreshOrigin::Request, "Starting token refresh");
        let (result, waiters) = self.lead_refresh().await;
        self.settle(RefreshOrigin::Request, &result, waiters, Some(spec))
            .await
            .unwrap_or_else(|| Err(ApiError::AuthExpired("token refresh was abandoned".to_string())))
    }

    /// Refresh on behalf of the token manager's timer
    async fn refresh_for_timer(&self) -> RefreshResult {
        let turn = {
            let mut gate = self.gate();
            if gate.in_flight {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push_back(Waiter::Refresh(tx));
                Turn::Wait(rx)
            } else {
                self.open_gate(&mut gate);
                Turn::Lead(())
            }
        };

        match turn {
            Turn::Wait(rx) => {
                tracing::debug!("Token refresh in flight, waiting");
                rx.await
                    .unwrap_or_else(|_| Err("token refresh was abandoned".to_string()))
            }
            Turn::Lead(()) => {
                tracing::info!(origin = ?RefreshOrigin::Timer, "Starting token refresh");
                let (result, waiters) = self.lead_refresh().await;
                self.settle(RefreshOrigin::Timer, &result, waiters, None).await;
                result
            }
        }
    }

    /// Run the refresh and close the gate, even if the leading future is dropped
    async fn lead_refresh(&self) -> (RefreshResult, VecDeque<Waiter>) {
        let mut release = GateRelease {
            client: self,
            armed: true,
        };
        let result = self.run_refresh().await;
        let waiters = release.disarm();
        (result, waiters)
    }

    /// Re-authenticate and persist the new credentials
    async fn run_refresh(&self) -> RefreshResult {
        let epoch = self.tokens.session_epoch();
        let outcome = self
            .reauth
            .reauthenticate()
            .await
            .map_err(|e| format!("{:#}", e))?;

        if !outcome.success {
            return Err("re-authentication was rejected".to_string());
        }
        if self.tokens.session_epoch() != epoch {
            return Err("session ended during token refresh".to_string());
        }

        let access_token = outcome
            .access_token
            .ok_or_else(|| "re-authentication returned no access token".to_string())?;
        let refresh_token = outcome.refresh_token.unwrap_or_else(|| access_token.clone());
        let ttl_secs = outcome.ttl_secs.unwrap_or(self.settings.default_ttl_secs);

        self.tokens
            .set_credentials(&access_token, &refresh_token, ttl_secs)
            .map_err(|e| format!("{:#}", e))
    }

    /// Hand the refresh outcome to the leader's request and everyone queued behind it.
    /// After a success the retries are started in arrival order and run concurrently.
    /// Returns the leader's own result when it brought a request.
    async fn settle(
        &self,
        origin: RefreshOrigin,
        result: &RefreshResult,
        waiters: VecDeque<Waiter>,
        own: Option<RequestSpec>,
    ) -> Option<Result<Value, ApiError>> {
        let mut replays: Vec<(Option<oneshot::Sender<Result<Value, ApiError>>>, RequestSpec)> =
            own.into_iter().map(|spec| (None, spec)).collect();
        let mut requests_waiting = false;

        for waiter in waiters {
            match waiter {
                Waiter::Refresh(tx) => {
                    let _ = tx.send(result.clone());
                }
                Waiter::Request { spec, reply } => {
                    requests_waiting = true;
                    replays.push((Some(reply), spec));
                }
            }
        }

        let outcomes = match result {
            Ok(()) => {
                tracing::info!(retries = replays.len(), "Token refresh succeeded");
                join_all(replays.iter().map(|(_, spec)| self.replay(spec))).await
            }
            Err(reason) => {
                tracing::error!(reason = %reason, origin = ?origin, "Token refresh failed");
                // A failed timer refresh is left to the token manager's retries,
                // unless requests are already waiting on it
                if origin == RefreshOrigin::Request || requests_waiting {
                    self.expire_session();
                }
                replays
                    .iter()
                    .map(|_| Err(ApiError::AuthExpired(reason.clone())))
                    .collect()
            }
        };

        let mut own_result = None;
        for ((reply, _), outcome) in replays.into_iter().zip(outcomes) {
            match reply {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => own_result = Some(outcome),
            }
        }
        own_result
    }

    /// Retry a request once with the refreshed credentials
    async fn replay(&self, spec: &RequestSpec) -> Result<Value, ApiError> {
        match self.send_once(spec).await {
            Ok(Reply::Data(data)) => Ok(data),
            Ok(Reply::AuthFailure) => {
                tracing::error!(path = %spec.path, "Authentication failed again after refresh");
                self.expire_session();
                Err(ApiError::AuthExpired(
                    "request was rejected with refreshed credentials".to_string(),
                ))
            }
            Err(e) => {
                self.report(spec, &e);
                Err(e)
            }
        }
    }
}

/// Closes the gate if the leading future is dropped mid-refresh
struct GateRelease<'a> {
    client: &'a ApiClient,
    armed: bool,
}

impl GateRelease<'_> {
    fn disarm(&mut self) -> VecDeque<Waiter> {
        self.armed = false;
        self.client.close_gate()
    }
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("Token refresh cancelled");
        let reason = "token refresh was cancelled".to_string();
        for waiter in self.client.close_gate() {
            match waiter {
                Waiter::Request { reply, .. } => {
                    let _ = reply.send(Err(ApiError::AuthExpired(reason.clone())));
                }
                Waiter::Refresh(tx) => {
                    let _ = tx.send(Err(reason.clone()));
                }
            }
        }
    }
}

/// Refresh hook handed to the token manager
struct TimerRefresh(Weak<ApiClient>);

#[async_trait]
impl RefreshHook for TimerRefresh {
    async fn refresh(&self) -> anyhow::Result<bool> {
        let Some(client) = self.0.upgrade() else {
            return Ok(false);
        };
        Ok(client.refresh_for_timer().await.is_ok())
    }
}

/// Expiry hook handed to the token manager
struct SessionExpiry(Weak<ApiClient>);

impl ExpiredHook for SessionExpiry {
    fn on_expired(&self) {
        if let Some(client) = self.0.upgrade() {
            client.expire_session();
        }
    }
}

fn put_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "Skipping invalid header"),
    }
}
