// Token lifecycle management
// Owns the stored credentials and the proactive refresh timer

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use super::clock::{Clock, Scheduler, TimerHandle};
use super::store::KeyValueStore;
use super::types::{CredentialRecord, Lifecycle, TokenCallbacks, TokenStatus};

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "DIARY_ACCESS_TOKEN";
/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "DIARY_REFRESH_TOKEN";
/// Storage key for the absolute expiry (epoch millis as a decimal string)
pub const TOKEN_EXPIRY_KEY: &str = "DIARY_TOKEN_EXPIRY";
/// Storage key for the authorization scheme
pub const TOKEN_TYPE_KEY: &str = "DIARY_TOKEN_TYPE";

const STORAGE_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_EXPIRY_KEY,
    TOKEN_TYPE_KEY,
];

/// Tunables for the token lifecycle
#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// How long before expiry the refresh timer fires
    pub refresh_lead: Duration,
    /// Consecutive refresh failures tolerated before the session expires
    pub max_refresh_retries: u32,
    /// Delay between refresh retries
    pub retry_delay: Duration,
    /// Authorization scheme stored with new credentials
    pub token_type: String,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            refresh_lead: Duration::from_secs(300),
            max_refresh_retries: 3,
            retry_delay: Duration::from_secs(5),
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Default)]
struct TimerSlot {
    handle: Option<TimerHandle>,
    generation: u64,
}

/// Token lifecycle manager
/// Single source of truth for stored credentials and proactive refresh scheduling
pub struct TokenManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    settings: TokenSettings,

    /// At most one pending refresh timer
    timer: Mutex<TimerSlot>,

    callbacks: RwLock<TokenCallbacks>,

    /// Consecutive refresh failures
    retry_count: AtomicU32,

    /// Set while a refresh is running, whoever started it
    refreshing: AtomicBool,

    /// Bumped whenever the session ends; a refresh started under an older
    /// epoch must not retry or expire the session again
    epoch: AtomicU64,

    this: Weak<TokenManager>,
}

impl TokenManager {
    /// Create a new TokenManager
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        settings: TokenSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            clock,
            scheduler,
            settings,
            timer: Mutex::new(TimerSlot::default()),
            callbacks: RwLock::new(TokenCallbacks::default()),
            retry_count: AtomicU32::new(0),
            refreshing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Register callbacks and act on whatever credential is already stored
    pub fn init(&self, callbacks: TokenCallbacks) {
        *self.callbacks.write().unwrap_or_else(|e| e.into_inner()) = callbacks;

        let status = self.status();
        tracing::debug!(?status, "Token manager initialised");

        if !status.present {
            tracing::info!("No stored credentials");
        } else if status.expired {
            tracing::info!("Stored credentials have expired");
            self.notify_expired();
        } else {
            // Near-expiry credentials get a zero-delay timer
            self.schedule_auto_refresh();
        }
    }

    /// Cancel the timer and drop all callbacks
    pub fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_timer();
        *self.callbacks.write().unwrap_or_else(|e| e.into_inner()) = TokenCallbacks::default();
        self.retry_count.store(0, Ordering::SeqCst);
        tracing::debug!("Token manager shut down");
    }

    // === Storage ===

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::error!(key = key, error = %e, "Failed to read credential entry");
                None
            }
        }
    }

    /// Current access token
    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    /// Current refresh token
    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Absolute expiry in epoch milliseconds
    pub fn expires_at(&self) -> Option<i64> {
        self.read(TOKEN_EXPIRY_KEY).and_then(|v| v.parse().ok())
    }

    /// Complete stored record, if every entry is present and well-formed
    pub fn credentials(&self) -> Option<CredentialRecord> {
        Some(CredentialRecord {
            access_token: self.access_token()?,
            refresh_token: self.refresh_token()?,
            expires_at_ms: self.expires_at()?,
            token_type: self.read(TOKEN_TYPE_KEY)?,
        })
    }

    /// Persist new credentials expiring `ttl_secs` from now and re-arm the refresh timer.
    /// A storage failure is returned as-is; entries already written are not rolled back.
    pub fn set_credentials(&self, access_token: &str, refresh_token: &str, ttl_secs: u64) -> Result<()> {
        let record = CredentialRecord::issue(
            access_token,
            refresh_token,
            ttl_secs,
            self.clock.now_ms(),
            &self.settings.token_type,
        );

        self.store
            .set(ACCESS_TOKEN_KEY, &record.access_token)
            .context("Failed to store access token")?;
        self.store
            .set(REFRESH_TOKEN_KEY, &record.refresh_token)
            .context("Failed to store refresh token")?;
        self.store
            .set(TOKEN_EXPIRY_KEY, &record.expires_at_ms.to_string())
            .context("Failed to store token expiry")?;
        self.store
            .set(TOKEN_TYPE_KEY, &record.token_type)
            .context("Failed to store token type")?;

        tracing::info!(
            token = %token_prefix(access_token),
            expires_at_ms = record.expires_at_ms,
            "Credentials stored"
        );

        self.schedule_auto_refresh();
        Ok(())
    }

    /// Store credentials and report the resulting status
    pub fn start_session(&self, access_token: &str, refresh_token: &str, ttl_secs: u64) -> Result<TokenStatus> {
        self.set_credentials(access_token, refresh_token, ttl_secs)?;
        let status = self.status();
        tracing::info!(remaining_minutes = status.remaining_minutes(), "Token timer started");
        Ok(status)
    }

    /// Remove all credential entries and cancel the refresh timer
    pub fn clear_credentials(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_timer();
        self.retry_count.store(0, Ordering::SeqCst);
        for key in STORAGE_KEYS {
            self.store
                .remove(key)
                .with_context(|| format!("Failed to remove {}", key))?;
        }
        tracing::info!("Credentials cleared");
        Ok(())
    }

    // === Status ===

    /// Validity of the stored credential at the current time
    pub fn status(&self) -> TokenStatus {
        match self.credentials() {
            Some(record) => TokenStatus::compute(record.expires_at_ms, self.clock.now_ms(), self.lead_ms()),
            None => TokenStatus::absent(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.refreshing.load(Ordering::SeqCst) {
            Lifecycle::Refreshing
        } else {
            self.status().lifecycle()
        }
    }

    /// `"<scheme> <token>"`, or `None` without an access token
    pub fn authorization_header(&self) -> Option<String> {
        let token = self.access_token()?;
        let scheme = self
            .read(TOKEN_TYPE_KEY)
            .unwrap_or_else(|| self.settings.token_type.clone());
        Some(format!("{} {}", scheme, token))
    }

    /// Flag a refresh as running; the request dispatcher calls this for refreshes it leads
    pub fn mark_refreshing(&self, refreshing: bool) {
        self.refreshing.store(refreshing, Ordering::SeqCst);
    }

    /// Current session epoch; changes on every clear and shutdown
    pub fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer_slot().handle.is_some()
    }

    fn lead_ms(&self) -> i64 {
        i64::try_from(self.settings.refresh_lead.as_millis()).unwrap_or(i64::MAX)
    }

    // === Auto refresh ===

    /// Arm the refresh timer for `expiry - lead`; fires immediately if that point has passed
    pub fn schedule_auto_refresh(&self) {
        let Some(expires_at) = self.expires_at() else {
            self.cancel_timer();
            return;
        };

        let delay_ms = expires_at - self.lead_ms() - self.clock.now_ms();
        if delay_ms <= 0 {
            tracing::info!("Refresh point already reached, refreshing now");
            self.arm(Duration::ZERO);
            return;
        }

        self.arm(Duration::from_millis(delay_ms as u64));
        tracing::info!(delay_secs = delay_ms / 1000, "Auto-refresh timer armed");
    }

    /// Cancel any pending timer; harmless when none exists
    pub fn cancel_timer(&self) {
        if let Some(handle) = self.timer_slot().handle.take() {
            handle.cancel();
            tracing::debug!("Auto-refresh timer cancelled");
        }
    }

    fn timer_slot(&self) -> MutexGuard<'_, TimerSlot> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, delay: Duration) {
        let mut slot = self.timer_slot();
        if let Some(previous) = slot.handle.take() {
            previous.cancel();
        }
        slot.generation += 1;
        let task = Self::timer_task(self.this.clone(), slot.generation);
        slot.handle = Some(self.scheduler.schedule(delay, task));
    }

    fn timer_task(this: Weak<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(manager) = this.upgrade() else {
                return;
            };
            if manager.take_fired_timer(generation) {
                manager.on_near_expiry().await;
            }
        })
    }

    /// Detach the firing timer from the slot, unless it has been superseded
    fn take_fired_timer(&self, generation: u64) -> bool {
        let mut slot = self.timer_slot();
        if slot.generation != generation {
            return false;
        }
        slot.handle = None;
        true
    }

    /// Run the registered refresh hook, retrying on failure
    pub async fn on_near_expiry(&self) {
        tracing::info!("Access token near expiry, refreshing");
        let epoch = self.session_epoch();

        let hook = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .on_refresh
            .clone();

        let Some(hook) = hook else {
            tracing::warn!("No refresh hook registered");
            self.handle_refresh_failure();
            return;
        };

        self.mark_refreshing(true);
        let outcome = hook.refresh().await;
        self.mark_refreshing(false);

        if self.session_epoch() != epoch {
            tracing::info!("Session ended during refresh, not retrying");
            return;
        }

        match outcome {
            Ok(true) => {
                self.retry_count.store(0, Ordering::SeqCst);
                tracing::info!("Token refresh succeeded");
            }
            Ok(false) => {
                tracing::warn!("Token refresh was rejected");
                self.handle_refresh_failure();
            }
            Err(e) => {
                tracing::error!(error = %e, "Token refresh failed");
                self.handle_refresh_failure();
            }
        }
    }

    fn handle_refresh_failure(&self) {
        let attempts = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.settings.max_refresh_retries;

        if attempts < max {
            tracing::warn!(
                attempt = attempts,
                max_retries = max,
                "Token refresh failed, retrying in {}s",
                self.settings.retry_delay.as_secs()
            );
            self.arm(self.settings.retry_delay);
        } else {
            tracing::error!(attempts = attempts, "Token refresh failed repeatedly, session expired");
            self.retry_count.store(0, Ordering::SeqCst);
            self.notify_expired();
        }
    }

    fn notify_expired(&self) {
        let hook = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .on_expired
            .clone();
        if let Some(hook) = hook {
            hook.on_expired();
        }
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_slot().handle.take() {
            handle.cancel();
        }
    }
}

/// First characters of a secret, safe for logs
pub(crate) fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}
