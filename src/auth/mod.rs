// Authentication module
// Manages credential storage, expiry prediction and silent re-authentication

mod clock;
mod manager;
mod refresh;
mod store;
mod types;

pub use clock::{Clock, ManualClock, ManualScheduler, Scheduler, SystemClock, TimerHandle, TokioScheduler};
pub use manager::{
    TokenManager, TokenSettings, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY, TOKEN_TYPE_KEY,
};
pub use refresh::CodeLogin;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::{
    CredentialRecord, ExpiredHook, Lifecycle, ReauthOutcome, Reauthenticator, RefreshHook, TokenCallbacks,
    TokenStatus,
};

