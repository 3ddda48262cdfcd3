// Data models for the backend's wire formats

pub mod auth;
pub mod envelope;
pub mod request;

pub use auth::{LoginData, LoginRequest, UserProfile};
pub use envelope::{Envelope, EnvelopeStatus, CODE_ACCOUNT_DISABLED, CODE_SUCCESS, CODE_UNAUTHORIZED};
pub use request::RequestSpec;
