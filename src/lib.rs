// Diary client - authenticated request pipeline

pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http_client;
pub mod models;
pub mod pipeline;
pub mod transport;
