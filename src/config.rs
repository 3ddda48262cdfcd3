use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Input;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::TokenSettings;
use crate::http_client::ClientSettings;

/// Diary client - authenticated request pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend API base URL
    #[arg(short = 'u', long, env = "DIARY_BASE_URL", default_value = "http://localhost:8020/api/v1")]
    pub base_url: String,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "DIARY_HTTP_TIMEOUT_MS", default_value = "10000")]
    pub http_timeout_ms: u64,

    /// Seconds before expiry at which the token is refreshed
    #[arg(long, env = "DIARY_REFRESH_LEAD_SECS", default_value = "300")]
    pub refresh_lead_secs: u64,

    /// Consecutive refresh failures before the session expires
    #[arg(long, env = "DIARY_MAX_REFRESH_RETRIES", default_value = "3")]
    pub max_refresh_retries: u32,

    /// Seconds between refresh retries
    #[arg(long, env = "DIARY_REFRESH_RETRY_DELAY_SECS", default_value = "5")]
    pub refresh_retry_delay_secs: u64,

    /// Token lifetime assumed after login, in seconds
    #[arg(long, env = "DIARY_TOKEN_TTL_SECS", default_value = "7200")]
    pub token_ttl_secs: u64,

    /// URL fragments sent without the Authorization header (comma separated)
    #[arg(long, env = "DIARY_NO_AUTH_URLS", value_delimiter = ',', default_value = "/auth/wx-login")]
    pub no_auth_urls: Vec<String>,

    /// URL fragments whose errors are not shown (comma separated)
    #[arg(long, env = "DIARY_SILENT_ERROR_URLS", value_delimiter = ',', default_value = "/auth/wx-login")]
    pub silent_error_urls: Vec<String>,

    /// Value of the X-Client-Type header
    #[arg(long, env = "DIARY_CLIENT_TYPE", default_value = "miniprogram")]
    pub client_type: String,

    /// Path to the credential database
    #[arg(short = 'd', long, env = "DIARY_DB_FILE")]
    pub db_file: Option<String>,

    /// Login code used for silent re-authentication
    #[arg(long, env = "DIARY_LOGIN_CODE", hide_env_values = true)]
    pub login_code: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the stored credential status
    Status,

    /// Exchange a login code for a session
    Login {
        /// Login code; prompted for when neither this nor DIARY_LOGIN_CODE is set
        #[arg(long)]
        code: Option<String>,
    },

    /// Remove stored credentials
    Logout,

    /// Send a request through the pipeline and print the result
    Request {
        /// HTTP method
        method: String,

        /// Path relative to the base URL, or an absolute URL
        path: String,

        /// Query parameter as key=value (repeatable)
        #[arg(short = 'q', long = "query", value_parser = parse_key_val)]
        query: Vec<(String, String)>,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,

        /// Send without the Authorization header
        #[arg(long)]
        skip_auth: bool,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub base_url: String,
    pub login_path: String,
    pub client_type: String,

    // HTTP
    pub http_timeout_ms: u64,
    pub no_auth_urls: Vec<String>,
    pub silent_error_urls: Vec<String>,

    // Token lifecycle
    pub refresh_lead_secs: u64,
    pub max_refresh_retries: u32,
    pub refresh_retry_delay_secs: u64,
    pub token_ttl_secs: u64,

    // Credentials
    pub db_file: PathBuf,
    pub login_code: Option<String>,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8020/api/v1".to_string(),
            login_path: "/auth/wx-login".to_string(),
            client_type: "miniprogram".to_string(),
            http_timeout_ms: 10_000,
            no_auth_urls: vec!["/auth/wx-login".to_string()],
            silent_error_urls: vec!["/auth/wx-login".to_string()],
            refresh_lead_secs: 300,
            max_refresh_retries: 3,
            refresh_retry_delay_secs: 5,
            token_ttl_secs: 7200,
            db_file: default_db_path(),
            login_code: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone().unwrap_or(Command::Status);
        Ok((Self::from_args(args), command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Self {
        Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),
            client_type: args.client_type,
            http_timeout_ms: args.http_timeout_ms,
            no_auth_urls: clean_list(args.no_auth_urls),
            silent_error_urls: clean_list(args.silent_error_urls),
            refresh_lead_secs: args.refresh_lead_secs,
            max_refresh_retries: args.max_refresh_retries,
            refresh_retry_delay_secs: args.refresh_retry_delay_secs,
            token_ttl_secs: args.token_ttl_secs,
            db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_db_path),
            login_code: args.login_code.filter(|c| !c.is_empty()),
            log_level: args.log_level,
            ..Config::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("DIARY_BASE_URL cannot be empty");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("DIARY_BASE_URL must be an http(s) URL: {}", self.base_url);
        }
        if self.http_timeout_ms == 0 {
            anyhow::bail!("DIARY_HTTP_TIMEOUT_MS must be greater than zero");
        }
        if self.max_refresh_retries == 0 {
            anyhow::bail!("DIARY_MAX_REFRESH_RETRIES must be greater than zero");
        }
        Ok(())
    }

    /// Absolute URL of the login endpoint
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_path)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.base_url.clone(),
            login_path: self.login_path.clone(),
            timeout: self.http_timeout(),
            no_auth_urls: self.no_auth_urls.clone(),
            silent_error_urls: self.silent_error_urls.clone(),
            client_type: self.client_type.clone(),
            default_ttl_secs: self.token_ttl_secs,
            ..ClientSettings::default()
        }
    }

    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            refresh_lead: Duration::from_secs(self.refresh_lead_secs),
            max_refresh_retries: self.max_refresh_retries,
            retry_delay: Duration::from_secs(self.refresh_retry_delay_secs),
            ..TokenSettings::default()
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// `<data dir>/diary-client/auth.sqlite3`
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diary-client")
        .join("auth.sqlite3")
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a `key=value` pair
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value pair: no `=` found in `{}`", s))?;
    if key.is_empty() {
        return Err(format!("invalid key=value pair: empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

// === Interactive Setup ===

/// Ask for a login code on the terminal
pub fn prompt_login_code() -> Result<String> {
    let code: String = Input::new()
        .with_prompt("Enter login code")
        .interact_text()
        .context("Failed to read login code")?;

    let code = code.trim().to_string();
    if code.is_empty() {
        anyhow::bail!("Login code cannot be empty");
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("diary-client").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_relative_path() {
        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.login_url(), "http://localhost:8020/api/v1/auth/wx-login");
        assert!(config.db_file.ends_with("diary-client/auth.sqlite3"));
        assert!(config.validate().is_ok());

        let tokens = config.token_settings();
        assert_eq!(tokens.refresh_lead, Duration::from_secs(300));
        assert_eq!(tokens.max_refresh_retries, 3);
        assert_eq!(tokens.retry_delay, Duration::from_secs(5));
        assert_eq!(tokens.token_type, "Bearer");

        let client = config.client_settings();
        assert_eq!(client.no_auth_urls, vec!["/auth/wx-login".to_string()]);
        assert_eq!(client.default_ttl_secs, 7200);
    }

    #[test]
    fn test_from_args() {
        let args = parse(&[
            "--base-url",
            "https://diary.example.com/api/v1/",
            "--http-timeout-ms",
            "2500",
            "--no-auth-urls",
            "/auth/wx-login, /public",
            "-d",
            "/tmp/diary/auth.db",
            "request",
            "GET",
            "/diary",
            "-q",
            "page=1",
            "--query",
            "tag=a=b",
        ]);

        let command = args.command.clone();
        let config = Config::from_args(args);
        assert_eq!(config.base_url, "https://diary.example.com/api/v1");
        assert_eq!(config.http_timeout_ms, 2500);
        assert_eq!(config.no_auth_urls, vec!["/auth/wx-login".to_string(), "/public".to_string()]);
        assert_eq!(config.db_file, PathBuf::from("/tmp/diary/auth.db"));

        assert_eq!(
            command,
            Some(Command::Request {
                method: "GET".to_string(),
                path: "/diary".to_string(),
                query: vec![
                    ("page".to_string(), "1".to_string()),
                    ("tag".to_string(), "a=b".to_string()),
                ],
                data: None,
                skip_auth: false,
            })
        );
    }

    #[test]
    fn test_login_subcommand() {
        let args = parse(&["login", "--code", "abc"]);
        assert_eq!(
            args.command,
            Some(Command::Login {
                code: Some("abc".to_string())
            })
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            base_url: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            base_url: "ftp://example.com".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            http_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_refresh_retries: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(parse_key_val("a=1"), Ok(("a".to_string(), "1".to_string())));
        assert_eq!(parse_key_val("a="), Ok(("a".to_string(), String::new())));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=1").is_err());
    }
}
