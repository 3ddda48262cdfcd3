use anyhow::{Context, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::json;

use diary_client::config::{self, Command, Config};
use diary_client::models::RequestSpec;
use diary_client::pipeline::AuthPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Diary client starting...");
    tracing::debug!("Credential store: {}", config.db_file.display());

    let pipeline = AuthPipeline::from_config(&config)?;
    let result = run(&pipeline, &config, command).await;
    pipeline.shutdown();
    result
}

async fn run(pipeline: &AuthPipeline, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let tokens = pipeline.tokens();
            let status = tokens.status();
            print_json(&json!({
                "lifecycle": tokens.lifecycle(),
                "status": status,
                "expires_at": status.expires_at_rfc3339(),
                "remaining_minutes": status.remaining_minutes(),
                "db_file": config.db_file,
            }))
        }

        Command::Login { code } => {
            let code = match code.or_else(|| config.login_code.clone()) {
                Some(code) => code,
                None => config::prompt_login_code()?,
            };

            let (data, status) = pipeline.login(&code).await?;
            tracing::info!("✅ Logged in, token valid for {} minutes", status.remaining_minutes());
            print_json(&json!({
                "user": data.user,
                "expires_at": status.expires_at_rfc3339(),
                "remaining_minutes": status.remaining_minutes(),
            }))
        }

        Command::Logout => {
            pipeline.logout()?;
            print_json(&json!({ "logged_out": true }))
        }

        Command::Request {
            method,
            path,
            query,
            data,
            skip_auth,
        } => {
            let upper = method.to_uppercase();
            let method = Method::from_bytes(upper.as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", upper))?;

            let mut spec = query
                .into_iter()
                .fold(RequestSpec::new(method, path), |spec, (k, v)| spec.with_query(k, v));
            if let Some(data) = data {
                let body = serde_json::from_str(&data).context("--data must be valid JSON")?;
                spec = spec.with_body(body);
            }
            if skip_auth {
                spec = spec.skip_auth();
            }

            let value = pipeline.client().dispatch(spec).await?;
            print_json(&value)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", text);
    Ok(())
}
