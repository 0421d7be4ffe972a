use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::resilience::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS};
use crate::resilience::RetryPolicy;

/// Client configuration loaded from environment variables.
/// Fails at startup if the backend URL or anon key is missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_schema: String,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub probe_table: String,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("Required environment variable '{key}' is not set"))
        };

        let supabase_url = require("SUPABASE_URL")?;
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            bail!("SUPABASE_URL must be an http(s) URL, got '{supabase_url}'");
        }

        let max_retries: u32 = parse_or(&lookup, "RETRY_MAX_ATTEMPTS", DEFAULT_MAX_RETRIES)?;
        if max_retries == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        let base_delay_ms: u64 = parse_or(&lookup, "RETRY_BASE_DELAY_MS", DEFAULT_BASE_DELAY_MS)?;
        let timeout_ms: u64 = parse_or(&lookup, "RETRY_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?;
        let http_timeout_secs: u64 = parse_or(&lookup, "HTTP_TIMEOUT_SECS", 30)?;

        Ok(Config {
            supabase_url,
            supabase_anon_key: require("SUPABASE_ANON_KEY")?,
            supabase_schema: lookup("SUPABASE_SCHEMA").unwrap_or_else(|| "public".to_string()),
            retry: RetryPolicy::new(
                max_retries,
                Duration::from_millis(base_delay_ms),
                Duration::from_millis(timeout_ms),
            ),
            http_timeout: Duration::from_secs(http_timeout_secs),
            probe_table: lookup("PROBE_TABLE").unwrap_or_else(|| "processed_resumes".to_string()),
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}
