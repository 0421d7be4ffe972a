use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use magiccv_backend::{Config, RetryingClient, SupabaseClient};

/// Connectivity probe: loads config, then runs one retried session lookup and
/// one retried select against the configured probe table.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("magiccv_backend={}", &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MagicCV backend probe v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Retry policy: {} attempts, {}ms base delay, {}ms timeout",
        config.retry.max_retries(),
        config.retry.base_delay().as_millis(),
        config.retry.attempt_timeout().as_millis()
    );

    let backend = SupabaseClient::from_config(&config).context("Failed to build HTTP client")?;
    let client = RetryingClient::new(Arc::new(backend), config.retry);

    match client.auth().get_session().await? {
        Some(session) => info!(user_id = %session.user.id, "Existing session found"),
        None => info!("No session; using anonymous key"),
    }

    let table = client.from(config.probe_table.as_str());
    match table.select(Some("*")).await {
        Ok(rows) => info!(table = table.table(), rows = rows.len(), "Backend reachable"),
        Err(e) => {
            warn!(table = table.table(), error = %e, "Backend probe failed");
            return Err(e).context("Backend probe failed");
        }
    }

    Ok(())
}
