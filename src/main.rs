/// accountd - user account service
///
/// Registration, login, token sessions and account lifecycle management
/// over an HTTP API, backed by SQLite with an optional Redis cache.

mod account;
mod api;
mod auth;
mod cache;
mod config;
mod context;
mod db;
mod error;
mod metrics;
mod rate_limit;
mod server;

use anyhow::Context;
use config::{LoggingConfig, ServerConfig};
use context::AppContext;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ServerConfig::from_env().context("failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    // Create application context
    let ctx = AppContext::new(config)
        .await
        .context("failed to initialize application context")?;

    // Start server
    server::serve(ctx).await.context("server terminated with an error")?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| EnvFilter::new("accountd=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
