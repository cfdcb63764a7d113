//! wamux-server: multi-session chat gateway.
//!
//! Runs any number of independent chat-protocol sessions, exposes them over
//! an HTTP API, and relays inbound messages, receipts and connection changes
//! to a webhook.

mod api;
mod config;
mod engine;
mod session;
mod store;
mod webhook;

use api::AppState;
use clap::Parser;
use config::{Overrides, ServerConfig};
use engine::BridgeEngine;
use session::{MediaStorage, SessionContext, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use store::{MemoryStore, SqliteStore};
use tracing::{error, info, warn};
use wamux_core::SessionStore;
use webhook::WebhookDispatcher;

/// wamux-server: multi-session chat gateway
#[derive(Parser, Debug)]
#[command(name = "wamux-server", version, about = "Multi-session chat gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.wamux/config.toml")]
    config: String,

    /// Webhook endpoint receiving events
    #[arg(long, env = "WAMUX_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Key sent to the webhook in X-API-Key
    #[arg(long, env = "WAMUX_WEBHOOK_API_KEY")]
    webhook_api_key: Option<String>,

    /// Key required from API callers in X-API-Key
    #[arg(long, env = "WAMUX_API_KEY")]
    api_key: Option<String>,

    /// SQLite database path
    #[arg(long)]
    database: Option<String>,

    /// Directory for downloaded inbound media
    #[arg(long)]
    media_dir: Option<String>,

    /// Protocol engine WebSocket URL
    #[arg(long)]
    engine_url: Option<String>,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long)]
    ephemeral: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        port: cli.port,
        api_key: cli.api_key,
        webhook_url: cli.webhook_url,
        webhook_api_key: cli.webhook_api_key,
        database: cli.database,
        media_dir: cli.media_dir,
        engine_url: cli.engine_url,
        ephemeral: cli.ephemeral,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        engine = %config.engine_url,
        "starting wamux-server"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("wamux-server stopped");
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn SessionStore> = if config.ephemeral {
        warn!("ephemeral mode: sessions will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        info!(path = %config.database_path.display(), "opening session database");
        Arc::new(SqliteStore::open(&config.database_path)?)
    };

    std::fs::create_dir_all(&config.media_dir)
        .map_err(|e| format!("cannot create media dir {}: {e}", config.media_dir.display()))?;

    let dispatcher = WebhookDispatcher::new(
        config.webhook_url.clone(),
        config.webhook_api_key.clone(),
        config.webhook_timeout,
    )?;
    if !dispatcher.is_enabled() {
        warn!("no webhook url configured, events will be dropped");
    }

    let engine = Arc::new(BridgeEngine::new(
        config.engine_url.clone(),
        config.io_timeout,
        store.clone(),
    ));
    let ctx = SessionContext {
        store,
        sink: Arc::new(dispatcher),
        media: Arc::new(MediaStorage::new(
            config.media_dir.clone(),
            config.media_url_prefix.clone(),
        )),
        io_timeout: config.io_timeout,
    };
    let manager = Arc::new(SessionManager::new(engine, ctx));

    let loaded = manager.load_existing_sessions().await?;
    info!(count = loaded, "sessions restored");

    let state = AppState {
        manager: manager.clone(),
        api_key: config.api_key.as_deref().map(Arc::from),
        connect_wait: config.connect_wait,
        qr_wait: config.qr_wait,
    };
    if state.api_key.is_none() {
        warn!("no api key configured, the HTTP API is unauthenticated");
    }
    let app = api::router(state, &config.media_dir, &config.media_url_prefix);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("received shutdown signal");
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
