use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keyfed_callback::{create_router, AppState, CallbackServiceConfig};
use keyfed_core::config::StoreConfig;
use keyfed_core::open_store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(author, version, about = "keyfed federation callback service")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "CALLBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[clap(long, env = "CALLBACK_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

    /// SQLite key store
    #[clap(long, env = "KEY_STORE_PATH")]
    store_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => CallbackServiceConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CallbackServiceConfig::new(),
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(path) = args.store_path {
        config.store = StoreConfig::Sqlite { path };
    }

    tracing::info!("Starting callback service");
    let store = open_store(&config.store)?;
    let app = create_router(Arc::new(AppState { store }));

    tracing::info!("Listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Cannot bind {}", config.listen_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
