use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyfed_core::config::StoreConfig;
use keyfed_core::{open_store, SigningProvider};
use keyfed_federation::{register_callback, DownloadRunner, FederationConfig, HttpGateway, UploadRunner};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about = "keyfed federation client")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "FEDERATION_CONFIG")]
    config: Option<PathBuf>,

    /// Federation gateway base URL
    #[clap(long, env = "FEDERATION_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// SQLite key store
    #[clap(long, env = "KEY_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// PKCS#8 PEM private key used for batch signatures
    #[clap(long, env = "SIGNING_KEY_PATH")]
    private_key_path: Option<PathBuf>,

    /// Base64 ed25519 seed
    #[clap(long, env = "SIGNING_KEY_SEED", hide_env_values = true)]
    private_key_seed: Option<String>,

    /// Callback URL announced to the gateway
    #[clap(long, env = "FEDERATION_CALLBACK_URL")]
    callback_url: Option<String>,

    /// Default log level, `RUST_LOG` still takes precedence
    #[clap(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the callback URL with the gateway
    Register,
    /// Upload consented local keys
    Upload,
    /// Download batches of peer countries
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FederationConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FederationConfig::new(),
    };

    // Override config with command-line arguments
    if let Some(url) = args.gateway_url {
        config.gateway.base_url = url;
    }
    if let Some(path) = args.store_path {
        config.core.store = StoreConfig::Sqlite { path };
    }
    if let Some(path) = args.private_key_path {
        config.core.signing.private_key_path = Some(path);
    }
    if let Some(seed) = args.private_key_seed {
        config.core.signing.private_key_seed = Some(seed);
    }
    if let Some(url) = args.callback_url {
        config.callback.enabled = true;
        config.callback.url = url;
    }
    if let Some(level) = args.log_level {
        config.core.log_level = level;
    }
    config.validate()?;

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(config.core.log_filter()?)
        .parse_default_env()
        .init();

    let gateway = Arc::new(HttpGateway::new(&config.gateway)?);
    info!("Using federation gateway {}", config.gateway.base_url);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling federation run");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Register => {
            let outcome = register_callback(gateway.as_ref(), &config.callback).await?;
            info!("Callback registration: {:?}", outcome);
        }
        Command::Upload => {
            let signer = match SigningProvider::from_config(&config.core.signing) {
                Ok(signer) => Arc::new(signer),
                Err(e) => {
                    error!("Cannot load signing key: {}", e);
                    return Err(e.into());
                }
            };
            let store = open_store(&config.core.store)?;
            let runner = UploadRunner::new(store, gateway, signer, config);
            let report = runner.run(&cancel).await?;
            for rejected in &report.rejected {
                warn!("Rejected key {} in batch {}", rejected.key_prefix, rejected.batch_tag);
            }
            info!(
                "Upload finished: {} of {} keys accepted",
                report.accepted, report.candidates
            );
        }
        Command::Download => {
            let store = open_store(&config.core.store)?;
            let runner = DownloadRunner::new(store, gateway, config)?;
            let report = runner.run(&cancel).await?;
            info!(
                "Download finished: {} batches, {} new keys",
                report.batches_processed, report.keys_stored
            );
        }
    }

    Ok(())
}
