use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keyfed_core::config::StoreConfig;
use keyfed_core::{open_store, SigningProvider};
use keyfed_distribution::{DistributionConfig, DistributionRunner};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about = "keyfed diagnosis key distribution")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "DISTRIBUTION_CONFIG")]
    config: Option<PathBuf>,

    /// Directory the export tree is published to
    #[clap(long, env = "PUBLISH_ROOT")]
    publish_root: Option<PathBuf>,

    /// SQLite key store
    #[clap(long, env = "KEY_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// PKCS#8 PEM private key
    #[clap(long, env = "SIGNING_KEY_PATH")]
    private_key_path: Option<PathBuf>,

    /// Base64 ed25519 seed
    #[clap(long, env = "SIGNING_KEY_SEED", hide_env_values = true)]
    private_key_seed: Option<String>,

    /// Certificate published in the trust bundle
    #[clap(long, env = "SIGNING_CERTIFICATE_PATH")]
    certificate_path: Option<PathBuf>,

    /// Number of generations kept on disk
    #[clap(long, env = "RETAINED_GENERATIONS")]
    retained_generations: Option<usize>,

    /// Default log level, `RUST_LOG` still takes precedence
    #[clap(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DistributionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DistributionConfig::new(),
    };

    // Override config with command-line arguments
    if let Some(publish_root) = args.publish_root {
        config.publish_root = publish_root;
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
    if let Some(path) = args.certificate_path {
        config.core.signing.certificate_path = Some(path);
    }
    if let Some(retained) = args.retained_generations {
        config.retained_generations = retained;
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

    let signer = match SigningProvider::from_config(&config.core.signing) {
        Ok(signer) => Arc::new(signer),
        Err(e) => {
            error!("Cannot load signing key: {}", e);
            return Err(e.into());
        }
    };
    let store = open_store(&config.core.store)?;

    let publish_root = config.publish_root.clone();
    info!("Publishing to {}", publish_root.display());
    let runner = Arc::new(DistributionRunner::new(store, signer, config));
    let cancel = CancellationToken::new();

    let mut task = {
        let runner = runner.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || runner.run(&cancel))
    };

    let result = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling distribution run");
            cancel.cancel();
            task.await
        }
    };

    let report = match result? {
        Ok(report) => report,
        Err(e) if e.leaves_publication_intact() => {
            error!("Distribution run failed, previous publication unchanged: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            error!(
                "Distribution run failed while publishing, inspect {} before the next run: {}",
                publish_root.display(),
                e
            );
            return Err(e.into());
        }
    };
    info!(
        "Distribution finished: generation {}, {} files, {} keys",
        report.generation, report.files_published, report.keys_loaded
    );

    Ok(())
}
