//! Configuration for the core crate
//!
//! This module provides the configuration shared by the distribution and
//! federation services: signing key material, key store backend and the
//! retry policy for remote calls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Where the signing key and certificate are loaded from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// PKCS#8 PEM file holding the ed25519 private key
    pub private_key_path: Option<PathBuf>,

    /// Base64 encoded 32 byte ed25519 seed, usually supplied through the environment
    #[serde(skip_serializing)]
    pub private_key_seed: Option<String>,

    /// Certificate published in the trust bundle
    pub certificate_path: Option<PathBuf>,

    /// Key identifier carried in every signature info
    pub verification_key_id: String,

    /// Key version carried in every signature info
    pub verification_key_version: String,
}

impl SigningConfig {
    pub fn with_seed(seed: impl Into<String>) -> Self {
        SigningConfig {
            private_key_seed: Some(seed.into()),
            verification_key_id: "keyfed".to_string(),
            verification_key_version: "v1".to_string(),
            ..Default::default()
        }
    }
}

/// Key store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Volatile store, for tests and local development
    Memory,

    /// SQLite database file
    Sqlite { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for a single delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Signing key configuration
    pub signing: SigningConfig,

    /// Key store configuration
    pub store: StoreConfig,

    /// Retry policy for remote calls
    pub retry: RetryConfig,

    /// Days keys are kept before the retention sweep removes them
    pub retention_days: i64,

    /// Default log level, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            signing: SigningConfig::default(),
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            retention_days: 14,
            log_level: "info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path)
    }

    /// Save configuration to a JSON file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }

    /// Create a development configuration
    pub fn development() -> Self {
        let mut config = Self::default();
        config.log_level = "debug".to_string();
        config.store = StoreConfig::Sqlite {
            path: PathBuf::from("keyfed.db"),
        };
        config
    }

    /// Create a testing configuration
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.log_level = "debug".to_string();
        config.store = StoreConfig::Memory;
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        config
    }

    /// Parsed `log_level`
    pub fn log_filter(&self) -> Result<LevelFilter> {
        self.log_level.parse().map_err(|_| {
            CoreError::ConfigError(format!("Invalid log_level: {:?}", self.log_level))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.log_filter()?;
        if self.retention_days < 0 {
            return Err(CoreError::ConfigError(format!(
                "retention_days must not be negative, got {}",
                self.retention_days
            )));
        }
        if self.signing.private_key_path.is_none() && self.signing.private_key_seed.is_none() {
            return Err(CoreError::ConfigError(
                "Either signing.private_key_path or signing.private_key_seed is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read any JSON configuration document
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let file = std::fs::File::open(path.as_ref())?;
    let config = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(config)
}

/// Write any JSON configuration document
pub fn save_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
