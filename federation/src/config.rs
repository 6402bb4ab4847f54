//! Configuration for the federation client

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyfed_core::config::{load_json, save_json, CoreConfig, SigningConfig};
use keyfed_core::error::{CoreError, Result};
use keyfed_core::models::validate_country_code;
use serde::{Deserialize, Serialize};

/// Connection to the federation gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            base_url: "http://localhost:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Callback endpoint announced to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Nothing is uploaded while fewer keys are pending
    pub min_batch_key_count: usize,
    pub max_batch_key_count: usize,
    /// Advance the cursor over the acknowledged prefix of a partially accepted batch
    pub allow_partial_acknowledgement: bool,
    /// Minutes a key must be expired before it is shared
    pub expiry_policy_minutes: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            min_batch_key_count: 1,
            max_batch_key_count: 4000,
            allow_partial_acknowledgement: true,
            expiry_policy_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Days before today whose batches are fetched, today included
    pub window_days: i64,
    /// Base64 ed25519 public keys, by peer name. When empty, batch
    /// signatures are not checked.
    pub trusted_peer_keys: BTreeMap<String, String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            window_days: 1,
            trusted_peer_keys: BTreeMap::new(),
        }
    }
}

impl DownloadConfig {
    /// Decoded trusted keys
    pub fn trusted_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.trusted_peer_keys
            .iter()
            .map(|(peer, key)| {
                STANDARD.decode(key.trim()).map_err(|e| {
                    CoreError::ConfigError(format!("Invalid public key for peer {}: {}", peer, e))
                })
            })
            .collect()
    }
}

/// Federation client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Signing, store, retry and retention settings
    pub core: CoreConfig,
    pub gateway: GatewayConfig,
    /// Country this backend uploads keys for
    pub origin_country: String,
    pub callback: CallbackConfig,
    pub upload: UploadConfig,
    pub download: DownloadConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            core: CoreConfig::default(),
            gateway: GatewayConfig::default(),
            origin_country: "DE".to_string(),
            callback: CallbackConfig::default(),
            upload: UploadConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl FederationConfig {
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
        FederationConfig {
            core: CoreConfig::development(),
            ..Default::default()
        }
    }

    /// Create a testing configuration
    pub fn testing() -> Self {
        let mut core = CoreConfig::testing();
        core.signing = SigningConfig::with_seed("AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=");
        FederationConfig {
            core,
            gateway: GatewayConfig {
                connect_timeout: Duration::from_secs(1),
                request_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        validate_country_code(&self.origin_country).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        if self.upload.min_batch_key_count == 0
            || self.upload.min_batch_key_count > self.upload.max_batch_key_count
        {
            return Err(CoreError::ConfigError(format!(
                "Upload batch sizes must satisfy 1 <= min ({}) <= max ({})",
                self.upload.min_batch_key_count, self.upload.max_batch_key_count
            )));
        }
        if self.download.window_days < 0 {
            return Err(CoreError::ConfigError(
                "download.window_days must not be negative".to_string(),
            ));
        }
        if self.callback.enabled && self.callback.url.is_empty() {
            return Err(CoreError::ConfigError(
                "callback.url is required when callback registration is enabled".to_string(),
            ));
        }
        self.download.trusted_keys()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_config_is_valid() {
        let config = FederationConfig::testing();
        assert!(config.validate().is_ok());
        assert!(config.download.trusted_keys().unwrap().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FederationConfig::testing();
        config.upload.min_batch_key_count = 10;
        config.upload.max_batch_key_count = 5;
        assert!(matches!(config.validate(), Err(CoreError::ConfigError(_))));

        let mut config = FederationConfig::testing();
        config.callback.enabled = true;
        assert!(config.validate().is_err());

        let mut config = FederationConfig::testing();
        config.download.trusted_peer_keys.insert("FR".to_string(), "not base64!".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FederationConfig =
            serde_json::from_str(r#"{"origin_country": "FR", "upload": {"max_batch_key_count": 10}}"#).unwrap();
        assert_eq!(config.origin_country, "FR");
        assert_eq!(config.upload.max_batch_key_count, 10);
        assert_eq!(config.upload.min_batch_key_count, 1);
        assert_eq!(config.download.window_days, 1);
    }
}
