//! Configuration for the distribution service
//!
//! Everything that shapes the published tree lives here: the path layout,
//! the countries served, the sharing policies applied by the bundler and how
//! many generations are retained on disk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use keyfed_core::config::{load_json, save_json, CoreConfig, SigningConfig, StoreConfig};
use keyfed_core::error::{CoreError, Result};
use keyfed_core::models::validate_country_code;
use serde::{Deserialize, Serialize};

/// What to publish for an hour or day without keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyPartitionPolicy {
    /// Leave the partition out of the tree
    Omit,

    /// Publish an empty, signed export
    Placeholder,
}

/// Directory names of the published layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub version: String,
    pub version_v1: String,
    pub diagnosis_keys: String,
    pub country: String,
    pub date: String,
    pub hour: String,
    /// File name of the certificate below `version/v1`
    pub trust_bundle: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            version: "version".to_string(),
            version_v1: "v1".to_string(),
            diagnosis_keys: "diagnosis-keys".to_string(),
            country: "country".to_string(),
            date: "date".to_string(),
            hour: "hour".to_string(),
            trust_bundle: "certificate.pem".to_string(),
        }
    }
}

/// Distribution service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Signing, store, retry and retention settings
    pub core: CoreConfig,

    /// Directory holding `current`, the generations and the staging area
    pub publish_root: PathBuf,

    pub paths: PathConfig,

    /// Country this backend is the origin for
    pub origin_country: String,

    /// Countries a package is published for
    pub supported_countries: BTreeSet<String>,

    /// Name of the package holding the union of all countries, if any
    pub eu_package_name: Option<String>,

    /// Minutes a key must be expired before it is published
    pub expiry_policy_minutes: i64,

    /// Minimum number of keys an hour must accumulate before it is published
    pub shifting_policy_threshold: usize,

    /// Hours and days above this many keys are not published
    pub max_keys_per_bundle: usize,

    /// Apply expiry and shifting policies to foreign buckets too
    pub apply_policies_for_all_countries: bool,

    pub empty_partition_policy: EmptyPartitionPolicy,

    /// Publish a day aggregate for every date except the most recent one
    pub day_aggregates: bool,

    /// Number of published generations kept on disk
    pub retained_generations: usize,

    /// Build country subtrees on separate threads
    pub parallel_countries: bool,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            core: CoreConfig::default(),
            publish_root: PathBuf::from("published"),
            paths: PathConfig::default(),
            origin_country: "DE".to_string(),
            supported_countries: BTreeSet::from(["DE".to_string()]),
            eu_package_name: Some("EUR".to_string()),
            expiry_policy_minutes: 120,
            shifting_policy_threshold: 140,
            max_keys_per_bundle: 600_000,
            apply_policies_for_all_countries: false,
            empty_partition_policy: EmptyPartitionPolicy::Placeholder,
            day_aggregates: true,
            retained_generations: 3,
            parallel_countries: true,
        }
    }
}

impl DistributionConfig {
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
        DistributionConfig {
            core: CoreConfig::development(),
            shifting_policy_threshold: 1,
            ..Default::default()
        }
    }

    /// Create a testing configuration publishing below `publish_root`
    pub fn testing(publish_root: impl Into<PathBuf>) -> Self {
        let mut core = CoreConfig::testing();
        core.signing = SigningConfig::with_seed("AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=");
        core.store = StoreConfig::Memory;
        DistributionConfig {
            core,
            publish_root: publish_root.into(),
            shifting_policy_threshold: 1,
            parallel_countries: false,
            ..Default::default()
        }
    }

    /// Countries with a package in the tree, the EU package included
    pub fn packaged_countries(&self) -> BTreeSet<String> {
        let mut countries = self.supported_countries.clone();
        if let Some(eu) = &self.eu_package_name {
            countries.insert(eu.clone());
        }
        countries
    }

    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        validate_country_code(&self.origin_country).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        if !self.supported_countries.contains(&self.origin_country) {
            return Err(CoreError::ConfigError(format!(
                "Origin country {} must be one of the supported countries",
                self.origin_country
            )));
        }
        for country in &self.supported_countries {
            validate_country_code(country).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        }
        if self.expiry_policy_minutes < 0 {
            return Err(CoreError::ConfigError(
                "expiry_policy_minutes must not be negative".to_string(),
            ));
        }
        if self.retained_generations == 0 {
            return Err(CoreError::ConfigError(
                "retained_generations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = DistributionConfig::default();
        assert_eq!(config.expiry_policy_minutes, 120);
        assert_eq!(config.shifting_policy_threshold, 140);
        assert_eq!(config.empty_partition_policy, EmptyPartitionPolicy::Placeholder);
        assert_eq!(
            config.packaged_countries(),
            BTreeSet::from(["DE".to_string(), "EUR".to_string()])
        );
    }

    #[test]
    fn test_file_round_trip_keeps_policies() {
        let file = NamedTempFile::new().unwrap();
        let mut config = DistributionConfig::testing("out");
        config.empty_partition_policy = EmptyPartitionPolicy::Omit;
        config.retained_generations = 5;
        config.to_file(file.path()).unwrap();

        let loaded = DistributionConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.empty_partition_policy, EmptyPartitionPolicy::Omit);
        assert_eq!(loaded.retained_generations, 5);
        assert_eq!(loaded.publish_root, PathBuf::from("out"));
        // the seed is never written back
        assert!(loaded.core.signing.private_key_seed.is_none());
    }

    #[test]
    fn test_validate() {
        let config = DistributionConfig::testing("out");
        assert!(config.validate().is_ok());

        let mut config = DistributionConfig::testing("out");
        config.origin_country = "FR".to_string();
        assert!(matches!(config.validate(), Err(CoreError::ConfigError(_))));

        let mut config = DistributionConfig::testing("out");
        config.retained_generations = 0;
        assert!(config.validate().is_err());
    }
}
