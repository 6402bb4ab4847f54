//! Tree assembly
//!
//! Builds the writable tree for one distribution run:
//!
//! ```text
//! version/v1/certificate.pem
//! version/v1/diagnosis-keys/country/{country}/date/{yyyy-mm-dd}/export.bin|export.sig
//! version/v1/diagnosis-keys/country/{country}/date/{yyyy-mm-dd}/hour/{h}/export.bin|export.sig
//! ```
//!
//! Every directory also carries an `index` manifest. The day level export is
//! only published for dates that are complete, that is every date of a
//! country except the most recent one.

pub mod export;

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use keyfed_core::crypto::secure_hash;
use keyfed_core::error::{CoreError, Result};
use keyfed_core::models::domains;
use keyfed_core::structure::{IndexStack, IndexValue, NodeId, StaticFile, Tree};
use keyfed_core::SigningProvider;
use log::debug;

use crate::bundler::DistributionBundle;
use crate::config::{DistributionConfig, EmptyPartitionPolicy};
use export::{ExportFile, SignatureFile, EXPORT_FILE_NAME, SIGNATURE_FILE_NAME};

/// Partition a node was generated for, read from the index path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub country: String,
    pub date: Option<NaiveDate>,
    pub hour: Option<NaiveDateTime>,
}

impl Partition {
    /// Read `country[/date[/hour]]` from the bottom of the stack upwards
    pub fn from_stack(stack: &IndexStack) -> Result<Self> {
        let path = stack.to_vec();
        let country = path
            .first()
            .ok_or(CoreError::EmptyStackError)?
            .as_text()?
            .to_string();
        let date = path.get(1).map(|v| v.as_date()).transpose()?;
        let hour = path.get(2).map(|v| v.as_hour()).transpose()?;
        Ok(Partition { country, date, hour })
    }

    fn date(&self) -> Result<NaiveDate> {
        self.date.ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!("No date partition below {}", self.country))
        })
    }

    fn hour(&self) -> Result<NaiveDateTime> {
        self.hour.ok_or_else(|| {
            CoreError::StructuralIntegrityError(format!("No hour partition below {}", self.country))
        })
    }
}

/// Build the unprepared tree rooted at `location`
pub fn build_tree(
    bundle: Arc<DistributionBundle>,
    signer: Arc<SigningProvider>,
    config: &DistributionConfig,
    location: &Path,
) -> Result<(Tree, NodeId)> {
    let paths = &config.paths;
    let mut tree = Tree::new();
    let root = tree.root(location);
    let version = tree.directory(&paths.version);
    let v1 = tree.directory(&paths.version_v1);
    let trust_bundle = tree.file(&paths.trust_bundle, StaticFile(signer.certificate().to_vec()));
    let diagnosis_keys = tree.directory(&paths.diagnosis_keys);

    let countries = bundle.countries();
    let country = tree.index_directory(
        &paths.country,
        move |_: &IndexStack| Ok(countries.iter().cloned().map(IndexValue::Text).collect()),
        |value| value.to_string(),
    );
    tree.set_parallel(country, config.parallel_countries)?;

    let layout = Layout {
        bundle,
        signer,
        date_name: paths.date.clone(),
        hour_name: paths.hour.clone(),
        empty_partitions: config.empty_partition_policy,
        day_aggregates: config.day_aggregates,
    };
    tree.add_to_all(country, move |tree, dir, _stack| layout.date_directory(tree, dir))?;

    tree.add_child(root, version)?;
    tree.add_child(version, v1)?;
    tree.add_child(v1, trust_bundle)?;
    tree.add_child(v1, diagnosis_keys)?;
    tree.add_child(diagnosis_keys, country)?;
    Ok((tree, root))
}

/// Templates shared by every country subtree
#[derive(Clone)]
struct Layout {
    bundle: Arc<DistributionBundle>,
    signer: Arc<SigningProvider>,
    date_name: String,
    hour_name: String,
    empty_partitions: EmptyPartitionPolicy,
    day_aggregates: bool,
}

impl Layout {
    fn publishes(&self, keys: usize) -> bool {
        keys > 0 || self.empty_partitions == EmptyPartitionPolicy::Placeholder
    }

    fn date_directory(&self, tree: &mut Tree, country_dir: NodeId) -> Result<()> {
        let dates_layout = self.clone();
        let dates = tree.index_directory(
            &self.date_name,
            move |stack: &IndexStack| {
                let partition = Partition::from_stack(stack)?;
                let bundle = &dates_layout.bundle;
                Ok(bundle
                    .dates(&partition.country)
                    .into_iter()
                    .filter(|date| dates_layout.publishes(bundle.keys_for_date(&partition.country, *date).len()))
                    .map(IndexValue::Date)
                    .collect())
            },
            |value| value.to_string(),
        );
        let layout = self.clone();
        tree.add_to_all(dates, move |tree, dir, stack| layout.date_contents(tree, dir, stack))?;
        tree.add_child(country_dir, dates)
    }

    fn date_contents(&self, tree: &mut Tree, date_dir: NodeId, stack: &IndexStack) -> Result<()> {
        let partition = Partition::from_stack(stack)?;
        let date = partition.date()?;

        let hours_layout = self.clone();
        let hours = tree.index_directory(
            &self.hour_name,
            move |stack: &IndexStack| {
                let partition = Partition::from_stack(stack)?;
                let bundle = &hours_layout.bundle;
                Ok(bundle
                    .hours(&partition.country, partition.date()?)
                    .into_iter()
                    .filter(|hour| hours_layout.publishes(bundle.keys_for_hour(&partition.country, *hour).len()))
                    .map(IndexValue::Hour)
                    .collect())
            },
            |value| value.to_string(),
        );
        let layout = self.clone();
        tree.add_to_all(hours, move |tree, dir, stack| layout.hour_contents(tree, dir, stack))?;
        tree.add_child(date_dir, hours)?;

        let latest = self.bundle.dates(&partition.country).last().copied();
        if self.day_aggregates && latest != Some(date) {
            let keys = self.bundle.keys_for_date(&partition.country, date);
            debug!("Aggregating {} keys for {} {}", keys.len(), partition.country, date);
            let start = date.and_time(chrono::NaiveTime::MIN);
            self.export_pair(tree, date_dir, keys, start, start + Duration::days(1), &partition.country)?;
        }
        Ok(())
    }

    fn hour_contents(&self, tree: &mut Tree, hour_dir: NodeId, stack: &IndexStack) -> Result<()> {
        let partition = Partition::from_stack(stack)?;
        let hour = partition.hour()?;
        let keys = self.bundle.keys_for_hour(&partition.country, hour).to_vec();
        self.export_pair(tree, hour_dir, keys, hour, hour + Duration::hours(1), &partition.country)
    }

    fn export_pair(
        &self,
        tree: &mut Tree,
        dir: NodeId,
        keys: Vec<keyfed_core::DiagnosisKey>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        region: &str,
    ) -> Result<()> {
        let export = tree.file(
            EXPORT_FILE_NAME,
            ExportFile::new(keys, start, end, region, self.signer.clone()),
        );
        let signature = tree.file(SIGNATURE_FILE_NAME, SignatureFile::new(self.signer.clone()));
        tree.add_child(dir, export)?;
        tree.add_child(dir, signature)
    }
}

/// Digest over every `(path, bytes)` pair `write` would produce below `root`.
/// Two runs publishing the same files produce the same digest.
pub fn tree_digest(tree: &Tree, root: NodeId) -> Result<[u8; 32]> {
    let mut file_hashes = Vec::new();
    tree.visit_files(root, &mut |path, bytes| {
        let path = path.to_string_lossy();
        let mut entry = Vec::with_capacity(path.len() + 1 + bytes.len());
        entry.extend_from_slice(path.as_bytes());
        entry.push(0);
        entry.extend_from_slice(bytes);
        file_hashes.extend_from_slice(&secure_hash(domains::PUBLISHED_FILE, &entry));
        Ok(())
    })?;
    Ok(secure_hash(domains::PUBLISHED_TREE, &file_hashes))
}

#[cfg(test)]
mod tests {
    use super::export::{KeyExport, SignatureList};
    use super::*;
    use crate::bundler::DiagnosisKeyBundler;
    use crate::testing::{at, key, signer};
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    fn prepared(config: &DistributionConfig, dir: &Path) -> (Tree, NodeId) {
        let keys = vec![
            key(1, "DE", &["DE"], at(1, 10)),
            key(2, "DE", &["DE"], at(1, 12)),
            key(3, "DE", &["DE"], at(2, 9)),
        ];
        let bundle = DiagnosisKeyBundler::new(config).bundle(keys, at(2, 12));
        let (mut tree, root) = build_tree(Arc::new(bundle), Arc::new(signer()), config, dir).unwrap();
        tree.prepare(root, &IndexStack::new()).unwrap();
        (tree, root)
    }

    fn country_dir(dir: &Path, country: &str) -> std::path::PathBuf {
        dir.join("version/v1/diagnosis-keys/country").join(country)
    }

    #[test]
    fn test_layout_and_manifests() {
        let dir = TempDir::new().unwrap();
        let config = DistributionConfig::testing(dir.path());
        let (tree, root) = prepared(&config, dir.path());
        tree.write(root).unwrap();

        let de = country_dir(dir.path(), "DE");
        let countries = fs::read_to_string(dir.path().join("version/v1/diagnosis-keys/country/index")).unwrap();
        assert_eq!(countries, r#"["DE","EUR"]"#);
        let dates = fs::read_to_string(de.join("date/index")).unwrap();
        assert_eq!(dates, r#"["2020-05-01","2020-05-02"]"#);
        assert!(de.join("date/2020-05-01/hour/10/export.bin").is_file());
        assert!(de.join("date/2020-05-01/hour/10/export.sig").is_file());
        assert!(dir.path().join("version/v1/certificate.pem").is_file());
    }

    #[test]
    fn test_every_key_in_exactly_one_hour_leaf() {
        let dir = TempDir::new().unwrap();
        let config = DistributionConfig::testing(dir.path());
        let (tree, root) = prepared(&config, dir.path());

        let mut seen = Vec::new();
        tree.visit_files(root, &mut |path, bytes| {
            let path = path.to_string_lossy();
            if path.contains("/country/DE/") && path.contains("/hour/") && path.ends_with(EXPORT_FILE_NAME) {
                let export = KeyExport::from_bytes(bytes)?;
                seen.extend(export.keys.iter().map(|k| k.key_data[0]));
            }
            Ok(())
        })
        .unwrap();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_day_aggregate_skips_latest_date() {
        let dir = TempDir::new().unwrap();
        let config = DistributionConfig::testing(dir.path());
        let (tree, root) = prepared(&config, dir.path());
        tree.write(root).unwrap();

        let de = country_dir(dir.path(), "DE");
        let aggregate = fs::read(de.join("date/2020-05-01/export.bin")).unwrap();
        let export = KeyExport::from_bytes(&aggregate).unwrap();
        assert_eq!(export.keys.len(), 2);
        assert_eq!(export.end_timestamp - export.start_timestamp, 86_400);
        assert!(!de.join("date/2020-05-02/export.bin").exists());
    }

    #[rstest]
    #[case::omit(EmptyPartitionPolicy::Omit, false)]
    #[case::placeholder(EmptyPartitionPolicy::Placeholder, true)]
    fn test_empty_partition_policy(#[case] policy: EmptyPartitionPolicy, #[case] published: bool) {
        let dir = TempDir::new().unwrap();
        let mut config = DistributionConfig::testing(dir.path());
        config.empty_partition_policy = policy;
        let (tree, root) = prepared(&config, dir.path());
        tree.write(root).unwrap();

        // 11:00 on day one has no keys
        let empty_hour = country_dir(dir.path(), "DE").join("date/2020-05-01/hour/11");
        assert_eq!(empty_hour.join(EXPORT_FILE_NAME).is_file(), published);
        if published {
            let bytes = fs::read(empty_hour.join(EXPORT_FILE_NAME)).unwrap();
            assert!(KeyExport::from_bytes(&bytes).unwrap().keys.is_empty());
            let signature = SignatureList::from_bytes(&fs::read(empty_hour.join(SIGNATURE_FILE_NAME)).unwrap()).unwrap();
            assert!(signer().verify(&bytes, &signature.signatures[0].signature));
        }
    }

    #[test]
    fn test_parallel_build_has_same_digest() {
        let dir = TempDir::new().unwrap();
        let mut config = DistributionConfig::testing(dir.path());
        let (tree, root) = prepared(&config, dir.path());
        let sequential = tree_digest(&tree, root).unwrap();

        config.parallel_countries = true;
        let (tree, root) = prepared(&config, dir.path());
        assert_eq!(tree_digest(&tree, root).unwrap(), sequential);
    }

    #[test]
    fn test_partition_from_stack() {
        let stack = IndexStack::new()
            .push(IndexValue::Text("DE".to_string()))
            .push(IndexValue::Date(at(1, 0).date()))
            .push(IndexValue::Hour(at(1, 7)));
        let partition = Partition::from_stack(&stack).unwrap();
        assert_eq!(partition.country, "DE");
        assert_eq!(partition.hour, Some(at(1, 7)));
        assert!(Partition::from_stack(&IndexStack::new()).is_err());
    }
}
