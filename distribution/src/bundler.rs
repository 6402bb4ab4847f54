//! Diagnosis key bundler
//!
//! Assigns every loaded key to the country packages it belongs in and to the
//! hour at which it may be published.
//!
//! Keys are bucketed by visited country. Keys without visited countries belong
//! to the origin package. A locally originated key is only published in the
//! origin package, and a foreign key that visited the origin country is only
//! published there as well.
//!
//! For the origin package (or every package, if configured) two policies
//! apply. The expiry policy holds a key back until `expiry_policy_minutes`
//! after its rolling period ended. The shifting policy accumulates keys over
//! consecutive hours until at least `shifting_policy_threshold` keys are
//! available; hours that do not reach the threshold get an empty placeholder.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use keyfed_core::DiagnosisKey;
use log::{debug, error, warn};

use crate::config::DistributionConfig;

type HourBuckets = BTreeMap<NaiveDateTime, Vec<DiagnosisKey>>;

/// Keys of one distribution run, grouped by package and publication hour
#[derive(Debug, Clone)]
pub struct DistributionBundle {
    distribution_time: NaiveDateTime,
    packages: BTreeMap<String, HourBuckets>,
    max_keys_per_bundle: usize,
}

impl DistributionBundle {
    /// Hour the run publishes for; only earlier hours are included
    pub fn distribution_time(&self) -> NaiveDateTime {
        self.distribution_time
    }

    /// Package names, supported countries and the EU package
    pub fn countries(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    /// Dates with at least one hour entry and at most `max_keys_per_bundle` keys
    pub fn dates(&self, country: &str) -> Vec<NaiveDate> {
        let Some(hours) = self.packages.get(country) else {
            return Vec::new();
        };
        let dates: BTreeSet<NaiveDate> = hours.keys().map(|h| h.date()).collect();
        dates
            .into_iter()
            .filter(|date| self.below_maximum(self.keys_for_date(country, *date).len(), &date.to_string()))
            .collect()
    }

    /// Hours of `date`, placeholders included, with at most `max_keys_per_bundle` keys
    pub fn hours(&self, country: &str, date: NaiveDate) -> Vec<NaiveDateTime> {
        let Some(hours) = self.packages.get(country) else {
            return Vec::new();
        };
        hours
            .iter()
            .filter(|(hour, _)| hour.date() == date)
            .filter(|(hour, keys)| self.below_maximum(keys.len(), &hour.to_string()))
            .map(|(hour, _)| *hour)
            .collect()
    }

    pub fn keys_for_hour(&self, country: &str, hour: NaiveDateTime) -> &[DiagnosisKey] {
        self.packages
            .get(country)
            .and_then(|hours| hours.get(&hour))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn keys_for_date(&self, country: &str, date: NaiveDate) -> Vec<DiagnosisKey> {
        let Some(hours) = self.packages.get(country) else {
            return Vec::new();
        };
        hours
            .iter()
            .filter(|(hour, _)| hour.date() == date)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Number of keys published for `country` over all hours
    pub fn key_count(&self, country: &str) -> usize {
        self.packages
            .get(country)
            .map(|hours| hours.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn below_maximum(&self, count: usize, what: &str) -> bool {
        if count > self.max_keys_per_bundle {
            error!(
                "Number of diagnosis keys ({}) for {} exceeds the configured maximum",
                count, what
            );
            return false;
        }
        true
    }
}

/// Groups keys into publishable packages
#[derive(Debug, Clone)]
pub struct DiagnosisKeyBundler {
    origin_country: String,
    supported_countries: BTreeSet<String>,
    eu_package_name: Option<String>,
    expiry_policy_minutes: i64,
    shifting_policy_threshold: usize,
    max_keys_per_bundle: usize,
    apply_policies_for_all_countries: bool,
}

impl DiagnosisKeyBundler {
    pub fn new(config: &DistributionConfig) -> Self {
        DiagnosisKeyBundler {
            origin_country: config.origin_country.clone(),
            supported_countries: config.supported_countries.clone(),
            eu_package_name: config.eu_package_name.clone(),
            expiry_policy_minutes: config.expiry_policy_minutes,
            shifting_policy_threshold: config.shifting_policy_threshold,
            max_keys_per_bundle: config.max_keys_per_bundle,
            apply_policies_for_all_countries: config.apply_policies_for_all_countries,
        }
    }

    /// Bundle `keys` for a run publishing every hour before `distribution_time`
    pub fn bundle(
        &self,
        keys: impl IntoIterator<Item = DiagnosisKey>,
        distribution_time: NaiveDateTime,
    ) -> DistributionBundle {
        let grouped = self.group_by_visited_country(keys);

        let mut packages = BTreeMap::new();
        for (country, keys) in grouped {
            let hours = if country == self.origin_country || self.apply_policies_for_all_countries {
                self.with_policies(keys, distribution_time)
            } else {
                Self::without_policies(keys, distribution_time)
            };
            debug!("Package {} spans {} hours", country, hours.len());
            packages.insert(country, hours);
        }

        if let Some(eu) = &self.eu_package_name {
            let union = Self::union(&packages);
            packages.insert(eu.clone(), union);
        }

        DistributionBundle {
            distribution_time,
            packages,
            max_keys_per_bundle: self.max_keys_per_bundle,
        }
    }

    fn group_by_visited_country(
        &self,
        keys: impl IntoIterator<Item = DiagnosisKey>,
    ) -> BTreeMap<String, Vec<DiagnosisKey>> {
        let mut grouped: BTreeMap<String, Vec<DiagnosisKey>> = self
            .supported_countries
            .iter()
            .map(|country| (country.clone(), Vec::new()))
            .collect();

        for key in keys {
            if key.visited_countries.is_empty() {
                if let Some(bucket) = grouped.get_mut(&self.origin_country) {
                    bucket.push(key);
                }
                continue;
            }
            let targets: Vec<String> = key
                .visited_countries
                .iter()
                .filter(|visited| self.supported_countries.contains(*visited))
                .filter(|visited| self.accepts(&key, visited))
                .cloned()
                .collect();
            for target in targets {
                if let Some(bucket) = grouped.get_mut(&target) {
                    bucket.push(key.clone());
                }
            }
        }
        grouped
    }

    fn accepts(&self, key: &DiagnosisKey, visited: &str) -> bool {
        if visited == self.origin_country {
            return true;
        }
        let local = key.origin_country == self.origin_country;
        let visited_origin = key.visited_countries.contains(&self.origin_country);
        !local && !visited_origin
    }

    fn with_policies(&self, keys: Vec<DiagnosisKey>, distribution_time: NaiveDateTime) -> HourBuckets {
        let mut by_sharing_time: HourBuckets = BTreeMap::new();
        for key in keys {
            let hour = key.earliest_sharing_time(self.expiry_policy_minutes);
            by_sharing_time.entry(hour).or_default().push(key);
        }

        let mut hours = BTreeMap::new();
        let Some(earliest) = by_sharing_time.keys().next().copied() else {
            return hours;
        };

        let mut accumulator = Vec::new();
        let mut current = earliest;
        while current < distribution_time {
            if let Some(keys) = by_sharing_time.remove(&current) {
                accumulator.extend(keys);
            }
            if accumulator.len() >= self.shifting_policy_threshold {
                hours.insert(current, std::mem::take(&mut accumulator));
            } else {
                hours.insert(current, Vec::new());
            }
            current += Duration::hours(1);
        }

        let held: usize = accumulator.len() + by_sharing_time.values().map(Vec::len).sum::<usize>();
        if held > 0 {
            debug!("Holding back {} keys until a later run", held);
        }
        hours
    }

    fn without_policies(keys: Vec<DiagnosisKey>, distribution_time: NaiveDateTime) -> HourBuckets {
        let mut hours: HourBuckets = BTreeMap::new();
        for key in keys {
            let submitted = key.submission_time();
            if submitted < distribution_time {
                hours.entry(submitted).or_default().push(key);
            }
        }
        hours
    }

    fn union(packages: &BTreeMap<String, HourBuckets>) -> HourBuckets {
        let mut union: BTreeMap<NaiveDateTime, BTreeMap<Vec<u8>, DiagnosisKey>> = BTreeMap::new();
        for hours in packages.values() {
            for (hour, keys) in hours {
                let entry = union.entry(*hour).or_default();
                for key in keys {
                    entry.entry(key.key_data.clone()).or_insert_with(|| key.clone());
                }
            }
        }
        if union.is_empty() {
            warn!("EU package is empty");
        }
        union
            .into_iter()
            .map(|(hour, keys)| (hour, keys.into_values().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, key};
    use rstest::rstest;

    fn bundler(threshold: usize) -> DiagnosisKeyBundler {
        let mut config = DistributionConfig::testing("unused");
        config.supported_countries = BTreeSet::from(["DE".to_string(), "FR".to_string()]);
        config.shifting_policy_threshold = threshold;
        DiagnosisKeyBundler::new(&config)
    }

    fn key_seeds(keys: &[DiagnosisKey]) -> Vec<u8> {
        let mut seeds: Vec<u8> = keys.iter().map(|k| k.key_data[0]).collect();
        seeds.sort();
        seeds
    }

    #[rstest]
    #[case::local_key_stays_home("DE", &["DE", "FR"], &["DE"])]
    #[case::no_visited_countries("DE", &[], &["DE"])]
    #[case::foreign_key_visiting_origin("FR", &["FR", "DE"], &["DE"])]
    #[case::foreign_key_elsewhere("FR", &["FR"], &["FR"])]
    #[case::unsupported_country("IT", &["IT"], &[])]
    fn test_country_bucketing(#[case] origin: &str, #[case] visited: &[&str], #[case] expected: &[&str]) {
        let k = key(1, origin, visited, at(1, 10));
        let bundle = bundler(1).bundle(vec![k], at(2, 0));
        for country in ["DE", "FR"] {
            let published = bundle.key_count(country) == 1;
            assert_eq!(published, expected.contains(&country), "package {}", country);
        }
        assert_eq!(bundle.key_count("EUR"), if expected.is_empty() { 0 } else { 1 });
    }

    #[test]
    fn test_expiry_policy_delays_fresh_keys() {
        // rolling period ends at 2020-05-02T00:00, submitted one hour later
        let mut fresh = key(1, "DE", &["DE"], at(2, 1));
        fresh.rolling_start_interval_number = 2_647_152;
        let old = key(2, "DE", &["DE"], at(2, 1));

        let bundle = bundler(1).bundle(vec![fresh, old], at(2, 6));
        assert_eq!(key_seeds(bundle.keys_for_hour("DE", at(2, 1))), vec![2]);
        assert_eq!(key_seeds(bundle.keys_for_hour("DE", at(2, 3))), vec![1]);
    }

    #[test]
    fn test_shifting_policy_accumulates_until_threshold() {
        let keys = vec![
            key(1, "DE", &["DE"], at(1, 10)),
            key(2, "DE", &["DE"], at(1, 11)),
            key(3, "DE", &["DE"], at(1, 13)),
        ];
        let bundle = bundler(2).bundle(keys, at(1, 15));

        let hours = bundle.hours("DE", at(1, 0).date());
        assert_eq!(hours, (10..15).map(|h| at(1, h)).collect::<Vec<_>>());
        assert!(bundle.keys_for_hour("DE", at(1, 10)).is_empty());
        assert_eq!(key_seeds(bundle.keys_for_hour("DE", at(1, 11))), vec![1, 2]);
        assert!(bundle.keys_for_hour("DE", at(1, 12)).is_empty());
        // key 3 alone stays below the threshold and is held back
        assert_eq!(bundle.key_count("DE"), 2);
    }

    #[test]
    fn test_only_hours_before_distribution_time() {
        let keys = vec![key(1, "DE", &["DE"], at(1, 10)), key(2, "FR", &["FR"], at(1, 12))];
        let bundle = bundler(1).bundle(keys, at(1, 12));
        assert_eq!(bundle.key_count("DE"), 1);
        assert_eq!(bundle.key_count("FR"), 0);
    }

    #[test]
    fn test_eu_package_is_union_without_duplicates() {
        let keys = vec![
            key(1, "DE", &["DE"], at(1, 10)),
            key(2, "FR", &["FR"], at(1, 10)),
            key(3, "FR", &["FR"], at(3, 10)),
        ];
        let bundle = bundler(1).bundle(keys, at(4, 0));
        assert_eq!(key_seeds(bundle.keys_for_hour("EUR", at(1, 10))), vec![1, 2]);
        assert_eq!(bundle.countries(), vec!["DE", "EUR", "FR"]);
        assert_eq!(bundle.dates("EUR"), vec![at(1, 0).date(), at(2, 0).date(), at(3, 0).date()]);
    }

    #[test]
    fn test_oversized_partitions_are_dropped() {
        let mut config = DistributionConfig::testing("unused");
        config.max_keys_per_bundle = 1;
        let keys = vec![
            key(1, "DE", &["DE"], at(1, 10)),
            key(2, "DE", &["DE"], at(1, 10)),
            key(3, "DE", &["DE"], at(2, 10)),
        ];
        let bundle = DiagnosisKeyBundler::new(&config).bundle(keys, at(3, 0));
        assert_eq!(bundle.dates("DE"), vec![at(2, 0).date()]);
        assert!(!bundle.hours("DE", at(1, 0).date()).contains(&at(1, 10)));
    }
}
