//! Distribution runner
//!
//! One run moves through `Loading -> Partitioning -> Signing -> Publishing ->
//! Rotating` and returns to `Idle`. Signing happens while the tree is
//! prepared; nothing touches the publish root before `Publishing`. A failed
//! or cancelled run drops its staging directory and leaves `current` as it
//! was.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDateTime};
use keyfed_core::structure::IndexStack;
use keyfed_core::utils::{self, RunLock};
use keyfed_core::{DiagnosisKey, KeyRecordStore, SigningProvider};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::assembly::{build_tree, tree_digest};
use crate::bundler::DiagnosisKeyBundler;
use crate::config::DistributionConfig;
use crate::error::{DistributionError, Result};
use crate::publish::Publisher;

/// Stage of the distribution run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Partitioning,
    Signing,
    Publishing,
    Rotating,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub distribution_time: NaiveDateTime,
    pub keys_loaded: usize,
    pub files_published: usize,
    /// Hex digest over every published path and its bytes
    pub digest: String,
    pub generation: String,
    pub removed_generations: Vec<String>,
    pub keys_removed_by_retention: usize,
    /// Rotation or retention failures after the generation went live
    pub housekeeping_errors: Vec<String>,
}

/// Publishes the keys of a store as a signed export tree
pub struct DistributionRunner<S: KeyRecordStore + ?Sized> {
    store: Arc<S>,
    signer: Arc<SigningProvider>,
    config: DistributionConfig,
    publisher: Publisher,
    lock: RunLock,
    state: Mutex<RunState>,
}

impl<S: KeyRecordStore + ?Sized> DistributionRunner<S> {
    pub fn new(store: Arc<S>, signer: Arc<SigningProvider>, config: DistributionConfig) -> Self {
        let publisher = Publisher::new(config.publish_root.clone(), config.retained_generations);
        DistributionRunner {
            store,
            signer,
            config,
            publisher,
            lock: RunLock::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn state(&self) -> RunState {
        self.state.lock().map(|s| *s).unwrap_or(RunState::Idle)
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    fn enter(&self, state: RunState, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DistributionError::Cancelled);
        }
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        info!("Distribution run: {}", state);
        Ok(())
    }

    /// Publish every hour before the current one
    pub fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_at(utils::current_hour(), cancel)
    }

    /// Publish every hour before `distribution_time`
    pub fn run_at(&self, distribution_time: NaiveDateTime, cancel: &CancellationToken) -> Result<RunReport> {
        let _guard = self.lock.try_acquire().ok_or(DistributionError::Locked)?;
        let _file_lock = self.publisher.lock()?;

        let result = self.execute(utils::truncate_to_hour(distribution_time), cancel);
        if let Err(e) = &result {
            error!("Distribution run failed in {}: {}", self.state(), e);
        }
        if let Ok(mut state) = self.state.lock() {
            *state = RunState::Idle;
        }
        result
    }

    fn execute(&self, distribution_time: NaiveDateTime, cancel: &CancellationToken) -> Result<RunReport> {
        self.enter(RunState::Loading, cancel)?;
        let retention_days = self.config.core.retention_days;
        let since = utils::epoch_hours(distribution_time - Duration::days(retention_days));
        let keys = self
            .store
            .find_since(since)?
            .collect::<keyfed_core::Result<Vec<DiagnosisKey>>>()?;
        let keys_loaded = keys.len();
        info!("Loaded {} keys submitted since hour {}", keys_loaded, since);

        self.enter(RunState::Partitioning, cancel)?;
        let bundle = Arc::new(DiagnosisKeyBundler::new(&self.config).bundle(keys, distribution_time));

        self.enter(RunState::Signing, cancel)?;
        let staging_label = distribution_time.format("%Y-%m-%d-%H").to_string();
        let staging = self.publisher.begin(&staging_label)?;
        let (mut tree, root) = build_tree(bundle, self.signer.clone(), &self.config, staging.path())?;
        tree.prepare(root, &IndexStack::new())?;
        let digest = hex::encode(tree_digest(&tree, root)?);
        let mut files_published = 0;
        tree.visit_files(root, &mut |_, _| {
            files_published += 1;
            Ok(())
        })?;

        self.enter(RunState::Publishing, cancel)?;
        tree.write(root)?;
        if cancel.is_cancelled() {
            return Err(DistributionError::Cancelled);
        }
        let generation = format!("{}-{}", staging_label, &digest[..12]);
        self.publisher.commit(staging, &generation)?;

        // The new generation is live; from here on failures are only reported
        if let Ok(mut state) = self.state.lock() {
            *state = RunState::Rotating;
        }
        info!("Distribution run: {}", RunState::Rotating);
        let mut housekeeping_errors = Vec::new();
        let removed_generations = self.publisher.rotate().unwrap_or_else(|e| {
            warn!("Rotating generations failed: {}", e);
            housekeeping_errors.push(e.to_string());
            Vec::new()
        });
        let keys_removed_by_retention = self
            .store
            .apply_retention_at(retention_days, distribution_time)
            .unwrap_or_else(|e| {
                warn!("Key retention failed: {}", e);
                housekeeping_errors.push(e.to_string());
                0
            });

        info!(
            "Published {} files as generation {} ({} keys, digest {})",
            files_published, generation, keys_loaded, digest
        );
        Ok(RunReport {
            distribution_time,
            keys_loaded,
            files_published,
            digest,
            generation,
            removed_generations,
            keys_removed_by_retention,
            housekeeping_errors,
        })
    }
}
