//! Publish target
//!
//! Layout below the publish root:
//!
//! ```text
//! staging/<label>/       tree being written by the active run
//! generations/<label>/   complete, immutable generations
//! current                symlink to the generation devices are served
//! .lock                  held while a run is active
//! ```
//!
//! A run writes into staging, renames the staging directory into
//! `generations`, then replaces `current` by renaming a freshly created link
//! over it. Readers therefore see either the old or the new generation, never
//! a partial one.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{to_publish_error, DistributionError, Result};

pub const CURRENT: &str = "current";
pub const GENERATIONS: &str = "generations";
pub const STAGING: &str = "staging";
pub const LOCK_FILE: &str = ".lock";

/// Manages staging, generations and the `current` pointer below a root
#[derive(Debug, Clone)]
pub struct Publisher {
    root: PathBuf,
    retained_generations: usize,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>, retained_generations: usize) -> Self {
        Publisher {
            root: root.into(),
            retained_generations: retained_generations.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the cross-process publish lock
    pub fn lock(&self) -> Result<PublishLock> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(PublishLock { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("Publish lock {} is held", path.display());
                Err(DistributionError::Locked)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create an empty staging directory for `label`
    pub fn begin(&self, label: &str) -> Result<Staging> {
        let path = self.root.join(STAGING).join(label);
        if path.exists() {
            warn!("Removing leftover staging directory {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Staging {
            path,
            committed: false,
        })
    }

    /// Move `staging` into the generation `label` and point `current` at it.
    /// An existing generation with the same label is kept and the staged
    /// copy discarded.
    pub fn commit(&self, mut staging: Staging, label: &str) -> Result<PathBuf> {
        let generations = self.root.join(GENERATIONS);
        fs::create_dir_all(&generations).map_err(to_publish_error)?;
        let target = generations.join(label);

        if target.exists() {
            info!("Generation {} already published", label);
        } else {
            fs::rename(&staging.path, &target).map_err(to_publish_error)?;
            staging.committed = true;
        }

        self.point_current_at(label)?;
        info!("Published generation {}", label);
        Ok(target)
    }

    #[cfg(unix)]
    fn point_current_at(&self, label: &str) -> Result<()> {
        let link = self.root.join(format!("{}.tmp", CURRENT));
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).map_err(to_publish_error)?;
        }
        let relative = Path::new(GENERATIONS).join(label);
        std::os::unix::fs::symlink(&relative, &link).map_err(to_publish_error)?;
        fs::rename(&link, self.root.join(CURRENT)).map_err(to_publish_error)
    }

    #[cfg(not(unix))]
    fn point_current_at(&self, label: &str) -> Result<()> {
        let pointer = self.root.join(format!("{}.tmp", CURRENT));
        fs::write(&pointer, label).map_err(to_publish_error)?;
        fs::rename(&pointer, self.root.join(CURRENT)).map_err(to_publish_error)
    }

    /// Label of the generation `current` points to
    pub fn current(&self) -> Option<String> {
        let current = self.root.join(CURRENT);
        #[cfg(unix)]
        let label = fs::read_link(&current)
            .ok()
            .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));
        #[cfg(not(unix))]
        let label = fs::read_to_string(&current).ok();
        label
    }

    /// Published generation labels, oldest first
    pub fn generations(&self) -> Result<Vec<String>> {
        let dir = self.root.join(GENERATIONS);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut labels = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                labels.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Delete all but the newest `retained_generations` generations. The
    /// generation `current` points to is never deleted.
    pub fn rotate(&self) -> Result<Vec<String>> {
        let labels = self.generations()?;
        let current = self.current();
        let excess = labels.len().saturating_sub(self.retained_generations);

        let mut removed = Vec::new();
        for label in labels.into_iter().take(excess) {
            if current.as_deref() == Some(label.as_str()) {
                continue;
            }
            fs::remove_dir_all(self.root.join(GENERATIONS).join(&label)).map_err(to_publish_error)?;
            debug!("Removed generation {}", label);
            removed.push(label);
        }
        Ok(removed)
    }
}

/// Directory a run writes into. Removed on drop unless committed.
#[derive(Debug)]
pub struct Staging {
    path: PathBuf,
    committed: bool,
}

impl Staging {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging directory {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Lock file removed on drop
#[derive(Debug)]
pub struct PublishLock {
    path: PathBuf,
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release publish lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publish(publisher: &Publisher, label: &str, content: &str) -> PathBuf {
        let staging = publisher.begin(label).unwrap();
        fs::write(staging.path().join("file"), content).unwrap();
        publisher.commit(staging, label).unwrap()
    }

    #[test]
    fn test_commit_swaps_current() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        publish(&publisher, "2020-05-01-10-aaaa", "one");
        assert_eq!(publisher.current().as_deref(), Some("2020-05-01-10-aaaa"));
        assert_eq!(fs::read_to_string(dir.path().join("current/file")).unwrap(), "one");

        publish(&publisher, "2020-05-01-11-bbbb", "two");
        assert_eq!(fs::read_to_string(dir.path().join("current/file")).unwrap(), "two");
        assert!(!dir.path().join(STAGING).join("2020-05-01-11-bbbb").exists());
    }

    #[test]
    fn test_dropped_staging_is_removed() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        publish(&publisher, "a", "one");

        let staging = publisher.begin("b").unwrap();
        let path = staging.path().to_path_buf();
        fs::write(path.join("file"), "partial").unwrap();
        drop(staging);

        assert!(!path.exists());
        assert_eq!(publisher.current().as_deref(), Some("a"));
        assert_eq!(publisher.generations().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_republishing_same_label_keeps_generation() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        publish(&publisher, "a", "one");
        publish(&publisher, "a", "one");
        assert_eq!(publisher.generations().unwrap(), vec!["a"]);
        assert_eq!(publisher.current().as_deref(), Some("a"));
    }

    #[test]
    fn test_rotate_keeps_newest_and_current() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 2);
        for label in ["a", "b", "c", "d"] {
            publish(&publisher, label, label);
        }
        assert_eq!(publisher.rotate().unwrap(), vec!["a", "b"]);
        assert_eq!(publisher.generations().unwrap(), vec!["c", "d"]);

        // current pointing at an old generation survives rotation
        publish(&publisher, "a", "a");
        publish(&publisher, "e", "e");
        publisher.point_current_at("a").unwrap();
        assert_eq!(publisher.rotate().unwrap(), vec!["c"]);
        assert_eq!(publisher.generations().unwrap(), vec!["a", "d", "e"]);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 1);
        let lock = publisher.lock().unwrap();
        assert!(matches!(publisher.lock(), Err(DistributionError::Locked)));
        drop(lock);
        assert!(publisher.lock().is_ok());
    }
}
