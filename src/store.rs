// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Recovery record persistence.
//!
//! Staging and unstaging a repository may happen in two separate invocations
//! of sideloader. The __recovery store__ remembers what the stage step needs
//! to hand over to the unstage step, i.e., the branch that was checked out
//! before staging, so that a later process can put the repository back.
//!
//! # Recovery Store Layout
//!
//! Each repository gets its own record file inside the recovery directory,
//! which defaults to `$HOME/.sideloader/recovery`. The file name is derived
//! from a SHA-256 digest of the repository's canonical path, so sessions on
//! different repositories never share a slot. Two sessions on the _same_
//! repository still share one slot, and that is not supported.
//!
//! A record file holds one optional field, `current_branch`. Clearing a record
//! writes it back without that field.

use crate::path::{default_recovery_dir, NoWayHome};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs::{create_dir_all, read_to_string, rename, write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// State handed from a stage step to a later unstage step.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RecoveryRecord {
    /// Branch that was checked out before staging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
}

/// Persisted recovery slot of one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStore {
    record_path: PathBuf,
}

impl RecoveryStore {
    /// Construct recovery store for a repository inside target directory.
    ///
    /// Nothing is read or written until the record is accessed.
    pub fn open(dir: impl AsRef<Path>, repo_root: impl AsRef<Path>) -> Self {
        let record_path = dir
            .as_ref()
            .join(format!("{}.toml", record_key(repo_root.as_ref())));

        Self { record_path }
    }

    /// Construct recovery store for a repository in the default directory.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NoWayHome`] if home directory cannot be found.
    pub fn open_default(repo_root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::open(default_recovery_dir()?, repo_root))
    }

    /// Path to the record file.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Read current record.
    ///
    /// A record file that does not exist yet reads as an empty record.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if the record file cannot be read.
    /// - Return [`StoreError::Deserialize`] if the record file is corrupt.
    pub fn load(&self) -> Result<RecoveryRecord> {
        if !self.record_path.exists() {
            return Ok(RecoveryRecord::default());
        }

        let data = read_to_string(&self.record_path).map_err(|err| StoreError::Read {
            source: err,
            path: self.record_path.clone(),
        })?;

        toml::de::from_str(&data).map_err(|err| StoreError::Deserialize {
            source: err,
            path: self.record_path.clone(),
        })
    }

    /// Write record, replacing any previous one.
    ///
    /// The record is written to a sibling file first and then renamed over the
    /// old record, so a crash never leaves a half written record behind.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Serialize`] if the record cannot be serialized.
    /// - Return [`StoreError::Write`] if the record file cannot be written.
    pub fn save(&self, record: &RecoveryRecord) -> Result<()> {
        let data = toml::ser::to_string(record)?;
        let write_err = |err| StoreError::Write {
            source: err,
            path: self.record_path.clone(),
        };

        if let Some(dir) = self.record_path.parent() {
            create_dir_all(dir).map_err(write_err)?;
        }

        let staging_path = self.record_path.with_extension("toml.tmp");
        write(&staging_path, data.as_bytes()).map_err(write_err)?;
        rename(&staging_path, &self.record_path).map_err(write_err)?;
        debug!("saved recovery record {:?}", self.record_path.display());

        Ok(())
    }

    /// Read recorded branch and clear the record.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError`] if the record cannot be read or written.
    pub fn take(&self) -> Result<Option<String>> {
        let record = self.load()?;
        if record.current_branch.is_some() {
            self.save(&RecoveryRecord::default())?;
        }

        Ok(record.current_branch)
    }
}

fn record_key(repo_root: &Path) -> String {
    // INVARIANT: Same repository gives same key however it was spelled.
    let canonical = repo_root
        .canonicalize()
        .unwrap_or_else(|_| repo_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());

    hex::encode(&digest[..8])
}

/// Recovery store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Home directory for default store location cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    /// Record file cannot be read.
    #[error("failed to read recovery record {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Record file cannot be written.
    #[error("failed to write recovery record {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Record file is corrupt.
    #[error("recovery record {:?} is corrupt", path.display())]
    Deserialize {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    /// Record cannot be serialized.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn empty_store_loads_empty_record() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = RecoveryStore::open(dir.path(), "/srv/app");
        assert_eq!(store.load()?, RecoveryRecord::default());
        assert_eq!(store.take()?, None);

        Ok(())
    }

    #[test]
    fn take_clears_saved_branch() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = RecoveryStore::open(dir.path(), "/srv/app");
        store.save(&RecoveryRecord {
            current_branch: Some("main".into()),
        })?;

        // Another handle on the same repository sees the record.
        let other = RecoveryStore::open(dir.path(), "/srv/app");
        assert_eq!(other.take()?, Some("main".into()));
        assert_eq!(other.take()?, None);
        assert_eq!(store.load()?, RecoveryRecord::default());

        Ok(())
    }

    #[test]
    fn repositories_do_not_share_slots() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let first = RecoveryStore::open(dir.path(), "/srv/first");
        let second = RecoveryStore::open(dir.path(), "/srv/second");
        assert_ne!(first.record_path(), second.record_path());

        first.save(&RecoveryRecord {
            current_branch: Some("main".into()),
        })?;
        assert_eq!(second.load()?.current_branch, None);

        Ok(())
    }

    #[test]
    fn corrupt_record_is_reported() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = RecoveryStore::open(dir.path(), "/srv/app");
        std::fs::write(store.record_path(), "current_branch = [")?;
        assert!(matches!(store.load(), Err(StoreError::Deserialize { .. })));

        Ok(())
    }
}
