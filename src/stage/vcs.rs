// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control access for the git staging method.
//!
//! The stager never talks to Git directly. It goes through [`VcsClient`],
//! which models the handful of operations that staging needs: branch
//! inspection, checkout, and stash handling. [`Git2Vcs`] implements it through
//! libgit2, and tests substitute their own fakes.

use git2::{
    build::CheckoutBuilder, BranchType, ErrorCode, Repository, Signature, StashFlags,
};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Entry of a repository's stash list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Position in the stash list, where zero is the most recent entry.
    pub index: usize,

    /// Message the entry was saved with.
    pub message: String,
}

/// Version control operations used by the stager.
///
/// Every operation may fail with [`VcsError`], which the stager treats as an
/// execution error of the underlying tool.
pub trait VcsClient {
    /// Name of currently checked out branch.
    fn current_branch(&mut self) -> Result<String>;

    /// Names of all local branches.
    fn branches(&mut self) -> Result<Vec<String>>;

    /// Check out a branch or any other reference.
    fn checkout(&mut self, reference: &str) -> Result<()>;

    /// List stash entries, most recent first.
    fn list_stashes(&mut self) -> Result<Vec<StashEntry>>;

    /// Shelve local modifications under given message.
    ///
    /// Return `false` if there was nothing to shelve.
    fn create_stash(&mut self, message: &str) -> Result<bool>;

    /// Apply stash entry onto the work tree without removing it.
    fn apply_stash(&mut self, index: usize) -> Result<()>;

    /// Remove stash entry from the stash list.
    fn drop_stash(&mut self, index: usize) -> Result<()>;
}

/// Version control access through libgit2.
///
/// The repository is opened on first use, so constructing this for a
/// directory that is not a repository only fails once an operation is
/// actually attempted.
pub struct Git2Vcs {
    path: PathBuf,
    repository: Option<Repository>,
}

impl Git2Vcs {
    /// Construct new libgit2 client for repository at target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            repository: None,
        }
    }

    /// Path of repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repository(&mut self) -> Result<&mut Repository> {
        let repository = match self.repository.take() {
            Some(repository) => repository,
            None => {
                debug!("open repository {:?}", self.path.display());
                Repository::discover(&self.path)?
            }
        };

        Ok(self.repository.insert(repository))
    }
}

impl std::fmt::Debug for Git2Vcs {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Git2Vcs")
            .field("path", &self.path)
            .field("open", &self.repository.is_some())
            .finish()
    }
}

impl VcsClient for Git2Vcs {
    fn current_branch(&mut self) -> Result<String> {
        let repository = self.repository()?;
        let head = repository.head()?;
        if !head.is_branch() {
            return Err(VcsError::DetachedHead);
        }

        head.shorthand()
            .map(ToString::to_string)
            .ok_or(VcsError::DetachedHead)
    }

    fn branches(&mut self) -> Result<Vec<String>> {
        let repository = self.repository()?;
        let mut names = Vec::new();
        for branch in repository.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    fn checkout(&mut self, reference: &str) -> Result<()> {
        let repository = self.repository()?;
        let (object, found) = repository.revparse_ext(reference)?;

        // INVARIANT: Safe checkout never overwrites local modifications.
        repository.checkout_tree(&object, Some(CheckoutBuilder::new().safe()))?;
        match found.as_ref().filter(|found| found.is_branch()).and_then(|found| found.name()) {
            Some(name) => repository.set_head(name)?,
            None => repository.set_head_detached(object.peel_to_commit()?.id())?,
        }

        Ok(())
    }

    fn list_stashes(&mut self) -> Result<Vec<StashEntry>> {
        let repository = self.repository()?;
        let mut entries = Vec::new();
        repository.stash_foreach(|index, message, _| {
            entries.push(StashEntry {
                index,
                message: strip_stash_prefix(message).to_string(),
            });
            true
        })?;

        Ok(entries)
    }

    #[instrument(skip(self), level = "debug")]
    fn create_stash(&mut self, message: &str) -> Result<bool> {
        let repository = self.repository()?;
        let stasher = repository
            .signature()
            .or_else(|_| Signature::now("sideloader", "sideloader@localhost"))?;

        match repository.stash_save(&stasher, message, Some(StashFlags::DEFAULT)) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ErrorCode::NotFound => {
                debug!("nothing to stash");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn apply_stash(&mut self, index: usize) -> Result<()> {
        Ok(self.repository()?.stash_apply(index, None)?)
    }

    fn drop_stash(&mut self, index: usize) -> Result<()> {
        Ok(self.repository()?.stash_drop(index)?)
    }
}

// Stash messages come back as "On <branch>: <message>", or "WIP on ..." for
// stashes saved without a message.
fn strip_stash_prefix(message: &str) -> &str {
    if message.starts_with("On ") || message.starts_with("WIP on ") {
        if let Some((_, rest)) = message.split_once(": ") {
            return rest;
        }
    }

    message
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Repository HEAD does not point at a branch.
    #[error("repository HEAD is detached, no current branch")]
    DetachedHead,
}

/// Friendly result alias :3
pub type Result<T, E = VcsError> = std::result::Result<T, E>;
