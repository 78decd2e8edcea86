// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source tree staging.
//!
//! Before a device operation runs, the repository of the selected project has
//! to be put into the variant the operator asked for. Afterwards it has to be
//! put back. The [`Stager`] does both through its two operations: __stage__
//! and __unstage__.
//!
//! # Staging Methods
//!
//! How a tree is staged depends on the [`StageMethod`]:
//!
//! - `current` and `in` use the operator's directory or artifact as is.
//! - `working` moves into the project directory.
//! - `git` moves into the project directory and checks out the stage's branch,
//!   shelving uncommitted edits in a stash tagged with [`STASH_TOKEN`].
//! - `script` moves into the project directory and runs the stage's shell
//!   hooks.
//!
//! # Stage Across Processes
//!
//! Operators may stage in one invocation, do other work, and unstage in a
//! later invocation. For the git method, the branch that was checked out
//! before staging is therefore persisted in the [`RecoveryStore`]. An unstage
//! that does not remember the branch itself reads it back from there.
//!
//! # Failure Handling
//!
//! Neither operation returns an error. Version control failures are logged
//! and reported through a `false` return, so the caller can skip its device
//! operation. A failed stage still requires an unstage. Unstage checks out
//! the original branch only if staging actually left it, and applies the
//! stash back only once the work tree is on that branch again. Otherwise the
//! stash is kept. Shell hooks are fire-and-forget, and their outcome never
//! affects the result.

pub mod script;
pub mod vcs;

use crate::{
    config::StageScript,
    resolve::ResolvedContext,
    stage::{
        script::{CommandRunner, ShellRunner},
        vcs::{Git2Vcs, VcsClient, VcsError},
    },
    store::{RecoveryRecord, RecoveryStore, StoreError},
};

use serde::{Deserialize, Serialize};
use std::{
    env::{current_dir, set_current_dir},
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};
use tracing::{debug, error, info, instrument, warn};

/// Message that tags the stash created while staging.
pub const STASH_TOKEN: &str = "sideloader-temp-stash";

/// How a source tree is materialized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum StageMethod {
    /// Use the operator's current directory as is.
    #[default]
    Current,

    /// Use an already built artifact as is.
    In,

    /// Use the project's working directory.
    Working,

    /// Check out a git reference in the project directory.
    Git,

    /// Run shell hooks in the project directory.
    Script,
}

impl StageMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::In => "in",
            Self::Working => "working",
            Self::Git => "git",
            Self::Script => "script",
        }
    }
}

impl FromStr for StageMethod {
    type Err = UnknownStageMethod;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "in" => Ok(Self::In),
            "working" => Ok(Self::Working),
            "git" => Ok(Self::Git),
            "script" => Ok(Self::Script),
            _ => Err(UnknownStageMethod(data.to_string())),
        }
    }
}

impl TryFrom<String> for StageMethod {
    type Error = UnknownStageMethod;

    fn try_from(data: String) -> Result<Self, Self::Error> {
        data.parse()
    }
}

impl From<StageMethod> for String {
    fn from(method: StageMethod) -> Self {
        method.as_str().to_string()
    }
}

impl Display for StageMethod {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Stage method name is not one of the known methods.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown stage method {0:?}, expected current, in, working, git, or script")]
pub struct UnknownStageMethod(pub String);

/// Stage and unstage a source tree.
///
/// Holds the runtime record of one staging session. Collaborators are
/// generic so the state machine itself never spawns processes.
#[derive(Debug)]
pub struct Stager<V = Git2Vcs, R = ShellRunner>
where
    V: VcsClient,
    R: CommandRunner,
{
    method: StageMethod,
    git_ref: Option<String>,
    script: Option<StageScript>,
    root_dir: PathBuf,
    original_dir: Option<PathBuf>,
    original_branch: Option<String>,
    switched: bool,
    vcs: V,
    runner: R,
    recovery: RecoveryStore,
}

impl Stager {
    /// Construct new stager with default collaborators.
    ///
    /// Uses libgit2 at the context's root directory, the system shell, and the
    /// recovery store in its default location.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NoWayHome`] if the default recovery store
    ///   location cannot be determined.
    pub fn new(context: &ResolvedContext) -> Result<Self, StoreError> {
        Ok(Self::with_parts(
            context,
            Git2Vcs::new(&context.root_dir),
            ShellRunner,
            RecoveryStore::open_default(&context.root_dir)?,
        ))
    }
}

impl<V, R> Stager<V, R>
where
    V: VcsClient,
    R: CommandRunner,
{
    /// Construct new stager from explicit collaborators.
    pub fn with_parts(context: &ResolvedContext, vcs: V, runner: R, recovery: RecoveryStore) -> Self {
        let stage = context.stage.as_ref();
        Self {
            method: context.method,
            git_ref: context.git_ref.clone(),
            script: stage.and_then(|stage| stage.script.clone()),
            root_dir: context.root_dir.clone(),
            original_dir: None,
            original_branch: None,
            switched: false,
            vcs,
            runner,
            recovery,
        }
    }

    /// Staging method in use.
    pub fn method(&self) -> StageMethod {
        self.method
    }

    /// Put the source tree into the requested variant.
    ///
    /// Return `false` if a version control operation failed, or the original
    /// branch could not be recorded for a later unstage. The caller
    /// should skip its device operation in that case, but must still call
    /// [`Stager::unstage`].
    #[instrument(skip(self), fields(method = %self.method), level = "debug")]
    pub fn stage(&mut self) -> bool {
        self.original_dir = current_dir().ok();

        let mut stage_succeeded = true;
        match self.method {
            StageMethod::Current | StageMethod::In => {}
            StageMethod::Working => self.switch_directory(),
            StageMethod::Git => {
                self.switch_directory();
                match self.git_switch_to() {
                    Ok(()) => {}
                    Err(SwitchError::Vcs(err)) => {
                        error!("branch or ref does not exist: {err}");
                        stage_succeeded = false;
                    }
                    Err(SwitchError::Store(err)) => {
                        error!("cannot record original branch: {err}");
                        stage_succeeded = false;
                    }
                }
            }
            StageMethod::Script => {
                self.switch_directory();
                if let Some(script) = self.script.clone() {
                    self.run_hook("stage", &script.stage);
                }
            }
        }

        stage_succeeded
    }

    /// Revert what [`Stager::stage`] did.
    ///
    /// May run in a different process than the stage step. Return `false` if
    /// a version control operation failed.
    #[instrument(skip(self), fields(method = %self.method), level = "debug")]
    pub fn unstage(&mut self) -> bool {
        if self.original_dir.is_none() {
            self.original_dir = current_dir().ok();
        }

        let mut unstage_succeeded = true;
        match self.method {
            StageMethod::Current | StageMethod::In => {}
            StageMethod::Working => self.switch_directory_back(),
            StageMethod::Git => {
                self.switch_directory();
                let returned = match self.git_switch_from() {
                    Ok(returned) => returned,
                    Err(err) => {
                        error!("branch or ref does not exist: {err}");
                        unstage_succeeded = false;
                        false
                    }
                };

                if let Err(err) = self.release_stash(returned) {
                    error!("failed to restore stashed changes: {err}");
                    unstage_succeeded = false;
                }
                self.switch_directory_back();
            }
            StageMethod::Script => {
                self.switch_directory();
                if let Some(command) = self.script.as_ref().and_then(|script| script.unstage.clone()) {
                    self.run_hook("unstage", &command);
                }
                self.switch_directory_back();
            }
        }

        unstage_succeeded
    }

    fn switch_directory(&self) {
        if self.original_dir.as_ref() == Some(&self.root_dir) {
            return;
        }

        debug!("switch directory to {:?}", self.root_dir.display());
        if let Err(err) = set_current_dir(&self.root_dir) {
            warn!("cannot switch directory to {:?}: {err}", self.root_dir.display());
        }
    }

    fn switch_directory_back(&self) {
        let Some(original_dir) = &self.original_dir else {
            return;
        };

        if original_dir == &self.root_dir {
            return;
        }

        debug!("switch directory back to {:?}", original_dir.display());
        if let Err(err) = set_current_dir(original_dir) {
            warn!("cannot switch directory back to {:?}: {err}", original_dir.display());
        }
    }

    fn git_switch_to(&mut self) -> Result<(), SwitchError> {
        let Some(target) = self.git_ref.clone() else {
            warn!("no branch or ref configured for git staging");
            return Ok(());
        };

        let current = self.vcs.current_branch()?;
        self.original_branch = Some(current.clone());

        // INVARIANT: Same branch still records the original branch, so that
        // unstage behaves the same either way.
        if target != current {
            if self.vcs.create_stash(STASH_TOKEN)? {
                info!("stashed local changes on {current:?}");
            }
            info!("check out {target:?} over {current:?}");
            self.vcs.checkout(&target)?;
        }
        self.switched = true;

        self.recovery.save(&RecoveryRecord {
            current_branch: Some(current),
        })?;

        Ok(())
    }

    // Return whether the work tree is known to be back on the branch it was
    // staged from.
    fn git_switch_from(&mut self) -> Result<bool, SwitchError> {
        if self.git_ref.is_none() {
            return Ok(true);
        }

        // INVARIANT: Recovery record is cleared on every git unstage.
        let branch = match self.original_branch.take() {
            Some(branch) => {
                self.clear_recovery();
                if !self.switched {
                    debug!("stage never left {branch:?}, skip check out");
                    return Ok(true);
                }
                branch
            }
            None => match self.recovery.take()? {
                Some(branch) => {
                    if !self.vcs.branches()?.contains(&branch) {
                        warn!("recovered branch {branch:?} no longer exists");
                        return Ok(false);
                    }
                    debug!("recovered original branch {branch:?}");
                    branch
                }
                None => {
                    debug!("no original branch to return to");
                    return Ok(false);
                }
            },
        };

        info!("check out original branch {branch:?}");
        self.vcs.checkout(&branch)?;
        self.switched = false;

        Ok(true)
    }

    fn clear_recovery(&self) {
        if let Err(err) = self.recovery.take() {
            warn!("cannot clear recovery record: {err}");
        }
    }

    // Finds the tagged entry by message, since the staged branch may have
    // pushed stashes of its own on top of it. The entry is only applied back
    // onto the branch it was taken from.
    fn release_stash(&mut self, returned: bool) -> Result<(), SwitchError> {
        if self.git_ref.is_none() {
            return Ok(());
        }

        let stashes = self.vcs.list_stashes()?;
        let Some(entry) = stashes.iter().find(|entry| entry.message == STASH_TOKEN) else {
            return Ok(());
        };

        if !returned {
            warn!(
                "work tree is not back on its original branch, keep stash@{{{}}}",
                entry.index
            );
            return Ok(());
        }

        info!("restore stashed changes from stash@{{{}}}", entry.index);
        self.vcs.apply_stash(entry.index)?;
        self.vcs.drop_stash(entry.index)?;

        Ok(())
    }

    fn run_hook(&mut self, name: &str, command: &str) {
        info!("run {name} hook: {command}");
        match self.runner.run(command) {
            Ok(output) if !output.is_empty() => info!("{output}"),
            Ok(_) => {}
            Err(err) => warn!("{name} hook failed: {err}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SwitchError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
