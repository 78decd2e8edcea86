// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Resolution of configuration against command-line options.
//!
//! A [`ConfigDocument`] describes everything that _could_ be deployed. The
//! resolver picks out what one invocation actually works with: the device,
//! the project and its stage, the signing key, the directory to stage in,
//! and the input and output paths. The result is a [`ResolvedContext`] that
//! the [`Stager`](crate::stage::Stager) and the device commands consume.
//!
//! # Sources
//!
//! Commands that work on source code need to know where that code is. The
//! operator either names a non-project source, i.e., the current directory
//! through `--current` or an artifact through `--in`, or leaves it to the
//! resolver to select a project. Without `--project`, the resolver looks for
//! the project whose directory contains the working directory, and falls
//! back to the default project.

use crate::{
    config::{ConfigDocument, DeviceConfig, KeyConfig, KeyRef, ProjectConfig, StageConfig},
    path::absolutize,
    stage::StageMethod,
};

use serde::Serialize;
use std::{
    collections::BTreeMap,
    env::temp_dir,
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Extensions of artifacts that in and out paths may name.
pub const ARTIFACT_EXTENSIONS: [&str; 3] = ["zip", "pkg", "jpg"];

/// File that marks a directory as an application root.
const MANIFEST: &str = "manifest";

/// Command-line options that resolution depends on.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Command works on source code.
    pub requires_source: bool,

    /// Device to use instead of the default device.
    pub device: Option<String>,

    /// Project to use instead of detecting one.
    pub project: Option<String>,

    /// Stage to use instead of the first declared stage.
    pub stage: Option<String>,

    /// Git reference to use instead of the stage's branch.
    pub git_ref: Option<String>,

    /// Use the project's working directory as is.
    pub working: bool,

    /// Use the working directory as the source.
    pub current: bool,

    /// Artifact or folder to use as the source.
    pub input: Option<PathBuf>,

    /// Artifact or folder to write output to.
    pub out: Option<PathBuf>,

    /// Directory the invocation runs in.
    pub working_dir: PathBuf,
}

/// Folder and file name split out of an in or out path.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl PathSpec {
    /// Split path into folder and file.
    ///
    /// A path with one of the [`ARTIFACT_EXTENSIONS`] names a file inside a
    /// folder, any other path names a folder. Relative folders are made
    /// absolute against `base`. A bare file name has no folder.
    pub fn split(path: impl AsRef<Path>, base: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let base = base.as_ref();

        let is_artifact = path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext));
        if !is_artifact {
            return Self {
                folder: Some(absolutize(path, base)),
                file: None,
            };
        }

        Self {
            folder: path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(|parent| absolutize(parent, base)),
            file: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }
}

/// Everything one invocation works with.
///
/// Scalar fields are declared before table fields so the context serializes
/// as valid TOML.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedContext {
    /// Name of selected device.
    pub device_name: String,

    /// Name of selected project, if a project is in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    /// Name of selected stage, if a project is in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,

    /// Effective staging method.
    pub method: StageMethod,

    /// Git reference to check out for the git staging method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Directory that staging happens in.
    pub root_dir: PathBuf,

    /// Selected device.
    pub device: DeviceConfig,

    /// Selected project.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectConfig>,

    /// Selected stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageConfig>,

    /// Signing key of selected stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyConfig>,

    /// Input path.
    pub input: PathSpec,

    /// Output path. Folder defaults to the system temporary directory.
    pub out: PathSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_mappings: Option<BTreeMap<String, Vec<String>>>,
}

impl Display for ResolvedContext {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let data = toml::ser::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        fmt.write_str(data.as_str())
    }
}

/// Resolve configuration against command-line options.
///
/// # Errors
///
/// - Return [`ResolveError`] if any named or configured entry cannot be
///   found, or a path it points to does not exist.
#[instrument(skip(config), level = "debug")]
pub fn resolve(config: &ConfigDocument, options: &ResolveOptions) -> Result<ResolvedContext> {
    let working_dir = options.working_dir.as_path();
    let input = options
        .input
        .as_ref()
        .map(|path| PathSpec::split(path, working_dir))
        .unwrap_or_default();
    let mut out = options
        .out
        .as_ref()
        .map(|path| PathSpec::split(path, working_dir))
        .unwrap_or_default();
    if out.folder.is_none() {
        out.folder = Some(temp_dir());
    }

    let device_name = options
        .device
        .clone()
        .unwrap_or_else(|| config.devices.default.clone());
    let device = config
        .devices
        .entries
        .get(&device_name)
        .cloned()
        .ok_or_else(|| ResolveError::UnknownDevice(device_name.clone()))?;

    let mut context = ResolvedContext {
        device_name,
        device,
        input,
        out,
        input_mappings: config.input_mappings.clone(),
        ..ResolvedContext::default()
    };

    if options.current {
        let manifest = working_dir.join(MANIFEST);
        if !manifest.exists() {
            return Err(ResolveError::MissingManifest(manifest));
        }
        context.method = StageMethod::Current;
        context.root_dir = canonical_root(working_dir)?;
    } else if options.input.is_some() {
        context.method = StageMethod::In;
        let folder = context.input.folder.as_deref().unwrap_or(working_dir);
        context.root_dir = canonical_root(folder)?;
    } else if options.requires_source {
        resolve_project(config, options, &mut context)?;
    } else {
        context.method = if options.working {
            StageMethod::Working
        } else {
            StageMethod::Current
        };
        context.root_dir = canonical_root(working_dir)?;
    }

    debug!("resolved {:?} staging at {:?}", context.method, context.root_dir.display());
    Ok(context)
}

fn resolve_project(
    config: &ConfigDocument,
    options: &ResolveOptions,
    context: &mut ResolvedContext,
) -> Result<()> {
    let Some(projects) = &config.projects else {
        return match &options.project {
            Some(name) => Err(ResolveError::UnknownProject(name.clone())),
            None => Err(ResolveError::MissingSource),
        };
    };

    let project_name = match &options.project {
        Some(name) => name.clone(),
        None => detect_project(config, &options.working_dir)
            .unwrap_or_else(|| projects.default.clone()),
    };
    let project = projects
        .entries
        .get(&project_name)
        .ok_or_else(|| ResolveError::UnknownProject(project_name.clone()))?;

    let directory = project_directory(config, project, &options.working_dir)
        .ok_or_else(|| ResolveError::NoProjectDirectory(project_name.clone()))?;
    let root_dir = directory
        .canonicalize()
        .map_err(|_| ResolveError::MissingProjectDirectory {
            project: project_name.clone(),
            path: directory.clone(),
        })?;

    let method = if options.working {
        StageMethod::Working
    } else {
        project.stage_method.unwrap_or_default()
    };

    let stage = match &options.stage {
        Some(name) => {
            let stage = project
                .stages
                .get(name)
                .ok_or_else(|| ResolveError::UnknownStage {
                    project: project_name.clone(),
                    stage: name.clone(),
                })?;
            Some((name.clone(), stage.clone()))
        }
        None => project
            .stages
            .first()
            .map(|(name, stage)| (name.to_string(), stage.clone())),
    };

    let key = match stage.as_ref().and_then(|(_, stage)| stage.key.as_ref()) {
        Some(key) => Some(resolve_key(config, key, &options.working_dir)?),
        None => None,
    };

    context.git_ref = options
        .git_ref
        .clone()
        .or_else(|| stage.as_ref().and_then(|(_, stage)| stage.branch.clone()));
    let (stage_name, stage) = stage.unzip();
    context.project_name = Some(project_name);
    context.project = Some(project.clone());
    context.stage_name = stage_name;
    context.stage = stage;
    context.key = key;
    context.method = method;
    context.root_dir = root_dir;

    Ok(())
}

// Longest containing project directory wins, so nested projects resolve to
// the innermost one. Among projects sharing that directory, the default
// project wins, then the first by name.
fn detect_project(config: &ConfigDocument, working_dir: &Path) -> Option<String> {
    let projects = config.projects.as_ref()?;
    let working_dir = working_dir.canonicalize().ok()?;

    let mut best: Option<(usize, &String)> = None;
    for (name, project) in &projects.entries {
        let Some(directory) = project_directory(config, project, &working_dir)
            .and_then(|directory| directory.canonicalize().ok())
        else {
            continue;
        };

        if !working_dir.starts_with(&directory) {
            continue;
        }

        let depth = directory.components().count();
        let better = match best {
            None => true,
            Some((best_depth, best_name)) => {
                depth > best_depth
                    || (depth == best_depth
                        && *name == projects.default
                        && *best_name != projects.default)
            }
        };
        if better {
            best = Some((depth, name));
        }
    }

    best.map(|(_, name)| {
        debug!("detected project {name:?} from working directory");
        name.clone()
    })
}

fn project_directory(
    config: &ConfigDocument,
    project: &ProjectConfig,
    working_dir: &Path,
) -> Option<PathBuf> {
    let directory = project.directory.as_ref()?;
    let directory = match config
        .projects
        .as_ref()
        .and_then(|projects| projects.project_dir.as_ref())
    {
        Some(project_dir) => project_dir.join(directory),
        None => directory.clone(),
    };

    Some(absolutize(directory, working_dir))
}

fn resolve_key(config: &ConfigDocument, key: &KeyRef, working_dir: &Path) -> Result<KeyConfig> {
    let mut key = match key {
        KeyRef::Inline(key) => key.clone(),
        KeyRef::Named(name) => {
            let keys = config
                .keys
                .as_ref()
                .ok_or_else(|| ResolveError::UnknownKey(name.clone()))?;
            let mut key = keys
                .entries
                .get(name)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownKey(name.clone()))?;
            if let Some(key_dir) = &keys.key_dir {
                key.keyed_pkg = key_dir.join(&key.keyed_pkg);
            }
            key
        }
    };

    // INVARIANT: Relative key paths never depend on the process directory.
    key.keyed_pkg = absolutize(&key.keyed_pkg, working_dir);

    // INVARIANT: Signing never proceeds with a dangling key file.
    if !key.keyed_pkg.exists() {
        return Err(ResolveError::BadKeyFile(key.keyed_pkg));
    }

    Ok(key)
}

fn canonical_root(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|_| ResolveError::MissingRoot(path.to_path_buf()))
}

/// Resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("unknown stage {stage:?} of project {project:?}")]
    UnknownStage { project: String, stage: String },

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("project {0:?} has no directory field")]
    NoProjectDirectory(String),

    #[error("directory {:?} of project {project:?} does not exist", path.display())]
    MissingProjectDirectory { project: String, path: PathBuf },

    #[error("bad key file: {}", .0.display())]
    BadKeyFile(PathBuf),

    #[error("missing manifest: {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("root directory {:?} does not exist", .0.display())]
    MissingRoot(PathBuf),

    #[error("command needs a source, but no project is configured")]
    MissingSource,
}

impl ResolveError {
    /// Error is caused by command-line arguments rather than configuration.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Self::UnknownDevice(_) | Self::MissingSource)
    }
}

/// Friendly result alias :3
pub type Result<T, E = ResolveError> = std::result::Result<T, E>;
