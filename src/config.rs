// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout and loading.
//!
//! Specify the layout of the configuration file that describes devices,
//! projects, build stages, and signing keys. Also provides the loader that
//! reads a local configuration file along with its chain of parent files,
//! and flattens them into one [`ConfigDocument`].
//!
//! # Layered Configuration
//!
//! A configuration file may name another file through its top-level
//! `parent_config` field. The parent path is relative to the directory of the
//! file that names it. The loader follows this chain upward, and merges each
//! parent into what it has loaded so far. Merging is shallow at the top level:
//! a child that defines a section at all, e.g., `devices`, hides that entire
//! section of its parents. There is no per-key union across files.
//!
//! The chain is capped at [`MAX_CHAIN_DEPTH`] files. Exceeding the cap is an
//! error rather than a silent truncation, because the usual cause is a cycle.
//!
//! # Project Inheritance
//!
//! Inside the `projects` section, a project can name another project through
//! its `parent` field. Any field the project does not set is inherited from
//! its parent, recursively, with nested tables merged key by key. A parent
//! that does not exist, or a chain that loops back on itself, leaves the
//! project as declared.
//!
//! # Editing
//!
//! A new local configuration can be seeded from [`EXAMPLE_CONFIG`] through
//! [`configure`]. Device, project, and stage fields of a loaded document can
//! then be changed with [`ConfigDocument::edit`] and written back through
//! [`ConfigDocument::save`].

use crate::{path::absolutize, stage::StageMethod};

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    str::FromStr,
};
use toml::{Table, Value};
use tracing::{debug, instrument, warn};

/// Maximum amount of files in a configuration chain.
pub const MAX_CHAIN_DEPTH: usize = 10;

/// Maximum amount of `parent` hops followed for one project.
pub const MAX_PARENT_HOPS: usize = 10;

/// Keys of the projects section that are settings rather than projects.
const PROJECT_SETTINGS: [&str; 2] = ["default", "project_dir"];

/// Sections that a global configuration file may fill in.
const GLOBAL_SECTIONS: [&str; 3] = ["devices", "keys", "input_mappings"];

/// Starting point for a new local configuration file.
pub const EXAMPLE_CONFIG: &str = include_str!("../config.example.toml");

/// Merged configuration document.
///
/// Built once per invocation from one or more files on disk, and never
/// mutated afterwards. Resolution against command-line options happens in
/// [`resolve`](crate::resolve).
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConfigDocument {
    /// Devices that can be deployed to.
    pub devices: DeviceTable,

    /// Projects that can be staged and deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<ProjectTable>,

    /// Named signing keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeyTable>,

    /// Mapping of raw input to logical device commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mappings: Option<BTreeMap<String, Vec<String>>>,
}

impl ConfigDocument {
    /// Construct configuration from a fully merged table.
    ///
    /// Applies project inheritance, converts into the typed layout, and then
    /// normalizes and validates the result.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Deserialize`] if the table does not match the
    ///   configuration layout.
    /// - Return [`ConfigError::ShellExpansion`] if a path cannot be expanded.
    /// - Return [`ConfigError::UnknownDefault`] if a default name does not
    ///   match an entry.
    pub fn from_table(mut table: Table) -> Result<Self> {
        inherit_projects(&mut table);
        let mut document: ConfigDocument = table.try_into().map_err(ConfigError::Deserialize)?;
        document.normalize()?;
        document.validate()?;

        Ok(document)
    }

    /// Look up a project by name.
    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects
            .as_ref()
            .and_then(|projects| projects.entries.get(name))
    }

    // INVARIANT: Default names are trimmed, and user paths are shell expanded.
    fn normalize(&mut self) -> Result<()> {
        self.devices.default = self.devices.default.trim().to_string();

        if let Some(projects) = &mut self.projects {
            projects.default = projects.default.trim().to_string();
            if let Some(project_dir) = &projects.project_dir {
                projects.project_dir = Some(expand_path(project_dir)?);
            }

            for project in projects.entries.values_mut() {
                if let Some(directory) = &project.directory {
                    project.directory = Some(expand_path(directory)?);
                }

                for (_, stage) in project.stages.iter_mut() {
                    if let Some(KeyRef::Inline(key)) = &mut stage.key {
                        key.keyed_pkg = expand_path(&key.keyed_pkg)?;
                    }
                }
            }
        }

        if let Some(keys) = &mut self.keys {
            if let Some(key_dir) = &keys.key_dir {
                keys.key_dir = Some(expand_path(key_dir)?);
            }

            for key in keys.entries.values_mut() {
                key.keyed_pkg = expand_path(&key.keyed_pkg)?;
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.devices.entries.contains_key(&self.devices.default) {
            return Err(ConfigError::UnknownDefault {
                section: "devices",
                name: self.devices.default.clone(),
            });
        }

        if let Some(projects) = &self.projects {
            if !projects.entries.contains_key(&projects.default) {
                return Err(ConfigError::UnknownDefault {
                    section: "projects",
                    name: projects.default.clone(),
                });
            }
        }

        Ok(())
    }
}

impl ConfigDocument {
    /// Apply edits to the selected device, project, and stage.
    ///
    /// Entries not named by `target` fall back to the default device, the
    /// default project, and the project's first stage. Only the entries that
    /// an edit actually touches need to exist.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownEditTarget`] if an entry that an edit
    ///   touches does not exist.
    pub fn edit(&mut self, target: &EditTarget, params: &EditParams) -> Result<()> {
        for (field, value) in params.iter() {
            debug!("edit {field} = {value:?}");
            match field {
                EditField::Ip | EditField::User | EditField::Password => {
                    let name = target
                        .device
                        .clone()
                        .unwrap_or_else(|| self.devices.default.clone());
                    let device = self.devices.entries.get_mut(&name).ok_or(
                        ConfigError::UnknownEditTarget {
                            section: "devices",
                            name,
                        },
                    )?;
                    match field {
                        EditField::Ip => device.ip = value.clone(),
                        EditField::User => device.user = value.clone(),
                        _ => device.password = value.clone(),
                    }
                }
                EditField::Directory => {
                    self.edit_project(target)?.directory = Some(PathBuf::from(value));
                }
                EditField::AppName => {
                    self.edit_project(target)?.app_name = Some(value.clone());
                }
                EditField::Branch => {
                    let stage = target.stage.clone();
                    let project = self.edit_project(target)?;
                    let name = match stage {
                        Some(name) => name,
                        None => project
                            .stages
                            .first()
                            .map(|(name, _)| name.to_string())
                            .unwrap_or_default(),
                    };
                    let stage = project.stages.get_mut(&name).ok_or(
                        ConfigError::UnknownEditTarget {
                            section: "stages",
                            name,
                        },
                    )?;
                    stage.branch = Some(value.clone());
                }
            }
        }

        Ok(())
    }

    /// Write document to file as pretty TOML, replacing what was there.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if the file cannot be written.
    /// - Return [`ConfigError::Serialize`] if the document cannot be
    ///   serialized.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = toml::ser::to_string_pretty(self)?;
        write(path, data).map_err(|err| ConfigError::Write {
            source: err,
            path: path.to_path_buf(),
        })
    }

    fn edit_project(&mut self, target: &EditTarget) -> Result<&mut ProjectConfig> {
        let Some(projects) = &mut self.projects else {
            return Err(ConfigError::UnknownEditTarget {
                section: "projects",
                name: target.project.clone().unwrap_or_default(),
            });
        };

        let name = target
            .project
            .clone()
            .unwrap_or_else(|| projects.default.clone());
        projects
            .entries
            .get_mut(&name)
            .ok_or(ConfigError::UnknownEditTarget {
                section: "projects",
                name,
            })
    }
}

impl FromStr for ConfigDocument {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let table: Table = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;
        Self::from_table(table)
    }
}

impl Display for ConfigDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Device section with its default device name.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeviceTable {
    /// Name of device to use when none is given.
    pub default: String,

    /// Devices by name.
    #[serde(flatten)]
    pub entries: BTreeMap<String, DeviceConfig>,
}

/// Address and credentials of one device.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Network address of the device.
    pub ip: String,

    /// User name for the device's developer interface.
    #[serde(default)]
    pub user: String,

    /// Password for the device's developer interface.
    #[serde(default)]
    pub password: String,
}

/// Project section with its default project name.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ProjectTable {
    /// Name of project to use when none is given or detected.
    pub default: String,

    /// Shared root that relative project directories are joined onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<PathBuf>,

    /// Projects by name.
    #[serde(flatten)]
    pub entries: BTreeMap<String, ProjectConfig>,
}

/// One project.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Project directory, absolute or relative to the shared project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Folders to package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders: Option<Vec<String>>,

    /// Files to package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,

    /// Name of application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// How the project's source tree is staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_method: Option<StageMethod>,

    /// Stages in declaration order.
    #[serde(default, skip_serializing_if = "Stages::is_empty")]
    pub stages: Stages,

    /// Project to inherit unset fields from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Stages of a project, kept in declaration order.
///
/// The first declared stage is used when no stage is requested, so ordering
/// matters here unlike other sections of the configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Stages(Vec<(String, StageConfig)>);

impl Stages {
    /// Construct stage listing from name and configuration pairs.
    pub fn new(stages: impl IntoIterator<Item = (impl Into<String>, StageConfig)>) -> Self {
        Self(
            stages
                .into_iter()
                .map(|(name, stage)| (name.into(), stage))
                .collect(),
        )
    }

    /// Look up a stage by name.
    pub fn get(&self, name: &str) -> Option<&StageConfig> {
        self.0
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, stage)| stage)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut StageConfig> {
        self.0
            .iter_mut()
            .find(|(entry, _)| entry == name)
            .map(|(_, stage)| stage)
    }

    /// First declared stage.
    pub fn first(&self) -> Option<(&str, &StageConfig)> {
        self.0.first().map(|(name, stage)| (name.as_str(), stage))
    }

    /// No stage is declared.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate stages in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StageConfig)> {
        self.0.iter().map(|(name, stage)| (name.as_str(), stage))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut StageConfig)> {
        self.0.iter_mut().map(|(name, stage)| (name.as_str(), stage))
    }
}

impl<'de> Deserialize<'de> for Stages {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StagesVisitor;

        impl<'de> Visitor<'de> for StagesVisitor {
            type Value = Stages;

            fn expecting(&self, fmt: &mut Formatter<'_>) -> FmtResult {
                fmt.write_str("a table of stages")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut stages = Vec::new();
                while let Some((name, stage)) = access.next_entry::<String, StageConfig>()? {
                    stages.push((name, stage));
                }

                Ok(Stages(stages))
            }
        }

        deserializer.deserialize_map(StagesVisitor)
    }
}

impl Serialize for Stages {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, stage) in &self.0 {
            map.serialize_entry(name, stage)?;
        }
        map.end()
    }
}

/// One stage of a project.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    /// Git reference to check out for the git staging method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Shell hooks for the script staging method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<StageScript>,

    /// Signing key, inline or by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyRef>,
}

/// Shell hooks run by the script staging method.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct StageScript {
    /// Command run on stage.
    pub stage: String,

    /// Command run on unstage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unstage: Option<String>,
}

/// Signing key given inline or by name from the keys section.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum KeyRef {
    Named(String),
    Inline(KeyConfig),
}

/// Key section with optional directory prefix.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct KeyTable {
    /// Directory that paths of named keys are relative to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_dir: Option<PathBuf>,

    /// Keys by name.
    #[serde(flatten)]
    pub entries: BTreeMap<String, KeyConfig>,
}

/// Signing key.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct KeyConfig {
    /// Path to signed package that carries the key.
    pub keyed_pkg: PathBuf,

    /// Passphrase of the key.
    #[serde(default)]
    pub password: String,
}

/// Entries that [`ConfigDocument::edit`] applies to.
///
/// Unset names fall back to the defaults of their section.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct EditTarget {
    /// Device to edit instead of the default device.
    pub device: Option<String>,

    /// Project to edit instead of the default project.
    pub project: Option<String>,

    /// Stage to edit instead of the project's first stage.
    pub stage: Option<String>,
}

/// Field that can be edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    /// Address of the device.
    Ip,

    /// User name of the device.
    User,

    /// Password of the device.
    Password,

    /// Directory of the project.
    Directory,

    /// Application name of the project.
    AppName,

    /// Branch of the stage.
    Branch,
}

impl FromStr for EditField {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "ip" => Ok(Self::Ip),
            "user" => Ok(Self::User),
            "password" => Ok(Self::Password),
            "directory" => Ok(Self::Directory),
            "app_name" => Ok(Self::AppName),
            "branch" => Ok(Self::Branch),
            _ => Err(ConfigError::InvalidEditParam(data.to_string())),
        }
    }
}

impl Display for EditField {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Ip => "ip",
            Self::User => "user",
            Self::Password => "password",
            Self::Directory => "directory",
            Self::AppName => "app_name",
            Self::Branch => "branch",
        };
        fmt.write_str(name)
    }
}

/// List of edits in `field:value` form, separated by commas.
///
/// Values may contain colons themselves, e.g., `ip:192.168.0.2, user:dev`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct EditParams(Vec<(EditField, String)>);

impl EditParams {
    /// Iterate edits in the order they were given.
    pub fn iter(&self) -> impl Iterator<Item = &(EditField, String)> {
        self.0.iter()
    }
}

impl FromStr for EditParams {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut params = Vec::new();
        for param in data.split(',').map(str::trim).filter(|param| !param.is_empty()) {
            let (field, value) = param
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidEditParam(param.to_string()))?;
            params.push((field.trim().parse()?, value.to_string()));
        }

        Ok(Self(params))
    }
}

/// Seed local configuration file from [`EXAMPLE_CONFIG`].
///
/// # Errors
///
/// - Return [`ConfigError::AlreadyExists`] if `path` exists and `overwrite`
///   is not set.
/// - Return [`ConfigError::Write`] if the file cannot be written.
#[instrument(skip_all, level = "debug")]
pub fn configure(path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
    let path = path.as_ref();
    if path.exists() && !overwrite {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }

    let write_err = |err| ConfigError::Write {
        source: err,
        path: path.to_path_buf(),
    };
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        create_dir_all(dir).map_err(write_err)?;
    }
    write(path, EXAMPLE_CONFIG).map_err(write_err)?;
    debug!("seeded configuration {:?}", path.display());

    Ok(())
}

/// Load local configuration file and its parent chain.
///
/// # Errors
///
/// - Return [`ConfigError::Missing`] if `local_path` does not exist.
/// - Return [`ConfigError::ChainTooDeep`] if the chain of parents exceeds
///   [`MAX_CHAIN_DEPTH`] files.
/// - Return any other [`ConfigError`] variant if a file cannot be read,
///   parsed, or validated.
pub fn load(local_path: impl AsRef<Path>) -> Result<ConfigDocument> {
    load_with_global(local_path, None::<&Path>)
}

/// Load local configuration chain, falling back to global configuration.
///
/// Sections `devices`, `keys`, and `input_mappings` missing from the whole
/// local chain are taken from the global file. A global file that does not
/// exist is skipped.
///
/// # Errors
///
/// - Return [`ConfigError`] for the same reasons as [`load`], or if the
///   global file exists but cannot be read or parsed.
#[instrument(skip_all, level = "debug")]
pub fn load_with_global(
    local_path: impl AsRef<Path>,
    global_path: Option<impl AsRef<Path>>,
) -> Result<ConfigDocument> {
    let local_path = local_path.as_ref();
    if !local_path.exists() {
        return Err(ConfigError::Missing {
            path: local_path.to_path_buf(),
        });
    }

    let mut table = flatten_chain(local_path)?;

    if let Some(global_path) = global_path {
        let global_path = global_path.as_ref();
        if global_path.exists() {
            debug!("fill missing sections from {:?}", global_path.display());
            let mut global = read_table(global_path)?;
            for section in GLOBAL_SECTIONS {
                if !table.contains_key(section) {
                    if let Some(value) = global.remove(section) {
                        table.insert(section.to_string(), value);
                    }
                }
            }
        }
    }

    ConfigDocument::from_table(table)
}

fn flatten_chain(local_path: &Path) -> Result<Table> {
    let mut merged = Table::new();
    let mut next = Some(local_path.to_path_buf());
    let mut depth = 0;

    while let Some(path) = next.take() {
        if depth == MAX_CHAIN_DEPTH {
            return Err(ConfigError::ChainTooDeep {
                path,
                max: MAX_CHAIN_DEPTH,
            });
        }
        depth += 1;

        debug!("load configuration layer {depth}: {:?}", path.display());
        let mut layer = read_table(&path)?;
        next = match layer.remove("parent_config") {
            Some(Value::String(parent)) => {
                let parent = expand_path(Path::new(&parent))?;
                let base = path.parent().unwrap_or_else(|| Path::new(""));
                Some(absolutize(parent, base))
            }
            Some(other) => {
                return Err(ConfigError::InvalidField {
                    path,
                    field: "parent_config",
                    reason: format!("expected string, found {}", other.type_str()),
                })
            }
            None => None,
        };

        // INVARIANT: Child layers win over the parents loaded after them.
        for (key, value) in layer {
            merged.entry(key).or_insert(value);
        }
    }

    Ok(merged)
}

fn read_table(path: &Path) -> Result<Table> {
    let data = read_to_string(path).map_err(|err| ConfigError::Read {
        source: err,
        path: path.to_path_buf(),
    })?;

    toml::de::from_str(&data).map_err(|err| ConfigError::Parse {
        source: err,
        path: path.to_path_buf(),
    })
}

fn inherit_projects(table: &mut Table) {
    let Some(Value::Table(projects)) = table.get_mut("projects") else {
        return;
    };

    // INVARIANT: Ancestors are always taken as originally declared.
    let declared = projects.clone();
    for (name, value) in projects.iter_mut() {
        if PROJECT_SETTINGS.contains(&name.as_str()) {
            continue;
        }

        let Value::Table(project) = value else {
            continue;
        };

        let ancestors = project_ancestors(name, &declared);
        if ancestors.is_empty() {
            continue;
        }

        for ancestor in ancestors {
            fill_missing(project, ancestor);
        }
        project.remove("parent");
    }
}

fn project_ancestors<'a>(name: &'a str, declared: &'a Table) -> Vec<&'a Table> {
    let mut visited = vec![name];
    let mut ancestors = Vec::new();
    let mut current = declared.get(name).and_then(Value::as_table);

    while let Some(parent) = current.and_then(|project| project.get("parent")?.as_str()) {
        if visited.contains(&parent) {
            warn!("project {name:?} has cyclic parent {parent:?}, inheritance stops here");
            break;
        }

        if ancestors.len() == MAX_PARENT_HOPS {
            warn!("project {name:?} exceeds {MAX_PARENT_HOPS} parent hops, inheritance stops here");
            break;
        }

        let found = declared
            .get(parent)
            .filter(|_| !PROJECT_SETTINGS.contains(&parent))
            .and_then(Value::as_table);
        match found {
            Some(table) => {
                visited.push(parent);
                ancestors.push(table);
                current = Some(table);
            }
            None => {
                warn!("project {name:?} names unknown parent {parent:?}");
                break;
            }
        }
    }

    ancestors
}

// Deep merge where every key already present in the child wins.
fn fill_missing(child: &mut Table, ancestor: &Table) {
    for (key, value) in ancestor {
        if key == "parent" {
            continue;
        }

        if !child.contains_key(key) {
            child.insert(key.clone(), value.clone());
            continue;
        }

        if let (Some(Value::Table(child_table)), Value::Table(ancestor_table)) =
            (child.get_mut(key), value)
        {
            fill_missing(child_table, ancestor_table);
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned();

    Ok(PathBuf::from(expanded))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Local configuration file does not exist.
    #[error("missing configuration file {:?}", path.display())]
    Missing { path: PathBuf },

    /// Configuration file cannot be read.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file is not valid TOML.
    #[error("configuration file {:?} is not valid TOML", path.display())]
    Parse {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be written.
    #[error("failed to write configuration file {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file would be overwritten.
    #[error("not overwriting configuration file {:?}, pass edits to do so", path.display())]
    AlreadyExists { path: PathBuf },

    /// Edit parameter is not a known `field:value` pair.
    #[error("invalid edit parameter {0:?}, expected field:value with field one of ip, user, password, directory, app_name, or branch")]
    InvalidEditParam(String),

    /// Entry to edit does not exist.
    #[error("cannot edit unknown {section} entry {name:?}")]
    UnknownEditTarget { section: &'static str, name: String },

    /// Configuration field has the wrong shape.
    #[error("invalid field {field:?} in {:?}: {reason}", path.display())]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },

    /// Chain of parent configuration files is too deep.
    #[error("parent configs too deep: {:?} exceeds {max} files", path.display())]
    ChainTooDeep { path: PathBuf, max: usize },

    /// Default name does not match any entry of its section.
    #[error("default {section} entry {name:?} does not exist")]
    UnknownDefault { section: &'static str, name: String },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::{formatdoc, indoc};
    use pretty_assertions::assert_eq;
    use std::fs::write;
    use tempfile::TempDir;

    const BASE: &str = indoc! {r#"
        [devices]
        default = "roku"

        [devices.roku]
        ip = "192.168.0.100"
        user = "user"
        password = "password"

        [projects]
        default = "project1"

        [projects.project1]
        directory = "/tmp"
        folders = ["resources", "source"]
        files = ["manifest"]
        app_name = "app"
        stage_method = "Git"

        [projects.project1.stages.production]
        branch = "production"
        key = { keyed_pkg = "/tmp/prod.pkg", password = "secret" }

        [projects.project1.stages.beta]
        branch = "beta"
        key = "a"

        [keys.a]
        keyed_pkg = "/tmp/a.pkg"
        password = "password"

        [input_mappings]
        a = ["home", "Home"]
    "#};

    #[test]
    fn deserialize_config_document() -> anyhow::Result<()> {
        let result: ConfigDocument = BASE.parse()?;

        let project = result.project("project1").unwrap();
        assert_eq!(result.devices.default, "roku");
        assert_eq!(result.devices.entries["roku"].ip, "192.168.0.100");
        assert_eq!(project.stage_method, Some(StageMethod::Git));
        assert_eq!(project.directory, Some(PathBuf::from("/tmp")));
        assert_eq!(
            project.stages.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["production", "beta"]
        );
        assert_eq!(
            project.stages.get("beta").unwrap().key,
            Some(KeyRef::Named("a".into()))
        );
        assert_eq!(
            project.stages.get("production").unwrap().key,
            Some(KeyRef::Inline(KeyConfig {
                keyed_pkg: "/tmp/prod.pkg".into(),
                password: "secret".into(),
            }))
        );
        assert_eq!(
            result.input_mappings.unwrap()["a"],
            vec!["home".to_string(), "Home".to_string()]
        );

        Ok(())
    }

    #[test]
    fn display_round_trips_through_toml() -> anyhow::Result<()> {
        let expect: ConfigDocument = BASE.parse()?;
        let result: ConfigDocument = expect.to_string().parse()?;
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn reject_unknown_default_device() {
        let data = BASE.replace(r#"default = "roku""#, r#"default = "tv""#);
        let result = data.parse::<ConfigDocument>();
        assert!(matches!(
            result,
            Err(ConfigError::UnknownDefault { section: "devices", ref name }) if name == "tv"
        ));
    }

    #[test]
    fn reject_unknown_stage_method() {
        let data = BASE.replace(r#"stage_method = "Git""#, r#"stage_method = "rsync""#);
        let result = data.parse::<ConfigDocument>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[test]
    fn project_inherits_unset_fields_from_parent() -> anyhow::Result<()> {
        let data = formatdoc! {r#"
            {BASE}
            [projects.project2]
            parent = "project1"
            app_name = "child"

            [projects.project2.stages.production]
            branch = "release"
        "#};
        let result: ConfigDocument = data.parse()?;

        let project = result.project("project2").unwrap();
        assert_eq!(project.app_name, Some("child".into()));
        assert_eq!(project.directory, Some(PathBuf::from("/tmp")));
        assert_eq!(project.stage_method, Some(StageMethod::Git));
        assert_eq!(project.parent, None);

        // Nested stage tables merge key by key.
        let production = project.stages.get("production").unwrap();
        assert_eq!(production.branch, Some("release".into()));
        assert!(production.key.is_some());
        assert!(project.stages.get("beta").is_some());

        Ok(())
    }

    #[test]
    fn project_inheritance_follows_grandparents() -> anyhow::Result<()> {
        let data = formatdoc! {r#"
            {BASE}
            [projects.project2]
            parent = "project1"
            app_name = "middle"

            [projects.project3]
            parent = "project2"
            directory = "/opt"
        "#};
        let result: ConfigDocument = data.parse()?;

        let project = result.project("project3").unwrap();
        assert_eq!(project.directory, Some(PathBuf::from("/opt")));
        assert_eq!(project.app_name, Some("middle".into()));
        assert_eq!(project.files, Some(vec!["manifest".into()]));

        Ok(())
    }

    #[test]
    fn self_referential_parent_terminates() -> anyhow::Result<()> {
        let data = formatdoc! {r#"
            {BASE}
            [projects.loop]
            parent = "loop"
            directory = "/srv"
        "#};
        let result: ConfigDocument = data.parse()?;

        let project = result.project("loop").unwrap();
        assert_eq!(project.directory, Some(PathBuf::from("/srv")));
        assert_eq!(project.app_name, None);
        assert_eq!(project.parent, Some("loop".into()));

        Ok(())
    }

    #[test]
    fn cyclic_and_dangling_parents_terminate() -> anyhow::Result<()> {
        let data = formatdoc! {r#"
            {BASE}
            [projects.ping]
            parent = "pong"
            directory = "/ping"

            [projects.pong]
            parent = "ping"
            app_name = "pong"

            [projects.lost]
            parent = "nowhere"
            directory = "/lost"
        "#};
        let result: ConfigDocument = data.parse()?;

        let ping = result.project("ping").unwrap();
        assert_eq!(ping.directory, Some(PathBuf::from("/ping")));
        assert_eq!(ping.app_name, Some("pong".into()));

        let lost = result.project("lost").unwrap();
        assert_eq!(lost.directory, Some(PathBuf::from("/lost")));
        assert_eq!(lost.parent, Some("nowhere".into()));

        Ok(())
    }

    #[test]
    fn load_missing_local_file() {
        let result = load("/definitely/not/here/sideloader.toml");
        assert!(matches!(result, Err(ConfigError::Missing { .. })));
    }

    #[test]
    fn load_parent_chain_child_wins() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir(dir.path().join("shared"))?;
        write(dir.path().join("shared").join("parent.toml"), BASE)?;
        write(
            dir.path().join("local.toml"),
            indoc! {r#"
                parent_config = "shared/parent.toml"

                [devices]
                default = "tv"

                [devices.tv]
                ip = "10.0.0.2"
            "#},
        )?;

        let result = load(dir.path().join("local.toml"))?;

        // Devices section of child hides the parent's devices entirely.
        assert_eq!(result.devices.default, "tv");
        assert_eq!(result.devices.entries.len(), 1);
        assert!(result.project("project1").is_some());
        assert!(result.keys.is_some());

        Ok(())
    }

    fn write_chain(dir: &Path, length: usize) -> anyhow::Result<PathBuf> {
        for index in 0..length {
            let content = if index + 1 == length {
                BASE.to_string()
            } else {
                format!("parent_config = \"layer{}.toml\"\n", index + 1)
            };
            write(dir.join(format!("layer{index}.toml")), content)?;
        }

        Ok(dir.join("layer0.toml"))
    }

    #[test]
    fn load_chain_at_max_depth() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let local = write_chain(dir.path(), MAX_CHAIN_DEPTH)?;
        let result = load(local)?;
        assert_eq!(result.devices.default, "roku");

        Ok(())
    }

    #[test]
    fn load_chain_too_deep() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let local = write_chain(dir.path(), MAX_CHAIN_DEPTH + 1)?;
        let result = load(local);
        assert!(matches!(result, Err(ConfigError::ChainTooDeep { max: 10, .. })));

        Ok(())
    }

    #[test]
    fn load_cyclic_chain_fails() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        write(dir.path().join("a.toml"), "parent_config = \"b.toml\"\n")?;
        write(dir.path().join("b.toml"), "parent_config = \"a.toml\"\n")?;
        let result = load(dir.path().join("a.toml"));
        assert!(matches!(result, Err(ConfigError::ChainTooDeep { .. })));

        Ok(())
    }

    #[test]
    fn load_invalid_toml() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        write(dir.path().join("broken.toml"), "[devices\n")?;
        let result = load(dir.path().join("broken.toml"));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));

        Ok(())
    }

    #[test]
    fn global_config_fills_missing_sections() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (globals, locals) = BASE.split_at(BASE.find("[projects]").unwrap());
        write(dir.path().join("global.toml"), globals)?;
        write(dir.path().join("local.toml"), locals)?;

        let result = load_with_global(
            dir.path().join("local.toml"),
            Some(dir.path().join("global.toml")),
        )?;
        assert_eq!(result.devices.default, "roku");
        assert!(result.keys.is_some());

        let result = load_with_global(
            dir.path().join("local.toml"),
            Some(dir.path().join("missing.toml")),
        );
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));

        Ok(())
    }

    #[test]
    fn example_config_loads() -> anyhow::Result<()> {
        let result: ConfigDocument = EXAMPLE_CONFIG.parse()?;
        assert!(result.devices.entries.contains_key(&result.devices.default));
        assert!(result.projects.is_some());

        Ok(())
    }

    #[test]
    fn parse_edit_params() -> anyhow::Result<()> {
        let result: EditParams = "ip:192.168.0.2, user:dev,branch:release:2".parse()?;
        assert_eq!(
            result.iter().cloned().collect::<Vec<_>>(),
            vec![
                (EditField::Ip, "192.168.0.2".to_string()),
                (EditField::User, "dev".to_string()),
                (EditField::Branch, "release:2".to_string()),
            ]
        );

        assert!(matches!(
            "colour:blue".parse::<EditParams>(),
            Err(ConfigError::InvalidEditParam(ref param)) if param == "colour"
        ));
        assert!(matches!(
            "ip".parse::<EditParams>(),
            Err(ConfigError::InvalidEditParam(_))
        ));

        Ok(())
    }

    #[test]
    fn edit_default_entries() -> anyhow::Result<()> {
        let mut result: ConfigDocument = BASE.parse()?;
        let params = "ip:10.0.0.9, password:hunter2, app_name:renamed, directory:/srv/app, branch:hotfix"
            .parse()?;
        result.edit(&EditTarget::default(), &params)?;

        let device = &result.devices.entries["roku"];
        assert_eq!(device.ip, "10.0.0.9");
        assert_eq!(device.password, "hunter2");
        assert_eq!(device.user, "user");

        let project = result.project("project1").unwrap();
        assert_eq!(project.app_name, Some("renamed".into()));
        assert_eq!(project.directory, Some(PathBuf::from("/srv/app")));
        assert_eq!(project.stages.get("production").unwrap().branch, Some("hotfix".into()));
        assert_eq!(project.stages.get("beta").unwrap().branch, Some("beta".into()));

        Ok(())
    }

    #[test]
    fn edit_named_stage_and_reject_unknown_target() -> anyhow::Result<()> {
        let mut result: ConfigDocument = BASE.parse()?;
        let target = EditTarget {
            stage: Some("beta".into()),
            ..EditTarget::default()
        };
        result.edit(&target, &"branch:next".parse()?)?;
        let project = result.project("project1").unwrap();
        assert_eq!(project.stages.get("beta").unwrap().branch, Some("next".into()));

        let target = EditTarget {
            device: Some("tv".into()),
            ..EditTarget::default()
        };
        let edit = result.edit(&target, &"ip:10.0.0.2".parse()?);
        assert!(matches!(
            edit,
            Err(ConfigError::UnknownEditTarget { section: "devices", ref name }) if name == "tv"
        ));

        Ok(())
    }

    #[test]
    fn configure_then_edit_round_trips_through_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("sideloader.toml");
        configure(&path, false)?;
        assert!(matches!(
            configure(&path, false),
            Err(ConfigError::AlreadyExists { .. })
        ));

        let mut config = load(&path)?;
        config.edit(&EditTarget::default(), &"ip:10.1.1.1".parse()?)?;
        config.save(&path)?;

        let result = load(&path)?;
        assert_eq!(result.devices.entries[&result.devices.default].ip, "10.1.1.1");
        assert_eq!(result.projects, config.projects);

        configure(&path, true)?;
        assert_eq!(std::fs::read_to_string(&path)?, EXAMPLE_CONFIG);

        Ok(())
    }
}
