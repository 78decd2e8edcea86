// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine well-known paths of files that sideloader reads or persists
//! between invocations.

use std::path::{Path, PathBuf};

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to the local configuration file.
///
/// Uses `$HOME/.sideloader.toml`. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    home_dir().map(|path| path.join(".sideloader.toml"))
}

/// Determine default absolute path to the global configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/sideloader/config.toml`.
/// The global file only fills in device, key, and input mapping sections
/// that the local configuration chain leaves out.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_global_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("sideloader").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the recovery record directory.
///
/// Uses `$HOME/.sideloader/recovery`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_recovery_dir() -> Result<PathBuf> {
    home_dir().map(|path| path.join(".sideloader").join("recovery"))
}

/// Make a path absolute relative to a base directory.
///
/// Absolute paths pass through untouched. Neither path needs to exist.
pub fn absolutize(path: impl AsRef<Path>, base: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.as_ref().join(path)
    }
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
