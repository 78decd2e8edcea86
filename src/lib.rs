// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Core of a device deployment tool.
//!
//! Sideloader reads a layered configuration of devices, projects, and signing
//! keys, resolves it against what the operator asked for on the command line,
//! and prepares the project's source tree before a device operation runs. It
//! then puts the tree back afterwards.
//!
//! - [`config`] loads and merges configuration files.
//! - [`resolve`] turns configuration and options into a [`ResolvedContext`].
//! - [`stage`] stages and unstages source trees.
//! - [`store`] persists what unstaging in a later process needs.

pub mod config;
pub mod path;
pub mod resolve;
pub mod stage;
pub mod store;

#[doc(inline)]
pub use config::{load, load_with_global, ConfigDocument, ConfigError};

#[doc(inline)]
pub use resolve::{resolve, ResolveError, ResolveOptions, ResolvedContext};

#[doc(inline)]
pub use stage::{StageMethod, Stager};
