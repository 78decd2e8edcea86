// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sideloader::{
    config::{configure, EditParams, EditTarget},
    load_with_global,
    path::{default_config_path, default_global_config_path},
    resolve, ConfigDocument, ResolveOptions, Stager,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    env::current_dir,
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  sideloader [options] <command> [source_options]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to local configuration file.
    #[arg(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to global configuration file.
    #[arg(long, global = true, value_name = "path")]
    pub global_config: Option<PathBuf>,

    /// Log what is being done.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log everything, including internal details.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }

    fn run(self) -> Result<()> {
        if let Command::Configure(opts) = &self.command {
            return self.run_configure(opts);
        }

        let local = self.local_config_path()?;
        let config = self.load_config()?;
        match self.command {
            Command::Configure(_) => Ok(()),
            Command::Validate => Ok(()),
            Command::Edit(opts) => run_edit(config, &local, opts),
            Command::Context(opts) => run_context(&config, opts),
            Command::Stage(opts) => run_stage(&config, opts),
            Command::Unstage(opts) => run_unstage(&config, opts),
        }
    }

    fn run_configure(&self, opts: &ConfigureOptions) -> Result<()> {
        let local = self.local_config_path()?;
        configure(&local, opts.edit.is_some())?;
        if let Some(params) = &opts.edit {
            let config = self.load_config()?;
            let opts = EditOptions {
                params: params.clone(),
                project: None,
                device: None,
                stage: None,
            };
            run_edit(config, &local, opts)?;
        }
        info!("configured {:?}", local.display());

        Ok(())
    }

    fn local_config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(default_config_path()?),
        }
    }

    fn load_config(&self) -> Result<ConfigDocument> {
        let local = self.local_config_path()?;
        let global = match &self.global_config {
            Some(path) => Some(path.clone()),
            None => default_global_config_path().ok(),
        };

        load_with_global(&local, global)
            .with_context(|| format!("cannot load configuration {:?}", local.display()))
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Seed local configuration file from the example configuration.
    #[command(override_usage = "sideloader configure [options] [-e <params>]")]
    Configure(ConfigureOptions),

    /// Edit device, project, or stage fields of the configuration.
    #[command(override_usage = "sideloader edit [options] <params>")]
    Edit(EditOptions),

    /// Load and validate configuration.
    #[command(override_usage = "sideloader validate [options]")]
    Validate,

    /// Print resolved context of an invocation.
    #[command(override_usage = "sideloader context [options] [source_options]")]
    Context(SourceOptions),

    /// Stage source tree of a project.
    #[command(override_usage = "sideloader stage [options] [source_options]")]
    Stage(SourceOptions),

    /// Put a staged source tree back.
    #[command(override_usage = "sideloader unstage [options] [source_options]")]
    Unstage(SourceOptions),
}

#[derive(Args, Clone, Debug)]
struct ConfigureOptions {
    /// Edits to apply after seeding, e.g., "ip:192.168.0.2, user:dev".
    ///
    /// An existing configuration file is only overwritten with edits given.
    #[arg(short, long, value_name = "params")]
    pub edit: Option<EditParams>,
}

#[derive(Args, Clone, Debug)]
struct EditOptions {
    /// Edits in field:value form, separated by commas.
    #[arg(required = true, value_name = "params")]
    pub params: EditParams,

    /// Project to edit instead of the default project.
    #[arg(short = 'P', long, value_name = "project")]
    pub project: Option<String>,

    /// Device to edit instead of the default device.
    #[arg(short = 'D', long, value_name = "device")]
    pub device: Option<String>,

    /// Stage to edit instead of the project's first stage.
    #[arg(short, long, value_name = "stage")]
    pub stage: Option<String>,
}

#[derive(Args, Clone, Debug)]
struct SourceOptions {
    /// Git reference to stage instead of the stage's branch.
    #[arg(short, long = "ref", value_name = "ref")]
    pub git_ref: Option<String>,

    /// Use the project's working directory as is.
    #[arg(short, long, group = "source")]
    pub working: bool,

    /// Use the current directory as the source.
    #[arg(short, long, group = "source")]
    pub current: bool,

    /// Use an artifact or folder as the source.
    #[arg(short, long = "in", group = "source", value_name = "path")]
    pub input: Option<PathBuf>,

    /// Stage of the project to use.
    #[arg(short, long, value_name = "stage")]
    pub stage: Option<String>,

    /// Project to use instead of detecting one.
    #[arg(short = 'P', long, value_name = "project")]
    pub project: Option<String>,

    /// Device to use instead of the default device.
    #[arg(short = 'D', long, value_name = "device")]
    pub device: Option<String>,

    /// Artifact or folder to write output to.
    #[arg(short, long, value_name = "path")]
    pub out: Option<PathBuf>,
}

impl SourceOptions {
    fn into_resolve_options(self) -> Result<ResolveOptions> {
        Ok(ResolveOptions {
            requires_source: true,
            device: self.device,
            project: self.project,
            stage: self.stage,
            git_ref: self.git_ref,
            working: self.working,
            current: self.current,
            input: self.input,
            out: self.out,
            working_dir: current_dir()?,
        })
    }
}

fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run_edit(mut config: ConfigDocument, path: &Path, opts: EditOptions) -> Result<()> {
    let target = EditTarget {
        device: opts.device,
        project: opts.project,
        stage: opts.stage,
    };
    config.edit(&target, &opts.params)?;
    config
        .save(path)
        .with_context(|| format!("cannot save configuration {:?}", path.display()))?;
    info!("edited {:?}", path.display());

    Ok(())
}

fn run_context(config: &ConfigDocument, opts: SourceOptions) -> Result<()> {
    let context = resolve(config, &opts.into_resolve_options()?)?;
    print!("{context}");

    Ok(())
}

fn run_stage(config: &ConfigDocument, opts: SourceOptions) -> Result<()> {
    let context = resolve(config, &opts.into_resolve_options()?)?;
    let mut stager = Stager::new(&context)?;
    if !stager.stage() {
        bail!("failed to stage {} source", stager.method());
    }
    info!("staged {} source at {:?}", stager.method(), context.root_dir.display());

    Ok(())
}

fn run_unstage(config: &ConfigDocument, opts: SourceOptions) -> Result<()> {
    let context = resolve(config, &opts.into_resolve_options()?)?;
    let mut stager = Stager::new(&context)?;
    if !stager.unstage() {
        bail!("failed to unstage {} source", stager.method());
    }
    info!("unstaged {} source at {:?}", stager.method(), context.root_dir.display());

    Ok(())
}
