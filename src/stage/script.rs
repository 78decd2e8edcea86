// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shell hook execution for the script staging method.

use std::{io::Error as IoError, process::Command};
use tracing::instrument;

/// Run a shell command to completion.
pub trait CommandRunner {
    /// Run command through the system shell in the current directory.
    ///
    /// Return combined output of stdout and stderr.
    fn run(&mut self, command: &str) -> Result<String, IoError>;
}

/// Command runner backed by the system shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    #[instrument(skip(self), level = "debug")]
    fn run(&mut self, command: &str) -> Result<String, IoError> {
        let output = shell().arg(command).output()?;
        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
        let mut message = String::new();

        if !stdout.is_empty() {
            message.push_str(format!("stdout: {stdout}").as_str());
        }

        if !stderr.is_empty() {
            message.push_str(format!("stderr: {stderr}").as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        let message = message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message);

        if !output.status.success() {
            return Err(IoError::other(format!(
                "command {command:?} failed with {}:\n{message}",
                output.status
            )));
        }

        Ok(message)
    }
}

#[cfg(unix)]
fn shell() -> Command {
    let mut command = Command::new("sh");
    command.arg("-c");
    command
}

#[cfg(windows)]
fn shell() -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C");
    command
}
