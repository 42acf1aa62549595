//! Execution shim for privileged OS operations.
//!
//! Mounting overlays, loop devices, mkfs and archive creation all require
//! external tools and root. The core never shells out directly: it talks to
//! a [`CommandExecutor`], so the privileged surface is one small trait that
//! tests replace with a recorder.

use std::process::Command;

use crate::error::{ExplorerError, Result};

/// Captured result of an executed command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr concatenated, for log and error messages.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Executes privileged external commands on behalf of the core.
pub trait CommandExecutor {
    /// Run `program` with `args`, capturing output. A non-zero exit maps to
    /// [`ExplorerError::ShimFailure`] carrying the argv and combined
    /// output.
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Executor backed by the host's real commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    #[cfg(unix)]
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "executing command");
        let output = Command::new(program).args(args).output().map_err(|e| {
            ExplorerError::io(std::path::PathBuf::from(program), e)
        })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().map(|a| a.to_string()));
            return Err(ExplorerError::ShimFailure {
                argv,
                output: result.combined(),
            });
        }
        Ok(result)
    }

    #[cfg(not(unix))]
    fn execute(&self, _program: &str, _args: &[&str]) -> Result<CommandOutput> {
        Err(ExplorerError::UnsupportedPlatform("external command execution"))
    }
}
