//! Local command execution, optionally through a privilege-escalation helper

use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};

pub const DEFAULT_ROOT_HELPER: &str = "sudo filer-rootwrap /etc/filer/rootwrap.conf";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs administrative commands on the local host
#[derive(Debug, Clone)]
pub struct RootHelper {
    prefix: Vec<String>,
    /// Exit codes treated as success
    check_exit_code: Vec<i32>,
}

impl Default for RootHelper {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_HELPER)
    }
}

impl RootHelper {
    /// `root_helper` is split on whitespace and prepended to privileged commands
    pub fn new(root_helper: &str) -> Self {
        Self {
            prefix: root_helper.split_whitespace().map(str::to_string).collect(),
            check_exit_code: vec![0],
        }
    }

    pub fn with_success_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.check_exit_code = codes.into_iter().collect();
        self
    }

    /// The full argument vector that would be run
    pub fn command_line(&self, args: &[impl AsRef<str>], run_as_root: bool) -> Vec<String> {
        let prefix = if run_as_root { self.prefix.as_slice() } else { &[] };
        prefix
            .iter()
            .cloned()
            .chain(args.iter().map(|a| a.as_ref().to_string()))
            .collect()
    }

    pub async fn execute(&self, args: &[impl AsRef<str>], run_as_root: bool) -> Result<ProcessOutput> {
        let argv = self.command_line(args, run_as_root);
        let Some((program, rest)) = argv.split_first() else {
            return Err(Error::InvalidConfig("Empty command".to_string()));
        };
        let command = argv.join(" ");

        tracing::debug!("Running cmd (subprocess): {command}");
        let output = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();
        tracing::debug!("CMD \"{command}\" returned: {exit_code:?}");

        match exit_code {
            Some(code) if self.check_exit_code.contains(&code) => Ok(ProcessOutput { stdout, stderr }),
            _ => Err(Error::ProcessExecution {
                command,
                exit_code,
                stdout,
                stderr,
            }),
        }
    }
}
