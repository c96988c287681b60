use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Run administrative commands against a storage filer")]
pub struct Args {
    /// Path to a YAML configuration file (defaults to $FILER_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command on the filer over SSH
    Exec {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        retry: RetryArgs,

        /// The command and its arguments
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Atomically replace a file on the filer with the contents of stdin
    WriteFile {
        #[command(flatten)]
        target: Target,

        /// Remote path to replace
        path: String,

        /// Read the contents from this local file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,

        /// Write through the remote root prefix
        #[arg(long)]
        as_root: bool,
    },

    /// Run a command locally, optionally through the root helper
    Local {
        #[arg(long)]
        root: bool,

        #[command(flatten)]
        retry: RetryArgs,

        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Check command arguments against the injection guard without running them
    Check {
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
}

/// Which filer to connect to, and how
#[derive(ClapArgs, Debug, Clone)]
pub struct Target {
    #[arg(long)]
    pub host: String,

    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// Defaults to the current user
    #[arg(long)]
    pub login: Option<String>,

    #[arg(long, env = "FILER_SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Private key file, preferred over the password
    #[arg(long)]
    pub key: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RetryArgs {
    /// Attempts before giving up
    #[arg(long, default_value_t = 1)]
    pub retries: u32,

    /// Seconds to wait after the first failure
    #[arg(long, default_value_t = 1)]
    pub interval: u64,

    #[arg(long, default_value_t = 2.0)]
    pub backoff_rate: f64,

    /// Only retry failures with these exit codes (default: any failure)
    #[arg(long = "retry-exit-code")]
    pub exit_codes: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let args = Args::parse_from([
            "filer-run",
            "exec",
            "--host",
            "filer01",
            "--login",
            "admin",
            "--retries",
            "3",
            "--retry-exit-code",
            "255",
            "--",
            "ls",
            "-la",
        ]);

        match args.command {
            Command::Exec {
                target,
                retry,
                args,
            } => {
                assert_eq!(target.host, "filer01");
                assert_eq!(target.port, 22);
                assert_eq!(target.login.as_deref(), Some("admin"));
                assert_eq!(retry.retries, 3);
                assert_eq!(retry.exit_codes, vec![255]);
                assert_eq!(args, vec!["ls", "-la"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_write_file() {
        let args = Args::parse_from([
            "filer-run",
            "--config",
            "/etc/filer.yaml",
            "write-file",
            "--host",
            "filer01",
            "--as-root",
            "/etc/exports",
        ]);

        assert_eq!(args.config, Some(PathBuf::from("/etc/filer.yaml")));
        match args.command {
            Command::WriteFile {
                path, as_root, from, ..
            } => {
                assert_eq!(path, "/etc/exports");
                assert!(as_root);
                assert!(from.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
