use std::time::Duration;

/// Errors raised while administering a filer over a remote session
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Connecting or authenticating a new session failed
    #[error(
        "Check whether private key or password are correctly set. Error connecting via ssh to {endpoint}: {message}"
    )]
    Connection { endpoint: String, message: String },

    /// A command argument failed shell-injection validation
    #[error("SSH command injection detected: {}", .command.join(" "))]
    InjectionThreat { command: Vec<String> },

    /// A local or remote process exited with a non-success status
    #[error(
        "Unexpected error while running command.\nCommand: {command}\nExit code: {}\nStdout: {stdout:?}\nStderr: {stderr:?}",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
    )]
    ProcessExecution {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Every pool slot stayed busy for longer than the acquire timeout
    #[error("Timed out after {waited:?} waiting for a free session to {endpoint}")]
    AcquireTimeout { endpoint: String, waited: Duration },

    #[error("Share migration failed: {reason}")]
    MigrationFailed { reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid backend: {0}")]
    InvalidBackend(String),

    #[error("SSH transport error: {0}")]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_yaml::Error),
}

/// Fieldless error category, used by retry classifiers that match on the
/// kind of failure rather than its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    InjectionThreat,
    ProcessExecution,
    AcquireTimeout,
    MigrationFailed,
    InvalidConfig,
    InvalidBackend,
    Ssh,
    Io,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::InjectionThreat { .. } => ErrorKind::InjectionThreat,
            Self::ProcessExecution { .. } => ErrorKind::ProcessExecution,
            Self::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            Self::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::InvalidBackend(_) => ErrorKind::InvalidBackend,
            Self::Ssh(_) => ErrorKind::Ssh,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// The exit status reported by a failed process, if this is a process failure
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExecution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub(crate) fn injection(command: &[impl AsRef<str>]) -> Self {
        Self::InjectionThreat {
            command: command.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
