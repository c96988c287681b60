//! SSH sessions to filers
//!
//! This module provides pooled, authenticated SSH sessions and the remote
//! commands storage backends run over them.
//!
//! Features:
//! - Bounded per-endpoint session pooling with lazy liveness checks
//! - Key file, password and agent/default-key authentication
//! - Known-hosts recording for previously unseen filers
//! - Injection-checked remote command execution
//! - Atomic remote file replacement

mod pool;
mod remote_file;
mod session;


pub use pool::{SessionFactory, SshPool};
pub use remote_file::{ssh_execute, RemoteFileWriter};
pub use session::{
    Authentication, Client, CommandOutput, Endpoint, HostKeyPolicy, RemoteExec, Session,
};
