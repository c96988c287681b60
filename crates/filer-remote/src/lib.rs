//! Remote administration of storage filers over SSH
//!
//! This crate provides the pieces storage backends use to run commands on a
//! filer they manage:
//!
//! - A bounded, per-endpoint pool of authenticated SSH sessions
//! - A shell-injection guard for command arguments
//! - A policy-driven retry engine with pluggable failure classification
//! - Atomic remote file replacement
//! - Privileged local command execution through a root helper
//!
//! # Example
//!
//! ```ignore
//! use filer_remote::ssh::{ssh_execute, Endpoint, SshPool};
//! use filer_remote::FilerConfig;
//!
//! let config = FilerConfig::load(None)?;
//! let endpoint = Endpoint::builder().host("filer01").login("admin").password("secret").build();
//! let pool = SshPool::for_endpoint(endpoint, config.pool_config())?;
//!
//! let session = pool.acquire().await?;
//! let output = ssh_execute(&session, &["exportfs", "-v"], true).await;
//! pool.release(session);
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for standalone logging to the terminal.
///
/// This sets up tracing to output directly to stderr with the log level
/// controlled by the `RUST_LOG` environment variable.
///
/// Applications that already route the `log` crate somewhere do not need
/// this: the `log` feature of `tracing` forwards every event from this crate
/// as a `log` record when no subscriber is installed.
///
/// ```ignore
/// // Set RUST_LOG=filer_remote=debug to see pool and retry activity
/// filer_remote::init_tracing();
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub mod access;
pub mod config;
pub mod error;
pub mod guard;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod root_helper;
pub mod ssh;

pub use config::FilerConfig;
pub use error::{Error, ErrorKind, Result};
