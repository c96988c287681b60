// Handle making SSH connections to a filer. Pooling lives in `ssh::pool`,
// this is the actual plumbing around the russh crate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::*;
use tokio::time::timeout;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// What to do with a server host key we have not seen before
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust unknown hosts and record them in known_hosts. Changed keys are rejected.
    #[default]
    AutoAdd,
    /// Accept any key without recording it
    AcceptAll,
    /// Only accept hosts already present in known_hosts
    Strict,
}

/// A remote filer reachable over SSH. Immutable once handed to a pool.
#[derive(Clone, TypedBuilder)]
pub struct Endpoint {
    #[builder(setter(into))]
    pub host: String,

    #[builder(default = 22)]
    pub port: u16,

    #[builder(default = whoami::username(), setter(into))]
    pub login: String,

    #[builder(default, setter(strip_option, into))]
    pub password: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub private_key: Option<PathBuf>,

    /// Bounds connect + authenticate, and doubles as the keepalive interval
    #[builder(default, setter(strip_option))]
    pub connect_timeout: Option<Duration>,

    #[builder(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Defaults to ~/.ssh/known_hosts
    #[builder(default, setter(strip_option, into))]
    pub known_hosts: Option<PathBuf>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts", &self.known_hosts)
            .finish()
    }
}

/// Authentication methods, in the order an endpoint prefers them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Key(PathBuf),
    Password(String),
    /// Try the SSH agent, then the default key files
    Discover,
}

impl Endpoint {
    /// `login@host:port`, used to name the endpoint in logs and errors
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.login, self.host, self.port)
    }

    /// A configured private key wins over a password, which wins over key discovery
    pub fn authentication(&self) -> Authentication {
        if let Some(key) = &self.private_key {
            let expanded = shellexpand::tilde(&key.to_string_lossy()).into_owned();
            Authentication::Key(PathBuf::from(expanded))
        } else if let Some(password) = &self.password {
            Authentication::Password(password.clone())
        } else {
            Authentication::Discover
        }
    }

    fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")))
    }
}

/// Result of executing a command on the remote system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Turn a non-zero exit status into [`Error::ProcessExecution`]
    pub fn check(self, command: &str) -> Result<Self> {
        if self.exit_code == 0 {
            return Ok(self);
        }

        Err(Error::ProcessExecution {
            command: command.to_string(),
            exit_code: Some(self.exit_code),
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Something that can run a shell command on a remote host
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command`, feeding `input` to its stdin and closing it before
    /// waiting for the exit status
    async fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput>;
}

/// SSH client handler for russh, applying the endpoint's host key policy
pub struct Client {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl Client {
    fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            policy: endpoint.host_key_policy,
            known_hosts: endpoint.known_hosts_path(),
        }
    }

    fn check_known_host(&self, key: &russh::keys::PublicKey, path: &Path) -> bool {
        match russh::keys::check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => true,
            Ok(false) if self.policy == HostKeyPolicy::AutoAdd => {
                tracing::info!(
                    "Adding unknown host key for {}:{} to {}",
                    self.host,
                    self.port,
                    path.display()
                );
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts_path(
                    &self.host, self.port, key, path,
                ) {
                    tracing::warn!("Failed to record host key for {}: {e}", self.host);
                }
                true
            }
            Ok(false) => {
                tracing::error!(
                    "Host key for {}:{} is not in {}",
                    self.host,
                    self.port,
                    path.display()
                );
                false
            }
            Err(e) => {
                tracing::error!("Rejecting host key for {}:{}: {e}", self.host, self.port);
                false
            }
        }
    }
}

impl russh::client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAll {
            return Ok(true);
        }

        match self.known_hosts.as_deref() {
            Some(path) => Ok(self.check_known_host(server_public_key, path)),
            None => {
                tracing::warn!(
                    "No known_hosts file available, accepting host key for {}",
                    self.host
                );
                Ok(self.policy == HostKeyPolicy::AutoAdd)
            }
        }
    }
}

/// An authenticated SSH session to one filer
pub struct Session {
    session: Handle<Client>,
    address: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open and authenticate a new session. Any failure is reported as
    /// [`Error::Connection`] naming the endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let address = endpoint.address();
        tracing::debug!(
            "ssh.connect: {address}, auth: {:?}, timeout: {:?}",
            AuthLabel(&endpoint.authentication()),
            endpoint.connect_timeout
        );

        let connecting = Self::open_and_authenticate(endpoint);
        let result = match endpoint.connect_timeout {
            Some(limit) => match timeout(limit, connecting).await {
                Ok(result) => result,
                Err(_) => Err(Error::Connection {
                    endpoint: address.clone(),
                    message: format!("timed out after {limit:?}"),
                }),
            },
            None => connecting.await,
        };

        result.map_err(|e| {
            let message = match e {
                Error::Connection { message, .. } => message,
                other => other.to_string(),
            };
            tracing::error!("Error connecting via ssh to {address}: {message}");
            Error::Connection {
                endpoint: address.clone(),
                message,
            }
        })
    }

    async fn open_and_authenticate(endpoint: &Endpoint) -> Result<Self> {
        let config = russh::client::Config {
            keepalive_interval: endpoint.connect_timeout,
            ..Default::default()
        };

        let target = (endpoint.host.as_str(), endpoint.port);
        tracing::debug!("Connecting directly to: {}:{}", endpoint.host, endpoint.port);
        let session =
            russh::client::connect(Arc::new(config), target, Client::for_endpoint(endpoint))
                .await?;

        let mut session = Session {
            session,
            address: endpoint.address(),
        };

        let authenticated = match endpoint.authentication() {
            Authentication::Key(path) => session.key_auth(&endpoint.login, &path).await?,
            Authentication::Password(password) => {
                session.password_auth(&endpoint.login, &password).await?
            }
            Authentication::Discover => session.discover_auth(&endpoint.login).await?,
        };

        if !authenticated {
            return Err(Error::Connection {
                endpoint: endpoint.address(),
                message: "all authentication methods were rejected".to_string(),
            });
        }

        Ok(session)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Password authentication
    async fn password_auth(&mut self, username: &str, password: &str) -> Result<bool> {
        let auth_res = self
            .session
            .authenticate_password(username, password)
            .await?;

        Ok(matches!(auth_res, russh::client::AuthResult::Success))
    }

    /// Public key authentication with a key file
    async fn key_auth(&mut self, username: &str, key_path: &Path) -> Result<bool> {
        tracing::debug!(
            "Attempting public key authentication with {}",
            key_path.display()
        );

        let key_pair = russh::keys::load_secret_key(key_path, None).map_err(|e| {
            Error::Connection {
                endpoint: self.address.clone(),
                message: format!("failed to load key {}: {e}", key_path.display()),
            }
        })?;

        // Query the server for the best RSA hash algorithm it supports
        let best_hash = self.session.best_supported_rsa_hash().await?.flatten();
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), best_hash);

        let auth_res = self
            .session
            .authenticate_publickey(username, key_with_alg)
            .await?;

        match auth_res {
            russh::client::AuthResult::Success => Ok(true),
            russh::client::AuthResult::Failure {
                remaining_methods, ..
            } => {
                tracing::debug!(
                    "Server rejected key {} (remaining methods: {:?})",
                    key_path.display(),
                    remaining_methods
                );
                Ok(false)
            }
        }
    }

    /// Neither a key nor a password was configured: try the agent, then the
    /// default key files
    async fn discover_auth(&mut self, username: &str) -> Result<bool> {
        if self.agent_auth(username).await {
            return Ok(true);
        }

        for key_path in default_ssh_keys() {
            match self.key_auth(username, &key_path).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => tracing::debug!("Default SSH key failed: {e}"),
            }
        }

        Ok(false)
    }

    async fn agent_auth(&mut self, username: &str) -> bool {
        let mut agent = match russh::keys::agent::client::AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::debug!("Cannot connect to SSH agent: {e}");
                return false;
            }
        };

        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!("Failed to request identities from SSH agent: {e}");
                return false;
            }
        };

        for (i, key) in keys.iter().enumerate() {
            match self
                .session
                .authenticate_publickey_with(username, key.clone(), None, &mut agent)
                .await
            {
                Ok(russh::client::AuthResult::Success) => {
                    tracing::debug!("Authenticated with SSH agent key #{}", i + 1);
                    return true;
                }
                Ok(_) => tracing::debug!("SSH agent key #{} rejected by server", i + 1),
                Err(e) => tracing::debug!("Error trying SSH agent key #{}: {e:?}", i + 1),
            }
        }

        false
    }

    /// Whether the transport is still up and answering. Runs a trivial
    /// command, so a half-open TCP connection is reported as dead.
    pub async fn is_alive(&self) -> bool {
        const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

        if self.session.is_closed() {
            return false;
        }

        let keepalive_check = async {
            let mut channel = self.session.channel_open_session().await.ok()?;
            channel.exec(true, "true").await.ok()?;

            let mut code = None;
            while let Some(msg) = channel.wait().await {
                if let ChannelMsg::ExitStatus { exit_status } = msg {
                    code = Some(exit_status);
                }
            }

            let _ = channel.close().await;
            code
        };

        match timeout(KEEPALIVE_TIMEOUT, keepalive_check).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => {
                tracing::debug!("SSH keepalive to {} timed out", self.address);
                false
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for Session {
    async fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;

        if let Some(input) = input {
            channel.data(input).await?;
        }
        // Nothing more will be written, so stdin readers see EOF
        channel.eof().await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code: Option<i32> = None;
        let mut got_eof = false;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    stdout.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    stderr.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                    if got_eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    got_eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let _ = channel.close().await;

        Ok(CommandOutput {
            stdout,
            stderr,
            // A channel closed without a status is treated like a killed process
            exit_code: exit_code.unwrap_or(-1),
        })
    }
}

/// Default private keys, in the order OpenSSH tries them
fn default_ssh_keys() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };

    let ssh_dir = home.join(".ssh");

    ["id_rsa", "id_ecdsa", "id_ecdsa_sk", "id_ed25519", "id_ed25519_sk", "id_dsa"]
        .into_iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

/// Logs an authentication method without its secret
struct AuthLabel<'a>(&'a Authentication);

impl fmt::Debug for AuthLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Authentication::Key(path) => write!(f, "key({})", path.display()),
            Authentication::Password(_) => write!(f, "password"),
            Authentication::Discover => write!(f, "agent/default keys"),
        }
    }
}
