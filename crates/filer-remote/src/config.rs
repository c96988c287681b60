//! Configuration consumed from a YAML file and the environment
//!
//! Every field has a default, so an empty file (or no file at all) is valid.
//! Environment variables override whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::root_helper::{RootHelper, DEFAULT_ROOT_HELPER};
use crate::ssh::RemoteFileWriter;

pub const CONFIG_PATH_ENV: &str = "FILER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilerConfig {
    /// Maximum number of sessions kept per filer endpoint
    pub ssh_max_pool_size: usize,

    /// Seconds allowed to connect and authenticate; 0 disables the limit
    pub ssh_conn_timeout: u64,

    /// Seconds to wait for a session from a saturated pool; 0 waits forever
    pub ssh_acquire_timeout: u64,

    /// Prefix for privileged local commands
    pub root_helper: String,

    /// Prefix for privileged remote commands
    pub remote_root_prefix: String,

    pub known_hosts_file: Option<String>,

    pub migration_wait_access_rules_timeout: u64,
}

impl Default for FilerConfig {
    fn default() -> Self {
        Self {
            ssh_max_pool_size: 10,
            ssh_conn_timeout: 60,
            ssh_acquire_timeout: 60,
            root_helper: DEFAULT_ROOT_HELPER.to_string(),
            remote_root_prefix: "sudo".to_string(),
            known_hosts_file: None,
            migration_wait_access_rules_timeout: 180,
        }
    }
}

impl FilerConfig {
    /// Load from `path` (or `$FILER_CONFIG` when no path is given), then apply
    /// `FILER_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::from_yaml(&std::fs::read_to_string(&path)?)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply overrides from `lookup`, which maps an environment variable name
    /// to its value
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("FILER_SSH_MAX_POOL_SIZE") {
            self.ssh_max_pool_size = parse_number("FILER_SSH_MAX_POOL_SIZE", &value)?;
        }
        if let Some(value) = lookup("FILER_SSH_CONN_TIMEOUT") {
            self.ssh_conn_timeout = parse_number("FILER_SSH_CONN_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("FILER_SSH_ACQUIRE_TIMEOUT") {
            self.ssh_acquire_timeout = parse_number("FILER_SSH_ACQUIRE_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("FILER_ROOT_HELPER") {
            self.root_helper = value;
        }
        if let Some(value) = lookup("FILER_REMOTE_ROOT_PREFIX") {
            self.remote_root_prefix = value;
        }
        if let Some(value) = lookup("FILER_KNOWN_HOSTS_FILE") {
            self.known_hosts_file = Some(value);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssh_max_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "ssh_max_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.ssh_conn_timeout > 0).then(|| Duration::from_secs(self.ssh_conn_timeout))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.ssh_max_pool_size,
            acquire_timeout: (self.ssh_acquire_timeout > 0)
                .then(|| Duration::from_secs(self.ssh_acquire_timeout)),
        }
    }

    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts_file
            .as_deref()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
    }

    pub fn access_rules_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_wait_access_rules_timeout)
    }

    pub fn root_helper(&self) -> RootHelper {
        RootHelper::new(&self.root_helper)
    }

    pub fn remote_file_writer(&self) -> RemoteFileWriter {
        RemoteFileWriter::new(self.remote_root_prefix.clone())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key} must be a non-negative integer, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FilerConfig::default();
        assert_eq!(config.pool_config().max_size, 10);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(
            config.pool_config().acquire_timeout,
            Some(Duration::from_secs(60))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = FilerConfig::from_yaml("ssh_max_pool_size: 3\nssh_conn_timeout: 0\n").unwrap();
        assert_eq!(config.ssh_max_pool_size, 3);
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.remote_root_prefix, "sudo");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(FilerConfig::from_yaml("  \n").unwrap(), FilerConfig::default());
    }

    #[test]
    fn test_malformed_yaml() {
        let err = FilerConfig::from_yaml("ssh_max_pool_size: [nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FilerConfig::default();
        config
            .apply_overrides(env(&[
                ("FILER_SSH_MAX_POOL_SIZE", "4"),
                ("FILER_SSH_ACQUIRE_TIMEOUT", "0"),
                ("FILER_ROOT_HELPER", "doas"),
                ("FILER_KNOWN_HOSTS_FILE", "/etc/filer/known_hosts"),
            ]))
            .unwrap();

        assert_eq!(config.ssh_max_pool_size, 4);
        assert_eq!(config.pool_config().acquire_timeout, None);
        assert_eq!(config.root_helper, "doas");
        assert_eq!(
            config.known_hosts_path(),
            Some(PathBuf::from("/etc/filer/known_hosts"))
        );
    }

    #[test]
    fn test_invalid_env_number() {
        let mut config = FilerConfig::default();
        let err = config
            .apply_overrides(env(&[("FILER_SSH_CONN_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_pool_size_invalid() {
        let config = FilerConfig {
            ssh_max_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filer.yaml");
        std::fs::write(
            &path,
            "remote_root_prefix: doas\nmigration_wait_access_rules_timeout: 30\n",
        )
        .unwrap();

        let config = FilerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote_root_prefix, "doas");
        assert_eq!(config.access_rules_timeout(), Duration::from_secs(30));
    }
}
