//! Backend selection by configuration key
//!
//! Backends are registered up front as plain factory functions and looked up
//! by the name found in configuration. Nothing is loaded dynamically.

use std::collections::BTreeMap;

use crate::config::FilerConfig;
use crate::error::{Error, Result};

pub type BackendFactory<T> = fn(&FilerConfig) -> Result<T>;

pub struct BackendRegistry<T> {
    factories: BTreeMap<String, BackendFactory<T>>,
}

impl<T> Default for BackendRegistry<T> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<T> BackendRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous registration
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory<T>) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Build the backend registered as `name`
    pub fn load(&self, name: &str, config: &FilerConfig) -> Result<T> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::InvalidBackend(name.to_string()))?;

        tracing::debug!("Loading backend {name}");
        factory(config)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Backend {
        Nfs { pool_size: usize },
        Cifs,
    }

    fn registry() -> BackendRegistry<Backend> {
        let mut registry = BackendRegistry::new();
        registry
            .register("nfs", |config| {
                Ok(Backend::Nfs {
                    pool_size: config.ssh_max_pool_size,
                })
            })
            .register("cifs", |_| Ok(Backend::Cifs));
        registry
    }

    #[test]
    fn test_load_registered_backend() {
        let config = FilerConfig {
            ssh_max_pool_size: 4,
            ..Default::default()
        };
        assert_eq!(
            registry().load("nfs", &config).unwrap(),
            Backend::Nfs { pool_size: 4 }
        );
        assert_eq!(
            registry().load("cifs", &config).unwrap(),
            Backend::Cifs
        );
    }

    #[test]
    fn test_unknown_backend() {
        let err = registry()
            .load("glusterfs", &FilerConfig::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid backend: glusterfs");
    }

    #[test]
    fn test_names_sorted() {
        let registry = registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["cifs", "nfs"]);
    }
}
