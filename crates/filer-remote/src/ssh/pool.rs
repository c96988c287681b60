// Pooled SSH sessions to a single filer endpoint.
// One pool per endpoint, owned by whoever administers that filer.

use async_trait::async_trait;

use super::session::{Endpoint, Session};
use crate::error::Result;
use crate::pool::{Pool, PoolConfig, ResourceManager};

/// Creates, probes and closes sessions for one endpoint
#[derive(Debug, Clone)]
pub struct SessionFactory {
    endpoint: Endpoint,
}

impl SessionFactory {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ResourceManager for SessionFactory {
    type Resource = Session;

    async fn create(&self) -> Result<Session> {
        tracing::debug!("Creating new SSH connection for {}", self.endpoint.address());
        Session::connect(&self.endpoint).await
    }

    async fn validate(&self, session: &Session) -> bool {
        session.is_alive().await
    }

    async fn destroy(&self, session: Session) {
        if let Err(e) = session.close().await {
            tracing::debug!("Error closing SSH connection to {}: {e}", session.address());
        }
    }

    fn describe(&self) -> String {
        self.endpoint.address()
    }
}

/// A bounded pool of authenticated sessions to one filer
pub type SshPool = Pool<SessionFactory>;

impl Pool<SessionFactory> {
    pub fn for_endpoint(endpoint: Endpoint, config: PoolConfig) -> Result<Self> {
        tracing::debug!(
            "Creating SSH pool for {} (max size {})",
            endpoint.address(),
            config.max_size
        );
        Pool::new(SessionFactory::new(endpoint), config)
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.manager().endpoint()
    }
}
