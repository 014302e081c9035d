//! Cloud node-pool management.
//!
//! The scaler manipulates the pool through [`NodePoolProvider`]; concrete
//! cloud integrations are [`Driver`]s held in an explicit [`DriverRegistry`]
//! built at startup. There is no global driver state.

pub mod digitalocean;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

/// Errors that can occur while managing the cloud node pool.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown cloud provider driver: {name}")]
    UnknownDriver { name: String },
    #[error("invalid provider configuration: {message}")]
    InvalidConfig { message: String },
    #[error("cluster not found: {name}")]
    ClusterNotFound { name: String },
    #[error("node pool not found: {name}")]
    NodePoolNotFound { name: String },
    #[error("cloud API request failed: {message}")]
    RequestFailed { message: String },
    #[error("failed to delete node {id}")]
    NodeDeleteFailed { id: String },
}

/// Connection settings shared by all drivers.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub token: String,
    pub cluster_name: String,
    pub node_pool_name: String,
}

/// Operations the scaler needs from the cloud node pool.
#[async_trait]
pub trait NodePoolProvider: Send + Sync + std::fmt::Debug {
    /// Request an absolute pool size. Idempotent with respect to the target;
    /// does not wait for new nodes to become ready.
    async fn resize_node(&self, count: usize) -> Result<(), Report<ProviderError>>;

    /// Delete every named node, stopping on the first error.
    async fn delete_nodes(&self, ids: &[String]) -> Result<(), Report<ProviderError>>;
}

/// A cloud integration able to produce a connected provider.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn NodePoolProvider>, Report<ProviderError>>;
}

/// Driver table constructed at startup and passed to whoever needs to
/// connect a provider.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every driver this build ships.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(
            digitalocean::DRIVER_NAME,
            Box::new(digitalocean::DigitalOceanDriver),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Box<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    /// Connect the named driver.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::UnknownDriver`] if no driver goes by `name`
    /// - whatever the driver's own connect returns
    pub async fn connect(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn NodePoolProvider>, Report<ProviderError>> {
        let driver = self.drivers.get(name).ok_or_else(|| {
            Report::new(ProviderError::UnknownDriver {
                name: name.to_string(),
            })
        })?;
        driver.connect(config).await
    }
}
