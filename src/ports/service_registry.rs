use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::EndpointAddress;

/// Custom error type for registry lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// The registry could not be reached or answered with an error
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// The registry does not know the service
    #[error("Service '{0}' is not registered")]
    UnknownService(String),
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry-reported status of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Healthy,
    Unhealthy,
    Unavailable,
    Offline,
    Starting,
    ShuttingDown,
}

impl NodeStatus {
    /// Only healthy instances receive traffic.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, NodeStatus::Healthy)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Unhealthy => "UNHEALTHY",
            NodeStatus::Unavailable => "UNAVAILABLE",
            NodeStatus::Offline => "OFFLINE",
            NodeStatus::Starting => "STARTING",
            NodeStatus::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(s)
    }
}

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub address: EndpointAddress,
    pub status: NodeStatus,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(instance_id: impl Into<String>, address: EndpointAddress) -> Self {
        Self {
            instance_id: instance_id.into(),
            address,
            status: NodeStatus::Healthy,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }
}

/// ServiceRegistry defines the port for resolving a service name to its instances.
///
/// Only this narrow read contract is used by the routing core; registration belongs to the
/// concrete registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// All known instances of `service`, whatever their status.
    async fn select_instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>>;
}
