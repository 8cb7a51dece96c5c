//! Configuration data structures for Meridian.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs remain concise. Durations are
//! humantime strings ("250ms", "30s", "5m") parsed when routes are converted.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{core::route_service::ServiceType, ports::service_registry::NodeStatus};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    100
}

/// Top-level gateway configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    /// Applied to every route
    #[serde(default)]
    pub global: GlobalRouteConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Seed data for the in-memory service registry, keyed by service name
    #[serde(default)]
    pub registry: HashMap<String, Vec<InstanceDefinition>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            routes: Vec::new(),
            global: GlobalRouteConfig::default(),
            pool: PoolConfig::default(),
            discovery: DiscoveryConfig::default(),
            registry: HashMap::new(),
        }
    }
}

/// Protocol descriptor `{type, version}`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

impl Default for ProtocolDefinition {
    fn default() -> Self {
        Self {
            kind: "HTTP".to_string(),
            version: "1.1".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PredicateDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FilterDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AddressDefinition {
    pub uri: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Backend target of a route
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ServiceDefinition {
    pub id: String,
    /// Display name; for DISCOVERY services also the registry lookup key
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceType,
    pub protocol: ProtocolDefinition,
    pub addresses: Vec<AddressDefinition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LoadBalanceDefinition {
    pub strategy: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Route timeouts; unset values fall back to the global ones, then to built-in defaults.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TimeoutDefinition {
    pub connection: Option<String>,
    pub request: Option<String>,
    pub total: Option<String>,
    pub read: Option<String>,
    pub write: Option<String>,
    pub circuit_breaker: Option<String>,
}

impl TimeoutDefinition {
    /// Each field of `self`, or of `fallback` when unset.
    pub fn or(&self, fallback: &TimeoutDefinition) -> TimeoutDefinition {
        TimeoutDefinition {
            connection: self.connection.clone().or_else(|| fallback.connection.clone()),
            request: self.request.clone().or_else(|| fallback.request.clone()),
            total: self.total.clone().or_else(|| fallback.total.clone()),
            read: self.read.clone().or_else(|| fallback.read.clone()),
            write: self.write.clone().or_else(|| fallback.write.clone()),
            circuit_breaker: self
                .circuit_breaker
                .clone()
                .or_else(|| fallback.circuit_breaker.clone()),
        }
    }

    /// `(field name, value)` for every set field
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("connection", &self.connection),
            ("request", &self.request),
            ("total", &self.total),
            ("read", &self.read),
            ("write", &self.write),
            ("circuit_breaker", &self.circuit_breaker),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Lower runs first
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub protocol: ProtocolDefinition,
    #[serde(default)]
    pub predicates: Vec<PredicateDefinition>,
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
    pub service: ServiceDefinition,
    #[serde(default)]
    pub load_balance: Option<LoadBalanceDefinition>,
    #[serde(default)]
    pub timeouts: TimeoutDefinition,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Settings merged into every route
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GlobalRouteConfig {
    /// Run after the route's own filters of the same phase
    pub filters: Vec<FilterDefinition>,
    pub timeouts: TimeoutDefinition,
    pub load_balance: Option<LoadBalanceDefinition>,
    /// Route metadata wins on key conflicts
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections_per_target: usize,
    pub min_connections_per_target: usize,
    pub connection_timeout: String,
    pub idle_timeout: String,
    pub acquire_timeout: String,
    pub max_lifetime: String,
    pub cleanup_interval: String,
    pub shutdown_timeout: String,
    pub enable_warmup: bool,
    pub enable_connection_reuse: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_target: 10,
            min_connections_per_target: 2,
            connection_timeout: "5s".to_string(),
            idle_timeout: "5m".to_string(),
            acquire_timeout: "10s".to_string(),
            max_lifetime: "30m".to_string(),
            cleanup_interval: "30s".to_string(),
            shutdown_timeout: "30s".to_string(),
            enable_warmup: true,
            enable_connection_reuse: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cache_ttl: String,
    pub refresh_timeout: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: "30s".to_string(),
            refresh_timeout: "5s".to_string(),
        }
    }
}

/// One instance seeded into the in-memory registry
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceDefinition {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
