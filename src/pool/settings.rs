use std::time::Duration;

/// Runtime pool tuning shared by every pool of a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound of open connections (idle + in use) per target
    pub max_connections_per_target: usize,
    /// Connections opened by `warmup` when no explicit count is given
    pub min_connections_per_target: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_lifetime: Duration,
    pub cleanup_interval: Duration,
    pub shutdown_timeout: Duration,
    pub enable_warmup: bool,
    pub enable_connection_reuse: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections_per_target: 10,
            min_connections_per_target: 2,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            enable_warmup: true,
            enable_connection_reuse: true,
        }
    }
}

impl PoolSettings {
    /// Larger pools with longer-lived connections.
    pub fn high_performance() -> Self {
        Self {
            max_connections_per_target: 20,
            min_connections_per_target: 5,
            connection_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(10 * 60),
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Many warm connections with short timeouts.
    pub fn low_latency() -> Self {
        Self {
            max_connections_per_target: 50,
            min_connections_per_target: 10,
            connection_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(2 * 60),
            acquire_timeout: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(15),
            enable_warmup: true,
            ..Self::default()
        }
    }
}
