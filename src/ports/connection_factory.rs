use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    address::{EndpointAddress, ProtocolType},
    exchange::{GatewayRequest, GatewayResponse},
};

/// Errors raised by outbound connections and their factories
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Establishing the connection failed
    #[error("Failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// An operation on the connection did not finish in time
    #[error("{operation} to {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },

    /// The connection was already closed
    #[error("Connection {id} is closed")]
    Closed { id: String },

    /// The request could not be sent or the response could not be read
    #[error("Request to {target} failed: {message}")]
    Send { target: String, message: String },

    /// The factory does not speak the requested protocol
    #[error("Protocol {0} is not supported by this factory")]
    UnsupportedProtocol(ProtocolType),
}

/// Result type alias for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Per-connection settings derived from the route's timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Carried for factories that guard targets with a breaker
    pub circuit_breaker_timeout: Duration,
    pub keep_alive: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            circuit_breaker_timeout: Duration::from_secs(10),
            keep_alive: true,
            metadata: BTreeMap::new(),
        }
    }
}

/// A live outbound connection to one backend address.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn target(&self) -> &EndpointAddress;

    fn protocol(&self) -> ProtocolType;

    /// Whether the connection is open.
    fn is_active(&self) -> bool;

    /// Liveness probe used before a pooled connection is handed out again.
    fn is_healthy(&self) -> bool {
        self.is_active()
    }

    /// Send one request and wait for the full response.
    async fn send(&self, request: GatewayRequest) -> ConnectionResult<GatewayResponse>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Creates outbound connections for one protocol.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    fn protocol(&self) -> ProtocolType;

    async fn create_client_connection(
        &self,
        target: &EndpointAddress,
        options: &ConnectionOptions,
    ) -> ConnectionResult<Box<dyn Connection>>;

    /// Check a connection before reuse.
    fn validate_connection(&self, connection: &dyn Connection) -> bool {
        connection.is_active() && connection.is_healthy()
    }

    /// Pre-open connections to `target`. The default creates them one by one and
    /// returns those that succeeded.
    async fn warmup(
        &self,
        target: &EndpointAddress,
        options: &ConnectionOptions,
        count: usize,
    ) -> Vec<Box<dyn Connection>> {
        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            match self.create_client_connection(target, options).await {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    tracing::warn!("Warmup connection to {} failed: {}", target, e);
                    break;
                }
            }
        }
        connections
    }

    fn stats(&self) -> FactoryStats;

    fn health(&self) -> FactoryHealth {
        self.stats().health()
    }

    /// Release factory-wide resources.
    async fn shutdown(&self) {}
}

/// Coarse health derived from the creation success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryHealth {
    Healthy,
    Warning,
    Unhealthy,
    Unknown,
}

impl fmt::Display for FactoryHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactoryHealth::Healthy => "HEALTHY",
            FactoryHealth::Warning => "WARNING",
            FactoryHealth::Unhealthy => "UNHEALTHY",
            FactoryHealth::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Snapshot of a factory's creation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FactoryStats {
    pub created: u64,
    pub failed: u64,
    pub average_creation_time: Duration,
}

impl FactoryStats {
    pub fn attempts(&self) -> u64 {
        self.created + self.failed
    }

    /// Fraction of successful creations in `[0, 1]`; `1.0` without attempts.
    pub fn success_rate(&self) -> f64 {
        match self.attempts() {
            0 => 1.0,
            attempts => self.created as f64 / attempts as f64,
        }
    }

    pub fn health(&self) -> FactoryHealth {
        if self.attempts() == 0 {
            return FactoryHealth::Unknown;
        }
        let rate = self.success_rate();
        if rate >= 0.95 {
            FactoryHealth::Healthy
        } else if rate >= 0.80 {
            FactoryHealth::Warning
        } else {
            FactoryHealth::Unhealthy
        }
    }
}

/// Lock-free counters a factory implementation embeds to produce [`FactoryStats`].
#[derive(Debug, Default)]
pub struct FactoryStatsRecorder {
    created: AtomicU64,
    failed: AtomicU64,
    total_creation_micros: AtomicU64,
}

impl FactoryStatsRecorder {
    pub fn record_created(&self, took: Duration) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.total_creation_micros.fetch_add(
            u64::try_from(took.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FactoryStats {
        let created = self.created.load(Ordering::Relaxed);
        let total = self.total_creation_micros.load(Ordering::Relaxed);
        FactoryStats {
            created,
            failed: self.failed.load(Ordering::Relaxed),
            average_creation_time: if created == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total / created)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        let stats = |created, failed| FactoryStats {
            created,
            failed,
            average_creation_time: Duration::ZERO,
        };
        assert_eq!(stats(0, 0).health(), FactoryHealth::Unknown);
        assert_eq!(stats(95, 5).health(), FactoryHealth::Healthy);
        assert_eq!(stats(90, 10).health(), FactoryHealth::Warning);
        assert_eq!(stats(80, 20).health(), FactoryHealth::Warning);
        assert_eq!(stats(79, 21).health(), FactoryHealth::Unhealthy);
    }

    #[test]
    fn test_recorder_average() {
        let recorder = FactoryStatsRecorder::default();
        recorder.record_created(Duration::from_millis(10));
        recorder.record_created(Duration::from_millis(30));
        recorder.record_failed();

        let stats = recorder.snapshot();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_creation_time, Duration::from_millis(20));
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
