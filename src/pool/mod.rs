//! Outbound connection pooling.
//!
//! One [`ConnectionPool`] exists per (target, protocol) pair and is created lazily by the
//! [`ConnectionPoolManager`], which also owns the protocol → factory registry and the idle
//! sweep.
use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{
    core::address::{EndpointAddress, ProtocolType},
    error::ErrorKind,
    ports::connection_factory::ConnectionError,
};

pub mod connection;
pub mod connection_pool;
pub mod manager;
pub mod settings;

pub use connection::ClientConnection;
pub use connection_pool::{ConnectionPool, PoolStats};
pub use manager::ConnectionPoolManager;
pub use settings::PoolSettings;

/// Errors raised while acquiring pooled connections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// Every slot stayed busy for the whole acquire window
    #[error("Connection pool {pool} exhausted after waiting {waited:?}")]
    Exhausted { pool: String, waited: Duration },

    /// The factory failed to open a new connection
    #[error("Failed to create {protocol} connection to {target}: {source}")]
    Creation {
        protocol: ProtocolType,
        target: String,
        #[source]
        source: ConnectionError,
    },

    /// No factory is registered for the protocol
    #[error("No connection factory registered for protocol {0}")]
    UnsupportedProtocol(ProtocolType),

    /// The pool or its manager has been shut down
    #[error("Connection pool {0} is closed")]
    Closed(String),
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } | PoolError::Closed(_) => ErrorKind::ServiceUnavailable,
            PoolError::Creation {
                source: ConnectionError::Timeout { .. },
                ..
            } => ErrorKind::Timeout,
            PoolError::Creation { .. } => ErrorKind::ConnectionError,
            PoolError::UnsupportedProtocol(_) => ErrorKind::InternalError,
        }
    }

    /// Pool exhaustion and creation failures may succeed on a later attempt.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. } | PoolError::Creation { .. }
        )
    }
}

/// Identity of a pool: one target reached over one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub target: EndpointAddress,
    pub protocol: ProtocolType,
}

impl PoolKey {
    pub fn new(target: EndpointAddress, protocol: ProtocolType) -> Self {
        Self { target, protocol }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol, self.target)
    }
}
