//! Request-time error taxonomy.
//!
//! Every failure that can end a request is folded into [`GatewayError`], which knows its
//! [`ErrorKind`]: a stable error code plus the HTTP status the inbound adapter answers with.
//! Configuration problems never reach this type; they are rejected while routes are built.
use std::{fmt, time::Duration};

use http::StatusCode;
use thiserror::Error;

use crate::{
    core::{
        address::ProtocolType, filter::FilterError, load_balancer::LoadBalanceError,
        route_manager::RouteError,
    },
    pool::PoolError,
    ports::connection_factory::ConnectionError,
};

/// Classification of request failures with stable codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ConnectionError,
    RouteNotFound,
    ServiceUnavailable,
    AuthenticationError,
    ProtocolError,
    LoadBalanceError,
    InternalError,
    Unknown,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "E001",
            ErrorKind::ConnectionError => "E002",
            ErrorKind::RouteNotFound => "E003",
            ErrorKind::ServiceUnavailable => "E004",
            ErrorKind::AuthenticationError => "E005",
            ErrorKind::ProtocolError => "E006",
            ErrorKind::LoadBalanceError => "E007",
            ErrorKind::InternalError => "E500",
            ErrorKind::Unknown => "E999",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ConnectionError | ErrorKind::LoadBalanceError => StatusCode::BAD_GATEWAY,
            ErrorKind::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorKind::ProtocolError => StatusCode::BAD_REQUEST,
            ErrorKind::InternalError | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::LoadBalanceError => "LOAD_BALANCE_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that terminates request processing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// No enabled route matched the request
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// The matched route resolved to no usable backend
    #[error("No available target for service '{service}'")]
    NoAvailableTarget { service: String },

    #[error(transparent)]
    LoadBalance(#[from] LoadBalanceError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Sending the request over an acquired connection failed
    #[error("Backend call to {endpoint} failed: {source}")]
    Backend {
        endpoint: String,
        #[source]
        source: ConnectionError,
    },

    /// A phase-level timeout elapsed
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    /// A filter failed and aborted the chain
    #[error("Filter '{filter}' failed: {source}")]
    Filter {
        filter: String,
        #[source]
        source: FilterError,
    },

    /// The inbound protocol cannot be bridged to the selected backend
    #[error("Cannot convert {inbound} request to {target}")]
    ProtocolMismatch {
        inbound: ProtocolType,
        target: ProtocolType,
    },

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Internal gateway error: {0}")]
    Internal(String),
}

/// Result alias for request processing
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            GatewayError::NoAvailableTarget { .. } => ErrorKind::ServiceUnavailable,
            GatewayError::LoadBalance(LoadBalanceError::EmptyTargetSet) => {
                ErrorKind::ServiceUnavailable
            }
            GatewayError::LoadBalance(_) => ErrorKind::LoadBalanceError,
            GatewayError::Pool(e) => e.kind(),
            GatewayError::Backend { source, .. } => match source {
                ConnectionError::Timeout { .. } => ErrorKind::Timeout,
                _ => ErrorKind::ConnectionError,
            },
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Filter { source, .. } => source.kind(),
            GatewayError::ProtocolMismatch { .. } => ErrorKind::ProtocolError,
            GatewayError::Route(RouteError::NotRunning { .. }) => ErrorKind::ServiceUnavailable,
            GatewayError::Route(_) => ErrorKind::InternalError,
            GatewayError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind().status()
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn retryable(&self) -> bool {
        match self {
            GatewayError::Pool(e) => e.retryable(),
            GatewayError::Timeout { .. } => true,
            GatewayError::Backend { source, .. } => {
                matches!(source, ConnectionError::Timeout { .. })
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_and_unavailable_are_distinct() {
        let not_found = GatewayError::RouteNotFound {
            method: "GET".to_string(),
            path: "/nope".to_string(),
        };
        let unavailable = GatewayError::NoAvailableTarget {
            service: "users".to_string(),
        };

        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.kind().code(), "E003");
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.kind().code(), "E004");
    }

    #[test]
    fn test_empty_target_set_is_service_unavailable() {
        let err = GatewayError::from(LoadBalanceError::EmptyTargetSet);
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = GatewayError::Timeout {
            phase: "request",
            after: Duration::from_secs(1),
        };
        assert!(err.retryable());
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_error_kind_codes() {
        assert_eq!(ErrorKind::ConnectionError.code(), "E002");
        assert_eq!(ErrorKind::ConnectionError.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::ProtocolError.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Unknown.code(), "E999");
    }
}
