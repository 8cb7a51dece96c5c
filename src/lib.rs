//! Meridian - an API gateway routing and backend dispatch engine.
//!
//! Meridian matches inbound requests against ordered routes, runs each route's filter chain,
//! picks a backend endpoint through a load-balancing strategy and forwards the request over a
//! pooled outbound connection. This library exposes the building blocks so the engine can be
//! embedded or composed inside another application.
//!
//! # Features
//! - Ordered routes with composable predicates (path, method, header, host, query, remote address)
//! - Phased filter chains (pre-route, pre-forward, post, error) with global filters
//! - Static (CONFIG) and registry-backed (DISCOVERY) route services with a TTL cache
//! - Round-robin, random, weighted round-robin and least-connections load balancing
//! - Per-target connection pools with warmup, idle cleanup and background sweeping
//! - Route definition validation and conversion from YAML / JSON / TOML configuration
//! - Metrics through the `metrics` facade and structured tracing via `tracing`
//! - Graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use meridian::{
//!     GatewayProcessor, RouteManager,
//!     adapters::HttpConnectionFactory,
//!     config::{RouteConverter, loader::load_config},
//!     pool::{ConnectionPoolManager, PoolSettings},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("meridian.yaml").await?;
//! let routes = Arc::new(RouteManager::new());
//! routes.replace_all(RouteConverter::new().convert_all(&config)?)?;
//!
//! let pools = Arc::new(ConnectionPoolManager::new(PoolSettings::default()));
//! pools.register_factory(Arc::new(HttpConnectionFactory::new()));
//!
//! let gateway = GatewayProcessor::new(routes, pools);
//! gateway.init()?;
//! gateway.start()?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits such as [`ports::ConnectionFactory`] and
//! [`ports::ServiceRegistry`]) from **adapters** (implementations) while keeping routing logic
//! inside `core` and connection pooling inside `pool`.
//!
//! # Error Handling
//! Library APIs return domain error types built with `thiserror`; request failures map onto
//! [`error::GatewayError`] and its stable error codes. The binary uses `eyre` with `WrapErr`
//! context.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; the compiled route table is published through `arc-swap`
//! so request matching never takes a lock.
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpConnectionFactory, HttpHandler, InMemoryServiceRegistry},
    core::{GatewayProcessor, RouteManager},
    error::{GatewayError, GatewayResult},
    utils::GracefulShutdown,
};
