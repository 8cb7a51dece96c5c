pub mod address;
pub mod context;
pub mod exchange;
pub mod filter;
pub mod gateway;
pub mod load_balancer;
pub mod predicate;
pub mod route;
pub mod route_manager;
pub mod route_service;

pub use address::{EndpointAddress, Protocol, ProtocolType};
pub use context::RequestContext;
pub use exchange::{GatewayRequest, GatewayResponse};
pub use filter::{FilterChain, FilterPhase, FilterRegistry, RouteFilter};
pub use gateway::GatewayProcessor;
pub use load_balancer::{LoadBalancer, StrategyKind};
pub use predicate::{Predicate, PredicateRegistry};
pub use route::{Route, TimeoutSet};
pub use route_manager::RouteManager;
pub use route_service::{ConfigRouteService, DiscoveryRouteService, RouteService, ServiceType};
