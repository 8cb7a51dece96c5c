pub mod connection_factory;
pub mod service_registry;

pub use connection_factory::{Connection, ConnectionFactory, ConnectionOptions};
pub use service_registry::{NodeStatus, ServiceInstance, ServiceRegistry};
