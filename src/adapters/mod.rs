pub mod http_connection;
pub mod http_handler;
pub mod in_memory_registry;

pub use http_connection::{HttpConnection, HttpConnectionFactory};
pub use http_handler::{HttpHandler, router};
pub use in_memory_registry::InMemoryServiceRegistry;
