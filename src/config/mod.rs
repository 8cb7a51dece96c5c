pub mod converter;
pub mod loader;
pub mod models;
pub mod validation;

pub use converter::{ConversionError, ConversionResult, RouteConverter};
pub use loader::{load_config, load_config_sync};
pub use models::*;
pub use validation::{
    RouteDefinitionValidator, ValidationError, ValidationResult, validate, validate_gateway_config,
};
