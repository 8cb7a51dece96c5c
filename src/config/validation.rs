use std::{collections::HashSet, net::SocketAddr, time::Duration};

use crate::{
    config::models::{GatewayConfig, ProtocolDefinition, RouteDefinition, ServiceDefinition},
    core::{
        address::{EndpointAddress, ProtocolType},
        filter::FilterRegistry,
        load_balancer::LoadBalancer,
        predicate::PredicateRegistry,
        route_service::ServiceType,
    },
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate route id: {id}")]
    DuplicateRoute { id: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Parse a humantime duration such as `"30s"` or `"250ms"`. Zero is rejected: every
/// configured duration is a timeout, a TTL or a period.
pub fn parse_duration(field: &str, value: &str) -> ValidationResult<Duration> {
    let parsed =
        humantime::parse_duration(value.trim()).map_err(|e| ValidationError::InvalidField {
            field: field.to_string(),
            message: format!("'{value}' is not a duration: {e}"),
        })?;
    if parsed.is_zero() {
        return Err(ValidationError::InvalidField {
            field: field.to_string(),
            message: format!("'{value}' must be greater than zero"),
        });
    }
    Ok(parsed)
}

/// Checks route definitions before they are converted.
///
/// Every problem of a definition is collected and reported together as one
/// [`ValidationError::ValidationFailed`].
pub struct RouteDefinitionValidator<'a> {
    predicates: &'a PredicateRegistry,
    filters: &'a FilterRegistry,
}

impl<'a> RouteDefinitionValidator<'a> {
    pub fn new(predicates: &'a PredicateRegistry, filters: &'a FilterRegistry) -> Self {
        Self {
            predicates,
            filters,
        }
    }

    pub fn validate(&self, definition: &RouteDefinition) -> ValidationResult<()> {
        let errors = self.collect(definition);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: format_multiple_errors(&definition.id, errors),
            })
        }
    }

    fn collect(&self, definition: &RouteDefinition) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let id = definition.id.as_str();

        if id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "id".to_string(),
            });
        }
        if definition.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{id}' name"),
            });
        }

        let route_protocol = validate_protocol(&definition.protocol, &format!("route '{id}'"), &mut errors);

        if definition.predicates.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{id}' predicates"),
                message: "at least one predicate is required".to_string(),
            });
        }
        for (index, predicate) in definition.predicates.iter().enumerate() {
            if let Err(e) = self.predicates.create(&predicate.kind, &predicate.args) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{id}' predicates[{index}]"),
                    message: e.to_string(),
                });
            }
        }
        for (index, filter) in definition.filters.iter().enumerate() {
            if let Err(e) =
                self.filters
                    .create(&filter.kind, filter.order, filter.enabled, &filter.args)
            {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{id}' filters[{index}]"),
                    message: e.to_string(),
                });
            }
        }

        let service_protocol = self.validate_service(id, &definition.service, &mut errors);
        if let (Some(route), Some(service)) = (route_protocol, service_protocol)
            && route != service
        {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{id}' protocol"),
                message: format!("route protocol {route} differs from service protocol {service}"),
            });
        }

        if let Some(load_balance) = &definition.load_balance
            && let Err(e) = LoadBalancer::from_definition(&load_balance.strategy, &load_balance.args)
        {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{id}' load_balance"),
                message: e.to_string(),
            });
        }

        for (name, value) in definition.timeouts.entries() {
            if let Err(e) = parse_duration(&format!("route '{id}' timeouts.{name}"), value) {
                errors.push(e);
            }
        }

        errors
    }

    fn validate_service(
        &self,
        id: &str,
        service: &ServiceDefinition,
        errors: &mut Vec<ValidationError>,
    ) -> Option<ProtocolType> {
        let field = format!("route '{id}' service");
        let protocol = validate_protocol(&service.protocol, &field, errors);

        match service.kind {
            ServiceType::Config => {
                if service.addresses.is_empty() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field}.addresses"),
                        message: "a CONFIG service needs at least one address".to_string(),
                    });
                }
                for (index, address) in service.addresses.iter().enumerate() {
                    if let Err(e) = EndpointAddress::parse(&address.uri) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("{field}.addresses[{index}]"),
                            message: e.to_string(),
                        });
                    }
                    if address.weight == 0 {
                        errors.push(ValidationError::InvalidField {
                            field: format!("{field}.addresses[{index}].weight"),
                            message: "weight must be positive".to_string(),
                        });
                    }
                }
            }
            ServiceType::Discovery => {
                if !service.addresses.is_empty() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field}.addresses"),
                        message: "a DISCOVERY service must not declare static addresses"
                            .to_string(),
                    });
                }
                if service.name.trim().is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("{field}.name"),
                    });
                }
            }
        }
        protocol
    }
}

fn validate_protocol(
    protocol: &ProtocolDefinition,
    field: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<ProtocolType> {
    if protocol.version.trim().is_empty() {
        errors.push(ValidationError::MissingField {
            field: format!("{field} protocol.version"),
        });
    }
    if protocol.kind.trim().is_empty() {
        errors.push(ValidationError::MissingField {
            field: format!("{field} protocol.type"),
        });
        return None;
    }
    match protocol.kind.parse::<ProtocolType>() {
        Ok(kind) => Some(kind),
        Err(e) => {
            errors.push(ValidationError::InvalidField {
                field: format!("{field} protocol.type"),
                message: e.to_string(),
            });
            None
        }
    }
}

fn format_multiple_errors(id: &str, errors: Vec<ValidationError>) -> String {
    let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
    format!(
        "route '{}' has {} error(s):\n{}",
        id,
        lines.len(),
        lines.join("\n")
    )
}

/// Validate a single definition with the built-in predicate and filter types.
pub fn validate(definition: &RouteDefinition) -> ValidationResult<()> {
    let predicates = PredicateRegistry::with_builtins();
    let filters = FilterRegistry::with_builtins();
    RouteDefinitionValidator::new(&predicates, &filters).validate(definition)
}

/// Validate a whole configuration: listen address, unique route ids, every route, global
/// filters and pool/discovery durations.
pub fn validate_gateway_config(
    config: &GatewayConfig,
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
) -> ValidationResult<()> {
    let mut messages = Vec::new();

    if let Err(e) = config.listen_addr.parse::<SocketAddr>() {
        messages.push(
            ValidationError::InvalidListenAddress {
                address: config.listen_addr.clone(),
                reason: e.to_string(),
            }
            .to_string(),
        );
    }

    let mut seen = HashSet::new();
    for route in &config.routes {
        if !seen.insert(route.id.as_str()) {
            messages.push(
                ValidationError::DuplicateRoute {
                    id: route.id.clone(),
                }
                .to_string(),
            );
        }
    }

    let validator = RouteDefinitionValidator::new(predicates, filters);
    for route in &config.routes {
        if let Err(e) = validator.validate(route) {
            messages.push(e.to_string());
        }
    }

    for (index, filter) in config.global.filters.iter().enumerate() {
        if let Err(e) = filters.create(&filter.kind, filter.order, filter.enabled, &filter.args) {
            messages.push(format!("global filters[{index}]: {e}"));
        }
    }
    if let Some(load_balance) = &config.global.load_balance
        && let Err(e) = LoadBalancer::from_definition(&load_balance.strategy, &load_balance.args)
    {
        messages.push(format!("global load_balance: {e}"));
    }

    let durations = [
        ("global timeouts", config.global.timeouts.entries()),
        (
            "pool",
            vec![
                ("connection_timeout", config.pool.connection_timeout.as_str()),
                ("idle_timeout", config.pool.idle_timeout.as_str()),
                ("acquire_timeout", config.pool.acquire_timeout.as_str()),
                ("max_lifetime", config.pool.max_lifetime.as_str()),
                ("cleanup_interval", config.pool.cleanup_interval.as_str()),
                ("shutdown_timeout", config.pool.shutdown_timeout.as_str()),
            ],
        ),
        (
            "discovery",
            vec![
                ("cache_ttl", config.discovery.cache_ttl.as_str()),
                ("refresh_timeout", config.discovery.refresh_timeout.as_str()),
            ],
        ),
    ];
    for (section, entries) in durations {
        for (name, value) in entries {
            if let Err(e) = parse_duration(&format!("{section}.{name}"), value) {
                messages.push(e.to_string());
            }
        }
    }
    if config.pool.max_connections_per_target == 0 {
        messages.push("pool.max_connections_per_target must be positive".to_string());
    }

    for (service, instances) in &config.registry {
        for instance in instances {
            if let Err(e) = EndpointAddress::parse(&instance.uri) {
                messages.push(format!("registry '{service}' instance '{}': {e}", instance.id));
            }
        }
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::ValidationFailed {
            message: messages.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::{
        AddressDefinition, LoadBalanceDefinition, PredicateDefinition, TimeoutDefinition,
    };

    fn definition() -> RouteDefinition {
        RouteDefinition {
            id: "users".to_string(),
            name: "Users API".to_string(),
            order: 10,
            enabled: true,
            protocol: ProtocolDefinition::default(),
            predicates: vec![PredicateDefinition {
                kind: "Path".to_string(),
                args: HashMap::from([("pattern".to_string(), "/users/**".to_string())]),
            }],
            filters: Vec::new(),
            service: ServiceDefinition {
                id: "users-svc".to_string(),
                name: "users".to_string(),
                kind: ServiceType::Config,
                protocol: ProtocolDefinition::default(),
                addresses: vec![AddressDefinition {
                    uri: "http://users:8080".to_string(),
                    weight: 100,
                    metadata: Default::default(),
                }],
            },
            load_balance: None,
            timeouts: TimeoutDefinition::default(),
            metadata: Default::default(),
        }
    }

    fn message(result: ValidationResult<()>) -> String {
        match result {
            Err(ValidationError::ValidationFailed { message }) => message,
            other => panic!("expected a validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate(&definition()).is_ok());
    }

    #[test]
    fn test_config_service_without_addresses() {
        let mut def = definition();
        def.service.addresses.clear();
        assert!(message(validate(&def)).contains("CONFIG service needs at least one address"));
    }

    #[test]
    fn test_discovery_service_with_addresses() {
        let mut def = definition();
        def.service.kind = ServiceType::Discovery;
        assert!(message(validate(&def)).contains("must not declare static addresses"));

        def.service.addresses.clear();
        assert!(validate(&def).is_ok());
    }

    #[test]
    fn test_protocol_mismatch() {
        let mut def = definition();
        def.service.protocol.kind = "GRPC".to_string();
        assert!(message(validate(&def)).contains("differs from service protocol"));
    }

    #[test]
    fn test_collects_every_problem() {
        let mut def = definition();
        def.id = String::new();
        def.predicates.clear();
        def.load_balance = Some(LoadBalanceDefinition {
            strategy: "FASTEST".to_string(),
            args: HashMap::new(),
        });
        def.timeouts.request = Some("soon".to_string());
        def.service.addresses[0].uri = "ftp://files:21".to_string();

        let message = message(validate(&def));
        assert!(message.contains("has 5 error(s)"), "{message}");
        assert!(message.contains("Missing required field: id"));
        assert!(message.contains("at least one predicate"));
        assert!(message.contains("FASTEST"));
        assert!(message.contains("'soon' is not a duration"));
    }

    #[test]
    fn test_unknown_predicate_and_filter_types() {
        let mut def = definition();
        def.predicates.push(PredicateDefinition {
            kind: "Weekday".to_string(),
            args: HashMap::new(),
        });
        def.filters.push(crate::config::models::FilterDefinition {
            kind: "Compress".to_string(),
            order: 0,
            enabled: true,
            args: HashMap::new(),
        });
        let message = message(validate(&def));
        assert!(message.contains("Weekday"));
        assert!(message.contains("Compress"));
    }

    #[test]
    fn test_gateway_config_duplicates_and_listen_addr() {
        let config = GatewayConfig {
            listen_addr: "localhost".to_string(),
            routes: vec![definition(), definition()],
            ..GatewayConfig::default()
        };
        let message = message(validate_gateway_config(
            &config,
            &PredicateRegistry::with_builtins(),
            &FilterRegistry::with_builtins(),
        ));
        assert!(message.contains("Duplicate route id: users"));
        assert!(message.contains("Invalid listen address 'localhost'"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("t", "250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(parse_duration("t", "5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("t", "fast").is_err());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let err = parse_duration("pool.cleanup_interval", "0s").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid field 'pool.cleanup_interval': '0s' must be greater than zero"
        );
        assert!(parse_duration("t", "0ms").is_err());

        let mut def = definition();
        def.timeouts.request = Some("0s".to_string());
        assert!(message(validate(&def)).contains("must be greater than zero"));

        let mut config = GatewayConfig::default();
        config.pool.cleanup_interval = "0s".to_string();
        config.discovery.cache_ttl = "0ms".to_string();
        let message = message(validate_gateway_config(
            &config,
            &PredicateRegistry::with_builtins(),
            &FilterRegistry::with_builtins(),
        ));
        assert!(message.contains("pool.cleanup_interval"));
        assert!(message.contains("discovery.cache_ttl"));
    }

    #[test]
    fn test_load_balance_arguments_are_validated() {
        let mut def = definition();
        def.load_balance = Some(LoadBalanceDefinition {
            strategy: "ROUND_ROBIN".to_string(),
            args: HashMap::from([("default_weight".to_string(), "5".to_string())]),
        });
        assert!(message(validate(&def)).contains("Invalid argument 'default_weight' for ROUND_ROBIN"));

        def.load_balance = Some(LoadBalanceDefinition {
            strategy: "WEIGHTED_ROUND_ROBIN".to_string(),
            args: HashMap::from([("default_weight".to_string(), "5".to_string())]),
        });
        assert!(validate(&def).is_ok());
    }
}
