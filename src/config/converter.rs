//! Turns validated [`RouteDefinition`]s into runtime [`Route`]s.
use std::{sync::Arc, time::Duration};

use crate::{
    config::{
        models::{
            GatewayConfig, GlobalRouteConfig, PoolConfig, ProtocolDefinition, RouteDefinition,
            ServiceDefinition, TimeoutDefinition,
        },
        validation::{RouteDefinitionValidator, ValidationError, parse_duration},
    },
    core::{
        address::{AddressError, EndpointAddress, Protocol, ProtocolType},
        filter::{FilterChain, FilterError, FilterRegistry, RouteFilter},
        load_balancer::{LoadBalanceError, LoadBalancer},
        predicate::{PredicateError, PredicateRegistry},
        route::{Route, TimeoutSet},
        route_service::{
            ConfigRouteService, DEFAULT_CACHE_TTL, DEFAULT_REFRESH_TIMEOUT,
            DiscoveryRouteService, RouteService, ServiceType,
        },
    },
    pool::PoolSettings,
    ports::service_registry::ServiceRegistry,
};

pub type ConversionResult<T> = Result<T, ConversionError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConversionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Route '{route}': {source}")]
    Predicate {
        route: String,
        #[source]
        source: PredicateError,
    },

    #[error("Route '{route}': {source}")]
    Filter {
        route: String,
        #[source]
        source: FilterError,
    },

    #[error("Route '{route}': {source}")]
    Address {
        route: String,
        #[source]
        source: AddressError,
    },

    #[error("Route '{route}': {source}")]
    LoadBalance {
        route: String,
        #[source]
        source: LoadBalanceError,
    },

    #[error(transparent)]
    Duration(ValidationError),

    #[error("DISCOVERY service '{service}' needs a service registry")]
    MissingRegistry { service: String },
}

/// Converts configuration into routes, owning the predicate and filter registries used to
/// build them.
pub struct RouteConverter {
    predicates: PredicateRegistry,
    filters: FilterRegistry,
    registry: Option<Arc<dyn ServiceRegistry>>,
    cache_ttl: Duration,
    refresh_timeout: Duration,
}

impl Default for RouteConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteConverter {
    pub fn new() -> Self {
        Self {
            predicates: PredicateRegistry::with_builtins(),
            filters: FilterRegistry::with_builtins(),
            registry: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn with_predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    /// Registry backing DISCOVERY services.
    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_discovery(mut self, cache_ttl: Duration, refresh_timeout: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self.refresh_timeout = refresh_timeout;
        self
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    pub fn validator(&self) -> RouteDefinitionValidator<'_> {
        RouteDefinitionValidator::new(&self.predicates, &self.filters)
    }

    /// Validate and convert one definition, merging in `global`.
    ///
    /// Route timeouts fall back to the global ones and then to [`TimeoutSet::default`]. The
    /// strategy is the route's, else the global one, else round robin. Route metadata overrides
    /// global metadata.
    pub fn convert(
        &self,
        definition: &RouteDefinition,
        global: &GlobalRouteConfig,
    ) -> ConversionResult<Route> {
        self.validator().validate(definition)?;
        let id = definition.id.as_str();

        let predicates = definition
            .predicates
            .iter()
            .map(|p| self.predicates.create(&p.kind, &p.args))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConversionError::Predicate {
                route: id.to_string(),
                source,
            })?;

        let route_filters = self.build_filters(id, &definition.filters)?;
        let global_filters = self.build_filters(id, &global.filters)?;

        let strategy = match definition
            .load_balance
            .as_ref()
            .or(global.load_balance.as_ref())
        {
            Some(lb) => LoadBalancer::from_definition(&lb.strategy, &lb.args).map_err(|source| {
                ConversionError::LoadBalance {
                    route: id.to_string(),
                    source,
                }
            })?,
            None => LoadBalancer::default(),
        };

        let timeouts = timeout_set(&definition.timeouts.or(&global.timeouts))?;

        let mut metadata = global.metadata.clone();
        metadata.extend(definition.metadata.clone());

        let service = self.build_service(id, &definition.service)?;

        let route = Route::builder(id, service)
            .name(definition.name.clone())
            .order(definition.order)
            .enabled(definition.enabled)
            .protocol(protocol(&definition.protocol)?)
            .predicates(predicates)
            .filters(FilterChain::new(route_filters, global_filters))
            .strategy(strategy)
            .timeouts(timeouts)
            .metadata(metadata)
            .build();

        tracing::debug!(
            "Converted route {} ({} predicates, {} filters, strategy {})",
            route.id(),
            route.predicates().len(),
            route.filters().len(),
            route.strategy().name()
        );
        Ok(route)
    }

    /// Convert every route of a configuration, stopping at the first failure.
    pub fn convert_all(&self, config: &GatewayConfig) -> ConversionResult<Vec<Route>> {
        config
            .routes
            .iter()
            .map(|def| self.convert(def, &config.global))
            .collect()
    }

    fn build_filters(
        &self,
        route: &str,
        definitions: &[crate::config::models::FilterDefinition],
    ) -> ConversionResult<Vec<RouteFilter>> {
        definitions
            .iter()
            .map(|f| {
                self.filters
                    .create(&f.kind, f.order, f.enabled, &f.args)
                    .map_err(|source| ConversionError::Filter {
                        route: route.to_string(),
                        source,
                    })
            })
            .collect()
    }

    fn build_service(
        &self,
        route: &str,
        definition: &ServiceDefinition,
    ) -> ConversionResult<RouteService> {
        let protocol = protocol(&definition.protocol)?;
        let id = if definition.id.is_empty() {
            definition.name.clone()
        } else {
            definition.id.clone()
        };

        match definition.kind {
            ServiceType::Config => {
                let addresses = definition
                    .addresses
                    .iter()
                    .map(|a| {
                        EndpointAddress::parse(&a.uri).map(|addr| {
                            addr.with_metadata(a.metadata.clone()).with_weight(a.weight)
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|source| ConversionError::Address {
                        route: route.to_string(),
                        source,
                    })?;
                Ok(RouteService::Config(ConfigRouteService::new(
                    id,
                    definition.name.clone(),
                    protocol,
                    addresses,
                )))
            }
            ServiceType::Discovery => {
                let registry =
                    self.registry
                        .clone()
                        .ok_or_else(|| ConversionError::MissingRegistry {
                            service: definition.name.clone(),
                        })?;
                Ok(RouteService::Discovery(
                    DiscoveryRouteService::new(id, definition.name.clone(), protocol, registry)
                        .with_cache_ttl(self.cache_ttl)
                        .with_refresh_timeout(self.refresh_timeout),
                ))
            }
        }
    }
}

fn protocol(definition: &ProtocolDefinition) -> ConversionResult<Protocol> {
    let kind = definition
        .kind
        .parse::<ProtocolType>()
        .map_err(|e| {
            ConversionError::Validation(ValidationError::InvalidField {
                field: "protocol.type".to_string(),
                message: e.to_string(),
            })
        })?;
    Ok(Protocol::new(kind, definition.version.clone()))
}

fn duration(field: &str, value: &str) -> ConversionResult<Duration> {
    parse_duration(field, value).map_err(ConversionError::Duration)
}

/// Resolve a merged timeout definition, filling unset values with the defaults.
pub fn timeout_set(definition: &TimeoutDefinition) -> ConversionResult<TimeoutSet> {
    let mut set = TimeoutSet::default();
    for (name, value) in definition.entries() {
        let parsed = duration(&format!("timeouts.{name}"), value)?;
        match name {
            "connection" => set.connection = parsed,
            "request" => set.request = parsed,
            "total" => set.total = parsed,
            "read" => set.read = parsed,
            "write" => set.write = parsed,
            _ => set.circuit_breaker = parsed,
        }
    }
    Ok(set)
}

pub fn pool_settings(config: &PoolConfig) -> ConversionResult<PoolSettings> {
    Ok(PoolSettings {
        max_connections_per_target: config.max_connections_per_target,
        min_connections_per_target: config.min_connections_per_target,
        connection_timeout: duration("pool.connection_timeout", &config.connection_timeout)?,
        idle_timeout: duration("pool.idle_timeout", &config.idle_timeout)?,
        acquire_timeout: duration("pool.acquire_timeout", &config.acquire_timeout)?,
        max_lifetime: duration("pool.max_lifetime", &config.max_lifetime)?,
        cleanup_interval: duration("pool.cleanup_interval", &config.cleanup_interval)?,
        shutdown_timeout: duration("pool.shutdown_timeout", &config.shutdown_timeout)?,
        enable_warmup: config.enable_warmup,
        enable_connection_reuse: config.enable_connection_reuse,
    })
}

/// `(cache_ttl, refresh_timeout)` of DISCOVERY services.
pub fn discovery_settings(config: &GatewayConfig) -> ConversionResult<(Duration, Duration)> {
    Ok((
        duration("discovery.cache_ttl", &config.discovery.cache_ttl)?,
        duration("discovery.refresh_timeout", &config.discovery.refresh_timeout)?,
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::models::{
            AddressDefinition, FilterDefinition, LoadBalanceDefinition, PredicateDefinition,
        },
        core::{filter::FilterPhase, load_balancer::StrategyKind},
        ports::service_registry::{RegistryResult, ServiceInstance},
    };

    struct EmptyRegistry;

    #[async_trait]
    impl ServiceRegistry for EmptyRegistry {
        async fn select_instances(&self, _service: &str) -> RegistryResult<Vec<ServiceInstance>> {
            Ok(Vec::new())
        }
    }

    fn definition() -> RouteDefinition {
        RouteDefinition {
            id: "orders".to_string(),
            name: "Orders".to_string(),
            order: 3,
            enabled: true,
            protocol: ProtocolDefinition::default(),
            predicates: vec![PredicateDefinition {
                kind: "Path".to_string(),
                args: HashMap::from([("pattern".to_string(), "/orders/**".to_string())]),
            }],
            filters: vec![FilterDefinition {
                kind: "AddRequestHeader".to_string(),
                order: 1,
                enabled: true,
                args: HashMap::from([
                    ("name".to_string(), "x-route".to_string()),
                    ("value".to_string(), "orders".to_string()),
                ]),
            }],
            service: ServiceDefinition {
                id: "orders-svc".to_string(),
                name: "orders".to_string(),
                kind: ServiceType::Config,
                protocol: ProtocolDefinition::default(),
                addresses: vec![AddressDefinition {
                    uri: "http://orders-1:8080".to_string(),
                    weight: 3,
                    metadata: BTreeMap::from([("zone".to_string(), "a".to_string())]),
                }],
            },
            load_balance: None,
            timeouts: TimeoutDefinition {
                request: Some("2s".to_string()),
                ..TimeoutDefinition::default()
            },
            metadata: BTreeMap::from([("team".to_string(), "checkout".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_convert_merges_global_settings() {
        let global = GlobalRouteConfig {
            filters: vec![FilterDefinition {
                kind: "AddResponseHeader".to_string(),
                order: 0,
                enabled: true,
                args: HashMap::from([
                    ("name".to_string(), "x-gateway".to_string()),
                    ("value".to_string(), "meridian".to_string()),
                ]),
            }],
            timeouts: TimeoutDefinition {
                request: Some("9s".to_string()),
                total: Some("20s".to_string()),
                ..TimeoutDefinition::default()
            },
            load_balance: Some(LoadBalanceDefinition {
                strategy: "RANDOM".to_string(),
                args: HashMap::new(),
            }),
            metadata: BTreeMap::from([
                ("team".to_string(), "platform".to_string()),
                ("tier".to_string(), "gold".to_string()),
            ]),
        };

        let route = RouteConverter::new().convert(&definition(), &global).unwrap();

        assert_eq!(route.id(), "orders");
        assert_eq!(route.order(), 3);
        assert_eq!(route.timeouts().request, Duration::from_secs(2));
        assert_eq!(route.timeouts().total, Duration::from_secs(20));
        assert_eq!(route.timeouts().connection, Duration::from_secs(5));
        assert_eq!(route.strategy().kind(), StrategyKind::Random);
        assert_eq!(route.metadata()["team"], "checkout");
        assert_eq!(route.metadata()["tier"], "gold");
        assert_eq!(route.filters().len(), 2);
        assert_eq!(route.filters().phase(FilterPhase::Post).count(), 1);

        let addresses = route.service().target_addresses().await;
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].weight(), 3);
        assert_eq!(addresses[0].metadata()["zone"], "a");
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let mut def = definition();
        def.predicates.clear();
        let err = RouteConverter::new()
            .convert(&def, &GlobalRouteConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConversionError::Validation(_)));
    }

    #[test]
    fn test_discovery_requires_registry() {
        let mut def = definition();
        def.service.kind = ServiceType::Discovery;
        def.service.addresses.clear();

        let err = RouteConverter::new()
            .convert(&def, &GlobalRouteConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingRegistry { .. }));

        let route = RouteConverter::new()
            .with_registry(Arc::new(EmptyRegistry))
            .convert(&def, &GlobalRouteConfig::default())
            .unwrap();
        assert_eq!(route.service().service_type(), ServiceType::Discovery);
    }

    #[test]
    fn test_pool_settings_from_config() {
        let config = PoolConfig {
            idle_timeout: "90s".to_string(),
            ..PoolConfig::default()
        };
        let settings = pool_settings(&config).unwrap();
        assert_eq!(settings.idle_timeout, Duration::from_secs(90));
        assert_eq!(settings.max_connections_per_target, 10);

        let broken = PoolConfig {
            max_lifetime: "forever".to_string(),
            ..PoolConfig::default()
        };
        assert!(pool_settings(&broken).is_err());
    }
}
