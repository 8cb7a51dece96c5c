use std::{collections::BTreeMap, fmt, time::Duration};

use crate::{
    core::{
        address::Protocol,
        context::RequestContext,
        filter::FilterChain,
        load_balancer::LoadBalancer,
        predicate::Predicate,
        route_service::RouteService,
    },
    ports::connection_factory::ConnectionOptions,
};

/// Per-route timeouts; each bounds one wait point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSet {
    /// Acquiring an outbound connection
    pub connection: Duration,
    /// Backend request/response exchange
    pub request: Duration,
    /// The whole request flow
    pub total: Duration,
    pub read: Duration,
    pub write: Duration,
    pub circuit_breaker: Duration,
}

impl Default for TimeoutSet {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(5),
            request: Duration::from_secs(30),
            total: Duration::from_secs(60),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            circuit_breaker: Duration::from_secs(10),
        }
    }
}

/// A matchable unit: predicates, filters, a backend service, a load-balance strategy and
/// timeouts.
///
/// Routes are immutable once built; updating one means replacing it in the route manager.
pub struct Route {
    id: String,
    name: String,
    order: i32,
    enabled: bool,
    protocol: Protocol,
    predicates: Vec<Predicate>,
    filters: FilterChain,
    service: RouteService,
    strategy: LoadBalancer,
    timeouts: TimeoutSet,
    metadata: BTreeMap<String, String>,
}

impl Route {
    pub fn builder(id: impl Into<String>, service: RouteService) -> RouteBuilder {
        RouteBuilder::new(id, service)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn service(&self) -> &RouteService {
        &self.service
    }

    pub fn strategy(&self) -> &LoadBalancer {
        &self.strategy
    }

    pub fn timeouts(&self) -> &TimeoutSet {
        &self.timeouts
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Disabled routes never match; otherwise every predicate must hold (short-circuit).
    pub fn matches(&self, context: &RequestContext) -> bool {
        self.enabled && self.predicates.iter().all(|p| p.test(context))
    }

    /// At least one predicate, and the route speaks the same protocol type as its service.
    pub fn is_configuration_valid(&self) -> bool {
        !self.predicates.is_empty() && self.protocol.kind == self.service.protocol().kind
    }

    /// Outbound connection settings for this route.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: self.timeouts.connection,
            read_timeout: self.timeouts.read,
            write_timeout: self.timeouts.write,
            circuit_breaker_timeout: self.timeouts.circuit_breaker,
            keep_alive: true,
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("order", &self.order)
            .field("enabled", &self.enabled)
            .field("protocol", &self.protocol)
            .field("predicates", &self.predicates)
            .field("filters", &self.filters)
            .field("service", &self.service.id())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

pub struct RouteBuilder {
    route: Route,
}

impl RouteBuilder {
    fn new(id: impl Into<String>, service: RouteService) -> Self {
        let id = id.into();
        let protocol = service.protocol().clone();
        Self {
            route: Route {
                name: id.clone(),
                id,
                order: 0,
                enabled: true,
                protocol,
                predicates: Vec::new(),
                filters: FilterChain::default(),
                service,
                strategy: LoadBalancer::default(),
                timeouts: TimeoutSet::default(),
                metadata: BTreeMap::new(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.route.name = name.into();
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.route.order = order;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.route.enabled = enabled;
        self
    }

    /// Inbound protocol; defaults to the service's.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.route.protocol = protocol;
        self
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.route.predicates.push(predicate);
        self
    }

    pub fn predicates(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.route.predicates.extend(predicates);
        self
    }

    pub fn filters(mut self, filters: FilterChain) -> Self {
        self.route.filters = filters;
        self
    }

    pub fn strategy(mut self, strategy: LoadBalancer) -> Self {
        self.route.strategy = strategy;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutSet) -> Self {
        self.route.timeouts = timeouts;
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.route.metadata = metadata;
        self
    }

    pub fn build(self) -> Route {
        self.route
    }
}
