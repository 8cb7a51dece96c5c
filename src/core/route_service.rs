//! Backend target resolution.
//!
//! A [`RouteService`] turns a route's logical backend into the current list of candidate
//! addresses and hands the final choice to the route's [`LoadBalancer`]. CONFIG services carry a
//! fixed list; DISCOVERY services ask a [`ServiceRegistry`] and cache the answer for a TTL.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    core::{
        address::{EndpointAddress, Protocol},
        context::RequestContext,
        load_balancer::LoadBalancer,
    },
    error::{GatewayError, GatewayResult},
    metrics,
    ports::service_registry::{RegistryError, RegistryResult, ServiceRegistry},
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// How a service's addresses are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceType {
    /// Fixed list from configuration
    #[default]
    Config,
    /// Resolved by name through a registry
    Discovery,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Config => f.write_str("CONFIG"),
            ServiceType::Discovery => f.write_str("DISCOVERY"),
        }
    }
}

/// A resolved backend target of a route.
#[derive(Debug)]
pub enum RouteService {
    Config(ConfigRouteService),
    Discovery(DiscoveryRouteService),
}

impl RouteService {
    pub fn id(&self) -> &str {
        match self {
            RouteService::Config(s) => &s.id,
            RouteService::Discovery(s) => &s.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RouteService::Config(s) => &s.name,
            RouteService::Discovery(s) => &s.name,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        match self {
            RouteService::Config(_) => ServiceType::Config,
            RouteService::Discovery(_) => ServiceType::Discovery,
        }
    }

    pub fn protocol(&self) -> &Protocol {
        match self {
            RouteService::Config(s) => &s.protocol,
            RouteService::Discovery(s) => &s.protocol,
        }
    }

    /// Current candidate addresses. Never fails: discovery problems yield the last known list
    /// or an empty one.
    pub async fn target_addresses(&self) -> Arc<Vec<EndpointAddress>> {
        match self {
            RouteService::Config(s) => s.addresses.clone(),
            RouteService::Discovery(s) => s.target_addresses().await,
        }
    }

    /// Resolve the candidates and let `strategy` pick one.
    pub async fn select_target(
        &self,
        context: &RequestContext,
        strategy: &LoadBalancer,
    ) -> GatewayResult<EndpointAddress> {
        let addresses = self.target_addresses().await;
        if addresses.is_empty() {
            return Err(GatewayError::NoAvailableTarget {
                service: self.name().to_string(),
            });
        }
        Ok(strategy.select(&addresses, context)?)
    }
}

/// Static address list from configuration.
#[derive(Debug)]
pub struct ConfigRouteService {
    id: String,
    name: String,
    protocol: Protocol,
    addresses: Arc<Vec<EndpointAddress>>,
}

impl ConfigRouteService {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        protocol: Protocol,
        addresses: Vec<EndpointAddress>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            protocol,
            addresses: Arc::new(addresses),
        }
    }

    pub fn addresses(&self) -> &[EndpointAddress] {
        &self.addresses
    }
}

struct CachedTargets {
    addresses: Arc<Vec<EndpointAddress>>,
    refreshed_at: Instant,
}

/// Cache counters of a discovery service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryCacheStats {
    pub cached_addresses: usize,
    #[serde(skip)]
    pub age: Option<Duration>,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub failures: u64,
}

/// Registry-backed address list with a TTL cache.
///
/// Refreshes are single-flight: concurrent callers on a stale cache wait for the one refresh in
/// progress instead of querying the registry themselves. A failed refresh keeps the previous
/// list.
pub struct DiscoveryRouteService {
    id: String,
    name: String,
    protocol: Protocol,
    registry: Arc<dyn ServiceRegistry>,
    cache_ttl: Duration,
    refresh_timeout: Duration,
    cache: ArcSwapOption<CachedTargets>,
    refresh_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl DiscoveryRouteService {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        protocol: Protocol,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            protocol,
            registry,
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            cache: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    fn fresh(&self) -> Option<Arc<Vec<EndpointAddress>>> {
        self.cache
            .load()
            .as_ref()
            .filter(|cached| cached.refreshed_at.elapsed() < self.cache_ttl)
            .map(|cached| cached.addresses.clone())
    }

    pub async fn target_addresses(&self) -> Arc<Vec<EndpointAddress>> {
        if let Some(addresses) = self.fresh() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return addresses;
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(addresses) = self.fresh() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return addresses;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.fetch().await {
            Ok(addresses) => addresses,
            Err(e) => self.keep_last_known(&e),
        }
    }

    /// Query the registry and replace the cache. Caller holds the refresh lock.
    async fn fetch(&self) -> RegistryResult<Arc<Vec<EndpointAddress>>> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let instances = tokio::time::timeout(
            self.refresh_timeout,
            self.registry.select_instances(&self.name),
        )
        .await
        .map_err(|_| {
            RegistryError::Unavailable(format!(
                "lookup of '{}' timed out after {:?}",
                self.name, self.refresh_timeout
            ))
        })??;

        let total = instances.len();
        let addresses: Vec<EndpointAddress> = instances
            .into_iter()
            .filter(|instance| instance.status.accepts_traffic())
            .map(|instance| instance.address)
            .collect();
        tracing::debug!(
            "Refreshed service {}: {} of {} instances healthy",
            self.name,
            addresses.len(),
            total
        );

        let addresses = Arc::new(addresses);
        self.cache.store(Some(Arc::new(CachedTargets {
            addresses: addresses.clone(),
            refreshed_at: Instant::now(),
        })));
        metrics::increment_discovery_refresh(&self.name, "success");
        Ok(addresses)
    }

    fn keep_last_known(&self, error: &RegistryError) -> Arc<Vec<EndpointAddress>> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        match self.cache.load_full() {
            Some(previous) => {
                tracing::warn!(
                    "Refreshing service {} failed, serving {} cached addresses: {}",
                    self.name,
                    previous.addresses.len(),
                    error
                );
                metrics::increment_discovery_refresh(&self.name, "stale");
                // retry after another TTL instead of on every request
                self.cache.store(Some(Arc::new(CachedTargets {
                    addresses: previous.addresses.clone(),
                    refreshed_at: Instant::now(),
                })));
                previous.addresses.clone()
            }
            None => {
                tracing::warn!(
                    "Refreshing service {} failed with no cached addresses: {}",
                    self.name,
                    error
                );
                metrics::increment_discovery_refresh(&self.name, "failed");
                Arc::new(Vec::new())
            }
        }
    }

    /// Refresh now regardless of the TTL. Unlike request-time refreshes the error is
    /// returned; the cache is left untouched on failure.
    pub async fn force_refresh(&self) -> RegistryResult<usize> {
        let _guard = self.refresh_lock.lock().await;
        match self.fetch().await {
            Ok(addresses) => Ok(addresses.len()),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.store(None);
        tracing::debug!("Cleared discovery cache for service {}", self.name);
    }

    pub fn cache_stats(&self) -> DiscoveryCacheStats {
        let cached = self.cache.load();
        DiscoveryCacheStats {
            cached_addresses: cached.as_ref().map_or(0, |c| c.addresses.len()),
            age: cached.as_ref().map(|c| c.refreshed_at.elapsed()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DiscoveryRouteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryRouteService")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("cache_ttl", &self.cache_ttl)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        core::exchange::GatewayRequest,
        ports::service_registry::{NodeStatus, ServiceInstance},
    };

    struct FlakyRegistry {
        calls: AtomicU64,
        failing: AtomicBool,
        delay: Duration,
    }

    impl FlakyRegistry {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                failing: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl ServiceRegistry for FlakyRegistry {
        async fn select_instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(RegistryError::Unavailable("registry down".to_string()));
            }
            Ok(vec![
                ServiceInstance::new(
                    format!("{service}-1"),
                    EndpointAddress::parse("http://10.0.0.1:8080").unwrap(),
                ),
                ServiceInstance::new(
                    format!("{service}-2"),
                    EndpointAddress::parse("http://10.0.0.2:8080").unwrap(),
                )
                .with_status(NodeStatus::Offline),
            ])
        }
    }

    fn discovery(registry: Arc<FlakyRegistry>) -> DiscoveryRouteService {
        DiscoveryRouteService::new("users", "users", Protocol::http(), registry)
    }

    #[tokio::test]
    async fn test_only_healthy_instances_are_candidates() {
        let service = discovery(FlakyRegistry::new(Duration::ZERO));
        let addresses = service.target_addresses().await;
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].uri(), "http://10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let registry = FlakyRegistry::new(Duration::ZERO);
        let service = discovery(registry.clone());
        service.target_addresses().await;
        service.target_addresses().await;
        service.target_addresses().await;

        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
        let stats = service.cache_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_misses_share_one_refresh() {
        let registry = FlakyRegistry::new(Duration::from_millis(50));
        let service = Arc::new(discovery(registry.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.target_addresses().await.len() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_last_known_list() {
        let registry = FlakyRegistry::new(Duration::ZERO);
        let service = discovery(registry.clone()).with_cache_ttl(Duration::from_millis(10));
        assert_eq!(service.target_addresses().await.len(), 1);

        registry.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.target_addresses().await.len(), 1);
        assert_eq!(service.cache_stats().failures, 1);
        assert!(service.force_refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_timeout_without_cache_yields_no_target() {
        let registry = FlakyRegistry::new(Duration::from_millis(200));
        let service = RouteService::Discovery(
            discovery(registry).with_refresh_timeout(Duration::from_millis(20)),
        );
        let ctx = RequestContext::new(GatewayRequest::get("/"));
        let err = service
            .select_target(&ctx, &LoadBalancer::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_lookup() {
        let registry = FlakyRegistry::new(Duration::ZERO);
        let service = discovery(registry.clone());
        service.target_addresses().await;
        service.clear_cache();
        assert_eq!(service.cache_stats().cached_addresses, 0);
        service.target_addresses().await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_config_service_selects_with_strategy() {
        let service = RouteService::Config(ConfigRouteService::new(
            "orders",
            "orders",
            Protocol::http(),
            vec![
                EndpointAddress::parse("http://a:8080").unwrap(),
                EndpointAddress::parse("http://b:8080").unwrap(),
            ],
        ));
        let strategy = LoadBalancer::default();
        let ctx = RequestContext::new(GatewayRequest::get("/"));

        let first = service.select_target(&ctx, &strategy).await.unwrap();
        let second = service.select_target(&ctx, &strategy).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(service.service_type(), ServiceType::Config);
    }
}
