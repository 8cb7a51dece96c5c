use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use scc::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::address::{EndpointAddress, ProtocolType},
    pool::{ClientConnection, ConnectionPool, PoolError, PoolKey, PoolResult, PoolSettings, PoolStats},
    ports::connection_factory::{ConnectionFactory, ConnectionOptions, FactoryHealth, FactoryStats},
    tracing_setup::component_span,
};

/// Multiplexes pools across targets and protocols.
///
/// Holds a protocol → factory registry and a (target, protocol) → pool registry. Pools are
/// created on first use; a background task sweeps idle connections, drops unhealthy pools
/// and evicts empty pools left unused past `idle_timeout`, every `cleanup_interval`.
pub struct ConnectionPoolManager {
    settings: PoolSettings,
    factories: HashMap<ProtocolType, Arc<dyn ConnectionFactory>>,
    pools: HashMap<PoolKey, Arc<ConnectionPool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl ConnectionPoolManager {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            factories: HashMap::new(),
            pools: HashMap::new(),
            sweeper: Mutex::new(None),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Register (or replace) the factory for its protocol.
    pub fn register_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        let protocol = factory.protocol();
        self.factories.upsert(protocol, factory);
        tracing::info!("Registered connection factory for {}", protocol);
    }

    pub fn supports_protocol(&self, protocol: ProtocolType) -> bool {
        self.factories.contains(&protocol)
    }

    fn factory(&self, protocol: ProtocolType) -> PoolResult<Arc<dyn ConnectionFactory>> {
        self.factories
            .read(&protocol, |_, factory| factory.clone())
            .ok_or(PoolError::UnsupportedProtocol(protocol))
    }

    fn pool(
        &self,
        target: &EndpointAddress,
        protocol: ProtocolType,
        options: &ConnectionOptions,
    ) -> PoolResult<Arc<ConnectionPool>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::Closed("manager".to_string()));
        }
        let key = PoolKey::new(target.clone(), protocol);
        if let Some(pool) = self.pools.read(&key, |_, pool| pool.clone()) {
            return Ok(pool);
        }

        let factory = self.factory(protocol)?;
        let pool = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::info!("Creating connection pool {}", key);
                Arc::new(ConnectionPool::new(
                    key.clone(),
                    self.settings.clone(),
                    options.clone(),
                    factory,
                ))
            })
            .get()
            .clone();
        Ok(pool)
    }

    /// Acquire a connection to `target` over `protocol`, creating the pool on first use.
    ///
    /// Fails fast with [`PoolError::UnsupportedProtocol`] when no factory is registered.
    /// `options` only apply when this call creates the pool.
    pub async fn get_client_connection(
        &self,
        target: &EndpointAddress,
        protocol: ProtocolType,
        options: &ConnectionOptions,
        acquire_timeout: Option<Duration>,
    ) -> PoolResult<Arc<ClientConnection>> {
        let pool = self.pool(target, protocol, options)?;
        match pool.get_connection(acquire_timeout).await {
            // the sweeper evicted this pool between lookup and acquire
            Err(PoolError::Closed(_)) if !self.shut_down.load(Ordering::Acquire) => {
                self.pool(target, protocol, options)?
                    .get_connection(acquire_timeout)
                    .await
            }
            result => result,
        }
    }

    fn pool_for(&self, connection: &ClientConnection) -> Option<Arc<ConnectionPool>> {
        self.pools
            .read(connection.pool_key(), |_, pool| pool.clone())
    }

    /// Recycle a connection into its pool; connections whose pool is gone are closed.
    pub fn return_connection(&self, connection: Arc<ClientConnection>) {
        match self.pool_for(&connection) {
            Some(pool) => pool.return_connection(connection),
            None => {
                connection.close();
            }
        }
    }

    /// Close a connection instead of recycling it.
    pub fn release_connection(&self, connection: Arc<ClientConnection>) {
        match self.pool_for(&connection) {
            Some(pool) => pool.release_connection(connection),
            None => {
                connection.close();
            }
        }
    }

    /// Open idle connections ahead of traffic. `count` defaults to
    /// `min_connections_per_target`. Does nothing when warmup is disabled.
    pub async fn warmup(
        &self,
        target: &EndpointAddress,
        protocol: ProtocolType,
        options: &ConnectionOptions,
        count: Option<usize>,
    ) -> PoolResult<usize> {
        if !self.settings.enable_warmup {
            return Ok(0);
        }
        let pool = self.pool(target, protocol, options)?;
        Ok(pool
            .warmup(count.unwrap_or(self.settings.min_connections_per_target))
            .await)
    }

    /// Sweep every pool once. Returns the number of closed connections.
    pub fn cleanup_idle_connections(&self) -> usize {
        let mut pools = Vec::new();
        self.pools.scan(|_, pool| pools.push(pool.clone()));
        pools.iter().map(|pool| pool.cleanup_idle()).sum()
    }

    pub fn pool_status(&self, target: &EndpointAddress, protocol: ProtocolType) -> Option<PoolStats> {
        let key = PoolKey::new(target.clone(), protocol);
        self.pools.read(&key, |_, pool| pool.stats())
    }

    /// Statistics of every pool, sorted by pool name.
    pub fn statistics(&self) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        self.pools.scan(|_, pool| stats.push(pool.stats()));
        stats.sort_by(|a, b| a.pool.cmp(&b.pool));
        stats
    }

    /// Creation statistics and health of every registered factory.
    pub fn factory_statistics(&self) -> Vec<(ProtocolType, FactoryStats, FactoryHealth)> {
        let mut stats = Vec::new();
        self.factories.scan(|protocol, factory| {
            stats.push((*protocol, factory.stats(), factory.health()));
        });
        stats.sort_by_key(|(protocol, _, _)| protocol.as_str());
        stats
    }

    /// Shut down and forget one pool.
    pub fn remove_pool(&self, target: &EndpointAddress, protocol: ProtocolType) -> bool {
        let key = PoolKey::new(target.clone(), protocol);
        match self.pools.remove(&key) {
            Some((_, pool)) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    /// Remove closed pools and pools whose creation success rate fell below 80%.
    pub fn cleanup_unhealthy_pools(&self) -> usize {
        let mut unhealthy = Vec::new();
        self.pools.scan(|key, pool| {
            if !pool.is_healthy() {
                unhealthy.push(key.clone());
            }
        });
        let mut removed = 0;
        for key in unhealthy {
            if let Some((_, pool)) = self.pools.remove(&key) {
                tracing::warn!("Removing unhealthy connection pool {}", key);
                pool.shutdown();
                removed += 1;
            }
        }
        removed
    }

    /// Drop pools with no open connections that nobody used for `idle_timeout`.
    pub fn evict_idle_pools(&self) -> usize {
        let limit = self.settings.idle_timeout;
        let mut candidates = Vec::new();
        self.pools.scan(|key, pool| {
            if pool.is_unused_for(limit) {
                candidates.push(key.clone());
            }
        });
        let mut evicted = 0;
        for key in candidates {
            if let Some((_, pool)) = self.pools.remove_if(&key, |pool| pool.is_unused_for(limit)) {
                tracing::debug!("Evicting idle connection pool {}", key);
                pool.shutdown();
                evicted += 1;
            }
        }
        evicted
    }

    /// One sweeper pass: idle connections, unhealthy pools, then unused pools.
    pub fn sweep(&self) {
        let closed = self.cleanup_idle_connections();
        let unhealthy = self.cleanup_unhealthy_pools();
        let evicted = self.evict_idle_pools();
        if closed + unhealthy + evicted > 0 {
            tracing::debug!(
                "Pool sweep closed {} connections, removed {} unhealthy and {} idle pools",
                closed,
                unhealthy,
                evicted
            );
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Start the periodic [`sweep`](Self::sweep). Calling it twice keeps the first task.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.settings.cleanup_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep();
                    }
                }
            }
            tracing::debug!("Connection pool sweeper stopped");
        }
        .instrument(component_span("pool_sweeper"))));
        tracing::info!(
            "Connection pool manager started (sweep every {})",
            humantime::format_duration(period)
        );
    }

    /// Stop the sweep, close every pool and shut the factories down within
    /// `shutdown_timeout`.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        let mut pools = Vec::new();
        self.pools.scan(|_, pool| pools.push(pool.clone()));
        for pool in &pools {
            pool.shutdown();
        }
        self.pools.clear();

        let mut factories = Vec::new();
        self.factories
            .scan(|_, factory| factories.push(factory.clone()));
        let shutdown_all = join_all(factories.iter().map(|factory| factory.shutdown()));
        if tokio::time::timeout(self.settings.shutdown_timeout, shutdown_all)
            .await
            .is_err()
        {
            tracing::warn!(
                "Connection factories did not shut down within {:?}",
                self.settings.shutdown_timeout
            );
        }
        tracing::info!("Connection pool manager shut down ({} pools closed)", pools.len());
    }
}

impl Drop for ConnectionPoolManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
