use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};

use crate::{
    metrics,
    pool::{ClientConnection, PoolError, PoolKey, PoolResult, PoolSettings, connection::PoolSlot},
    ports::connection_factory::{ConnectionError, ConnectionFactory, ConnectionOptions},
};

/// Point-in-time statistics of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
    pub created: u64,
    pub failed: u64,
    pub reused: u64,
    pub closed: u64,
    pub acquire_timeouts: u64,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    failed: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// Reusable connections to one (target, protocol) pair.
///
/// The number of open connections, idle or in use, never exceeds
/// `max_connections_per_target`: every connection holds one semaphore slot until it is closed.
pub struct ConnectionPool {
    key: PoolKey,
    label: String,
    settings: PoolSettings,
    options: ConnectionOptions,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<VecDeque<Arc<ClientConnection>>>,
    slots: Arc<Semaphore>,
    available: Arc<Notify>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(
        key: PoolKey,
        settings: PoolSettings,
        options: ConnectionOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let max = settings.max_connections_per_target.max(1);
        Self {
            label: key.to_string(),
            key,
            settings,
            options,
            factory,
            idle: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(max)),
            available: Arc::new(Notify::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<ClientConnection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since a connection was last handed out, returned or released.
    pub fn inactive_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// No open connections and no activity for longer than `limit`.
    pub fn is_unused_for(&self, limit: Duration) -> bool {
        self.max_connections() == self.slots.available_permits() && self.inactive_for() > limit
    }

    fn max_connections(&self) -> usize {
        self.settings.max_connections_per_target.max(1)
    }

    /// Acquire a connection within `acquire_timeout` (the pool default when `None`).
    ///
    /// A healthy idle connection is reused first. Otherwise a new one is opened if a slot is
    /// free; when all slots are busy the caller waits for a return or a close until the
    /// deadline, then fails with [`PoolError::Exhausted`].
    pub async fn get_connection(
        &self,
        acquire_timeout: Option<Duration>,
    ) -> PoolResult<Arc<ClientConnection>> {
        let waited = acquire_timeout.unwrap_or(self.settings.acquire_timeout);
        let deadline = tokio::time::Instant::now() + waited;

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed(self.label.clone()));
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(connection) = self.take_idle() {
                self.touch();
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Reusing connection {} from pool {}", connection.id(), self.label);
                return Ok(connection);
            }

            if let Ok(slot) = self.slots.clone().try_acquire_owned() {
                self.touch();
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                return self.open(slot, remaining).await;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Pool {} exhausted after {:?}", self.label, waited);
                return Err(PoolError::Exhausted {
                    pool: self.label.clone(),
                    waited,
                });
            }
        }
    }

    /// Pop idle connections until one passes validation; stale ones are closed on the way.
    fn take_idle(&self) -> Option<Arc<ClientConnection>> {
        let mut discarded = Vec::new();
        let found = {
            let mut idle = self.idle_queue();
            let mut found = None;
            while let Some(connection) = idle.pop_front() {
                if self.is_reusable(&connection) {
                    connection.mark_in_use();
                    found = Some(connection);
                    break;
                }
                discarded.push(connection);
            }
            found
        };
        for connection in discarded {
            self.close_connection(&connection, "failed validation");
        }
        found
    }

    fn is_reusable(&self, connection: &ClientConnection) -> bool {
        connection.is_healthy()
            && !connection.has_pending_exchange()
            && self.factory.validate_connection(connection.inner())
            && connection.age() < self.settings.max_lifetime
    }

    async fn open(
        &self,
        slot: OwnedSemaphorePermit,
        remaining: Duration,
    ) -> PoolResult<Arc<ClientConnection>> {
        let connect_timeout = self
            .options
            .connect_timeout
            .min(self.settings.connection_timeout)
            .min(remaining);
        let target = self.key.target.clone();
        let result = timeout(
            connect_timeout,
            self.factory.create_client_connection(&target, &self.options),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ConnectionError::Timeout {
                operation: "connect",
                target: target.to_string(),
                after: connect_timeout,
            })
        });

        match result {
            Ok(inner) => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                metrics::increment_pool_connections_created(&self.label);
                let slot = PoolSlot::new(slot, self.available.clone());
                let connection = Arc::new(ClientConnection::new(self.key.clone(), inner, slot));
                connection.mark_in_use();
                tracing::debug!("Opened connection {} in pool {}", connection.id(), self.label);
                self.publish_gauges();
                Ok(connection)
            }
            Err(source) => {
                // dropping the slot lets a waiter try again
                drop(slot);
                self.available.notify_one();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::increment_pool_connections_failed(&self.label);
                self.publish_gauges();
                tracing::warn!("Failed to open connection for pool {}: {}", self.label, source);
                Err(PoolError::Creation {
                    protocol: self.key.protocol,
                    target: target.to_string(),
                    source,
                })
            }
        }
    }

    /// Give a connection back. Healthy connections go to the idle queue; anything else is
    /// closed.
    pub fn return_connection(&self, connection: Arc<ClientConnection>) {
        self.touch();
        if self.is_closed() || !self.settings.enable_connection_reuse {
            self.close_connection(&connection, "reuse disabled");
            return;
        }
        if !self.is_reusable(&connection) {
            self.close_connection(&connection, "not reusable");
            return;
        }

        connection.mark_idle();
        self.idle_queue().push_back(connection);
        self.available.notify_one();
        self.publish_gauges();
    }

    /// Close a connection for good.
    pub fn release_connection(&self, connection: Arc<ClientConnection>) {
        self.touch();
        self.close_connection(&connection, "released");
    }

    fn close_connection(&self, connection: &ClientConnection, reason: &str) {
        // closing drops the slot, which wakes a waiter
        if connection.close() {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Closed connection {} in pool {} ({})",
                connection.id(),
                self.label,
                reason
            );
        }
    }

    /// Open up to `count` idle connections ahead of traffic, bounded by free slots.
    /// Returns how many were added.
    pub async fn warmup(&self, count: usize) -> usize {
        let mut slots = Vec::new();
        for _ in 0..count {
            match self.slots.clone().try_acquire_owned() {
                Ok(slot) => slots.push(slot),
                Err(_) => break,
            }
        }
        if slots.is_empty() {
            return 0;
        }

        let target = self.key.target.clone();
        let connections = self
            .factory
            .warmup(&target, &self.options, slots.len())
            .await;
        let mut added = 0;
        for (inner, slot) in connections.into_iter().zip(slots.drain(..)) {
            let slot = PoolSlot::new(slot, self.available.clone());
            let connection = Arc::new(ClientConnection::new(self.key.clone(), inner, slot));
            connection.mark_idle();
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            metrics::increment_pool_connections_created(&self.label);
            self.idle_queue().push_back(connection);
            added += 1;
        }
        drop(slots);
        if added > 0 {
            self.available.notify_waiters();
        }
        self.publish_gauges();
        tracing::info!("Warmed up {} connections for pool {}", added, self.label);
        added
    }

    /// Close idle connections past the idle timeout or the max lifetime, and dead ones.
    /// Returns how many were closed.
    pub fn cleanup_idle(&self) -> usize {
        let expired: VecDeque<Arc<ClientConnection>> = {
            let mut idle = self.idle_queue();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle.drain(..).partition(|c| {
                c.is_active()
                    && c.idle_for() <= self.settings.idle_timeout
                    && c.age() < self.settings.max_lifetime
            });
            *idle = keep;
            expired
        };

        for connection in &expired {
            self.close_connection(connection, "expired");
        }
        if !expired.is_empty() {
            tracing::debug!(
                "Cleaned up {} idle connections from pool {}",
                expired.len(),
                self.label
            );
        }
        self.publish_gauges();
        expired.len()
    }

    pub fn stats(&self) -> PoolStats {
        let max = self.max_connections();
        let idle = self.idle_queue().len();
        let total = max.saturating_sub(self.slots.available_permits());
        let created = self.counters.created.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        PoolStats {
            pool: self.label.clone(),
            total,
            idle,
            in_use: total.saturating_sub(idle),
            max,
            created,
            failed,
            reused: self.counters.reused.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
            success_rate: success_rate(created, failed),
        }
    }

    /// Open and creation success rate at least 80%.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();
        !self.is_closed() && stats.success_rate >= 0.8
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        metrics::set_pool_gauges(&self.label, stats.idle, stats.success_rate);
    }

    /// Close idle connections and refuse further acquisitions. In-use connections are
    /// closed when they come back.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.idle_queue().drain(..).collect();
        for connection in &drained {
            self.close_connection(connection, "pool shutdown");
        }
        self.available.notify_waiters();
        metrics::remove_pool_gauges(&self.label);
        tracing::info!(
            "Pool {} shut down, closed {} idle connections",
            self.label,
            drained.len()
        );
    }
}

fn success_rate(created: u64, failed: u64) -> f64 {
    match created + failed {
        0 => 1.0,
        attempts => created as f64 / attempts as f64,
    }
}
