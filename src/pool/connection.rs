use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{Notify, OwnedSemaphorePermit};
use uuid::Uuid;

use crate::{
    core::{
        address::{EndpointAddress, ProtocolType},
        exchange::{GatewayRequest, GatewayResponse},
    },
    pool::PoolKey,
    ports::connection_factory::{Connection, ConnectionError, ConnectionResult},
};

/// One unit of pool capacity. Dropping it frees the slot and wakes one waiter.
pub(crate) struct PoolSlot {
    permit: Option<OwnedSemaphorePermit>,
    available: Arc<Notify>,
}

impl PoolSlot {
    pub(crate) fn new(permit: OwnedSemaphorePermit, available: Arc<Notify>) -> Self {
        Self {
            permit: Some(permit),
            available,
        }
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        // the permit must be back before the waiter retries
        drop(self.permit.take());
        self.available.notify_one();
    }
}

/// A pooled outbound connection.
///
/// Wraps a factory-made [`Connection`] with identity, timestamps, usage counters and the pool
/// slot it occupies. The slot is freed when the connection is closed.
pub struct ClientConnection {
    id: String,
    pool_key: PoolKey,
    inner: Box<dyn Connection>,
    created_at: Instant,
    last_active: Mutex<Instant>,
    in_use: AtomicBool,
    closed: AtomicBool,
    exchange_pending: AtomicBool,
    request_count: AtomicU64,
    failure_count: AtomicU64,
    slot: Mutex<Option<PoolSlot>>,
}

impl ClientConnection {
    pub(crate) fn new(
        pool_key: PoolKey,
        inner: Box<dyn Connection>,
        slot: PoolSlot,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            pool_key,
            inner,
            created_at: now,
            last_active: Mutex::new(now),
            in_use: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exchange_pending: AtomicBool::new(false),
            request_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            slot: Mutex::new(Some(slot)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    pub fn target(&self) -> &EndpointAddress {
        self.inner.target()
    }

    pub fn protocol(&self) -> ProtocolType {
        self.inner.protocol()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.inner.is_active()
    }

    pub fn is_healthy(&self) -> bool {
        self.is_active() && self.inner.is_healthy()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// A send started but never finished, e.g. because its future was dropped. The wire
    /// state is unknown and the connection must not be reused.
    pub fn has_pending_exchange(&self) -> bool {
        self.exchange_pending.load(Ordering::Acquire)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inner(&self) -> &dyn Connection {
        self.inner.as_ref()
    }

    pub(crate) fn mark_in_use(&self) {
        self.in_use.store(true, Ordering::Release);
        self.touch();
    }

    pub(crate) fn mark_idle(&self) {
        self.in_use.store(false, Ordering::Release);
        self.touch();
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Forward a request over this connection.
    pub async fn send(&self, request: GatewayRequest) -> ConnectionResult<GatewayResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed {
                id: self.id.clone(),
            });
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
        self.exchange_pending.store(true, Ordering::Release);
        let result = self.inner.send(request).await;
        self.exchange_pending.store(false, Ordering::Release);
        if result.is_err() {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
        result
    }

    /// Close the underlying connection and free its pool slot. Returns `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.in_use.store(false, Ordering::Release);
        self.inner.close();
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("pool", &self.pool_key.to_string())
            .field("in_use", &self.is_in_use())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("requests", &self.request_count())
            .field("failures", &self.failure_count())
            .finish()
    }
}
