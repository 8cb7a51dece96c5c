//! Per-request state threaded through matching, dispatch and completion.
//!
//! A [`RequestContext`] is created when a request arrives and is owned by that request's
//! processing flow. The matched route and the selected endpoint are write-once; completion is
//! idempotent and runs the registered cleanup hooks exactly once, even when an error ends the
//! request early.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    core::{
        address::EndpointAddress,
        exchange::{GatewayRequest, GatewayResponse},
        route::Route,
    },
    error::GatewayError,
    metrics,
    pool::ClientConnection,
};

const SLOW_REQUEST_INFO: Duration = Duration::from_secs(1);
const SLOW_REQUEST_WARN: Duration = Duration::from_secs(5);

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Errors from misuse of the request context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextError {
    /// A write-once field was written a second time
    #[error("{field} already set for request {request_id}")]
    AlreadySet {
        field: &'static str,
        request_id: String,
    },
}

/// Result alias for context operations
pub type ContextResult<T> = Result<T, ContextError>;

/// Work to run once when the request completes.
pub type CleanupHook = Box<dyn FnOnce() + Send>;

/// Coarse processing state, derived from what has been recorded so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Processing,
    RouteMatched,
    EndpointSelected,
    Completed,
    Error,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::RouteMatched => "ROUTE_MATCHED",
            RequestStatus::EndpointSelected => "ENDPOINT_SELECTED",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Timing summary captured at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceSummary {
    pub total: Duration,
    pub route_matching: Option<Duration>,
    pub endpoint_selection: Option<Duration>,
}

pub struct RequestContext {
    id: String,
    started_at: Instant,
    received_at: DateTime<Utc>,
    request: GatewayRequest,
    response: Option<GatewayResponse>,
    matched_route: OnceLock<Arc<Route>>,
    route_matched_at: OnceLock<Instant>,
    selected_endpoint: OnceLock<EndpointAddress>,
    endpoint_selected_at: OnceLock<Instant>,
    client_connection: Option<Arc<ClientConnection>>,
    attributes: HashMap<String, serde_json::Value>,
    completed: AtomicBool,
    performance: OnceLock<PerformanceSummary>,
    error: OnceLock<GatewayError>,
    cleanup_hooks: Mutex<Vec<CleanupHook>>,
}

impl RequestContext {
    pub fn new(request: GatewayRequest) -> Self {
        let received_at = Utc::now();
        Self {
            id: Self::generate_id(&received_at),
            started_at: Instant::now(),
            received_at,
            request,
            response: None,
            matched_route: OnceLock::new(),
            route_matched_at: OnceLock::new(),
            selected_endpoint: OnceLock::new(),
            endpoint_selected_at: OnceLock::new(),
            client_connection: None,
            attributes: HashMap::new(),
            completed: AtomicBool::new(false),
            performance: OnceLock::new(),
            error: OnceLock::new(),
            cleanup_hooks: Mutex::new(Vec::new()),
        }
    }

    /// `<millis>-<nanos % 10000>-<sequence % 1000>`
    fn generate_id(now: &DateTime<Utc>) -> String {
        let sequence = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{:04}-{:03}",
            now.timestamp_millis(),
            now.timestamp_subsec_nanos() % 10_000,
            sequence % 1_000
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn request(&self) -> &GatewayRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut GatewayRequest {
        &mut self.request
    }

    pub fn response(&self) -> Option<&GatewayResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut GatewayResponse> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: GatewayResponse) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<GatewayResponse> {
        self.response.take()
    }

    /// Record the matched route. Fails if a route was already recorded.
    pub fn set_matched_route(&self, route: Arc<Route>) -> ContextResult<()> {
        self.matched_route
            .set(route)
            .map_err(|_| self.already_set("matched route"))?;
        let _ = self.route_matched_at.set(Instant::now());
        Ok(())
    }

    pub fn matched_route(&self) -> Option<&Arc<Route>> {
        self.matched_route.get()
    }

    /// Record the selected endpoint. Fails if an endpoint was already recorded.
    pub fn set_selected_endpoint(&self, endpoint: EndpointAddress) -> ContextResult<()> {
        self.selected_endpoint
            .set(endpoint)
            .map_err(|_| self.already_set("selected endpoint"))?;
        let _ = self.endpoint_selected_at.set(Instant::now());
        Ok(())
    }

    pub fn selected_endpoint(&self) -> Option<&EndpointAddress> {
        self.selected_endpoint.get()
    }

    pub fn set_client_connection(&mut self, connection: Arc<ClientConnection>) {
        self.client_connection = Some(connection);
    }

    pub fn client_connection(&self) -> Option<&Arc<ClientConnection>> {
        self.client_connection.as_ref()
    }

    fn already_set(&self, field: &'static str) -> ContextError {
        ContextError::AlreadySet {
            field,
            request_id: self.id.clone(),
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<serde_json::Value> {
        self.attributes.remove(key)
    }

    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Whether the inbound protocol differs from the selected backend's protocol.
    pub fn needs_protocol_conversion(&self) -> bool {
        self.selected_endpoint()
            .is_some_and(|endpoint| endpoint.protocol() != self.request.protocol.kind)
    }

    pub fn total_duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time from arrival until the route was matched.
    pub fn route_matching_duration(&self) -> Option<Duration> {
        self.route_matched_at
            .get()
            .map(|at| at.duration_since(self.started_at))
    }

    /// Time from route match until an endpoint was selected.
    pub fn endpoint_selection_duration(&self) -> Option<Duration> {
        let selected = self.endpoint_selected_at.get()?;
        let matched = self.route_matched_at.get().unwrap_or(&self.started_at);
        Some(selected.duration_since(*matched))
    }

    /// Register work to run exactly once on completion. If the context is already complete
    /// the hook runs immediately.
    pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self
                .cleanup_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_completed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Mark the request complete. Only the first call runs cleanup and records metrics;
    /// it returns `true`, later calls return `false`.
    pub fn mark_complete(&self) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let hooks = std::mem::take(
            &mut *self
                .cleanup_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }

        let summary = PerformanceSummary {
            total: self.total_duration(),
            route_matching: self.route_matching_duration(),
            endpoint_selection: self.endpoint_selection_duration(),
        };
        let _ = self.performance.set(summary);
        self.record_completion(&summary);
        true
    }

    fn record_completion(&self, summary: &PerformanceSummary) {
        let route_id = self
            .matched_route()
            .map_or("none", |route| route.id());
        metrics::record_request_completion(route_id, summary);

        if summary.total > SLOW_REQUEST_WARN {
            tracing::warn!(
                "Slow request {} on route {}: {:?}",
                self.id,
                route_id,
                summary.total
            );
        } else if summary.total > SLOW_REQUEST_INFO {
            tracing::info!(
                "Request {} on route {} took {:?}",
                self.id,
                route_id,
                summary.total
            );
        }
    }

    /// Attach an error and complete the request if it is not complete yet.
    /// The first error wins; cleanup never runs twice.
    pub fn set_error(&self, error: GatewayError) {
        if self.error.set(error).is_err() {
            tracing::debug!("Request {} already carries an error", self.id);
        }
        self.mark_complete();
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.error.get()
    }

    pub fn performance(&self) -> Option<&PerformanceSummary> {
        self.performance.get()
    }

    pub fn status(&self) -> RequestStatus {
        if self.error.get().is_some() {
            RequestStatus::Error
        } else if self.is_completed() {
            RequestStatus::Completed
        } else if self.selected_endpoint.get().is_some() {
            RequestStatus::EndpointSelected
        } else if self.matched_route.get().is_some() {
            RequestStatus::RouteMatched
        } else {
            RequestStatus::Processing
        }
    }
}

impl Drop for RequestContext {
    // a cancelled request future drops its context before completion
    fn drop(&mut self) {
        if !self.is_completed() {
            tracing::debug!("Request {} abandoned before completion", self.id);
            self.mark_complete();
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("route", &self.matched_route().map(|r| r.id()))
            .field("endpoint", &self.selected_endpoint().map(|e| e.uri()))
            .field("status", &self.status())
            .finish()
    }
}
