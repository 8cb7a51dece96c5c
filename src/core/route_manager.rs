//! Route registry and matching.
//!
//! Routes are stored by id. Every write rebuilds an immutable snapshot that groups routes by
//! protocol type and sorts each group by ascending `order`; the snapshot is swapped in
//! atomically, so a concurrent `match_route` sees either the old table or the new one.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::{
    core::{address::ProtocolType, context::RequestContext, route::Route},
    metrics::{self, RouteMatchTimer},
};

/// Errors raised by the route registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    /// The route failed `is_configuration_valid`
    #[error("Route '{id}' has an invalid configuration: {reason}")]
    InvalidConfiguration { id: String, reason: String },

    /// The manager is not accepting this operation in its current state
    #[error("Route manager is {state}")]
    NotRunning { state: LifecycleState },
}

/// Result type alias for route registry operations
pub type RouteResult<T> = Result<T, RouteError>;

/// Lifecycle: `Created → Initialized → Running → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct RouteTable {
    by_protocol: HashMap<ProtocolType, Vec<Arc<Route>>>,
}

pub struct RouteManager {
    routes: scc::HashMap<String, Arc<Route>>,
    table: ArcSwap<RouteTable>,
    writer: Mutex<()>,
    state: RwLock<LifecycleState>,
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            routes: scc::HashMap::new(),
            table: ArcSwap::from_pointee(RouteTable::default()),
            writer: Mutex::new(()),
            state: RwLock::new(LifecycleState::Created),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> RouteResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == to {
            return Ok(());
        }
        if !from.contains(&state) {
            return Err(RouteError::NotRunning { state: *state });
        }
        *state = to;
        Ok(())
    }

    pub fn init(&self) -> RouteResult<()> {
        self.transition(&[LifecycleState::Created], LifecycleState::Initialized)?;
        tracing::info!("Route manager initialized");
        Ok(())
    }

    /// Begin serving `match_route`. Implies `init`.
    pub fn start(&self) -> RouteResult<()> {
        self.transition(
            &[LifecycleState::Created, LifecycleState::Initialized],
            LifecycleState::Running,
        )?;
        tracing::info!("Route manager started with {} routes", self.routes.len());
        Ok(())
    }

    /// Stop matching and drop every route.
    pub fn shutdown(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = LifecycleState::Stopped;
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.routes.clear();
        self.table.store(Arc::new(RouteTable::default()));
        tracing::info!("Route manager shut down");
    }

    fn ensure_writable(&self) -> RouteResult<()> {
        match self.state() {
            LifecycleState::Stopped => Err(RouteError::NotRunning {
                state: LifecycleState::Stopped,
            }),
            _ => Ok(()),
        }
    }

    fn check(route: &Route) -> RouteResult<()> {
        if route.predicates().is_empty() {
            return Err(RouteError::InvalidConfiguration {
                id: route.id().to_string(),
                reason: "a route needs at least one predicate".to_string(),
            });
        }
        if !route.is_configuration_valid() {
            return Err(RouteError::InvalidConfiguration {
                id: route.id().to_string(),
                reason: format!(
                    "route protocol {} differs from service protocol {}",
                    route.protocol().kind,
                    route.service().protocol().kind
                ),
            });
        }
        Ok(())
    }

    /// Add a route, replacing any route with the same id.
    pub fn insert(&self, route: Route) -> RouteResult<Arc<Route>> {
        self.ensure_writable()?;
        Self::check(&route)?;

        let route = Arc::new(route);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let replaced = self
            .routes
            .upsert(route.id().to_string(), route.clone())
            .is_some();
        self.rebuild();

        if replaced {
            tracing::info!("Replaced route {}", route.id());
        } else {
            tracing::info!("Added route {} (order {})", route.id(), route.order());
        }
        Ok(route)
    }

    pub fn delete_by_id(&self, id: &str) -> Option<Arc<Route>> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.routes.remove(id).map(|(_, route)| route);
        if removed.is_some() {
            self.rebuild();
            tracing::info!("Removed route {}", id);
        }
        removed
    }

    pub fn select_by_id(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read(id, |_, route| route.clone())
    }

    /// All routes, by ascending order then id.
    pub fn select_all(&self) -> Vec<Arc<Route>> {
        let mut all = Vec::with_capacity(self.routes.len());
        self.routes.scan(|_, route| all.push(route.clone()));
        all.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.id().cmp(b.id())));
        all
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Replace the whole route set. Nothing changes unless every route is valid.
    pub fn replace_all(&self, routes: Vec<Route>) -> RouteResult<()> {
        self.ensure_writable()?;
        for route in &routes {
            Self::check(route)?;
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.routes.clear();
        let count = routes.len();
        for route in routes {
            self.routes.upsert(route.id().to_string(), Arc::new(route));
        }
        self.rebuild();
        tracing::info!("Reloaded route table with {} routes", count);
        Ok(())
    }

    /// Caller holds the writer lock.
    fn rebuild(&self) {
        let mut table = RouteTable::default();
        self.routes.scan(|_, route| {
            table
                .by_protocol
                .entry(route.protocol().kind)
                .or_default()
                .push(route.clone());
        });
        for routes in table.by_protocol.values_mut() {
            routes.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.id().cmp(b.id())));
        }
        self.table.store(Arc::new(table));
    }

    /// First enabled route, in priority order, whose predicates all accept the request.
    /// `Ok(None)` is the not-found outcome.
    pub fn match_route(&self, context: &RequestContext) -> RouteResult<Option<Arc<Route>>> {
        let state = self.state();
        if state != LifecycleState::Running {
            return Err(RouteError::NotRunning { state });
        }

        let _timer = RouteMatchTimer::new();
        let protocol = context.request().protocol.kind;
        let table = self.table.load();
        let matched = table
            .by_protocol
            .get(&protocol)
            .and_then(|routes| routes.iter().find(|route| route.matches(context)))
            .cloned();

        match &matched {
            Some(route) => tracing::debug!(
                "Request {} {} matched route {}",
                context.id(),
                context.request().path,
                route.id()
            ),
            None => {
                metrics::increment_route_not_found();
                tracing::debug!(
                    "No route for {} {} ({})",
                    context.request().method,
                    context.request().path,
                    protocol
                );
            }
        }
        Ok(matched)
    }
}
