//! Filter chain model.
//!
//! Filters are grouped by [`FilterPhase`] and ordered by an explicit `order` value inside a
//! phase. Global filters run after the route's own filters of the same phase. A filter can
//! stop the chain by returning [`FilterOutcome::Terminate`] (for example after writing a
//! response itself); a failing filter aborts the rest of the chain and the request moves to
//! the error phase.
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use http::{HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::{context::RequestContext, exchange::GatewayResponse, predicate::GENKEY_0},
    error::{ErrorKind, GatewayError},
};

/// Attribute holding the path after `StripPrefix` ran.
pub const STRIPPED_PATH_ATTR: &str = "gateway.stripped_path";

/// Errors raised while building or running filters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FilterError {
    #[error("Unknown filter type: {0}")]
    UnknownType(String),

    #[error("Filter '{filter}' requires argument '{argument}'")]
    MissingArgument {
        filter: &'static str,
        argument: &'static str,
    },

    #[error("Filter '{filter}' has invalid argument '{argument}': {message}")]
    InvalidArgument {
        filter: &'static str,
        argument: &'static str,
        message: String,
    },

    /// The filter refused the request with a specific status
    #[error("Rejected with {status}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("{0}")]
    Failed(String),
}

/// Result alias for filter operations
pub type FilterResult<T> = Result<T, FilterError>;

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilterError::Rejected { status, .. } if *status == StatusCode::UNAUTHORIZED => {
                ErrorKind::AuthenticationError
            }
            FilterError::Rejected { status, .. } if *status == StatusCode::BAD_REQUEST => {
                ErrorKind::ProtocolError
            }
            _ => ErrorKind::InternalError,
        }
    }
}

/// Execution phases, in the order they run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterPhase {
    /// After the route matched, before a backend is selected
    #[default]
    PreRoute,
    /// After a backend connection was acquired, before the request is sent
    PreForward,
    /// After the backend responded
    Post,
    /// After the request failed
    Error,
}

impl FilterPhase {
    pub const ALL: [FilterPhase; 4] = [
        FilterPhase::PreRoute,
        FilterPhase::PreForward,
        FilterPhase::Post,
        FilterPhase::Error,
    ];
}

impl FromStr for FilterPhase {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pre_route" | "pre" | "pre_routing" => Ok(FilterPhase::PreRoute),
            "pre_forward" | "route" => Ok(FilterPhase::PreForward),
            "post" => Ok(FilterPhase::Post),
            "error" => Ok(FilterPhase::Error),
            other => Err(FilterError::InvalidArgument {
                filter: "*",
                argument: "phase",
                message: format!("unknown phase '{other}'"),
            }),
        }
    }
}

impl fmt::Display for FilterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterPhase::PreRoute => "pre_route",
            FilterPhase::PreForward => "pre_forward",
            FilterPhase::Post => "post",
            FilterPhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the chain should do after a filter ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    Continue,
    Terminate,
}

/// Extension point for filters that are not built in.
pub trait FilterHandler: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn apply(&self, context: &mut RequestContext) -> FilterResult<FilterOutcome>;
}

/// Built-in filter behaviors.
pub enum FilterAction {
    AddRequestHeader { name: HeaderName, value: HeaderValue },
    RemoveRequestHeader(HeaderName),
    AddResponseHeader { name: HeaderName, value: HeaderValue },
    RemoveResponseHeader(HeaderName),
    /// Drop the first N path segments
    StripPrefix(usize),
    PrefixPath(String),
    SetPath(String),
    SetStatus(StatusCode),
    /// Answer 404 without contacting a backend
    NotFound,
    Custom(Box<dyn FilterHandler>),
}

impl FilterAction {
    /// Phase used when a definition does not name one.
    pub fn default_phase(&self) -> FilterPhase {
        match self {
            FilterAction::AddResponseHeader { .. }
            | FilterAction::RemoveResponseHeader(_)
            | FilterAction::SetStatus(_) => FilterPhase::Post,
            _ => FilterPhase::PreRoute,
        }
    }

    fn apply(&self, context: &mut RequestContext) -> FilterResult<FilterOutcome> {
        match self {
            FilterAction::AddRequestHeader { name, value } => {
                context
                    .request_mut()
                    .headers
                    .append(name.clone(), value.clone());
            }
            FilterAction::RemoveRequestHeader(name) => {
                context.request_mut().headers.remove(name);
            }
            FilterAction::AddResponseHeader { name, value } => {
                if let Some(response) = context.response_mut() {
                    response.headers.append(name.clone(), value.clone());
                }
            }
            FilterAction::RemoveResponseHeader(name) => {
                if let Some(response) = context.response_mut() {
                    response.headers.remove(name);
                }
            }
            FilterAction::StripPrefix(parts) => {
                let stripped = strip_segments(&context.request().path, *parts);
                tracing::debug!(
                    "Stripped {} parts from path: {} -> {}",
                    parts,
                    context.request().path,
                    stripped
                );
                context.request_mut().path = stripped.clone();
                context.set_attribute(STRIPPED_PATH_ATTR, stripped);
            }
            FilterAction::PrefixPath(prefix) => {
                let path = format!("{}{}", prefix.trim_end_matches('/'), context.request().path);
                context.request_mut().path = path;
            }
            FilterAction::SetPath(path) => {
                context.request_mut().path = path.clone();
            }
            FilterAction::SetStatus(status) => {
                if let Some(response) = context.response_mut() {
                    response.status = *status;
                }
            }
            FilterAction::NotFound => {
                context.set_response(GatewayResponse::not_found());
                return Ok(FilterOutcome::Terminate);
            }
            FilterAction::Custom(handler) => return handler.apply(context),
        }
        Ok(FilterOutcome::Continue)
    }
}

fn strip_segments(path: &str, parts: usize) -> String {
    let kept: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(parts)
        .collect();
    let mut stripped = format!("/{}", kept.join("/"));
    if path.ends_with('/') && !kept.is_empty() {
        stripped.push('/');
    }
    stripped
}

/// A filter bound to a route: name, phase, order and behavior.
pub struct RouteFilter {
    name: String,
    phase: FilterPhase,
    order: i32,
    enabled: bool,
    action: FilterAction,
}

impl RouteFilter {
    pub fn new(name: impl Into<String>, action: FilterAction) -> Self {
        Self {
            name: name.into(),
            phase: action.default_phase(),
            order: 0,
            enabled: true,
            action,
        }
    }

    pub fn with_phase(mut self, phase: FilterPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> FilterPhase {
        self.phase
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for RouteFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteFilter")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("order", &self.order)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// The ordered filters of one route.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<RouteFilter>,
}

impl FilterChain {
    /// Build a chain. Disabled filters are dropped; inside a phase route filters come first
    /// (by order) and global filters follow (by order).
    pub fn new(route_filters: Vec<RouteFilter>, global_filters: Vec<RouteFilter>) -> Self {
        let mut tagged: Vec<(bool, RouteFilter)> = route_filters
            .into_iter()
            .map(|f| (false, f))
            .chain(global_filters.into_iter().map(|f| (true, f)))
            .filter(|(_, f)| f.enabled)
            .collect();
        tagged.sort_by_key(|(global, f)| (f.phase, *global, f.order));
        Self {
            filters: tagged.into_iter().map(|(_, f)| f).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> &[RouteFilter] {
        &self.filters
    }

    /// Filters of one phase, in execution order.
    pub fn phase(&self, phase: FilterPhase) -> impl Iterator<Item = &RouteFilter> {
        self.filters.iter().filter(move |f| f.phase == phase)
    }

    /// Run every filter of `phase` in order. Stops early on `Terminate`; a failing filter
    /// aborts the remainder.
    pub fn execute(
        &self,
        phase: FilterPhase,
        context: &mut RequestContext,
    ) -> Result<FilterOutcome, GatewayError> {
        for filter in self.phase(phase) {
            match filter.action.apply(context) {
                Ok(FilterOutcome::Continue) => {}
                Ok(FilterOutcome::Terminate) => {
                    tracing::debug!(
                        "Filter {} terminated the {} phase for request {}",
                        filter.name,
                        phase,
                        context.id()
                    );
                    return Ok(FilterOutcome::Terminate);
                }
                Err(e) => {
                    tracing::warn!(
                        "Filter {} failed in {} phase for request {}: {}",
                        filter.name,
                        phase,
                        context.id(),
                        e
                    );
                    return Err(GatewayError::Filter {
                        filter: filter.name.clone(),
                        source: e,
                    });
                }
            }
        }
        Ok(FilterOutcome::Continue)
    }
}

type FilterBuilder =
    Arc<dyn Fn(&HashMap<String, String>) -> FilterResult<FilterAction> + Send + Sync>;

/// Builds filters from `{type, order, enabled, args}` definitions, keyed by
/// case-insensitive type name.
#[derive(Clone)]
pub struct FilterRegistry {
    builders: HashMap<String, FilterBuilder>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("AddRequestHeader", |args| {
            let (name, value) = header_pair("AddRequestHeader", args)?;
            Ok(FilterAction::AddRequestHeader { name, value })
        });
        registry.register("RemoveRequestHeader", |args| {
            Ok(FilterAction::RemoveRequestHeader(header_name(
                "RemoveRequestHeader",
                args,
            )?))
        });
        registry.register("AddResponseHeader", |args| {
            let (name, value) = header_pair("AddResponseHeader", args)?;
            Ok(FilterAction::AddResponseHeader { name, value })
        });
        registry.register("RemoveResponseHeader", |args| {
            Ok(FilterAction::RemoveResponseHeader(header_name(
                "RemoveResponseHeader",
                args,
            )?))
        });
        registry.register("StripPrefix", |args| {
            let parts = match arg(args, "parts") {
                Some(raw) => raw.trim().parse::<usize>().map_err(|e| {
                    FilterError::InvalidArgument {
                        filter: "StripPrefix",
                        argument: "parts",
                        message: e.to_string(),
                    }
                })?,
                None => 1,
            };
            Ok(FilterAction::StripPrefix(parts))
        });
        registry.register("PrefixPath", |args| {
            Ok(FilterAction::PrefixPath(path_arg("PrefixPath", args)?))
        });
        registry.register("SetPath", |args| {
            Ok(FilterAction::SetPath(path_arg("SetPath", args)?))
        });
        registry.register("SetStatus", |args| {
            let raw = arg(args, "status").ok_or(FilterError::MissingArgument {
                filter: "SetStatus",
                argument: "status",
            })?;
            let status = raw
                .trim()
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| FilterError::InvalidArgument {
                    filter: "SetStatus",
                    argument: "status",
                    message: format!("'{raw}' is not an HTTP status code"),
                })?;
            Ok(FilterAction::SetStatus(status))
        });
        registry.register("NotFound", |_| Ok(FilterAction::NotFound));
        registry
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&HashMap<String, String>) -> FilterResult<FilterAction> + Send + Sync + 'static,
    {
        self.builders
            .insert(name.to_ascii_lowercase(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(&name.to_ascii_lowercase())
    }

    /// Build a filter. `args.phase` overrides the action's default phase.
    pub fn create(
        &self,
        name: &str,
        order: i32,
        enabled: bool,
        args: &HashMap<String, String>,
    ) -> FilterResult<RouteFilter> {
        let builder = self
            .builders
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| FilterError::UnknownType(name.to_string()))?;
        let action = builder(args)?;
        let mut filter = RouteFilter::new(name, action)
            .with_order(order)
            .with_enabled(enabled);
        if let Some(phase) = args.get("phase") {
            filter = filter.with_phase(phase.parse()?);
        }
        Ok(filter)
    }
}

fn arg<'a>(args: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    args.get(key)
        .or_else(|| args.get(GENKEY_0))
        .map(String::as_str)
}

fn header_name(filter: &'static str, args: &HashMap<String, String>) -> FilterResult<HeaderName> {
    let raw = arg(args, "name").ok_or(FilterError::MissingArgument {
        filter,
        argument: "name",
    })?;
    HeaderName::from_bytes(raw.trim().to_ascii_lowercase().as_bytes()).map_err(|e| {
        FilterError::InvalidArgument {
            filter,
            argument: "name",
            message: e.to_string(),
        }
    })
}

fn header_pair(
    filter: &'static str,
    args: &HashMap<String, String>,
) -> FilterResult<(HeaderName, HeaderValue)> {
    let name = header_name(filter, args)?;
    let raw = args.get("value").ok_or(FilterError::MissingArgument {
        filter,
        argument: "value",
    })?;
    let value = HeaderValue::from_str(raw).map_err(|e| FilterError::InvalidArgument {
        filter,
        argument: "value",
        message: e.to_string(),
    })?;
    Ok((name, value))
}

fn path_arg(filter: &'static str, args: &HashMap<String, String>) -> FilterResult<String> {
    let raw = arg(args, "path").ok_or(FilterError::MissingArgument {
        filter,
        argument: "path",
    })?;
    if !raw.starts_with('/') {
        return Err(FilterError::InvalidArgument {
            filter,
            argument: "path",
            message: "must start with '/'".to_string(),
        });
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::exchange::GatewayRequest;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Recorder {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl FilterHandler for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn apply(&self, _context: &mut RequestContext) -> FilterResult<FilterOutcome> {
            self.log.lock().unwrap().push(self.label);
            Ok(FilterOutcome::Continue)
        }
    }

    struct Failing(Arc<AtomicUsize>);

    impl FilterHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn apply(&self, _context: &mut RequestContext) -> FilterResult<FilterOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(FilterError::Rejected {
                status: StatusCode::UNAUTHORIZED,
                message: "missing token".to_string(),
            })
        }
    }

    fn recorder(
        label: &'static str,
        log: &Arc<std::sync::Mutex<Vec<&'static str>>>,
        order: i32,
    ) -> RouteFilter {
        RouteFilter::new(
            label,
            FilterAction::Custom(Box::new(Recorder {
                label,
                log: log.clone(),
            })),
        )
        .with_order(order)
    }

    #[test]
    fn test_phase_order_and_global_filters_run_last() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = FilterChain::new(
            vec![
                recorder("route-20", &log, 20),
                recorder("route-10", &log, 10),
                recorder("route-post", &log, 0).with_phase(FilterPhase::Post),
            ],
            vec![recorder("global-1", &log, 1)],
        );

        let mut ctx = RequestContext::new(GatewayRequest::get("/"));
        for phase in FilterPhase::ALL {
            chain.execute(phase, &mut ctx).unwrap();
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["route-10", "route-20", "global-1", "route-post"]
        );
    }

    #[test]
    fn test_disabled_filters_are_dropped() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = FilterChain::new(
            vec![
                recorder("on", &log, 0),
                recorder("off", &log, 1).with_enabled(false),
            ],
            vec![],
        );
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_not_found_terminates_chain() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = FilterChain::new(
            vec![
                RouteFilter::new("NotFound", FilterAction::NotFound).with_order(1),
                recorder("after", &log, 2),
            ],
            vec![],
        );

        let mut ctx = RequestContext::new(GatewayRequest::get("/"));
        let outcome = chain.execute(FilterPhase::PreRoute, &mut ctx).unwrap();
        assert_eq!(outcome, FilterOutcome::Terminate);
        assert_eq!(ctx.response().unwrap().status, StatusCode::NOT_FOUND);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failure_aborts_remaining_filters() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FilterChain::new(
            vec![
                RouteFilter::new("auth", FilterAction::Custom(Box::new(Failing(calls.clone()))))
                    .with_order(1),
                recorder("after", &log, 2),
            ],
            vec![],
        );

        let mut ctx = RequestContext::new(GatewayRequest::get("/"));
        let err = chain.execute(FilterPhase::PreRoute, &mut ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_segments("/api/v1/users", 1), "/v1/users");
        assert_eq!(strip_segments("/api/v1/users", 2), "/users");
        assert_eq!(strip_segments("/api", 3), "/");
        assert_eq!(strip_segments("/api/v1/", 1), "/v1/");

        let registry = FilterRegistry::with_builtins();
        let filter = registry
            .create("StripPrefix", 0, true, &args(&[("parts", "1")]))
            .unwrap();
        let chain = FilterChain::new(vec![filter], vec![]);
        let mut ctx = RequestContext::new(GatewayRequest::get("/api/users?x=1"));
        chain.execute(FilterPhase::PreRoute, &mut ctx).unwrap();
        assert_eq!(ctx.request().path, "/users");
        assert_eq!(ctx.request().path_and_query(), "/users?x=1");
        assert_eq!(
            ctx.attribute(STRIPPED_PATH_ATTR),
            Some(&serde_json::json!("/users"))
        );
    }

    #[test]
    fn test_header_filters() {
        let registry = FilterRegistry::with_builtins();
        let add = registry
            .create(
                "AddRequestHeader",
                0,
                true,
                &args(&[("name", "X-Gateway"), ("value", "meridian")]),
            )
            .unwrap();
        let post = registry
            .create(
                "AddResponseHeader",
                0,
                true,
                &args(&[("name", "X-Served-By"), ("value", "edge")]),
            )
            .unwrap();
        assert_eq!(post.phase(), FilterPhase::Post);

        let chain = FilterChain::new(vec![add, post], vec![]);
        let mut ctx = RequestContext::new(GatewayRequest::get("/"));
        chain.execute(FilterPhase::PreRoute, &mut ctx).unwrap();
        assert_eq!(ctx.request().header("x-gateway"), Some("meridian"));

        ctx.set_response(GatewayResponse::new(StatusCode::OK));
        chain.execute(FilterPhase::Post, &mut ctx).unwrap();
        assert_eq!(
            ctx.response().unwrap().headers.get("x-served-by").unwrap(),
            "edge"
        );
    }

    #[test]
    fn test_registry_rejects_bad_definitions() {
        let registry = FilterRegistry::with_builtins();
        assert!(matches!(
            registry.create("Rewrite", 0, true, &HashMap::new()),
            Err(FilterError::UnknownType(_))
        ));
        assert!(matches!(
            registry.create("StripPrefix", 0, true, &args(&[("parts", "many")])),
            Err(FilterError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.create("SetStatus", 0, true, &args(&[("status", "99")])),
            Err(FilterError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.create("NotFound", 0, true, &args(&[("phase", "sideways")])),
            Err(FilterError::InvalidArgument { .. })
        ));
    }
}
