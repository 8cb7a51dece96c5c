//! Route predicates and the factory that builds them from configuration.
//!
//! A predicate is a boolean test over the inbound request. A route matches only when all of
//! its predicates pass. Each route gets its own predicate instances; the registry builds a new
//! one for every definition it is handed.
use std::{collections::HashMap, fmt, net::IpAddr, sync::Arc};

use http::{HeaderName, Method};
use regex::Regex;
use thiserror::Error;

use crate::core::context::RequestContext;

/// Shorthand argument key used when a definition gives a single positional value.
pub const GENKEY_0: &str = "_genkey_0";

/// Errors raised while building predicates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PredicateError {
    #[error("Unknown predicate type: {0}")]
    UnknownType(String),

    #[error("Predicate '{predicate}' requires argument '{argument}'")]
    MissingArgument {
        predicate: &'static str,
        argument: &'static str,
    },

    #[error("Predicate '{predicate}' has invalid argument '{argument}': {message}")]
    InvalidArgument {
        predicate: &'static str,
        argument: &'static str,
        message: String,
    },
}

/// Result alias for predicate construction
pub type PredicateResult<T> = Result<T, PredicateError>;

/// Extension point for predicates that are not built in.
pub trait RequestMatcher: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn test(&self, context: &RequestContext) -> bool;
}

/// Ant-style path pattern (`?`, `*`, `**`, `{var}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<String>,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            segments: split_path(pattern).map(str::to_string).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a request path; any query string is ignored.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = split_path(path).collect();
        let pattern: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        match_segments(&pattern, &segments)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, remaining)) => {
                segment_matches(head, segment) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

/// Single-segment wildcard match; `{var}` behaves like `*`.
fn segment_matches(pattern: &str, segment: &str) -> bool {
    let mut normalized = String::with_capacity(pattern.len());
    let mut in_var = false;
    for c in pattern.chars() {
        match c {
            '{' => in_var = true,
            '}' if in_var => {
                in_var = false;
                normalized.push('*');
            }
            _ if in_var => {}
            _ => normalized.push(c),
        }
    }
    wildcard(normalized.as_bytes(), segment.as_bytes())
}

fn wildcard(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// A request predicate.
pub enum Predicate {
    Path(Vec<PathPattern>),
    Method(Vec<Method>),
    Header {
        name: HeaderName,
        value: Option<Regex>,
    },
    /// Host patterns; `*` matches within a label (`*.example.com`).
    Host(Vec<String>),
    Query {
        name: String,
        value: Option<Regex>,
    },
    RemoteAddr(Vec<IpAddr>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Custom(Box<dyn RequestMatcher>),
}

impl Predicate {
    pub fn path(pattern: &str) -> Self {
        Predicate::Path(vec![PathPattern::new(pattern)])
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All(mut all) => {
                all.push(other);
                Predicate::All(all)
            }
            first => Predicate::All(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Any(mut any) => {
                any.push(other);
                Predicate::Any(any)
            }
            first => Predicate::Any(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn name(&self) -> &str {
        match self {
            Predicate::Path(_) => "Path",
            Predicate::Method(_) => "Method",
            Predicate::Header { .. } => "Header",
            Predicate::Host(_) => "Host",
            Predicate::Query { .. } => "Query",
            Predicate::RemoteAddr(_) => "RemoteAddr",
            Predicate::All(_) => "All",
            Predicate::Any(_) => "Any",
            Predicate::Not(_) => "Not",
            Predicate::Custom(m) => m.name(),
        }
    }

    pub fn test(&self, context: &RequestContext) -> bool {
        let request = context.request();
        match self {
            Predicate::Path(patterns) => patterns.iter().any(|p| p.matches(&request.path)),
            Predicate::Method(methods) => methods.contains(&request.method),
            Predicate::Header { name, value } => {
                request.headers.get_all(name).iter().any(|v| match value {
                    Some(re) => v.to_str().is_ok_and(|s| re.is_match(s)),
                    None => true,
                })
            }
            Predicate::Host(patterns) => request
                .host()
                .is_some_and(|host| patterns.iter().any(|p| host_matches(p, host))),
            Predicate::Query { name, value } => {
                request
                    .query_param(name)
                    .is_some_and(|v| value.as_ref().is_none_or(|re| re.is_match(v)))
            }
            Predicate::RemoteAddr(allowed) => request
                .remote_addr
                .is_some_and(|addr| allowed.contains(&addr.ip())),
            Predicate::All(all) => all.iter().all(|p| p.test(context)),
            Predicate::Any(any) => any.iter().any(|p| p.test(context)),
            Predicate::Not(inner) => !inner.test(context),
            Predicate::Custom(matcher) => matcher.test(context),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Path(p) => {
                let raw: Vec<&str> = p.iter().map(PathPattern::as_str).collect();
                write!(f, "Path({raw:?})")
            }
            Predicate::Method(m) => write!(f, "Method({m:?})"),
            Predicate::Header { name, value } => {
                write!(f, "Header({name}, {:?})", value.as_ref().map(Regex::as_str))
            }
            Predicate::Host(h) => write!(f, "Host({h:?})"),
            Predicate::Query { name, value } => {
                write!(f, "Query({name}, {:?})", value.as_ref().map(Regex::as_str))
            }
            Predicate::RemoteAddr(a) => write!(f, "RemoteAddr({a:?})"),
            Predicate::All(all) => f.debug_tuple("All").field(all).finish(),
            Predicate::Any(any) => f.debug_tuple("Any").field(any).finish(),
            Predicate::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Predicate::Custom(m) => write!(f, "Custom({})", m.name()),
        }
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();
    pattern_labels.len() == host_labels.len()
        && pattern_labels
            .iter()
            .zip(&host_labels)
            .all(|(p, h)| {
                wildcard(
                    p.to_ascii_lowercase().as_bytes(),
                    h.to_ascii_lowercase().as_bytes(),
                )
            })
}

type PredicateBuilder =
    Arc<dyn Fn(&HashMap<String, String>) -> PredicateResult<Predicate> + Send + Sync>;

/// Builds predicates from `{type, args}` definitions, keyed by case-insensitive type name.
#[derive(Clone)]
pub struct PredicateRegistry {
    builders: HashMap<String, PredicateBuilder>,
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PredicateRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with `Path`, `Method`, `Header`, `Host`, `Query` and `RemoteAddr`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("Path", build_path);
        registry.register("Method", build_method);
        registry.register("Header", build_header);
        registry.register("Host", build_host);
        registry.register("Query", build_query);
        registry.register("RemoteAddr", build_remote_addr);
        registry
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(&HashMap<String, String>) -> PredicateResult<Predicate> + Send + Sync + 'static,
    {
        self.builders
            .insert(name.to_ascii_lowercase(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(&name.to_ascii_lowercase())
    }

    pub fn create(&self, name: &str, args: &HashMap<String, String>) -> PredicateResult<Predicate> {
        let builder = self
            .builders
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| PredicateError::UnknownType(name.to_string()))?;
        let predicate = builder(args)?;
        tracing::debug!("Created predicate {:?}", predicate);
        Ok(predicate)
    }
}

fn arg<'a>(args: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .chain(std::iter::once(&GENKEY_0))
        .find_map(|k| args.get(*k))
        .map(String::as_str)
}

fn comma_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn optional_regex(
    predicate: &'static str,
    args: &HashMap<String, String>,
    key: &'static str,
) -> PredicateResult<Option<Regex>> {
    args.get(key)
        .map(|raw| {
            Regex::new(raw).map_err(|e| PredicateError::InvalidArgument {
                predicate,
                argument: key,
                message: e.to_string(),
            })
        })
        .transpose()
}

fn build_path(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let raw = arg(args, &["pattern", "patterns"]).ok_or(PredicateError::MissingArgument {
        predicate: "Path",
        argument: "pattern",
    })?;
    let patterns: Vec<PathPattern> = comma_list(raw).map(PathPattern::new).collect();
    if patterns.is_empty() {
        return Err(PredicateError::MissingArgument {
            predicate: "Path",
            argument: "pattern",
        });
    }
    Ok(Predicate::Path(patterns))
}

fn build_method(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let raw = arg(args, &["methods", "method"]).ok_or(PredicateError::MissingArgument {
        predicate: "Method",
        argument: "methods",
    })?;
    let methods = comma_list(raw)
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|e| {
                PredicateError::InvalidArgument {
                    predicate: "Method",
                    argument: "methods",
                    message: format!("{m}: {e}"),
                }
            })
        })
        .collect::<PredicateResult<Vec<_>>>()?;
    if methods.is_empty() {
        return Err(PredicateError::MissingArgument {
            predicate: "Method",
            argument: "methods",
        });
    }
    Ok(Predicate::Method(methods))
}

fn build_header(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let raw = arg(args, &["name", "header"]).ok_or(PredicateError::MissingArgument {
        predicate: "Header",
        argument: "name",
    })?;
    let name = HeaderName::from_bytes(raw.to_ascii_lowercase().as_bytes()).map_err(|e| {
        PredicateError::InvalidArgument {
            predicate: "Header",
            argument: "name",
            message: e.to_string(),
        }
    })?;
    Ok(Predicate::Header {
        name,
        value: optional_regex("Header", args, "regexp")?,
    })
}

fn build_host(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let raw = arg(args, &["patterns", "pattern"]).ok_or(PredicateError::MissingArgument {
        predicate: "Host",
        argument: "patterns",
    })?;
    let patterns: Vec<String> = comma_list(raw).map(str::to_ascii_lowercase).collect();
    if patterns.is_empty() {
        return Err(PredicateError::InvalidArgument {
            predicate: "Host",
            argument: "patterns",
            message: "no host pattern given".to_string(),
        });
    }
    Ok(Predicate::Host(patterns))
}

fn build_query(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let name = arg(args, &["param", "name"]).ok_or(PredicateError::MissingArgument {
        predicate: "Query",
        argument: "param",
    })?;
    Ok(Predicate::Query {
        name: name.to_string(),
        value: optional_regex("Query", args, "regexp")?,
    })
}

fn build_remote_addr(args: &HashMap<String, String>) -> PredicateResult<Predicate> {
    let raw = arg(args, &["sources", "source"]).ok_or(PredicateError::MissingArgument {
        predicate: "RemoteAddr",
        argument: "sources",
    })?;
    let addrs = comma_list(raw)
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|e| PredicateError::InvalidArgument {
                    predicate: "RemoteAddr",
                    argument: "sources",
                    message: format!("{ip}: {e}"),
                })
        })
        .collect::<PredicateResult<Vec<_>>>()?;
    if addrs.is_empty() {
        return Err(PredicateError::InvalidArgument {
            predicate: "RemoteAddr",
            argument: "sources",
            message: "no source address given".to_string(),
        });
    }
    Ok(Predicate::RemoteAddr(addrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exchange::GatewayRequest;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ctx(request: GatewayRequest) -> RequestContext {
        RequestContext::new(request)
    }

    #[test]
    fn test_ant_path_patterns() {
        let api = PathPattern::new("/api/**");
        assert!(api.matches("/api"));
        assert!(api.matches("/api/users"));
        assert!(api.matches("/api/admin/list?x=1"));
        assert!(!api.matches("/apix/users"));

        let single = PathPattern::new("/users/*/orders");
        assert!(single.matches("/users/42/orders"));
        assert!(!single.matches("/users/42/7/orders"));

        let var = PathPattern::new("/users/{id}");
        assert!(var.matches("/users/7"));
        assert!(!var.matches("/users"));

        let mid = PathPattern::new("/**/health");
        assert!(mid.matches("/health"));
        assert!(mid.matches("/a/b/health"));

        let chars = PathPattern::new("/file-?.txt");
        assert!(chars.matches("/file-1.txt"));
        assert!(!chars.matches("/file-12.txt"));
    }

    #[test]
    fn test_path_predicate_from_registry() {
        let registry = PredicateRegistry::with_builtins();
        let predicate = registry
            .create("path", &args(&[("_genkey_0", "/api/**")]))
            .unwrap();
        assert!(predicate.test(&ctx(GatewayRequest::get("/api/v1/items"))));
        assert!(!predicate.test(&ctx(GatewayRequest::get("/web"))));
    }

    #[test]
    fn test_method_predicate() {
        let registry = PredicateRegistry::with_builtins();
        let predicate = registry
            .create("Method", &args(&[("methods", "get, post")]))
            .unwrap();
        assert!(predicate.test(&ctx(GatewayRequest::get("/"))));
        assert!(!predicate.test(&ctx(GatewayRequest::new(Method::DELETE, "/"))));
    }

    #[test]
    fn test_header_and_host_predicates() {
        let registry = PredicateRegistry::with_builtins();
        let header = registry
            .create("Header", &args(&[("name", "X-Tenant"), ("regexp", "^acme-\\d+$")]))
            .unwrap();
        let host = registry
            .create("Host", &args(&[("patterns", "*.example.com")]))
            .unwrap();

        let request = GatewayRequest::get("/")
            .with_header("x-tenant", "acme-7")
            .with_header("host", "api.example.com:8080");
        let c = ctx(request);
        assert!(header.test(&c));
        assert!(host.test(&c));

        let other = ctx(GatewayRequest::get("/").with_header("host", "example.org"));
        assert!(!header.test(&other));
        assert!(!host.test(&other));
    }

    #[test]
    fn test_query_and_remote_addr_predicates() {
        let registry = PredicateRegistry::with_builtins();
        let query = registry.create("Query", &args(&[("param", "debug")])).unwrap();
        let remote = registry
            .create("RemoteAddr", &args(&[("sources", "10.0.0.1, 10.0.0.2")]))
            .unwrap();

        let request = GatewayRequest::get("/x?debug=1")
            .with_remote_addr("10.0.0.2:5555".parse().unwrap());
        let c = ctx(request);
        assert!(query.test(&c));
        assert!(remote.test(&c));
        assert!(!query.test(&ctx(GatewayRequest::get("/x"))));
    }

    #[test]
    fn test_combinators() {
        let predicate = Predicate::path("/api/**")
            .and(Predicate::Method(vec![Method::GET]))
            .or(Predicate::path("/public/**"));
        assert!(predicate.test(&ctx(GatewayRequest::get("/api/a"))));
        assert!(predicate.test(&ctx(GatewayRequest::new(Method::POST, "/public/x"))));
        assert!(!predicate.test(&ctx(GatewayRequest::new(Method::POST, "/api/a"))));

        let negated = Predicate::path("/internal/**").negate();
        assert!(!negated.test(&ctx(GatewayRequest::get("/internal/x"))));
    }

    #[test]
    fn test_registry_errors() {
        let registry = PredicateRegistry::with_builtins();
        assert_eq!(
            registry.create("Cookie", &HashMap::new()).unwrap_err(),
            PredicateError::UnknownType("Cookie".to_string())
        );
        assert!(matches!(
            registry.create("Path", &HashMap::new()),
            Err(PredicateError::MissingArgument { .. })
        ));
        assert!(matches!(
            registry.create("Header", &args(&[("name", "x"), ("regexp", "(")])),
            Err(PredicateError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_empty_lists_are_rejected() {
        let registry = PredicateRegistry::with_builtins();
        assert!(matches!(
            registry.create("Host", &args(&[("patterns", " , ")])),
            Err(PredicateError::InvalidArgument {
                predicate: "Host",
                ..
            })
        ));
        assert!(matches!(
            registry.create("RemoteAddr", &args(&[("sources", "")])),
            Err(PredicateError::InvalidArgument {
                predicate: "RemoteAddr",
                ..
            })
        ));
        assert!(matches!(
            registry.create("Method", &args(&[("methods", ",")])),
            Err(PredicateError::MissingArgument { .. })
        ));
        assert!(registry.create("Host", &args(&[("patterns", "api.example.com")])).is_ok());
    }
}
