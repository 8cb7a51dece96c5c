//! Load-balancing strategies.
//!
//! A [`LoadBalancer`] is built once per route and owns whatever per-address state its
//! algorithm needs. Every strategy tolerates the candidate list changing between calls:
//! state for addresses that disappear is pruned the next time the strategy sees the list.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{address::EndpointAddress, context::RequestContext};

/// Errors raised while selecting a backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadBalanceError {
    /// Selection was attempted over an empty candidate list
    #[error("No candidate addresses to select from")]
    EmptyTargetSet,

    /// The configured strategy name is not recognized
    #[error("Unknown load balance strategy: {0}")]
    UnknownStrategy(String),

    /// A strategy argument is unknown or has an unusable value
    #[error("Invalid argument '{name}' for {strategy}: {message}")]
    InvalidArgument {
        strategy: StrategyKind,
        name: String,
        message: String,
    },
}

/// Result type for load-balancing operations
pub type LoadBalanceResult<T> = Result<T, LoadBalanceError>;

/// Names of the stock algorithms, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Random,
    WeightedRoundRobin,
    LeastConnections,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "ROUND_ROBIN",
            StrategyKind::Random => "RANDOM",
            StrategyKind::WeightedRoundRobin => "WEIGHTED_ROUND_ROBIN",
            StrategyKind::LeastConnections => "LEAST_CONNECTIONS",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = LoadBalanceError;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "ROUND_ROBIN" => Ok(StrategyKind::RoundRobin),
            "RANDOM" => Ok(StrategyKind::Random),
            "WEIGHTED_ROUND_ROBIN" => Ok(StrategyKind::WeightedRoundRobin),
            "LEAST_CONNECTIONS" => Ok(StrategyKind::LeastConnections),
            _ => Err(LoadBalanceError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round-robin cursor.
#[derive(Debug, Default)]
pub struct RoundRobinState {
    counter: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct WeightedNode {
    weight: i64,
    current: i64,
}

/// Argument of `WEIGHTED_ROUND_ROBIN` naming the weight of addresses without one.
pub const DEFAULT_WEIGHT_ARG: &str = "default_weight";

/// Smooth weighted round-robin state, keyed by normalized address URI.
#[derive(Debug)]
pub struct WeightedRoundRobinState {
    nodes: Mutex<HashMap<String, WeightedNode>>,
    default_weight: u32,
}

impl Default for WeightedRoundRobinState {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            default_weight: 1,
        }
    }
}

/// Outstanding-connection counters, keyed by normalized address URI.
///
/// Choosing the least loaded address and counting the new request happen under one lock,
/// so concurrent selections never see the same stale minimum.
#[derive(Debug, Default)]
pub struct LeastConnectionsState {
    counts: Mutex<HashMap<String, i64>>,
}

/// A load-balancing strategy instance with its own state.
#[derive(Debug)]
pub enum LoadBalancer {
    RoundRobin(RoundRobinState),
    Random,
    WeightedRoundRobin(WeightedRoundRobinState),
    LeastConnections(LeastConnectionsState),
}

impl Default for LoadBalancer {
    fn default() -> Self {
        LoadBalancer::new(StrategyKind::default())
    }
}

impl LoadBalancer {
    /// Create a fresh strategy instance.
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => LoadBalancer::RoundRobin(RoundRobinState::default()),
            StrategyKind::Random => LoadBalancer::Random,
            StrategyKind::WeightedRoundRobin => {
                LoadBalancer::WeightedRoundRobin(WeightedRoundRobinState::default())
            }
            StrategyKind::LeastConnections => {
                LoadBalancer::LeastConnections(LeastConnectionsState::default())
            }
        }
    }

    /// Create a strategy from its configuration name.
    pub fn from_name(name: &str) -> LoadBalanceResult<Self> {
        name.parse::<StrategyKind>().map(Self::new)
    }

    /// Create a strategy from its configuration name and arguments.
    ///
    /// `WEIGHTED_ROUND_ROBIN` accepts `default_weight`, a positive integer used for addresses
    /// that carry no weight. The other strategies take no arguments.
    pub fn from_definition(name: &str, args: &HashMap<String, String>) -> LoadBalanceResult<Self> {
        let kind = name.parse::<StrategyKind>()?;
        let mut args: Vec<_> = args.iter().collect();
        args.sort();

        let mut default_weight = None;
        for (arg, value) in args {
            let invalid = |message: String| LoadBalanceError::InvalidArgument {
                strategy: kind,
                name: arg.clone(),
                message,
            };
            match (kind, arg.as_str()) {
                (StrategyKind::WeightedRoundRobin, DEFAULT_WEIGHT_ARG) => {
                    let weight = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| invalid(format!("'{value}' is not a positive integer")))?;
                    default_weight = Some(weight);
                }
                _ => return Err(invalid("unknown argument".to_string())),
            }
        }

        Ok(match default_weight {
            Some(default_weight) => LoadBalancer::WeightedRoundRobin(WeightedRoundRobinState {
                default_weight,
                ..WeightedRoundRobinState::default()
            }),
            None => Self::new(kind),
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            LoadBalancer::RoundRobin(_) => StrategyKind::RoundRobin,
            LoadBalancer::Random => StrategyKind::Random,
            LoadBalancer::WeightedRoundRobin(_) => StrategyKind::WeightedRoundRobin,
            LoadBalancer::LeastConnections(_) => StrategyKind::LeastConnections,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn description(&self) -> &'static str {
        match self {
            LoadBalancer::RoundRobin(_) => "Cycles through candidates in list order",
            LoadBalancer::Random => "Picks a uniformly random candidate per request",
            LoadBalancer::WeightedRoundRobin(_) => {
                "Smooth weighted round-robin proportional to address weight"
            }
            LoadBalancer::LeastConnections(_) => {
                "Picks the candidate with the fewest outstanding connections"
            }
        }
    }

    pub fn is_stateful(&self) -> bool {
        !matches!(self, LoadBalancer::Random)
    }

    /// Select one address from a non-empty candidate list.
    pub fn select(
        &self,
        addresses: &[EndpointAddress],
        _context: &RequestContext,
    ) -> LoadBalanceResult<EndpointAddress> {
        if addresses.is_empty() {
            return Err(LoadBalanceError::EmptyTargetSet);
        }
        if addresses.len() == 1 {
            if let LoadBalancer::LeastConnections(state) = self {
                return Ok(state.select_and_acquire(addresses));
            }
            return Ok(addresses[0].clone());
        }

        let selected = match self {
            LoadBalancer::RoundRobin(state) => {
                let count = state.counter.fetch_add(1, Ordering::Relaxed);
                addresses[count % addresses.len()].clone()
            }
            LoadBalancer::Random => {
                let index = rand::rng().random_range(0..addresses.len());
                addresses[index].clone()
            }
            LoadBalancer::WeightedRoundRobin(state) => state.select(addresses),
            LoadBalancer::LeastConnections(state) => state.select_and_acquire(addresses),
        };

        tracing::trace!("{} selected {}", self.name(), selected);
        Ok(selected)
    }

    /// Signal that a request to `address` finished. Only least-connections keeps
    /// per-request counters; the other strategies ignore it.
    pub fn release(&self, address: &EndpointAddress) {
        if let LoadBalancer::LeastConnections(state) = self {
            state.release(address);
        }
    }

    /// Drop all internal state.
    pub fn reset(&self) {
        match self {
            LoadBalancer::RoundRobin(state) => state.counter.store(0, Ordering::Relaxed),
            LoadBalancer::Random => {}
            LoadBalancer::WeightedRoundRobin(state) => state
                .nodes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear(),
            LoadBalancer::LeastConnections(state) => state.counts().clear(),
        }
    }

    /// Outstanding connection counts by address URI (least-connections only).
    pub fn connection_counts(&self) -> HashMap<String, i64> {
        match self {
            LoadBalancer::LeastConnections(state) => state.counts().clone(),
            _ => HashMap::new(),
        }
    }
}

impl WeightedRoundRobinState {
    fn select(&self, addresses: &[EndpointAddress]) -> EndpointAddress {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);

        let live: HashSet<&str> = addresses.iter().map(|a| a.uri()).collect();
        nodes.retain(|uri, _| live.contains(uri.as_str()));

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (index, address) in addresses.iter().enumerate() {
            let weight = i64::from(
                address
                    .declared_weight()
                    .unwrap_or(self.default_weight)
                    .max(1),
            );
            let node = nodes
                .entry(address.uri().to_string())
                .or_insert(WeightedNode { weight, current: 0 });
            node.weight = weight;
            node.current += weight;
            total += weight;

            if best.is_none_or(|(_, current)| node.current > current) {
                best = Some((index, node.current));
            }
        }

        let index = best.map_or(0, |(i, _)| i);
        let winner = &addresses[index];
        if let Some(node) = nodes.get_mut(winner.uri()) {
            node.current -= total;
        }
        winner.clone()
    }
}

impl LeastConnectionsState {
    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the address with the fewest outstanding requests (ties go to list order) and
    /// count one more request against it.
    fn select_and_acquire(&self, addresses: &[EndpointAddress]) -> EndpointAddress {
        let mut counts = self.counts();
        let live: HashSet<&str> = addresses.iter().map(|a| a.uri()).collect();
        counts.retain(|uri, _| live.contains(uri.as_str()));

        let count = |address: &EndpointAddress| counts.get(address.uri()).copied().unwrap_or(0);
        let mut best = &addresses[0];
        let mut best_count = count(best);
        for address in &addresses[1..] {
            let current = count(address);
            if current < best_count {
                best = address;
                best_count = current;
            }
        }

        *counts.entry(best.uri().to_string()).or_insert(0) += 1;
        best.clone()
    }

    fn release(&self, address: &EndpointAddress) {
        let mut counts = self.counts();
        if let Some(count) = counts.get_mut(address.uri()) {
            *count -= 1;
            if *count <= 0 {
                counts.remove(address.uri());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exchange::GatewayRequest;

    fn addr(uri: &str) -> EndpointAddress {
        EndpointAddress::parse(uri).unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::new(GatewayRequest::get("/"))
    }

    #[test]
    fn test_round_robin_strategy() {
        let strategy = LoadBalancer::new(StrategyKind::RoundRobin);
        let targets = vec![addr("http://s1:80"), addr("http://s2:80"), addr("http://s3:80")];
        let ctx = ctx();

        let picks: Vec<_> = (0..4)
            .map(|_| strategy.select(&targets, &ctx).unwrap())
            .collect();
        assert_eq!(picks[0], targets[0]);
        assert_eq!(picks[1], targets[1]);
        assert_eq!(picks[2], targets[2]);
        assert_eq!(picks[3], targets[0]); // Wraps around
    }

    #[test]
    fn test_round_robin_is_balanced() {
        let strategy = LoadBalancer::new(StrategyKind::RoundRobin);
        let targets = vec![addr("http://s1:80"), addr("http://s2:80"), addr("http://s3:80")];
        let ctx = ctx();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            let picked = strategy.select(&targets, &ctx).unwrap();
            *counts.entry(picked.uri().to_string()).or_default() += 1;
        }
        for count in counts.values() {
            assert!(*count == 33 || *count == 34, "unbalanced count {count}");
        }
    }

    #[test]
    fn test_empty_targets() {
        let ctx = ctx();
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::Random,
            StrategyKind::WeightedRoundRobin,
            StrategyKind::LeastConnections,
        ] {
            let strategy = LoadBalancer::new(kind);
            assert_eq!(
                strategy.select(&[], &ctx),
                Err(LoadBalanceError::EmptyTargetSet)
            );
        }
    }

    #[test]
    fn test_random_strategy() {
        let strategy = LoadBalancer::new(StrategyKind::Random);
        let targets = vec![addr("http://s1:80"), addr("http://s2:80")];
        let selected = strategy.select(&targets, &ctx()).unwrap();
        assert!(targets.contains(&selected));
        assert!(!strategy.is_stateful());
    }

    #[test]
    fn test_smooth_weighted_distribution() {
        let strategy = LoadBalancer::new(StrategyKind::WeightedRoundRobin);
        let a = addr("http://a:80").with_weight(3);
        let b = addr("http://b:80").with_weight(1);
        let targets = vec![a.clone(), b.clone()];
        let ctx = ctx();

        let picks: Vec<_> = (0..8)
            .map(|_| strategy.select(&targets, &ctx).unwrap())
            .collect();
        assert_eq!(picks.iter().filter(|p| **p == a).count(), 6);
        assert_eq!(picks.iter().filter(|p| **p == b).count(), 2);
        // Smooth: the light node is never picked twice in a row
        assert!(picks.windows(2).all(|w| !(w[0] == b && w[1] == b)));
    }

    #[test]
    fn test_weighted_prunes_removed_addresses() {
        let strategy = LoadBalancer::new(StrategyKind::WeightedRoundRobin);
        let ctx = ctx();
        let full = vec![
            addr("http://a:80").with_weight(2),
            addr("http://b:80").with_weight(2),
        ];
        strategy.select(&full, &ctx).unwrap();

        let shrunk = vec![addr("http://b:80").with_weight(2), addr("http://c:80")];
        for _ in 0..5 {
            let picked = strategy.select(&shrunk, &ctx).unwrap();
            assert!(shrunk.contains(&picked));
        }
        if let LoadBalancer::WeightedRoundRobin(state) = &strategy {
            let nodes = state.nodes.lock().unwrap();
            assert!(!nodes.contains_key("http://a:80"));
            assert_eq!(nodes.len(), 2);
        }
    }

    #[test]
    fn test_least_connections_prefers_idle_address() {
        let strategy = LoadBalancer::new(StrategyKind::LeastConnections);
        let a = addr("http://a:80");
        let b = addr("http://b:80");
        let targets = vec![a.clone(), b.clone()];
        let ctx = ctx();

        // Tie goes to list order
        assert_eq!(strategy.select(&targets, &ctx).unwrap(), a);
        // A now has one outstanding connection
        assert_eq!(strategy.select(&targets, &ctx).unwrap(), b);

        strategy.release(&a);
        assert_eq!(strategy.connection_counts().get("http://a:80"), None);
        assert_eq!(strategy.select(&targets, &ctx).unwrap(), a);
    }

    #[test]
    fn test_least_connections_drops_vanished_addresses() {
        let strategy = LoadBalancer::new(StrategyKind::LeastConnections);
        let ctx = ctx();
        let a = addr("http://a:80");
        let b = addr("http://b:80");
        let c = addr("http://c:80");

        strategy.select(&[a.clone(), b.clone()], &ctx).unwrap();
        strategy.select(&[b.clone(), c.clone()], &ctx).unwrap();

        let counts = strategy.connection_counts();
        assert!(!counts.contains_key(a.uri()));
        // Releasing an address that is no longer tracked is harmless
        strategy.release(&a);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            "weighted-round-robin".parse::<StrategyKind>().unwrap(),
            StrategyKind::WeightedRoundRobin
        );
        assert_eq!(
            "least_connections".parse::<StrategyKind>().unwrap(),
            StrategyKind::LeastConnections
        );
        assert!(matches!(
            LoadBalancer::from_name("fastest"),
            Err(LoadBalanceError::UnknownStrategy(_))
        ));
        assert_eq!(LoadBalancer::default().kind(), StrategyKind::RoundRobin);
    }

    #[test]
    fn test_least_connections_concurrent_selection_stays_balanced() {
        let strategy = std::sync::Arc::new(LoadBalancer::new(StrategyKind::LeastConnections));
        let targets = vec![addr("http://a:80"), addr("http://b:80")];

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let strategy = strategy.clone();
                let targets = targets.clone();
                std::thread::spawn(move || {
                    let ctx = ctx();
                    for _ in 0..100 {
                        strategy.select(&targets, &ctx).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let counts = strategy.connection_counts();
        assert_eq!(counts["http://a:80"], 400);
        assert_eq!(counts["http://b:80"], 400);
    }

    #[test]
    fn test_single_address_is_counted() {
        let strategy = LoadBalancer::new(StrategyKind::LeastConnections);
        let only = addr("http://a:80");
        strategy.select(&[only.clone()], &ctx()).unwrap();
        assert_eq!(strategy.connection_counts()["http://a:80"], 1);
        strategy.release(&only);
        assert!(strategy.connection_counts().is_empty());
    }

    #[test]
    fn test_default_weight_argument() {
        let args = HashMap::from([(DEFAULT_WEIGHT_ARG.to_string(), "3".to_string())]);
        let strategy = LoadBalancer::from_definition("WEIGHTED_ROUND_ROBIN", &args).unwrap();
        // a has no weight and takes the default, b is explicit
        let a = addr("http://a:80");
        let b = addr("http://b:80").with_weight(1);
        let targets = vec![a.clone(), b.clone()];
        let ctx = ctx();

        let picks: Vec<_> = (0..8)
            .map(|_| strategy.select(&targets, &ctx).unwrap())
            .collect();
        assert_eq!(picks.iter().filter(|p| **p == a).count(), 6);
        assert_eq!(picks.iter().filter(|p| **p == b).count(), 2);
    }

    #[test]
    fn test_strategy_arguments_are_checked() {
        let no_args = HashMap::new();
        assert_eq!(
            LoadBalancer::from_definition("least-connections", &no_args)
                .unwrap()
                .kind(),
            StrategyKind::LeastConnections
        );

        let zero = HashMap::from([(DEFAULT_WEIGHT_ARG.to_string(), "0".to_string())]);
        assert!(matches!(
            LoadBalancer::from_definition("WEIGHTED_ROUND_ROBIN", &zero),
            Err(LoadBalanceError::InvalidArgument { .. })
        ));

        let misplaced = HashMap::from([(DEFAULT_WEIGHT_ARG.to_string(), "2".to_string())]);
        let err = LoadBalancer::from_definition("ROUND_ROBIN", &misplaced).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid argument 'default_weight' for ROUND_ROBIN: unknown argument"
        );

        assert!(matches!(
            LoadBalancer::from_definition("fastest", &no_args),
            Err(LoadBalanceError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_reset_clears_state() {
        let strategy = LoadBalancer::new(StrategyKind::LeastConnections);
        let targets = vec![addr("http://a:80"), addr("http://b:80")];
        strategy.select(&targets, &ctx()).unwrap();
        assert!(!strategy.connection_counts().is_empty());
        strategy.reset();
        assert!(strategy.connection_counts().is_empty());
    }
}
