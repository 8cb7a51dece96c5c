//! Lightweight metrics helpers for Meridian.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is bundled; the embedding
//! application installs whichever recorder it wants. Descriptions are registered the first
//! time the gauge store is touched.
//!
//! Provided metrics:
//! * `meridian_requests_total` (counter, labels: route, status)
//! * `meridian_request_duration_seconds` (histogram, label: route)
//! * `meridian_route_match_duration_seconds` (histogram)
//! * `meridian_endpoint_select_duration_seconds` (histogram, label: route)
//! * `meridian_route_not_found_total` (counter)
//! * `meridian_pool_connections_created_total` / `meridian_pool_connections_failed_total`
//!   (counters, label: pool)
//! * `meridian_pool_idle_connections` / `meridian_pool_success_rate` (gauges, label: pool)
//! * `meridian_discovery_refresh_total` (counter, labels: service, outcome)
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::context::PerformanceSummary;

pub const MERIDIAN_REQUESTS_TOTAL: &str = "meridian_requests_total";
pub const MERIDIAN_REQUEST_DURATION_SECONDS: &str = "meridian_request_duration_seconds";
pub const MERIDIAN_ROUTE_MATCH_DURATION_SECONDS: &str = "meridian_route_match_duration_seconds";
pub const MERIDIAN_ENDPOINT_SELECT_DURATION_SECONDS: &str =
    "meridian_endpoint_select_duration_seconds";
pub const MERIDIAN_ROUTE_NOT_FOUND_TOTAL: &str = "meridian_route_not_found_total";
pub const MERIDIAN_POOL_CONNECTIONS_CREATED_TOTAL: &str = "meridian_pool_connections_created_total";
pub const MERIDIAN_POOL_CONNECTIONS_FAILED_TOTAL: &str = "meridian_pool_connections_failed_total";
pub const MERIDIAN_POOL_IDLE_CONNECTIONS: &str = "meridian_pool_idle_connections";
pub const MERIDIAN_POOL_SUCCESS_RATE: &str = "meridian_pool_success_rate";
pub const MERIDIAN_DISCOVERY_REFRESH_TOTAL: &str = "meridian_discovery_refresh_total";

#[derive(Debug, Clone, Copy, Default)]
struct PoolGauges {
    idle: f64,
    success_rate: f64,
}

/// Last reported gauge values per pool, kept for the admin snapshot
static POOL_GAUGES: Lazy<Mutex<HashMap<String, PoolGauges>>> = Lazy::new(|| {
    describe_counter!(
        MERIDIAN_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests completed by the gateway."
    );
    describe_histogram!(
        MERIDIAN_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end latency of requests processed by the gateway."
    );
    describe_histogram!(
        MERIDIAN_ROUTE_MATCH_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent matching a request against the route table."
    );
    describe_histogram!(
        MERIDIAN_ENDPOINT_SELECT_DURATION_SECONDS,
        Unit::Seconds,
        "Time between route match and backend endpoint selection."
    );
    describe_counter!(
        MERIDIAN_ROUTE_NOT_FOUND_TOTAL,
        Unit::Count,
        "Requests that matched no route."
    );
    describe_counter!(
        MERIDIAN_POOL_CONNECTIONS_CREATED_TOTAL,
        Unit::Count,
        "Outbound connections opened by the pools."
    );
    describe_counter!(
        MERIDIAN_POOL_CONNECTIONS_FAILED_TOTAL,
        Unit::Count,
        "Outbound connection attempts that failed."
    );
    describe_gauge!(
        MERIDIAN_POOL_IDLE_CONNECTIONS,
        "Idle connections currently held by a pool."
    );
    describe_gauge!(
        MERIDIAN_POOL_SUCCESS_RATE,
        "Connection creation success rate of a pool (0..1)."
    );
    describe_counter!(
        MERIDIAN_DISCOVERY_REFRESH_TOTAL,
        Unit::Count,
        "Discovery cache refreshes by outcome."
    );

    Mutex::new(HashMap::new())
});

/// Record everything a completed request contributes.
pub fn record_request_completion(route_id: &str, summary: &PerformanceSummary) {
    histogram!(MERIDIAN_REQUEST_DURATION_SECONDS, "route" => route_id.to_string())
        .record(summary.total.as_secs_f64());
    if let Some(selection) = summary.endpoint_selection {
        histogram!(
            MERIDIAN_ENDPOINT_SELECT_DURATION_SECONDS,
            "route" => route_id.to_string()
        )
        .record(selection.as_secs_f64());
    }
}

/// Increment the total request counter.
pub fn increment_request_total(route_id: &str, status: u16) {
    counter!(
        MERIDIAN_REQUESTS_TOTAL,
        "route" => route_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_route_match_duration(duration: Duration) {
    histogram!(MERIDIAN_ROUTE_MATCH_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn increment_route_not_found() {
    counter!(MERIDIAN_ROUTE_NOT_FOUND_TOTAL).increment(1);
}

pub fn increment_pool_connections_created(pool: &str) {
    counter!(MERIDIAN_POOL_CONNECTIONS_CREATED_TOTAL, "pool" => pool.to_string()).increment(1);
}

pub fn increment_pool_connections_failed(pool: &str) {
    counter!(MERIDIAN_POOL_CONNECTIONS_FAILED_TOTAL, "pool" => pool.to_string()).increment(1);
}

/// Set (and remember) the gauges of one pool.
pub fn set_pool_gauges(pool: &str, idle: usize, success_rate: f64) {
    match POOL_GAUGES.lock() {
        Ok(mut gauges) => {
            gauges.insert(
                pool.to_string(),
                PoolGauges {
                    idle: idle as f64,
                    success_rate,
                },
            );
        }
        Err(_) => {
            tracing::error!("Failed to acquire lock for pool gauges");
            return;
        }
    }

    gauge!(MERIDIAN_POOL_IDLE_CONNECTIONS, "pool" => pool.to_string()).set(idle as f64);
    gauge!(MERIDIAN_POOL_SUCCESS_RATE, "pool" => pool.to_string()).set(success_rate);
}

/// Forget a removed pool.
pub fn remove_pool_gauges(pool: &str) {
    if let Ok(mut gauges) = POOL_GAUGES.lock() {
        gauges.remove(pool);
    }
    gauge!(MERIDIAN_POOL_IDLE_CONNECTIONS, "pool" => pool.to_string()).set(0.0);
}

pub fn increment_discovery_refresh(service: &str, outcome: &'static str) {
    counter!(
        MERIDIAN_DISCOVERY_REFRESH_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// RAII helper measuring route matching.
pub struct RouteMatchTimer {
    start: Instant,
}

impl RouteMatchTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RouteMatchTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RouteMatchTimer {
    fn drop(&mut self) {
        record_route_match_duration(self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&POOL_GAUGES);
    tracing::info!("Meridian metrics descriptions registered");
}

/// Snapshot of pool gauges for ad-hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = POOL_GAUGES.lock() {
        for (pool, values) in gauges.iter() {
            metrics.insert(format!("pool_idle_connections_{pool}"), values.idle);
            metrics.insert(format!("pool_success_rate_{pool}"), values.success_rate);
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_gauges_snapshot() {
        set_pool_gauges("HTTP@http://gauge-test:80", 3, 0.5);

        let metrics = get_current_metrics();
        assert_eq!(
            metrics.get("pool_idle_connections_HTTP@http://gauge-test:80"),
            Some(&3.0)
        );
        assert_eq!(
            metrics.get("pool_success_rate_HTTP@http://gauge-test:80"),
            Some(&0.5)
        );

        remove_pool_gauges("HTTP@http://gauge-test:80");
        assert!(!get_current_metrics().contains_key("pool_idle_connections_HTTP@http://gauge-test:80"));
    }

    #[test]
    fn test_route_match_timer() {
        let timer = RouteMatchTimer::new();
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_record_completion_without_selection() {
        record_request_completion(
            "none",
            &PerformanceSummary {
                total: Duration::from_millis(3),
                route_matching: None,
                endpoint_selection: None,
            },
        );
    }
}
