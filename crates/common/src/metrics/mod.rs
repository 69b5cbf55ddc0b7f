//! Metrics helpers
//!
//! Thin wrappers over the `metrics` facade so that names and labels stay
//! consistent across crates. Nothing is recorded until a recorder (the
//! Prometheus exporter in the gateway) is installed.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::time::Instant;

/// Prefix for every metric name
pub const METRICS_PREFIX: &str = "kgrag";

/// Request latency buckets in seconds
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00, 30.00,
];

/// Embedding provider latency buckets in seconds
pub const EMBEDDING_BUCKETS: &[f64] =
    &[0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000, 10.00, 30.00];

fn name(suffix: &str) -> String {
    format!("{}_{}", METRICS_PREFIX, suffix)
}

pub fn register_metrics() {
    describe_counter!(name("requests_total"), Unit::Count, "Total number of HTTP requests");
    describe_histogram!(
        name("request_duration_seconds"),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(name("search_queries_total"), Unit::Count, "Total search queries");
    describe_histogram!(
        name("search_duration_seconds"),
        Unit::Seconds,
        "Hybrid search latency in seconds"
    );
    describe_gauge!(
        name("search_results_count"),
        Unit::Count,
        "Results returned by the last search"
    );
    describe_counter!(
        name("search_timeouts_total"),
        Unit::Count,
        "Search rounds that hit their timeout"
    );

    describe_counter!(
        name("embedding_requests_total"),
        Unit::Count,
        "Total embedding provider requests"
    );
    describe_histogram!(
        name("embedding_duration_seconds"),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );
    describe_counter!(name("embedding_errors_total"), Unit::Count, "Total embedding errors");

    describe_counter!(name("cache_hits_total"), Unit::Count, "Result cache hits per tier");
    describe_counter!(name("cache_misses_total"), Unit::Count, "Result cache misses");

    describe_counter!(
        name("sync_operations_total"),
        Unit::Count,
        "Vector index sync outcomes per kind and status"
    );
    describe_counter!(
        name("inconsistencies_found_total"),
        Unit::Count,
        "Inconsistencies detected by the auditor"
    );
    describe_counter!(
        name("inconsistencies_repaired_total"),
        Unit::Count,
        "Inconsistencies repaired"
    );

    tracing::info!("Metrics registered");
}

/// Times one HTTP request.
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        counter!(
            name("requests_total"),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            name("request_duration_seconds"),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_search(duration_secs: f64, intent: &str, result_count: usize) {
    counter!(name("search_queries_total"), "intent" => intent.to_string()).increment(1);
    histogram!(name("search_duration_seconds"), "intent" => intent.to_string())
        .record(duration_secs);
    gauge!(name("search_results_count"), "intent" => intent.to_string()).set(result_count as f64);
}

/// `round` is "primary" or "recovery".
pub fn record_search_timeout(round: &'static str) {
    counter!(name("search_timeouts_total"), "round" => round).increment(1);
}

pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        name("embedding_requests_total"),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(name("embedding_duration_seconds"), "model" => model.to_string())
            .record(duration_secs);
    } else {
        counter!(name("embedding_errors_total"), "model" => model.to_string()).increment(1);
    }
}

/// `tier` is "memory" or "persistent"; ignored on a miss.
pub fn record_cache(hit: bool, tier: &'static str) {
    if hit {
        counter!(name("cache_hits_total"), "tier" => tier).increment(1);
    } else {
        counter!(name("cache_misses_total")).increment(1);
    }
}

pub fn record_sync(kind: &'static str, status: &'static str) {
    counter!(name("sync_operations_total"), "kind" => kind, "status" => status).increment(1);
}

pub fn record_consistency(found: usize, repaired: usize) {
    counter!(name("inconsistencies_found_total")).increment(found as u64);
    counter!(name("inconsistencies_repaired_total")).increment(repaired as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, EMBEDDING_BUCKETS] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_helpers_without_recorder() {
        RequestMetrics::start("POST", "/v1/search").finish(200);
        record_search(0.12, "general_search", 3);
        record_cache(true, "memory");
        record_sync("entity", "synced");
        record_consistency(2, 1);
    }
}
