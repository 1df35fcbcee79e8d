//! Prometheus Metrics Module
//!
//! Counters and histograms for the query path, the cache, the security
//! gates, upstream forwarding and zone transfers. Everything registers with
//! the default prometheus registry, `export_metrics` renders it in the text
//! exposition format for whatever surface wants to publish it.

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// DNS query counters by protocol and query type
    pub static ref DNS_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "warden_dns_queries_total",
        "Total number of DNS queries received",
        &["protocol", "query_type"]
    ).unwrap();

    /// DNS response counters by response code
    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "warden_dns_responses_total",
        "Total number of DNS responses sent",
        &["response_code", "protocol"]
    ).unwrap();

    /// DNS query duration histogram
    pub static ref DNS_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "warden_dns_query_duration_seconds",
        "DNS query processing duration in seconds",
        &["protocol", "source"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Cache hit/miss counters
    pub static ref DNS_CACHE_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "warden_dns_cache_operations_total",
        "DNS cache operations (hit/miss/store/eviction)",
        &["operation", "record_type"]
    ).unwrap();

    /// Cache size gauge
    pub static ref DNS_CACHE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "warden_dns_cache_size",
        "Current number of entries in DNS cache",
        &["cache_type"]
    ).unwrap();

    /// Rate limiting counters
    pub static ref RATE_LIMIT_EVENTS: IntCounterVec = register_int_counter_vec!(
        "warden_rate_limit_events_total",
        "Rate limiting events",
        &["action", "limiter"]
    ).unwrap();

    /// Security threat counters
    pub static ref SECURITY_EVENTS: IntCounterVec = register_int_counter_vec!(
        "warden_security_events_total",
        "Security events detected",
        &["event_type", "severity", "action"]
    ).unwrap();

    /// Zone statistics
    pub static ref ZONE_STATS: IntGaugeVec = register_int_gauge_vec!(
        "warden_zones",
        "Zone statistics",
        &["metric"]
    ).unwrap();

    /// Upstream DNS server metrics
    pub static ref UPSTREAM_QUERIES: IntCounterVec = register_int_counter_vec!(
        "warden_upstream_queries_total",
        "Queries sent to upstream DNS servers",
        &["upstream", "status"]
    ).unwrap();

    /// Upstream response times
    pub static ref UPSTREAM_DURATION: HistogramVec = register_histogram_vec!(
        "warden_upstream_duration_seconds",
        "Upstream DNS query duration",
        &["upstream"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Zone transfers served
    pub static ref ZONE_TRANSFERS: IntCounterVec = register_int_counter_vec!(
        "warden_zone_transfers_total",
        "Zone transfers by type and outcome",
        &["transfer_type", "status"]
    ).unwrap();
}

/// Renders every registered metric in the prometheus text format.
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

/// Records upstream latency and outcome for one exchange.
pub fn record_upstream(upstream: &str, status: &str, duration: Duration) {
    UPSTREAM_QUERIES.with_label_values(&[upstream, status]).inc();
    UPSTREAM_DURATION
        .with_label_values(&[upstream])
        .observe(duration.as_secs_f64());
}

/// Query timer for measuring DNS query duration
pub struct QueryTimer {
    start: Instant,
    protocol: &'static str,
}

impl QueryTimer {
    pub fn start(protocol: &'static str) -> Self {
        Self {
            start: Instant::now(),
            protocol,
        }
    }

    /// Finish the timer, labelled with where the answer came from
    pub fn finish(self, source: &str) {
        DNS_QUERY_DURATION
            .with_label_values(&[self.protocol, source])
            .observe(self.start.elapsed().as_secs_f64());
    }
}
