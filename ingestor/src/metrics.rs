use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REPORTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_reports_total",
            "Telemetry reports received, by transport"
        ),
        &["transport"]
    )
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_rate_limited_total",
        "Reports rejected by admission control"
    ))
    .unwrap();
    pub static ref INVALID_REPORTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_reports_total",
        "Reports rejected for malformed payloads or missing fields"
    ))
    .unwrap();
    pub static ref DEVICE_NOT_FOUND_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_device_not_found_total",
        "Reports for identifiers unknown to storage"
    ))
    .unwrap();
    pub static ref POLICY_VIOLATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_policy_violations_total",
        "Accepted reports that were audited for staleness or missing coordinates"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_measurements_total",
        "Measurements persisted"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Mandatory storage operations that failed or timed out"
    ))
    .unwrap();
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_cache_lookups_total",
            "Device cache lookups, by result"
        ),
        &["result"]
    )
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to run one report through the pipeline"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(REPORTS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(RATE_LIMITED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_REPORTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEVICE_NOT_FOUND_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POLICY_VIOLATIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MEASUREMENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CACHE_LOOKUPS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
