use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

const REQUEST_LABELS: &[&str] = &[
    "origin",
    "origin_type",
    "method",
    "cache_status",
    "http_status",
    "path",
];

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("chronocache_requests_total", "Count of requests handled"),
            REQUEST_LABELS,
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn request_duration() -> &'static HistogramVec {
    static METRIC: OnceLock<HistogramVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "chronocache_request_duration_seconds",
                "Time taken to serve a request",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0]),
            REQUEST_LABELS,
        )
        .unwrap();
        registry().register(Box::new(histogram.clone())).unwrap();
        histogram
    })
}

fn origin_fetches_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "chronocache_origin_fetches_total",
                "Count of upstream origin fetches, including per-extent delta sub-fetches",
            ),
            &["origin", "origin_type", "cache_status", "http_status"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_operations_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "chronocache_cache_operations_total",
                "Count of backend cache operations",
            ),
            &["cache", "operation", "status"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_objects() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("chronocache_cache_objects", "Objects held per cache"),
            &["cache"],
        )
        .unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

fn cache_bytes() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("chronocache_cache_bytes", "Bytes held per cache"),
            &["cache"],
        )
        .unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

#[allow(clippy::too_many_arguments)]
pub fn record_request(
    origin: &str,
    origin_type: &str,
    method: &str,
    cache_status: &str,
    http_status: u16,
    path: &str,
    elapsed: Duration,
) {
    let status = http_status.to_string();
    let labels = [origin, origin_type, method, cache_status, status.as_str(), path];
    requests_total().with_label_values(&labels).inc();
    request_duration()
        .with_label_values(&labels)
        .observe(elapsed.as_secs_f64());
}

pub fn record_origin_fetch(origin: &str, origin_type: &str, cache_status: &str, http_status: u16) {
    let status = http_status.to_string();
    origin_fetches_total()
        .with_label_values(&[origin, origin_type, cache_status, status.as_str()])
        .inc();
}

pub fn record_cache_operation(cache: &str, operation: &str, status: &str) {
    cache_operations_total()
        .with_label_values(&[cache, operation, status])
        .inc();
}

pub fn set_cache_usage(cache: &str, objects: u64, bytes: u64) {
    cache_objects()
        .with_label_values(&[cache])
        .set(objects as i64);
    cache_bytes().with_label_values(&[cache]).set(bytes as i64);
}

pub fn exposition() -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&registry().gather(), &mut buf) {
        log::warn!("metrics encode failed: {err}");
    }
    buf
}
