// src/metrics.rs

//! Prometheus counters and gauges, mirroring the ambient observability
//! surface of the teacher codebase's own `core::metrics` module. Exposed
//! over HTTP for scraping; never gates request handling.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REDIRECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mirrorbits_redirects_total",
        "Total number of redirect responses served",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static SELECTION_EXCLUSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mirrorbits_selection_exclusions_total",
            "Mirror exclusions observed during selection, by reason",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static SCANS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("mirrorbits_scans_total", "Scans started, by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static LOCK_CONTENTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mirrorbits_lock_contentions_total",
        "Cluster lock acquisition attempts that observed an already-held lock",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static MIRRORS_UP: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("mirrorbits_mirrors_up", "Mirrors currently marked up").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static CACHE_HITS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("mirrorbits_cache_hits_total", "Local cache hits, by table"),
        &["table"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static CACHE_MISSES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "mirrorbits_cache_misses_total",
            "Local cache misses, by table",
        ),
        &["table"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
