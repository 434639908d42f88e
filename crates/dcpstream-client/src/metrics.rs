use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry for the feed client
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Observer Metrics
    // ============================================================================

    /// Protocol events classified by the observer
    pub static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dcpstream_events_total", "Total protocol events received"),
        &["type"]
    ).expect("metric can be created");

    /// Mutations/deletions dropped by the key filter before dispatch
    pub static ref EVENTS_FILTERED_TOTAL: IntCounter = IntCounter::new(
        "dcpstream_events_filtered_total", "Total events dropped by the key filter"
    ).expect("metric can be created");

    // ============================================================================
    // Worker / Feed Metrics
    // ============================================================================

    /// Feed events delivered downstream
    pub static ref FEED_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dcpstream_feed_events_total", "Total feed events emitted downstream"),
        &["opcode"]
    ).expect("metric can be created");

    /// Successful checkpoint writes
    pub static ref CHECKPOINT_WRITES_TOTAL: IntCounter = IntCounter::new(
        "dcpstream_checkpoint_writes_total", "Total successful checkpoint writes"
    ).expect("metric can be created");

    /// Failed checkpoint writes
    pub static ref CHECKPOINT_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "dcpstream_checkpoint_failures_total", "Total failed checkpoint writes"
    ).expect("metric can be created");

    // ============================================================================
    // Supervisor Metrics
    // ============================================================================

    /// Stream restart attempts by end reason
    pub static ref STREAM_RESTARTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dcpstream_stream_restarts_total", "Total stream restart attempts"),
        &["reason"]
    ).expect("metric can be created");

    /// Partitions per lifecycle state
    pub static ref PARTITION_STATES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("dcpstream_partitions", "Partitions per lifecycle state"),
        &["state"]
    ).expect("metric can be created");
}

/// Register all feed metrics with the registry. Idempotent.
pub fn register_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(EVENTS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(EVENTS_FILTERED_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(FEED_EVENTS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(CHECKPOINT_WRITES_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(CHECKPOINT_FAILURES_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(STREAM_RESTARTS_TOTAL.clone()))
            .expect("collector can be registered");
        REGISTRY
            .register(Box::new(PARTITION_STATES.clone()))
            .expect("collector can be registered");
    });
}

/// Encode the registry in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .expect("metrics can be encoded");
    String::from_utf8(buffer).expect("metrics are valid utf8")
}
