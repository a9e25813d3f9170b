use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref HEARTBEATS_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_heartbeats_received_total",
        "Total heartbeats received by the gateway (HTTP and MQTT)"
    ))
    .unwrap();
    pub static ref HEARTBEATS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_heartbeats_rejected_total",
        "Total heartbeats rejected by validation"
    ))
    .unwrap();
    pub static ref JOBS_ENQUEUED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_jobs_enqueued_total",
        "Total heartbeat jobs enqueued"
    ))
    .unwrap();
    pub static ref JOBS_COMPLETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_jobs_completed_total",
        "Total heartbeat jobs processed successfully"
    ))
    .unwrap();
    pub static ref JOBS_RETRIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_jobs_retried_total",
        "Total job attempts rescheduled with backoff"
    ))
    .unwrap();
    pub static ref JOBS_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_jobs_failed_total",
        "Total jobs moved to the failed set"
    ))
    .unwrap();
    pub static ref PROCESSING_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "pipeline_processing_latency_seconds",
            "Time taken to persist and evaluate one heartbeat"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref RULE_MATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_rule_matches_total",
        "Total rule matches"
    ))
    .unwrap();
    pub static ref NOTIFICATIONS_PERSISTED: Counter = Counter::with_opts(Opts::new(
        "pipeline_notifications_persisted_total",
        "Total notifications written to the alert log"
    ))
    .unwrap();
    pub static ref REALTIME_EVENTS_DELIVERED: Counter = Counter::with_opts(Opts::new(
        "pipeline_realtime_events_delivered_total",
        "Total real-time events handed to WebSocket connections"
    ))
    .unwrap();
    pub static ref REALTIME_EVENTS_DROPPED: Counter = Counter::with_opts(Opts::new(
        "pipeline_realtime_events_dropped_total",
        "Total real-time events dropped because a connection's outbox was full"
    ))
    .unwrap();
    pub static ref REALTIME_CONNECTIONS: Gauge = Gauge::with_opts(Opts::new(
        "pipeline_realtime_connections",
        "Currently open WebSocket connections"
    ))
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HEARTBEATS_RECEIVED_TOTAL.clone()),
        Box::new(HEARTBEATS_REJECTED_TOTAL.clone()),
        Box::new(JOBS_ENQUEUED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOBS_RETRIED_TOTAL.clone()),
        Box::new(JOBS_FAILED_TOTAL.clone()),
        Box::new(PROCESSING_LATENCY_SECONDS.clone()),
        Box::new(RULE_MATCHES_TOTAL.clone()),
        Box::new(NOTIFICATIONS_PERSISTED.clone()),
        Box::new(REALTIME_EVENTS_DELIVERED.clone()),
        Box::new(REALTIME_EVENTS_DROPPED.clone()),
        Box::new(REALTIME_CONNECTIONS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
