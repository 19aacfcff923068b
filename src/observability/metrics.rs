use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fixes_ingested_total: IntCounterVec,
    pub ingest_latency_seconds: HistogramVec,
    pub active_sessions: IntGauge,
    pub proximity_events_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let fixes_ingested_total = IntCounterVec::new(
            Opts::new("fixes_ingested_total", "Courier fixes received, by outcome"),
            &["outcome"],
        )
        .expect("valid fixes_ingested_total metric");

        let ingest_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ingest_latency_seconds",
                "Time to validate, evaluate and publish one fix",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
            &["outcome"],
        )
        .expect("valid ingest_latency_seconds metric");

        let active_sessions = IntGauge::new("active_sessions", "Deliveries currently tracked")
            .expect("valid active_sessions metric");

        let proximity_events_total = IntCounterVec::new(
            Opts::new("proximity_events_total", "Threshold crossings, by kind"),
            &["kind"],
        )
        .expect("valid proximity_events_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notifier deliveries, by outcome"),
            &["outcome"],
        )
        .expect("valid notifications_total metric");

        registry
            .register(Box::new(fixes_ingested_total.clone()))
            .expect("register fixes_ingested_total");
        registry
            .register(Box::new(ingest_latency_seconds.clone()))
            .expect("register ingest_latency_seconds");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(proximity_events_total.clone()))
            .expect("register proximity_events_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");

        Self {
            registry,
            fixes_ingested_total,
            ingest_latency_seconds,
            active_sessions,
            proximity_events_total,
            notifications_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
