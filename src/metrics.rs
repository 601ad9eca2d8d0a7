//! Prometheus metrics for the bridge.
//!
//! Each `Metrics` owns its registry, so several routers (tests) can coexist
//! in one process. The `/metrics` handler renders it in text format.

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    // Counters
    intents_total: CounterVec,
    execute_results_total: CounterVec,
    token_grants_total: CounterVec,
    state_reports_total: CounterVec,

    // Histograms
    dispatch_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let intents_total = CounterVec::new(
            opts!("smarthome_intents_total", "Intents handled, by outcome"),
            &["intent", "outcome"],
        )?;
        let execute_results_total = CounterVec::new(
            opts!(
                "smarthome_execute_results_total",
                "EXECUTE device/command results by status"
            ),
            &["status"],
        )?;
        let token_grants_total = CounterVec::new(
            opts!("smarthome_token_grants_total", "Token endpoint grants"),
            &["grant", "outcome"],
        )?;
        let state_reports_total = CounterVec::new(
            opts!(
                "smarthome_state_reports_total",
                "HomeGraph report and sync calls"
            ),
            &["kind", "outcome"],
        )?;
        let dispatch_seconds = HistogramVec::new(
            histogram_opts!(
                "smarthome_dispatch_seconds",
                "Intent dispatch latency in seconds",
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
            ),
            &["intent"],
        )?;

        registry.register(Box::new(intents_total.clone()))?;
        registry.register(Box::new(execute_results_total.clone()))?;
        registry.register(Box::new(token_grants_total.clone()))?;
        registry.register(Box::new(state_reports_total.clone()))?;
        registry.register(Box::new(dispatch_seconds.clone()))?;

        Ok(Self {
            registry,
            intents_total,
            execute_results_total,
            token_grants_total,
            state_reports_total,
            dispatch_seconds,
        })
    }

    pub fn record_intent(&self, intent: &str, outcome: &str, elapsed_secs: f64) {
        self.intents_total
            .with_label_values(&[intent, outcome])
            .inc();
        self.dispatch_seconds
            .with_label_values(&[intent])
            .observe(elapsed_secs);
    }

    pub fn record_execute_result(&self, status: &str) {
        self.execute_results_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_grant(&self, grant: &str, outcome: &str) {
        self.token_grants_total
            .with_label_values(&[grant, outcome])
            .inc();
    }

    pub fn record_report(&self, kind: &str, outcome: &str) {
        self.state_reports_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    /// Prometheus text exposition of everything in this registry.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
