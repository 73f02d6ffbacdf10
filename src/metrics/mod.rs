// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

pub use server::start_metrics_server;

// ============================================================================
// Relay Metrics
// ============================================================================
//
// Delivery failures never reach the user whose request produced the event,
// so these counters and the logs are the only place they show up.
//
// ============================================================================

pub struct RelayMetrics {
    registry: Registry,

    pub published: IntCounterVec,
    pub publish_failures: IntCounterVec,
    pub publish_duration: HistogramVec,
    pub dead_lettered: IntCounterVec,
    pub cycles: IntCounterVec,
    pub pending: IntGaugeVec,
    pub circuit_breaker_state: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let published = IntCounterVec::new(
            Opts::new("outbox_events_published_total", "Outbox events acknowledged by the broker"),
            &["topic"],
        )?;
        registry.register(Box::new(published.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("outbox_publish_failures_total", "Publish attempts that did not get an acknowledgement"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new("outbox_publish_duration_seconds", "Time from publish call to acknowledgement")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["topic"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let dead_lettered = IntCounterVec::new(
            Opts::new("outbox_dead_lettered_total", "Records moved to the dead-letter table"),
            &["topic"],
        )?;
        registry.register(Box::new(dead_lettered.clone()))?;

        let cycles = IntCounterVec::new(
            Opts::new("outbox_relay_cycles_total", "Relay cycles by outcome"),
            &["lane", "outcome"],
        )?;
        registry.register(Box::new(cycles.clone()))?;

        let pending = IntGaugeVec::new(
            Opts::new("outbox_pending_records", "Records waiting for delivery at the end of the last cycle"),
            &["lane"],
        )?;
        registry.register(Box::new(pending.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Broker circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            published,
            publish_failures,
            publish_duration,
            dead_lettered,
            cycles,
            pending,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_published(&self, topic: &str, duration_secs: f64) {
        self.published.with_label_values(&[topic]).inc();
        self.publish_duration.with_label_values(&[topic]).observe(duration_secs);
    }

    pub fn record_publish_failure(&self, topic: &str, reason: &str) {
        self.publish_failures.with_label_values(&[topic, reason]).inc();
    }

    pub fn record_dead_letter(&self, topic: &str) {
        self.dead_lettered.with_label_values(&[topic]).inc();
    }

    pub fn record_cycle(&self, lane: &str, outcome: &str) {
        self.cycles.with_label_values(&[lane, outcome]).inc();
    }

    pub fn set_pending(&self, lane: &str, count: i64) {
        self.pending.with_label_values(&[lane]).set(count);
    }

    pub fn set_circuit_breaker_state(&self, state: i64) {
        self.circuit_breaker_state.set(state);
    }
}
