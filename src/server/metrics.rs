//! Prometheus metrics for the rollout controller
//!
//! Exposed at `/metrics` in the Prometheus text format.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    ticks_total: IntCounterVec,
    tick_duration_seconds: HistogramVec,
    phase_transitions_total: IntCounterVec,
    probe_failures_total: IntCounterVec,
    apply_total: IntCounterVec,
    active_rollouts: IntGauge,
    canary_weight: IntGaugeVec,
}

/// Create the metrics registry with every kanari metric registered
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    ControllerMetrics::new().map(Arc::new)
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ticks_total = IntCounterVec::new(
            Opts::new("kanari_ticks_total", "Control loop ticks by result"),
            &["result"],
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let tick_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kanari_tick_duration_seconds",
                "Duration of one control loop tick",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["result"],
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        let phase_transitions_total = IntCounterVec::new(
            Opts::new(
                "kanari_phase_transitions_total",
                "Rollout phase transitions",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(phase_transitions_total.clone()))?;

        let probe_failures_total = IntCounterVec::new(
            Opts::new(
                "kanari_probe_failures_total",
                "Metrics probe failures by revision role",
            ),
            &["role"],
        )?;
        registry.register(Box::new(probe_failures_total.clone()))?;

        let apply_total = IntCounterVec::new(
            Opts::new("kanari_apply_total", "Ingress weight applies by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(apply_total.clone()))?;

        let active_rollouts = IntGauge::new(
            "kanari_active_rollouts",
            "Rollouts in a non-terminal phase",
        )?;
        registry.register(Box::new(active_rollouts.clone()))?;

        let canary_weight = IntGaugeVec::new(
            Opts::new("kanari_canary_weight", "Current canary weight per rollout"),
            &["rollout", "namespace", "service"],
        )?;
        registry.register(Box::new(canary_weight.clone()))?;

        Ok(ControllerMetrics {
            registry,
            ticks_total,
            tick_duration_seconds,
            phase_transitions_total,
            probe_failures_total,
            apply_total,
            active_rollouts,
            canary_weight,
        })
    }

    /// Record a finished tick
    ///
    /// `result` is the verdict name ("hold", "advance", "promote", ...).
    pub fn record_tick(&self, result: &str, duration_secs: f64) {
        self.ticks_total.with_label_values(&[result]).inc();
        self.tick_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.phase_transitions_total
            .with_label_values(&[from, to])
            .inc();
    }

    /// `role` is "canary" or "stable"
    pub fn record_probe_failure(&self, role: &str) {
        self.probe_failures_total.with_label_values(&[role]).inc();
    }

    /// `outcome` is "patched", "unchanged", "conflict" or "error"
    pub fn record_apply(&self, outcome: &str) {
        self.apply_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_active_rollouts(&self, count: usize) {
        self.active_rollouts
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_canary_weight(&self, rollout: &str, namespace: &str, service: &str, weight: i32) {
        self.canary_weight
            .with_label_values(&[rollout, namespace, service])
            .set(i64::from(weight));
    }

    /// Drop the weight series of a pruned rollout
    pub fn forget_rollout(&self, rollout: &str, namespace: &str, service: &str) {
        let _ = self
            .canary_weight
            .remove_label_values(&[rollout, namespace, service]);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
