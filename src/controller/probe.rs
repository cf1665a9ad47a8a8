//! Metrics Probe
//!
//! Samples success ratio and p95 latency for a revision, tracks canary probe
//! health on the rollout state and computes analysis-window statistics.

use crate::controller::clock::to_chrono;
use crate::controller::prometheus::{
    build_latency_p95_query, build_success_ratio_query, MetricsQuerier, PrometheusError,
    RevisionSelector,
};
use crate::model::{Health, MetricSample, RolloutPlan, RolloutState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Shortest range used inside `rate()` queries
const MIN_QUERY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("metrics unavailable for revision {revision}: {source}")]
    Unavailable {
        revision: String,
        #[source]
        source: PrometheusError,
    },
}

/// Polls the metrics API for one revision at a time
pub struct MetricsProbe {
    querier: Arc<dyn MetricsQuerier>,
}

impl MetricsProbe {
    pub fn new(querier: Arc<dyn MetricsQuerier>) -> Self {
        MetricsProbe { querier }
    }

    /// Take one sample of `revision`
    ///
    /// Both the success ratio and the latency query must return data; a
    /// partial answer is treated as unavailable.
    pub async fn sample(
        &self,
        plan: &RolloutPlan,
        revision: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<MetricSample, ProbeError> {
        let selector = RevisionSelector {
            namespace: &plan.namespace,
            service: &plan.service,
            revision,
        };
        let range = query_range(window);

        let unavailable = |source| ProbeError::Unavailable {
            revision: revision.to_string(),
            source,
        };

        let success_ratio = self
            .querier
            .query_instant(&build_success_ratio_query(&selector, &range))
            .await
            .map_err(unavailable)?;
        let latency_ms = self
            .querier
            .query_instant(&build_latency_p95_query(&selector, &range))
            .await
            .map_err(unavailable)?;

        Ok(MetricSample {
            timestamp: now,
            revision: revision.to_string(),
            success_ratio: success_ratio.clamp(0.0, 1.0),
            latency_ms,
        })
    }
}

/// PromQL range for `rate()`, at least one minute
pub fn query_range(window: Duration) -> String {
    format!("{}s", window.max(MIN_QUERY_WINDOW).as_secs())
}

/// Store a successful canary sample and restore Reporting health
pub fn record_canary_sample(state: &mut RolloutState, sample: MetricSample) {
    if state.health == Health::Unknown {
        debug!(rollout = ?state.id, "Canary metrics reporting again");
    }
    state.health = Health::Reporting;
    state.probe_failures = 0;
    state.unknown_since = None;
    state.samples.push(sample);
}

/// Store a stable sample (comparison only, never drives health)
pub fn record_stable_sample(state: &mut RolloutState, sample: MetricSample) {
    state.samples.push(sample);
}

/// Count a failed canary probe
///
/// Returns true when this failure flipped health to Unknown.
pub fn record_canary_failure(
    state: &mut RolloutState,
    failure_threshold: u32,
    now: DateTime<Utc>,
) -> bool {
    state.probe_failures = state.probe_failures.saturating_add(1);

    if state.health == Health::Reporting && state.probe_failures >= failure_threshold {
        warn!(
            rollout = ?state.id,
            failures = state.probe_failures,
            "Canary health is Unknown, weight progression frozen"
        );
        state.health = Health::Unknown;
        state.unknown_since = Some(now);
        return true;
    }
    false
}

/// Drop samples older than `retention`
pub fn prune_samples(state: &mut RolloutState, now: DateTime<Utc>, retention: Duration) {
    let cutoff = now - to_chrono(retention);
    state.samples.retain(|s| s.timestamp >= cutoff);
}

/// Aggregate of one revision's samples inside an analysis window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// Mean success ratio
    pub success_ratio: f64,
    /// Mean p95 latency in milliseconds
    pub latency_ms: f64,
    pub samples: usize,
}

/// Statistics for `revision` over the window `(now - window, now]`
///
/// Returns None when the window holds no samples.
pub fn window_stats(
    samples: &[MetricSample],
    revision: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> Option<WindowStats> {
    let start = now - to_chrono(window);
    let in_window: Vec<&MetricSample> = samples
        .iter()
        .filter(|s| s.revision == revision && s.timestamp > start && s.timestamp <= now)
        .collect();

    if in_window.is_empty() {
        return None;
    }

    let n = in_window.len() as f64;
    Some(WindowStats {
        success_ratio: in_window.iter().map(|s| s.success_ratio).sum::<f64>() / n,
        latency_ms: in_window.iter().map(|s| s.latency_ms).sum::<f64>() / n,
        samples: in_window.len(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::prometheus::MockPrometheusClient;

    fn plan() -> RolloutPlan {
        serde_yaml::from_str(
            r#"
service: checkout
namespace: shop
stableRevision: checkout-v1
canaryRevision: checkout-v2
stepSize: 20
stepInterval: 1m
successThreshold: 0.99
"#,
        )
        .unwrap()
    }

    fn sample(revision: &str, at: DateTime<Utc>, ratio: f64) -> MetricSample {
        MetricSample {
            timestamp: at,
            revision: revision.to_string(),
            success_ratio: ratio,
            latency_ms: 100.0,
        }
    }

    #[tokio::test]
    async fn test_sample_reads_ratio_and_latency() {
        let mock = Arc::new(MockPrometheusClient::new());
        mock.set_revision("checkout-v2", 0.995, 87.0);
        let probe = MetricsProbe::new(mock.clone());
        let now = Utc::now();

        let sample = probe
            .sample(&plan(), "checkout-v2", Duration::from_secs(60), now)
            .await
            .unwrap();

        assert_eq!(sample.revision, "checkout-v2");
        assert_eq!(sample.success_ratio, 0.995);
        assert_eq!(sample.latency_ms, 87.0);
        assert_eq!(sample.timestamp, now);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_sample_without_data_is_unavailable() {
        let mock = Arc::new(MockPrometheusClient::new());
        let probe = MetricsProbe::new(mock);

        let result = probe
            .sample(&plan(), "checkout-v2", Duration::from_secs(60), Utc::now())
            .await;

        assert!(matches!(
            result,
            Err(ProbeError::Unavailable {
                source: PrometheusError::NoData,
                ..
            })
        ));
    }

    #[test]
    fn test_query_range_has_floor() {
        assert_eq!(query_range(Duration::from_secs(10)), "60s");
        assert_eq!(query_range(Duration::from_secs(300)), "300s");
    }

    #[test]
    fn test_health_goes_unknown_after_threshold_and_recovers_on_one_sample() {
        let now = Utc::now();
        let mut state = RolloutState::new("r-1".to_string(), &plan(), now);

        assert!(!record_canary_failure(&mut state, 3, now));
        assert!(!record_canary_failure(&mut state, 3, now));
        assert_eq!(state.health, Health::Reporting);

        assert!(record_canary_failure(&mut state, 3, now));
        assert_eq!(state.health, Health::Unknown);
        assert_eq!(state.unknown_since, Some(now));

        // Further failures keep the original unknown_since
        let later = now + chrono::Duration::seconds(30);
        assert!(!record_canary_failure(&mut state, 3, later));
        assert_eq!(state.unknown_since, Some(now));

        record_canary_sample(&mut state, sample("checkout-v2", later, 1.0));
        assert_eq!(state.health, Health::Reporting);
        assert_eq!(state.probe_failures, 0);
        assert_eq!(state.unknown_since, None);
    }

    #[test]
    fn test_prune_drops_old_samples() {
        let now = Utc::now();
        let mut state = RolloutState::new("r-1".to_string(), &plan(), now);
        state
            .samples
            .push(sample("checkout-v2", now - chrono::Duration::minutes(11), 1.0));
        state
            .samples
            .push(sample("checkout-v2", now - chrono::Duration::minutes(2), 1.0));

        prune_samples(&mut state, now, Duration::from_secs(600));

        assert_eq!(state.samples.len(), 1);
    }

    #[test]
    fn test_window_stats_filters_revision_and_time() {
        let now = Utc::now();
        let samples = vec![
            sample("checkout-v2", now - chrono::Duration::seconds(90), 0.50),
            sample("checkout-v2", now - chrono::Duration::seconds(30), 0.98),
            sample("checkout-v2", now, 1.0),
            sample("checkout-v1", now, 0.10),
        ];

        let stats = window_stats(&samples, "checkout-v2", now, Duration::from_secs(60)).unwrap();

        assert_eq!(stats.samples, 2);
        assert!((stats.success_ratio - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_window_stats_empty_window() {
        let now = Utc::now();
        let samples = vec![sample("checkout-v2", now - chrono::Duration::minutes(5), 1.0)];

        assert!(window_stats(&samples, "checkout-v2", now, Duration::from_secs(60)).is_none());
    }
}
