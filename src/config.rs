//! Controller configuration loaded from `KANARI_*` environment variables
//!
//! Every setting has a default; invalid values are logged and replaced by
//! the default so a typo never prevents the controller from starting.

use crate::controller::validation::parse_duration;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default port for the control API, health and metrics endpoints
pub const DEFAULT_PORT: u16 = 8080;

/// Default controller address used by the CLI
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub port: u16,
    pub prometheus_address: String,
    /// Per-query timeout of the metrics API
    pub prometheus_timeout: Duration,
    /// Consecutive canary probe failures before health becomes Unknown
    pub probe_failure_threshold: u32,
    /// How long Unknown health is tolerated before the rollout pauses
    pub unknown_grace: Duration,
    pub hysteresis_margin: f64,
    /// Default bake duration at max weight (plans can override)
    pub bake_duration: Duration,
    pub sample_retention: Duration,
    /// How long terminal rollouts stay queryable
    pub retention: Duration,
    pub apply_timeout: Duration,
    pub apply_max_retries: u32,
    pub apply_backoff_base: Duration,
    pub apply_backoff_max: Duration,
    pub cdevents_enabled: bool,
    pub cdevents_sink_url: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            port: DEFAULT_PORT,
            prometheus_address: "http://prometheus:9090".to_string(),
            prometheus_timeout: Duration::from_secs(5),
            probe_failure_threshold: 3,
            unknown_grace: Duration::from_secs(120),
            hysteresis_margin: 0.02,
            bake_duration: Duration::ZERO,
            sample_retention: Duration::from_secs(600),
            retention: Duration::from_secs(3600),
            apply_timeout: Duration::from_secs(10),
            apply_max_retries: 5,
            apply_backoff_base: Duration::from_millis(200),
            apply_backoff_max: Duration::from_secs(10),
            cdevents_enabled: false,
            cdevents_sink_url: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ControllerConfig::default();

        let margin = parsed(&lookup, "KANARI_HYSTERESIS_MARGIN", defaults.hysteresis_margin);
        let hysteresis_margin = if (0.0..1.0).contains(&margin) {
            margin
        } else {
            warn!(
                value = margin,
                "KANARI_HYSTERESIS_MARGIN must be in [0, 1), using default"
            );
            defaults.hysteresis_margin
        };

        let threshold = parsed(
            &lookup,
            "KANARI_PROBE_FAILURE_THRESHOLD",
            defaults.probe_failure_threshold,
        );

        ControllerConfig {
            port: parsed(&lookup, "KANARI_PORT", defaults.port),
            prometheus_address: lookup("KANARI_PROMETHEUS_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.prometheus_address),
            prometheus_timeout: duration(
                &lookup,
                "KANARI_PROMETHEUS_TIMEOUT",
                defaults.prometheus_timeout,
            ),
            probe_failure_threshold: threshold.max(1),
            unknown_grace: duration(&lookup, "KANARI_UNKNOWN_GRACE", defaults.unknown_grace),
            hysteresis_margin,
            bake_duration: duration(&lookup, "KANARI_BAKE_DURATION", defaults.bake_duration),
            sample_retention: duration(
                &lookup,
                "KANARI_SAMPLE_RETENTION",
                defaults.sample_retention,
            ),
            retention: duration(&lookup, "KANARI_RETENTION", defaults.retention),
            apply_timeout: duration(&lookup, "KANARI_APPLY_TIMEOUT", defaults.apply_timeout),
            apply_max_retries: parsed(
                &lookup,
                "KANARI_APPLY_MAX_RETRIES",
                defaults.apply_max_retries,
            ),
            apply_backoff_base: Duration::from_millis(parsed(
                &lookup,
                "KANARI_APPLY_BACKOFF_BASE_MS",
                defaults.apply_backoff_base.as_millis() as u64,
            )),
            apply_backoff_max: Duration::from_millis(parsed(
                &lookup,
                "KANARI_APPLY_BACKOFF_MAX_MS",
                defaults.apply_backoff_max.as_millis() as u64,
            )),
            cdevents_enabled: lookup("KANARI_CDEVENTS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            cdevents_sink_url: lookup("KANARI_CDEVENTS_SINK_URL").filter(|v| !v.is_empty()),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "Invalid value, using default");
                default
            }
        },
    }
}

fn duration(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key) {
        None => default,
        Some(raw) => parse_duration(&raw).unwrap_or_else(|| {
            warn!(key, value = %raw, default = ?default, "Invalid duration, using default");
            default
        }),
    }
}
