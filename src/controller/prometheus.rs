//! Prometheus queries backing the Metrics Probe
//!
//! Builds PromQL for a revision's success ratio and p95 latency and runs them
//! through the instant query API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrometheusError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data returned from Prometheus")]
    NoData,
}

/// Trait for running instant queries
///
/// Production code uses `PrometheusClient`. Tests use `MockPrometheusClient`
/// which answers from canned values.
#[async_trait]
pub trait MetricsQuerier: Send + Sync {
    async fn query_instant(&self, query: &str) -> Result<f64, PrometheusError>;
}

/// Labels identifying one revision's traffic
#[derive(Debug, Clone, Copy)]
pub struct RevisionSelector<'a> {
    pub namespace: &'a str,
    pub service: &'a str,
    pub revision: &'a str,
}

/// Build PromQL for the success ratio of a revision
///
/// Calculates: non-5xx request rate / total request rate
pub fn build_success_ratio_query(selector: &RevisionSelector<'_>, window: &str) -> String {
    let labels = format!(
        r#"namespace="{}",service="{}",revision="{}""#,
        selector.namespace, selector.service, selector.revision
    );
    format!(
        r#"sum(rate(http_requests_total{{{labels},status!~"5.."}}[{window}])) / sum(rate(http_requests_total{{{labels}}}[{window}]))"#
    )
}

/// Build PromQL for the p95 latency of a revision, in milliseconds
pub fn build_latency_p95_query(selector: &RevisionSelector<'_>, window: &str) -> String {
    format!(
        r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{namespace="{}",service="{}",revision="{}"}}[{}])) by (le)) * 1000"#,
        selector.namespace, selector.service, selector.revision, window
    )
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse an instant query response and extract the first value
///
/// NaN (0/0 when a revision got no traffic) counts as no data.
pub fn parse_prometheus_instant_query(json_response: &str) -> Result<f64, PrometheusError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| PrometheusError::ParseError(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(PrometheusError::HttpError(format!(
            "Prometheus query failed with status: {}",
            response.status
        )));
    }

    let result = response
        .data
        .result
        .first()
        .ok_or(PrometheusError::NoData)?;

    let value = result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| PrometheusError::ParseError(format!("Invalid value: {}", e)))?;

    if value.is_nan() {
        return Err(PrometheusError::NoData);
    }

    Ok(value)
}

/// HTTP client for the Prometheus `/api/v1/query` endpoint
pub struct PrometheusClient {
    address: String,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(address: String, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build Prometheus HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            address: address.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl MetricsQuerier for PrometheusClient {
    async fn query_instant(&self, query: &str) -> Result<f64, PrometheusError> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.address))
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| PrometheusError::HttpError(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PrometheusError::HttpError(e.to_string()))?;

        if !status.is_success() {
            return Err(PrometheusError::HttpError(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        parse_prometheus_instant_query(&body)
    }
}

/// Mock querier for testing
///
/// Rules are matched against the query text: a rule applies when the query
/// contains every one of its fragments, and the most recently added matching
/// rule wins. Queries matching no rule return `NoData`.
#[cfg(test)]
pub struct MockPrometheusClient {
    rules: std::sync::Mutex<Vec<(Vec<String>, Option<f64>)>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockPrometheusClient {
    pub fn new() -> Self {
        Self {
            rules: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Answer queries containing all `fragments` with `value`
    pub fn set_value(&self, fragments: &[&str], value: f64) {
        self.push_rule(fragments, Some(value));
    }

    /// Fail queries containing all `fragments`
    pub fn set_failing(&self, fragments: &[&str]) {
        self.push_rule(fragments, None);
    }

    fn push_rule(&self, fragments: &[&str], value: Option<f64>) {
        let fragments = fragments.iter().map(|f| f.to_string()).collect();
        self.rules.lock().unwrap().push((fragments, value));
    }

    /// Set success ratio and latency answers for one revision
    pub fn set_revision(&self, revision: &str, success_ratio: f64, latency_ms: f64) {
        let label = format!(r#"revision="{}""#, revision);
        self.set_value(&["http_requests_total", &label], success_ratio);
        self.set_value(&["histogram_quantile", &label], latency_ms);
    }

    /// Make every query for one revision fail
    pub fn fail_revision(&self, revision: &str) {
        self.set_failing(&[&format!(r#"revision="{}""#, revision)]);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl MetricsQuerier for MockPrometheusClient {
    #[allow(clippy::unwrap_used)]
    async fn query_instant(&self, query: &str) -> Result<f64, PrometheusError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let rules = self.rules.lock().unwrap();
        let matched = rules
            .iter()
            .rev()
            .find(|(fragments, _)| fragments.iter().all(|f| query.contains(f.as_str())));
        match matched {
            Some((_, Some(value))) => Ok(*value),
            Some((_, None)) => Err(PrometheusError::HttpError("connection refused".to_string())),
            None => Err(PrometheusError::NoData),
        }
    }
}
