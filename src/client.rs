//! HTTP client for the control API, used by the `kanari` CLI verbs

use crate::error::{ApiError, ErrorKind};
use crate::model::{RolloutPlan, RolloutState};
use reqwest::{Method, StatusCode};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Exit code when the controller cannot be reached
pub const EXIT_UNREACHABLE: i32 = 9;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("controller unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("{}: {}", .0.kind, .0.message)]
    Api(ApiError),

    #[error("invalid plan file {path}: {reason}")]
    Plan { path: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Unreachable { .. } => EXIT_UNREACHABLE,
            ClientError::Api(err) => err.kind.exit_code(),
            ClientError::Plan { .. } => ErrorKind::PlanValidation.exit_code(),
            ClientError::Other(_) => ErrorKind::Internal.exit_code(),
        }
    }
}

/// Read a RolloutPlan from a YAML or JSON file
pub fn read_plan(path: &Path) -> Result<RolloutPlan, ClientError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ClientError::Other(format!("cannot read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&raw).map_err(|e| ClientError::Plan {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(server: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        ControlClient {
            base: format!("{}/api/v1/rollouts", server.trim_end_matches('/')),
            http,
        }
    }

    pub async fn start(&self, plan: &RolloutPlan) -> Result<RolloutState, ClientError> {
        let url = self.base.clone();
        let request = self.http.post(&url).json(plan);
        self.send(url, request).await
    }

    pub async fn list(&self) -> Result<Vec<RolloutState>, ClientError> {
        let url = self.base.clone();
        let request = self.http.get(&url);
        self.send(url, request).await
    }

    pub async fn status(&self, id: &str) -> Result<RolloutState, ClientError> {
        self.call(Method::GET, format!("{}/{}", self.base, id)).await
    }

    pub async fn pause(&self, id: &str) -> Result<RolloutState, ClientError> {
        self.call(Method::POST, format!("{}/{}/pause", self.base, id))
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<RolloutState, ClientError> {
        self.call(Method::POST, format!("{}/{}/resume", self.base, id))
            .await
    }

    pub async fn abort(&self, id: &str) -> Result<RolloutState, ClientError> {
        self.call(Method::POST, format!("{}/{}/abort", self.base, id))
            .await
    }

    async fn call(&self, method: Method, url: String) -> Result<RolloutState, ClientError> {
        let request = self.http.request(method, &url);
        self.send(url, request).await
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await.map_err(|e| ClientError::Unreachable {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Other(format!("failed to read response: {e}")))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ClientError::Other(format!("unexpected response from {url}: {e}")));
        }
        Err(ClientError::Api(error_body(status, &body)))
    }
}

/// Decode an error response, falling back to `internal` for foreign bodies
fn error_body(status: StatusCode, body: &str) -> ApiError {
    serde_json::from_str(body).unwrap_or_else(|_| ApiError {
        kind: ErrorKind::Internal,
        message: format!("HTTP {status}: {body}"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};

    #[test]
    fn test_error_body_decodes_api_errors() {
        let err = error_body(
            StatusCode::CONFLICT,
            r#"{"kind":"conflict","message":"ingress shop/checkout-canary changed"}"#,
        );
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(ClientError::Api(err).exit_code(), 5);

        let foreign = error_body(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(foreign.kind, ErrorKind::Internal);
        assert!(foreign.message.contains("502"));
    }

    #[test]
    fn test_read_plan_accepts_yaml_and_reports_bad_files() {
        let dir = std::env::temp_dir().join(format!("kanari-plan-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("plan.yaml");
        std::fs::write(
            &good,
            "service: checkout\nstableRevision: v1\ncanaryRevision: v2\nstepSize: 10\nstepInterval: 30s\nsuccessThreshold: 0.99\n",
        )
        .unwrap();
        let plan = read_plan(&good).unwrap();
        assert_eq!(plan.service, "checkout");
        assert_eq!(plan.namespace, "default");

        let bad = dir.join("bad.yaml");
        std::fs::write(&bad, "service: [unterminated").unwrap();
        assert_eq!(read_plan(&bad).unwrap_err().exit_code(), 3);

        assert_eq!(
            read_plan(&dir.join("missing.yaml")).unwrap_err().exit_code(),
            1
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_controller_exits_9() {
        let client = ControlClient::new("http://127.0.0.1:1");
        let err = client.status("r-1").await.unwrap_err();

        assert!(matches!(err, ClientError::Unreachable { .. }));
        assert_eq!(err.exit_code(), EXIT_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_api_error_maps_to_exit_code() {
        let app = Router::new().route(
            "/api/v1/rollouts/{id}/pause",
            post(|| async {
                (
                    AxumStatus::CONFLICT,
                    Json(ApiError {
                        kind: ErrorKind::InvalidState,
                        message: "cannot pause rollout r-1 in phase Promoted".to_string(),
                    }),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = ControlClient::new(&format!("http://{addr}/"));
        let err = client.pause("r-1").await.unwrap_err();

        assert_eq!(err.exit_code(), 8);
        assert!(err.to_string().contains("invalid_state"));
    }
}
