//! CDEvents emission for rollout observability.
//!
//! service.deployed on start, service.upgraded on each weight step,
//! service.published on promotion and service.rolledback on rollback.

use crate::config::ControllerConfig;
use crate::model::{RolloutPlan, RolloutState};
use async_trait::async_trait;
use cloudevents::Event;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CDEventsError {
    #[error("cdevents error: {0}")]
    Generic(String),
}

/// Trait for sending CDEvents
///
/// Production code uses `HttpEventSink` which sends events via HTTP POST.
/// Tests use `MockEventSink` which stores events in memory for assertions.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError>;
}

/// Production event sink that sends CloudEvents via HTTP POST
pub struct HttpEventSink {
    enabled: bool,
    sink_url: Option<String>,
    client: reqwest::Client,
}

impl HttpEventSink {
    /// Create a sink from `KANARI_CDEVENTS_ENABLED` / `KANARI_CDEVENTS_SINK_URL`
    pub fn from_config(config: &ControllerConfig) -> Self {
        HttpEventSink {
            enabled: config.cdevents_enabled,
            sink_url: config.cdevents_sink_url.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.sink_url.is_some()
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(url) = &self.sink_url else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|e| CDEventsError::Generic(format!("HTTP POST failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CDEventsError::Generic(format!(
                "sink returned HTTP {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
pub struct MockEventSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<Event>>>,
}

#[cfg(test)]
impl Default for MockEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        MockEventSink {
            events: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[allow(clippy::unwrap_used)]
    pub fn get_emitted_events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Event types emitted so far, in order
    pub fn event_types(&self) -> Vec<String> {
        use cloudevents::AttributesReader;
        self.get_emitted_events()
            .iter()
            .map(|e| e.ty().to_string())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Rollout milestones that produce a CDEvent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutEvent {
    /// Initial weight applied, rollout Progressing
    Deployed,
    /// Canary weight stepped up
    Upgraded,
    /// Canary promoted to all traffic
    Published,
    /// Traffic returned to stable
    RolledBack,
}

impl RolloutEvent {
    fn reason(&self) -> &'static str {
        match self {
            RolloutEvent::Deployed => "initialization",
            RolloutEvent::Upgraded => "step_advanced",
            RolloutEvent::Published => "promoted",
            RolloutEvent::RolledBack => "rolled_back",
        }
    }
}

/// Build and send the CDEvent for `event`
pub async fn emit_rollout_event(
    plan: &RolloutPlan,
    state: &RolloutState,
    event: RolloutEvent,
    sink: &dyn EventSink,
) -> Result<(), CDEventsError> {
    let cloudevent = match event {
        RolloutEvent::Deployed => build_service_deployed_event(plan, state)?,
        RolloutEvent::Upgraded => build_service_upgraded_event(plan, state)?,
        RolloutEvent::Published => build_service_published_event(plan, state)?,
        RolloutEvent::RolledBack => build_service_rolledback_event(plan, state)?,
    };
    sink.send(&cloudevent).await
}

fn invalid<E: std::fmt::Display>(field: &'static str) -> impl Fn(E) -> CDEventsError {
    move |e| CDEventsError::Generic(format!("Invalid {}: {}", field, e))
}

/// Package URL identifying a service revision
fn artifact_id(plan: &RolloutPlan, revision: &str) -> String {
    format!("pkg:generic/{}@{}", plan.service, revision)
}

fn environment_id(plan: &RolloutPlan) -> String {
    plan.target_key()
}

fn environment_source(plan: &RolloutPlan) -> String {
    format!(
        "/apis/networking.k8s.io/v1/namespaces/{}/ingresses/{}",
        plan.namespace,
        plan.canary_ingress()
    )
}

/// Build a service.deployed CDEvent
fn build_service_deployed_event(
    plan: &RolloutPlan,
    state: &RolloutState,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_deployed;
    use cdevents_sdk::{CDEvent, Subject};

    let cdevent = CDEvent::from(
        Subject::from(service_deployed::Content {
            artifact_id: artifact_id(plan, &plan.canary_revision)
                .try_into()
                .map_err(invalid("artifact_id"))?,
            environment: service_deployed::ContentEnvironment {
                id: environment_id(plan)
                    .try_into()
                    .map_err(invalid("environment id"))?,
                source: Some(
                    environment_source(plan)
                        .try_into()
                        .map_err(invalid("environment source"))?,
                ),
            },
        })
        .with_id(
            format!("/rollouts/{}/initialization", state.id)
                .try_into()
                .map_err(invalid("subject id"))?,
        )
        .with_source(
            "https://kanari.io/controller"
                .try_into()
                .map_err(invalid("subject source"))?,
        ),
    )
    .with_id(
        uuid::Uuid::new_v4()
            .to_string()
            .try_into()
            .map_err(invalid("event id"))?,
    )
    .with_source("https://kanari.io".try_into().map_err(invalid("event source"))?)
    .with_custom_data(build_kanari_custom_data(plan, state, RolloutEvent::Deployed));

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

/// Build a service.upgraded CDEvent
fn build_service_upgraded_event(
    plan: &RolloutPlan,
    state: &RolloutState,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_upgraded;
    use cdevents_sdk::{CDEvent, Subject};

    let cdevent = CDEvent::from(
        Subject::from(service_upgraded::Content {
            artifact_id: artifact_id(plan, &plan.canary_revision)
                .try_into()
                .map_err(invalid("artifact_id"))?,
            environment: service_upgraded::ContentEnvironment {
                id: environment_id(plan)
                    .try_into()
                    .map_err(invalid("environment id"))?,
                source: Some(
                    environment_source(plan)
                        .try_into()
                        .map_err(invalid("environment source"))?,
                ),
            },
        })
        .with_id(
            format!("/rollouts/{}/weight/{}", state.id, state.canary_weight())
                .try_into()
                .map_err(invalid("subject id"))?,
        )
        .with_source(
            "https://kanari.io/controller"
                .try_into()
                .map_err(invalid("subject source"))?,
        ),
    )
    .with_id(
        uuid::Uuid::new_v4()
            .to_string()
            .try_into()
            .map_err(invalid("event id"))?,
    )
    .with_source("https://kanari.io".try_into().map_err(invalid("event source"))?)
    .with_custom_data(build_kanari_custom_data(plan, state, RolloutEvent::Upgraded));

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

/// Build a service.rolledback CDEvent
///
/// The artifact is the stable revision traffic returned to.
fn build_service_rolledback_event(
    plan: &RolloutPlan,
    state: &RolloutState,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_rolledback;
    use cdevents_sdk::{CDEvent, Subject};

    let cdevent = CDEvent::from(
        Subject::from(service_rolledback::Content {
            artifact_id: artifact_id(plan, &plan.stable_revision)
                .try_into()
                .map_err(invalid("artifact_id"))?,
            environment: service_rolledback::ContentEnvironment {
                id: environment_id(plan)
                    .try_into()
                    .map_err(invalid("environment id"))?,
                source: Some(
                    environment_source(plan)
                        .try_into()
                        .map_err(invalid("environment source"))?,
                ),
            },
        })
        .with_id(
            format!("/rollouts/{}/rollback", state.id)
                .try_into()
                .map_err(invalid("subject id"))?,
        )
        .with_source(
            "https://kanari.io/controller"
                .try_into()
                .map_err(invalid("subject source"))?,
        ),
    )
    .with_id(
        uuid::Uuid::new_v4()
            .to_string()
            .try_into()
            .map_err(invalid("event id"))?,
    )
    .with_source("https://kanari.io".try_into().map_err(invalid("event source"))?)
    .with_custom_data(build_kanari_custom_data(plan, state, RolloutEvent::RolledBack));

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

/// Build a service.published CDEvent
fn build_service_published_event(
    plan: &RolloutPlan,
    state: &RolloutState,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_published;
    use cdevents_sdk::{CDEvent, Subject};

    let cdevent = CDEvent::from(
        Subject::from(service_published::Content {
            environment: Some(service_published::ContentEnvironment {
                id: environment_id(plan)
                    .try_into()
                    .map_err(invalid("environment id"))?,
                source: Some(
                    environment_source(plan)
                        .try_into()
                        .map_err(invalid("environment source"))?,
                ),
            }),
        })
        .with_id(
            format!("/rollouts/{}/promoted", state.id)
                .try_into()
                .map_err(invalid("subject id"))?,
        )
        .with_source(
            "https://kanari.io/controller"
                .try_into()
                .map_err(invalid("subject source"))?,
        ),
    )
    .with_id(
        uuid::Uuid::new_v4()
            .to_string()
            .try_into()
            .map_err(invalid("event id"))?,
    )
    .with_source("https://kanari.io".try_into().map_err(invalid("event source"))?)
    .with_custom_data(build_kanari_custom_data(plan, state, RolloutEvent::Published));

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

/// Build kanari customData for CDEvents
fn build_kanari_custom_data(
    plan: &RolloutPlan,
    state: &RolloutState,
    event: RolloutEvent,
) -> serde_json::Value {
    json!({
        "kanari": {
            "version": "v1",
            "rollout": {
                "id": state.id,
                "namespace": state.namespace,
                "service": state.service
            },
            "revisions": {
                "stable": plan.stable_revision,
                "canary": plan.canary_revision
            },
            "traffic": {
                "canary_weight": state.canary_weight(),
                "stable_weight": state.stable_weight()
            },
            "phase": state.phase.as_str(),
            "decision": {
                "reason": event.reason()
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "cdevents_test.rs"]
mod tests;
