use super::plan::RolloutPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of decisions kept in `RolloutState::decisions`
pub const MAX_DECISIONS: usize = 50;

/// Phase of a rollout
///
/// Promoted, RolledBack and Failed are terminal: nothing leaves them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Registered, initial weight not applied yet
    #[default]
    Pending,
    /// Weight is being stepped towards max weight
    Progressing,
    /// Weight frozen by the operator or by unknown canary health
    Paused,
    /// Canary took over all traffic
    Promoted,
    /// All traffic returned to stable
    RolledBack,
    /// Unrecoverable reconciliation error
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Promoted | Phase::RolledBack | Phase::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Re-entering Progressing from Progressing is allowed (weight step).
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Promoted | RolledBack | Failed, _) => false,
            (Pending, Progressing | RolledBack | Failed) => true,
            (Progressing, Progressing | Paused | Promoted | RolledBack | Failed) => true,
            (Paused, Progressing | RolledBack | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Progressing => "Progressing",
            Phase::Paused => "Paused",
            Phase::Promoted => "Promoted",
            Phase::RolledBack => "RolledBack",
            Phase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canary probe health as seen by the Metrics Probe
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Health {
    /// Samples are arriving
    #[default]
    Reporting,
    /// Too many consecutive probe failures; progression is frozen
    Unknown,
}

/// One metrics observation of a revision
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub revision: String,
    /// Non-5xx requests / all requests (0.0-1.0)
    #[serde(rename = "successRatio")]
    pub success_ratio: f64,
    /// p95 request latency in milliseconds
    #[serde(rename = "latencyMs")]
    pub latency_ms: f64,
}

/// Action taken by the controller
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionAction {
    Start,
    StepAdvance,
    Pause,
    Resume,
    Promote,
    Rollback,
    Fail,
}

/// Why an action was taken
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    Initialization,
    AnalysisPassed,
    AnalysisFailed,
    ProbeUnknown,
    BakeCompleted,
    ManualPause,
    ManualResume,
    ManualAbort,
    ExternalConflict,
    ApplyFailed,
}

/// Decision record for observability
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub action: DecisionAction,
    #[serde(rename = "fromWeight")]
    pub from_weight: i32,
    #[serde(rename = "toWeight")]
    pub to_weight: i32,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("transition {from} -> {to} is not allowed")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Live state of one rollout
///
/// Canary and stable weights are private so they can only change together.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RolloutState {
    pub id: String,
    pub namespace: String,
    pub service: String,

    #[serde(rename = "canaryWeight")]
    canary_weight: i32,

    #[serde(rename = "stableWeight")]
    stable_weight: i32,

    pub phase: Phase,

    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    pub health: Health,

    /// Consecutive canary probe failures
    #[serde(rename = "probeFailures", default)]
    pub probe_failures: u32,

    #[serde(
        rename = "unknownSince",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unknown_since: Option<DateTime<Utc>>,

    /// Start of the bake period
    #[serde(
        rename = "maxWeightReachedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_weight_reached_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ticks: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<MetricSample>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,
}

impl RolloutState {
    /// Fresh Pending state with all traffic on stable
    pub fn new(id: String, plan: &RolloutPlan, now: DateTime<Utc>) -> Self {
        RolloutState {
            id,
            namespace: plan.namespace.clone(),
            service: plan.service.clone(),
            canary_weight: 0,
            stable_weight: 100,
            phase: Phase::Pending,
            last_transition_time: now,
            created_at: now,
            health: Health::Reporting,
            probe_failures: 0,
            unknown_since: None,
            max_weight_reached_at: None,
            ticks: 0,
            message: Some("Rollout registered".to_string()),
            samples: Vec::new(),
            decisions: Vec::new(),
        }
    }

    pub fn canary_weight(&self) -> i32 {
        self.canary_weight
    }

    pub fn stable_weight(&self) -> i32 {
        self.stable_weight
    }

    /// Set the canary weight; stable always receives the remainder
    pub fn set_canary_weight(&mut self, weight: i32) {
        let weight = weight.clamp(0, 100);
        self.canary_weight = weight;
        self.stable_weight = 100 - weight;
    }

    /// Move to `next`, enforcing the state machine
    pub fn transition(
        &mut self,
        next: Phase,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        if self.phase != next {
            self.last_transition_time = now;
        }
        self.phase = next;
        self.message = Some(message.into());
        Ok(())
    }

    /// Append to the decision history, dropping the oldest beyond the cap
    pub fn record(&mut self, decision: Decision) {
        self.decisions.push(decision);
        if self.decisions.len() > MAX_DECISIONS {
            let excess = self.decisions.len() - MAX_DECISIONS;
            self.decisions.drain(..excess);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
