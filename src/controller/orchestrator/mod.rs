//! Rollout Orchestrator
//!
//! Owns the registry of live rollouts and exposes the operator commands.
//! Commands and control loop ticks for one rollout serialize on that
//! rollout's state lock; distinct rollouts run independently.

pub mod control_loop;
pub mod registry;

use crate::config::ControllerConfig;
use crate::controller::cdevents::{EventSink, RolloutEvent};
use crate::controller::clock::Clock;
use crate::controller::probe::{record_stable_sample, MetricsProbe, ProbeError};
use crate::controller::prometheus::MetricsQuerier;
use crate::controller::reconciler::{
    ApplyMode, IngressApi, ManifestReconciler, ReconcileError,
};
use crate::controller::validation::{validate_plan, PlanValidationError};
use crate::controller::weight::Policy;
use crate::error::ErrorKind;
use crate::model::{DecisionAction, DecisionReason, Health, Phase, RolloutPlan, RolloutState};
use crate::server::SharedMetrics;
use control_loop::{apply, decision, emit, move_to};
use registry::{Registry, RolloutHandle};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid plan: {0}")]
    Validation(#[from] PlanValidationError),

    #[error("rollout {0} not found")]
    NotFound(String),

    #[error("rollout {id} is already active for {target}")]
    AlreadyActive { target: String, id: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Apply(String),

    #[error(transparent)]
    ProbeUnavailable(#[from] ProbeError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::PlanValidation,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::AlreadyActive { .. } | OrchestratorError::InvalidState(_) => {
                ErrorKind::InvalidState
            }
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::Apply(_) => ErrorKind::Apply,
            OrchestratorError::ProbeUnavailable(_) => ErrorKind::ProbeUnavailable,
        }
    }
}

impl From<ReconcileError> for OrchestratorError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Conflict(reason) => OrchestratorError::Conflict(reason),
            ReconcileError::Apply(reason) => OrchestratorError::Apply(reason),
        }
    }
}

/// Collaborators shared by every rollout
pub struct Context {
    pub reconciler: ManifestReconciler,
    pub probe: MetricsProbe,
    pub cdevents_sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// When Some, ticks, applies and transitions are counted
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        ingress_api: Arc<dyn IngressApi>,
        prometheus_client: Arc<dyn MetricsQuerier>,
        cdevents_sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            reconciler: ManifestReconciler::from_config(ingress_api, &config),
            probe: MetricsProbe::new(prometheus_client),
            cdevents_sink,
            clock,
            config,
            metrics,
        }
    }
}

pub struct Orchestrator {
    ctx: Arc<Context>,
    registry: Registry,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Control loops are cancelled together with `shutdown`
    pub fn new(ctx: Arc<Context>, shutdown: CancellationToken) -> Self {
        Orchestrator {
            ctx,
            registry: Registry::new(),
            shutdown,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Validate, register and activate a rollout
    ///
    /// The initial weight is applied before this returns. A conflict leaves
    /// the rollout Pending (resume retries); an apply failure moves it to
    /// Failed. Both are still reported as errors.
    pub async fn start(&self, plan: RolloutPlan) -> Result<RolloutState, OrchestratorError> {
        validate_plan(&plan)?;

        let target = plan.target_key();
        if let Some(id) = self.registry.active_for(&target).await {
            return Err(OrchestratorError::AlreadyActive { target, id });
        }

        let policy = Policy::from_plan(&plan, &self.ctx.config);
        let now = self.ctx.clock.now();

        // Refuse to start blind: the stable revision must be observable
        let preflight = self
            .ctx
            .probe
            .sample(&plan, &plan.stable_revision, policy.step_interval, now)
            .await
            .map_err(|e| {
                warn!(service = %plan.service, error = %e, "Metrics preflight failed");
                e
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut state = RolloutState::new(id.clone(), &plan, now);
        record_stable_sample(&mut state, preflight);

        let handle = Arc::new(RolloutHandle::new(plan, policy, state, &self.shutdown));
        if let Err(existing) = self.registry.insert_unless_active(handle.clone()).await {
            return Err(OrchestratorError::AlreadyActive {
                target,
                id: existing,
            });
        }
        info!(
            rollout = ?id,
            service = %handle.plan.service,
            namespace = %handle.plan.namespace,
            "Rollout registered"
        );

        let mut state = handle.lock().await;
        let result = self.activate(&handle, &mut state).await;
        handle.publish(&state);
        result.map(|()| state.clone())
    }

    /// Apply the initial weight of a Pending rollout and start its loop
    async fn activate(
        &self,
        handle: &Arc<RolloutHandle>,
        state: &mut RolloutState,
    ) -> Result<(), OrchestratorError> {
        let now = self.ctx.clock.now();
        let weight = handle.plan.initial_weight;
        let mode = ApplyMode::Guarded { expected: None };

        match apply(&self.ctx, handle, state, weight, mode).await {
            Ok(()) => {
                if weight >= handle.policy.max_weight {
                    state.max_weight_reached_at = Some(now);
                }
                move_to(
                    &self.ctx,
                    state,
                    Phase::Progressing,
                    now,
                    format!("Initial weight {weight} applied"),
                );
                state.record(decision(
                    now,
                    DecisionAction::Start,
                    0,
                    weight,
                    DecisionReason::Initialization,
                    None,
                ));
                emit(&self.ctx, handle, state, RolloutEvent::Deployed).await;
                tokio::spawn(control_loop::run(self.ctx.clone(), handle.clone()));
                Ok(())
            }
            Err(ReconcileError::Conflict(reason)) => {
                warn!(rollout = ?state.id, reason = %reason, "Rollout left Pending on conflict");
                state.message = Some(format!("Waiting on conflicting ingress change: {reason}"));
                Err(OrchestratorError::Conflict(format!(
                    "rollout {} left Pending: {}",
                    state.id, reason
                )))
            }
            Err(ReconcileError::Apply(reason)) => {
                error!(rollout = ?state.id, error = %reason, "Initial weight apply failed");
                move_to(
                    &self.ctx,
                    state,
                    Phase::Failed,
                    now,
                    format!("Apply failed: {reason}"),
                );
                state.record(decision(
                    now,
                    DecisionAction::Fail,
                    0,
                    0,
                    DecisionReason::ApplyFailed,
                    Some(reason.clone()),
                ));
                handle.cancel();
                Err(OrchestratorError::Apply(format!(
                    "rollout {} failed: {}",
                    state.id, reason
                )))
            }
        }
    }

    /// Freeze weight progression
    pub async fn pause(&self, id: &str) -> Result<RolloutState, OrchestratorError> {
        let handle = self.handle(id).await?;
        let mut state = handle.lock().await;
        let now = self.ctx.clock.now();

        match state.phase {
            Phase::Paused => {}
            Phase::Progressing => {
                let weight = state.canary_weight();
                move_to(&self.ctx, &mut state, Phase::Paused, now, "Paused by operator");
                state.record(decision(
                    now,
                    DecisionAction::Pause,
                    weight,
                    weight,
                    DecisionReason::ManualPause,
                    None,
                ));
            }
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "cannot pause rollout {id} in phase {other}"
                )))
            }
        }

        handle.publish(&state);
        Ok(state.clone())
    }

    /// Continue a Paused rollout, or retry activating a Pending one
    pub async fn resume(&self, id: &str) -> Result<RolloutState, OrchestratorError> {
        let handle = self.handle(id).await?;
        let mut state = handle.lock().await;
        let now = self.ctx.clock.now();

        match state.phase {
            Phase::Progressing => {}
            Phase::Paused => {
                let weight = state.canary_weight();
                state.health = Health::Reporting;
                state.probe_failures = 0;
                state.unknown_since = None;
                move_to(
                    &self.ctx,
                    &mut state,
                    Phase::Progressing,
                    now,
                    "Resumed by operator",
                );
                state.record(decision(
                    now,
                    DecisionAction::Resume,
                    weight,
                    weight,
                    DecisionReason::ManualResume,
                    None,
                ));
            }
            Phase::Pending => {
                if let Err(e) = self.activate(&handle, &mut state).await {
                    handle.publish(&state);
                    return Err(e);
                }
            }
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "cannot resume rollout {id} in phase {other}"
                )))
            }
        }

        handle.publish(&state);
        Ok(state.clone())
    }

    /// Return all traffic to stable and end the rollout
    ///
    /// Aborting a RolledBack rollout returns it unchanged.
    pub async fn abort(&self, id: &str) -> Result<RolloutState, OrchestratorError> {
        let handle = self.handle(id).await?;
        let mut state = handle.lock().await;
        let now = self.ctx.clock.now();
        let from = state.canary_weight();

        match state.phase {
            Phase::RolledBack => return Ok(state.clone()),
            Phase::Promoted | Phase::Failed => {
                return Err(OrchestratorError::InvalidState(format!(
                    "cannot abort rollout {id} in phase {}",
                    state.phase
                )))
            }
            // Never applied a weight, so there is no traffic to take back
            Phase::Pending => {}
            Phase::Progressing | Phase::Paused => {
                if let Err(e) = apply(&self.ctx, &handle, &mut state, 0, ApplyMode::Forced).await {
                    error!(rollout = ?id, error = %e, "Abort could not reset ingress weight");
                    state.message = Some(format!("Abort failed: {e}"));
                    handle.publish(&state);
                    return Err(e.into());
                }
            }
        }

        move_to(
            &self.ctx,
            &mut state,
            Phase::RolledBack,
            now,
            "Aborted by operator",
        );
        state.record(decision(
            now,
            DecisionAction::Rollback,
            from,
            0,
            DecisionReason::ManualAbort,
            None,
        ));
        emit(&self.ctx, &handle, &state, RolloutEvent::RolledBack).await;
        handle.cancel();

        handle.publish(&state);
        Ok(state.clone())
    }

    /// Latest published state; never waits for a tick in progress
    pub async fn status(&self, id: &str) -> Result<RolloutState, OrchestratorError> {
        Ok(self.handle(id).await?.snapshot())
    }

    /// All registered rollouts, oldest first
    pub async fn list(&self) -> Vec<RolloutState> {
        let mut states = self.registry.snapshots().await;
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        states
    }

    /// Drop terminal rollouts older than the configured retention
    pub async fn prune_expired(&self) -> usize {
        let removed = self
            .registry
            .prune(self.ctx.clock.now(), self.ctx.config.retention)
            .await;
        for state in &removed {
            info!(rollout = ?state.id, phase = %state.phase, "Pruned expired rollout");
            if let Some(metrics) = &self.ctx.metrics {
                metrics.forget_rollout(&state.id, &state.namespace, &state.service);
            }
        }
        removed.len()
    }

    /// Prune expired rollouts every `interval` until shutdown
    pub async fn run_janitor(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.prune_expired().await;
                    self.refresh_gauges().await;
                }
            }
        }
    }

    /// Update gauges derived from the registry
    pub async fn refresh_gauges(&self) {
        if let Some(metrics) = &self.ctx.metrics {
            let active = self
                .registry
                .snapshots()
                .await
                .iter()
                .filter(|s| !s.is_terminal())
                .count();
            metrics.set_active_rollouts(active);
        }
    }

    /// Cancel every control loop
    pub fn shutdown(&self) {
        info!("Stopping rollout control loops");
        self.shutdown.cancel();
    }

    async fn handle(&self, id: &str) -> Result<Arc<RolloutHandle>, OrchestratorError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "orchestrator_test.rs"]
mod tests;
