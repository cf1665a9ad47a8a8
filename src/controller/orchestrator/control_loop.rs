//! Per-rollout control loop: sample, decide, apply

use super::registry::RolloutHandle;
use super::Context;
use crate::controller::cdevents::{emit_rollout_event, RolloutEvent};
use crate::controller::probe::{
    prune_samples, record_canary_failure, record_canary_sample, record_stable_sample,
    window_stats,
};
use crate::controller::reconciler::{ApplyMode, ReconcileError};
use crate::controller::weight::{decide, TickInput, Verdict};
use crate::model::{Decision, DecisionAction, DecisionReason, Phase, RolloutState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Run ticks every step interval until the rollout is terminal or cancelled
pub async fn run(ctx: Arc<Context>, handle: Arc<RolloutHandle>) {
    let token = handle.cancel_token();
    let interval = handle.policy.step_interval;
    info!(
        rollout = ?handle.id,
        service = %handle.plan.service,
        interval_secs = interval.as_secs(),
        "Control loop started"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(rollout = ?handle.id, "Control loop cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if tick(&ctx, &handle).await.is_terminal() {
            break;
        }
    }

    info!(rollout = ?handle.id, "Control loop stopped");
}

/// One tick of the control loop; returns the phase after the tick
///
/// Pending and terminal rollouts are left untouched.
pub async fn tick(ctx: &Context, handle: &RolloutHandle) -> Phase {
    let started = Instant::now();
    let mut state = handle.lock().await;
    if state.phase == Phase::Pending || state.is_terminal() {
        return state.phase;
    }

    let plan = &handle.plan;
    let window = handle.policy.step_interval;
    let now = ctx.clock.now();
    state.ticks += 1;

    let (canary, stable) = futures::join!(
        ctx.probe.sample(plan, &plan.canary_revision, window, now),
        ctx.probe.sample(plan, &plan.stable_revision, window, now),
    );

    match canary {
        Ok(sample) => record_canary_sample(&mut state, sample),
        Err(e) => {
            warn!(rollout = ?state.id, error = %e, "Canary probe failed");
            if let Some(metrics) = &ctx.metrics {
                metrics.record_probe_failure("canary");
            }
            record_canary_failure(&mut state, ctx.config.probe_failure_threshold, now);
        }
    }

    match stable {
        Ok(sample) => record_stable_sample(&mut state, sample),
        Err(e) => {
            debug!(rollout = ?state.id, error = %e, "Stable probe failed");
            if let Some(metrics) = &ctx.metrics {
                metrics.record_probe_failure("stable");
            }
        }
    }

    prune_samples(&mut state, now, ctx.config.sample_retention);

    let input = TickInput {
        phase: state.phase,
        canary_weight: state.canary_weight(),
        health: state.health,
        unknown_since: state.unknown_since,
        max_weight_reached_at: state.max_weight_reached_at,
        canary: window_stats(&state.samples, &plan.canary_revision, now, window),
        now,
    };
    let verdict = decide(&handle.policy, &input);
    let result = apply_verdict(ctx, handle, &mut state, verdict, now).await;

    handle.publish(&state);
    if let Some(metrics) = &ctx.metrics {
        metrics.record_tick(result, started.elapsed().as_secs_f64());
        metrics.set_canary_weight(
            &state.id,
            &state.namespace,
            &state.service,
            state.canary_weight(),
        );
    }
    state.phase
}

/// Carry out `verdict`; returns the tick result label
async fn apply_verdict(
    ctx: &Context,
    handle: &RolloutHandle,
    state: &mut RolloutState,
    verdict: Verdict,
    now: DateTime<Utc>,
) -> &'static str {
    let from = state.canary_weight();

    match verdict {
        Verdict::Hold(reason) => {
            debug!(
                rollout = ?state.id,
                phase = %state.phase,
                weight = from,
                reason = reason.as_str(),
                "Holding weight"
            );
            "hold"
        }
        Verdict::Advance { to } => {
            let mode = ApplyMode::Guarded {
                expected: Some(from),
            };
            if let Err(e) = apply(ctx, handle, state, to, mode).await {
                return on_apply_error(ctx, handle, state, e, now).await;
            }
            if to >= handle.policy.max_weight && state.max_weight_reached_at.is_none() {
                state.max_weight_reached_at = Some(now);
            }
            state.message = Some(format!("Canary weight advanced to {to}"));
            state.record(decision(
                now,
                DecisionAction::StepAdvance,
                from,
                to,
                DecisionReason::AnalysisPassed,
                None,
            ));
            info!(rollout = ?state.id, from = from, weight = to, "Canary weight advanced");
            emit(ctx, handle, state, RolloutEvent::Upgraded).await;
            "advance"
        }
        Verdict::Promote { after_bake } => {
            let mode = ApplyMode::Guarded {
                expected: Some(from),
            };
            if let Err(e) = apply(ctx, handle, state, 100, mode).await {
                return on_apply_error(ctx, handle, state, e, now).await;
            }
            let reason = if after_bake {
                DecisionReason::BakeCompleted
            } else {
                DecisionReason::AnalysisPassed
            };
            move_to(
                ctx,
                state,
                Phase::Promoted,
                now,
                "Canary promoted to all traffic",
            );
            state.record(decision(now, DecisionAction::Promote, from, 100, reason, None));
            emit(ctx, handle, state, RolloutEvent::Published).await;
            handle.cancel();
            "promote"
        }
        Verdict::Pause => {
            let message = format!(
                "Canary health unknown for longer than {}s",
                handle.policy.unknown_grace.as_secs()
            );
            move_to(ctx, state, Phase::Paused, now, message.clone());
            state.record(decision(
                now,
                DecisionAction::Pause,
                from,
                from,
                DecisionReason::ProbeUnknown,
                Some(message),
            ));
            "pause"
        }
        Verdict::Rollback { success_ratio } => {
            if let Err(e) = apply(ctx, handle, state, 0, ApplyMode::Forced).await {
                return on_apply_error(ctx, handle, state, e, now).await;
            }
            let message = format!(
                "Success ratio {:.4} below {:.4}",
                success_ratio,
                handle.policy.rollback_below()
            );
            warn!(rollout = ?state.id, success_ratio = success_ratio, "Rolling back canary");
            move_to(ctx, state, Phase::RolledBack, now, message.clone());
            state.record(decision(
                now,
                DecisionAction::Rollback,
                from,
                0,
                DecisionReason::AnalysisFailed,
                Some(message),
            ));
            emit(ctx, handle, state, RolloutEvent::RolledBack).await;
            handle.cancel();
            "rollback"
        }
    }
}

/// Conflicts pause the rollout for the operator; anything else fails it
async fn on_apply_error(
    ctx: &Context,
    handle: &RolloutHandle,
    state: &mut RolloutState,
    err: ReconcileError,
    now: DateTime<Utc>,
) -> &'static str {
    let weight = state.canary_weight();
    match err {
        ReconcileError::Conflict(reason) => {
            let message = format!("Paused on conflicting ingress change: {reason}");
            if state.phase == Phase::Progressing {
                move_to(ctx, state, Phase::Paused, now, message.clone());
            } else {
                state.message = Some(message.clone());
            }
            state.record(decision(
                now,
                DecisionAction::Pause,
                weight,
                weight,
                DecisionReason::ExternalConflict,
                Some(message),
            ));
            "conflict"
        }
        ReconcileError::Apply(reason) => {
            error!(rollout = ?state.id, error = %reason, "Weight apply failed");
            move_to(
                ctx,
                state,
                Phase::Failed,
                now,
                format!("Apply failed: {reason}"),
            );
            state.record(decision(
                now,
                DecisionAction::Fail,
                weight,
                weight,
                DecisionReason::ApplyFailed,
                Some(reason),
            ));
            handle.cancel();
            "failed"
        }
    }
}

/// Apply `weight` to the ingress pair and mirror it on the state
pub(super) async fn apply(
    ctx: &Context,
    handle: &RolloutHandle,
    state: &mut RolloutState,
    weight: i32,
    mode: ApplyMode,
) -> Result<(), ReconcileError> {
    let result = ctx
        .reconciler
        .apply_weight(&handle.plan, &state.id, weight, mode)
        .await;

    if let Some(metrics) = &ctx.metrics {
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(ReconcileError::Conflict(_)) => "conflict",
            Err(ReconcileError::Apply(_)) => "error",
        };
        metrics.record_apply(outcome);
    }

    result?;
    state.set_canary_weight(weight);
    Ok(())
}

/// Transition `state` to `next`, counting the change
pub(super) fn move_to(
    ctx: &Context,
    state: &mut RolloutState,
    next: Phase,
    now: DateTime<Utc>,
    message: impl Into<String>,
) {
    let from = state.phase;
    match state.transition(next, now, message) {
        Ok(()) if from != next => {
            info!(rollout = ?state.id, from = %from, phase = %next, "Rollout phase changed");
            if let Some(metrics) = &ctx.metrics {
                metrics.record_transition(from.as_str(), next.as_str());
            }
        }
        Ok(()) => {}
        Err(e) => error!(rollout = ?state.id, error = %e, "Phase transition rejected"),
    }
}

pub(super) fn decision(
    timestamp: DateTime<Utc>,
    action: DecisionAction,
    from_weight: i32,
    to_weight: i32,
    reason: DecisionReason,
    message: Option<String>,
) -> Decision {
    Decision {
        timestamp,
        action,
        from_weight,
        to_weight,
        reason,
        message,
    }
}

/// Emit a CDEvent; failures never affect the rollout
pub(super) async fn emit(
    ctx: &Context,
    handle: &RolloutHandle,
    state: &RolloutState,
    event: RolloutEvent,
) {
    if let Err(e) =
        emit_rollout_event(&handle.plan, state, event, ctx.cdevents_sink.as_ref()).await
    {
        warn!(rollout = ?state.id, error = %e, "Failed to emit CDEvent (non-fatal)");
    }
}
