//! Weight Controller
//!
//! Pure decision function over a rollout's phase, weight, probe health and
//! the latest analysis window. The orchestrator applies the returned
//! [`Verdict`] through the reconciler and then commits it to the state.

use crate::config::ControllerConfig;
use crate::controller::clock::has_elapsed;
use crate::controller::probe::WindowStats;
use crate::controller::validation::parse_duration;
use crate::model::{Health, Phase, RolloutPlan};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Thresholds governing one rollout, resolved from its plan and the controller config
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub step_size: i32,
    pub max_weight: i32,
    pub success_threshold: f64,
    pub hysteresis_margin: f64,
    pub step_interval: Duration,
    pub bake_duration: Duration,
    pub unknown_grace: Duration,
    pub max_latency_ms: Option<f64>,
}

impl Policy {
    /// Resolve the policy for a validated plan
    pub fn from_plan(plan: &RolloutPlan, config: &ControllerConfig) -> Self {
        let bake_duration = plan
            .bake_duration
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(config.bake_duration);

        Policy {
            step_size: plan.step_size,
            max_weight: plan.max_weight,
            success_threshold: plan.success_threshold,
            hysteresis_margin: config.hysteresis_margin,
            step_interval: parse_duration(&plan.step_interval).unwrap_or(Duration::from_secs(60)),
            bake_duration,
            unknown_grace: config.unknown_grace,
            max_latency_ms: plan.max_latency_ms,
        }
    }

    /// Ratio below which the rollout is rolled back
    pub fn rollback_below(&self) -> f64 {
        self.success_threshold - self.hysteresis_margin
    }
}

/// Everything `decide` looks at for one tick
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub phase: Phase,
    pub canary_weight: i32,
    pub health: Health,
    pub unknown_since: Option<DateTime<Utc>>,
    pub max_weight_reached_at: Option<DateTime<Utc>>,
    /// Canary statistics over the latest analysis window
    pub canary: Option<WindowStats>,
    pub now: DateTime<Utc>,
}

/// Why a tick left the weight where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    NotProgressing,
    AwaitingGrace,
    NoSamples,
    WithinHysteresis,
    LatencyAboveLimit,
    Baking,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::NotProgressing => "not progressing",
            HoldReason::AwaitingGrace => "canary health unknown, within grace period",
            HoldReason::NoSamples => "no canary samples in analysis window",
            HoldReason::WithinHysteresis => "success ratio within hysteresis band",
            HoldReason::LatencyAboveLimit => "canary latency above limit",
            HoldReason::Baking => "baking at max weight",
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Hold(HoldReason),
    /// Step the canary weight up to `to`
    Advance { to: i32 },
    /// Cut all traffic over to the canary
    Promote { after_bake: bool },
    /// Freeze progression (Unknown health outlived the grace period)
    Pause,
    /// Return all traffic to stable
    Rollback { success_ratio: f64 },
}

/// Decide the next step for a rollout
///
/// Progressing, in order:
/// 1. Unknown health pauses once the grace period has elapsed, else holds
/// 2. an empty analysis window holds
/// 3. a ratio below `threshold - margin` rolls back
/// 4. a ratio in the hysteresis band holds
/// 5. latency above `maxLatencyMs` holds
/// 6. below max weight: advance by one step (capped), promoting in the same
///    tick when max is reached and the bake duration is zero
/// 7. at max weight: promote once the bake duration has elapsed
///
/// Paused rollouts only react to a rollback-worthy breach.
pub fn decide(policy: &Policy, input: &TickInput) -> Verdict {
    match input.phase {
        Phase::Progressing => decide_progressing(policy, input),
        Phase::Paused => match input.canary {
            Some(stats) if stats.success_ratio < policy.rollback_below() => Verdict::Rollback {
                success_ratio: stats.success_ratio,
            },
            _ => Verdict::Hold(HoldReason::NotProgressing),
        },
        _ => Verdict::Hold(HoldReason::NotProgressing),
    }
}

fn decide_progressing(policy: &Policy, input: &TickInput) -> Verdict {
    if input.health == Health::Unknown {
        let since = input.unknown_since.unwrap_or(input.now);
        if has_elapsed(since, input.now, policy.unknown_grace) {
            return Verdict::Pause;
        }
        return Verdict::Hold(HoldReason::AwaitingGrace);
    }

    let Some(stats) = input.canary else {
        return Verdict::Hold(HoldReason::NoSamples);
    };

    if stats.success_ratio < policy.rollback_below() {
        return Verdict::Rollback {
            success_ratio: stats.success_ratio,
        };
    }
    if stats.success_ratio < policy.success_threshold {
        return Verdict::Hold(HoldReason::WithinHysteresis);
    }
    if let Some(limit) = policy.max_latency_ms {
        if stats.latency_ms > limit {
            return Verdict::Hold(HoldReason::LatencyAboveLimit);
        }
    }

    if input.canary_weight < policy.max_weight {
        let to = (input.canary_weight + policy.step_size).min(policy.max_weight);
        if to == policy.max_weight && policy.bake_duration.is_zero() {
            return Verdict::Promote { after_bake: false };
        }
        return Verdict::Advance { to };
    }

    match input.max_weight_reached_at {
        Some(reached) if has_elapsed(reached, input.now, policy.bake_duration) => {
            Verdict::Promote { after_bake: true }
        }
        Some(_) => Verdict::Hold(HoldReason::Baking),
        // Max weight without a recorded bake start (initial weight == max)
        None if policy.bake_duration.is_zero() => Verdict::Promote { after_bake: false },
        None => Verdict::Hold(HoldReason::Baking),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "weight_test.rs"]
mod tests;
