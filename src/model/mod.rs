//! Rollout data model
//!
//! `RolloutPlan` is the operator's immutable request; `RolloutState` is the
//! controller-owned live view of one rollout.

pub mod plan;
pub mod state;

pub use plan::{IngressRefs, IngressRouting, RolloutPlan};
pub use state::{
    Decision, DecisionAction, DecisionReason, Health, MetricSample, Phase, RolloutState,
    TransitionError,
};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "plan_test.rs"]
mod plan_tests;
