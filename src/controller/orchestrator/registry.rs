//! Per-rollout-id keyed store of live rollouts

use crate::controller::clock::has_elapsed;
use crate::controller::weight::Policy;
use crate::model::{RolloutPlan, RolloutState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// One registered rollout
///
/// Every mutation happens under `state`; readers use the published snapshot
/// and never wait on a tick in progress.
pub struct RolloutHandle {
    pub id: String,
    pub plan: RolloutPlan,
    pub policy: Policy,
    state: Mutex<RolloutState>,
    snapshot: watch::Sender<RolloutState>,
    cancel: CancellationToken,
}

impl RolloutHandle {
    /// `parent` is the process shutdown token
    pub fn new(
        plan: RolloutPlan,
        policy: Policy,
        state: RolloutState,
        parent: &CancellationToken,
    ) -> Self {
        let (snapshot, _) = watch::channel(state.clone());
        RolloutHandle {
            id: state.id.clone(),
            plan,
            policy,
            state: Mutex::new(state),
            snapshot,
            cancel: parent.child_token(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, RolloutState> {
        self.state.lock().await
    }

    /// Make `state` visible to readers
    pub fn publish(&self, state: &RolloutState) {
        self.snapshot.send_replace(state.clone());
    }

    /// Latest published state
    pub fn snapshot(&self) -> RolloutState {
        self.snapshot.borrow().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the control loop at its next tick boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
pub struct Registry {
    rollouts: RwLock<HashMap<String, Arc<RolloutHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RolloutHandle>> {
        self.rollouts.read().await.get(id).cloned()
    }

    /// Id of the non-terminal rollout targeting `target_key`, if any
    pub async fn active_for(&self, target_key: &str) -> Option<String> {
        let rollouts = self.rollouts.read().await;
        find_active(&rollouts, target_key)
    }

    /// Register `handle` unless another non-terminal rollout targets the same service
    ///
    /// Returns the id of the rollout already holding the target on refusal.
    pub async fn insert_unless_active(&self, handle: Arc<RolloutHandle>) -> Result<(), String> {
        let mut rollouts = self.rollouts.write().await;
        if let Some(existing) = find_active(&rollouts, &handle.plan.target_key()) {
            return Err(existing);
        }
        rollouts.insert(handle.id.clone(), handle);
        Ok(())
    }

    pub async fn snapshots(&self) -> Vec<RolloutState> {
        self.rollouts
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    /// Remove terminal rollouts whose last transition is older than `retention`
    pub async fn prune(&self, now: DateTime<Utc>, retention: Duration) -> Vec<RolloutState> {
        let mut rollouts = self.rollouts.write().await;
        let expired: Vec<String> = rollouts
            .iter()
            .filter(|(_, handle)| {
                let state = handle.snapshot();
                state.is_terminal() && has_elapsed(state.last_transition_time, now, retention)
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| rollouts.remove(id))
            .map(|handle| {
                handle.cancel();
                handle.snapshot()
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rollouts.read().await.len()
    }
}

fn find_active(rollouts: &HashMap<String, Arc<RolloutHandle>>, target_key: &str) -> Option<String> {
    rollouts
        .values()
        .find(|h| h.plan.target_key() == target_key && !h.snapshot().is_terminal())
        .map(|h| h.id.clone())
}
