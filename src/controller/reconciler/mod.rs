//! Manifest Reconciler
//!
//! Turns a desired canary weight into annotation patches on the NGINX
//! canary Ingress pair. Applies are idempotent, conflicting external edits
//! surface as [`ReconcileError::Conflict`] and transient API failures are
//! retried with bounded exponential backoff.

pub mod backoff;
pub mod ingress;
pub mod manifest;

pub use backoff::Backoff;
pub use ingress::{ClusterError, IngressApi, KubeIngressApi};

use crate::config::ControllerConfig;
use crate::model::{IngressRouting, RolloutPlan};
use k8s_openapi::api::networking::v1::Ingress;
use manifest::{
    build_canary_ingress, build_stable_ingress, canary_annotations, stable_annotations,
    APPLIED_WEIGHT_ANNOTATION, CANARY_WEIGHT_ANNOTATION, ROLLOUT_ID_ANNOTATION,
    STABLE_WEIGHT_ANNOTATION,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Someone else changed the ingress weight; never overwritten in guarded mode
    #[error("conflicting external change: {0}")]
    Conflict(String),

    /// The weight could not be applied (missing ingress, rejected patch, retries exhausted)
    #[error("apply failed: {0}")]
    Apply(String),
}

/// How much the reconciler trusts what it observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Refuse to apply over an external edit
    ///
    /// `expected` is the weight this rollout applied last; None before the
    /// first apply, when only the annotations' internal consistency is checked.
    Guarded { expected: Option<i32> },
    /// Apply regardless of the observed weights (rollback and abort)
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Both ingresses already carried the desired weight
    Unchanged,
    Patched,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Patched => "patched",
        }
    }
}

pub struct ManifestReconciler {
    api: Arc<dyn IngressApi>,
    apply_timeout: Duration,
    backoff: Backoff,
}

impl ManifestReconciler {
    pub fn new(api: Arc<dyn IngressApi>, apply_timeout: Duration, backoff: Backoff) -> Self {
        ManifestReconciler {
            api,
            apply_timeout,
            backoff,
        }
    }

    pub fn from_config(api: Arc<dyn IngressApi>, config: &ControllerConfig) -> Self {
        Self::new(
            api,
            config.apply_timeout,
            Backoff::new(
                config.apply_backoff_base,
                config.apply_backoff_max,
                config.apply_max_retries,
            ),
        )
    }

    /// Apply canary `weight` (stable gets `100 - weight`) for `plan`
    ///
    /// Re-applying the weight the ingresses already carry sends no patch.
    pub async fn apply_weight(
        &self,
        plan: &RolloutPlan,
        rollout_id: &str,
        weight: i32,
        mode: ApplyMode,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let weight = weight.clamp(0, 100);
        let namespace = plan.namespace.as_str();
        let canary_name = plan.canary_ingress();
        let stable_name = plan.stable_ingress();

        if let Some(routing) = &plan.routing {
            self.ensure_ingresses(plan, routing, rollout_id).await?;
        }

        let canary = self.get(namespace, &canary_name).await?;
        let stable = self.get(namespace, &stable_name).await?;

        if let ApplyMode::Guarded { expected } = mode {
            let conflict = if finishes_own_apply(&canary, rollout_id, weight) {
                None
            } else {
                detect_conflict(&canary, &stable, expected)
            };
            if let Some(reason) = conflict {
                warn!(
                    rollout = ?rollout_id,
                    ingress = %canary_name,
                    weight = weight,
                    reason = %reason,
                    "Refusing to overwrite external ingress change"
                );
                return Err(ReconcileError::Conflict(reason));
            }
        }

        let canary_wanted = canary_annotations(weight, Some(rollout_id));
        let stable_wanted = stable_annotations(weight);
        let canary_current = has_annotations(&canary, &canary_annotations(weight, None));
        let stable_current = has_annotations(&stable, &stable_wanted);

        if canary_current && stable_current {
            debug!(rollout = ?rollout_id, weight = weight, "Ingress weights already applied");
            return Ok(ApplyOutcome::Unchanged);
        }

        if !canary_current {
            self.patch(namespace, &canary_name, &canary_wanted, &canary, mode)
                .await?;
        }
        if !stable_current {
            let result = self
                .patch(namespace, &stable_name, &stable_wanted, &stable, mode)
                .await;
            if let Err(e) = result {
                if !canary_current {
                    self.revert_canary(namespace, &canary_name, &canary, rollout_id)
                        .await;
                }
                return Err(e);
            }
        }

        info!(
            rollout = ?rollout_id,
            namespace = %namespace,
            canary_ingress = %canary_name,
            canary_weight = weight,
            stable_weight = 100 - weight,
            "Applied ingress weights"
        );
        Ok(ApplyOutcome::Patched)
    }

    /// Restore the canary annotations read in `previous` after the stable
    /// side of an apply failed
    ///
    /// If this fails too, the canary keeps the new weight under this
    /// rollout's id and the next guarded apply of that weight completes it.
    async fn revert_canary(
        &self,
        namespace: &str,
        name: &str,
        previous: &Ingress,
        rollout_id: &str,
    ) {
        let weight = weight_annotation(previous, CANARY_WEIGHT_ANNOTATION)
            .ok()
            .flatten()
            .unwrap_or(0);
        let mut restore = canary_annotations(weight, annotation(previous, ROLLOUT_ID_ANNOTATION));
        if let Ok(Some(applied)) = weight_annotation(previous, APPLIED_WEIGHT_ANNOTATION) {
            restore.insert(APPLIED_WEIGHT_ANNOTATION.to_string(), applied.to_string());
        }

        let result = match self.get(namespace, name).await {
            Ok(current) => {
                self.patch(namespace, name, &restore, &current, ApplyMode::Forced)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => warn!(
                rollout = ?rollout_id,
                ingress = %name,
                weight = weight,
                "Stable ingress patch failed, canary weight reverted"
            ),
            Err(e) => error!(
                rollout = ?rollout_id,
                ingress = %name,
                error = %e,
                "Could not revert canary weight after stable patch failed"
            ),
        }
    }

    /// Create whichever ingress of the pair is missing
    ///
    /// New ingresses start with all traffic on stable.
    pub async fn ensure_ingresses(
        &self,
        plan: &RolloutPlan,
        routing: &IngressRouting,
        rollout_id: &str,
    ) -> Result<(), ReconcileError> {
        let pair = [
            (
                plan.stable_ingress(),
                build_stable_ingress(plan, routing, 0),
                "stable",
            ),
            (
                plan.canary_ingress(),
                build_canary_ingress(plan, routing, 0, Some(rollout_id)),
                "canary",
            ),
        ];

        for (name, manifest, role) in pair {
            match self
                .with_retry("get ingress", || self.api.get(&plan.namespace, &name))
                .await
            {
                Ok(_) => {}
                Err(ClusterError::NotFound(_)) => {
                    info!(
                        ingress = %name,
                        role = role,
                        namespace = %plan.namespace,
                        "Creating ingress"
                    );
                    match self
                        .with_retry("create ingress", || {
                            self.api.create(&plan.namespace, &manifest)
                        })
                        .await
                    {
                        // Lost a race with someone creating it
                        Ok(_) | Err(ClusterError::Conflict(_)) => {}
                        Err(e) => return Err(apply_error(&plan.namespace, &name, e)),
                    }
                }
                Err(e) => return Err(apply_error(&plan.namespace, &name, e)),
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress, ReconcileError> {
        self.with_retry("get ingress", || self.api.get(namespace, name))
            .await
            .map_err(|e| apply_error(namespace, name, e))
    }

    /// Patch one ingress under the resourceVersion read in `observed`
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
        observed: &Ingress,
        mode: ApplyMode,
    ) -> Result<(), ReconcileError> {
        let mut resource_version = observed.metadata.resource_version.clone();
        let mut conflicts = 0;

        loop {
            let result = self
                .with_retry("patch ingress", || {
                    self.api.patch_annotations(
                        namespace,
                        name,
                        annotations,
                        resource_version.as_deref(),
                    )
                })
                .await;

            let message = match result {
                Ok(_) => return Ok(()),
                Err(ClusterError::Conflict(message)) => message,
                Err(e) => return Err(apply_error(namespace, name, e)),
            };

            // A timed-out attempt may have landed before the retry
            let current = self.get(namespace, name).await?;
            if has_annotations(&current, annotations) {
                return Ok(());
            }

            match mode {
                ApplyMode::Guarded { .. } => {
                    return Err(ReconcileError::Conflict(format!(
                        "ingress {namespace}/{name} changed during apply: {message}"
                    )));
                }
                ApplyMode::Forced if conflicts < self.backoff.max_retries => {
                    conflicts += 1;
                    debug!(
                        ingress = %name,
                        attempt = conflicts,
                        "Re-read after conflict, forcing patch"
                    );
                    resource_version = current.metadata.resource_version.clone();
                }
                ApplyMode::Forced => {
                    return Err(ReconcileError::Apply(format!(
                        "ingress {namespace}/{name} kept changing during forced apply"
                    )));
                }
            }
        }
    }

    /// Run `op` with the apply timeout, retrying transient errors with backoff
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(self.apply_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ClusterError::Transient(format!(
                    "{operation} timed out after {:?}",
                    self.apply_timeout
                ))),
            };

            match result {
                Err(e) if e.is_transient() && retry < self.backoff.max_retries => {
                    let delay = self.backoff.delay(retry);
                    retry += 1;
                    warn!(
                        operation = operation,
                        retry = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient cluster API error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ClusterError::Transient(format!(
                        "{e} (gave up after {retry} retries)"
                    )));
                }
                other => return other,
            }
        }
    }
}

fn apply_error(namespace: &str, name: &str, err: ClusterError) -> ReconcileError {
    match err {
        ClusterError::NotFound(_) => {
            ReconcileError::Apply(format!("ingress {namespace}/{name} not found"))
        }
        ClusterError::Conflict(message) => {
            ReconcileError::Conflict(format!("ingress {namespace}/{name}: {message}"))
        }
        other => ReconcileError::Apply(format!("ingress {namespace}/{name}: {other}")),
    }
}

fn annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn has_annotations(ingress: &Ingress, wanted: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(k, v)| annotation(ingress, k) == Some(v.as_str()))
}

/// Weight annotation as an integer; Err holds the raw value when it is not one
fn weight_annotation(ingress: &Ingress, key: &str) -> Result<Option<i32>, String> {
    match annotation(ingress, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| raw.to_string()),
    }
}

/// The canary already carries `weight` written by this rollout, only the
/// stable side is missing
fn finishes_own_apply(canary: &Ingress, rollout_id: &str, weight: i32) -> bool {
    annotation(canary, ROLLOUT_ID_ANNOTATION) == Some(rollout_id)
        && weight_annotation(canary, CANARY_WEIGHT_ANNOTATION) == Ok(Some(weight))
        && weight_annotation(canary, APPLIED_WEIGHT_ANNOTATION) == Ok(Some(weight))
}

/// Describe why the observed ingress pair disagrees with what this rollout applied
///
/// Returns None when it is safe to apply.
pub fn detect_conflict(
    canary: &Ingress,
    stable: &Ingress,
    expected: Option<i32>,
) -> Option<String> {
    let observed = match weight_annotation(canary, CANARY_WEIGHT_ANNOTATION) {
        Ok(w) => w,
        Err(raw) => return Some(format!("canary-weight '{raw}' is not an integer")),
    };
    let applied = match weight_annotation(canary, APPLIED_WEIGHT_ANNOTATION) {
        Ok(w) => w,
        Err(raw) => return Some(format!("applied-weight '{raw}' is not an integer")),
    };
    let stable_weight = match weight_annotation(stable, STABLE_WEIGHT_ANNOTATION) {
        Ok(w) => w,
        Err(raw) => return Some(format!("stable-weight '{raw}' is not an integer")),
    };

    if let Some(applied) = applied {
        if observed != Some(applied) {
            return Some(format!(
                "canary-weight {} differs from applied-weight {applied}",
                display_weight(observed)
            ));
        }
        if let Some(stable_weight) = stable_weight {
            if stable_weight != 100 - applied {
                return Some(format!(
                    "stable-weight {stable_weight} does not complement applied-weight {applied}"
                ));
            }
        }
    }

    if let Some(expected) = expected {
        let current = observed.unwrap_or(0);
        if current != expected {
            return Some(format!(
                "canary-weight {current} differs from last applied weight {expected}"
            ));
        }
    }

    None
}

fn display_weight(weight: Option<i32>) -> String {
    weight.map_or_else(|| "<unset>".to_string(), |w| w.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "reconciler_test.rs"]
mod tests;
