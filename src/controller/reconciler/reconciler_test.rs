use super::ingress::MockIngressApi;
use super::manifest::{CANARY_ANNOTATION, ROLLOUT_ID_ANNOTATION};
use super::*;

const NS: &str = "shop";

fn plan() -> RolloutPlan {
    serde_yaml::from_str(
        r#"
service: checkout
namespace: shop
stableRevision: checkout-v1
canaryRevision: checkout-v2
initialWeight: 10
stepSize: 20
stepInterval: 1m
successThreshold: 0.99
"#,
    )
    .unwrap()
}

fn reconciler(api: Arc<MockIngressApi>) -> ManifestReconciler {
    ManifestReconciler::new(
        api,
        Duration::from_secs(1),
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4), 3),
    )
}

/// Operator-provisioned pair, as in the manual workflow
fn seeded_api() -> Arc<MockIngressApi> {
    let api = Arc::new(MockIngressApi::new());
    api.insert_named(NS, "checkout", &[]);
    api.insert_named(
        NS,
        "checkout-canary",
        &[(CANARY_ANNOTATION, "true"), (CANARY_WEIGHT_ANNOTATION, "0")],
    );
    api
}

fn weights(api: &MockIngressApi) -> (Option<String>, Option<String>, Option<String>) {
    (
        api.annotation(NS, "checkout-canary", CANARY_WEIGHT_ANNOTATION),
        api.annotation(NS, "checkout-canary", APPLIED_WEIGHT_ANNOTATION),
        api.annotation(NS, "checkout", STABLE_WEIGHT_ANNOTATION),
    )
}

#[tokio::test]
async fn test_apply_sets_all_annotations() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());

    let outcome = reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Patched);
    assert_eq!(
        weights(&api),
        (
            Some("10".to_string()),
            Some("10".to_string()),
            Some("90".to_string())
        )
    );
    assert_eq!(
        api.annotation(NS, "checkout-canary", ROLLOUT_ID_ANNOTATION)
            .as_deref(),
        Some("r-1")
    );
    assert_eq!(api.patch_count(), 2);
}

#[tokio::test]
async fn test_reapplying_identical_weight_is_a_no_op() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    reconciler
        .apply_weight(&plan(), "r-1", 30, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();
    let patches = api.patch_count();
    let before = api.object(NS, "checkout-canary").unwrap();

    let outcome = reconciler
        .apply_weight(&plan(), "r-1", 30, ApplyMode::Guarded { expected: Some(30) })
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Unchanged);
    assert_eq!(api.patch_count(), patches);
    assert_eq!(api.object(NS, "checkout-canary").unwrap(), before);
}

#[tokio::test]
async fn test_weights_always_sum_to_100() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    let mut last = None;

    for weight in [0, 10, 35, 70, 99, 100] {
        reconciler
            .apply_weight(&plan(), "r-1", weight, ApplyMode::Guarded { expected: last })
            .await
            .unwrap();
        let (canary, _, stable) = weights(&api);
        let canary: i32 = canary.unwrap().parse().unwrap();
        let stable: i32 = stable.unwrap().parse().unwrap();
        assert_eq!(canary + stable, 100);
        last = Some(weight);
    }
}

#[tokio::test]
async fn test_external_weight_edit_is_a_conflict() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    api.external_edit(NS, "checkout-canary", CANARY_WEIGHT_ANNOTATION, "50");
    let patches = api.patch_count();

    let err = reconciler
        .apply_weight(&plan(), "r-1", 30, ApplyMode::Guarded { expected: Some(10) })
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert_eq!(api.patch_count(), patches);
    assert_eq!(
        api.annotation(NS, "checkout-canary", CANARY_WEIGHT_ANNOTATION)
            .as_deref(),
        Some("50")
    );
}

#[tokio::test]
async fn test_consistent_edit_still_conflicts_with_last_applied() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    // Another writer moved all three annotations consistently
    api.external_edit(NS, "checkout-canary", CANARY_WEIGHT_ANNOTATION, "40");
    api.external_edit(NS, "checkout-canary", APPLIED_WEIGHT_ANNOTATION, "40");
    api.external_edit(NS, "checkout", STABLE_WEIGHT_ANNOTATION, "60");

    let err = reconciler
        .apply_weight(&plan(), "r-1", 30, ApplyMode::Guarded { expected: Some(10) })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
}

#[tokio::test]
async fn test_forced_apply_overrides_external_edit() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    reconciler
        .apply_weight(&plan(), "r-1", 40, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();
    api.external_edit(NS, "checkout-canary", CANARY_WEIGHT_ANNOTATION, "75");

    let outcome = reconciler
        .apply_weight(&plan(), "r-1", 0, ApplyMode::Forced)
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Patched);
    assert_eq!(
        weights(&api),
        (
            Some("0".to_string()),
            Some("0".to_string()),
            Some("100".to_string())
        )
    );
}

#[tokio::test]
async fn test_stale_resource_version_conflicts_unless_forced() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    let canary = api.object(NS, "checkout-canary").unwrap();
    let stable = api.object(NS, "checkout").unwrap();
    api.external_edit(NS, "checkout-canary", "team", "payments");
    api.external_edit(NS, "checkout", "team", "payments");

    let err = reconciler
        .patch(
            NS,
            "checkout-canary",
            &canary_annotations(30, Some("r-1")),
            &canary,
            ApplyMode::Guarded { expected: Some(10) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    reconciler
        .patch(
            NS,
            "checkout",
            &stable_annotations(30),
            &stable,
            ApplyMode::Forced,
        )
        .await
        .unwrap();
    assert_eq!(weights(&api).2.as_deref(), Some("70"));
}

#[tokio::test]
async fn test_missing_ingress_is_an_apply_error_without_retry() {
    let api = Arc::new(MockIngressApi::new());
    api.insert_named(NS, "checkout", &[]);
    let reconciler = reconciler(api.clone());

    let err = reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap_err();

    match err {
        ReconcileError::Apply(message) => assert!(message.contains("not found")),
        other => panic!("expected Apply, got {other:?}"),
    }
    assert_eq!(api.patch_count(), 0);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    api.fail_next(ClusterError::Transient("HTTP 503".to_string()));
    api.fail_next(ClusterError::Transient("HTTP 429".to_string()));

    reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    assert_eq!(weights(&api).0.as_deref(), Some("10"));
}

#[tokio::test]
async fn test_exhausted_retries_are_an_apply_error() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    // 1 attempt + 3 retries
    for _ in 0..4 {
        api.fail_next(ClusterError::Transient("HTTP 500".to_string()));
    }

    let err = reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Apply(_)));
}

#[tokio::test]
async fn test_rejected_patch_is_not_retried() {
    let api = seeded_api();
    let reconciler = reconciler(api.clone());
    api.fail_next(ClusterError::Rejected("HTTP 422: invalid".to_string()));
    api.fail_next(ClusterError::Transient("never reached".to_string()));

    let err = reconciler
        .apply_weight(&plan(), "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Apply(_)));
}

#[tokio::test]
async fn test_routing_creates_missing_ingresses() {
    let api = Arc::new(MockIngressApi::new());
    let reconciler = reconciler(api.clone());
    let mut plan = plan();
    plan.routing = Some(IngressRouting::for_host("shop.example.com"));

    reconciler
        .apply_weight(&plan, "r-1", 10, ApplyMode::Guarded { expected: None })
        .await
        .unwrap();

    assert_eq!(api.create_count(), 2);
    assert!(api.object(NS, "checkout").unwrap().spec.is_some());
    assert_eq!(weights(&api).0.as_deref(), Some("10"));

    // Second apply finds both and creates nothing
    reconciler
        .apply_weight(&plan, "r-1", 30, ApplyMode::Guarded { expected: Some(10) })
        .await
        .unwrap();
    assert_eq!(api.create_count(), 2);
}

#[test]
fn test_detect_conflict_rules() {
    fn ingress(annotations: &[(&str, &str)]) -> Ingress {
        let mut ingress = Ingress::default();
        ingress.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        ingress
    }

    let stable = ingress(&[(STABLE_WEIGHT_ANNOTATION, "80")]);
    let consistent = ingress(&[
        (CANARY_WEIGHT_ANNOTATION, "20"),
        (APPLIED_WEIGHT_ANNOTATION, "20"),
    ]);
    assert_eq!(detect_conflict(&consistent, &stable, Some(20)), None);
    assert_eq!(detect_conflict(&consistent, &stable, None), None);
    assert!(detect_conflict(&consistent, &stable, Some(10)).is_some());

    let drifted = ingress(&[
        (CANARY_WEIGHT_ANNOTATION, "50"),
        (APPLIED_WEIGHT_ANNOTATION, "20"),
    ]);
    assert!(detect_conflict(&drifted, &stable, None).is_some());

    let bad_stable = ingress(&[(STABLE_WEIGHT_ANNOTATION, "10")]);
    assert!(detect_conflict(&consistent, &bad_stable, None).is_some());

    let garbage = ingress(&[(CANARY_WEIGHT_ANNOTATION, "lots")]);
    assert!(detect_conflict(&garbage, &stable, None).is_some());

    // Unmanaged pair: no bookkeeping yet
    let fresh = ingress(&[(CANARY_WEIGHT_ANNOTATION, "0")]);
    assert_eq!(detect_conflict(&fresh, &ingress(&[]), Some(0)), None);
}

#[tokio::test]
async fn test_guarded_apply_completes_own_half_applied_weight() {
    let api = Arc::new(MockIngressApi::new());
    api.insert_named(NS, "checkout", &[(STABLE_WEIGHT_ANNOTATION, "90")]);
    api.insert_named(
        NS,
        "checkout-canary",
        &[
            (CANARY_ANNOTATION, "true"),
            (CANARY_WEIGHT_ANNOTATION, "30"),
            (APPLIED_WEIGHT_ANNOTATION, "30"),
            (ROLLOUT_ID_ANNOTATION, "r-1"),
        ],
    );
    let reconciler = reconciler(api.clone());

    // Another rollout may not touch it
    let err = reconciler
        .apply_weight(&plan(), "r-2", 30, ApplyMode::Guarded { expected: Some(10) })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));

    let outcome = reconciler
        .apply_weight(&plan(), "r-1", 30, ApplyMode::Guarded { expected: Some(10) })
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Patched);
    assert_eq!(
        weights(&api),
        (
            Some("30".to_string()),
            Some("30".to_string()),
            Some("70".to_string())
        )
    );
}
