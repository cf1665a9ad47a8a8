//! NGINX canary Ingress pair: annotation keys and manifest builders

use crate::model::{IngressRouting, RolloutPlan};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Marks an Ingress as the canary of its host/path pair
pub const CANARY_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary";

/// Percentage of requests routed to the canary Ingress backend
pub const CANARY_WEIGHT_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary-weight";

/// Weight last written by the controller (canary Ingress)
pub const APPLIED_WEIGHT_ANNOTATION: &str = "kanari.io/applied-weight";

/// Rollout that last wrote the canary weight
pub const ROLLOUT_ID_ANNOTATION: &str = "kanari.io/rollout-id";

/// Complement of the applied canary weight (stable Ingress)
pub const STABLE_WEIGHT_ANNOTATION: &str = "kanari.io/stable-weight";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Annotations the canary Ingress carries at `weight`
pub fn canary_annotations(weight: i32, rollout_id: Option<&str>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (CANARY_ANNOTATION.to_string(), "true".to_string()),
        (CANARY_WEIGHT_ANNOTATION.to_string(), weight.to_string()),
        (APPLIED_WEIGHT_ANNOTATION.to_string(), weight.to_string()),
    ]);
    if let Some(id) = rollout_id {
        annotations.insert(ROLLOUT_ID_ANNOTATION.to_string(), id.to_string());
    }
    annotations
}

/// Annotations the stable Ingress carries while the canary is at `weight`
pub fn stable_annotations(weight: i32) -> BTreeMap<String, String> {
    BTreeMap::from([(
        STABLE_WEIGHT_ANNOTATION.to_string(),
        (100 - weight).to_string(),
    )])
}

/// Core Ingress builder shared by the stable and canary manifests
///
/// Single rule: `routing.host` + `routing.path` (Prefix) to `backend`.
fn build_ingress_core(
    plan: &RolloutPlan,
    routing: &IngressRouting,
    name: String,
    backend: String,
    annotations: BTreeMap<String, String>,
) -> Ingress {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "kanari".to_string()),
        ("app.kubernetes.io/name".to_string(), plan.service.clone()),
    ]);

    let path = HTTPIngressPath {
        path: Some(routing.path.clone()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: backend,
                port: Some(ServiceBackendPort {
                    number: Some(routing.port),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(plan.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(routing.class_name()),
            rules: Some(vec![IngressRule {
                host: Some(routing.host.clone()),
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the stable Ingress for a plan with `routing`
pub fn build_stable_ingress(plan: &RolloutPlan, routing: &IngressRouting, weight: i32) -> Ingress {
    build_ingress_core(
        plan,
        routing,
        plan.stable_ingress(),
        routing.stable_backend(plan),
        stable_annotations(weight),
    )
}

/// Build the canary Ingress for a plan with `routing`
pub fn build_canary_ingress(
    plan: &RolloutPlan,
    routing: &IngressRouting,
    weight: i32,
    rollout_id: Option<&str>,
) -> Ingress {
    build_ingress_core(
        plan,
        routing,
        plan.canary_ingress(),
        routing.canary_backend(plan),
        canary_annotations(weight, rollout_id),
    )
}

/// Render the Ingress pair as a multi-document YAML stream
///
/// Plans without `routing` render with host `<service>.local`.
pub fn render_ingress_pair(plan: &RolloutPlan) -> Result<String, serde_yaml::Error> {
    let routing = plan
        .routing
        .clone()
        .unwrap_or_else(|| IngressRouting::for_host(format!("{}.local", plan.service)));

    let stable = serde_yaml::to_string(&build_stable_ingress(plan, &routing, plan.initial_weight))?;
    let canary = serde_yaml::to_string(&build_canary_ingress(
        plan,
        &routing,
        plan.initial_weight,
        None,
    ))?;
    Ok(format!("{stable}---\n{canary}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plan() -> RolloutPlan {
        serde_yaml::from_str(
            r#"
service: checkout
namespace: shop
stableRevision: v1
canaryRevision: v2
initialWeight: 10
stepSize: 20
stepInterval: 1m
successThreshold: 0.99
routing:
  host: shop.example.com
  path: /api
  port: 8080
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_canary_annotations() {
        let annotations = canary_annotations(30, Some("r-1"));
        assert_eq!(annotations[CANARY_ANNOTATION], "true");
        assert_eq!(annotations[CANARY_WEIGHT_ANNOTATION], "30");
        assert_eq!(annotations[APPLIED_WEIGHT_ANNOTATION], "30");
        assert_eq!(annotations[ROLLOUT_ID_ANNOTATION], "r-1");

        assert!(!canary_annotations(30, None).contains_key(ROLLOUT_ID_ANNOTATION));
    }

    #[test]
    fn test_stable_annotations_complement_weight() {
        assert_eq!(stable_annotations(30)[STABLE_WEIGHT_ANNOTATION], "70");
        assert_eq!(stable_annotations(0)[STABLE_WEIGHT_ANNOTATION], "100");
    }

    #[test]
    fn test_build_canary_ingress() {
        let plan = plan();
        let routing = plan.routing.clone().unwrap();
        let ingress = build_canary_ingress(&plan, &routing, 10, Some("r-1"));

        assert_eq!(ingress.metadata.name.as_deref(), Some("checkout-canary"));
        assert_eq!(ingress.metadata.namespace.as_deref(), Some("shop"));
        assert_eq!(
            ingress.metadata.labels.as_ref().unwrap()[MANAGED_BY_LABEL],
            "kanari"
        );

        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rules = spec.rules.unwrap();
        let rule = &rules[0];
        assert_eq!(rule.host.as_deref(), Some("shop.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/api"));
        assert_eq!(path.path_type, "Prefix");
        let service = path.backend.service.as_ref().unwrap();
        assert_eq!(service.name, "checkout-canary");
        assert_eq!(service.port.as_ref().unwrap().number, Some(8080));
    }

    #[test]
    fn test_build_stable_ingress_has_no_canary_annotation() {
        let plan = plan();
        let routing = plan.routing.clone().unwrap();
        let ingress = build_stable_ingress(&plan, &routing, 10);

        let annotations = ingress.metadata.annotations.unwrap();
        assert!(!annotations.contains_key(CANARY_ANNOTATION));
        assert_eq!(annotations[STABLE_WEIGHT_ANNOTATION], "90");
        assert_eq!(ingress.metadata.name.as_deref(), Some("checkout"));
    }

    #[test]
    fn test_render_ingress_pair() {
        let rendered = render_ingress_pair(&plan()).unwrap();
        let docs: Vec<&str> = rendered.split("---\n").collect();

        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("name: checkout\n"));
        assert!(docs[1].contains("nginx.ingress.kubernetes.io/canary-weight: '10'"));
    }
}
