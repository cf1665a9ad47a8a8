use super::plan::*;

#[test]
fn test_plan_deserialize_from_yaml() {
    let yaml = r#"
service: checkout
namespace: shop
stableRevision: checkout-v1
canaryRevision: checkout-v2
initialWeight: 10
stepSize: 20
stepInterval: 2m
successThreshold: 0.99
maxWeight: 90
bakeDuration: 5m
maxLatencyMs: 250
"#;

    let plan: RolloutPlan = serde_yaml::from_str(yaml).expect("Failed to deserialize plan");

    assert_eq!(plan.service, "checkout");
    assert_eq!(plan.namespace, "shop");
    assert_eq!(plan.stable_revision, "checkout-v1");
    assert_eq!(plan.canary_revision, "checkout-v2");
    assert_eq!(plan.initial_weight, 10);
    assert_eq!(plan.step_size, 20);
    assert_eq!(plan.step_interval, "2m");
    assert_eq!(plan.success_threshold, 0.99);
    assert_eq!(plan.max_weight, 90);
    assert_eq!(plan.bake_duration.as_deref(), Some("5m"));
    assert_eq!(plan.max_latency_ms, Some(250.0));
    assert!(plan.routing.is_none());
}

#[test]
fn test_plan_defaults() {
    let yaml = r#"
service: checkout
stableRevision: v1
canaryRevision: v2
stepSize: 25
stepInterval: 30s
successThreshold: 0.95
"#;

    let plan: RolloutPlan = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(plan.namespace, "default");
    assert_eq!(plan.initial_weight, 0);
    assert_eq!(plan.max_weight, 100);
    assert_eq!(plan.stable_ingress(), "checkout");
    assert_eq!(plan.canary_ingress(), "checkout-canary");
    assert_eq!(plan.target_key(), "default/checkout");
}

#[test]
fn test_plan_with_ingress_refs_and_routing() {
    let yaml = r#"
service: checkout
stableRevision: v1
canaryRevision: v2
stepSize: 25
stepInterval: 30s
successThreshold: 0.95
ingress:
  stable: checkout-main
  canary: checkout-next
routing:
  host: shop.example.com
  canaryService: checkout-v2
"#;

    let plan: RolloutPlan = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(plan.stable_ingress(), "checkout-main");
    assert_eq!(plan.canary_ingress(), "checkout-next");

    let routing = plan.routing.clone().unwrap();
    assert_eq!(routing.host, "shop.example.com");
    assert_eq!(routing.path, "/");
    assert_eq!(routing.port, 80);
    assert_eq!(routing.stable_backend(&plan), "checkout");
    assert_eq!(routing.canary_backend(&plan), "checkout-v2");
    assert_eq!(routing.class_name(), "nginx");
}

#[test]
fn test_plan_json_uses_camel_case() {
    let yaml = r#"
service: checkout
stableRevision: v1
canaryRevision: v2
stepSize: 25
stepInterval: 30s
successThreshold: 0.95
"#;
    let plan: RolloutPlan = serde_yaml::from_str(yaml).unwrap();

    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["stableRevision"], "v1");
    assert_eq!(json["stepInterval"], "30s");
    assert!(json.get("routing").is_none());
    assert!(json.get("bakeDuration").is_none());
}

#[test]
fn test_plan_schema_generation() {
    let schema = schemars::schema_for!(RolloutPlan);
    let json = serde_json::to_value(&schema).unwrap();

    let properties = &json["properties"];
    assert!(properties.get("service").is_some());
    assert!(properties.get("canaryRevision").is_some());
    assert!(properties.get("successThreshold").is_some());
}
