use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RolloutPlan describes one canary rollout of a service
///
/// Created by an operator request and immutable once the rollout starts.
/// Durations use the `<n>s`, `<n>m`, `<n>h` format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutPlan {
    /// Name of the target service (also the default stable ingress name)
    pub service: String,

    /// Namespace holding the ingress pair
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Revision id currently serving production traffic
    #[serde(rename = "stableRevision")]
    pub stable_revision: String,

    /// Revision id being validated
    #[serde(rename = "canaryRevision")]
    pub canary_revision: String,

    /// Canary weight applied when the rollout starts (0-100)
    #[serde(rename = "initialWeight", default)]
    pub initial_weight: i32,

    /// Weight added on every healthy tick
    #[serde(rename = "stepSize")]
    pub step_size: i32,

    /// Time between ticks (e.g., "30s", "5m")
    #[serde(rename = "stepInterval")]
    pub step_interval: String,

    /// Minimum canary success ratio (0.0-1.0) required to advance
    #[serde(rename = "successThreshold")]
    pub success_threshold: f64,

    /// Highest weight reached by stepping before promotion
    #[serde(rename = "maxWeight", default = "default_max_weight")]
    pub max_weight: i32,

    /// Ingress objects carrying the traffic split
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressRefs>,

    /// When set, missing ingresses are created from this description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<IngressRouting>,

    /// Time the canary must hold at max weight before promotion
    #[serde(
        rename = "bakeDuration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bake_duration: Option<String>,

    /// Canary p95 latency above this holds the weight
    #[serde(
        rename = "maxLatencyMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_latency_ms: Option<f64>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_max_weight() -> i32 {
    100
}

/// Names of the stable and canary Ingress objects
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct IngressRefs {
    pub stable: String,
    pub canary: String,
}

/// Routing used to create the NGINX canary ingress pair when it does not exist
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct IngressRouting {
    /// Host the ingress pair serves
    pub host: String,

    /// Path prefix (default "/")
    #[serde(default = "default_path")]
    pub path: String,

    /// Backend service of the stable ingress (default: plan service)
    #[serde(
        rename = "stableService",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stable_service: Option<String>,

    /// Backend service of the canary ingress (default: "<service>-canary")
    #[serde(
        rename = "canaryService",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub canary_service: Option<String>,

    /// Service port (default 80)
    #[serde(default = "default_port")]
    pub port: i32,

    /// IngressClass (default "nginx")
    #[serde(
        rename = "ingressClassName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ingress_class_name: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_port() -> i32 {
    80
}

impl RolloutPlan {
    /// Name of the ingress routing stable traffic
    pub fn stable_ingress(&self) -> String {
        match &self.ingress {
            Some(refs) => refs.stable.clone(),
            None => self.service.clone(),
        }
    }

    /// Name of the ingress carrying the canary-weight annotation
    pub fn canary_ingress(&self) -> String {
        match &self.ingress {
            Some(refs) => refs.canary.clone(),
            None => format!("{}-canary", self.service),
        }
    }

    /// `namespace/service`, the key under which at most one rollout may be active
    pub fn target_key(&self) -> String {
        format!("{}/{}", self.namespace, self.service)
    }
}

impl IngressRouting {
    /// Routing for `host` with every other field at its default
    pub fn for_host(host: impl Into<String>) -> Self {
        IngressRouting {
            host: host.into(),
            path: default_path(),
            stable_service: None,
            canary_service: None,
            port: default_port(),
            ingress_class_name: None,
        }
    }

    pub fn stable_backend(&self, plan: &RolloutPlan) -> String {
        self.stable_service
            .clone()
            .unwrap_or_else(|| plan.service.clone())
    }

    pub fn canary_backend(&self, plan: &RolloutPlan) -> String {
        self.canary_service
            .clone()
            .unwrap_or_else(|| format!("{}-canary", plan.service))
    }

    pub fn class_name(&self) -> String {
        self.ingress_class_name
            .clone()
            .unwrap_or_else(|| "nginx".to_string())
    }
}
