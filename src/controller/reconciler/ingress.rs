//! Access to `networking.k8s.io/v1` Ingress objects
//!
//! The reconciler only needs get, create and an annotation merge patch, so
//! the cluster sits behind the small [`IngressApi`] trait.

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, PostParams};
use std::collections::BTreeMap;
use thiserror::Error;

/// Cluster API failure, classified by how the reconciler reacts to it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Timeouts, throttling, 5xx and transport errors
    #[error("transient error: {0}")]
    Transient(String),

    /// Anything else the API server refused
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
            kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500 => {
                ClusterError::Transient(format!("HTTP {}: {}", resp.code, resp.message))
            }
            kube::Error::Api(resp) => {
                ClusterError::Rejected(format!("HTTP {}: {}", resp.code, resp.message))
            }
            kube::Error::SerdeError(e) => ClusterError::Rejected(e.to_string()),
            other => ClusterError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait IngressApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress, ClusterError>;

    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, ClusterError>;

    /// Merge-patch annotations
    ///
    /// With `resource_version` set the API server rejects the patch with a
    /// conflict if the object changed since it was read.
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<Ingress, ClusterError>;
}

/// `IngressApi` backed by a kube client
pub struct KubeIngressApi {
    client: kube::Client,
}

impl KubeIngressApi {
    pub fn new(client: kube::Client) -> Self {
        KubeIngressApi { client }
    }

    fn api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl IngressApi for KubeIngressApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress, ClusterError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), ingress)
            .await?)
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<Ingress, ClusterError> {
        let mut metadata = serde_json::json!({ "annotations": annotations });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = serde_json::Value::String(rv.to_string());
        }
        let patch = serde_json::json!({ "metadata": metadata });

        Ok(self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}

/// In-memory `IngressApi` for tests
///
/// Tracks resourceVersions like the API server, counts writes and can be
/// told to fail the next calls.
#[cfg(test)]
pub struct MockIngressApi {
    objects: std::sync::Mutex<BTreeMap<(String, String), Ingress>>,
    injected: std::sync::Mutex<std::collections::VecDeque<ClusterError>>,
    next_version: std::sync::atomic::AtomicU64,
    patches: std::sync::atomic::AtomicUsize,
    creates: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockIngressApi {
    pub fn new() -> Self {
        MockIngressApi {
            objects: std::sync::Mutex::new(BTreeMap::new()),
            injected: std::sync::Mutex::new(std::collections::VecDeque::new()),
            next_version: std::sync::atomic::AtomicU64::new(1),
            patches: std::sync::atomic::AtomicUsize::new(0),
            creates: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn bump_version(&self) -> String {
        self.next_version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            .to_string()
    }

    /// Store an object as if an operator had applied it
    pub fn insert(&self, namespace: &str, mut ingress: Ingress) {
        ingress.metadata.namespace = Some(namespace.to_string());
        ingress.metadata.resource_version = Some(self.bump_version());
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), ingress);
    }

    /// Store a bare ingress carrying `annotations`
    pub fn insert_named(&self, namespace: &str, name: &str, annotations: &[(&str, &str)]) {
        let annotations = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.insert(
            namespace,
            Ingress {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_string()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
    }

    /// Simulate someone else editing an annotation
    pub fn external_edit(&self, namespace: &str, name: &str, key: &str, value: &str) {
        let version = self.bump_version();
        let mut objects = self.objects.lock().unwrap();
        let ingress = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        ingress
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        ingress.metadata.resource_version = Some(version);
    }

    /// Fail the next call (of any kind) with `err`
    pub fn fail_next(&self, err: ClusterError) {
        self.injected.lock().unwrap().push_back(err);
    }

    pub fn annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|i| i.metadata.annotations.as_ref())
            .and_then(|a| a.get(key).cloned())
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn injected_error(&self) -> Option<ClusterError> {
        self.injected.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl IngressApi for MockIngressApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress, ClusterError> {
        if let Some(err) = self.injected_error() {
            return Err(err);
        }
        self.object(namespace, name)
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))
    }

    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress, ClusterError> {
        if let Some(err) = self.injected_error() {
            return Err(err);
        }
        let name = ingress.metadata.name.clone().unwrap_or_default();
        if self.object(namespace, &name).is_some() {
            return Err(ClusterError::Conflict(format!("{namespace}/{name} already exists")));
        }
        self.creates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.insert(namespace, ingress.clone());
        Ok(self.object(namespace, &name).unwrap())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> Result<Ingress, ClusterError> {
        if let Some(err) = self.injected_error() {
            return Err(err);
        }
        let version = self.bump_version();
        let mut objects = self.objects.lock().unwrap();
        let ingress = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))?;

        if let Some(expected) = resource_version {
            if ingress.metadata.resource_version.as_deref() != Some(expected) {
                return Err(ClusterError::Conflict(format!(
                    "{namespace}/{name} was modified"
                )));
            }
        }

        ingress
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        ingress.metadata.resource_version = Some(version);
        self.patches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(ingress.clone())
    }
}
