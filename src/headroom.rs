//! Headroom Pod bookkeeping: low-priority placeholders that reserve a
//! node's Mountpoint Pod-sized capacity so a real Mountpoint Pod can be
//! scheduled without waiting out the cluster autoscaler. Purely
//! informational to the rest of the core -- a headroom pod carries no S3PA
//! reference and the reconciler's correctness does not depend on it
//! existing.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

/// Resource footprint a headroom placeholder should reserve, mirroring a
/// single Mountpoint Pod's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadroomShape {
    pub cpu_request: String,
    pub memory_request: String,
    pub priority_class_name: String,
}

/// Abstraction over "does a headroom placeholder exist on this node, and
/// if not, create one". The cluster-backed implementation is out of this
/// crate's required scope; an in-memory double exercises the policy.
#[async_trait]
pub trait HeadroomBackend: Send + Sync {
    async fn exists(&self, node_name: &str) -> bool;
    async fn create(&self, node_name: &str, shape: &HeadroomShape);
    async fn remove(&self, node_name: &str);
}

/// In-memory reference backend.
#[derive(Default)]
pub struct InMemoryHeadroomBackend {
    present: Mutex<HashSet<String>>,
}

impl InMemoryHeadroomBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadroomBackend for InMemoryHeadroomBackend {
    async fn exists(&self, node_name: &str) -> bool {
        self.present.lock().unwrap().contains(node_name)
    }

    async fn create(&self, node_name: &str, _shape: &HeadroomShape) {
        self.present.lock().unwrap().insert(node_name.to_owned());
    }

    async fn remove(&self, node_name: &str) {
        self.present.lock().unwrap().remove(node_name);
    }
}

/// Ensures exactly one headroom placeholder exists per node that wants
/// one, called by the reconciler after its own reconcile steps complete.
pub struct HeadroomPolicy<B: HeadroomBackend> {
    backend: B,
    shape: HeadroomShape,
}

impl<B: HeadroomBackend> HeadroomPolicy<B> {
    pub fn new(backend: B, shape: HeadroomShape) -> Self {
        Self { backend, shape }
    }

    /// Create the node's headroom placeholder if it is missing. Idempotent:
    /// calling this repeatedly for a node that already has one is a no-op.
    pub async fn ensure_for_node(&self, node_name: &str) {
        if !self.backend.exists(node_name).await {
            self.backend.create(node_name, &self.shape).await;
        }
    }

    /// Remove a node's headroom placeholder, e.g. once it is no longer
    /// schedulable for this driver.
    pub async fn retire_for_node(&self, node_name: &str) {
        self.backend.remove(node_name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> HeadroomShape {
        HeadroomShape {
            cpu_request: "100m".to_owned(),
            memory_request: "128Mi".to_owned(),
            priority_class_name: "s3-csi-headroom".to_owned(),
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let policy = HeadroomPolicy::new(InMemoryHeadroomBackend::new(), shape());
        policy.ensure_for_node("node-a").await;
        policy.ensure_for_node("node-a").await;
        assert!(policy.backend.exists("node-a").await);
    }

    #[tokio::test]
    async fn retire_removes_placeholder() {
        let policy = HeadroomPolicy::new(InMemoryHeadroomBackend::new(), shape());
        policy.ensure_for_node("node-a").await;
        policy.retire_for_node("node-a").await;
        assert!(!policy.backend.exists("node-a").await);
    }

    #[tokio::test]
    async fn distinct_nodes_tracked_independently() {
        let policy = HeadroomPolicy::new(InMemoryHeadroomBackend::new(), shape());
        policy.ensure_for_node("node-a").await;
        assert!(!policy.backend.exists("node-b").await);
    }
}
