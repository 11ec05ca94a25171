//! Driver-wide configuration.
//!
//! Mirrors the teacher's `util::config` pattern of a TOML-backed global
//! configuration struct, but threaded explicitly rather than through a
//! process-global `OnceCell`, since both the node engine and the reconciler
//! need independently-constructed instances in tests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Driver-wide configuration, shared by the node engine and the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// The driver's own identity, used in S3PA group naming and
    /// `--user-agent-prefix`.
    pub driver_name: String,
    /// Container image used for Mountpoint Pods.
    pub mountpoint_image: String,
    /// Non-root UID the Mountpoint Pod's container and emptyDir run as.
    pub mountpoint_uid: u32,
    /// Root of the kubelet plugin tree on this node, e.g.
    /// `/var/lib/kubelet`.
    pub kubelet_path: PathBuf,
    /// Endpoint URL injected into every mount, never overridable per-volume.
    pub endpoint_url: Option<String>,
    /// Upper bound on workload pods sharing one Mountpoint Pod. `None`
    /// means unbounded (the reference default per the driver's open
    /// questions).
    pub max_workloads_per_mountpoint_pod: Option<usize>,
    /// Whether to maintain a headroom placeholder pod per node.
    pub headroom_enabled: bool,
    /// Priority class used for ordinary Mountpoint Pods.
    pub priority_class_critical: String,
    /// Priority class used for Mountpoint Pods intended to evict headroom.
    pub priority_class_preempting: String,
    /// Namespace Mountpoint Pods are created in.
    pub mountpoint_namespace: String,
    /// Size of the reconciler's bounded worker pool.
    pub reconciler_workers: usize,
    /// Per-reconcile-item timeout before the key is re-enqueued.
    pub reconcile_item_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: "s3.csi.scality.com".to_owned(),
            mountpoint_image: "ghcr.io/scality/mountpoint-s3:latest".to_owned(),
            mountpoint_uid: 1000,
            kubelet_path: PathBuf::from("/var/lib/kubelet"),
            endpoint_url: None,
            max_workloads_per_mountpoint_pod: None,
            headroom_enabled: false,
            priority_class_critical: "s3-csi-critical".to_owned(),
            priority_class_preempting: "s3-csi-preempting".to_owned(),
            mountpoint_namespace: "mount-s3".to_owned(),
            reconciler_workers: 4,
            reconcile_item_timeout_secs: 120,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_file(path: &std::path::Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("parsing config {}: {e}", path.display()))
    }

    /// Apply the two environment variables the node engine authoritatively
    /// consumes: `AWS_ENDPOINT_URL` and `KUBELET_PATH`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("AWS_ENDPOINT_URL") {
            self.endpoint_url = Some(endpoint);
        }
        if let Ok(kubelet_path) = std::env::var("KUBELET_PATH") {
            self.kubelet_path = PathBuf::from(kubelet_path);
        }
        self
    }

    /// Source mount directory for a given Mountpoint Pod name:
    /// `<kubelet>/plugins/<driver>/mnt/<mp_pod_name>`.
    pub fn source_mount_path(&self, mp_pod_name: &str) -> PathBuf {
        self.kubelet_path
            .join("plugins")
            .join(&self.driver_name)
            .join("mnt")
            .join(mp_pod_name)
    }

    /// Root of the per-mount credentials directories, shared across every
    /// Mountpoint Pod on this node: `<kubelet>/plugins/<driver>/credentials`.
    pub fn credentials_root(&self) -> PathBuf {
        self.kubelet_path
            .join("plugins")
            .join(&self.driver_name)
            .join("credentials")
    }

    /// Per-mount credentials directory:
    /// `<kubelet>/plugins/<driver>/credentials/<mp_pod_name>`.
    pub fn credentials_path(&self, mp_pod_name: &str) -> PathBuf {
        self.credentials_root().join(mp_pod_name)
    }

    /// Path to a Mountpoint Pod's handshake socket as visible from the
    /// node, under the same plugin-tree bookkeeping as the source mount.
    pub fn comm_socket_path(&self, mp_pod_name: &str) -> PathBuf {
        self.kubelet_path
            .join("plugins")
            .join(&self.driver_name)
            .join("comm")
            .join(mp_pod_name)
            .join("mount.sock")
    }
}
