//! The attachment key: the tuple that determines whether two workload pods
//! may share a Mountpoint Pod.

use serde::{Deserialize, Serialize};

/// The nine-field tuple identifying a unique Mountpoint Pod requirement.
/// Any difference in any field forces a separate Mountpoint Pod. Keys are
/// never reused across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentKey {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub volume_handle: String,
    /// Sorted, deduplicated, policy-filtered option string (see
    /// `policy::canonicalize`).
    pub canonical_mount_options: String,
    pub authentication_source: String,
    pub workload_fs_group: Option<String>,
    pub workload_service_account_name: String,
    pub workload_namespace: String,
    pub workload_service_account_iam_role_arn: Option<String>,
}

impl AttachmentKey {
    /// A stable, content-addressed hash of the full key, used as a label
    /// value and as salt input for Mountpoint Pod names sharing this key.
    pub fn hash_hex(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.node_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.persistent_volume_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.volume_handle.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.canonical_mount_options.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.authentication_source.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.workload_fs_group.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\0");
        hasher.update(self.workload_service_account_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.workload_namespace.as_bytes());
        hasher.update(b"\0");
        hasher.update(
            self.workload_service_account_iam_role_arn
                .as_deref()
                .unwrap_or("")
                .as_bytes(),
        );
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AttachmentKey {
        AttachmentKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
            volume_handle: "bucket-1".to_owned(),
            canonical_mount_options: "--allow-root".to_owned(),
            authentication_source: "driver".to_owned(),
            workload_fs_group: None,
            workload_service_account_name: "default".to_owned(),
            workload_namespace: "ns".to_owned(),
            workload_service_account_iam_role_arn: None,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(sample().hash_hex(), sample().hash_hex());
    }

    #[test]
    fn hash_changes_with_any_field() {
        let mut other = sample();
        other.workload_fs_group = Some("1000".to_owned());
        assert_ne!(sample().hash_hex(), other.hash_hex());
    }
}
