//! S3PA Store & Indexer: the cluster-scoped record binding workload pods to
//! the Mountpoint Pod(s) that serve them, plus an in-memory reference
//! store with the secondary indices the reconciler needs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::AttachmentKey;

/// A single workload pod attached to a Mountpoint Pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadAttachment {
    pub workload_pod_uid: String,
    /// Unix-epoch seconds; the reconciler is responsible for supplying a
    /// real clock reading, kept as a plain field so this type stays
    /// trivially testable.
    pub attachment_timestamp: i64,
}

/// The cluster-scoped S3PodAttachment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3PodAttachment {
    pub name: String,
    pub key: AttachmentKey,
    pub mountpoints: HashMap<String, Vec<WorkloadAttachment>>,
    pub ready: bool,
}

impl S3PodAttachment {
    pub fn new(name: impl Into<String>, key: AttachmentKey) -> Self {
        Self {
            name: name.into(),
            key,
            mountpoints: HashMap::new(),
            ready: false,
        }
    }

    /// All workload pod UIDs currently attached, across every Mountpoint
    /// Pod this S3PA owns.
    pub fn all_workload_uids(&self) -> HashSet<&str> {
        self.mountpoints
            .values()
            .flatten()
            .map(|a| a.workload_pod_uid.as_str())
            .collect()
    }

    /// True once every `mountpoints` entry is empty: deletion condition
    /// per the reconciler's reap step (the S3PA itself should then also be
    /// deleted once its Mountpoint Pods are gone too).
    pub fn has_no_workload_attachments(&self) -> bool {
        self.mountpoints.values().all(|v| v.is_empty())
    }
}

/// A resource-version-tagged wrapper, so stores can implement
/// compare-and-swap semantics uniformly.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub resource_version: u64,
    pub value: T,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("S3PodAttachment {name} write conflict, retrying")]
    Conflict { name: String },
    #[error("S3PodAttachment {name} not found")]
    NotFound { name: String },
    #[error("observed stale resource version for {name}, dropping")]
    Stale { name: String },
}

/// The query/write surface the reconciler depends on. A real
/// cluster-backed implementation lives behind the `k8s` feature; tests and
/// the in-process reconciler exercise [`InMemoryS3paStore`] directly.
#[async_trait]
pub trait S3paStore: Send + Sync {
    async fn get(&self, name: &str) -> Option<Versioned<S3PodAttachment>>;

    /// O(log n) via the node index in a real store; here, a direct index
    /// lookup.
    async fn by_node(&self, node_name: &str) -> Vec<Versioned<S3PodAttachment>>;

    /// S3PA matching a full attachment key on a node: node index plus a
    /// linear filter over the (small) per-node set.
    async fn by_key(&self, key: &AttachmentKey) -> Option<Versioned<S3PodAttachment>>;

    /// S3PA containing a given workload pod UID, scanning only the
    /// node-local set (bounded in practice).
    async fn containing_workload(&self, node_name: &str, workload_pod_uid: &str)
        -> Option<Versioned<S3PodAttachment>>;

    async fn create(&self, s3pa: S3PodAttachment) -> Result<Versioned<S3PodAttachment>, StoreError>;

    async fn update(
        &self,
        expected_version: u64,
        s3pa: S3PodAttachment,
    ) -> Result<Versioned<S3PodAttachment>, StoreError>;

    async fn delete(&self, name: &str, expected_version: u64) -> Result<(), StoreError>;
}

/// In-memory reference implementation, indexed by node name and by
/// workload UID for the query patterns the reconciler performs.
#[derive(Default)]
pub struct InMemoryS3paStore {
    objects: DashMap<String, Versioned<S3PodAttachment>>,
    by_node: DashMap<String, HashSet<String>>,
}

impl InMemoryS3paStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn reindex_insert(&self, name: &str, node_name: &str) {
        self.by_node
            .entry(node_name.to_owned())
            .or_default()
            .insert(name.to_owned());
    }

    fn reindex_remove(&self, name: &str, node_name: &str) {
        if let Some(mut set) = self.by_node.get_mut(node_name) {
            set.remove(name);
        }
    }
}

#[async_trait]
impl S3paStore for InMemoryS3paStore {
    async fn get(&self, name: &str) -> Option<Versioned<S3PodAttachment>> {
        self.objects.get(name).map(|r| r.clone())
    }

    async fn by_node(&self, node_name: &str) -> Vec<Versioned<S3PodAttachment>> {
        let Some(names) = self.by_node.get(node_name) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|n| self.objects.get(n).map(|r| r.clone()))
            .collect()
    }

    async fn by_key(&self, key: &AttachmentKey) -> Option<Versioned<S3PodAttachment>> {
        self.by_node(&key.node_name)
            .await
            .into_iter()
            .find(|v| &v.value.key == key)
    }

    async fn containing_workload(
        &self,
        node_name: &str,
        workload_pod_uid: &str,
    ) -> Option<Versioned<S3PodAttachment>> {
        self.by_node(node_name)
            .await
            .into_iter()
            .find(|v| v.value.all_workload_uids().contains(workload_pod_uid))
    }

    async fn create(
        &self,
        s3pa: S3PodAttachment,
    ) -> Result<Versioned<S3PodAttachment>, StoreError> {
        if self.objects.contains_key(&s3pa.name) {
            return Err(StoreError::Conflict { name: s3pa.name });
        }
        let versioned = Versioned {
            resource_version: 1,
            value: s3pa,
        };
        self.reindex_insert(&versioned.value.name, &versioned.value.key.node_name);
        self.objects
            .insert(versioned.value.name.clone(), versioned.clone());
        Ok(versioned)
    }

    async fn update(
        &self,
        expected_version: u64,
        s3pa: S3PodAttachment,
    ) -> Result<Versioned<S3PodAttachment>, StoreError> {
        let mut entry = self
            .objects
            .get_mut(&s3pa.name)
            .ok_or_else(|| StoreError::NotFound {
                name: s3pa.name.clone(),
            })?;
        if entry.resource_version != expected_version {
            return Err(StoreError::Conflict {
                name: s3pa.name.clone(),
            });
        }
        let next = Versioned {
            resource_version: entry.resource_version + 1,
            value: s3pa,
        };
        *entry = next.clone();
        Ok(next)
    }

    async fn delete(&self, name: &str, expected_version: u64) -> Result<(), StoreError> {
        let Some((_, existing)) = self.objects.remove_if(name, |_, v| {
            v.resource_version == expected_version
        }) else {
            return if self.objects.contains_key(name) {
                Err(StoreError::Conflict {
                    name: name.to_owned(),
                })
            } else {
                Err(StoreError::NotFound {
                    name: name.to_owned(),
                })
            };
        };
        self.reindex_remove(name, &existing.value.key.node_name);
        Ok(())
    }
}

#[cfg(feature = "k8s")]
pub mod k8s {
    //! A `kube`-backed [`S3paStore`] adapter over the real
    //! `S3PodAttachment` custom resource, grounded in the xline-operator /
    //! stackable-operator `kube::Api` + `Patch::Apply` idiom.

    use std::collections::HashMap;

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
    use kube::{Client, CustomResource};
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    use crate::key::AttachmentKey;

    use super::{S3PodAttachment as CoreS3PodAttachment, S3paStore, StoreError, Versioned, WorkloadAttachment};

    /// Group `s3.csi.scality.com`, plural
    /// `mountpoints3podattachments`, cluster-scoped.
    #[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
    #[kube(
        group = "s3.csi.scality.com",
        version = "v1",
        kind = "S3PodAttachment",
        plural = "mountpoints3podattachments",
        singular = "mountpoints3podattachment",
        status = "S3PodAttachmentStatus",
        namespaced = false
    )]
    pub struct S3PodAttachmentSpec {
        pub node_name: String,
        pub persistent_volume_name: String,
        pub volume_handle: String,
        pub canonical_mount_options: String,
        pub authentication_source: String,
        pub workload_fs_group: Option<String>,
        pub workload_service_account_name: String,
        pub workload_namespace: String,
        pub workload_service_account_iam_role_arn: Option<String>,
        pub mountpoints: HashMap<String, Vec<WorkloadAttachment>>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
    pub struct S3PodAttachmentStatus {
        pub ready: bool,
    }

    pub struct KubeS3paStore {
        api: Api<S3PodAttachment>,
    }

    impl KubeS3paStore {
        pub fn new(client: Client) -> Self {
            Self {
                api: Api::all(client),
            }
        }

        const FIELD_MANAGER: &'static str = "s3-csi-driver";

        pub async fn apply(
            &self,
            name: &str,
            spec: S3PodAttachmentSpec,
        ) -> Result<S3PodAttachment, kube::Error> {
            self.api
                .patch(
                    name,
                    &PatchParams::apply(Self::FIELD_MANAGER),
                    &Patch::Apply(S3PodAttachment {
                        metadata: ObjectMeta {
                            name: Some(name.to_owned()),
                            ..Default::default()
                        },
                        spec,
                        status: None,
                    }),
                )
                .await
        }
    }

    fn resource_version_of(meta: &ObjectMeta) -> u64 {
        meta.resource_version
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn to_core(obj: S3PodAttachment) -> Option<Versioned<CoreS3PodAttachment>> {
        let name = obj.metadata.name.clone()?;
        let resource_version = resource_version_of(&obj.metadata);
        let key = AttachmentKey {
            node_name: obj.spec.node_name,
            persistent_volume_name: obj.spec.persistent_volume_name,
            volume_handle: obj.spec.volume_handle,
            canonical_mount_options: obj.spec.canonical_mount_options,
            authentication_source: obj.spec.authentication_source,
            workload_fs_group: obj.spec.workload_fs_group,
            workload_service_account_name: obj.spec.workload_service_account_name,
            workload_namespace: obj.spec.workload_namespace,
            workload_service_account_iam_role_arn: obj.spec.workload_service_account_iam_role_arn,
        };
        Some(Versioned {
            resource_version,
            value: CoreS3PodAttachment {
                name,
                key,
                mountpoints: obj.spec.mountpoints,
                ready: obj.status.map(|s| s.ready).unwrap_or(false),
            },
        })
    }

    fn to_spec(core: &CoreS3PodAttachment) -> S3PodAttachmentSpec {
        S3PodAttachmentSpec {
            node_name: core.key.node_name.clone(),
            persistent_volume_name: core.key.persistent_volume_name.clone(),
            volume_handle: core.key.volume_handle.clone(),
            canonical_mount_options: core.key.canonical_mount_options.clone(),
            authentication_source: core.key.authentication_source.clone(),
            workload_fs_group: core.key.workload_fs_group.clone(),
            workload_service_account_name: core.key.workload_service_account_name.clone(),
            workload_namespace: core.key.workload_namespace.clone(),
            workload_service_account_iam_role_arn: core.key.workload_service_account_iam_role_arn.clone(),
            mountpoints: core.mountpoints.clone(),
        }
    }

    /// Client-side filtering stands in for the CRD's selectable fields
    /// (spec.md §6 names the nine attachment-key components as selectable)
    /// since wiring server-side field selectors for a CRD needs apiserver
    /// configuration outside this crate.
    #[async_trait]
    impl S3paStore for KubeS3paStore {
        async fn get(&self, name: &str) -> Option<Versioned<CoreS3PodAttachment>> {
            self.api.get(name).await.ok().and_then(to_core)
        }

        async fn by_node(&self, node_name: &str) -> Vec<Versioned<CoreS3PodAttachment>> {
            let Ok(list) = self.api.list(&ListParams::default()).await else {
                return Vec::new();
            };
            list.items
                .into_iter()
                .filter(|obj| obj.spec.node_name == node_name)
                .filter_map(to_core)
                .collect()
        }

        async fn by_key(&self, key: &AttachmentKey) -> Option<Versioned<CoreS3PodAttachment>> {
            self.by_node(&key.node_name)
                .await
                .into_iter()
                .find(|v| &v.value.key == key)
        }

        async fn containing_workload(
            &self,
            node_name: &str,
            workload_pod_uid: &str,
        ) -> Option<Versioned<CoreS3PodAttachment>> {
            self.by_node(node_name)
                .await
                .into_iter()
                .find(|v| v.value.all_workload_uids().contains(workload_pod_uid))
        }

        async fn create(
            &self,
            s3pa: CoreS3PodAttachment,
        ) -> Result<Versioned<CoreS3PodAttachment>, StoreError> {
            let name = s3pa.name.clone();
            let obj = S3PodAttachment {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                spec: to_spec(&s3pa),
                status: Some(S3PodAttachmentStatus { ready: s3pa.ready }),
            };
            let created = self
                .api
                .create(&PostParams::default(), &obj)
                .await
                .map_err(|_| StoreError::Conflict { name: name.clone() })?;
            to_core(created).ok_or(StoreError::NotFound { name })
        }

        async fn update(
            &self,
            expected_version: u64,
            s3pa: CoreS3PodAttachment,
        ) -> Result<Versioned<CoreS3PodAttachment>, StoreError> {
            let name = s3pa.name.clone();
            let current = self
                .api
                .get(&name)
                .await
                .map_err(|_| StoreError::NotFound { name: name.clone() })?;
            if resource_version_of(&current.metadata) != expected_version {
                return Err(StoreError::Conflict { name });
            }
            let mut obj = current;
            obj.spec = to_spec(&s3pa);
            obj.status = Some(S3PodAttachmentStatus { ready: s3pa.ready });
            let updated = self
                .api
                .replace(&name, &PostParams::default(), &obj)
                .await
                .map_err(|_| StoreError::Conflict { name: name.clone() })?;
            to_core(updated).ok_or(StoreError::NotFound { name })
        }

        async fn delete(&self, name: &str, expected_version: u64) -> Result<(), StoreError> {
            let current = self
                .api
                .get(name)
                .await
                .map_err(|_| StoreError::NotFound { name: name.to_owned() })?;
            if resource_version_of(&current.metadata) != expected_version {
                return Err(StoreError::Conflict { name: name.to_owned() });
            }
            self.api
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(|_| StoreError::Conflict { name: name.to_owned() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node: &str) -> AttachmentKey {
        AttachmentKey {
            node_name: node.to_owned(),
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

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryS3paStore::new();
        let s3pa = S3PodAttachment::new("s3pa-1", key("node-a"));
        store.create(s3pa).await.unwrap();
        let fetched = store.get("s3pa-1").await.unwrap();
        assert_eq!(fetched.resource_version, 1);
        assert_eq!(fetched.value.key.node_name, "node-a");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = InMemoryS3paStore::new();
        store
            .create(S3PodAttachment::new("s3pa-1", key("node-a")))
            .await
            .unwrap();
        let err = store
            .create(S3PodAttachment::new("s3pa-1", key("node-a")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn by_node_index_scopes_correctly() {
        let store = InMemoryS3paStore::new();
        store
            .create(S3PodAttachment::new("s3pa-a", key("node-a")))
            .await
            .unwrap();
        store
            .create(S3PodAttachment::new("s3pa-b", key("node-b")))
            .await
            .unwrap();
        assert_eq!(store.by_node("node-a").await.len(), 1);
        assert_eq!(store.by_node("node-b").await.len(), 1);
        assert_eq!(store.by_node("node-c").await.len(), 0);
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = InMemoryS3paStore::new();
        let created = store
            .create(S3PodAttachment::new("s3pa-1", key("node-a")))
            .await
            .unwrap();
        let mut value = created.value.clone();
        value.ready = true;
        store.update(created.resource_version, value.clone()).await.unwrap();
        let err = store
            .update(created.resource_version, value)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn containing_workload_finds_attachment() {
        let store = InMemoryS3paStore::new();
        let mut s3pa = S3PodAttachment::new("s3pa-1", key("node-a"));
        s3pa.mountpoints.insert(
            "mp-1".to_owned(),
            vec![WorkloadAttachment {
                workload_pod_uid: "uid-1".to_owned(),
                attachment_timestamp: 0,
            }],
        );
        store.create(s3pa).await.unwrap();
        let found = store.containing_workload("node-a", "uid-1").await;
        assert!(found.is_some());
        assert!(store
            .containing_workload("node-a", "uid-unknown")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn delete_removes_from_index() {
        let store = InMemoryS3paStore::new();
        let created = store
            .create(S3PodAttachment::new("s3pa-1", key("node-a")))
            .await
            .unwrap();
        store
            .delete("s3pa-1", created.resource_version)
            .await
            .unwrap();
        assert!(store.get("s3pa-1").await.is_none());
        assert_eq!(store.by_node("node-a").await.len(), 0);
    }
}
