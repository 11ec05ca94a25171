//! Reconciler: the control loop that watches workload pods and S3PA
//! objects, chooses or creates Mountpoint Pods, updates attachments, and
//! garbage-collects.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::key::AttachmentKey;
use crate::s3pa::{S3PodAttachment, S3paStore, StoreError, WorkloadAttachment};

#[cfg(feature = "k8s")]
pub mod k8s {
    //! A `kube`-backed [`super::WorkloadPodView`], listing workload pods
    //! scheduled on a node that reference a given `PersistentVolume` by
    //! its claim, grounded in the same `kube::Api` list/field-selector
    //! idiom as the pack's CSI node-server reference code.

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::{Api, ListParams};
    use kube::Client;

    use super::{WorkloadPod, WorkloadPodPhase, WorkloadPodView};

    pub struct KubeWorkloadPodView {
        client: Client,
        /// Annotation a workload pod carries naming the PVC it wants
        /// mounted, since a bare `Pod` doesn't expose its PV by name.
        pvc_annotation_key: String,
    }

    impl KubeWorkloadPodView {
        pub fn new(client: Client, pvc_annotation_key: impl Into<String>) -> Self {
            Self {
                client,
                pvc_annotation_key: pvc_annotation_key.into(),
            }
        }
    }

    #[async_trait]
    impl WorkloadPodView for KubeWorkloadPodView {
        async fn list_candidates(
            &self,
            node_name: &str,
            persistent_volume_name: &str,
        ) -> Vec<WorkloadPod> {
            let api: Api<Pod> = Api::all(self.client.clone());
            let list_params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
            let Ok(pods) = api.list(&list_params).await else {
                return Vec::new();
            };

            pods.items
                .into_iter()
                .filter(|pod| {
                    pod.metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(&self.pvc_annotation_key))
                        .map(|v| v == persistent_volume_name)
                        .unwrap_or(false)
                })
                .filter_map(|pod| {
                    let uid = pod.metadata.uid.clone()?;
                    let spec = pod.spec.as_ref()?;
                    let phase = match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                        Some("Running") => WorkloadPodPhase::Running,
                        Some("Succeeded") => WorkloadPodPhase::Succeeded,
                        Some("Failed") => WorkloadPodPhase::Failed,
                        _ => WorkloadPodPhase::Pending,
                    };
                    Some(WorkloadPod {
                        uid,
                        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                        service_account_name: spec
                            .service_account_name
                            .clone()
                            .unwrap_or_else(|| "default".to_owned()),
                        service_account_iam_role_arn: pod
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get("eks.amazonaws.com/role-arn"))
                            .cloned(),
                        fs_group: spec
                            .security_context
                            .as_ref()
                            .and_then(|sc| sc.fs_group)
                            .map(|g| g.to_string()),
                        phase,
                    })
                })
                .collect()
        }
    }
}

/// The reconcile unit: each event maps to one or more of these and
/// enqueues them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    pub node_name: String,
    pub persistent_volume_name: String,
}

/// A workload pod as the reconciler needs to see it: enough to derive an
/// attachment key and to know it is still a live candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPod {
    pub uid: String,
    pub namespace: String,
    pub service_account_name: String,
    pub service_account_iam_role_arn: Option<String>,
    pub fs_group: Option<String>,
    pub phase: WorkloadPodPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPodPhase {
    fn is_terminal(self) -> bool {
        matches!(self, WorkloadPodPhase::Succeeded | WorkloadPodPhase::Failed)
    }
}

/// Abstraction over "list workload pods on this node that reference this
/// PV", the one piece of cluster state the reconciler needs besides the
/// S3PA store. The real implementation is `kube`-backed and lives outside
/// this crate's required scope; an in-memory double exercises the
/// reconciler's logic fully in tests.
#[async_trait]
pub trait WorkloadPodView: Send + Sync {
    async fn list_candidates(
        &self,
        node_name: &str,
        persistent_volume_name: &str,
    ) -> Vec<WorkloadPod>;
}

/// In-memory test double / reference implementation.
#[derive(Default)]
pub struct InMemoryWorkloadPodView {
    pods: DashMap<(String, String), Vec<WorkloadPod>>,
}

impl InMemoryWorkloadPodView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pods(&self, node_name: &str, pv_name: &str, pods: Vec<WorkloadPod>) {
        self.pods
            .insert((node_name.to_owned(), pv_name.to_owned()), pods);
    }
}

#[async_trait]
impl WorkloadPodView for InMemoryWorkloadPodView {
    async fn list_candidates(
        &self,
        node_name: &str,
        persistent_volume_name: &str,
    ) -> Vec<WorkloadPod> {
        self.pods
            .get(&(node_name.to_owned(), persistent_volume_name.to_owned()))
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// The PV-level inputs that don't come from any individual workload pod:
/// the volume handle and the driver's policy-rendered canonical mount
/// options.
#[derive(Debug, Clone)]
pub struct PersistentVolumeInfo {
    pub volume_handle: String,
    pub canonical_mount_options: String,
}

/// Derive a candidate's attachment key from its own spec plus the PV info.
pub fn derive_key(
    node_name: &str,
    pv: &PersistentVolumeInfo,
    pv_name: &str,
    pod: &WorkloadPod,
    authentication_source: &str,
) -> AttachmentKey {
    AttachmentKey {
        node_name: node_name.to_owned(),
        persistent_volume_name: pv_name.to_owned(),
        volume_handle: pv.volume_handle.clone(),
        canonical_mount_options: pv.canonical_mount_options.clone(),
        authentication_source: authentication_source.to_owned(),
        workload_fs_group: pod.fs_group.clone(),
        workload_service_account_name: pod.service_account_name.clone(),
        workload_namespace: pod.namespace.clone(),
        workload_service_account_iam_role_arn: pod.service_account_iam_role_arn.clone(),
    }
}

/// Lifecycle of a single Mountpoint Pod as observed by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountpointPodPhase {
    Pending,
    Starting,
    Running,
    Terminating,
    Gone,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseTransitionError {
    #[error("Running -> Terminating is never spontaneous; it requires zero attachments and a cooldown")]
    SpontaneousTermination,
    #[error("{from:?} cannot transition to {to:?}")]
    Illegal {
        from: MountpointPodPhase,
        to: MountpointPodPhase,
    },
}

impl MountpointPodPhase {
    /// Validate an externally-observed transition. `reconciler_requested`
    /// must be true for the Running -> Terminating edge: it is never
    /// spontaneous.
    pub fn transition(
        self,
        observed: MountpointPodPhase,
        reconciler_requested: bool,
    ) -> Result<MountpointPodPhase, PhaseTransitionError> {
        use MountpointPodPhase::*;
        match (self, observed) {
            (Pending, Pending) => Ok(Pending),
            (Pending, Starting) => Ok(Starting),
            (Starting, Starting) => Ok(Starting),
            (Starting, Running) => Ok(Running),
            (Running, Running) => Ok(Running),
            (Running, Terminating) if reconciler_requested => Ok(Terminating),
            (Running, Terminating) => Err(PhaseTransitionError::SpontaneousTermination),
            (Terminating, Terminating) => Ok(Terminating),
            (Terminating, Gone) => Ok(Gone),
            (Gone, Gone) => Ok(Gone),
            (from, to) => Err(PhaseTransitionError::Illegal { from, to }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ExpectationCounts {
    pending_creates: u32,
    pending_deletes: u32,
}

/// Tracks in-flight creations/deletions per S3PA name so a reconcile
/// triggered by watch-lag duplicates doesn't redo work already issued.
#[derive(Default)]
pub struct Expectations {
    counts: DashMap<String, ExpectationCounts>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_create(&self, name: &str) {
        self.counts.entry(name.to_owned()).or_default().pending_creates += 1;
    }

    pub fn expect_delete(&self, name: &str) {
        self.counts.entry(name.to_owned()).or_default().pending_deletes += 1;
    }

    pub fn observed_create(&self, name: &str) {
        if let Some(mut c) = self.counts.get_mut(name) {
            c.pending_creates = c.pending_creates.saturating_sub(1);
        }
    }

    pub fn observed_delete(&self, name: &str) {
        if let Some(mut c) = self.counts.get_mut(name) {
            c.pending_deletes = c.pending_deletes.saturating_sub(1);
        }
    }

    /// Whether all expectations for `name` have been observed, i.e. it's
    /// safe to act on it again.
    pub fn satisfied(&self, name: &str) -> bool {
        self.counts
            .get(name)
            .map(|c| c.pending_creates == 0 && c.pending_deletes == 0)
            .unwrap_or(true)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decision the reconciler made for one candidate group, surfaced mainly
/// for tests to assert against.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub key: AttachmentKey,
    pub s3pa_name: String,
    pub selected_mountpoint_pod: String,
    pub created_s3pa: bool,
    pub created_mountpoint_pod: bool,
}

/// One Mountpoint Pod this reconciler knows about, with however many
/// workloads it already serves (used only to pick the pod with room;
/// actual pod lifecycle is driven by the Spec Builder + cluster API
/// outside this crate's core).
#[derive(Debug, Clone)]
pub struct MountpointPodHandle {
    pub name: String,
    pub attached_workload_count: usize,
}

pub struct Reconciler<S: S3paStore, W: WorkloadPodView> {
    store: Arc<S>,
    pods: Arc<W>,
    expectations: Arc<Expectations>,
    max_workloads_per_mountpoint_pod: Option<usize>,
}

impl<S: S3paStore, W: WorkloadPodView> Reconciler<S, W> {
    pub fn new(
        store: Arc<S>,
        pods: Arc<W>,
        max_workloads_per_mountpoint_pod: Option<usize>,
    ) -> Self {
        Self {
            store,
            pods,
            expectations: Arc::new(Expectations::new()),
            max_workloads_per_mountpoint_pod,
        }
    }

    pub fn expectations(&self) -> Arc<Expectations> {
        self.expectations.clone()
    }

    /// Steps 1-5 of the reconcile unit, against a single (node, PV) pair.
    /// `pv` and `authentication_source` stand in for information a real
    /// deployment resolves from the PersistentVolume object and the
    /// Credential Pipeline's classification; both are out-of-process
    /// collaborators here.
    pub async fn reconcile_once(
        &self,
        key: &ReconcileKey,
        pv: &PersistentVolumeInfo,
        authentication_source: &str,
        clock_now: i64,
    ) -> Result<Vec<GroupPlan>, ReconcileError> {
        // Step 1: enumerate candidates.
        let candidates: Vec<WorkloadPod> = self
            .pods
            .list_candidates(&key.node_name, &key.persistent_volume_name)
            .await
            .into_iter()
            .filter(|p| !p.phase.is_terminal())
            .collect();

        // Step 2/3: classify and group by attachment key.
        let mut groups: std::collections::HashMap<AttachmentKey, Vec<&WorkloadPod>> =
            std::collections::HashMap::new();
        for pod in &candidates {
            let pod_key = derive_key(
                &key.node_name,
                pv,
                &key.persistent_volume_name,
                pod,
                authentication_source,
            );
            groups.entry(pod_key).or_default().push(pod);
        }

        let mut plans = Vec::new();
        for (pod_key, pods_in_group) in groups {
            let plan = self
                .reconcile_group(&pod_key, &pods_in_group, clock_now)
                .await?;
            plans.push(plan);
        }

        // Step 4: reap S3PAs on this node whose groups have all vanished.
        self.reap_node(&key.node_name).await?;

        Ok(plans)
    }

    async fn reconcile_group(
        &self,
        pod_key: &AttachmentKey,
        pods_in_group: &[&WorkloadPod],
        clock_now: i64,
    ) -> Result<GroupPlan, ReconcileError> {
        let existing = self.store.by_key(pod_key).await;

        let (mut s3pa, resource_version, created_s3pa) = match existing {
            Some(v) => (v.value, v.resource_version, false),
            None => {
                let name = format!("s3pa-{}", pod_key.hash_hex());
                if !self.expectations.satisfied(&name) {
                    // A create for this key is already in flight; skip to
                    // avoid duplicate work from watch-lag re-delivery.
                    return Ok(GroupPlan {
                        key: pod_key.clone(),
                        s3pa_name: name.clone(),
                        selected_mountpoint_pod: String::new(),
                        created_s3pa: false,
                        created_mountpoint_pod: false,
                    });
                }
                self.expectations.expect_create(&name);
                let created = self
                    .store
                    .create(S3PodAttachment::new(name.clone(), pod_key.clone()))
                    .await;
                self.expectations.observed_create(&name);
                match created {
                    Ok(v) => (v.value, v.resource_version, true),
                    // Another reconciler won the race: adopt its object.
                    Err(StoreError::Conflict { .. }) => {
                        let winner = self
                            .store
                            .get(&name)
                            .await
                            .expect("conflicting create implies the object now exists");
                        (winner.value, winner.resource_version, false)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // Find an existing Mountpoint Pod with room, lexicographically
        // smallest name wins ties.
        let mut candidate_names: Vec<&String> = s3pa.mountpoints.keys().collect();
        candidate_names.sort();
        let selected = candidate_names.into_iter().find(|name| {
            let count = s3pa.mountpoints.get(*name).map(Vec::len).unwrap_or(0);
            self.max_workloads_per_mountpoint_pod
                .map(|max| count < max)
                .unwrap_or(true)
        });

        let (selected_name, created_mountpoint_pod) = match selected {
            Some(name) => (name.clone(), false),
            None => {
                let salted = format!("mp-{}", pod_key.hash_hex());
                self.expectations.expect_create(&salted);
                s3pa.mountpoints.entry(salted.clone()).or_default();
                self.expectations.observed_create(&salted);
                (salted, true)
            }
        };

        // Ensure every candidate appears in exactly one mountpoints list;
        // add missing UIDs, remove stale ones not in this group anymore.
        let wanted: HashSet<&str> = pods_in_group.iter().map(|p| p.uid.as_str()).collect();

        for (_, attachments) in s3pa.mountpoints.iter_mut() {
            attachments.retain(|a| wanted.contains(a.workload_pod_uid.as_str()));
        }

        let already_attached: HashSet<String> = s3pa
            .mountpoints
            .values()
            .flatten()
            .map(|a| a.workload_pod_uid.clone())
            .collect();

        let entry = s3pa.mountpoints.entry(selected_name.clone()).or_default();
        for pod in pods_in_group {
            if !already_attached.contains(&pod.uid) {
                entry.push(WorkloadAttachment {
                    workload_pod_uid: pod.uid.clone(),
                    attachment_timestamp: clock_now,
                });
            }
        }

        self.store.update(resource_version, s3pa).await?;

        Ok(GroupPlan {
            key: pod_key.clone(),
            s3pa_name: format!("s3pa-{}", pod_key.hash_hex()),
            selected_mountpoint_pod: selected_name,
            created_s3pa,
            created_mountpoint_pod,
        })
    }

    /// Step 4/5: delete Mountpoint Pod entries with zero attachments, and
    /// the S3PA itself once every entry is empty.
    async fn reap_node(&self, node_name: &str) -> Result<(), ReconcileError> {
        for versioned in self.store.by_node(node_name).await {
            let mut s3pa = versioned.value;
            let before = s3pa.mountpoints.len();
            s3pa.mountpoints.retain(|_, v| !v.is_empty());
            let changed = s3pa.mountpoints.len() != before;

            if s3pa.mountpoints.is_empty() {
                if self.expectations.satisfied(&s3pa.name) {
                    self.expectations.expect_delete(&s3pa.name);
                    let _ = self
                        .store
                        .delete(&s3pa.name, versioned.resource_version)
                        .await;
                    self.expectations.observed_delete(&s3pa.name);
                }
            } else if changed {
                let _ = self.store.update(versioned.resource_version, s3pa).await;
            }
        }
        Ok(())
    }
}

/// A deduplicated work queue: a key already pending or in-flight is not
/// enqueued twice, matching "each key is processed by at most one worker
/// at a time".
#[derive(Default)]
pub struct ReconcileQueue {
    queued: Mutex<VecDeque<ReconcileKey>>,
    pending: DashSet<ReconcileKey>,
}

impl ReconcileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key; a no-op if it's already queued or currently being
    /// processed.
    pub async fn enqueue(&self, key: ReconcileKey) {
        if self.pending.insert(key.clone()) {
            self.queued.lock().await.push_back(key);
        }
    }

    /// Pop the next key to process. The key remains marked pending until
    /// [`ReconcileQueue::done`] is called, so a re-enqueue that races with
    /// in-flight processing is coalesced into a follow-up run rather than
    /// a concurrent one.
    pub async fn pop(&self) -> Option<ReconcileKey> {
        self.queued.lock().await.pop_front()
    }

    pub fn done(&self, key: &ReconcileKey) {
        self.pending.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3pa::InMemoryS3paStore;

    fn pv() -> PersistentVolumeInfo {
        PersistentVolumeInfo {
            volume_handle: "bucket-1".to_owned(),
            canonical_mount_options: "--allow-root".to_owned(),
        }
    }

    fn pod(uid: &str, fs_group: Option<&str>) -> WorkloadPod {
        WorkloadPod {
            uid: uid.to_owned(),
            namespace: "ns".to_owned(),
            service_account_name: "default".to_owned(),
            service_account_iam_role_arn: None,
            fs_group: fs_group.map(str::to_owned),
            phase: WorkloadPodPhase::Running,
        }
    }

    async fn setup() -> (
        Reconciler<InMemoryS3paStore, InMemoryWorkloadPodView>,
        Arc<InMemoryWorkloadPodView>,
    ) {
        let store = Arc::new(InMemoryS3paStore::new());
        let view = Arc::new(InMemoryWorkloadPodView::new());
        (Reconciler::new(store, view.clone(), None), view)
    }

    #[tokio::test]
    async fn pod_sharing_with_equal_key() {
        let (r, view) = setup().await;
        let key = ReconcileKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
        };
        view.set_pods(
            "node-a",
            "pv-1",
            vec![pod("uid-1", Some("1000")), pod("uid-2", Some("1000"))],
        );

        let plans = r.reconcile_once(&key, &pv(), "driver", 0).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].selected_mountpoint_pod.is_empty());

        let s3pas = r.store.by_node("node-a").await;
        assert_eq!(s3pas.len(), 1);
        let s3pa = &s3pas[0].value;
        assert_eq!(s3pa.mountpoints.len(), 1);
        let attachments = s3pa.mountpoints.values().next().unwrap();
        assert_eq!(attachments.len(), 2);
    }

    #[tokio::test]
    async fn key_difference_forces_separate_mountpoint_pods() {
        let (r, view) = setup().await;
        let key = ReconcileKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
        };
        view.set_pods(
            "node-a",
            "pv-1",
            vec![pod("uid-1", Some("1000")), pod("uid-2", Some("2000"))],
        );

        r.reconcile_once(&key, &pv(), "driver", 0).await.unwrap();

        let s3pas = r.store.by_node("node-a").await;
        assert_eq!(s3pas.len(), 2);
        for v in &s3pas {
            assert_eq!(v.value.mountpoints.len(), 1);
        }
    }

    #[tokio::test]
    async fn workload_deletion_reaps_s3pa_and_mountpoint_pod() {
        let (r, view) = setup().await;
        let key = ReconcileKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
        };
        view.set_pods(
            "node-a",
            "pv-1",
            vec![pod("uid-1", Some("1000")), pod("uid-2", Some("1000"))],
        );
        r.reconcile_once(&key, &pv(), "driver", 0).await.unwrap();
        assert_eq!(r.store.by_node("node-a").await.len(), 1);

        view.set_pods("node-a", "pv-1", vec![]);
        r.reconcile_once(&key, &pv(), "driver", 1).await.unwrap();

        assert_eq!(r.store.by_node("node-a").await.len(), 0);
    }

    #[tokio::test]
    async fn at_most_one_membership_across_reconciles() {
        let (r, view) = setup().await;
        let key = ReconcileKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
        };
        view.set_pods("node-a", "pv-1", vec![pod("uid-1", None)]);
        r.reconcile_once(&key, &pv(), "driver", 0).await.unwrap();
        r.reconcile_once(&key, &pv(), "driver", 1).await.unwrap();

        let s3pas = r.store.by_node("node-a").await;
        let occurrences: usize = s3pas
            .iter()
            .map(|v| {
                v.value
                    .mountpoints
                    .values()
                    .flatten()
                    .filter(|a| a.workload_pod_uid == "uid-1")
                    .count()
            })
            .sum();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn phase_transitions_forbid_spontaneous_termination() {
        use MountpointPodPhase::*;
        assert_eq!(Pending.transition(Starting, false), Ok(Starting));
        assert_eq!(Starting.transition(Running, false), Ok(Running));
        assert_eq!(
            Running.transition(Terminating, false),
            Err(PhaseTransitionError::SpontaneousTermination)
        );
        assert_eq!(Running.transition(Terminating, true), Ok(Terminating));
        assert_eq!(Terminating.transition(Gone, false), Ok(Gone));
    }

    #[tokio::test]
    async fn queue_deduplicates_pending_keys() {
        let queue = ReconcileQueue::new();
        let key = ReconcileKey {
            node_name: "node-a".to_owned(),
            persistent_volume_name: "pv-1".to_owned(),
        };
        queue.enqueue(key.clone()).await;
        queue.enqueue(key.clone()).await;
        assert_eq!(queue.len().await, 1);
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped, key.clone());
        queue.done(&key);
        queue.enqueue(key.clone()).await;
        assert_eq!(queue.len().await, 1);
    }
}
