//! Cluster-backed implementations of the node engine's two collaborator
//! traits, grounded in the same `kube::Api` + wait-condition idiom the CSI
//! node-server reference code and the S3PA store's k8s adapter both use.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use serde_json::json;

use crate::error::DriverError;

use super::{AttachmentAnnotator, MountpointPodPhaseView};

const FIELD_MANAGER: &str = "s3-csi-driver";

/// Polls the Mountpoint Pod's status via a watch-backed condition rather
/// than repeated `get`s.
pub struct KubeMountpointPodPhaseView {
    client: Client,
}

impl KubeMountpointPodPhaseView {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MountpointPodPhaseView for KubeMountpointPodPhaseView {
    async fn wait_until_running(
        &self,
        namespace: &str,
        pod_name: &str,
        deadline: Duration,
    ) -> Result<(), DriverError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let unavailable = || DriverError::MountpointPodUnavailable {
            namespace: namespace.to_owned(),
            pod_name: pod_name.to_owned(),
        };

        tokio::time::timeout(
            deadline,
            await_condition(api, pod_name, conditions::is_pod_running()),
        )
        .await
        .map_err(|_elapsed| unavailable())?
        .map_err(|_watch_err| unavailable())?;
        Ok(())
    }
}

/// Annotates the workload pod to signal the reconciler that this node
/// wants its attachment recorded -- the node never writes the S3PA
/// itself, per the ownership rule in the driver's design notes.
pub struct KubeAttachmentAnnotator {
    client: Client,
}

impl KubeAttachmentAnnotator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AttachmentAnnotator for KubeAttachmentAnnotator {
    async fn request_attachment(
        &self,
        namespace: &str,
        workload_pod_name: &str,
        workload_pod_uid: &str,
        mp_pod_name: &str,
    ) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": {
                "annotations": {
                    "s3.csi.scality.com/attach-to": mp_pod_name,
                    "s3.csi.scality.com/attach-uid": workload_pod_uid,
                }
            }
        });
        // Best-effort: the reconciler resyncs on a timer regardless, so a
        // failure here delays but does not lose the attachment.
        let _ = api
            .patch(
                workload_pod_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await;
    }
}
