//! Node Mount Engine: the per-node implementation behind the CSI node
//! publish/unpublish RPCs (spec §4.6). The gRPC framing itself is out of
//! this crate's scope; [`PublishRequest`]/[`UnpublishRequest`] are the
//! crate's own structs standing in for it.

pub mod bindmount;
pub mod fuse_mount;
pub mod handshake;
#[cfg(feature = "k8s")]
pub mod k8s;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::DriverConfig;
use crate::credentials::{
    AuthenticationSource, CredentialPipeline, ServiceAccountToken, StaticKeyPair,
};
use crate::error::DriverError;
use crate::key::AttachmentKey;
use crate::podspec::{comm_layout, pod_name};
use crate::policy::{self, PolicyContext};
use crate::util::is_mount_point;
use crate::volume_context::{self, AuthSourceRequest};

use fuse_mount::FuseMountOptions;

/// Everything the node-publish RPC hands the engine, already decoded from
/// wire types.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub node_name: String,
    pub persistent_volume_name: String,
    pub bucket_name: String,
    pub target_path: PathBuf,
    pub read_only: bool,
    pub raw_mount_options: Vec<String>,
    pub volume_context: BTreeMap<String, String>,
    pub namespace: String,
    pub workload_pod_name: String,
    pub workload_pod_uid: String,
    pub workload_service_account_name: String,
    pub workload_service_account_uid: Option<String>,
    pub workload_service_account_iam_role_arn: Option<String>,
    pub workload_fs_group: Option<String>,
    pub service_account_tokens: Vec<ServiceAccountToken>,
    /// Pre-resolved static keys for `secret`-sourced authentication.
    /// Fetching the referenced Kubernetes Secret is the wire layer's job,
    /// same as `service_account_tokens` above for `pod`-sourced auth; the
    /// engine only ever consumes the already-resolved material.
    pub secret_static_keys: Option<StaticKeyPair>,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct UnpublishRequest {
    pub target_path: PathBuf,
}

/// Observes whether a named Mountpoint Pod has reached the `Running`
/// phase. The reconciler owns the authoritative answer; this is the seam
/// the node engine polls through rather than watching the cluster itself.
#[async_trait]
pub trait MountpointPodPhaseView: Send + Sync {
    async fn wait_until_running(
        &self,
        namespace: &str,
        pod_name: &str,
        deadline: Duration,
    ) -> Result<(), DriverError>;
}

/// Signals the reconciler that a workload pod's attachment should be
/// recorded, by annotating the workload pod -- the node never writes the
/// S3PA directly.
#[async_trait]
pub trait AttachmentAnnotator: Send + Sync {
    async fn request_attachment(
        &self,
        namespace: &str,
        workload_pod_name: &str,
        workload_pod_uid: &str,
        mp_pod_name: &str,
    );
}

pub struct NodeMountEngine<P: MountpointPodPhaseView, A: AttachmentAnnotator> {
    config: DriverConfig,
    phase_view: Arc<P>,
    annotator: Arc<A>,
    source_locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
}

impl<P: MountpointPodPhaseView, A: AttachmentAnnotator> NodeMountEngine<P, A> {
    pub fn new(config: DriverConfig, phase_view: Arc<P>, annotator: Arc<A>) -> Self {
        Self {
            config,
            phase_view,
            annotator,
            source_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, source_path: &std::path::Path) -> Arc<AsyncMutex<()>> {
        self.source_locks
            .entry(source_path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Implements spec §4.6 steps 1-7.
    pub async fn publish(&self, req: PublishRequest) -> Result<(), DriverError> {
        let vctx = volume_context::parse(&req.volume_context, &req.namespace)
            .map_err(|e| DriverError::InvalidVolumeContext(e.to_string()))?;

        let fs_group = vctx
            .fs_group_override
            .clone()
            .or_else(|| req.workload_fs_group.clone());

        let policy_ctx = PolicyContext {
            read_only: req.read_only,
            fs_group: fs_group.clone(),
            endpoint_url: self.config.endpoint_url.clone(),
            driver_version: env!("CARGO_PKG_VERSION").to_owned(),
            authentication_source: vctx.authentication_source.as_key_str().to_owned(),
        };
        let rendered = policy::apply(&req.raw_mount_options, &policy_ctx);
        let authentication_source = resolve_authentication_source(&vctx, &req);

        // Step 1: derive the key and the expected Mountpoint Pod name.
        let key = AttachmentKey {
            node_name: req.node_name.clone(),
            persistent_volume_name: req.persistent_volume_name.clone(),
            volume_handle: req.bucket_name.clone(),
            canonical_mount_options: rendered.canonical_options.clone(),
            authentication_source: authentication_source.as_key_str().to_owned(),
            workload_fs_group: fs_group,
            workload_service_account_name: req.workload_service_account_name.clone(),
            workload_namespace: req.namespace.clone(),
            workload_service_account_iam_role_arn: req.workload_service_account_iam_role_arn.clone(),
        };
        let mp_pod_name = pod_name(&key);

        // Step 2: wait for the Mountpoint Pod to reach Running.
        self.phase_view
            .wait_until_running(&self.config.mountpoint_namespace, &mp_pod_name, req.deadline)
            .await?;

        // Step 3: compute the source path; skip mounting if already done.
        let source_path = self.config.source_mount_path(&mp_pod_name);

        if !is_mount_point(&source_path).unwrap_or(false) {
            let lock = self.lock_for(&source_path);
            let _guard = lock.lock().await;
            if !is_mount_point(&source_path).unwrap_or(false) {
                self.establish_source_mount(
                    &source_path,
                    &mp_pod_name,
                    &rendered.argv,
                    &authentication_source,
                    &req,
                )
                .await?;
            }
        }

        // Step 6: bind-mount source to target.
        std::fs::create_dir_all(&req.target_path).map_err(|e| DriverError::BindMount {
            source_path: source_path.clone(),
            target_path: req.target_path.clone(),
            source: e,
        })?;
        bindmount::bind(&source_path, &req.target_path)?;

        // Step 7: signal the reconciler via annotation, not a direct S3PA write.
        self.annotator
            .request_attachment(
                &req.namespace,
                &req.workload_pod_name,
                &req.workload_pod_uid,
                &mp_pod_name,
            )
            .await;

        Ok(())
    }

    /// Steps 4-5: open `/dev/fuse`, mount it at `source_path`, and hand the
    /// fd to the Mountpoint Pod over its socket. On handshake failure the
    /// source mount is torn down and the credentials directory removed.
    async fn establish_source_mount(
        &self,
        source_path: &std::path::Path,
        mp_pod_name: &str,
        argv: &[String],
        authentication_source: &AuthenticationSource,
        req: &PublishRequest,
    ) -> Result<(), DriverError> {
        std::fs::create_dir_all(source_path).map_err(|e| DriverError::FuseMount {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        let kernel_read_only = policy::kernel_read_only_flag(&PolicyContext {
            read_only: req.read_only,
            ..Default::default()
        });

        let fuse_fd = fuse_mount::mount_fuse(
            source_path,
            &FuseMountOptions {
                user_id: self.config.mountpoint_uid,
                group_id: self.config.mountpoint_uid,
                allow_other: argv.iter().any(|a| a.starts_with("--allow-other") || a.starts_with("--allow-root")),
                read_only: kernel_read_only,
            },
        )?;

        // Step 5 (first half): populate the credentials directory before
        // the Mountpoint Pod ever sees the FUSE fd.
        let pipeline = CredentialPipeline::new(self.config.credentials_root());
        let provisioned = pipeline
            .provision(
                mp_pod_name,
                authentication_source,
                req.secret_static_keys.as_ref(),
            )
            .map_err(|e| {
                let _ = bindmount::unbind(source_path);
                DriverError::from(e)
            })?;
        let env: Vec<String> = provisioned
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let socket_path = self.config.comm_socket_path(mp_pod_name);
        let handshake_result = handshake::perform(
            &socket_path,
            &req.bucket_name,
            argv.to_vec(),
            env,
            comm_layout::CREDENTIALS_DIR,
            std::os::fd::AsRawFd::as_raw_fd(&fuse_fd),
            req.deadline,
        )
        .await;

        if let Err(e) = handshake_result {
            let _ = bindmount::unbind(source_path);
            let _ = pipeline.cleanup(mp_pod_name);
            return Err(e);
        }

        Ok(())
    }

    /// Unpublish only unmounts the target; the source mount is left for
    /// the reconciler/kernel to reclaim once the Mountpoint Pod is deleted.
    pub async fn unpublish(&self, req: UnpublishRequest) -> Result<(), DriverError> {
        bindmount::unbind(&req.target_path)
    }
}

fn resolve_authentication_source(
    vctx: &volume_context::VolumeContext,
    req: &PublishRequest,
) -> AuthenticationSource {
    match &vctx.authentication_source {
        AuthSourceRequest::Driver => AuthenticationSource::Driver,
        AuthSourceRequest::Secret { name, namespace } => AuthenticationSource::Secret {
            name: name.clone(),
            namespace: namespace.clone(),
        },
        AuthSourceRequest::Pod {
            service_account,
            service_account_uid,
            namespace,
        } => AuthenticationSource::Pod {
            service_account: service_account.clone(),
            service_account_uid: service_account_uid
                .clone()
                .or_else(|| req.workload_service_account_uid.clone())
                .unwrap_or_default(),
            namespace: namespace.clone(),
            tokens: req.service_account_tokens.clone(),
        },
    }
}
