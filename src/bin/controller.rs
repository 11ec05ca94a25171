//! Thin CLI entry point wiring configuration, telemetry, the S3PA store,
//! and the reconciler together. Stands in for the controller side of the
//! out-of-scope gRPC CSI surface: in a full deployment this process would
//! also run the controller-server RPCs, which do nothing more than
//! validate requests before the reconciler takes over.

#[cfg(feature = "k8s")]
use std::collections::HashSet;
use std::path::PathBuf;
#[cfg(feature = "k8s")]
use std::sync::Arc;
#[cfg(feature = "k8s")]
use std::time::Duration;

use clap::Parser;
use s3_pod_mounter::config::DriverConfig;
#[cfg(feature = "k8s")]
use s3_pod_mounter::reconciler::{PersistentVolumeInfo, ReconcileKey, Reconciler};
use s3_pod_mounter::telemetry;
use tracing::info;
#[cfg(feature = "k8s")]
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "s3-pod-mounter-controller", version, about)]
struct Args {
    /// Path to a TOML configuration file; missing fields fall back to
    /// defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between reconcile sweeps.
    #[arg(long, default_value_t = 10)]
    resync_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    }
    .apply_env();

    info!(workers = config.reconciler_workers, "controller starting");

    #[cfg(feature = "k8s")]
    {
        run_k8s(config, args.resync_seconds).await?;
    }

    #[cfg(not(feature = "k8s"))]
    {
        let _ = config;
        let _ = args.resync_seconds;
        return Err(
            "s3-pod-mounter-controller was built without the `k8s` feature and cannot reach a \
             cluster; rebuild with --features k8s"
                .into(),
        );
    }

    Ok(())
}

const PVC_ANNOTATION_KEY: &str = "s3.csi.scality.com/persistent-volume";

#[cfg(feature = "k8s")]
async fn run_k8s(
    config: DriverConfig,
    resync_seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    use k8s_openapi::api::core::v1::{Pod, PersistentVolume};
    use kube::api::{Api, ListParams};
    use s3_pod_mounter::reconciler::k8s::KubeWorkloadPodView;
    use s3_pod_mounter::s3pa::k8s::KubeS3paStore;

    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeS3paStore::new(client.clone()));
    let pods_view = Arc::new(KubeWorkloadPodView::new(client.clone(), PVC_ANNOTATION_KEY));
    let reconciler = Arc::new(Reconciler::new(
        store,
        pods_view,
        config.max_workloads_per_mountpoint_pod,
    ));
    let all_pods: Api<Pod> = Api::all(client.clone());
    let all_pvs: Api<PersistentVolume> = Api::all(client);

    let mut ticker = tokio::time::interval(Duration::from_secs(resync_seconds));
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Discover (node, PV) candidate pairs from the annotation
                // every workload pod carries; the full gRPC/watch layer
                // that would push these incrementally is out of scope.
                let pairs = match all_pods.list(&ListParams::default()).await {
                    Ok(list) => list
                        .items
                        .into_iter()
                        .filter_map(|pod| {
                            let node = pod.spec.as_ref()?.node_name.clone()?;
                            let pv = pod
                                .metadata
                                .annotations
                                .as_ref()?
                                .get(PVC_ANNOTATION_KEY)?
                                .clone();
                            Some((node, pv))
                        })
                        .collect::<HashSet<_>>(),
                    Err(e) => {
                        warn!(error = %e, "listing workload pods failed");
                        continue;
                    }
                };

                for (node_name, pv_name) in pairs {
                    let volume_handle = match all_pvs.get(&pv_name).await {
                        Ok(pv) => pv
                            .spec
                            .and_then(|s| s.csi)
                            .map(|csi| csi.volume_handle)
                            .unwrap_or_else(|| pv_name.clone()),
                        Err(e) => {
                            warn!(pv = %pv_name, error = %e, "fetching PersistentVolume failed");
                            continue;
                        }
                    };

                    let key = ReconcileKey {
                        node_name: node_name.clone(),
                        persistent_volume_name: pv_name.clone(),
                    };
                    let pv_info = PersistentVolumeInfo {
                        volume_handle,
                        canonical_mount_options: String::new(),
                    };
                    if let Err(e) = reconciler.reconcile_once(&key, &pv_info, "driver", 0).await {
                        warn!(node = %node_name, pv = %pv_name, error = %e, "reconcile failed");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
