//! Thin CLI entry point wiring configuration, telemetry, and the Node
//! Mount Engine together. Stands in for the gRPC CSI node server the
//! driver's design notes place out of this crate's scope: a full server
//! would decode incoming NodePublishVolume/NodeUnpublishVolume RPCs and
//! call straight into `NodeMountEngine::publish`/`unpublish`.

use std::path::PathBuf;

use clap::Parser;
use s3_pod_mounter::config::DriverConfig;
use s3_pod_mounter::telemetry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "s3-pod-mounter-node", version, about)]
struct Args {
    /// Path to a TOML configuration file; missing fields fall back to
    /// defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's name, used when deriving attachment keys.
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
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

    info!(
        node = %args.node_name,
        kubelet_path = %config.kubelet_path.display(),
        "node mount engine ready"
    );

    #[cfg(feature = "k8s")]
    {
        let client = kube::Client::try_default().await?;
        let phase_view = std::sync::Arc::new(
            s3_pod_mounter::node::k8s::KubeMountpointPodPhaseView::new(client.clone()),
        );
        let annotator = std::sync::Arc::new(
            s3_pod_mounter::node::k8s::KubeAttachmentAnnotator::new(client),
        );
        let _engine = s3_pod_mounter::node::NodeMountEngine::new(config, phase_view, annotator);
        // The engine is now ready to serve publish/unpublish calls from
        // the (out-of-scope) CSI gRPC server; this process just holds it
        // alive.
        tokio::signal::ctrl_c().await?;
    }

    #[cfg(not(feature = "k8s"))]
    {
        let _ = config;
        return Err(
            "s3-pod-mounter-node was built without the `k8s` feature and cannot reach a cluster; \
             rebuild with --features k8s"
                .into(),
        );
    }

    info!("shutting down");
    Ok(())
}
