//! Shared error taxonomy for the Pod-Mounter core.
//!
//! Each component has its own error enum; [`DriverError`] is the
//! caller-facing taxonomy a CSI node/controller shim would translate into a
//! gRPC status. The kinds correspond 1:1 to the failure classes catalogued
//! in the driver's design notes.

use std::path::PathBuf;

use thiserror::Error;

use crate::credentials::CredentialError;

/// Top-level error taxonomy surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid volume context: {0}")]
    InvalidVolumeContext(String),

    #[error("failed to fetch secret for volume context: {0}")]
    SecretFetch(String),

    #[error("service account token unavailable: {0}")]
    TokenUnavailable(String),

    #[error(
        "no Running Mountpoint Pod named {pod_name} in namespace {namespace} within deadline; \
         inspect with: kubectl logs -n {namespace} {pod_name}"
    )]
    MountpointPodUnavailable { namespace: String, pod_name: String },

    #[error("handshake with Mountpoint Pod {pod_name} failed: {detail}")]
    MountpointHandshake { pod_name: String, detail: String },

    #[error("FUSE mount at {path} failed: {source}")]
    FuseMount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bind mount from {source_path} to {target_path} failed: {source}")]
    BindMount {
        source_path: PathBuf,
        target_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("S3PodAttachment {name} write conflict, retrying")]
    S3PAConflict { name: String },

    #[error("observed stale resource version for {name}, dropping")]
    Stale { name: String },
}

impl From<CredentialError> for DriverError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidVolumeContext(detail) => DriverError::InvalidVolumeContext(detail),
            CredentialError::SecretFetch {
                name,
                namespace,
                detail,
            } => DriverError::SecretFetch(format!("{name} in {namespace}: {detail}")),
            CredentialError::TokenUnavailable {
                service_account,
                detail,
            } => DriverError::TokenUnavailable(format!("{service_account}: {detail}")),
            CredentialError::Io(io_err) => {
                DriverError::SecretFetch(format!("i/o error provisioning credentials: {io_err}"))
            }
        }
    }
}

impl DriverError {
    /// Whether the CSI framework (or reconciler) should retry the call that
    /// produced this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            DriverError::InvalidVolumeContext(_) => false,
            DriverError::SecretFetch(_) => true,
            DriverError::TokenUnavailable(_) => true,
            DriverError::MountpointPodUnavailable { .. } => true,
            DriverError::MountpointHandshake { .. } => true,
            DriverError::FuseMount { .. } => false,
            DriverError::BindMount { .. } => false,
            DriverError::S3PAConflict { .. } => true,
            DriverError::Stale { .. } => false,
        }
    }
}
