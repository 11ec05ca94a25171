//! # s3-pod-mounter
//!
//! Core library for a CSI driver that exposes S3-compatible buckets as
//! FUSE filesystems, mounted through dedicated "Mountpoint Pods" shared
//! across workload pods that need identical mount semantics.
//!
//! The crate is organised as six components in dependency order, each
//! pure/testable on its own, wired together by a reconciler and a node
//! mount engine:
//!
//! - [`policy`]: Mount-Argument Policy -- pure normalisation of caller
//!   mount options.
//! - [`credentials`]: Credential Pipeline -- provisions the per-mount
//!   credentials directory.
//! - [`volume_context`]: parses and validates the CSI publish request's
//!   volume-context map.
//! - [`podspec`]: Mountpoint-Pod Spec Builder -- deterministic pod
//!   specification construction.
//! - [`s3pa`]: S3PA Store & Indexer -- the cluster-scoped attachment
//!   record and its query surface.
//! - [`reconciler`]: groups workload pods by attachment key and drives
//!   S3PA/Mountpoint-Pod lifecycle.
//! - [`headroom`]: optional capacity-reservation placeholders.
//! - [`node`]: Node Mount Engine -- the per-node FUSE mount/handshake/bind
//!   sequence backing CSI publish/unpublish.
//!
//! ```rust,ignore
//! use s3_pod_mounter::prelude::*;
//!
//! let ctx = PolicyContext {
//!     read_only: false,
//!     fs_group: Some("1000".to_owned()),
//!     endpoint_url: Some("https://s3.example.com".to_owned()),
//!     driver_version: "0.1.0".to_owned(),
//!     authentication_source: "driver".to_owned(),
//! };
//! let rendered = policy::apply(&[], &ctx);
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod headroom;
pub mod key;
pub mod node;
pub mod podspec;
pub mod policy;
pub mod reconciler;
pub mod s3pa;
pub mod telemetry;
pub mod util;
pub mod volume_context;

/// Commonly used types for working with the driver core.
pub mod prelude {
    pub use crate::config::DriverConfig;
    pub use crate::credentials::{AuthenticationSource, CredentialPipeline, ServiceAccountToken};
    pub use crate::error::DriverError;
    pub use crate::headroom::{HeadroomBackend, HeadroomPolicy, HeadroomShape};
    pub use crate::key::AttachmentKey;
    pub use crate::node::{NodeMountEngine, PublishRequest, UnpublishRequest};
    pub use crate::podspec::{build_pod_spec, PodSpecDocument, SpecBuilderOptions};
    pub use crate::policy::{self, PolicyContext, PolicyOutput};
    pub use crate::reconciler::{Reconciler, ReconcileKey, ReconcileQueue};
    pub use crate::s3pa::{InMemoryS3paStore, S3PodAttachment, S3paStore};
    pub use crate::volume_context::VolumeContext;
}
