//! Mountpoint-Pod Spec Builder: a deterministic pure function from an
//! attachment key plus a policy-rendered argument vector to a pod
//! specification.

use std::collections::BTreeMap;

use crate::key::AttachmentKey;

/// Fixed layout of the shared `emptyDir` every Mountpoint Pod gets, known
/// to both the pod's own entrypoint and the Node Mount Engine.
pub mod comm_layout {
    pub const MOUNT_DIR: &str = "/comm";
    pub const SOCKET_PATH: &str = "/comm/mount.sock";
    pub const CREDENTIALS_DIR: &str = "/comm/credentials";
    pub const ERROR_SENTINEL: &str = "/comm/mount.error";
    pub const TERMINATE_SENTINEL: &str = "/comm/terminate";
}

/// Which priority class a Mountpoint Pod should be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPriority {
    /// Ordinary Mountpoint Pod.
    Critical,
    /// Intended to preempt a headroom placeholder.
    Preempting,
}

/// Options that shape pod construction but aren't part of the attachment
/// key (image, UID, priority-class names, resource requests/limits, and
/// the cache-volume request resolved per the `volumeAttributes` >
/// `StorageClass` precedence decision recorded in DESIGN.md).
#[derive(Debug, Clone)]
pub struct SpecBuilderOptions {
    pub namespace: String,
    pub image: String,
    pub uid: u32,
    pub priority_class_critical: String,
    pub priority_class_preempting: String,
    pub priority: PodPriority,
    pub cache_size_bytes: Option<u64>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

/// A minimal volume description, translated to a real Kubernetes volume by
/// the `k8s` feature's conversion layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    EmptyDir { size_limit_bytes: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
}

/// Security context fields the Mountpoint Pod's container must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContextSpec {
    pub run_as_user: u32,
    pub run_as_non_root: bool,
    pub allow_privilege_escalation: bool,
    pub drop_all_capabilities: bool,
    pub fs_group: u32,
    pub seccomp_profile_default: bool,
}

/// The driver-owned pod specification document, decoupled from
/// `k8s_openapi` so the pure builder can be exercised without a cluster
/// client dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpecDocument {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub security_context: SecurityContextSpec,
    pub volumes: Vec<VolumeSpec>,
    pub priority_class_name: String,
}

/// Derive the stable Mountpoint Pod name from the attachment key, the same
/// `mp-{key.hash_hex()}` scheme the reconciler uses when it creates a new
/// Mountpoint Pod entry (`reconciler::Reconciler::reconcile_group`). The
/// Node Mount Engine recomputes this same name from the key it derives out
/// of the publish request, without consulting the API server, so it must
/// stay in lockstep with the reconciler's naming.
pub fn pod_name(key: &AttachmentKey) -> String {
    format!("mp-{}", key.hash_hex())
}

/// Build the Mountpoint Pod spec for one attachment key. Pure and
/// synchronous: two calls with byte-equal inputs yield byte-equal specs.
pub fn build_pod_spec(
    key: &AttachmentKey,
    owning_s3pa_name: &str,
    argv: &[String],
    env: &[(String, String)],
    opts: &SpecBuilderOptions,
) -> PodSpecDocument {
    let name = pod_name(key);

    let mut labels = BTreeMap::new();
    labels.insert("s3.csi.scality.com/s3pa".to_owned(), owning_s3pa_name.to_owned());
    labels.insert(
        "s3.csi.scality.com/persistent-volume".to_owned(),
        key.persistent_volume_name.clone(),
    );
    labels.insert("s3.csi.scality.com/node".to_owned(), key.node_name.clone());
    labels.insert(
        "s3.csi.scality.com/attachment-key-hash".to_owned(),
        key.hash_hex(),
    );

    let mut volumes = vec![VolumeSpec {
        name: "comm".to_owned(),
        mount_path: comm_layout::MOUNT_DIR.to_owned(),
        source: VolumeSource::EmptyDir {
            size_limit_bytes: None,
        },
    }];
    if let Some(size) = opts.cache_size_bytes {
        volumes.push(VolumeSpec {
            name: "cache".to_owned(),
            mount_path: "/cache".to_owned(),
            source: VolumeSource::EmptyDir {
                size_limit_bytes: Some(size),
            },
        });
    }

    let priority_class_name = match opts.priority {
        PodPriority::Critical => opts.priority_class_critical.clone(),
        PodPriority::Preempting => opts.priority_class_preempting.clone(),
    };

    PodSpecDocument {
        name,
        namespace: opts.namespace.clone(),
        labels,
        image: opts.image.clone(),
        argv: argv.to_vec(),
        env: env.to_vec(),
        security_context: SecurityContextSpec {
            run_as_user: opts.uid,
            run_as_non_root: true,
            allow_privilege_escalation: false,
            drop_all_capabilities: true,
            fs_group: opts.uid,
            seccomp_profile_default: true,
        },
        volumes,
        priority_class_name,
    }
}

/// Resolve the cache-volume size: `volumeAttributes` (the context-level
/// `cacheSize`) wins over a `StorageClass` parameter when both are
/// present (see DESIGN.md Open Question decision).
pub fn resolve_cache_size(
    volume_attributes_cache_size: Option<u64>,
    storage_class_cache_size: Option<u64>,
) -> Option<u64> {
    volume_attributes_cache_size.or(storage_class_cache_size)
}

#[cfg(feature = "k8s")]
pub mod k8s {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Capabilities, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec,
        SeccompProfile, SecurityContext, Volume, VolumeMount,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    impl PodSpecDocument {
        /// Convert the driver-owned document into a real Kubernetes `Pod`
        /// object, used by the reconciler's `kube`-backed adapter.
        pub fn to_k8s_pod(&self) -> Pod {
            let volume_mounts: Vec<VolumeMount> = self
                .volumes
                .iter()
                .map(|v| VolumeMount {
                    name: v.name.clone(),
                    mount_path: v.mount_path.clone(),
                    ..Default::default()
                })
                .collect();

            let volumes: Vec<Volume> = self
                .volumes
                .iter()
                .map(|v| {
                    let VolumeSource::EmptyDir { size_limit_bytes } = v.source;
                    Volume {
                        name: v.name.clone(),
                        empty_dir: Some(EmptyDirVolumeSource {
                            size_limit: size_limit_bytes
                                .map(|b| Quantity(format!("{b}"))),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }
                })
                .collect();

            let env: Vec<EnvVar> = self
                .env
                .iter()
                .map(|(k, v)| EnvVar {
                    name: k.clone(),
                    value: Some(v.clone()),
                    ..Default::default()
                })
                .collect();

            Pod {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(self.labels.clone().into_iter().collect()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    priority_class_name: Some(self.priority_class_name.clone()),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(self.security_context.run_as_user as i64),
                        run_as_non_root: Some(self.security_context.run_as_non_root),
                        fs_group: Some(self.security_context.fs_group as i64),
                        ..Default::default()
                    }),
                    containers: vec![Container {
                        name: "mount-s3".to_owned(),
                        image: Some(self.image.clone()),
                        args: Some(self.argv.clone()),
                        env: Some(env),
                        volume_mounts: Some(volume_mounts),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(
                                self.security_context.allow_privilege_escalation,
                            ),
                            capabilities: Some(Capabilities {
                                drop: Some(vec!["ALL".to_owned()]),
                                ..Default::default()
                            }),
                            seccomp_profile: Some(SeccompProfile {
                                type_: "RuntimeDefault".to_owned(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AttachmentKey {
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

    fn opts() -> SpecBuilderOptions {
        SpecBuilderOptions {
            namespace: "mount-s3".to_owned(),
            image: "mountpoint:latest".to_owned(),
            uid: 1000,
            priority_class_critical: "critical".to_owned(),
            priority_class_preempting: "preempting".to_owned(),
            priority: PodPriority::Critical,
            cache_size_bytes: None,
            cpu_request: None,
            memory_request: None,
            cpu_limit: None,
            memory_limit: None,
        }
    }

    #[test]
    fn pod_name_is_deterministic_and_independent_of_api_server() {
        let a = pod_name(&key());
        let b = pod_name(&key());
        assert_eq!(a, b);

        let mut other = key();
        other.persistent_volume_name = "pv-2".to_owned();
        assert_ne!(a, pod_name(&other));
    }

    #[test]
    fn byte_equal_inputs_yield_byte_equal_specs() {
        let argv = vec!["--allow-root".to_owned()];
        let env = vec![("AWS_ENDPOINT_URL".to_owned(), "https://x".to_owned())];
        let a = build_pod_spec(&key(), "s3pa-1", &argv, &env, &opts());
        let b = build_pod_spec(&key(), "s3pa-1", &argv, &env, &opts());
        assert_eq!(a, b);
    }

    #[test]
    fn cache_volume_added_only_when_requested() {
        let mut o = opts();
        let argv = vec![];
        let env = vec![];
        let without = build_pod_spec(&key(), "s3pa-1", &argv, &env, &o);
        assert_eq!(without.volumes.len(), 1);

        o.cache_size_bytes = Some(1024 * 1024 * 1024);
        let with = build_pod_spec(&key(), "s3pa-1", &argv, &env, &o);
        assert_eq!(with.volumes.len(), 2);
    }

    #[test]
    fn cache_size_precedence_prefers_volume_attributes() {
        assert_eq!(resolve_cache_size(Some(10), Some(20)), Some(10));
        assert_eq!(resolve_cache_size(None, Some(20)), Some(20));
        assert_eq!(resolve_cache_size(None, None), None);
    }

    #[test]
    fn priority_class_follows_requested_priority() {
        let mut o = opts();
        o.priority = PodPriority::Preempting;
        let spec = build_pod_spec(&key(), "s3pa-1", &[], &[], &o);
        assert_eq!(spec.priority_class_name, "preempting");
    }
}
