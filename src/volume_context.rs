//! Parsing and validation of the CSI publish request's volume-context map.
//!
//! The volume context is untyped key/value pairs over the wire; this
//! module is the single place that turns it into the strongly-typed
//! request the rest of the core consumes, rejecting malformed entries with
//! `InvalidVolumeContext` up front rather than letting them surface as
//! confusing failures later in the pipeline.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::credentials::{AuthenticationSource, ServiceAccountToken};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeContextError {
    #[error("missing required volume context key {0}")]
    MissingKey(&'static str),
    #[error("unsupported authenticationSource {0:?}")]
    UnsupportedAuthenticationSource(String),
    #[error("invalid cache size {0:?}: {1}")]
    InvalidCacheSize(String, String),
}

/// A fully parsed, validated volume context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    pub bucket_name: String,
    pub authentication_source: AuthSourceRequest,
    pub fs_group_override: Option<String>,
    pub cache_size_bytes: Option<u64>,
    pub container_cpu_request: Option<String>,
    pub container_memory_request: Option<String>,
    pub container_cpu_limit: Option<String>,
    pub container_memory_limit: Option<String>,
}

/// The authentication source as recovered purely from the volume context
/// map, before secrets/tokens have actually been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSourceRequest {
    Driver,
    Secret { name: String, namespace: String },
    Pod {
        service_account: String,
        service_account_uid: Option<String>,
        namespace: String,
    },
}

impl AuthSourceRequest {
    pub fn as_key_str(&self) -> &'static str {
        match self {
            AuthSourceRequest::Driver => "driver",
            AuthSourceRequest::Secret { .. } => "secret",
            AuthSourceRequest::Pod { .. } => "pod",
        }
    }
}

/// Parse and validate the raw volume-context map from a CSI publish
/// request.
pub fn parse(
    context: &BTreeMap<String, String>,
    namespace: &str,
) -> Result<VolumeContext, VolumeContextError> {
    let bucket_name = context
        .get("bucketName")
        .cloned()
        .ok_or(VolumeContextError::MissingKey("bucketName"))?;

    let authentication_source = match context.get("authenticationSource").map(String::as_str) {
        None | Some("driver") => AuthSourceRequest::Driver,
        Some("secret") => AuthSourceRequest::Secret {
            name: context
                .get("secretName")
                .cloned()
                .ok_or(VolumeContextError::MissingKey("secretName"))?,
            namespace: namespace.to_owned(),
        },
        Some("pod") => AuthSourceRequest::Pod {
            service_account: context
                .get("csi.storage.k8s.io/serviceAccount.name")
                .cloned()
                .ok_or(VolumeContextError::MissingKey(
                    "csi.storage.k8s.io/serviceAccount.name",
                ))?,
            service_account_uid: context
                .get("csi.storage.k8s.io/serviceAccount.uid")
                .cloned(),
            namespace: namespace.to_owned(),
        },
        Some(other) => {
            return Err(VolumeContextError::UnsupportedAuthenticationSource(
                other.to_owned(),
            ))
        }
    };

    let fs_group_override = context.get("fsGroup").cloned();

    let cache_size_bytes = context
        .get("cacheSize")
        .map(|s| parse_cache_size(s))
        .transpose()?;

    Ok(VolumeContext {
        bucket_name,
        authentication_source,
        fs_group_override,
        cache_size_bytes,
        container_cpu_request: context.get("mountpointContainerCpuRequest").cloned(),
        container_memory_request: context.get("mountpointContainerMemoryRequest").cloned(),
        container_cpu_limit: context.get("mountpointContainerCpuLimit").cloned(),
        container_memory_limit: context.get("mountpointContainerMemoryLimit").cloned(),
    })
}

/// Parses a human size string like `"1Gi"`, `"512Mi"`, or a bare byte
/// count, validated upfront so a malformed size never reaches the pod
/// builder.
fn parse_cache_size(raw: &str) -> Result<u64, VolumeContextError> {
    let err = |detail: &str| VolumeContextError::InvalidCacheSize(raw.to_owned(), detail.to_owned());

    let (digits, multiplier) = if let Some(n) = raw.strip_suffix("Gi") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("Mi") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = raw.strip_suffix("Ki") {
        (n, 1024u64)
    } else {
        (raw, 1)
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| err("not a non-negative integer"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| err("overflows u64 bytes"))
}

/// Extracts service account tokens the node already holds for this publish
/// (the CSI `podInfoOnMount`/token-request machinery populates these keys;
/// out of scope for this crate, but the shape is validated here).
pub fn extract_tokens(context: &BTreeMap<String, String>) -> Vec<ServiceAccountToken> {
    context
        .get("csi.storage.k8s.io/serviceAccount.tokens")
        .map(|raw| {
            serde_json::from_str::<BTreeMap<String, TokenInfo>>(raw)
                .map(|map| {
                    map.into_iter()
                        .map(|(audience, info)| ServiceAccountToken {
                            audience,
                            token: info.token,
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

#[derive(Debug, serde::Deserialize)]
struct TokenInfo {
    token: String,
    #[allow(dead_code)]
    #[serde(rename = "expirationTimestamp")]
    expiration_timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bucket_name_is_invalid() {
        let ctx = BTreeMap::new();
        assert_eq!(
            parse(&ctx, "ns").unwrap_err(),
            VolumeContextError::MissingKey("bucketName")
        );
    }

    #[test]
    fn driver_is_default_authentication_source() {
        let mut ctx = BTreeMap::new();
        ctx.insert("bucketName".to_owned(), "b".to_owned());
        let parsed = parse(&ctx, "ns").unwrap();
        assert_eq!(parsed.authentication_source, AuthSourceRequest::Driver);
    }

    #[test]
    fn unsupported_authentication_source_rejected() {
        let mut ctx = BTreeMap::new();
        ctx.insert("bucketName".to_owned(), "b".to_owned());
        ctx.insert("authenticationSource".to_owned(), "bogus".to_owned());
        assert_eq!(
            parse(&ctx, "ns").unwrap_err(),
            VolumeContextError::UnsupportedAuthenticationSource("bogus".to_owned())
        );
    }

    #[test]
    fn cache_size_parsing() {
        assert_eq!(parse_cache_size("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_cache_size("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_cache_size("2048").unwrap(), 2048);
        assert!(parse_cache_size("abc").is_err());
        assert!(parse_cache_size("-5Gi").is_err());
    }

    #[test]
    fn pod_auth_source_requires_service_account() {
        let mut ctx = BTreeMap::new();
        ctx.insert("bucketName".to_owned(), "b".to_owned());
        ctx.insert("authenticationSource".to_owned(), "pod".to_owned());
        assert!(parse(&ctx, "ns").is_err());
    }
}
