//! Credential Pipeline: turns a CSI publish request's volume context and
//! secret references into a per-mount credentials directory and the
//! environment variables describing paths within it.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The one variation point in the credential pipeline, modelled as a
/// tagged variant rather than a trait object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuthenticationSource {
    Driver,
    Secret { name: String, namespace: String },
    Pod {
        service_account: String,
        service_account_uid: String,
        namespace: String,
        tokens: Vec<ServiceAccountToken>,
    },
}

impl AuthenticationSource {
    pub fn as_key_str(&self) -> &'static str {
        match self {
            AuthenticationSource::Driver => "driver",
            AuthenticationSource::Secret { .. } => "secret",
            AuthenticationSource::Pod { .. } => "pod",
        }
    }
}

/// A single projected service-account token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountToken {
    pub audience: String,
    pub token: String,
}

/// Static access-key/secret-key pair, used for `driver`/`secret` sources.
#[derive(Debug, Clone)]
pub struct StaticKeyPair {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid volume context: {0}")]
    InvalidVolumeContext(String),
    #[error("failed to fetch secret {name} in {namespace}: {detail}")]
    SecretFetch {
        name: String,
        namespace: String,
        detail: String,
    },
    #[error("service account token unavailable for {service_account}: {detail}")]
    TokenUnavailable {
        service_account: String,
        detail: String,
    },
    #[error("i/o error provisioning credentials: {0}")]
    Io(#[from] std::io::Error),
}

/// Output of provisioning: the environment variables the Mountpoint Pod
/// should be started with, referencing in-pod paths under the mounted
/// credentials directory.
#[derive(Debug, Clone, Default)]
pub struct ProvisionedCredentials {
    pub env: BTreeMap<String, String>,
}

/// RAII guard that removes a just-created directory unless [`commit`] is
/// called, implementing the "roll back by deleting the partially-written
/// directory" requirement.
struct CredentialDirGuard {
    path: PathBuf,
    committed: bool,
}

impl CredentialDirGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for CredentialDirGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Creates and populates the per-mount credentials directory for one
/// Mountpoint Pod.
pub struct CredentialPipeline {
    credentials_root: PathBuf,
}

impl CredentialPipeline {
    pub fn new(credentials_root: impl Into<PathBuf>) -> Self {
        Self {
            credentials_root: credentials_root.into(),
        }
    }

    fn dir_for(&self, mp_pod_name: &str) -> PathBuf {
        self.credentials_root.join(mp_pod_name)
    }

    /// Provision credentials for `mp_pod_name` given the resolved
    /// authentication source. On any failure the partially-written
    /// directory is removed before the error propagates.
    pub fn provision(
        &self,
        mp_pod_name: &str,
        source: &AuthenticationSource,
        static_keys: Option<&StaticKeyPair>,
    ) -> Result<ProvisionedCredentials, CredentialError> {
        let dir = self.dir_for(mp_pod_name);
        std::fs::create_dir_all(&dir)?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750))?;
        let guard = CredentialDirGuard::new(dir.clone());

        let mut env = BTreeMap::new();

        match source {
            AuthenticationSource::Driver => {
                // No per-mount secret material: credentials come from the
                // driver's own trusted environment. Nothing to write.
            }
            AuthenticationSource::Secret { name, namespace } => {
                let keys = static_keys.ok_or_else(|| CredentialError::SecretFetch {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    detail: "no static key pair resolved".to_owned(),
                })?;
                let keys_path = write_static_keys(&dir, keys)?;
                env.insert(
                    "AWS_SHARED_CREDENTIALS_FILE".to_owned(),
                    keys_path.display().to_string(),
                );
            }
            AuthenticationSource::Pod {
                service_account,
                tokens,
                ..
            } => {
                let token = tokens.first().ok_or_else(|| CredentialError::TokenUnavailable {
                    service_account: service_account.clone(),
                    detail: "no projected tokens present in volume context".to_owned(),
                })?;
                let token_path = write_token_file(&dir, token)?;
                let config_path = write_web_identity_config(&dir, &token_path, service_account)?;
                env.insert(
                    "AWS_WEB_IDENTITY_TOKEN_FILE".to_owned(),
                    token_path.display().to_string(),
                );
                env.insert(
                    "AWS_CONFIG_FILE".to_owned(),
                    config_path.display().to_string(),
                );
            }
        }

        guard.commit();
        Ok(ProvisionedCredentials { env })
    }

    /// Remove the entire credentials directory for a Mountpoint Pod,
    /// called once its last workload attachment is gone.
    pub fn cleanup(&self, mp_pod_name: &str) -> std::io::Result<()> {
        let dir = self.dir_for(mp_pod_name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn write_static_keys(dir: &Path, keys: &StaticKeyPair) -> std::io::Result<PathBuf> {
    let path = dir.join("credentials");
    let content = format!(
        "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
        keys.access_key_id, keys.secret_access_key
    );
    std::fs::write(&path, content)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640))?;
    Ok(path)
}

fn write_token_file(dir: &Path, token: &ServiceAccountToken) -> std::io::Result<PathBuf> {
    let path = dir.join("token");
    std::fs::write(&path, &token.token)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640))?;
    Ok(path)
}

fn write_web_identity_config(
    dir: &Path,
    token_path: &Path,
    service_account: &str,
) -> std::io::Result<PathBuf> {
    let path = dir.join("config");
    let content = format!(
        "[default]\nweb_identity_token_file = {}\nrole_session_name = {}\n",
        token_path.display(),
        service_account
    );
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Strip `csi.storage.k8s.io/serviceAccount.tokens` from a copy of a volume
/// context intended for logging.
pub fn redact_for_logging(context: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    crate::telemetry::redact_volume_context(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn driver_source_writes_nothing_but_succeeds() {
        let root = tempdir().unwrap();
        let pipeline = CredentialPipeline::new(root.path());
        let creds = pipeline
            .provision("mp-a", &AuthenticationSource::Driver, None)
            .unwrap();
        assert!(creds.env.is_empty());
        assert!(root.path().join("mp-a").exists());
    }

    #[test]
    fn secret_source_without_keys_rolls_back_directory() {
        let root = tempdir().unwrap();
        let pipeline = CredentialPipeline::new(root.path());
        let err = pipeline
            .provision(
                "mp-b",
                &AuthenticationSource::Secret {
                    name: "s".to_owned(),
                    namespace: "ns".to_owned(),
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CredentialError::SecretFetch { .. }));
        assert!(!root.path().join("mp-b").exists());
    }

    #[test]
    fn pod_source_writes_token_and_config() {
        let root = tempdir().unwrap();
        let pipeline = CredentialPipeline::new(root.path());
        let source = AuthenticationSource::Pod {
            service_account: "sa".to_owned(),
            service_account_uid: "uid-1".to_owned(),
            namespace: "ns".to_owned(),
            tokens: vec![ServiceAccountToken {
                audience: "sts.amazonaws.com".to_owned(),
                token: "eyJ.fake.token".to_owned(),
            }],
        };
        let creds = pipeline.provision("mp-c", &source, None).unwrap();
        assert!(creds.env.contains_key("AWS_WEB_IDENTITY_TOKEN_FILE"));
        assert!(creds.env.contains_key("AWS_CONFIG_FILE"));
        assert!(root.path().join("mp-c/token").exists());
    }

    #[test]
    fn cleanup_removes_directory() {
        let root = tempdir().unwrap();
        let pipeline = CredentialPipeline::new(root.path());
        pipeline
            .provision("mp-d", &AuthenticationSource::Driver, None)
            .unwrap();
        pipeline.cleanup("mp-d").unwrap();
        assert!(!root.path().join("mp-d").exists());
        // Idempotent: cleaning up twice is not an error.
        pipeline.cleanup("mp-d").unwrap();
    }
}
