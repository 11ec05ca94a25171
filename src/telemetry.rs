//! Logging/tracing bootstrap and secret-safe logging helpers.

use std::collections::BTreeMap;

/// Volume-context keys that must never reach a log line.
const SENSITIVE_KEYS: &[&str] = &["csi.storage.k8s.io/serviceAccount.tokens"];

/// Initialise the global `tracing` subscriber from `RUST_LOG`, defaulting
/// to `info`. Safe to call once per process; subsequent calls are no-ops.
pub fn init() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

/// Returns a copy of `context` with sensitive entries redacted, suitable for
/// passing to a `tracing` macro.
pub fn redact_volume_context(context: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    context
        .iter()
        .map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_KEYS.contains(&k.as_str())
                || lower.contains("token")
                || lower.contains("secret")
            {
                (k.clone(), "<redacted>".to_owned())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_token_and_secret_keys() {
        let mut ctx = BTreeMap::new();
        ctx.insert("bucketName".to_owned(), "my-bucket".to_owned());
        ctx.insert(
            "csi.storage.k8s.io/serviceAccount.tokens".to_owned(),
            "eyJ...".to_owned(),
        );
        ctx.insert("someSecretValue".to_owned(), "hunter2".to_owned());

        let redacted = redact_volume_context(&ctx);
        assert_eq!(redacted["bucketName"], "my-bucket");
        assert_eq!(
            redacted["csi.storage.k8s.io/serviceAccount.tokens"],
            "<redacted>"
        );
        assert_eq!(redacted["someSecretValue"], "<redacted>");
    }
}
