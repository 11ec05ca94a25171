//! Mount-Argument Policy: a pure function sanitising and augmenting the
//! mount flags handed to the external `mount-s3` binary.
//!
//! This is a security boundary, not a validator: illegal tokens are
//! silently stripped (and logged by the caller), never rejected with an
//! error.

use std::collections::BTreeMap;

/// Flags stripped unconditionally, regardless of the textual form they
/// arrived in.
const STRIP_LIST: &[&str] = &[
    "endpoint-url",
    "profile",
    "cache-xz",
    "incremental-upload",
    "storage-class",
    "foreground",
    "f",
    "o",
];

/// A single normalised mount option: `--key` or `--key=value`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MountOption {
    pub key: String,
    pub value: Option<String>,
}

impl MountOption {
    fn render(&self) -> String {
        match &self.value {
            Some(v) => format!("--{}={}", self.key, v),
            None => format!("--{}", self.key),
        }
    }
}

/// Context the policy needs beyond the raw option tokens.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// CSI read-only publish flag.
    pub read_only: bool,
    /// Workload's requested filesystem group, if any.
    pub fs_group: Option<String>,
    /// Driver-level, trusted endpoint URL (never caller-supplied).
    pub endpoint_url: Option<String>,
    /// Identifies driver + authentication source in the user-agent.
    pub driver_version: String,
    pub authentication_source: String,
}

/// Parse one textual mount-option token into `(key, value)`, accepting
/// `--key=value`, `--key value` (handled by the caller joining adjacent
/// tokens before calling this), bare `key=value`, and boolean `--flag`.
fn parse_token(token: &str) -> MountOption {
    let trimmed = token.trim_start_matches('-');
    if let Some((key, value)) = trimmed.split_once('=') {
        MountOption {
            key: key.to_owned(),
            value: Some(value.to_owned()),
        }
    } else {
        MountOption {
            key: trimmed.to_owned(),
            value: None,
        }
    }
}

/// Normalise a raw sequence of tokens (as they might arrive from a CSI
/// mount-options list, where `--key value` can appear as two adjacent
/// array elements) into a deduplicated, sorted set of [`MountOption`]s.
/// Duplicate keys resolve last-write-wins.
fn normalize(raw: &[String]) -> Vec<MountOption> {
    let mut options: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut iter = raw.iter().peekable();
    while let Some(token) = iter.next() {
        let looks_like_flag = token.starts_with('-');
        let parsed = parse_token(token);
        if looks_like_flag && parsed.value.is_none() {
            // `--key value` form: if the next raw token doesn't itself
            // look like a flag and isn't empty, treat it as this key's
            // value.
            if let Some(next) = iter.peek() {
                if !next.starts_with('-') && !next.is_empty() {
                    let value = iter.next().cloned();
                    options.insert(parsed.key, value);
                    continue;
                }
            }
        }
        options.insert(parsed.key, parsed.value);
    }
    options
        .into_iter()
        .map(|(key, value)| MountOption { key, value })
        .collect()
}

fn strip(options: Vec<MountOption>) -> Vec<MountOption> {
    options
        .into_iter()
        .filter(|opt| !STRIP_LIST.contains(&opt.key.as_str()))
        .collect()
}

/// The outcome of running the policy: the canonical option string used in
/// the attachment key, and the final argument vector for the Mountpoint
/// Pod's `mount-s3` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutput {
    pub canonical_options: String,
    pub argv: Vec<String>,
}

/// Render a sorted, deduplicated set of options into the canonical string
/// used inside the attachment key.
fn canonicalize(options: &[MountOption]) -> String {
    let mut sorted = options.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(MountOption::render)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run the full policy: normalise, strip disallowed flags, augment with
/// filesystem-group/allow-other/allow-root defaults, append the
/// user-agent-prefix, and strip `--read-only` again since the kernel
/// receives read-only via mount flags rather than as a `mount-s3` argument.
///
/// Deterministic: identical `raw` + `ctx` always produce byte-equal output.
/// Options are kept as a key-deduplicated set throughout (last write wins),
/// so augmentation is safe to re-run on already-policy'd output (P6).
pub fn apply(raw: &[String], ctx: &PolicyContext) -> PolicyOutput {
    let options = strip(normalize(raw));
    let mut set: BTreeMap<String, Option<String>> =
        options.into_iter().map(|o| (o.key, o.value)).collect();

    if ctx.read_only {
        // Inject for canonicalisation purposes, then strip again below,
        // matching spec: CSI layer sees `--read-only` in the canonical
        // form, but the argv handed to the user-space binary never does.
        set.entry("read-only".to_owned()).or_insert(None);
    }

    match &ctx.fs_group {
        Some(group) => {
            if !set.contains_key("gid")
                && !set.contains_key("allow-other")
                && !set.contains_key("dir-mode")
                && !set.contains_key("file-mode")
            {
                set.insert("gid".to_owned(), Some(group.clone()));
                set.insert("allow-other".to_owned(), None);
                set.insert("dir-mode".to_owned(), Some("770".to_owned()));
                set.insert("file-mode".to_owned(), Some("660".to_owned()));
            }
        }
        None => {
            if !set.contains_key("allow-other") && !set.contains_key("allow-root") {
                set.insert("allow-root".to_owned(), None);
            }
        }
    }

    set.entry("force-path-style".to_owned()).or_insert(None);

    set.insert(
        "user-agent-prefix".to_owned(),
        Some(format!(
            "s3-csi-driver/{} {}",
            ctx.driver_version, ctx.authentication_source
        )),
    );

    let options: Vec<MountOption> = set
        .into_iter()
        .map(|(key, value)| MountOption { key, value })
        .collect();
    let canonical_options = canonicalize(&options);

    // The argv handed to the Mountpoint Pod never carries --read-only: the
    // kernel receives read-only via mount flags at the syscall boundary.
    let argv_options: Vec<MountOption> = options
        .into_iter()
        .filter(|o| o.key != "read-only")
        .collect();
    let mut sorted_argv = argv_options;
    sorted_argv.sort();
    let argv = sorted_argv.iter().map(MountOption::render).collect();

    PolicyOutput {
        canonical_options,
        argv,
    }
}

/// Kernel-level mount flags derived separately from the argv policy,
/// since `--read-only` is conveyed to the syscall as a flag rather than a
/// `mount-s3` argument.
pub fn kernel_read_only_flag(ctx: &PolicyContext) -> bool {
    ctx.read_only
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PolicyContext {
        PolicyContext {
            read_only: false,
            fs_group: None,
            endpoint_url: Some("https://s3.trusted.example".to_owned()),
            driver_version: "0.1.0".to_owned(),
            authentication_source: "driver".to_owned(),
        }
    }

    #[test]
    fn scenario_non_root_publish() {
        let mut c = ctx();
        c.fs_group = Some("123".to_owned());
        let out = apply(&[], &c);
        assert!(out.argv.contains(&"--gid=123".to_owned()));
        assert!(out.argv.contains(&"--allow-other".to_owned()));
        assert!(out.argv.contains(&"--dir-mode=770".to_owned()));
        assert!(out.argv.contains(&"--file-mode=660".to_owned()));
        assert!(out.argv.contains(&"--force-path-style".to_owned()));
        assert!(out
            .argv
            .iter()
            .any(|a| a.starts_with("--user-agent-prefix=")));
        assert!(!out.argv.iter().any(|a| a == "--read-only"));
    }

    #[test]
    fn scenario_disallowed_flags_stripped() {
        let raw = vec![
            "--read-only".to_owned(),
            "--endpoint-url=https://evil".to_owned(),
            "--profile=x".to_owned(),
            "--cache-xz".to_owned(),
            "--incremental-upload".to_owned(),
            "--storage-class=REDUCED_REDUNDANCY".to_owned(),
            "-o".to_owned(),
        ];
        let out = apply(&raw, &ctx());
        for needle in [
            "--read-only",
            "--endpoint-url",
            "--profile",
            "--cache-xz",
            "--incremental-upload",
            "--storage-class",
            "-o",
        ] {
            assert!(
                !out.argv.iter().any(|a| a.starts_with(needle)),
                "argv unexpectedly contains {needle}: {:?}",
                out.argv
            );
            assert!(
                !out.canonical_options.contains(needle),
                "canonical unexpectedly contains {needle}: {}",
                out.canonical_options
            );
        }
    }

    #[test]
    fn no_fs_group_injects_allow_root() {
        let out = apply(&[], &ctx());
        assert!(out.argv.contains(&"--allow-root".to_owned()));
    }

    #[test]
    fn allow_other_suppresses_allow_root_injection() {
        let raw = vec!["--allow-other".to_owned()];
        let out = apply(&raw, &ctx());
        assert!(!out.argv.contains(&"--allow-root".to_owned()));
        assert!(out.argv.contains(&"--allow-other".to_owned()));
    }

    #[test]
    fn property_determinism() {
        let raw = vec!["--dir-mode=755".to_owned(), "--gid=42".to_owned()];
        let a = apply(&raw, &ctx());
        let b = apply(&raw, &ctx());
        assert_eq!(a, b);
    }

    #[test]
    fn property_strip_idempotence() {
        let raw = vec![
            "--read-only".to_owned(),
            "--endpoint-url=https://evil".to_owned(),
        ];
        let once = apply(&raw, &ctx());
        let twice = apply(&once.argv, &ctx());
        assert_eq!(once.argv, twice.argv);
        assert_eq!(once.canonical_options, twice.canonical_options);
    }

    #[test]
    fn property_strips_all_four_forms() {
        for form in [
            vec!["--endpoint-url=https://evil".to_owned()],
            vec!["--endpoint-url".to_owned(), "https://evil".to_owned()],
            vec!["endpoint-url=https://evil".to_owned()],
        ] {
            let out = apply(&form, &ctx());
            assert!(!out.argv.iter().any(|a| a.contains("endpoint-url")));
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> PolicyContext {
        PolicyContext {
            read_only: false,
            fs_group: None,
            endpoint_url: Some("https://s3.trusted.example".to_owned()),
            driver_version: "0.1.0".to_owned(),
            authentication_source: "driver".to_owned(),
        }
    }

    fn arb_token() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z-]{0,8}".prop_map(|k| format!("--{k}")),
            "[a-z][a-z-]{0,8}=[a-zA-Z0-9/:.]{0,12}".prop_map(|kv| format!("--{kv}")),
            "[a-z][a-z-]{0,8}=[a-zA-Z0-9/:.]{0,12}",
            prop_oneof![
                Just("endpoint-url".to_owned()),
                Just("profile".to_owned()),
                Just("cache-xz".to_owned()),
                Just("incremental-upload".to_owned()),
                Just("storage-class".to_owned()),
            ]
            .prop_map(|k| format!("--{k}=https://evil.example")),
        ]
    }

    proptest! {
        // P1: two runs over the same input and context are byte-equal.
        #[test]
        fn p1_determinism(raw in proptest::collection::vec(arb_token(), 0..8)) {
            let c = ctx();
            prop_assert_eq!(apply(&raw, &c), apply(&raw, &c));
        }

        // P6: re-running the policy on its own argv output is a no-op.
        #[test]
        fn p6_strip_idempotence(raw in proptest::collection::vec(arb_token(), 0..8)) {
            let c = ctx();
            let once = apply(&raw, &c);
            let twice = apply(&once.argv, &c);
            prop_assert_eq!(once.canonical_options, twice.canonical_options);
            prop_assert_eq!(once.argv, twice.argv);
        }

        // P7: every disallowed option is absent from the output regardless
        // of how many other (possibly disallowed) tokens surround it.
        #[test]
        fn p7_disallowed_options_always_stripped(raw in proptest::collection::vec(arb_token(), 0..8)) {
            let out = apply(&raw, &ctx());
            for disallowed in STRIP_LIST {
                prop_assert!(!out.argv.iter().any(|a| a.trim_start_matches('-') == *disallowed
                    || a.trim_start_matches('-').starts_with(&format!("{disallowed}="))));
            }
        }
    }
}
