//! Command implementations

pub mod call;
pub mod manifest;

use hostlink::{Manifest, Wasm};

use crate::cli::PolicyArgs;
use crate::error::{CliError, CliResult};

/// A module source from the command line: a URL or a file path.
pub fn wasm_source(source: &str) -> Wasm {
    if source.starts_with("http://") || source.starts_with("https://") {
        Wasm::url(source)
    } else {
        Wasm::path(source)
    }
}

/// Build a manifest from module sources and policy flags. `--hash` applies
/// to the last module, which is the entry module.
pub fn build_manifest(sources: &[String], policy: &PolicyArgs) -> CliResult<Manifest> {
    let mut manifest = Manifest::new();
    let last = sources.len().saturating_sub(1);
    for (index, source) in sources.iter().enumerate() {
        let mut wasm = wasm_source(source);
        if index == last {
            if let Some(hash) = &policy.hash {
                wasm = wasm.with_hash(hash.to_lowercase());
            }
        }
        manifest.add_wasm(wasm);
    }

    for (key, value) in &policy.config {
        manifest.set_config(key, value);
    }
    for host in &policy.allow_host {
        manifest.allow_host(host);
    }
    for mapping in &policy.allow_path {
        let (src, dest) = match mapping.split_once(':') {
            Some((src, dest)) if !dest.is_empty() => (src, Some(dest)),
            Some((src, _)) => (src, None),
            None => (mapping.as_str(), None),
        };
        if src.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "--allow-path `{mapping}` has an empty source"
            )));
        }
        manifest.allow_path(src, dest);
    }
    if let Some(timeout) = policy.timeout {
        manifest.set_timeout(timeout);
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_manifest_from_flags() {
        let policy = PolicyArgs {
            config: vec![("k".into(), "v".into())],
            allow_host: vec!["example.com".into()],
            allow_path: vec!["/data:/mnt".into(), "/tmp".into()],
            timeout: Some(250),
            hash: Some("ABC".into()),
        };
        let sources = vec!["lib.wasm".to_string(), "https://x.dev/p.wasm".to_string()];
        let manifest = build_manifest(&sources, &policy).unwrap();

        assert_eq!(
            manifest.render(),
            json!({
                "wasm": [
                    {"path": "lib.wasm"},
                    {"url": "https://x.dev/p.wasm", "method": "GET", "hash": "abc"}
                ],
                "config": {"k": "v"},
                "allowed_hosts": ["example.com"],
                "allowed_paths": {"/data": "/mnt", "/tmp": "/tmp"},
                "timeout_ms": 250
            })
        );
    }

    #[test]
    fn test_empty_allow_path_source_rejected() {
        let policy = PolicyArgs {
            allow_path: vec![":/mnt".into()],
            ..Default::default()
        };
        let err = build_manifest(&["p.wasm".to_string()], &policy).unwrap_err();
        assert!(matches!(err, CliError::InvalidArgument(_)));
    }
}
