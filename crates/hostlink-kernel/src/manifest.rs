//! Manifest documents
//!
//! A [`ManifestDoc`] is the normalized description of what to instantiate:
//! an ordered list of wasm sources plus the sandbox policy. It is either
//! parsed from the JSON wire form or built in-process with sources that
//! borrow the caller's buffers.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{KernelError, KernelResult};

const WASM_MAGIC: &[u8] = b"\0asm";

/// Upper bound for downloading a module from a URL source.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Name under which the entry module is looked up.
pub const MAIN_MODULE: &str = "main";

/// Optional memory limits of a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Cap on the guest's linear memory, in 64KB pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    /// Cap on the body size of a guest HTTP response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_http_response_bytes: Option<u64>,
    /// Cap on the total size of plugin variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_var_bytes: Option<u64>,
}

/// Where the bytes of one module come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDoc<'a> {
    Data(Cow<'a, [u8]>),
    Path(PathBuf),
    Url {
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
    },
}

/// One module of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct WasmDoc<'a> {
    pub source: SourceDoc<'a>,
    /// Expected lowercase hex sha256 of the module bytes.
    pub hash: Option<String>,
    /// Link name; other modules import from it under this name.
    pub name: Option<String>,
}

impl<'a> WasmDoc<'a> {
    pub fn data(bytes: &'a [u8]) -> Self {
        Self {
            source: SourceDoc::Data(Cow::Borrowed(bytes)),
            hash: None,
            name: None,
        }
    }

    fn describe(&self) -> String {
        match &self.source {
            SourceDoc::Data(bytes) => format!("<{} bytes>", bytes.len()),
            SourceDoc::Path(path) => path.display().to_string(),
            SourceDoc::Url { url, .. } => url.clone(),
        }
    }

    /// Resolve the module bytes and verify the declared hash.
    pub fn load(&self) -> KernelResult<Cow<'_, [u8]>> {
        let bytes: Cow<'_, [u8]> = match &self.source {
            SourceDoc::Data(bytes) => Cow::Borrowed(bytes.as_ref()),
            SourceDoc::Path(path) => {
                debug!(path = %path.display(), "Reading wasm from disk");
                Cow::Owned(std::fs::read(path).map_err(|e| {
                    KernelError::Load(format!("{}: {e}", path.display()))
                })?)
            }
            SourceDoc::Url {
                url,
                method,
                headers,
            } => Cow::Owned(fetch(url, method, headers, FETCH_TIMEOUT)?),
        };

        if let Some(expected) = &self.hash {
            verify_hash(&bytes, expected)?;
        }
        Ok(bytes)
    }
}

fn fetch(
    url: &str,
    method: &str,
    headers: &BTreeMap<String, String>,
    timeout: Duration,
) -> KernelResult<Vec<u8>> {
    info!(url, method, "Fetching wasm");
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| KernelError::Load(format!("invalid method `{method}`: {e}")))?;

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| KernelError::Load(format!("{url}: {e}")))?;
    let mut request = client.request(method, url);
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| KernelError::Load(format!("{url}: {e}")))?;
    let body = response
        .bytes()
        .map_err(|e| KernelError::Load(format!("{url}: {e}")))?;
    Ok(body.to_vec())
}

/// Lowercase hex sha256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn verify_hash(bytes: &[u8], expected: &str) -> KernelResult<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(KernelError::HashMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[derive(Deserialize)]
struct RawWasm {
    data: Option<String>,
    path: Option<PathBuf>,
    url: Option<String>,
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    hash: Option<String>,
    name: Option<String>,
}

impl<'de, 'a> Deserialize<'de> for WasmDoc<'a> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = RawWasm::deserialize(deserializer)?;
        let source = match (raw.data, raw.path, raw.url) {
            (Some(data), None, None) => {
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .map_err(|e| D::Error::custom(format!("invalid base64 in `data`: {e}")))?;
                SourceDoc::Data(Cow::Owned(bytes))
            }
            (None, Some(path), None) => SourceDoc::Path(path),
            (None, None, Some(url)) => SourceDoc::Url {
                url,
                method: raw.method.unwrap_or_else(|| "GET".to_string()),
                headers: raw.headers,
            },
            _ => {
                return Err(D::Error::custom(
                    "wasm entry needs exactly one of `data`, `path` or `url`",
                ));
            }
        };

        Ok(WasmDoc {
            source,
            hash: raw.hash,
            name: raw.name,
        })
    }
}

/// A normalized manifest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ManifestDoc<'a> {
    #[serde(default)]
    pub wasm: Vec<WasmDoc<'a>>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_paths: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory: Option<MemoryOptions>,
}

impl<'a> ManifestDoc<'a> {
    /// A manifest with a single module and no policy.
    pub fn from_module(bytes: &'a [u8]) -> Self {
        Self {
            wasm: vec![WasmDoc::data(bytes)],
            ..Default::default()
        }
    }

    /// Interpret raw input as either a JSON manifest or a single module.
    ///
    /// Binary modules start with the wasm magic; a first non-whitespace
    /// byte of `{` means JSON; anything else is treated as WAT text.
    pub fn from_input(bytes: &'a [u8]) -> KernelResult<Self> {
        if looks_like_manifest(bytes) {
            let doc: ManifestDoc<'static> = serde_json::from_slice(bytes)
                .map_err(|e| KernelError::InvalidManifest(e.to_string()))?;
            Ok(doc)
        } else {
            Ok(Self::from_module(bytes))
        }
    }

    /// Index of the entry module: the one named `main`, else the last.
    pub fn main_index(&self) -> KernelResult<usize> {
        if self.wasm.is_empty() {
            return Err(KernelError::InvalidManifest(
                "manifest contains no wasm modules".into(),
            ));
        }
        Ok(self
            .wasm
            .iter()
            .position(|w| w.name.as_deref() == Some(MAIN_MODULE))
            .unwrap_or(self.wasm.len() - 1))
    }

    /// Link name of the module at `index`.
    pub fn module_name(&self, index: usize) -> String {
        self.wasm
            .get(index)
            .and_then(|w| w.name.clone())
            .unwrap_or_else(|| format!("module{index}"))
    }

    /// Source description used in log lines and error context.
    pub fn describe(&self, index: usize) -> String {
        self.wasm
            .get(index)
            .map(|w| w.describe())
            .unwrap_or_default()
    }

    /// Whether `host` may be contacted by the guest.
    pub fn host_allowed(&self, host: &str) -> bool {
        host_allowed(self.allowed_hosts.as_deref(), host)
    }
}

/// Match `host` against an allow list.
///
/// Entries match exactly or, when they start with `*.`, any subdomain.
/// Matching ignores ASCII case. A missing list denies everything.
pub fn host_allowed(allowed: Option<&[String]>, host: &str) -> bool {
    let Some(hosts) = allowed else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    hosts.iter().any(|pattern| match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix.to_ascii_lowercase().as_str())
            .is_some_and(|rest| rest.ends_with('.')),
        None => pattern == "*" || pattern.eq_ignore_ascii_case(&host),
    })
}

/// Whether the input is a JSON manifest rather than a module.
pub fn looks_like_manifest(bytes: &[u8]) -> bool {
    if bytes.starts_with(WASM_MAGIC) {
        return false;
    }
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_source_kinds() {
        let json = br#"{
            "wasm": [
                {"data": "AGFzbQEAAAA=", "name": "lib"},
                {"path": "/tmp/plugin.wasm", "hash": "abc"},
                {"url": "https://example.com/p.wasm", "headers": {"Authorization": "t"}}
            ],
            "config": {"thing": "1"},
            "allowed_hosts": ["example.com"],
            "allowed_paths": {"/tmp": "/data"},
            "timeout_ms": 500
        }"#;

        let doc = ManifestDoc::from_input(json).unwrap();
        assert_eq!(doc.wasm.len(), 3);
        assert_eq!(
            doc.wasm[0].source,
            SourceDoc::Data(Cow::Owned(b"\0asm\x01\0\0\0".to_vec()))
        );
        assert_eq!(doc.wasm[0].name.as_deref(), Some("lib"));
        assert_eq!(doc.wasm[1].hash.as_deref(), Some("abc"));
        match &doc.wasm[2].source {
            SourceDoc::Url {
                method, headers, ..
            } => {
                assert_eq!(method, "GET");
                assert_eq!(headers.get("Authorization").map(String::as_str), Some("t"));
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert_eq!(doc.config.get("thing").map(String::as_str), Some("1"));
        assert_eq!(doc.timeout_ms, Some(500));
        assert_eq!(doc.main_index().unwrap(), 2);
        assert_eq!(doc.module_name(0), "lib");
        assert_eq!(doc.module_name(1), "module1");
    }

    #[test]
    fn test_main_module_by_name() {
        let json = br#"{"wasm": [{"path": "a.wasm", "name": "main"}, {"path": "b.wasm"}]}"#;
        let doc = ManifestDoc::from_input(json).unwrap();
        assert_eq!(doc.main_index().unwrap(), 0);
    }

    #[test]
    fn test_empty_manifest_has_no_main() {
        let doc = ManifestDoc::from_input(b"  {\"wasm\": []}").unwrap();
        assert!(matches!(
            doc.main_index(),
            Err(KernelError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_ambiguous_entry_is_rejected() {
        let json = br#"{"wasm": [{"path": "a.wasm", "url": "https://x/a.wasm"}]}"#;
        let err = ManifestDoc::from_input(json).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_module_input_is_borrowed() {
        let wat = b"(module)";
        let doc = ManifestDoc::from_input(wat).unwrap();
        match &doc.wasm[0].source {
            SourceDoc::Data(Cow::Borrowed(bytes)) => assert_eq!(*bytes, wat),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_input_detection() {
        assert!(looks_like_manifest(b"\n {\"wasm\":[]}"));
        assert!(!looks_like_manifest(b"\0asm{"));
        assert!(!looks_like_manifest(b"(module)"));
        assert!(!looks_like_manifest(b""));
    }

    #[test]
    fn test_hash_verification() {
        let bytes = b"(module)";
        let mut doc = WasmDoc::data(bytes);
        doc.hash = Some(sha256_hex(bytes).to_uppercase());
        assert!(doc.load().is_ok());

        doc.hash = Some("00".repeat(32));
        assert!(matches!(
            doc.load(),
            Err(KernelError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.wat");
        std::fs::write(&path, "(module)").unwrap();

        let doc = WasmDoc {
            source: SourceDoc::Path(path),
            hash: None,
            name: None,
        };
        assert_eq!(doc.load().unwrap().as_ref(), b"(module)");

        let missing = WasmDoc {
            source: SourceDoc::Path(dir.path().join("missing.wasm")),
            hash: None,
            name: None,
        };
        assert!(matches!(missing.load(), Err(KernelError::Load(_))));
    }

    #[test]
    fn test_host_allowed() {
        let mut doc = ManifestDoc::default();
        assert!(!doc.host_allowed("example.com"));

        doc.allowed_hosts = Some(vec!["example.com".into(), "*.rust-lang.org".into()]);
        assert!(doc.host_allowed("example.com"));
        assert!(doc.host_allowed("crates.rust-lang.org"));
        assert!(!doc.host_allowed("rust-lang.org"));
        assert!(!doc.host_allowed("evilrust-lang.org"));
        assert!(!doc.host_allowed("other.com"));
    }

    #[test]
    fn test_fetch_gives_up_on_silent_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/plugin.wasm", listener.local_addr().unwrap());

        let started = std::time::Instant::now();
        let err = fetch(&url, "GET", &BTreeMap::new(), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, KernelError::Load(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(listener);
    }

    #[test]
    fn test_host_allowed_ignores_case() {
        let hosts = vec!["*.Example.com".to_string(), "API.rust-lang.org".to_string()];
        assert!(host_allowed(Some(&hosts), "api.example.COM"));
        assert!(host_allowed(Some(&hosts), "Deep.Sub.EXAMPLE.com"));
        assert!(host_allowed(Some(&hosts), "api.Rust-Lang.org"));
        assert!(!host_allowed(Some(&hosts), "example.com"));
        assert!(!host_allowed(Some(&hosts), "evilexample.COM"));
    }
}
