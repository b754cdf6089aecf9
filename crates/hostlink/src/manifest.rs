//! Manifest model
//!
//! A [`Manifest`] lists the wasm modules of a plugin and the sandbox policy
//! they run under. It can be rendered to the JSON wire form or handed to the
//! kernel in-process through [`Manifest::as_document`], which borrows the
//! module bytes instead of copying them.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hostlink_kernel::{ManifestDoc, MemoryOptions, SourceDoc, WasmDoc};
use serde_json::{Map, Value, json};

/// Where a module's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WasmSource {
    Path(PathBuf),
    Url {
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
    },
    Bytes(Vec<u8>),
}

/// One module entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wasm {
    source: WasmSource,
    hash: Option<String>,
    name: Option<String>,
}

impl Wasm {
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::from_source(WasmSource::Path(path.as_ref().to_path_buf()))
    }

    /// A module fetched over HTTP with `GET` and no extra headers.
    pub fn url(url: impl Into<String>) -> Self {
        Self::from_source(WasmSource::Url {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
        })
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_source(WasmSource::Bytes(bytes.into()))
    }

    fn from_source(source: WasmSource) -> Self {
        Self {
            source,
            hash: None,
            name: None,
        }
    }

    /// Expected hex sha256 of the module bytes, checked at load time.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Link name other modules of the manifest import from.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// HTTP method of a URL source. Ignored for other sources.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        if let WasmSource::Url { method: m, .. } = &mut self.source {
            *m = method.into();
        }
        self
    }

    /// Request header of a URL source. Ignored for other sources.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let WasmSource::Url { headers, .. } = &mut self.source {
            headers.insert(key.into(), value.into());
        }
        self
    }

    pub fn source(&self) -> &WasmSource {
        &self.source
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn render(&self) -> Value {
        let mut entry = Map::new();
        match &self.source {
            WasmSource::Path(path) => {
                entry.insert("path".into(), json!(path.to_string_lossy()));
            }
            WasmSource::Url {
                url,
                method,
                headers,
            } => {
                entry.insert("url".into(), json!(url));
                entry.insert("method".into(), json!(method));
                if !headers.is_empty() {
                    entry.insert("headers".into(), json!(headers));
                }
            }
            WasmSource::Bytes(bytes) => {
                entry.insert("data".into(), json!(BASE64.encode(bytes)));
            }
        }
        if let Some(hash) = &self.hash {
            entry.insert("hash".into(), json!(hash));
        }
        if let Some(name) = &self.name {
            entry.insert("name".into(), json!(name));
        }
        Value::Object(entry)
    }

    fn as_document(&self) -> WasmDoc<'_> {
        let source = match &self.source {
            WasmSource::Path(path) => SourceDoc::Path(path.clone()),
            WasmSource::Url {
                url,
                method,
                headers,
            } => SourceDoc::Url {
                url: url.clone(),
                method: method.clone(),
                headers: headers.clone(),
            },
            WasmSource::Bytes(bytes) => SourceDoc::Data(Cow::Borrowed(bytes)),
        };
        WasmDoc {
            source,
            hash: self.hash.clone(),
            name: self.name.clone(),
        }
    }
}

/// Declarative description of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    wasm: Vec<Wasm>,
    config: BTreeMap<String, String>,
    allowed_hosts: Vec<String>,
    allowed_paths: BTreeMap<String, String>,
    timeout_ms: Option<u64>,
    memory: Option<MemoryOptions>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manifest with a single module read from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new().with_wasm(Wasm::path(path))
    }

    /// Manifest with a single module fetched from `url`.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new().with_wasm(Wasm::url(url))
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    pub fn add_wasm(&mut self, wasm: Wasm) {
        self.wasm.push(wasm);
    }

    pub fn add_path(&mut self, path: impl AsRef<Path>, hash: Option<&str>) {
        self.add_wasm(with_optional_hash(Wasm::path(path), hash));
    }

    pub fn add_url(&mut self, url: impl Into<String>, hash: Option<&str>) {
        self.add_wasm(with_optional_hash(Wasm::url(url), hash));
    }

    pub fn add_bytes(&mut self, bytes: impl Into<Vec<u8>>, hash: Option<&str>) {
        self.add_wasm(with_optional_hash(Wasm::bytes(bytes), hash));
    }

    /// Set a config value, replacing any previous value for `key`.
    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.insert(key.into(), value.into());
    }

    pub fn allow_host(&mut self, host: impl Into<String>) {
        self.allowed_hosts.push(host.into());
    }

    /// Map host directory `src` into the guest at `dest` (defaults to `src`).
    pub fn allow_path(&mut self, src: impl Into<String>, dest: Option<&str>) {
        let src = src.into();
        let dest = dest.map(str::to_string).unwrap_or_else(|| src.clone());
        self.allowed_paths.insert(src, dest);
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = Some(timeout_ms);
    }

    pub fn set_memory(&mut self, memory: MemoryOptions) {
        self.memory = Some(memory);
    }

    // ========================================================================
    // Builders
    // ========================================================================

    pub fn with_wasm(mut self, wasm: Wasm) -> Self {
        self.add_wasm(wasm);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_config(key, value);
        self
    }

    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allow_host(host);
        self
    }

    pub fn with_allowed_path(mut self, src: impl Into<String>, dest: Option<&str>) -> Self {
        self.allow_path(src, dest);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.set_timeout(timeout_ms);
        self
    }

    pub fn with_memory(mut self, memory: MemoryOptions) -> Self {
        self.set_memory(memory);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn wasm(&self) -> &[Wasm] {
        &self.wasm
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn allowed_paths(&self) -> &BTreeMap<String, String> {
        &self.allowed_paths
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    pub fn memory(&self) -> Option<MemoryOptions> {
        self.memory
    }

    // ========================================================================
    // Conversion
    // ========================================================================

    /// The JSON wire form. Empty and unset fields are omitted.
    pub fn render(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(
            "wasm".into(),
            Value::Array(self.wasm.iter().map(Wasm::render).collect()),
        );
        if !self.config.is_empty() {
            doc.insert("config".into(), json!(self.config));
        }
        if !self.allowed_hosts.is_empty() {
            doc.insert("allowed_hosts".into(), json!(self.allowed_hosts));
        }
        if !self.allowed_paths.is_empty() {
            doc.insert("allowed_paths".into(), json!(self.allowed_paths));
        }
        if let Some(timeout_ms) = self.timeout_ms {
            doc.insert("timeout_ms".into(), json!(timeout_ms));
        }
        if let Some(memory) = &self.memory {
            doc.insert("memory".into(), json!(memory));
        }
        Value::Object(doc)
    }

    pub fn to_json(&self) -> String {
        self.render().to_string()
    }

    /// Kernel document borrowing this manifest's module bytes.
    pub fn as_document(&self) -> ManifestDoc<'_> {
        ManifestDoc {
            wasm: self.wasm.iter().map(Wasm::as_document).collect(),
            config: self.config.clone(),
            allowed_hosts: (!self.allowed_hosts.is_empty()).then(|| self.allowed_hosts.clone()),
            allowed_paths: (!self.allowed_paths.is_empty()).then(|| self.allowed_paths.clone()),
            timeout_ms: self.timeout_ms,
            memory: self.memory,
        }
    }
}

fn with_optional_hash(wasm: Wasm, hash: Option<&str>) -> Wasm {
    match hash {
        Some(hash) => wasm.with_hash(hash),
        None => wasm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_omits_empty_fields() {
        let manifest = Manifest::from_path("/plugins/count_vowels.wasm");
        assert_eq!(
            manifest.render(),
            json!({"wasm": [{"path": "/plugins/count_vowels.wasm"}]})
        );
    }

    #[test]
    fn test_render_full_manifest() {
        let mut manifest = Manifest::new();
        manifest.add_bytes(b"\0asm".to_vec(), Some("abc"));
        manifest.add_wasm(
            Wasm::url("https://example.com/p.wasm")
                .with_method("POST")
                .with_header("Authorization", "Bearer x")
                .with_name("main"),
        );
        manifest.set_config("thing", "testing");
        manifest.allow_host("*.example.com");
        manifest.allow_path("/data", Some("/mnt"));
        manifest.set_timeout(1000);
        manifest.set_memory(MemoryOptions {
            max_pages: Some(4),
            ..Default::default()
        });

        let rendered = manifest.render();
        assert_eq!(rendered["wasm"][0], json!({"data": "AGFzbQ==", "hash": "abc"}));
        assert_eq!(
            rendered["wasm"][1],
            json!({
                "url": "https://example.com/p.wasm",
                "method": "POST",
                "headers": {"Authorization": "Bearer x"},
                "name": "main"
            })
        );
        assert_eq!(rendered["config"], json!({"thing": "testing"}));
        assert_eq!(rendered["allowed_hosts"], json!(["*.example.com"]));
        assert_eq!(rendered["allowed_paths"], json!({"/data": "/mnt"}));
        assert_eq!(rendered["timeout_ms"], json!(1000));
        assert_eq!(rendered["memory"], json!({"max_pages": 4}));
    }

    #[test]
    fn test_rendered_json_parses_as_kernel_document() {
        let manifest = Manifest::new()
            .with_wasm(Wasm::bytes(b"(module)".to_vec()).with_name("lib"))
            .with_config("k", "v")
            .with_timeout(50);

        let json = manifest.to_json();
        let doc: ManifestDoc<'static> = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, manifest.as_document());
    }

    #[test]
    fn test_config_overwrites() {
        let manifest = Manifest::new()
            .with_config("a", "1")
            .with_config("a", "2");
        assert_eq!(manifest.config().get("a").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_allow_path_defaults_to_source() {
        let mut manifest = Manifest::new();
        manifest.allow_path("/tmp", None);
        manifest.allow_path("/data", Some("/a"));
        manifest.allow_path("/data", Some("/b"));
        assert_eq!(manifest.allowed_paths()["/tmp"], "/tmp");
        assert_eq!(manifest.allowed_paths()["/data"], "/b");
    }

    #[test]
    fn test_allowed_hosts_keep_duplicates() {
        let manifest = Manifest::new()
            .with_allowed_host("a.com")
            .with_allowed_host("a.com");
        assert_eq!(manifest.allowed_hosts().len(), 2);
    }

    #[test]
    fn test_document_borrows_bytes() {
        let manifest = Manifest::new().with_wasm(Wasm::bytes(vec![1, 2, 3]));
        let doc = manifest.as_document();
        match &doc.wasm[0].source {
            SourceDoc::Data(Cow::Borrowed(bytes)) => assert_eq!(*bytes, &[1, 2, 3]),
            other => panic!("expected borrowed bytes, got {other:?}"),
        }
        assert!(doc.allowed_hosts.is_none());
        assert!(doc.allowed_paths.is_none());
    }

    #[test]
    fn test_method_ignored_for_path() {
        let wasm = Wasm::path("/a.wasm").with_method("POST").with_header("k", "v");
        assert_eq!(wasm.source(), &WasmSource::Path(PathBuf::from("/a.wasm")));
    }
}
