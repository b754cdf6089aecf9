//! Kernel
//!
//! Owns the wasmtime engine, the compiled-module cache and the epoch ticker
//! that drives timeouts and cancellation. Cheap to clone; every
//! [`Instance`] keeps a clone so the ticker outlives it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Module};

use crate::config::KernelConfig;
use crate::error::{IntoKernelReport, KernelError, KernelReport, KernelResult};
use crate::function::HostFunction;
use crate::instance::Instance;
use crate::manifest::{ManifestDoc, sha256_hex};

static SHARED: OnceLock<Kernel> = OnceLock::new();

/// Compiled modules keyed by the sha256 of their source bytes.
pub struct ModuleCache {
    modules: Mutex<HashMap<String, Module>>,
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModuleCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, hash: &str) -> Option<Module> {
        let found = self.modules.lock().get(hash).cloned();
        match found {
            Some(module) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(module)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, hash: String, module: Module) {
        if self.max_entries == 0 {
            return;
        }
        let mut modules = self.modules.lock();
        let mut order = self.order.lock();

        // Evict oldest entries when at capacity
        while modules.len() >= self.max_entries {
            match order.pop_front() {
                Some(oldest) => {
                    modules.remove(&oldest);
                }
                None => break,
            }
        }

        if modules.insert(hash.clone(), module).is_none() {
            order.push_back(hash);
        }
    }

    pub fn clear(&self) {
        self.modules.lock().clear();
        self.order.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.modules.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct KernelInner {
    engine: Engine,
    config: KernelConfig,
    cache: ModuleCache,
    stop: Arc<AtomicBool>,
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        debug!("Kernel dropped, epoch ticker stopping");
    }
}

/// Shared engine state. Clones refer to the same engine and cache.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.consume_fuel(config.fuel_per_call.is_some());

        let engine = Engine::new(&wasm_config)
            .map_err(|e| KernelError::Internal(format!("failed to create engine: {e:#}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        start_epoch_ticker(engine.clone(), config.epoch_tick_ms, Arc::clone(&stop))?;

        info!(
            epoch_tick_ms = config.epoch_tick_ms,
            fuel = config.fuel_per_call.is_some(),
            "Kernel started"
        );

        Ok(Self {
            inner: Arc::new(KernelInner {
                engine,
                cache: ModuleCache::new(config.module_cache_size),
                config,
                stop,
            }),
        })
    }

    /// Process-wide kernel configured from `HOSTLINK_*` environment variables.
    pub fn shared() -> KernelResult<Self> {
        if let Some(kernel) = SHARED.get() {
            return Ok(kernel.clone());
        }

        let config = KernelConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring invalid kernel environment config");
            KernelConfig::default()
        });
        let kernel = Kernel::new(config)?;
        Ok(SHARED.get_or_init(|| kernel).clone())
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Compile module bytes (binary or WAT text), reusing cached modules.
    pub fn compile(&self, bytes: &[u8]) -> KernelResult<Module> {
        let hash = sha256_hex(bytes);
        let short_hash = hash[..12].to_string();
        if let Some(module) = self.inner.cache.get(&hash) {
            debug!(hash = %short_hash, "Using cached module");
            return Ok(module);
        }

        let start = Instant::now();
        let module = Module::new(&self.inner.engine, bytes)
            .map_err(|e| KernelError::Compilation(format!("{e:#}")))?;
        let compile_ms = start.elapsed().as_millis() as u64;

        info!(
            hash = %short_hash,
            size = bytes.len(),
            compile_ms,
            "Compiled module"
        );
        self.inner.cache.insert(hash, module.clone());
        Ok(module)
    }

    /// Instantiate raw input: a wasm binary, WAT text or a JSON manifest.
    pub fn instantiate(
        &self,
        bytes: &[u8],
        functions: &[Arc<HostFunction>],
        with_wasi: bool,
    ) -> KernelReport<Instance> {
        let doc = ManifestDoc::from_input(bytes).into_report()?;
        self.instantiate_manifest(&doc, functions, with_wasi)
    }

    /// Instantiate a manifest document.
    pub fn instantiate_manifest(
        &self,
        doc: &ManifestDoc<'_>,
        functions: &[Arc<HostFunction>],
        with_wasi: bool,
    ) -> KernelReport<Instance> {
        Instance::new(self, doc, functions, with_wasi)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache.stats())
            .finish()
    }
}

fn start_epoch_ticker(engine: Engine, tick_ms: u64, stop: Arc<AtomicBool>) -> KernelResult<()> {
    let tick = Duration::from_millis(tick_ms.max(1));
    std::thread::Builder::new()
        .name("hostlink-epoch".into())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(tick);
                engine.increment_epoch();
            }
        })
        .map_err(KernelError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER_WAT: &str = r#"(module (func (export "answer") (result i32) i32.const 42))"#;

    #[test]
    fn test_compile_uses_cache() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();

        kernel.compile(ANSWER_WAT.as_bytes()).unwrap();
        kernel.compile(ANSWER_WAT.as_bytes()).unwrap();

        let stats = kernel.cache_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        kernel.clear_cache();
        assert_eq!(kernel.cache_stats().entries, 0);
    }

    #[test]
    fn test_compile_error() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let err = kernel.compile(b"(module (func (export").unwrap_err();
        assert!(matches!(err, KernelError::Compilation(_)));
    }

    #[test]
    fn test_module_cache_evicts_oldest() {
        let kernel = Kernel::new(KernelConfig::default().with_module_cache_size(1)).unwrap();
        kernel.compile(b"(module)").unwrap();
        kernel.compile(ANSWER_WAT.as_bytes()).unwrap();
        assert_eq!(kernel.cache_stats().entries, 1);

        kernel.compile(ANSWER_WAT.as_bytes()).unwrap();
        assert_eq!(kernel.cache_stats().hits, 1);
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            entries: 4,
            hits: 80,
            misses: 20,
        };
        assert_eq!(stats.hit_rate(), 0.8);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_shared_kernel_is_reused() {
        let a = Kernel::shared().unwrap();
        let b = Kernel::shared().unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
