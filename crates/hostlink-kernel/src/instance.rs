//! Plugin instances
//!
//! An [`Instance`] is one instantiated manifest: a wasmtime store holding the
//! kernel memory and call state, the entry module, and any named modules it
//! was linked against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use error_stack::ResultExt;
use tracing::{debug, info, warn};
use wasmtime::{
    ExternType, Func, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, UpdateDeadline,
};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::filesystem::{DirPerms, FilePerms};
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::env;
use crate::error::{IntoKernelReport, KernelError, KernelReport, KernelResult};
use crate::function::HostFunction;
use crate::kernel::Kernel;
use crate::manifest::{ManifestDoc, MemoryOptions};
use crate::memory::{MemoryStats, PluginMemory};

/// Why the epoch callback stopped a call.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    Timeout(u64),
}

/// Per-store data reachable from guest imports and host functions.
pub struct InstanceState {
    pub(crate) id: String,
    pub(crate) memory: PluginMemory,
    pub(crate) input: Vec<u8>,
    pub(crate) output: Option<(u64, u64)>,
    pub(crate) error: Option<String>,
    pub(crate) host_error: Option<String>,
    pub(crate) config: BTreeMap<String, String>,
    pub(crate) vars: BTreeMap<String, Vec<u8>>,
    pub(crate) allowed_hosts: Option<Vec<String>>,
    pub(crate) limits: MemoryOptions,
    pub(crate) http_status: u16,
    pub(crate) wasi: WasiP1Ctx,
    store_limits: StoreLimits,
    cancel: Arc<AtomicBool>,
    deadline: Option<(Instant, u64)>,
    interrupt: Option<Interrupt>,
}

impl InstanceState {
    /// Total bytes held by plugin variables.
    pub(crate) fn vars_size(&self) -> u64 {
        self.vars
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    /// Time left before the armed call deadline, if any.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    fn begin_call(&mut self, input: &[u8], timeout_ms: Option<u64>) {
        self.input.clear();
        self.input.extend_from_slice(input);
        self.output = None;
        self.error = None;
        self.host_error = None;
        self.interrupt = None;
        self.cancel.store(false, Ordering::SeqCst);
        self.deadline =
            timeout_ms.map(|ms| (Instant::now() + Duration::from_millis(ms), ms));
    }

    fn on_epoch(&mut self) -> wasmtime::Result<UpdateDeadline> {
        if self.cancel.load(Ordering::SeqCst) {
            self.interrupt = Some(Interrupt::Cancelled);
            return Err(wasmtime::Error::msg("plugin call cancelled"));
        }
        if let Some((deadline, ms)) = self.deadline {
            if Instant::now() >= deadline {
                self.interrupt = Some(Interrupt::Timeout(ms));
                return Err(wasmtime::Error::msg("plugin call timed out"));
            }
        }
        Ok(UpdateDeadline::Continue(1))
    }
}

/// Handle that can interrupt a running call from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Weak<AtomicBool>,
    plugin_id: String,
}

impl CancelHandle {
    /// Request cancellation of the in-flight call.
    ///
    /// Returns `false` once the instance has been freed.
    pub fn cancel(&self) -> bool {
        match self.flag.upgrade() {
            Some(flag) => {
                debug!(plugin_id = %self.plugin_id, "Cancel requested");
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// An instantiated plugin.
pub struct Instance {
    id: String,
    store: Store<InstanceState>,
    main: wasmtime::Instance,
    main_module: Module,
    named: Vec<(String, Module, wasmtime::Instance)>,
    cancel: Weak<AtomicBool>,
    timeout_ms: Option<u64>,
    fuel_per_call: Option<u64>,
    output: Vec<u8>,
    calls: u64,
    _kernel: Kernel,
}

impl Instance {
    pub(crate) fn new(
        kernel: &Kernel,
        doc: &ManifestDoc<'_>,
        functions: &[Arc<HostFunction>],
        with_wasi: bool,
    ) -> KernelReport<Self> {
        let main_index = doc.main_index().into_report()?;
        let engine = kernel.engine();
        let config = kernel.config();
        let id = uuid::Uuid::now_v7().to_string();

        let mut linker: Linker<InstanceState> = Linker::new(engine);
        env::add_to_linker(&mut linker)
            .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
            .into_report()
            .attach("while linking kernel imports")?;

        let mut wasi = WasiCtxBuilder::new();
        if with_wasi {
            wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |s: &mut InstanceState| &mut s.wasi)
                .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
                .into_report()
                .attach("while linking WASI")?;

            if config.inherit_stdio {
                wasi.inherit_stdio();
            }
            for (host, guest) in doc.allowed_paths.iter().flatten() {
                wasi.preopened_dir(host, guest, DirPerms::all(), FilePerms::all())
                    .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
                    .into_report()
                    .attach(format!("while opening allowed path {host}"))?;
            }
        }

        for function in functions {
            function
                .define(&mut linker, engine)
                .into_report()
                .attach(format!("while defining host function {}", function.name()))?;
        }

        let limits = doc.memory.unwrap_or_default();
        let mut store_limits = StoreLimitsBuilder::new();
        if let Some(pages) = limits
            .max_pages
            .map(u64::from)
            .or(config.max_guest_memory_pages)
        {
            store_limits = store_limits.memory_size((pages * crate::memory::PAGE_SIZE) as usize);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let state = InstanceState {
            id: id.clone(),
            memory: PluginMemory::new(config.max_kernel_memory_pages),
            input: Vec::new(),
            output: None,
            error: None,
            host_error: None,
            config: doc.config.clone(),
            vars: BTreeMap::new(),
            allowed_hosts: doc.allowed_hosts.clone(),
            limits,
            http_status: 0,
            wasi: wasi.build_p1(),
            store_limits: store_limits.build(),
            cancel: Arc::clone(&cancel),
            deadline: None,
            interrupt: None,
        };

        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.store_limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|mut ctx| ctx.data_mut().on_epoch());
        if let Some(fuel) = config.fuel_per_call {
            store
                .set_fuel(fuel)
                .map_err(KernelError::from)
                .into_report()?;
        }

        let mut named = Vec::new();
        for (index, wasm) in doc.wasm.iter().enumerate() {
            if index == main_index {
                continue;
            }
            let name = doc.module_name(index);
            let bytes = wasm
                .load()
                .into_report()
                .attach(format!("while loading wasm[{index}] {}", doc.describe(index)))?;
            let module = kernel
                .compile(&bytes)
                .into_report()
                .attach(format!("while compiling module {name}"))?;
            let instance = linker
                .instantiate(&mut store, &module)
                .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
                .into_report()
                .attach(format!("while instantiating module {name}"))?;
            linker
                .instance(&mut store, &name, instance)
                .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
                .into_report()
                .attach(format!("while linking module {name}"))?;
            named.push((name, module, instance));
        }

        let bytes = doc.wasm[main_index]
            .load()
            .into_report()
            .attach(format!(
                "while loading wasm[{main_index}] {}",
                doc.describe(main_index)
            ))?;
        let main_module = kernel
            .compile(&bytes)
            .into_report()
            .attach("while compiling main module")?;
        let main = linker
            .instantiate(&mut store, &main_module)
            .map_err(|e| KernelError::Instantiation(format!("{e:#}")))
            .into_report()
            .attach("while instantiating main module")?;

        if let Ok(init) = main.get_typed_func::<(), ()>(&mut store, "_initialize") {
            debug!(plugin_id = %id, "Running _initialize");
            store.data_mut().begin_call(&[], doc.timeout_ms);
            store.set_epoch_deadline(1);
            let outcome = init.call(&mut store, ());
            let state = store.data_mut();
            state.deadline = None;
            if let Err(trap) = outcome {
                let err = match state.interrupt.take() {
                    Some(Interrupt::Timeout(ms)) => KernelError::Timeout(ms),
                    Some(Interrupt::Cancelled) => KernelError::Cancelled,
                    None => KernelError::Instantiation(format!("_initialize failed: {trap:#}")),
                };
                return Err::<Self, _>(err)
                    .into_report()
                    .attach("while running _initialize");
            }
        }

        info!(
            plugin_id = %id,
            modules = doc.wasm.len(),
            wasi = with_wasi,
            host_functions = functions.len(),
            "Plugin instance created"
        );

        Ok(Self {
            id,
            store,
            main,
            main_module,
            named,
            cancel: Arc::downgrade(&cancel),
            timeout_ms: doc.timeout_ms,
            fuel_per_call: config.fuel_per_call,
            output: Vec::new(),
            calls: 0,
            _kernel: kernel.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&mut self, name: &str) -> Option<Func> {
        if let Some(func) = self.main.get_func(&mut self.store, name) {
            return Some(func);
        }
        let (module, export) = name.split_once("::")?;
        let (_, _, instance) = self.named.iter().find(|(n, _, _)| n == module)?;
        let instance = *instance;
        instance.get_func(&mut self.store, export)
    }

    /// Whether `name` is an exported function. `module::name` looks in a
    /// named module.
    pub fn function_exists(&self, name: &str) -> bool {
        let is_func = |module: &Module, export: &str| {
            matches!(module.get_export(export), Some(ExternType::Func(_)))
        };
        if is_func(&self.main_module, name) {
            return true;
        }
        name.split_once("::").is_some_and(|(module, export)| {
            self.named
                .iter()
                .any(|(n, m, _)| n == module && is_func(m, export))
        })
    }

    /// Call an export with `input`, returning the bytes it set as output.
    ///
    /// The export must take no parameters and return nothing or a single
    /// integer status; a non-zero status is a failure.
    pub fn call(&mut self, name: &str, input: &[u8]) -> KernelResult<&[u8]> {
        let func = self
            .resolve(name)
            .ok_or_else(|| KernelError::FunctionNotFound(name.to_string()))?;

        let ty = func.ty(&self.store);
        if ty.params().len() != 0 || ty.results().len() > 1 {
            return Err(KernelError::Call(format!(
                "export `{name}` must take no parameters and return at most one status value"
            )));
        }

        let timeout_ms = self.timeout_ms;
        self.store.data_mut().begin_call(input, timeout_ms);
        self.store.set_epoch_deadline(1);
        if let Some(fuel) = self.fuel_per_call {
            self.store.set_fuel(fuel)?;
        }

        self.calls += 1;
        debug!(plugin_id = %self.id, function = name, input_len = input.len(), "Calling plugin");
        let started = Instant::now();
        let mut results = vec![wasmtime::Val::I32(0); ty.results().len()];
        let outcome = func.call(&mut self.store, &[], &mut results);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let state = self.store.data_mut();
        if let Err(trap) = outcome {
            let err = match state.interrupt.take() {
                Some(Interrupt::Cancelled) => KernelError::Cancelled,
                Some(Interrupt::Timeout(ms)) => KernelError::Timeout(ms),
                None => KernelError::Call(
                    state
                        .host_error
                        .take()
                        .or_else(|| state.error.clone())
                        .unwrap_or_else(|| format!("{trap:#}")),
                ),
            };
            warn!(plugin_id = %self.id, function = name, elapsed_ms, error = %err, "Plugin call failed");
            return Err(err);
        }

        let status = match results.first() {
            Some(wasmtime::Val::I32(v)) => i64::from(*v),
            Some(wasmtime::Val::I64(v)) => *v,
            _ => 0,
        };
        if status != 0 || state.error.is_some() {
            let message = state.error.clone().unwrap_or_else(|| {
                format!("plugin function `{name}` returned non-zero exit code: {status}")
            });
            warn!(plugin_id = %self.id, function = name, status, "Plugin returned an error");
            return Err(KernelError::Call(message));
        }

        self.output.clear();
        if let Some((offset, len)) = state.output {
            self.output.extend_from_slice(state.memory.read(offset, len)?);
        }

        info!(
            plugin_id = %self.id,
            function = name,
            elapsed_ms,
            output_len = self.output.len(),
            "Plugin call finished"
        );
        Ok(&self.output)
    }

    /// Merge a JSON object of config values; `null` removes a key.
    pub fn set_config(&mut self, json: &[u8]) -> KernelResult<()> {
        let update: BTreeMap<String, Option<String>> = serde_json::from_slice(json)
            .map_err(|e| KernelError::Config(format!("invalid config object: {e}")))?;

        let config = &mut self.store.data_mut().config;
        for (key, value) in update {
            match value {
                Some(value) => {
                    config.insert(key, value);
                }
                None => {
                    config.remove(&key);
                }
            }
        }
        debug!(plugin_id = %self.id, keys = config.len(), "Plugin config updated");
        Ok(())
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.store.data().config
    }

    /// Handle for interrupting calls from other threads.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
            plugin_id: self.id.clone(),
        }
    }

    /// Discard all kernel memory. Handles issued before become invalid.
    pub fn reset(&mut self) -> bool {
        let state = self.store.data_mut();
        state.memory.reset();
        state.output = None;
        state.error = None;
        self.output.clear();
        debug!(plugin_id = %self.id, "Plugin memory reset");
        true
    }

    /// Message recorded by the guest through `error_set` in the last call.
    pub fn error(&self) -> Option<&str> {
        self.store.data().error.as_deref()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.store.data().memory.stats()
    }

    pub fn var(&self, key: &str) -> Option<&[u8]> {
        self.store.data().vars.get(key).map(Vec::as_slice)
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        info!(plugin_id = %self.id, calls = self.calls, "Plugin instance freed");
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("named", &self.named.iter().map(|(n, _, _)| n).collect::<Vec<_>>())
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}
