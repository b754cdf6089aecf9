//! Host function registrations
//!
//! A [`HostFunction`] is a named, typed native callback that guests import.
//! The linker of every instance built with it keeps an `Arc` clone, so the
//! callback and whatever it captures outlive all calls into it.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use wasmtime::{Caller, Engine, FuncType, Linker};

use crate::error::{KernelError, KernelResult};
use crate::instance::InstanceState;
use crate::memory::PluginMemory;
use crate::types::{Val, ValType};

/// Import namespace of user host functions unless overridden.
pub const DEFAULT_NAMESPACE: &str = "hostlink:host/user";

/// Raw callback type: live instance, inputs, output slots.
pub type HostCallback =
    Arc<dyn Fn(&mut CurrentInstance<'_>, &[Val], &mut [Val]) -> KernelResult<()> + Send + Sync>;

/// View of the instance a host function was invoked from.
///
/// Only lives for the duration of one callback.
pub struct CurrentInstance<'a> {
    memory: &'a mut PluginMemory,
    plugin_id: &'a str,
}

impl<'a> CurrentInstance<'a> {
    pub fn new(memory: &'a mut PluginMemory, plugin_id: &'a str) -> Self {
        Self { memory, plugin_id }
    }

    pub fn memory(&self) -> &PluginMemory {
        self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PluginMemory {
        self.memory
    }

    pub fn plugin_id(&self) -> &str {
        self.plugin_id
    }

    /// Memory and plugin id borrowed together.
    pub fn split(&mut self) -> (&mut PluginMemory, &str) {
        (self.memory, self.plugin_id)
    }
}

/// A native function importable by guests.
pub struct HostFunction {
    name: String,
    namespace: RwLock<String>,
    params: Vec<ValType>,
    results: Vec<ValType>,
    callback: HostCallback,
}

impl HostFunction {
    /// Register a callback under `name`.
    ///
    /// Fails if the signature uses a kind other than i32/i64/f32/f64.
    pub fn new<F>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        callback: F,
    ) -> KernelResult<Self>
    where
        F: Fn(&mut CurrentInstance<'_>, &[Val], &mut [Val]) -> KernelResult<()>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(KernelError::InvalidFunction {
                name,
                reason: "name must not be empty".into(),
            });
        }

        let params: Vec<ValType> = params.into_iter().collect();
        let results: Vec<ValType> = results.into_iter().collect();
        if let Some(bad) = params.iter().chain(&results).find(|t| !t.is_supported()) {
            return Err(KernelError::UnsupportedValType(*bad));
        }

        Ok(Self {
            name,
            namespace: RwLock::new(DEFAULT_NAMESPACE.to_string()),
            params,
            results,
            callback: Arc::new(callback),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> String {
        self.namespace.read().clone()
    }

    /// Change the import namespace. Affects instances created afterwards.
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        *self.namespace.write() = namespace.into();
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// Invoke the callback directly, outside of any guest.
    pub fn invoke(
        &self,
        current: &mut CurrentInstance<'_>,
        inputs: &[Val],
        outputs: &mut [Val],
    ) -> KernelResult<()> {
        (self.callback)(current, inputs, outputs)
    }

    pub(crate) fn define(
        self: &Arc<Self>,
        linker: &mut Linker<InstanceState>,
        engine: &Engine,
    ) -> KernelResult<()> {
        let params = self
            .params
            .iter()
            .map(|t| t.to_wasmtime())
            .collect::<KernelResult<Vec<_>>>()?;
        let results = self
            .results
            .iter()
            .map(|t| t.to_wasmtime())
            .collect::<KernelResult<Vec<_>>>()?;
        let ty = FuncType::new(engine, params, results);
        let namespace = self.namespace();

        debug!(namespace = %namespace, name = %self.name, "Defining host function");

        let func = Arc::clone(self);
        linker
            .func_new(
                &namespace,
                &self.name,
                ty,
                move |mut caller: Caller<'_, InstanceState>,
                      params: &[wasmtime::Val],
                      results: &mut [wasmtime::Val]| {
                    func.dispatch(caller.data_mut(), params, results)
                },
            )
            .map_err(|e| {
                KernelError::Instantiation(format!(
                    "cannot define {namespace}::{}: {e:#}",
                    self.name
                ))
            })?;
        Ok(())
    }

    fn dispatch(
        &self,
        state: &mut InstanceState,
        params: &[wasmtime::Val],
        results: &mut [wasmtime::Val],
    ) -> wasmtime::Result<()> {
        let inputs = params
            .iter()
            .map(Val::from_wasmtime)
            .collect::<KernelResult<Vec<_>>>()
            .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
        let mut outputs = self
            .results
            .iter()
            .map(|t| Val::default_for(*t))
            .collect::<KernelResult<Vec<_>>>()
            .map_err(|e| wasmtime::Error::msg(e.to_string()))?;

        let outcome = {
            let mut current = CurrentInstance::new(&mut state.memory, &state.id);
            (self.callback)(&mut current, &inputs, &mut outputs)
        };
        if let Err(e) = outcome {
            warn!(plugin_id = %state.id, function = %self.name, error = %e, "Host function failed");
            let message = match e {
                KernelError::HostFunction(msg) => msg,
                other => other.to_string(),
            };
            state.host_error = Some(message.clone());
            return Err(wasmtime::Error::msg(message));
        }

        for ((slot, value), expected) in results.iter_mut().zip(&outputs).zip(&self.results) {
            if value.ty() != *expected {
                let message = format!(
                    "host function `{}` produced {} for a {} result",
                    self.name,
                    value.ty(),
                    expected
                );
                state.host_error = Some(message.clone());
                return Err(wasmtime::Error::msg(message));
            }
            *slot = value.to_wasmtime();
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("namespace", &*self.namespace.read())
            .field("params", &self.params)
            .field("results", &self.results)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_len() -> HostFunction {
        HostFunction::new(
            "echo_len",
            [ValType::I64],
            [ValType::I64],
            |current, inputs, outputs| {
                let handle = inputs[0].handle().unwrap_or_default();
                outputs[0] = Val::I64(current.memory().length(handle) as i64);
                Ok(())
            },
        )
        .unwrap()
    }

    #[test]
    fn test_namespace_defaults_and_updates() {
        let func = echo_len();
        assert_eq!(func.namespace(), DEFAULT_NAMESPACE);

        func.set_namespace("env");
        assert_eq!(func.namespace(), "env");
        assert_eq!(func.params(), &[ValType::I64]);
    }

    #[test]
    fn test_unsupported_kinds_rejected() {
        let err = HostFunction::new("bad", [ValType::V128], [], |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedValType(ValType::V128)));

        let err = HostFunction::new("bad", [], [ValType::ExternRef], |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedValType(ValType::ExternRef)));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = HostFunction::new("", [], [], |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::InvalidFunction { .. }));
    }

    #[test]
    fn test_invoke_outside_guest() {
        let func = echo_len();
        let mut memory = PluginMemory::new(1);
        let handle = memory.alloc_bytes(b"four").unwrap();

        let mut current = CurrentInstance::new(&mut memory, "test");
        let mut outputs = [Val::I64(0)];
        func.invoke(&mut current, &[Val::from(handle)], &mut outputs)
            .unwrap();
        assert_eq!(outputs[0], Val::I64(4));
    }
}
