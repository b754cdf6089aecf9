//! Host function binding
//!
//! A [`Function`] pairs a native callback with the data it needs. Guests
//! import it as `namespace::name`; inside the callback a [`CurrentPlugin`]
//! gives access to arguments, results and plugin memory.

use std::sync::Arc;

use hostlink_kernel::{HostFunction, KernelError, ValType};
use parking_lot::{Mutex, MutexGuard};

use crate::current_plugin::CurrentPlugin;
use crate::error::{Error, Result};

type Release<T> = Box<dyn FnOnce(&mut T) + Send>;

struct UserDataInner<T> {
    value: Mutex<T>,
    release: Mutex<Option<Release<T>>>,
}

impl<T> Drop for UserDataInner<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.get_mut().take() {
            release(self.value.get_mut());
        }
    }
}

/// Data shared between a host function and its caller.
///
/// Clones share the same value. The release closure, if any, runs once when
/// the last clone goes away.
pub struct UserData<T> {
    inner: Option<Arc<UserDataInner<T>>>,
}

impl<T: Send + 'static> UserData<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Some(Arc::new(UserDataInner {
                value: Mutex::new(value),
                release: Mutex::new(None),
            })),
        }
    }

    /// Like [`UserData::new`], running `release` on the value when the last
    /// clone is dropped.
    pub fn with_release(value: T, release: impl FnOnce(&mut T) + Send + 'static) -> Self {
        Self {
            inner: Some(Arc::new(UserDataInner {
                value: Mutex::new(value),
                release: Mutex::new(Some(Box::new(release))),
            })),
        }
    }

    /// No data.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Lock the value. `None` when constructed with [`UserData::none`].
    pub fn get(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.as_ref().map(|inner| inner.value.lock())
    }

    pub fn is_none(&self) -> bool {
        self.inner.is_none()
    }
}

impl<T> Clone for UserData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for UserData<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> std::fmt::Debug for UserData<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserData")
            .field("present", &self.inner.is_some())
            .finish()
    }
}

/// A host function that can be linked into plugins.
///
/// Clones refer to the same registration, so a namespace change is seen by
/// every clone.
#[derive(Debug, Clone)]
pub struct Function {
    inner: Arc<HostFunction>,
}

impl Function {
    /// Register `f` under `name` with the given signature.
    ///
    /// Handle-typed parameters are declared as [`PTR`](hostlink_kernel::PTR).
    pub fn new<T, F>(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = ValType>,
        outputs: impl IntoIterator<Item = ValType>,
        user_data: UserData<T>,
        f: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: Fn(&mut CurrentPlugin<'_>, &UserData<T>) -> Result<()> + Send + Sync + 'static,
    {
        let inner = HostFunction::new(name, inputs, outputs, move |current, inputs, outputs| {
            let (memory, plugin_id) = current.split();
            let mut plugin = CurrentPlugin::new(memory, plugin_id, inputs, outputs);
            f(&mut plugin, &user_data).map_err(|e| KernelError::HostFunction(e.to_string()))
        })
        .map_err(|e| Error::Registration(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Import namespace. Applies to plugins created after the change.
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.inner.set_namespace(namespace);
    }

    pub fn with_namespace(self, namespace: impl Into<String>) -> Self {
        self.set_namespace(namespace);
        self
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn namespace(&self) -> String {
        self.inner.namespace()
    }

    pub fn inputs(&self) -> &[ValType] {
        self.inner.params()
    }

    pub fn outputs(&self) -> &[ValType] {
        self.inner.results()
    }

    pub(crate) fn host_function(&self) -> &Arc<HostFunction> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hostlink_kernel::{CurrentInstance, DEFAULT_NAMESPACE, PTR, PluginMemory, Val};

    use super::*;

    #[test]
    fn test_user_data_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let data = UserData::with_release(vec![1, 2, 3], move |v: &mut Vec<i32>| {
            assert_eq!(v.len(), 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let copy = data.clone();
        drop(data);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_user_data_none() {
        let data: UserData<String> = UserData::default();
        assert!(data.is_none());
        assert!(data.get().is_none());

        let data = UserData::new(String::from("x"));
        data.get().unwrap().push('y');
        assert_eq!(&*data.get().unwrap(), "xy");
    }

    #[test]
    fn test_registration_rejects_v128() {
        let err = Function::new("bad", [ValType::V128], [], UserData::<()>::none(), |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[test]
    fn test_namespace_shared_by_clones() {
        let func = Function::new("f", [PTR], [PTR], UserData::<()>::none(), |_, _| Ok(())).unwrap();
        let clone = func.clone();
        assert_eq!(clone.namespace(), DEFAULT_NAMESPACE);

        func.set_namespace("env");
        assert_eq!(clone.namespace(), "env");
        assert_eq!(clone.name(), "f");
        assert_eq!(clone.inputs(), &[PTR]);
        assert_eq!(clone.outputs(), &[PTR]);
    }

    #[test]
    fn test_callback_sees_user_data_and_memory() {
        let func = Function::new(
            "shout",
            [PTR],
            [PTR],
            UserData::new(0u32),
            |plugin, data| {
                let upper = plugin.input_str(0)?.to_uppercase();
                *data.get().unwrap() += 1;
                plugin.output_str(&upper, 0);
                Ok(())
            },
        )
        .unwrap();

        let mut memory = PluginMemory::new(1);
        let handle = memory.alloc_bytes(b"hello").unwrap();
        let mut outputs = [Val::I64(0)];
        let mut current = CurrentInstance::new(&mut memory, "id");
        func.host_function()
            .invoke(&mut current, &[Val::from(handle)], &mut outputs)
            .unwrap();

        let out = outputs[0].handle().unwrap();
        assert_eq!(memory.bytes(out).unwrap(), b"HELLO");
    }

    #[test]
    fn test_callback_error_becomes_host_error() {
        let func = Function::new("fail", [], [], UserData::<()>::none(), |_, _| {
            Err(Error::Call("nope".into()))
        })
        .unwrap();

        let mut memory = PluginMemory::new(1);
        let mut current = CurrentInstance::new(&mut memory, "id");
        let err = func.host_function().invoke(&mut current, &[], &mut []).unwrap_err();
        assert!(matches!(err, KernelError::HostFunction(msg) if msg == "nope"));
    }
}
