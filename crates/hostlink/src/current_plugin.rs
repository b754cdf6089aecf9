//! Memory bridge for host functions
//!
//! A [`CurrentPlugin`] is what a host function sees while a guest is blocked
//! on it: the typed argument slots, the result slots and the plugin's kernel
//! memory. Byte buffers cross the boundary as [`MemoryHandle`]s stored in
//! `i64` slots.

use hostlink_kernel::{MemoryHandle, PluginMemory, Val, ValType};
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// The running plugin, as seen from inside a host function.
pub struct CurrentPlugin<'a> {
    memory: &'a mut PluginMemory,
    plugin_id: &'a str,
    inputs: &'a [Val],
    outputs: &'a mut [Val],
}

impl<'a> CurrentPlugin<'a> {
    pub fn new(
        memory: &'a mut PluginMemory,
        plugin_id: &'a str,
        inputs: &'a [Val],
        outputs: &'a mut [Val],
    ) -> Self {
        Self {
            memory,
            plugin_id,
            inputs,
            outputs,
        }
    }

    /// Id of the instance the call came from.
    pub fn plugin_id(&self) -> &str {
        self.plugin_id
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    pub fn input_val(&self, index: usize) -> Result<&Val> {
        self.inputs.get(index).ok_or(Error::OutOfRange {
            kind: "input",
            index,
            arity: self.inputs.len(),
        })
    }

    /// Bytes of the memory block whose handle is in input slot `index`.
    ///
    /// A null handle reads as an empty buffer.
    pub fn input_bytes(&self, index: usize) -> Result<&[u8]> {
        let val = self.input_val(index)?;
        let handle = val.handle().ok_or(Error::TypeMismatch {
            expected: ValType::I64,
            actual: val.ty(),
        })?;
        if handle.is_null() {
            return Ok(&[]);
        }
        self.memory
            .bytes(handle)
            .ok_or_else(|| Error::Memory(format!("{handle} is not an allocated block")))
    }

    pub fn input_str(&self, index: usize) -> Result<&str> {
        Ok(std::str::from_utf8(self.input_bytes(index)?)?)
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    pub fn output_val(&mut self, index: usize) -> Result<&mut Val> {
        let arity = self.outputs.len();
        self.outputs.get_mut(index).ok_or(Error::OutOfRange {
            kind: "output",
            index,
            arity,
        })
    }

    /// Copy `bytes` into a new block and store its handle in output slot
    /// `index`. Returns false, leaving every slot untouched, if the slot
    /// does not exist or memory is exhausted.
    pub fn output_bytes(&mut self, bytes: &[u8], index: usize) -> bool {
        if index >= self.outputs.len() {
            return false;
        }
        match self.memory.alloc_bytes(bytes) {
            Ok(handle) => {
                self.outputs[index] = Val::from(handle);
                true
            }
            Err(e) => {
                warn!(plugin_id = %self.plugin_id, error = %e, "Cannot allocate host function output");
                false
            }
        }
    }

    pub fn output_str(&mut self, s: &str, index: usize) -> bool {
        self.output_bytes(s.as_bytes(), index)
    }

    /// Serialize `value` as JSON into output slot `index`.
    pub fn output_json<T: Serialize + ?Sized>(&mut self, value: &T, index: usize) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.output_bytes(&bytes, index))
    }

    // ========================================================================
    // Memory
    // ========================================================================

    pub fn alloc(&mut self, size: u64) -> Result<MemoryHandle> {
        self.memory.alloc(size).map_err(Error::memory)
    }

    pub fn free(&mut self, handle: MemoryHandle) {
        self.memory.free(handle);
    }

    /// Length of an allocated block; 0 for unknown handles.
    pub fn memory_length(&self, handle: MemoryHandle) -> u64 {
        self.memory.length(handle)
    }

    pub fn memory_bytes(&self, handle: MemoryHandle) -> Option<&[u8]> {
        self.memory.bytes(handle)
    }

    pub fn memory_bytes_mut(&mut self, handle: MemoryHandle) -> Option<&mut [u8]> {
        self.memory.bytes_mut(handle)
    }

    /// The whole kernel memory.
    pub fn memory(&self) -> &PluginMemory {
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_plugin<R>(
        inputs: &[Val],
        outputs: &mut [Val],
        memory: &mut PluginMemory,
        f: impl FnOnce(&mut CurrentPlugin<'_>) -> R,
    ) -> R {
        let mut plugin = CurrentPlugin::new(memory, "test-plugin", inputs, outputs);
        f(&mut plugin)
    }

    #[test]
    fn test_input_bytes_reads_block() {
        let mut memory = PluginMemory::new(1);
        let handle = memory.alloc_bytes(b"testing").unwrap();
        let inputs = [Val::from(handle)];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            assert_eq!(plugin.input_bytes(0).unwrap(), b"testing");
            assert_eq!(plugin.input_str(0).unwrap(), "testing");
            assert_eq!(plugin.plugin_id(), "test-plugin");
        });
    }

    #[test]
    fn test_input_out_of_range() {
        let mut memory = PluginMemory::new(1);
        let inputs = [Val::I64(0)];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            let err = plugin.input_bytes(1).unwrap_err();
            assert!(matches!(
                err,
                Error::OutOfRange {
                    kind: "input",
                    index: 1,
                    arity: 1
                }
            ));
        });
    }

    #[test]
    fn test_input_type_mismatch() {
        let mut memory = PluginMemory::new(1);
        let inputs = [Val::I32(8)];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            let err = plugin.input_bytes(0).unwrap_err();
            assert!(matches!(
                err,
                Error::TypeMismatch {
                    expected: ValType::I64,
                    actual: ValType::I32
                }
            ));
        });
    }

    #[test]
    fn test_null_and_stale_handles() {
        let mut memory = PluginMemory::new(1);
        let inputs = [Val::I64(0), Val::I64(4096)];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            assert!(plugin.input_bytes(0).unwrap().is_empty());
            assert!(matches!(plugin.input_bytes(1), Err(Error::Memory(_))));
        });
    }

    #[test]
    fn test_input_str_rejects_invalid_utf8() {
        let mut memory = PluginMemory::new(1);
        let handle = memory.alloc_bytes(&[0xff, 0xfe]).unwrap();
        let inputs = [Val::from(handle)];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            assert!(matches!(plugin.input_str(0), Err(Error::Utf8(_))));
        });
    }

    #[test]
    fn test_output_bytes_sets_slot() {
        let mut memory = PluginMemory::new(1);
        let inputs: [Val; 0] = [];
        let mut outputs = [Val::I64(0)];

        let written = with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            plugin.output_str("test", 0)
        });
        assert!(written);

        let handle = outputs[0].handle().unwrap();
        assert_eq!(memory.bytes(handle).unwrap(), b"test");
    }

    #[test]
    fn test_output_out_of_range_is_noop() {
        let mut memory = PluginMemory::new(1);
        let inputs: [Val; 0] = [];
        let mut outputs = [Val::I64(0)];

        let written = with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            assert!(plugin.output_val(1).is_err());
            plugin.output_bytes(b"x", 1)
        });
        assert!(!written);
        assert_eq!(outputs[0], Val::I64(0));
        assert_eq!(memory.stats().live_blocks, 0);
    }

    #[test]
    fn test_output_json() {
        let mut memory = PluginMemory::new(1);
        let inputs: [Val; 0] = [];
        let mut outputs = [Val::I64(0)];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            assert!(plugin.output_json(&serde_json::json!({"count": 4}), 0).unwrap());
        });
        let handle = outputs[0].handle().unwrap();
        assert_eq!(memory.bytes(handle).unwrap(), br#"{"count":4}"#);
    }

    #[test]
    fn test_alloc_and_free() {
        let mut memory = PluginMemory::new(1);
        let inputs: [Val; 0] = [];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            let handle = plugin.alloc(16).unwrap();
            assert_eq!(plugin.memory_length(handle), 16);
            plugin.memory_bytes_mut(handle).unwrap()[0] = 7;
            assert_eq!(plugin.memory_bytes(handle).unwrap()[0], 7);
            plugin.free(handle);
            assert_eq!(plugin.memory_length(handle), 0);
            assert_eq!(plugin.memory().stats().live_blocks, 0);
        });
    }

    #[test]
    fn test_huge_alloc_is_memory_error() {
        let mut memory = PluginMemory::new(1);
        let inputs: [Val; 0] = [];
        let mut outputs: [Val; 0] = [];

        with_plugin(&inputs, &mut outputs, &mut memory, |plugin| {
            let err = plugin.alloc(u64::MAX).unwrap_err();
            assert!(matches!(err, Error::Memory(msg) if msg.contains("allocation failed")));
            assert!(plugin.alloc(8).is_ok());
        });
    }
}
