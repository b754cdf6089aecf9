//! Value and handle types shared between the host and the guest.

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset of a block inside an instance's kernel memory.
///
/// Handles are only meaningful for the instance that produced them and are
/// invalidated by a reset. [`MemoryHandle::NULL`] is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemoryHandle(pub u64);

impl MemoryHandle {
    pub const NULL: MemoryHandle = MemoryHandle(0);

    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for MemoryHandle {
    fn from(v: u64) -> Self {
        MemoryHandle(v)
    }
}

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// WASM value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

/// Kind used for memory handles crossing the boundary.
pub const PTR: ValType = ValType::I64;

impl ValType {
    /// Whether a host function may use this kind in its signature.
    pub fn is_supported(self) -> bool {
        matches!(self, ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64)
    }

    pub(crate) fn to_wasmtime(self) -> KernelResult<wasmtime::ValType> {
        match self {
            ValType::I32 => Ok(wasmtime::ValType::I32),
            ValType::I64 => Ok(wasmtime::ValType::I64),
            ValType::F32 => Ok(wasmtime::ValType::F32),
            ValType::F64 => Ok(wasmtime::ValType::F64),
            other => Err(KernelError::UnsupportedValType(other)),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::FuncRef => write!(f, "funcref"),
            ValType::ExternRef => write!(f, "externref"),
        }
    }
}

/// A scalar value passed to or returned from a host function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Zero value of a kind, used to pre-fill output slots.
    pub fn default_for(ty: ValType) -> KernelResult<Val> {
        match ty {
            ValType::I32 => Ok(Val::I32(0)),
            ValType::I64 => Ok(Val::I64(0)),
            ValType::F32 => Ok(Val::F32(0.0)),
            ValType::F64 => Ok(Val::F64(0.0)),
            other => Err(KernelError::UnsupportedValType(other)),
        }
    }

    pub fn i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn i64(&self) -> Option<i64> {
        match self {
            Val::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn f32(&self) -> Option<f32> {
        match self {
            Val::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn f64(&self) -> Option<f64> {
        match self {
            Val::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads an `I64` slot as a memory handle.
    pub fn handle(&self) -> Option<MemoryHandle> {
        self.i64().map(|v| MemoryHandle(v as u64))
    }

    pub(crate) fn from_wasmtime(val: &wasmtime::Val) -> KernelResult<Val> {
        match val {
            wasmtime::Val::I32(v) => Ok(Val::I32(*v)),
            wasmtime::Val::I64(v) => Ok(Val::I64(*v)),
            wasmtime::Val::F32(bits) => Ok(Val::F32(f32::from_bits(*bits))),
            wasmtime::Val::F64(bits) => Ok(Val::F64(f64::from_bits(*bits))),
            _ => Err(KernelError::Internal(
                "reference and vector values cannot cross the host boundary".into(),
            )),
        }
    }

    pub(crate) fn to_wasmtime(self) -> wasmtime::Val {
        match self {
            Val::I32(v) => wasmtime::Val::I32(v),
            Val::I64(v) => wasmtime::Val::I64(v),
            Val::F32(v) => wasmtime::Val::F32(v.to_bits()),
            Val::F64(v) => wasmtime::Val::F64(v.to_bits()),
        }
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::I32(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::I64(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::F32(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::F64(v)
    }
}

impl From<MemoryHandle> for Val {
    fn from(h: MemoryHandle) -> Self {
        Val::I64(h.0 as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_kinds_are_rejected() {
        assert!(ValType::I64.is_supported());
        assert!(!ValType::V128.is_supported());
        assert!(matches!(
            ValType::FuncRef.to_wasmtime(),
            Err(KernelError::UnsupportedValType(ValType::FuncRef))
        ));
        assert!(Val::default_for(ValType::ExternRef).is_err());
    }

    #[test]
    fn float_bits_survive_conversion() {
        let v = Val::F64(-2.5);
        let back = Val::from_wasmtime(&v.to_wasmtime()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn handle_from_i64_slot() {
        let v = Val::from(MemoryHandle(64));
        assert_eq!(v.ty(), PTR);
        assert_eq!(v.handle(), Some(MemoryHandle(64)));
        assert_eq!(Val::I32(3).handle(), None);
        assert_eq!(MemoryHandle(255).to_string(), "0x000000ff");
    }
}
