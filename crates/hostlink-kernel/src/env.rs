//! Kernel imports available to every guest
//!
//! All functions live in the [`ENV_MODULE`] namespace. Memory handles and
//! lengths are `i64`, single bytes travel as `i32`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use wasmtime::{Caller, Linker};

use crate::error::KernelError;
use crate::instance::InstanceState;
use crate::manifest::host_allowed;
use crate::types::MemoryHandle;

/// Import namespace of the kernel functions.
pub const ENV_MODULE: &str = "hostlink:host/env";

/// Guest log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn import_name(self) -> &'static str {
        match self {
            LogLevel::Debug => "log_debug",
            LogLevel::Info => "log_info",
            LogLevel::Warn => "log_warn",
            LogLevel::Error => "log_error",
        }
    }
}

fn trap(err: KernelError) -> wasmtime::Error {
    wasmtime::Error::msg(err.to_string())
}

fn handle(offset: i64) -> MemoryHandle {
    MemoryHandle(offset as u64)
}

fn block(state: &InstanceState, offset: i64) -> wasmtime::Result<&[u8]> {
    state.memory.bytes(handle(offset)).ok_or_else(|| {
        trap(KernelError::MemoryOutOfBounds {
            offset: offset as u64,
            size: 0,
        })
    })
}

fn block_string(state: &InstanceState, offset: i64) -> wasmtime::Result<String> {
    Ok(String::from_utf8_lossy(block(state, offset)?).into_owned())
}

fn guest_log(level: LogLevel, plugin_id: &str, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "hostlink::guest", plugin_id, "{}", message),
        LogLevel::Info => tracing::info!(target: "hostlink::guest", plugin_id, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "hostlink::guest", plugin_id, "{}", message),
        LogLevel::Error => tracing::error!(target: "hostlink::guest", plugin_id, "{}", message),
    }
}

/// Register every kernel import on `linker`.
pub(crate) fn add_to_linker(linker: &mut Linker<InstanceState>) -> wasmtime::Result<()> {
    // =========================================================================
    // Input
    // =========================================================================

    linker.func_wrap(
        ENV_MODULE,
        "input_length",
        |caller: Caller<'_, InstanceState>| -> i64 { caller.data().input.len() as i64 },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "input_load_u8",
        |caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<i32> {
            caller
                .data()
                .input
                .get(offset as usize)
                .map(|b| i32::from(*b))
                .ok_or_else(|| {
                    trap(KernelError::MemoryOutOfBounds {
                        offset: offset as u64,
                        size: 1,
                    })
                })
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "input_load_u64",
        |caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<i64> {
            let start = offset as usize;
            let bytes = caller
                .data()
                .input
                .get(start..start.saturating_add(8))
                .ok_or_else(|| {
                    trap(KernelError::MemoryOutOfBounds {
                        offset: offset as u64,
                        size: 8,
                    })
                })?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(i64::from_le_bytes(buf))
        },
    )?;

    // =========================================================================
    // Kernel memory
    // =========================================================================

    linker.func_wrap(
        ENV_MODULE,
        "alloc",
        |mut caller: Caller<'_, InstanceState>, len: i64| -> wasmtime::Result<i64> {
            let len = u64::try_from(len)
                .map_err(|_| trap(KernelError::AllocationFailed(len as u64)))?;
            let handle = caller.data_mut().memory.alloc(len).map_err(trap)?;
            Ok(handle.0 as i64)
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "free",
        |mut caller: Caller<'_, InstanceState>, offset: i64| {
            caller.data_mut().memory.free(handle(offset));
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "length",
        |caller: Caller<'_, InstanceState>, offset: i64| -> i64 {
            caller.data().memory.length(handle(offset)) as i64
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "load_u8",
        |caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<i32> {
            let byte = caller.data().memory.load_u8(offset as u64).map_err(trap)?;
            Ok(i32::from(byte))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "store_u8",
        |mut caller: Caller<'_, InstanceState>, offset: i64, value: i32| -> wasmtime::Result<()> {
            caller
                .data_mut()
                .memory
                .store_u8(offset as u64, value as u8)
                .map_err(trap)
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "load_u64",
        |caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<i64> {
            let value = caller.data().memory.load_u64(offset as u64).map_err(trap)?;
            Ok(value as i64)
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "store_u64",
        |mut caller: Caller<'_, InstanceState>, offset: i64, value: i64| -> wasmtime::Result<()> {
            caller
                .data_mut()
                .memory
                .store_u64(offset as u64, value as u64)
                .map_err(trap)
        },
    )?;

    // =========================================================================
    // Output and errors
    // =========================================================================

    linker.func_wrap(
        ENV_MODULE,
        "output_set",
        |mut caller: Caller<'_, InstanceState>, offset: i64, len: i64| -> wasmtime::Result<()> {
            let state = caller.data_mut();
            state.memory.read(offset as u64, len as u64).map_err(trap)?;
            state.output = Some((offset as u64, len as u64));
            Ok(())
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "error_set",
        |mut caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<()> {
            let message = block_string(caller.data(), offset)?;
            debug!(plugin_id = %caller.data().id, error = %message, "Guest set error");
            caller.data_mut().error = Some(message);
            Ok(())
        },
    )?;

    // =========================================================================
    // Config and variables
    // =========================================================================

    linker.func_wrap(
        ENV_MODULE,
        "config_get",
        |mut caller: Caller<'_, InstanceState>, key: i64| -> wasmtime::Result<i64> {
            let key = block_string(caller.data(), key)?;
            let state = caller.data_mut();
            match state.config.get(&key).cloned() {
                Some(value) => {
                    let handle = state.memory.alloc_bytes(value.as_bytes()).map_err(trap)?;
                    Ok(handle.0 as i64)
                }
                None => Ok(0),
            }
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "var_get",
        |mut caller: Caller<'_, InstanceState>, key: i64| -> wasmtime::Result<i64> {
            let key = block_string(caller.data(), key)?;
            let state = caller.data_mut();
            match state.vars.get(&key).cloned() {
                Some(value) => {
                    let handle = state.memory.alloc_bytes(&value).map_err(trap)?;
                    Ok(handle.0 as i64)
                }
                None => Ok(0),
            }
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "var_set",
        |mut caller: Caller<'_, InstanceState>, key: i64, value: i64| -> wasmtime::Result<()> {
            let key = block_string(caller.data(), key)?;
            if value == 0 {
                caller.data_mut().vars.remove(&key);
                return Ok(());
            }

            let value = block(caller.data(), value)?.to_vec();
            let state = caller.data_mut();
            if let Some(max) = state.limits.max_var_bytes {
                let current = state.vars_size()
                    - state
                        .vars
                        .get(&key)
                        .map(|v| (key.len() + v.len()) as u64)
                        .unwrap_or(0);
                if current + (key.len() + value.len()) as u64 > max {
                    return Err(trap(KernelError::Call(format!(
                        "variable store exceeds {max} bytes"
                    ))));
                }
            }
            state.vars.insert(key, value);
            Ok(())
        },
    )?;

    // =========================================================================
    // Logging
    // =========================================================================

    for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
        linker.func_wrap(
            ENV_MODULE,
            level.import_name(),
            move |caller: Caller<'_, InstanceState>, offset: i64| -> wasmtime::Result<()> {
                let message = block_string(caller.data(), offset)?;
                guest_log(level, &caller.data().id, &message);
                Ok(())
            },
        )?;
    }

    // =========================================================================
    // HTTP
    // =========================================================================

    linker.func_wrap(
        ENV_MODULE,
        "http_request",
        |mut caller: Caller<'_, InstanceState>, request: i64, body: i64| -> wasmtime::Result<i64> {
            let state = caller.data_mut();
            match http_request(state, request, body) {
                Ok(handle) => Ok(handle),
                Err(e) => {
                    state.host_error = Some(e.to_string());
                    Err(trap(e))
                }
            }
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "http_status_code",
        |caller: Caller<'_, InstanceState>| -> i32 { i32::from(caller.data().http_status) },
    )?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct HttpRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Upper bound for a guest HTTP request when no call deadline is armed.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Request timeout: the time left on the call, capped at [`HTTP_TIMEOUT`].
fn http_timeout(remaining: Option<Duration>) -> Duration {
    remaining
        .map_or(HTTP_TIMEOUT, |left| left.min(HTTP_TIMEOUT))
        .max(Duration::from_millis(1))
}

fn http_request(state: &mut InstanceState, request: i64, body: i64) -> Result<i64, KernelError> {
    let raw = state
        .memory
        .bytes(handle(request))
        .ok_or(KernelError::MemoryOutOfBounds {
            offset: request as u64,
            size: 0,
        })?;
    let request: HttpRequest = serde_json::from_slice(raw)
        .map_err(|e| KernelError::Http(format!("invalid request: {e}")))?;

    let url = url::Url::parse(&request.url)
        .map_err(|e| KernelError::Http(format!("invalid url {}: {e}", request.url)))?;
    let host = url.host_str().unwrap_or_default().to_string();
    if !host_allowed(state.allowed_hosts.as_deref(), &host) {
        return Err(KernelError::Http(format!(
            "HTTP request to {host} is not allowed"
        )));
    }

    let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
        .map_err(|e| KernelError::Http(format!("invalid method {}: {e}", request.method)))?;
    let payload = if body == 0 {
        None
    } else {
        state.memory.bytes(handle(body)).map(<[u8]>::to_vec)
    };

    let timeout = http_timeout(state.remaining());
    debug!(plugin_id = %state.id, %url, method = %method, ?timeout, "Guest HTTP request");
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| KernelError::Http(e.to_string()))?;
    let mut builder = client.request(method, url);
    for (key, value) in &request.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    if let Some(payload) = payload {
        builder = builder.body(payload);
    }

    let response = builder
        .send()
        .map_err(|e| KernelError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .map_err(|e| KernelError::Http(e.to_string()))?;

    if let Some(max) = state.limits.max_http_response_bytes {
        if bytes.len() as u64 > max {
            return Err(KernelError::Http(format!(
                "response body of {} bytes exceeds limit of {max}",
                bytes.len()
            )));
        }
    }

    state.http_status = status;
    let handle = state.memory.alloc_bytes(&bytes)?;
    Ok(handle.0 as i64)
}
