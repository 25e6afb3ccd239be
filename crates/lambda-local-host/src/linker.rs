//! Host function registration for Wasmtime linkers.
//!
//! This module registers the `env` imports and WASI preview1 on a linker so
//! handler modules can call into the host runtime.

use std::sync::Arc;

use lambda_local_common::{HostFunctionError, RuntimeError};
use lambda_local_core::instance::{MEMORY_EXPORT, guest_slice};
use lambda_local_core::store::InvocationState;
use lambda_local_core::{InstanceRunner, WasmEngine};
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::context::ContextHost;
use crate::logging::{LoggingHost, level_from_i32};

/// Create an [`InstanceRunner`] with every host function registered.
pub fn create_instance_runner(engine: &WasmEngine) -> Result<InstanceRunner, RuntimeError> {
    let mut runner = InstanceRunner::new(Arc::new(engine.inner().clone()));
    register_all(runner.linker_mut())?;
    Ok(runner)
}

/// Register all standard host functions on a core module linker.
///
/// This registers:
/// - `env::log` - Logging function for guest code
/// - `env::fail` - Handler error reporting
/// - `env::remaining_time_ms` - Time left before the invocation deadline
/// - WASI preview1
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<InvocationState>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_context(linker)?;
    register_wasi(linker)?;
    Ok(())
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)`.
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
pub fn register_logging(linker: &mut Linker<InvocationState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, InvocationState>, level: i32, ptr: i32, len: i32| {
                let message = match read_guest_string(&mut caller, ptr, len) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring env.log call");
                        return;
                    }
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register `env::fail(ptr: i32, len: i32)` and `env::remaining_time_ms() -> i64`.
pub fn register_context(linker: &mut Linker<InvocationState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "fail",
            |mut caller: Caller<'_, InvocationState>, ptr: i32, len: i32| {
                let message = read_guest_string(&mut caller, ptr, len).unwrap_or_else(|e| {
                    warn!(error = %e, "env.fail called with an unreadable message");
                    format!("handler failed ({e})")
                });

                ContextHost::fail(caller.data_mut(), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register fail function: {e}"))
        })?;

    linker
        .func_wrap(
            "env",
            "remaining_time_ms",
            |caller: Caller<'_, InvocationState>| -> i64 {
                ContextHost::remaining_time_ms(caller.data())
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Failed to register remaining_time_ms function: {e}"
            ))
        })?;

    Ok(())
}

/// Link WASI preview1 against the invocation's WASI context.
pub fn register_wasi(linker: &mut Linker<InvocationState>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, InvocationState::wasi_mut).map_err(
        |e| RuntimeError::invalid_config(format!("Failed to link WASI preview1: {e}")),
    )
}

/// Copy a UTF-8 string out of guest memory.
fn read_guest_string(
    caller: &mut Caller<'_, InvocationState>,
    ptr: i32,
    len: i32,
) -> Result<String, HostFunctionError> {
    let memory = caller
        .get_export(MEMORY_EXPORT)
        .and_then(wasmtime::Extern::into_memory)
        .ok_or(HostFunctionError::MissingMemory)?;

    let bytes = guest_slice(memory.data(&*caller), i64::from(ptr), i64::from(len))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
