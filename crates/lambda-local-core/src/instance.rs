//! Handler invocation over the lambda-local Wasm ABI.
//!
//! A handler module exports `memory`, `alloc(size) -> ptr` and the handler
//! symbol with signature `(event_ptr, event_len, ctx_ptr, ctx_len) -> i64`.
//! The result packs `(out_ptr << 32) | out_len` of a UTF-8 JSON document; a
//! zero length means `null`.
//!
//! [`InstanceRunner::invoke`] drives one call:
//!
//! 1. Instantiate the module with a fresh store
//! 2. Copy the event and context into guest memory through `alloc`
//! 3. Call the handler export
//! 4. Read back the output, the reported error and the metrics

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use wasmtime::{Engine, Instance, Linker, Memory, Store, Trap};

use crate::CompiledModule;
use crate::store::{InvocationState, calculate_fuel_consumed, get_remaining_fuel};
use lambda_local_common::{HostFunctionError, RuntimeError};

/// Export holding the guest's linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Export used to reserve guest buffers.
pub const ALLOC_EXPORT: &str = "alloc";

/// Result of executing a handler.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The handler returned. `output` holds its JSON bytes, empty for `null`.
    Success {
        /// Raw output bytes.
        output: Vec<u8>,
    },

    /// The handler reported an error through `env.fail`.
    Failed {
        /// Reported message.
        message: String,
    },

    /// Execution trapped.
    Trap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },
}

impl ExecutionResult {
    /// Returns `true` if execution was successful.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// Returns `true` if execution trapped.
    pub fn is_trap(&self) -> bool {
        matches!(self, ExecutionResult::Trap { .. })
    }
}

/// Instance lifecycle manager.
///
/// # Thread Safety
///
/// `InstanceRunner` is thread-safe and can be shared across tasks. Each call
/// uses its own [`Store`].
pub struct InstanceRunner {
    linker: Linker<InvocationState>,
}

impl InstanceRunner {
    /// Create a new instance runner with an empty linker.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            linker: Linker::new(&engine),
        }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<InvocationState> {
        &mut self.linker
    }

    /// Invoke `export` with the given event and context JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a load error if the module cannot be instantiated or lacks one
    /// of the required exports, and [`RuntimeError::FuelExhausted`] when the
    /// fuel limit is hit. Traps in handler code are reported as
    /// [`ExecutionResult::Trap`].
    #[instrument(skip(self, module, store, event, context), fields(export = %export))]
    pub async fn invoke(
        &self,
        module: &CompiledModule,
        store: &mut Store<InvocationState>,
        export: &str,
        event: &[u8],
        context: &[u8],
    ) -> Result<ExecutionResult, RuntimeError> {
        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(store).unwrap_or(0);

        debug!("Instantiating handler module");

        let instance = self
            .linker
            .instantiate_async(&mut *store, module.as_module())
            .await
            .map_err(|e| RuntimeError::compilation_failed(format!("Instantiation failed: {e}")))?;

        let result = self.call_handler(&instance, store, export, event, context).await;

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, store);
        if let Some(memory) = instance.get_memory(&mut *store, MEMORY_EXPORT) {
            store.data_mut().metrics.memory_used_bytes = memory.data_size(&*store);
        }
        store.data_mut().metrics.fuel_consumed = fuel_consumed;
        store.data_mut().finalize_metrics();
        log_guest_stdout(store.data());

        let duration = start.elapsed();

        let output = match result {
            Ok(output) => output,
            Err(CallError::Runtime(err)) => return Err(err),
            Err(CallError::Trap(trap)) => {
                if let Some(message) = store.data_mut().reported_error.take() {
                    return Ok(ExecutionResult::Failed { message });
                }

                if is_out_of_fuel(&trap) {
                    warn!(
                        duration_ms = duration.as_millis(),
                        "Execution terminated: fuel exhausted"
                    );
                    return Err(RuntimeError::FuelExhausted);
                }

                let (message, code) = extract_trap_info(&trap);
                warn!(
                    duration_ms = duration.as_millis(),
                    trap_message = %message,
                    "Execution trapped"
                );
                return Ok(ExecutionResult::Trap { message, code });
            }
        };

        if let Some(message) = store.data_mut().reported_error.take() {
            info!(duration_ms = duration.as_millis(), "Handler reported an error");
            return Ok(ExecutionResult::Failed { message });
        }

        info!(
            duration_ms = duration.as_millis(),
            output_bytes = output.len(),
            "Execution completed successfully"
        );
        Ok(ExecutionResult::Success { output })
    }

    async fn call_handler(
        &self,
        instance: &Instance,
        store: &mut Store<InvocationState>,
        export: &str,
        event: &[u8],
        context: &[u8],
    ) -> Result<Vec<u8>, CallError> {
        let memory = instance
            .get_memory(&mut *store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::export_not_found(MEMORY_EXPORT))?;

        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, ALLOC_EXPORT)
            .map_err(|_| RuntimeError::export_not_found(ALLOC_EXPORT))?;

        let handler = instance
            .get_typed_func::<(i32, i32, i32, i32), i64>(&mut *store, export)
            .map_err(|_| RuntimeError::export_not_found(export))?;

        let (event_ptr, event_len) = write_guest(store, &memory, &alloc, event).await?;
        let (ctx_ptr, ctx_len) = write_guest(store, &memory, &alloc, context).await?;

        debug!("Calling handler export");

        let packed = handler
            .call_async(&mut *store, (event_ptr, event_len, ctx_ptr, ctx_len))
            .await
            .map_err(CallError::Trap)?;

        let (out_ptr, out_len) = unpack_output(packed);
        let bytes = guest_slice(memory.data(&*store), i64::from(out_ptr), i64::from(out_len))
            .map_err(RuntimeError::from)?;

        Ok(bytes.to_vec())
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner").finish_non_exhaustive()
    }
}

enum CallError {
    Runtime(RuntimeError),
    Trap(wasmtime::Error),
}

impl From<RuntimeError> for CallError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(err)
    }
}

async fn write_guest(
    store: &mut Store<InvocationState>,
    memory: &Memory,
    alloc: &wasmtime::TypedFunc<i32, i32>,
    bytes: &[u8],
) -> Result<(i32, i32), CallError> {
    let len = i32::try_from(bytes.len()).map_err(|_| {
        RuntimeError::from(HostFunctionError::InvalidArgument {
            reason: format!("payload of {} bytes does not fit guest memory", bytes.len()),
        })
    })?;

    let ptr = alloc
        .call_async(&mut *store, len)
        .await
        .map_err(CallError::Trap)?;

    #[allow(clippy::cast_sign_loss)]
    let offset = ptr as u32 as usize;
    memory
        .write(&mut *store, offset, bytes)
        .map_err(|_| {
            RuntimeError::from(HostFunctionError::OutOfBounds {
                ptr: i64::from(ptr),
                len: i64::from(len),
            })
        })?;

    Ok((ptr, len))
}

/// Split a packed handler result into pointer and length.
pub fn unpack_output(packed: i64) -> (u32, u32) {
    #[allow(clippy::cast_sign_loss)]
    let packed = packed as u64;
    #[allow(clippy::cast_possible_truncation)]
    let (ptr, len) = ((packed >> 32) as u32, packed as u32);
    (ptr, len)
}

/// Bounds-checked view of `len` bytes at `ptr` in guest memory.
///
/// # Errors
///
/// Returns [`HostFunctionError::OutOfBounds`] for negative values or a range
/// outside of `data`.
pub fn guest_slice(data: &[u8], ptr: i64, len: i64) -> Result<&[u8], HostFunctionError> {
    let out_of_bounds = || HostFunctionError::OutOfBounds { ptr, len };

    let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
    let len_usize = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len_usize).ok_or_else(out_of_bounds)?;

    data.get(start..end).ok_or_else(out_of_bounds)
}

fn log_guest_stdout(state: &InvocationState) {
    let stdout = state.stdout_contents();
    for line in stdout.lines().filter(|line| !line.is_empty()) {
        info!(request_id = %state.request_id, guest_stdout = true, "{}", line);
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = error.to_string();
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_variants() {
        let result = ExecutionResult::Success { output: Vec::new() };
        assert!(result.is_success());
        assert!(!result.is_trap());

        let result = ExecutionResult::Trap {
            message: "unreachable".into(),
            code: Some("UnreachableCodeReached".into()),
        };
        assert!(!result.is_success());
        assert!(result.is_trap());

        let result = ExecutionResult::Failed {
            message: "boom".into(),
        };
        assert!(!result.is_success());
        assert!(!result.is_trap());
    }

    #[test]
    fn test_unpack_output() {
        assert_eq!(unpack_output(0), (0, 0));
        assert_eq!(unpack_output((1024_i64 << 32) | 17), (1024, 17));

        // A pointer above 2 GiB sets the sign bit of the packed value.
        let packed = ((0x8000_0000_u64 << 32) | 3) as i64;
        assert_eq!(unpack_output(packed), (0x8000_0000, 3));
    }

    #[test]
    fn test_guest_slice_bounds() {
        let data = b"hello world";

        assert_eq!(guest_slice(data, 6, 5).unwrap(), b"world");
        assert_eq!(guest_slice(data, 11, 0).unwrap(), b"");
        assert!(guest_slice(data, 7, 5).is_err());
        assert!(guest_slice(data, -1, 2).is_err());
        assert!(guest_slice(data, 0, -2).is_err());
        assert!(guest_slice(data, i64::MAX, 1).is_err());
    }
}
