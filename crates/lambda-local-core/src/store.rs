//! Per-invocation state and store management.
//!
//! This module provides:
//! - [`InvocationState`]: Per-invocation state accessible from host functions
//! - [`InvocationSpec`]: What a store is created for (request, limits, environment)
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Performance metrics for each execution

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use lambda_local_common::context::remaining_millis;
use lambda_local_common::{ExecutionConfig, RuntimeError};

/// What a store is being created for.
#[derive(Debug, Clone, Default)]
pub struct InvocationSpec {
    /// Request identifier, for tracing.
    pub request_id: String,
    /// Linear memory cap in megabytes. `None` leaves memory unlimited.
    pub memory_limit_mb: Option<u32>,
    /// Environment variables exposed through WASI.
    pub environment: BTreeMap<String, String>,
    /// Absolute deadline in epoch milliseconds. Zero means none.
    pub deadline_ms: i64,
}

impl InvocationSpec {
    /// A spec with only a request id.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// Per-invocation state.
///
/// Created for each handler call and dropped when the call completes. Host
/// functions reach it through [`wasmtime::Caller::data_mut`].
pub struct InvocationState {
    wasi: WasiP1Ctx,

    limits: StoreLimits,

    stdout: MemoryOutputPipe,

    /// Unique request identifier for tracing.
    pub request_id: String,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Error message reported by the guest through `env.fail`.
    pub reported_error: Option<String>,

    /// Absolute deadline in epoch milliseconds.
    pub deadline_ms: i64,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    start_time: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution. Zero when metering is off.
    pub fuel_consumed: u64,

    /// Linear memory size in bytes at the end of the call.
    pub memory_used_bytes: usize,

    /// Total execution duration.
    pub duration: Option<Duration>,
}

impl InvocationState {
    /// Create state with default limits for the given request.
    pub fn new(request_id: String) -> Self {
        Self::from_spec(InvocationSpec::new(request_id), &ExecutionConfig::default())
    }

    /// Create state for an invocation.
    pub fn from_spec(spec: InvocationSpec, config: &ExecutionConfig) -> Self {
        let stdout = MemoryOutputPipe::new(config.stdout_capacity_bytes);

        let env: Vec<(&String, &String)> = spec.environment.iter().collect();
        let wasi = WasiCtxBuilder::new()
            .envs(&env)
            .stdout(stdout.clone())
            .inherit_stderr()
            .build_p1();

        let mut limits = StoreLimitsBuilder::new();
        if let Some(mb) = spec.memory_limit_mb {
            limits = limits.memory_size((mb as usize) * 1024 * 1024);
        }

        Self {
            wasi,
            limits: limits.build(),
            stdout,
            request_id: spec.request_id,
            logs: Vec::new(),
            reported_error: None,
            deadline_ms: spec.deadline_ms,
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Record an error reported by the guest. The first report wins.
    pub fn report_error(&mut self, message: String) {
        self.reported_error.get_or_insert(message);
    }

    /// Milliseconds left until the deadline, never negative.
    pub fn remaining_time_ms(&self) -> i64 {
        remaining_millis(self.deadline_ms)
    }

    /// Everything the guest wrote to stdout so far.
    pub fn stdout_contents(&self) -> String {
        String::from_utf8_lossy(&self.stdout.contents()).into_owned()
    }

    /// WASI context, for linker registration.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

/// Create a new Wasmtime store for one invocation.
///
/// Fuel is always consumed by the engine; without metering the store gets an
/// effectively unlimited amount. With epoch interruption, guest code yields to
/// the executor at every epoch tick instead of trapping.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    spec: InvocationSpec,
) -> Result<Store<InvocationState>, RuntimeError> {
    let state = InvocationState::from_spec(spec, config);
    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);

    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if engine.config().epoch_interruption {
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<InvocationState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<InvocationState>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
