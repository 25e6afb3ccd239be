//! Configuration structures for lambda-local.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs)
//! - [`ExecutionConfig`]: Per-invocation execution limits for Wasm handlers
//! - [`IsolationConfig`]: Which execution strategy native handlers use
//! - [`CacheConfig`]: Hot-reload cache invalidation

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options consumed by the
/// Handler Runners. It can be loaded from TOML files and overridden through
/// environment variables (see [`ConfigFile`](crate::ConfigFile)).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-invocation execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Isolation strategy selection.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Cache invalidation for hot reload.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl RuntimeConfig {
    /// Validate settings that can only be checked after parsing.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.cache.keep_regex()?;

        if self.engine.epoch_tick_ms == 0 {
            return Err(RuntimeError::invalid_config("epoch_tick_ms must be positive"));
        }

        parse_version(&self.isolation.thread_min_host_version).ok_or_else(|| {
            RuntimeError::invalid_config(format!(
                "thread_min_host_version '{}' is not a 'major.minor.patch' version",
                self.isolation.thread_min_host_version
            ))
        })?;

        Ok(())
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior shared by every
/// in-process and isolated-thread handler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// Off by default: a local emulator instantiates few modules and the pool
    /// reserves address space up front.
    #[serde(default)]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// Guest code yields to the async executor at every epoch tick, which lets
    /// an invocation timeout stop a spinning handler.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Epoch tick interval in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: false,
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

/// Per-invocation execution configuration for Wasm handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Enable fuel metering.
    ///
    /// The emulated platform bills by time, not instructions, so this is off
    /// by default.
    #[serde(default)]
    pub fuel_metering: bool,

    /// Maximum fuel (CPU instructions) per invocation.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Bytes of guest stdout kept per invocation.
    #[serde(default = "defaults::stdout_capacity_bytes")]
    pub stdout_capacity_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fuel_metering: false,
            max_fuel: defaults::max_fuel(),
            stdout_capacity_bytes: defaults::stdout_capacity_bytes(),
        }
    }
}

/// Isolation strategy selection for native handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IsolationConfig {
    /// Run each native function in its own long-lived child process.
    #[serde(default)]
    pub use_isolated_processes: bool,

    /// Run each native function in its own long-lived worker thread.
    #[serde(default)]
    pub use_isolated_threads: bool,

    /// Program spawned for isolated processes. Defaults to the current executable.
    #[serde(default)]
    pub worker_program: Option<String>,

    /// Arguments passed before `--bootstrap <json>`.
    #[serde(default = "defaults::worker_args")]
    pub worker_args: Vec<String>,

    /// Minimum host version required for worker threads.
    #[serde(default = "defaults::thread_min_host_version")]
    pub thread_min_host_version: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            use_isolated_processes: false,
            use_isolated_threads: false,
            worker_program: None,
            worker_args: defaults::worker_args(),
            thread_min_host_version: defaults::thread_min_host_version(),
        }
    }
}

/// Cache invalidation for hot reload of in-process handlers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Keep cached modules between invocations.
    #[serde(default)]
    pub skip_cache_invalidation: bool,

    /// Modules whose resolved path matches this pattern survive invalidation.
    #[serde(default = "defaults::cache_keep_pattern")]
    pub cache_keep_pattern: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            skip_cache_invalidation: false,
            cache_keep_pattern: defaults::cache_keep_pattern(),
        }
    }
}

impl CacheConfig {
    /// Compile the keep pattern.
    pub fn keep_regex(&self) -> Result<Regex, RuntimeError> {
        Regex::new(&self.cache_keep_pattern).map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Invalid cache_keep_pattern '{}': {e}",
                self.cache_keep_pattern
            ))
        })
    }
}

/// Parse a `major.minor.patch` version. Missing components count as zero and
/// pre-release suffixes (`1.2.3-beta`) are ignored.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut parts = core.split('.');

    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;

    if parts.next().is_some() {
        return None;
    }

    Some((major, minor, patch))
}

/// Default value functions for serde.
mod defaults {
    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn instance_memory_mb() -> u32 {
        1024
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        5
    }

    pub const fn max_fuel() -> u64 {
        10_000_000_000
    }

    pub const fn stdout_capacity_bytes() -> usize {
        1024 * 1024
    }

    pub fn worker_args() -> Vec<String> {
        vec!["worker".to_string()]
    }

    pub fn thread_min_host_version() -> String {
        "0.1.0".to_string()
    }

    pub fn cache_keep_pattern() -> String {
        "vendor".to_string()
    }
}
