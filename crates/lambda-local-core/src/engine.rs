//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every native Handler Runner of a process.
//! It is:
//! - Thread-safe and free of per-invocation state
//! - Set up with fuel metering and epoch interruption for resource limiting
//! - Optionally configured with the pooling allocator

use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use lambda_local_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: guest code runs as a future, so a timeout can drop it
/// - **Fuel Metering**: optional deterministic CPU limiting
/// - **Epoch Interruption**: a background ticker bumps the epoch and guest code
///   yields to the executor at every tick
/// - **Pooling Allocator**: optional, pre-allocates instance slots
///
/// # Example
///
/// ```ignore
/// use lambda_local_common::EngineConfig;
/// use lambda_local_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// When epoch interruption is enabled, a ticker thread is started. It
    /// stops on its own once every clone of the engine has been dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be spawned
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);

        // Always on; stores get unlimited fuel unless metering is requested.
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let engine = Arc::new(engine);

        if config.epoch_interruption {
            Self::spawn_epoch_ticker(Arc::downgrade(&engine), config)?;
        }

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine,
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    fn spawn_epoch_ticker(engine: Weak<Engine>, config: &EngineConfig) -> Result<(), RuntimeError> {
        let tick = config.epoch_tick();

        thread::Builder::new()
            .name("wasm-epoch-ticker".into())
            .spawn(move || {
                loop {
                    thread::sleep(tick);
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    engine.increment_epoch();
                }
                debug!("Epoch ticker stopped");
            })
            .map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to start epoch ticker: {e}"))
            })?;

        debug!(tick_ms = config.epoch_tick_ms, "Epoch ticker started");
        Ok(())
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter by hand.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("epoch_tick_ms", &self.config.epoch_tick_ms)
            .finish_non_exhaustive()
    }
}
