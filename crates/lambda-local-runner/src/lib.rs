//! Handler execution for lambda-local.
//!
//! This crate turns function definitions into running handlers. It provides:
//!
//! - [`FunctionRegistry`]: one [`HandlerRunner`] per registered function
//! - [`HandlerRunner`]: lazy, memoized selection of an execution strategy
//! - [`strategy`]: in-process, isolated process, isolated thread and
//!   cross-language subprocess execution
//! - [`loader`]: the per-runner module loader and its cache invalidation
//! - [`worker`]: the loop run by isolated worker processes
//!
//! # Quick Start
//!
//! ```ignore
//! use lambda_local_common::{FunctionDefinition, RuntimeConfig};
//! use lambda_local_runner::FunctionRegistry;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = FunctionRegistry::new(RuntimeConfig::default())?;
//!     let hello = registry.register(FunctionDefinition::new(
//!         "hello",
//!         "handlers/hello.handler",
//!         "wasm32-wasip1",
//!     ))?;
//!
//!     let outcome = registry.invoke(&hello, json!({"name": "world"})).await;
//!     println!("{outcome:?}");
//!
//!     registry.cleanup_all().await;
//!     Ok(())
//! }
//! ```

pub mod host_env;
pub mod loader;
pub mod registry;
pub mod runner;
pub mod strategy;
pub mod worker;

pub use host_env::HostEnvironment;
pub use loader::{Handler, LoadFailure, LoaderFactory, ModuleLoader, WasmModuleLoader};
pub use registry::{FunctionRegistry, RegistryError, RunnerHandle};
pub use runner::{HandlerRunner, StrategyPlan, select_strategy};
pub use strategy::{ExecutionStrategy, StrategyKind};
pub use worker::{WorkerBootstrap, WorkerError, run_worker, serve_worker};
