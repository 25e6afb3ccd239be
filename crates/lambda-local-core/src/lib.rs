//! Core Wasmtime runtime for lambda-local.
//!
//! This crate runs WebAssembly handlers, the host's native runtime family:
//! - [`WasmEngine`]: Configured Wasmtime engine with an epoch ticker
//! - [`InvocationState`]: Per-invocation state seen by host functions
//! - [`CompiledModule`]: Compiled handler module
//! - [`InstanceRunner`]: Handler ABI executor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by every native runner, thread-safe)           │
//! │  - Async support, epoch ticker                          │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CompiledModule                        │
//! │  (Cached per runner by the module loader)               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         Store<InvocationState> + Instance               │
//! │  (Per invocation, isolated)                             │
//! │  - Memory limit, optional fuel                          │
//! │  - WASI environment, captured stdout                    │
//! │  - Logs, reported error and metrics                     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use instance::{ExecutionResult, InstanceRunner};
pub use module::CompiledModule;
pub use store::{ExecutionMetrics, InvocationSpec, InvocationState, LogEntry, LogLevel};
