//! Host functions exposed to lambda-local Wasm handlers.
//!
//! Handler modules import these from the `env` module:
//!
//! - [`logging`]: `log(level, ptr, len)`, structured logging from guest code
//! - [`context`]: `fail(ptr, len)` to report a handler error and
//!   `remaining_time_ms()` for the invocation deadline
//!
//! [`linker::register_all`] also links WASI preview1, so handlers built for
//! `wasm32-wasip1` can read their environment and write to stdout.

pub mod context;
pub mod linker;
pub mod logging;

pub use context::ContextHost;
pub use linker::{create_instance_runner, register_all};
pub use logging::LoggingHost;
