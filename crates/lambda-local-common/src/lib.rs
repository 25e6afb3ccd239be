//! Common types, errors, and configuration for lambda-local.
//!
//! This crate provides the shared contract used across the lambda-local workspace:
//! - The invocation protocol ([`InvocationOutcome`], [`Failure`], worker messages)
//! - Invocation context construction ([`LambdaContext`])
//! - Function definitions and runtime families
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures and config files

pub mod config;
pub mod config_file;
pub mod context;
pub mod error;
pub mod function;
pub mod protocol;
pub mod runtime;

pub use config::{CacheConfig, EngineConfig, ExecutionConfig, IsolationConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use context::{InvocationContext, LambdaContext};
pub use error::{ConfigError, HostFunctionError, RuntimeError};
pub use function::{FunctionDefinition, HandlerRef};
pub use protocol::{
    Failure, FailureKind, InvocationOutcome, InvocationRequest, WorkerRequest, WorkerResponse,
};
pub use runtime::{RuntimeFamily, ScriptLanguage, ScriptRuntime};
