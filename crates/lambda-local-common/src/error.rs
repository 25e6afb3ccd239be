//! Error types for lambda-local.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Errors from loading and executing WebAssembly handlers
//! - [`HostFunctionError`]: Errors from host function implementations
//! - [`ConfigError`]: Errors detected while selecting an execution strategy
//!
//! None of these escape a Handler Runner: they are converted into a
//! [`Failure`](crate::Failure) at the strategy boundary.

use std::io;

use thiserror::Error;

use crate::protocol::{Failure, FailureKind};

/// Errors from loading and executing WebAssembly handlers.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The handler module file could not be found.
    #[error("Handler module not found: {path}")]
    ModuleNotFound {
        /// The path that was searched for.
        path: String,
    },

    /// The handler reference could not be parsed.
    #[error("Invalid handler reference '{handler}': {reason}")]
    InvalidHandler {
        /// The raw handler string.
        handler: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The module does not export a required symbol.
    #[error("Export '{name}' not found in handler module")]
    ExportNotFound {
        /// The missing export name.
        name: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The handler produced bytes that are not valid JSON.
    #[error("Invalid handler output: {reason}")]
    InvalidOutput {
        /// Description of the decoding failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host function implementations.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// Guest passed a pointer/length pair outside of its linear memory.
    #[error("Guest memory access out of bounds: ptr={ptr} len={len}")]
    OutOfBounds {
        /// Guest pointer.
        ptr: i64,
        /// Requested length.
        len: i64,
    },

    /// The guest module does not export a linear memory.
    #[error("Guest memory export not found")]
    MissingMemory,

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(path: impl Into<String>) -> Self {
        Self::ModuleNotFound { path: path.into() }
    }

    /// Create a new `InvalidHandler` error.
    pub fn invalid_handler(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHandler {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error happened before any handler code ran.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound { .. }
                | Self::InvalidHandler { .. }
                | Self::ExportNotFound { .. }
                | Self::CompilationFailed { .. }
                | Self::Io(_)
                | Self::InvalidConfig { .. }
        )
    }
}

impl From<RuntimeError> for Failure {
    fn from(err: RuntimeError) -> Self {
        let kind = if err.is_load_error() {
            FailureKind::LoadError
        } else {
            FailureKind::HandlerError
        };
        Failure::new(kind, err.to_string())
    }
}

/// Errors detected while selecting an execution strategy.
///
/// These are unrecoverable for the function they concern: the selection is
/// memoized, so every later invocation reports the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The declared runtime is neither native nor a supported script runtime.
    #[error("Unsupported runtime: {runtime}")]
    UnsupportedRuntime {
        /// The declared runtime identifier.
        runtime: String,
    },

    /// Worker threads were requested but the host is too old.
    #[error(
        "\"worker threads\" require host version >={required}, but found version {found}"
    )]
    UnsupportedHostVersion {
        /// The minimum required version.
        required: String,
        /// The detected host version.
        found: String,
    },
}

impl ConfigError {
    /// The failure kind reported to callers.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedRuntime { .. } => FailureKind::UnsupportedRuntime,
            Self::UnsupportedHostVersion { .. } => FailureKind::UnsupportedHostVersion,
        }
    }
}

impl From<ConfigError> for Failure {
    fn from(err: ConfigError) -> Self {
        Failure::new(err.failure_kind(), err.to_string())
    }
}
