//! The invocation protocol shared by every execution strategy.
//!
//! - [`InvocationRequest`]: `{event, context}`, as written to cross-language adapters
//! - [`InvocationOutcome`]: exactly one of `Success(result)` or `Failure(failure)`
//! - [`WorkerRequest`] / [`WorkerResponse`]: newline-delimited messages exchanged
//!   with persistent isolated workers
//!
//! # Isolated worker wire format
//!
//! ```text
//! -> {"type":"invoke","id":1,"event":{...},"context":{...}}
//! <- {"type":"result","id":1,"value":{...}}
//! <- {"type":"error","id":1,"kind":"HandlerError","message":"boom"}
//! ```
//!
//! The `id` of a response is optional; a response without one is matched to the
//! call currently in flight.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::InvocationContext;

/// Reserved key wrapping the result printed by cross-language adapters.
pub const RESULT_SENTINEL: &str = "__result__";

/// Reserved key wrapping a handler exception printed by cross-language adapters.
pub const ERROR_SENTINEL: &str = "__error__";

/// Failure taxonomy shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The declared runtime is not supported.
    UnsupportedRuntime,
    /// The host is too old for the requested isolation mode.
    UnsupportedHostVersion,
    /// A worker or interpreter process could not be started.
    SpawnError,
    /// The handler module could not be loaded.
    LoadError,
    /// User code threw, trapped, or reported an error.
    HandlerError,
    /// A malformed or missing inter-process message.
    ProtocolError,
    /// The isolated worker went away mid-call.
    WorkerCrashed,
    /// A subprocess exited with a non-zero status.
    ProcessError,
    /// The handler did not finish within its timeout.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedRuntime => "UnsupportedRuntime",
            Self::UnsupportedHostVersion => "UnsupportedHostVersion",
            Self::SpawnError => "SpawnError",
            Self::LoadError => "LoadError",
            Self::HandlerError => "HandlerError",
            Self::ProtocolError => "ProtocolError",
            Self::WorkerCrashed => "WorkerCrashed",
            Self::ProcessError => "ProcessError",
            Self::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

/// A typed invocation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human readable message.
    pub message: String,
    /// Diagnostic detail, e.g. captured stderr or a trap code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Failure {
    /// Create a failure without a cause.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// A `HandlerError` failure.
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::new(FailureKind::HandlerError, message)
    }

    /// A `Timeout` failure for the given limit.
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("Task timed out after {:.2} seconds", limit.as_secs_f64()),
        )
    }

    /// A `WorkerCrashed` failure.
    pub fn worker_crashed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerCrashed, message)
    }

    /// A `ProtocolError` failure.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ProtocolError, message)
    }
}

/// Result of one invocation. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationOutcome {
    /// The handler returned a value.
    Success(Value),
    /// The invocation failed.
    Failure(Failure),
}

impl InvocationOutcome {
    /// Returns `true` for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The result value, if successful.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    /// The failure kind, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure().map(|f| f.kind)
    }

    /// Convert into a standard `Result`.
    pub fn into_result(self) -> Result<Value, Failure> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl From<Result<Value, Failure>> for InvocationOutcome {
    fn from(result: Result<Value, Failure>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(failure) => Self::Failure(failure),
        }
    }
}

impl From<Failure> for InvocationOutcome {
    fn from(failure: Failure) -> Self {
        Self::Failure(failure)
    }
}

/// A single invocation payload, created fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Event payload.
    pub event: Value,
    /// Invocation context in its portable form.
    pub context: Value,
}

impl InvocationRequest {
    /// Build the payload written to a cross-language adapter.
    ///
    /// The context is stripped with [`InvocationContext::to_portable_json`].
    pub fn portable(event: Value, context: &InvocationContext) -> Self {
        Self {
            event,
            context: context.to_portable_json(),
        }
    }
}

/// Message sent to a persistent isolated worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerRequest {
    /// Run the handler once.
    Invoke {
        /// Correlation id, echoed in the response.
        id: u64,
        /// Event payload.
        event: Value,
        /// Invocation context.
        context: InvocationContext,
    },
}

impl WorkerRequest {
    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        match self {
            Self::Invoke { id, .. } => *id,
        }
    }
}

/// Message sent back by a persistent isolated worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    /// The handler returned a value.
    Result {
        /// Correlation id of the answered request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Handler result.
        value: Value,
    },
    /// The invocation failed inside the worker.
    Error {
        /// Correlation id of the answered request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Failure category.
        kind: FailureKind,
        /// Failure message.
        message: String,
        /// Optional diagnostic detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl WorkerResponse {
    /// Build the response for an outcome.
    pub fn from_outcome(id: u64, outcome: InvocationOutcome) -> Self {
        match outcome {
            InvocationOutcome::Success(value) => Self::Result {
                id: Some(id),
                value,
            },
            InvocationOutcome::Failure(failure) => Self::Error {
                id: Some(id),
                kind: failure.kind,
                message: failure.message,
                cause: failure.cause,
            },
        }
    }

    /// Correlation id, if the worker sent one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    /// Returns `true` if this response answers the request with `id`.
    ///
    /// Responses without an id are accepted for the call in flight.
    pub fn answers(&self, id: u64) -> bool {
        self.id().is_none_or(|own| own == id)
    }

    /// Convert into an outcome.
    pub fn into_outcome(self) -> InvocationOutcome {
        match self {
            Self::Result { value, .. } => InvocationOutcome::Success(value),
            Self::Error {
                kind,
                message,
                cause,
                ..
            } => InvocationOutcome::Failure(Failure {
                kind,
                message,
                cause,
            }),
        }
    }
}
