//! Execution strategies.
//!
//! A strategy turns `(event, context)` into an [`InvocationOutcome`] across
//! one isolation boundary:
//!
//! - [`InProcessStrategy`]: the handler runs on the caller's runtime
//! - [`IsolatedProcessStrategy`]: a long-lived child process per function
//! - [`IsolatedThreadStrategy`]: a long-lived OS thread per function
//! - [`SubprocessStrategy`]: a short-lived interpreter process per invocation
//!
//! Every failure is returned as an outcome value; nothing escapes `run`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use lambda_local_common::{
    CacheConfig, Failure, FailureKind, HandlerRef, InvocationContext, InvocationOutcome,
    RuntimeError,
};

use crate::loader::ModuleLoader;

pub mod in_process;
pub mod isolated_process;
pub mod isolated_thread;
pub mod subprocess;

pub use in_process::InProcessStrategy;
pub use isolated_process::IsolatedProcessStrategy;
pub use isolated_thread::IsolatedThreadStrategy;
pub use subprocess::SubprocessStrategy;

/// Which strategy a runner selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Same-process execution.
    InProcess,
    /// Persistent child process.
    IsolatedProcess,
    /// Persistent worker thread.
    IsolatedThread,
    /// Short-lived interpreter subprocess.
    CrossLanguageSubprocess,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProcess => "in_process",
            Self::IsolatedProcess => "isolated_process",
            Self::IsolatedThread => "isolated_thread",
            Self::CrossLanguageSubprocess => "subprocess",
        };
        f.write_str(name)
    }
}

/// One way of executing a function's handler.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// The strategy variant.
    fn kind(&self) -> StrategyKind;

    /// Run one invocation.
    async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome;

    /// Release every process or thread the strategy owns. Idempotent.
    async fn cleanup(&self);
}

/// Race `fut` against `limit`.
///
/// The losing future is dropped. Whether that stops the underlying work
/// depends on the strategy.
pub async fn race_timeout<F>(limit: Duration, fut: F) -> InvocationOutcome
where
    F: Future<Output = InvocationOutcome>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(timeout_ms = limit.as_millis(), "Invocation timed out");
            Failure::timeout(limit).into()
        }
    }
}

/// Compiled cache invalidation settings.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Keep cached modules between invocations.
    pub skip: bool,
    /// Paths matching this survive invalidation.
    pub keep: Regex,
}

impl CachePolicy {
    /// Compile the policy from configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, RuntimeError> {
        Ok(Self {
            skip: config.skip_cache_invalidation,
            keep: config.keep_regex()?,
        })
    }
}

/// Invalidate the loader cache (unless skipped), load the handler and call it.
///
/// Shared by the in-process strategy, the isolated thread and the isolated
/// process worker loop.
pub async fn load_and_call(
    loader: &dyn ModuleLoader,
    handler: &HandlerRef,
    cache: &CachePolicy,
    event: Value,
    context: &InvocationContext,
) -> InvocationOutcome {
    if !cache.skip {
        let evicted = loader.invalidate(&cache.keep);
        if evicted > 0 {
            debug!(evicted, "Invalidated cached modules");
        }
    }

    let loaded = match loader.load(handler) {
        Ok(loaded) => loaded,
        Err(err) => return Failure::new(FailureKind::LoadError, err.message).into(),
    };

    loaded.call(event, context).await.into()
}
