//! Same-process execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::{instrument, warn};

use lambda_local_common::{Failure, HandlerRef, InvocationContext, InvocationOutcome};

use super::{CachePolicy, ExecutionStrategy, StrategyKind, load_and_call, race_timeout};
use crate::loader::ModuleLoader;

/// Runs the handler on the caller's runtime.
///
/// Invocations of one function are serialized by a per-function lock. The
/// lock is acquired before the timeout starts, so a queued call gets its full
/// time budget.
///
/// Each call runs in its own task so a panicking handler becomes a
/// `HandlerError` instead of unwinding into the caller. The task is aborted
/// when the caller stops waiting for it.
///
/// A timed-out Wasm handler stops at the next epoch tick once its task is
/// aborted. With epoch interruption disabled a spinning guest keeps its
/// thread busy after the caller has already received `Timeout`.
pub struct InProcessStrategy {
    loader: Arc<dyn ModuleLoader>,
    handler: HandlerRef,
    cache: CachePolicy,
    timeout: Duration,
    serial: Mutex<()>,
}

impl InProcessStrategy {
    /// Create the strategy.
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        handler: HandlerRef,
        cache: CachePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            loader,
            handler,
            cache,
            timeout,
            serial: Mutex::new(()),
        }
    }

    /// The loader backing this strategy.
    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }
}

#[async_trait]
impl ExecutionStrategy for InProcessStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::InProcess
    }

    #[instrument(skip_all, fields(request_id = %context.aws_request_id))]
    async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome {
        let _turn = self.serial.lock().await;

        let loader = Arc::clone(&self.loader);
        let handler = self.handler.clone();
        let cache = self.cache.clone();
        let call = AbortOnDrop(tokio::spawn(async move {
            load_and_call(loader.as_ref(), &handler, &cache, event, &context).await
        }));

        race_timeout(self.timeout, async move {
            let mut call = call;
            match (&mut call.0).await {
                Ok(outcome) => outcome,
                Err(err) => join_failure(err).into(),
            }
        })
        .await
    }

    async fn cleanup(&self) {}
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(err: JoinError) -> Failure {
    if !err.is_panic() {
        return Failure::handler_error(format!("Handler task stopped: {err}"));
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    warn!(panic = %message, "Handler panicked");
    Failure::handler_error(format!("Handler panicked: {message}"))
}
