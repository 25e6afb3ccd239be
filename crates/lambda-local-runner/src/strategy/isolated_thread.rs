//! Persistent worker-thread execution.
//!
//! Each function gets a dedicated OS thread running its own current-thread
//! tokio runtime and its own module loader. Jobs arrive over a channel and
//! are answered on one-shot channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use lambda_local_common::{
    Failure, FailureKind, FunctionDefinition, HandlerRef, InvocationContext, InvocationOutcome,
};

use super::{CachePolicy, ExecutionStrategy, StrategyKind, load_and_call, race_timeout};
use crate::loader::LoaderFactory;

/// How long `cleanup` waits for the thread to finish its current job.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct Job {
    event: Value,
    context: InvocationContext,
    reply: oneshot::Sender<InvocationOutcome>,
}

struct ThreadWorker {
    jobs: mpsc::UnboundedSender<Job>,
    thread: JoinHandle<()>,
    exited: oneshot::Receiver<()>,
    generation: u64,
}

/// Runs the handler on a long-lived worker thread.
pub struct IsolatedThreadStrategy {
    function: FunctionDefinition,
    handler: HandlerRef,
    factory: LoaderFactory,
    cache: CachePolicy,
    timeout: Duration,
    call_lock: Mutex<()>,
    slot: SyncMutex<Option<ThreadWorker>>,
    next_generation: AtomicU64,
}

impl IsolatedThreadStrategy {
    /// Create the strategy. The thread starts on the first invocation.
    pub fn new(
        function: FunctionDefinition,
        handler: HandlerRef,
        factory: LoaderFactory,
        cache: CachePolicy,
    ) -> Self {
        Self {
            timeout: function.timeout(),
            function,
            handler,
            factory,
            cache,
            call_lock: Mutex::new(()),
            slot: SyncMutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Override the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns `true` while a worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    async fn ensure_worker(&self) -> Result<(mpsc::UnboundedSender<Job>, u64), Failure> {
        {
            let mut slot = self.slot.lock();
            if let Some(worker) = slot.as_ref() {
                if !worker.jobs.is_closed() {
                    return Ok((worker.jobs.clone(), worker.generation));
                }
                warn!(function = %self.function.name, "Worker thread stopped, restarting");
                *slot = None;
            }
        }

        let worker = self.spawn().await?;
        let handle = (worker.jobs.clone(), worker.generation);
        *self.slot.lock() = Some(worker);
        Ok(handle)
    }

    async fn spawn(&self) -> Result<ThreadWorker, Failure> {
        let spawn_error = |message: String| Failure::new(FailureKind::SpawnError, message);

        let (jobs, queue) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exited) = oneshot::channel::<()>();

        let function = self.function.clone();
        let handler = self.handler.clone();
        let factory = Arc::clone(&self.factory);
        let cache = self.cache.clone();

        let thread = std::thread::Builder::new()
            .name(format!("lambda-worker-{}", self.function.name))
            .spawn(move || {
                let _exit = exit_tx;
                serve_jobs(&function, &handler, &factory, &cache, queue, ready_tx);
            })
            .map_err(|e| spawn_error(format!("Failed to spawn worker thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(spawn_error(message)),
            Err(_) => return Err(spawn_error("Worker thread died during startup".into())),
        }

        info!(function = %self.function.name, "Started isolated worker thread");

        Ok(ThreadWorker {
            jobs,
            thread,
            exited,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn discard(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|w| w.generation == generation) {
            warn!(function = %self.function.name, "Discarding crashed worker thread");
            *slot = None;
        }
    }
}

/// Body of the worker thread.
fn serve_jobs(
    function: &FunctionDefinition,
    handler: &HandlerRef,
    factory: &LoaderFactory,
    cache: &CachePolicy,
    mut queue: mpsc::UnboundedReceiver<Job>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to build worker runtime: {e}")));
            return;
        }
    };

    let loader = factory(function);
    let _ = ready.send(Ok(()));

    runtime.block_on(async move {
        while let Some(Job {
            event,
            context,
            mut reply,
        }) = queue.recv().await
        {
            // Dropping the call once the caller gives up stops Wasm guests
            // at their next epoch yield.
            tokio::select! {
                outcome = load_and_call(loader.as_ref(), handler, cache, event, &context) => {
                    let _ = reply.send(outcome);
                }
                () = reply.closed() => {
                    debug!(request_id = %context.aws_request_id, "Caller abandoned the job");
                }
            }
        }
    });

    debug!(function = %function.name, "Worker thread exiting");
}

#[async_trait]
impl ExecutionStrategy for IsolatedThreadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::IsolatedThread
    }

    #[instrument(skip_all, fields(request_id = %context.aws_request_id))]
    async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome {
        let _turn = self.call_lock.lock().await;

        let (jobs, generation) = match self.ensure_worker().await {
            Ok(live) => live,
            Err(failure) => return failure.into(),
        };

        let (reply, answer) = oneshot::channel();
        if jobs
            .send(Job {
                event,
                context,
                reply,
            })
            .is_err()
        {
            self.discard(generation);
            return Failure::worker_crashed("Worker thread is no longer accepting jobs").into();
        }

        let outcome = race_timeout(self.timeout, async {
            answer.await.unwrap_or_else(|_| {
                Failure::worker_crashed("Worker thread went away before answering").into()
            })
        })
        .await;

        if outcome.failure_kind() == Some(FailureKind::WorkerCrashed) {
            self.discard(generation);
        }
        outcome
    }

    async fn cleanup(&self) {
        let worker = self.slot.lock().take();
        let Some(ThreadWorker {
            jobs,
            thread,
            exited,
            ..
        }) = worker
        else {
            return;
        };

        // Closing the channel ends the job loop after the current job.
        drop(jobs);

        if tokio::time::timeout(SHUTDOWN_GRACE, exited).await.is_ok() {
            if thread.join().is_err() {
                warn!(function = %self.function.name, "Worker thread panicked");
            }
            info!(function = %self.function.name, "Stopped isolated worker thread");
        } else {
            warn!(
                function = %self.function.name,
                grace_ms = SHUTDOWN_GRACE.as_millis(),
                "Worker thread still busy, detaching"
            );
        }
    }
}
