//! Persistent child-process execution.
//!
//! One worker process per function, spawned on the first invocation and
//! reused until [`cleanup`](ExecutionStrategy::cleanup). Requests and
//! responses are newline-delimited JSON on the child's stdin/stdout (see
//! [`WorkerRequest`] and [`WorkerResponse`]).
//!
//! A dedicated I/O task owns the pipes. `run` hands it a request together
//! with a one-shot reply channel, so the timeout race only ever drops a
//! one-shot receiver and the pipes are never left half-read.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use lambda_local_common::{
    Failure, FailureKind, FunctionDefinition, InvocationContext, InvocationOutcome, RuntimeConfig,
    WorkerRequest, WorkerResponse,
};

use super::{ExecutionStrategy, StrategyKind, race_timeout};
use crate::worker::WorkerBootstrap;

/// Command line flag carrying the bootstrap JSON.
pub const BOOTSTRAP_FLAG: &str = "--bootstrap";

struct PendingCall {
    request: WorkerRequest,
    reply: oneshot::Sender<InvocationOutcome>,
}

struct ProcessWorker {
    child: Child,
    calls: mpsc::Sender<PendingCall>,
    io_task: JoinHandle<()>,
    pid: Option<u32>,
    generation: u64,
}

/// Runs the handler in a long-lived child process.
///
/// Calls are serialized through a FIFO lock: at most one request is in
/// flight per worker and queued calls are served in submission order. A
/// timed-out call is abandoned but the worker is kept; a crashed worker is
/// discarded and respawned by the next call.
pub struct IsolatedProcessStrategy {
    function: FunctionDefinition,
    bootstrap: WorkerBootstrap,
    program: Option<PathBuf>,
    args: Vec<String>,
    timeout: Duration,
    call_lock: Mutex<()>,
    slot: SyncMutex<Option<ProcessWorker>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl IsolatedProcessStrategy {
    /// Create the strategy. Nothing is spawned until the first invocation.
    pub fn new(function: FunctionDefinition, runtime: &RuntimeConfig) -> Self {
        let isolation = &runtime.isolation;
        Self {
            timeout: function.timeout(),
            bootstrap: WorkerBootstrap {
                function: function.clone(),
                runtime: runtime.clone(),
            },
            program: isolation.worker_program.as_ref().map(PathBuf::from),
            args: isolation.worker_args.clone(),
            function,
            call_lock: Mutex::new(()),
            slot: SyncMutex::new(None),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Override the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Process id of the live worker, if one is running.
    pub fn worker_pid(&self) -> Option<u32> {
        self.slot.lock().as_ref().and_then(|worker| worker.pid)
    }

    /// Return the live worker's call channel, spawning a worker if needed.
    fn ensure_worker(&self) -> Result<(mpsc::Sender<PendingCall>, u64), Failure> {
        let mut slot = self.slot.lock();

        if let Some(worker) = slot.as_mut() {
            match worker.child.try_wait() {
                Ok(None) => return Ok((worker.calls.clone(), worker.generation)),
                Ok(Some(status)) => {
                    warn!(function = %self.function.name, %status, "Worker exited, respawning");
                }
                Err(e) => {
                    warn!(function = %self.function.name, error = %e, "Worker status unknown, respawning");
                }
            }
            if let Some(stale) = slot.take() {
                stale.io_task.abort();
            }
        }

        let worker = self.spawn()?;
        let handle = (worker.calls.clone(), worker.generation);
        *slot = Some(worker);
        Ok(handle)
    }

    fn spawn(&self) -> Result<ProcessWorker, Failure> {
        let spawn_error = |message: String| Failure::new(FailureKind::SpawnError, message);

        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| spawn_error(format!("Cannot locate worker executable: {e}")))?,
        };
        let bootstrap = serde_json::to_string(&self.bootstrap)
            .map_err(|e| spawn_error(format!("Cannot encode worker bootstrap: {e}")))?;

        let mut child = Command::new(&program)
            .args(&self.args)
            .arg(BOOTSTRAP_FLAG)
            .arg(bootstrap)
            .envs(self.function.lambda_environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                spawn_error(format!(
                    "Failed to spawn worker '{}': {e}",
                    program.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("Worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("Worker stdout was not captured".into()))?;

        let pid = child.id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (calls, queue) = mpsc::channel(1);
        let io_task = tokio::spawn(pump(stdin, stdout, queue));

        info!(
            function = %self.function.name,
            pid,
            program = %program.display(),
            "Spawned isolated worker process"
        );

        Ok(ProcessWorker {
            child,
            calls,
            io_task,
            pid,
            generation,
        })
    }

    /// Drop the worker of `generation` if it is still the live one.
    fn discard(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|w| w.generation == generation) {
            if let Some(worker) = slot.take() {
                warn!(function = %self.function.name, pid = worker.pid, "Discarding crashed worker");
                worker.io_task.abort();
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for IsolatedProcessStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::IsolatedProcess
    }

    #[instrument(skip_all, fields(request_id = %context.aws_request_id))]
    async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome {
        let _turn = self.call_lock.lock().await;

        let (calls, generation) = match self.ensure_worker() {
            Ok(live) => live,
            Err(failure) => return failure.into(),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = oneshot::channel();
        let call = PendingCall {
            request: WorkerRequest::Invoke { id, event, context },
            reply,
        };

        if calls.send(call).await.is_err() {
            self.discard(generation);
            return Failure::worker_crashed("Worker is no longer accepting requests").into();
        }

        let outcome = race_timeout(self.timeout, async {
            answer.await.unwrap_or_else(|_| {
                Failure::worker_crashed("Worker went away before answering").into()
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
        let Some(mut worker) = worker else {
            return;
        };

        if let Err(e) = worker.child.kill().await {
            warn!(function = %self.function.name, error = %e, "Failed to kill worker");
        }
        worker.io_task.abort();
        info!(function = %self.function.name, pid = worker.pid, "Stopped isolated worker process");
    }
}

/// Own the worker's pipes: write each queued request, then read lines until
/// the matching response arrives.
async fn pump(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut calls: mpsc::Receiver<PendingCall>,
) {
    let mut lines = BufReader::new(stdout).lines();
    // Requests whose caller gave up before the worker answered.
    let mut orphans: usize = 0;

    while let Some(PendingCall { request, mut reply }) = calls.recv().await {
        let id = request.id();

        if let Err(e) = write_request(&mut stdin, &request).await {
            let _ = reply.send(Failure::worker_crashed(format!("Failed to write to worker: {e}")).into());
            return;
        }

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                () = reply.closed() => {
                    debug!(id, "Caller abandoned the call");
                    orphans += 1;
                    break;
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let _ = reply.send(Failure::worker_crashed("Worker exited before answering").into());
                    return;
                }
                Err(e) => {
                    let _ = reply.send(Failure::worker_crashed(format!("Failed to read from worker: {e}")).into());
                    return;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerResponse>(&line) {
                Ok(response) if response.id() == Some(id) => {
                    let _ = reply.send(response.into_outcome());
                    break;
                }
                Ok(response) if orphans > 0 => {
                    orphans -= 1;
                    debug!(stale = ?response.id(), "Discarding response to an abandoned call");
                }
                Ok(response) if response.answers(id) => {
                    let _ = reply.send(response.into_outcome());
                    break;
                }
                Ok(response) => {
                    warn!(stale = ?response.id(), expected = id, "Discarding response with unknown id");
                }
                Err(e) => {
                    let failure = Failure::protocol(format!("Malformed worker response: {e}"))
                        .with_cause(line);
                    let _ = reply.send(failure.into());
                    break;
                }
            }
        }
    }
}

async fn write_request(stdin: &mut ChildStdin, request: &WorkerRequest) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}
