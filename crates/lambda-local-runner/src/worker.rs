//! The isolated worker process.
//!
//! The isolated-process strategy starts `lambda-local worker --bootstrap
//! <json>`; the binary hands the decoded [`WorkerBootstrap`] to
//! [`run_worker`], which serves [`WorkerRequest`]s from stdin one at a time
//! until stdin closes. Logs go to stderr; stdout carries only responses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use lambda_local_common::{
    Failure, FunctionDefinition, RuntimeConfig, WorkerRequest, WorkerResponse,
};
use lambda_local_core::WasmEngine;

use crate::loader::{ModuleLoader, WasmModuleLoader};
use crate::strategy::{CachePolicy, load_and_call};

/// Everything a worker process needs to serve one function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    /// The function served by this worker.
    pub function: FunctionDefinition,
    /// Runtime configuration of the parent.
    pub runtime: RuntimeConfig,
}

/// Errors that stop a worker before or while serving.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The bootstrap could not be used.
    #[error("Invalid worker bootstrap: {0}")]
    Bootstrap(String),

    /// Reading requests or writing responses failed.
    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerBootstrap {
    /// Decode the `--bootstrap` argument.
    pub fn from_json(raw: &str) -> Result<Self, WorkerError> {
        serde_json::from_str(raw).map_err(|e| WorkerError::Bootstrap(e.to_string()))
    }
}

/// Serve requests on stdin/stdout with a WebAssembly loader.
pub async fn run_worker(bootstrap: WorkerBootstrap) -> Result<(), WorkerError> {
    bootstrap
        .runtime
        .validate()
        .map_err(|e| WorkerError::Bootstrap(e.to_string()))?;
    let engine = WasmEngine::new(&bootstrap.runtime.engine)
        .map_err(|e| WorkerError::Bootstrap(e.to_string()))?;
    let loader = Arc::new(WasmModuleLoader::new(
        engine,
        bootstrap.runtime.execution.clone(),
        &bootstrap.function,
    ));

    serve_worker(&bootstrap, loader, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve newline-delimited requests from `input` until it closes.
///
/// Requests are handled strictly one at a time. A line that is not a valid
/// request is answered with a `ProtocolError` response without an id.
pub async fn serve_worker<R, W>(
    bootstrap: &WorkerBootstrap,
    loader: Arc<dyn ModuleLoader>,
    input: R,
    mut output: W,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let function = &bootstrap.function;
    let handler = function
        .handler_ref()
        .map_err(|e| WorkerError::Bootstrap(e.to_string()))?;
    let cache = CachePolicy::from_config(&bootstrap.runtime.cache)
        .map_err(|e| WorkerError::Bootstrap(e.to_string()))?;

    info!(function = %function.name, pid = std::process::id(), "Worker ready");

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Invoke { id, event, context }) => {
                debug!(id, request_id = %context.aws_request_id, "Serving request");
                let outcome = load_and_call(loader.as_ref(), &handler, &cache, event, &context).await;
                WorkerResponse::from_outcome(id, outcome)
            }
            Err(e) => {
                warn!(error = %e, "Malformed request");
                let failure = Failure::protocol(format!("Malformed request: {e}"));
                WorkerResponse::Error {
                    id: None,
                    kind: failure.kind,
                    message: failure.message,
                    cause: failure.cause,
                }
            }
        };

        let mut encoded = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }

    info!(function = %function.name, "Input closed, worker exiting");
    Ok(())
}
