//! lambda-local CLI entry point.
//!
//! - `invoke`: register the configured functions and invoke one of them once
//! - `serve`: NDJSON driver, one invocation per stdin line
//! - `worker`: isolated worker process (started by the runtime itself)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lambda_local_common::{ConfigFile, Failure, FailureKind, InvocationOutcome};
use lambda_local_runner::{FunctionRegistry, WorkerBootstrap, run_worker};

#[derive(Debug, Parser)]
#[command(name = "lambda-local", version, about = "Run serverless function handlers locally")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke one function once and print its outcome.
    Invoke {
        /// Configuration file.
        #[arg(short, long, env = "LAMBDA_LOCAL_CONFIG")]
        config: PathBuf,

        /// Function name.
        #[arg(short, long)]
        function: String,

        /// Event payload as JSON.
        #[arg(short, long, default_value = "{}")]
        event: String,
    },

    /// Read `{"function": ..., "event": ...}` lines from stdin and answer each
    /// with one outcome line.
    Serve {
        /// Configuration file.
        #[arg(short, long, env = "LAMBDA_LOCAL_CONFIG")]
        config: PathBuf,
    },

    /// Serve one function as an isolated worker process.
    #[command(hide = true)]
    Worker {
        /// Bootstrap JSON written by the parent process.
        #[arg(long)]
        bootstrap: String,
    },
}

/// One line read by `serve`.
#[derive(Debug, Deserialize)]
struct ServeRequest {
    /// Echoed back unchanged.
    #[serde(default)]
    id: Option<Value>,
    function: String,
    #[serde(default)]
    event: Value,
}

/// One line written by `serve`.
#[derive(Debug, Serialize)]
struct ServeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    function: String,
    outcome: InvocationOutcome,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Stdout is reserved for outcomes and the worker protocol.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lambda_local=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Invoke {
            config,
            function,
            event,
        } => invoke(config, &function, &event).await,
        Command::Serve { config } => serve(config).await.map(|()| ExitCode::SUCCESS),
        Command::Worker { bootstrap } => {
            let bootstrap =
                WorkerBootstrap::from_json(&bootstrap).context("Invalid --bootstrap argument")?;
            run_worker(bootstrap).await.context("Worker failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the configuration file and register every function it declares.
fn load_registry(path: &PathBuf) -> anyhow::Result<FunctionRegistry> {
    let file = ConfigFile::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let registry =
        FunctionRegistry::new(file.runtime).context("Failed to initialize the runtime")?;
    for function in file.functions {
        let name = function.name.clone();
        registry
            .register(function)
            .with_context(|| format!("Failed to register function '{name}'"))?;
    }

    info!(functions = ?registry.names(), "Configuration loaded");
    Ok(registry)
}

async fn invoke(config: PathBuf, function: &str, event: &str) -> anyhow::Result<ExitCode> {
    let event: Value = serde_json::from_str(event).context("--event is not valid JSON")?;
    let registry = load_registry(&config)?;

    let handle = registry
        .get(function)
        .with_context(|| format!("Function '{function}' is not defined in {}", config.display()))?;

    let outcome = registry.invoke(&handle, event).await;
    registry.cleanup_all().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn serve(config: PathBuf) -> anyhow::Result<()> {
    let registry = Arc::new(load_registry(&config)?);

    let (responses, mut outbox) = mpsc::unbounded_channel::<ServeResponse>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = outbox.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Reading invocations from stdin");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        };
        let Some(line) = line else {
            // Let invocations already running finish.
            while in_flight.join_next().await.is_some() {}
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ServeRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed input line");
                let _ = responses.send(ServeResponse {
                    id: None,
                    function: String::new(),
                    outcome: Failure::protocol(format!("Malformed input: {e}")).into(),
                });
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let responses = responses.clone();
        in_flight.spawn(async move {
            let outcome = match registry.get(&request.function) {
                Some(handle) => registry.invoke(&handle, request.event).await,
                None => Failure::new(
                    FailureKind::LoadError,
                    format!("Function '{}' is not defined", request.function),
                )
                .into(),
            };
            let _ = responses.send(ServeResponse {
                id: request.id,
                function: request.function,
                outcome,
            });
        });
    }

    in_flight.abort_all();
    registry.cleanup_all().await;

    drop(responses);
    writer.await.context("Output writer panicked")??;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
