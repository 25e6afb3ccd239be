//! Cross-language execution through a short-lived interpreter process.
//!
//! Each invocation spawns `interpreter <adapter> <handler path> <handler name>`,
//! writes `{event, context}` to its stdin and closes it. The adapter prints
//! one envelope line among whatever else the handler writes to stdout:
//!
//! ```text
//! {"__result__": <value>}
//! {"__error__": {"errorType": ..., "errorMessage": ..., "stackTrace": [...], "errorPhase": "load"|"invoke"}}
//! ```
//!
//! Every other stdout line is incidental output and only logged.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use lambda_local_common::protocol::{ERROR_SENTINEL, RESULT_SENTINEL};
use lambda_local_common::{
    Failure, FailureKind, FunctionDefinition, HandlerRef, InvocationContext, InvocationOutcome,
    InvocationRequest, ScriptLanguage, ScriptRuntime,
};

use super::{ExecutionStrategy, StrategyKind, race_timeout};

/// Python adapter, passed with `-c`.
pub const PYTHON_ADAPTER: &str = include_str!("../../adapters/invoke.py");

/// Ruby adapter, passed with `-e`.
pub const RUBY_ADAPTER: &str = include_str!("../../adapters/invoke.rb");

/// Runs the handler in a fresh interpreter process per invocation.
pub struct SubprocessStrategy {
    function: FunctionDefinition,
    runtime: ScriptRuntime,
    handler: HandlerRef,
    timeout: Duration,
}

impl SubprocessStrategy {
    /// Create the strategy.
    pub fn new(function: FunctionDefinition, runtime: ScriptRuntime, handler: HandlerRef) -> Self {
        Self {
            timeout: function.timeout(),
            function,
            runtime,
            handler,
        }
    }

    /// Override the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.runtime.interpreter);

        match self.runtime.language {
            ScriptLanguage::Python => command.args(["-u", "-c", PYTHON_ADAPTER]),
            ScriptLanguage::Ruby => command.args(["-e", RUBY_ADAPTER]),
        };

        command
            .arg(&self.handler.path)
            .arg(&self.handler.export)
            .envs(self.function.lambda_environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if self.runtime.language == ScriptLanguage::Python {
            let path = prepend_venv(std::env::var_os("VIRTUAL_ENV"), std::env::var_os("PATH"));
            if let Some(path) = path {
                command.env("PATH", path);
            }
        }

        command
    }

    async fn exchange(&self, request: InvocationRequest) -> InvocationOutcome {
        let interpreter = &self.runtime.interpreter;

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                return Failure::new(
                    FailureKind::SpawnError,
                    format!("Failed to spawn {interpreter}: {e}"),
                )
                .into();
            }
        };

        let input = match serde_json::to_vec(&request) {
            Ok(input) => input,
            Err(e) => return Failure::protocol(format!("Cannot encode request: {e}")).into(),
        };

        if let Some(mut stdin) = child.stdin.take() {
            // The adapter may exit before reading; its exit status tells why.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "Failed to write request to interpreter");
            }
        }

        match child.wait_with_output().await {
            Ok(output) => interpret(interpreter, &output),
            Err(e) => Failure::new(
                FailureKind::ProcessError,
                format!("Failed to wait for {interpreter}: {e}"),
            )
            .into(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for SubprocessStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CrossLanguageSubprocess
    }

    #[instrument(skip_all, fields(request_id = %context.aws_request_id))]
    async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome {
        let request = InvocationRequest::portable(event, &context);

        // On timeout the child is dropped, which kills it.
        race_timeout(self.timeout, self.exchange(request)).await
    }

    async fn cleanup(&self) {}
}

/// `path` with the virtualenv's executables first.
///
/// Returns `None` when no virtualenv is active, leaving `PATH` untouched.
fn prepend_venv(venv: Option<OsString>, path: Option<OsString>) -> Option<OsString> {
    let bin = PathBuf::from(venv?).join(if cfg!(windows) { "Scripts" } else { "bin" });

    let rest = path.as_ref().map(std::env::split_paths).into_iter().flatten();
    std::env::join_paths(std::iter::once(bin).chain(rest)).ok()
}

/// Envelopes found on an adapter's stdout.
#[derive(Debug, Default, PartialEq)]
pub struct Envelopes {
    /// Payload of the first `__result__` envelope.
    pub result: Option<Value>,
    /// Payload of the first `__error__` envelope.
    pub error: Option<Value>,
}

/// Scan stdout for envelope lines. The first envelope of each kind wins.
pub fn scan_envelopes(stdout: &str) -> Envelopes {
    let mut found = Envelopes::default();

    for line in stdout.lines() {
        let line = line.trim();
        let envelope = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => map,
            _ => {
                if !line.is_empty() {
                    info!(subprocess_stdout = true, "{}", line);
                }
                continue;
            }
        };

        if found.result.is_none() {
            if let Some(value) = envelope.get(RESULT_SENTINEL) {
                found.result = Some(value.clone());
                continue;
            }
        }
        if found.error.is_none() {
            if let Some(value) = envelope.get(ERROR_SENTINEL) {
                found.error = Some(value.clone());
                continue;
            }
        }

        info!(subprocess_stdout = true, "{}", line);
    }

    found
}

/// Map a finished adapter process to an outcome.
///
/// An error envelope wins, then a non-zero exit, then a result envelope.
fn interpret(interpreter: &str, output: &Output) -> InvocationOutcome {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stderr.trim().is_empty() {
        debug!(stderr = %stderr.trim_end(), "Interpreter stderr");
    }

    let envelopes = scan_envelopes(&stdout);

    if let Some(error) = envelopes.error {
        return error_envelope_failure(&error).into();
    }

    if !output.status.success() {
        return Failure::new(
            FailureKind::ProcessError,
            format!("{interpreter} exited with {}", output.status),
        )
        .with_cause(stderr.trim_end())
        .into();
    }

    match envelopes.result {
        Some(result) => InvocationOutcome::Success(result),
        None => {
            let failure = Failure::protocol("no result found");
            let stderr = stderr.trim_end();
            if stderr.is_empty() {
                failure.into()
            } else {
                failure.with_cause(stderr).into()
            }
        }
    }
}

/// Build the failure for an `__error__` payload.
fn error_envelope_failure(error: &Value) -> Failure {
    let error_type = error["errorType"].as_str().unwrap_or("Error");
    let message = match &error["errorMessage"] {
        Value::String(message) => message.clone(),
        Value::Null => error_type.to_string(),
        other => other.to_string(),
    };
    let stack = match &error["stackTrace"] {
        Value::Array(frames) => frames
            .iter()
            .map(|frame| frame.as_str().map_or_else(|| frame.to_string(), str::to_owned))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::String(stack) => stack.clone(),
        _ => String::new(),
    };

    let kind = if error["errorPhase"] == "load" {
        FailureKind::LoadError
    } else {
        FailureKind::HandlerError
    };

    let cause = if stack.is_empty() {
        error_type.to_string()
    } else {
        format!("{error_type}\n{stack}")
    };
    Failure::new(kind, message).with_cause(cause)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use lambda_local_common::{LambdaContext, RuntimeFamily};
    use serde_json::json;

    use super::*;

    fn has_interpreter(name: &str) -> bool {
        std::process::Command::new(name)
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn script_strategy(runtime: &str, dir: &Path, source_file: &str, source: &str) -> SubprocessStrategy {
        std::fs::write(dir.join(source_file), source).unwrap();

        let Some(RuntimeFamily::Script(script)) = RuntimeFamily::classify(runtime) else {
            panic!("{runtime} is not a script runtime");
        };
        let function = FunctionDefinition::new(
            "script",
            format!("{}/handler.handler", dir.display()),
            runtime,
        )
        .with_env("GREETING", "hello");
        let handler = function.handler_ref().unwrap();
        SubprocessStrategy::new(function, script, handler).with_timeout(Duration::from_secs(10))
    }

    fn context() -> InvocationContext {
        LambdaContext::new("script", 256).create("x", Duration::from_secs(10))
    }

    #[test]
    fn test_scan_first_envelope_wins() {
        let stdout = "booting\n{\"__result__\": {\"a\": 1}}\n{\"__result__\": 2}\n";
        let found = scan_envelopes(stdout);

        assert_eq!(found.result, Some(json!({"a": 1})));
        assert!(found.error.is_none());
    }

    #[test]
    fn test_scan_ignores_incidental_json() {
        let stdout = "{\"level\":\"info\"}\n[1,2]\n42\n{\"__result__\": null}\n";
        let found = scan_envelopes(stdout);

        assert_eq!(found.result, Some(Value::Null));
    }

    #[test]
    fn test_scan_nothing() {
        assert_eq!(scan_envelopes("hello\n\n"), Envelopes::default());
    }

    #[test]
    fn test_error_envelope_mapping() {
        let failure = error_envelope_failure(&json!({
            "errorType": "ValueError",
            "errorMessage": "bad input",
            "stackTrace": ["line 1", "line 2"],
            "errorPhase": "invoke",
        }));
        assert_eq!(failure.kind, FailureKind::HandlerError);
        assert_eq!(failure.message, "bad input");
        assert_eq!(failure.cause.as_deref(), Some("ValueError\nline 1\nline 2"));

        let failure = error_envelope_failure(&json!({
            "errorType": "SyntaxError",
            "errorMessage": "invalid syntax",
            "errorPhase": "load",
        }));
        assert_eq!(failure.kind, FailureKind::LoadError);
        assert_eq!(failure.cause.as_deref(), Some("SyntaxError"));
    }

    #[tokio::test]
    async fn test_python_echo_with_noise() {
        if !has_interpreter("python3") {
            eprintln!("python3 not available, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import os\n\
             def handler(event, context):\n\
             \x20   print('incidental output')\n\
             \x20   return {'event': event, 'id': context.aws_request_id,\n\
             \x20           'greeting': os.environ['GREETING'],\n\
             \x20           'offline': os.environ['IS_OFFLINE'],\n\
             \x20           'has_time': context.get_remaining_time_in_millis() > 0}\n",
        );

        let outcome = strategy.run(json!({"a": 1}), context()).await;

        assert_eq!(
            outcome,
            InvocationOutcome::Success(json!({
                "event": {"a": 1},
                "id": "x",
                "greeting": "hello",
                "offline": "true",
                "has_time": true,
            }))
        );
    }

    #[tokio::test]
    async fn test_python_output_without_trailing_newline() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import sys\n\
             def handler(event, context):\n\
             \x20   sys.stdout.write('progress...')\n\
             \x20   return {'ok': 1}\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        assert_eq!(outcome, InvocationOutcome::Success(json!({"ok": 1})));
    }

    #[tokio::test]
    async fn test_python_handler_error() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "def handler(event, context):\n    raise ValueError('bad input')\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        let failure = outcome.failure().unwrap();

        assert_eq!(failure.kind, FailureKind::HandlerError);
        assert!(failure.message.contains("bad input"));
        assert!(failure.cause.as_deref().unwrap().starts_with("ValueError"));
    }

    #[tokio::test]
    async fn test_python_load_error() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy("python3.12", dir.path(), "handler.py", "def handler(:\n");

        let outcome = strategy.run(json!({}), context()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::LoadError));
    }

    #[tokio::test]
    async fn test_python_no_result() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import os\ndef handler(event, context):\n    print('bye')\n    os._exit(0)\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        let failure = outcome.failure().unwrap();

        assert_eq!(failure.kind, FailureKind::ProtocolError);
        assert_eq!(failure.message, "no result found");
    }

    #[tokio::test]
    async fn test_python_no_result_keeps_stderr() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import os, sys\n\
             def handler(event, context):\n\
             \x20   sys.stderr.write('lost the result\\n')\n\
             \x20   sys.stderr.flush()\n\
             \x20   os._exit(0)\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        let failure = outcome.failure().unwrap();

        assert_eq!(failure.kind, FailureKind::ProtocolError);
        assert_eq!(failure.cause.as_deref(), Some("lost the result"));
    }

    #[tokio::test]
    async fn test_python_nonzero_exit() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import os, sys\n\
             def handler(event, context):\n\
             \x20   sys.stderr.write('disk on fire\\n')\n\
             \x20   sys.stderr.flush()\n\
             \x20   os._exit(3)\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        let failure = outcome.failure().unwrap();

        assert_eq!(failure.kind, FailureKind::ProcessError);
        assert_eq!(failure.cause.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn test_python_timeout() {
        if !has_interpreter("python3") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "python3.12",
            dir.path(),
            "handler.py",
            "import time\ndef handler(event, context):\n    time.sleep(30)\n",
        )
        .with_timeout(Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let outcome = strategy.run(json!({}), context()).await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ruby_echo() {
        if !has_interpreter("ruby") {
            eprintln!("ruby not available, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "ruby3.3",
            dir.path(),
            "handler.rb",
            "def handler(event:, context:)\n  puts 'noise'\n  { echo: event, id: context.aws_request_id }\nend\n",
        );

        let outcome = strategy.run(json!({"a": 1}), context()).await;
        assert_eq!(
            outcome,
            InvocationOutcome::Success(json!({"echo": {"a": 1}, "id": "x"}))
        );
    }

    #[tokio::test]
    async fn test_ruby_print_without_newline() {
        if !has_interpreter("ruby") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let strategy = script_strategy(
            "ruby3.3",
            dir.path(),
            "handler.rb",
            "def handler(event:, context:)\n  print 'progress...'\n  { ok: 1 }\nend\n",
        );

        let outcome = strategy.run(json!({}), context()).await;
        assert_eq!(outcome, InvocationOutcome::Success(json!({"ok": 1})));
    }

    #[test]
    fn test_prepend_venv_puts_venv_first() {
        let bin = if cfg!(windows) { "Scripts" } else { "bin" };
        let current = std::env::join_paths(["/usr/local/bin", "/usr/bin"]).unwrap();

        let path = prepend_venv(Some("/work/.venv".into()), Some(current)).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&path).collect();

        assert_eq!(
            entries,
            vec![
                PathBuf::from("/work/.venv").join(bin),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/bin"),
            ]
        );
    }

    #[test]
    fn test_prepend_venv_without_venv() {
        assert!(prepend_venv(None, Some("/usr/bin".into())).is_none());
        assert!(prepend_venv(None, None).is_none());

        let bin = if cfg!(windows) { "Scripts" } else { "bin" };
        let path = prepend_venv(Some("/venv".into()), None).unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert_eq!(entries, vec![PathBuf::from("/venv").join(bin)]);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let function = FunctionDefinition::new("script", "handler.handler", "python3.12");
        let runtime = ScriptRuntime {
            language: ScriptLanguage::Python,
            interpreter: "lambda-local-no-such-python".into(),
        };
        let strategy = SubprocessStrategy::new(function, runtime, HandlerRef::new("handler", "handler"));

        let outcome = strategy.run(json!({}), context()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::SpawnError));

        strategy.cleanup().await;
    }
}
