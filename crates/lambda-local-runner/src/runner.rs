//! The Handler Runner: lazy, memoized strategy selection for one function.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use lambda_local_common::{
    ConfigError, Failure, FunctionDefinition, HandlerRef, InvocationContext, InvocationOutcome,
    RuntimeConfig, RuntimeError, RuntimeFamily, ScriptRuntime,
};

use crate::host_env::HostEnvironment;
use crate::loader::LoaderFactory;
use crate::strategy::{
    CachePolicy, ExecutionStrategy, InProcessStrategy, IsolatedProcessStrategy,
    IsolatedThreadStrategy, StrategyKind, SubprocessStrategy,
};

/// The strategy a function will use, decided before anything is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyPlan {
    /// Run in the host process.
    InProcess,
    /// Run in a persistent child process.
    IsolatedProcess,
    /// Run on a persistent worker thread.
    IsolatedThread,
    /// Bridge through an interpreter subprocess.
    CrossLanguage(ScriptRuntime),
}

impl StrategyPlan {
    /// The strategy kind this plan builds.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::InProcess => StrategyKind::InProcess,
            Self::IsolatedProcess => StrategyKind::IsolatedProcess,
            Self::IsolatedThread => StrategyKind::IsolatedThread,
            Self::CrossLanguage(_) => StrategyKind::CrossLanguageSubprocess,
        }
    }
}

/// Decide the strategy for `function`.
///
/// Native runtimes prefer isolated processes, then isolated threads (gated on
/// the host version), then in-process execution. Script runtimes always use
/// a subprocess.
pub fn select_strategy(
    config: &RuntimeConfig,
    function: &FunctionDefinition,
    host: &HostEnvironment,
) -> Result<StrategyPlan, ConfigError> {
    let family =
        RuntimeFamily::classify(&function.runtime).ok_or_else(|| ConfigError::UnsupportedRuntime {
            runtime: function.runtime.clone(),
        })?;

    match family {
        RuntimeFamily::Native if config.isolation.use_isolated_processes => {
            Ok(StrategyPlan::IsolatedProcess)
        }
        RuntimeFamily::Native if config.isolation.use_isolated_threads => {
            let required = &config.isolation.thread_min_host_version;
            if !host.satisfies(required) {
                return Err(ConfigError::UnsupportedHostVersion {
                    required: required.clone(),
                    found: host.version.clone(),
                });
            }
            Ok(StrategyPlan::IsolatedThread)
        }
        RuntimeFamily::Native => Ok(StrategyPlan::InProcess),
        RuntimeFamily::Script(script) => Ok(StrategyPlan::CrossLanguage(script)),
    }
}

type Selection = Result<Arc<dyn ExecutionStrategy>, ConfigError>;

/// Runs one function's invocations through a lazily selected strategy.
///
/// The strategy is chosen on the first `run` and never changes. A selection
/// error is memoized too, so an unsupported function fails every invocation
/// without spawning anything.
pub struct HandlerRunner {
    function: FunctionDefinition,
    handler: HandlerRef,
    config: Arc<RuntimeConfig>,
    host: HostEnvironment,
    loader_factory: LoaderFactory,
    cache: CachePolicy,
    selection: OnceLock<Selection>,
}

impl HandlerRunner {
    /// Create a runner. Nothing is selected or spawned yet.
    ///
    /// # Errors
    ///
    /// Fails if the handler reference is malformed or the cache keep pattern
    /// does not compile.
    pub fn new(
        function: FunctionDefinition,
        config: Arc<RuntimeConfig>,
        host: HostEnvironment,
        loader_factory: LoaderFactory,
    ) -> Result<Self, RuntimeError> {
        let handler = function.handler_ref()?;
        let cache = CachePolicy::from_config(&config.cache)?;

        Ok(Self {
            function,
            handler,
            config,
            host,
            loader_factory,
            cache,
            selection: OnceLock::new(),
        })
    }

    /// The function this runner serves.
    pub fn function(&self) -> &FunctionDefinition {
        &self.function
    }

    /// The selected strategy kind, if selection has happened and succeeded.
    pub fn selected_strategy(&self) -> Option<StrategyKind> {
        match self.selection.get() {
            Some(Ok(strategy)) => Some(strategy.kind()),
            _ => None,
        }
    }

    fn strategy(&self) -> &Selection {
        self.selection.get_or_init(|| {
            let plan = select_strategy(&self.config, &self.function, &self.host);
            match &plan {
                Ok(plan) => {
                    debug!(function = %self.function.name, strategy = %plan.kind(), "Selected strategy");
                }
                Err(e) => {
                    warn!(function = %self.function.name, error = %e, "No usable strategy");
                }
            }
            plan.map(|plan| self.build(plan))
        })
    }

    fn build(&self, plan: StrategyPlan) -> Arc<dyn ExecutionStrategy> {
        let function = self.function.clone();
        match plan {
            StrategyPlan::InProcess => Arc::new(InProcessStrategy::new(
                (self.loader_factory)(&function),
                self.handler.clone(),
                self.cache.clone(),
                function.timeout(),
            )),
            StrategyPlan::IsolatedProcess => {
                Arc::new(IsolatedProcessStrategy::new(function, &self.config))
            }
            StrategyPlan::IsolatedThread => Arc::new(IsolatedThreadStrategy::new(
                function,
                self.handler.clone(),
                Arc::clone(&self.loader_factory),
                self.cache.clone(),
            )),
            StrategyPlan::CrossLanguage(script) => Arc::new(SubprocessStrategy::new(
                function,
                script,
                self.handler.clone(),
            )),
        }
    }

    /// Run one invocation.
    pub async fn run(&self, event: Value, context: InvocationContext) -> InvocationOutcome {
        let strategy = match self.strategy() {
            Ok(strategy) => Arc::clone(strategy),
            Err(e) => return Failure::from(e.clone()).into(),
        };

        let request_id = context.aws_request_id.clone();
        let start = Instant::now();
        let outcome = strategy.run(event, context).await;
        let duration_ms = start.elapsed().as_millis();

        match outcome.failure() {
            None => info!(
                function = %self.function.name,
                request_id = %request_id,
                strategy = %strategy.kind(),
                duration_ms,
                "Invocation succeeded"
            ),
            Some(failure) => warn!(
                function = %self.function.name,
                request_id = %request_id,
                strategy = %strategy.kind(),
                duration_ms,
                kind = %failure.kind,
                error = %failure.message,
                "Invocation failed"
            ),
        }

        outcome
    }

    /// Release whatever the selected strategy owns. Safe to call repeatedly
    /// and before any invocation.
    pub async fn cleanup(&self) {
        if let Some(Ok(strategy)) = self.selection.get() {
            strategy.cleanup().await;
        }
    }
}

impl std::fmt::Debug for HandlerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRunner")
            .field("function", &self.function.name)
            .field("runtime", &self.function.runtime)
            .field("strategy", &self.selected_strategy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lambda_local_common::{FailureKind, ScriptLanguage};
    use serde_json::json;

    use super::*;
    use crate::loader::testing::FakeLoader;
    use crate::loader::ModuleLoader;

    fn config(processes: bool, threads: bool) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.isolation.use_isolated_processes = processes;
        config.isolation.use_isolated_threads = threads;
        config
    }

    fn native() -> FunctionDefinition {
        FunctionDefinition::new("native", "src/handler.handler", "wasm32-wasip1")
    }

    #[test]
    fn test_select_native_strategies() {
        let host = HostEnvironment::default();

        assert_eq!(
            select_strategy(&config(false, false), &native(), &host),
            Ok(StrategyPlan::InProcess)
        );
        assert_eq!(
            select_strategy(&config(true, false), &native(), &host),
            Ok(StrategyPlan::IsolatedProcess)
        );
        assert_eq!(
            select_strategy(&config(false, true), &native(), &host),
            Ok(StrategyPlan::IsolatedThread)
        );
        // Processes take precedence over threads.
        assert_eq!(
            select_strategy(&config(true, true), &native(), &host),
            Ok(StrategyPlan::IsolatedProcess)
        );
    }

    #[test]
    fn test_select_script_ignores_isolation() {
        let function = FunctionDefinition::new("py", "handler.main", "python3.12");
        let plan = select_strategy(&config(true, true), &function, &HostEnvironment::default());

        let Ok(StrategyPlan::CrossLanguage(script)) = &plan else {
            panic!("expected a cross-language plan, got {plan:?}");
        };
        assert_eq!(script.language, ScriptLanguage::Python);
    }

    #[test]
    fn test_select_unsupported_runtime() {
        let function = FunctionDefinition::new("x", "h.handler", "unsupported-lang");
        let err = select_strategy(&config(false, false), &function, &HostEnvironment::default())
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::UnsupportedRuntime {
                runtime: "unsupported-lang".into()
            }
        );
    }

    #[test]
    fn test_thread_gate() {
        let old_host = HostEnvironment::new("0.0.9");
        let err = select_strategy(&config(false, true), &native(), &old_host).unwrap_err();

        assert_eq!(err.failure_kind(), FailureKind::UnsupportedHostVersion);

        // The gate only applies to threads.
        assert_eq!(
            select_strategy(&config(false, false), &native(), &old_host),
            Ok(StrategyPlan::InProcess)
        );
    }

    fn counting_factory(loader: &Arc<FakeLoader>, built: &Arc<AtomicUsize>) -> LoaderFactory {
        let loader = Arc::clone(loader);
        let built = Arc::clone(built);
        Arc::new(move |_: &FunctionDefinition| {
            built.fetch_add(1, Ordering::SeqCst);
            Arc::clone(&loader) as Arc<dyn ModuleLoader>
        })
    }

    #[tokio::test]
    async fn test_selection_is_lazy_and_memoized() {
        let loader = FakeLoader::new();
        loader.define("src/handler", |event, _| Ok(event));
        let built = Arc::new(AtomicUsize::new(0));

        let runner = HandlerRunner::new(
            native(),
            Arc::new(config(false, false)),
            HostEnvironment::default(),
            counting_factory(&loader, &built),
        )
        .unwrap();

        assert_eq!(runner.selected_strategy(), None);
        assert_eq!(built.load(Ordering::SeqCst), 0);

        for n in 0..3 {
            let outcome = runner.run(json!({"n": n}), InvocationContext::default()).await;
            assert_eq!(outcome.result(), Some(&json!({"n": n})));
        }

        assert_eq!(runner.selected_strategy(), Some(StrategyKind::InProcess));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        runner.cleanup().await;
    }

    #[tokio::test]
    async fn test_unsupported_runtime_fails_every_call() {
        let loader = FakeLoader::new();
        let built = Arc::new(AtomicUsize::new(0));
        let function = FunctionDefinition::new("x", "h.handler", "unsupported-lang");

        let runner = HandlerRunner::new(
            function,
            Arc::new(config(true, false)),
            HostEnvironment::default(),
            counting_factory(&loader, &built),
        )
        .unwrap();

        for _ in 0..2 {
            let outcome = runner.run(json!({}), InvocationContext::default()).await;
            assert_eq!(outcome.failure_kind(), Some(FailureKind::UnsupportedRuntime));
        }

        assert_eq!(runner.selected_strategy(), None);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        runner.cleanup().await;
    }

    #[tokio::test]
    async fn test_old_host_rejects_threads_before_spawning() {
        let loader = FakeLoader::new();
        let built = Arc::new(AtomicUsize::new(0));

        let runner = HandlerRunner::new(
            native(),
            Arc::new(config(false, true)),
            HostEnvironment::new("0.0.9"),
            counting_factory(&loader, &built),
        )
        .unwrap();

        let outcome = runner.run(json!({}), InvocationContext::default()).await;
        let failure = outcome.failure().unwrap();

        assert_eq!(failure.kind, FailureKind::UnsupportedHostVersion);
        assert!(failure.message.contains("0.0.9"));
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_before_run() {
        let loader = FakeLoader::new();
        let built = Arc::new(AtomicUsize::new(0));
        let runner = HandlerRunner::new(
            native(),
            Arc::new(config(false, true)),
            HostEnvironment::default(),
            counting_factory(&loader, &built),
        )
        .unwrap();

        runner.cleanup().await;
        runner.cleanup().await;
        assert_eq!(runner.selected_strategy(), None);
    }

    #[test]
    fn test_invalid_handler_reference() {
        let loader = FakeLoader::new();
        let built = Arc::new(AtomicUsize::new(0));
        let function = FunctionDefinition::new("x", "no-export", "wasm");

        let err = HandlerRunner::new(
            function,
            Arc::new(RuntimeConfig::default()),
            HostEnvironment::default(),
            counting_factory(&loader, &built),
        )
        .unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidHandler { .. }));
    }
}
