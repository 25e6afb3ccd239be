//! Module loading for native handlers.
//!
//! Every Handler Runner owns its own [`ModuleLoader`], obtained from a
//! [`LoaderFactory`]. The loader keeps a table of compiled modules keyed by
//! canonical source path; cache invalidation evicts entries whose path does
//! not match the keep pattern, so the next load reads the file again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use lambda_local_common::{
    ExecutionConfig, Failure, FailureKind, FunctionDefinition, HandlerRef, InvocationContext,
    RuntimeError,
};
use lambda_local_core::store::{InvocationSpec, create_store};
use lambda_local_core::{CompiledModule, ExecutionResult, InstanceRunner, WasmEngine};
use lambda_local_host::create_instance_runner;

/// Extensions tried, in order, when the handler path has none.
pub const MODULE_EXTENSIONS: &[&str] = &["wasm", "wat"];

/// A loaded handler, ready to be called.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoke the handler once.
    async fn call(&self, event: Value, context: &InvocationContext) -> Result<Value, Failure>;
}

/// Loads handlers and owns their module cache.
pub trait ModuleLoader: Send + Sync {
    /// Load the handler named by `handler`, compiling its module if it is not cached.
    fn load(&self, handler: &HandlerRef) -> Result<Arc<dyn Handler>, LoadFailure>;

    /// Evict every cached module whose path does not match `keep`. Returns the
    /// number of evicted entries.
    fn invalidate(&self, keep: &Regex) -> usize;

    /// Paths currently held in the cache.
    fn cached_paths(&self) -> Vec<PathBuf>;
}

/// Creates the loader of one function.
pub type LoaderFactory = Arc<dyn Fn(&FunctionDefinition) -> Arc<dyn ModuleLoader> + Send + Sync>;

/// A handler could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LoadFailure {
    /// Why loading failed.
    pub message: String,
}

impl LoadFailure {
    /// Create a load failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for LoadFailure {
    fn from(err: RuntimeError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<LoadFailure> for Failure {
    fn from(err: LoadFailure) -> Self {
        Failure::new(FailureKind::LoadError, err.message)
    }
}

/// A factory producing [`WasmModuleLoader`]s that share one engine.
pub fn wasm_loader_factory(engine: WasmEngine, execution: ExecutionConfig) -> LoaderFactory {
    Arc::new(move |definition: &FunctionDefinition| {
        Arc::new(WasmModuleLoader::new(
            engine.clone(),
            execution.clone(),
            definition,
        )) as Arc<dyn ModuleLoader>
    })
}

/// Loader for WebAssembly handler modules.
pub struct WasmModuleLoader {
    engine: WasmEngine,
    execution: ExecutionConfig,
    memory_limit_mb: u32,
    environment: Arc<BTreeMap<String, String>>,
    instance_runner: Mutex<Option<Arc<InstanceRunner>>>,
    modules: Mutex<HashMap<PathBuf, CompiledModule>>,
}

impl WasmModuleLoader {
    /// Create a loader for one function.
    pub fn new(engine: WasmEngine, execution: ExecutionConfig, definition: &FunctionDefinition) -> Self {
        Self {
            engine,
            execution,
            memory_limit_mb: definition.memory_size_mb,
            environment: Arc::new(definition.lambda_environment()),
            instance_runner: Mutex::new(None),
            modules: Mutex::new(HashMap::new()),
        }
    }

    fn instance_runner(&self) -> Result<Arc<InstanceRunner>, RuntimeError> {
        let mut slot = self.instance_runner.lock();
        if let Some(runner) = slot.as_ref() {
            return Ok(Arc::clone(runner));
        }

        let runner = Arc::new(create_instance_runner(&self.engine)?);
        *slot = Some(Arc::clone(&runner));
        Ok(runner)
    }

    fn module(&self, path: &Path) -> Result<CompiledModule, RuntimeError> {
        if let Some(module) = self.modules.lock().get(path) {
            debug!(path = %path.display(), "Module cache hit");
            return Ok(module.clone());
        }

        let module = CompiledModule::from_file(self.engine.inner(), path)?;
        self.modules.lock().insert(path.to_path_buf(), module.clone());
        Ok(module)
    }
}

impl ModuleLoader for WasmModuleLoader {
    #[instrument(skip(self, handler), fields(handler = %handler.path.display(), export = %handler.export))]
    fn load(&self, handler: &HandlerRef) -> Result<Arc<dyn Handler>, LoadFailure> {
        let file = handler
            .resolve_file(MODULE_EXTENSIONS)
            .ok_or_else(|| RuntimeError::module_not_found(handler.path.display().to_string()))?;
        let path = std::fs::canonicalize(&file).map_err(RuntimeError::Io)?;

        let module = self.module(&path)?;
        if !module.exports_function(&handler.export) {
            return Err(RuntimeError::export_not_found(&handler.export).into());
        }

        Ok(Arc::new(WasmHandler {
            engine: self.engine.clone(),
            execution: self.execution.clone(),
            runner: self.instance_runner()?,
            module,
            export: handler.export.clone(),
            memory_limit_mb: self.memory_limit_mb,
            environment: Arc::clone(&self.environment),
        }))
    }

    fn invalidate(&self, keep: &Regex) -> usize {
        let mut modules = self.modules.lock();
        let before = modules.len();
        modules.retain(|path, _| keep.is_match(&path.to_string_lossy()));
        before - modules.len()
    }

    fn cached_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.modules.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl fmt::Debug for WasmModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmModuleLoader")
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("cached", &self.modules.lock().len())
            .finish_non_exhaustive()
    }
}

/// A WebAssembly handler bound to a compiled module.
struct WasmHandler {
    engine: WasmEngine,
    execution: ExecutionConfig,
    runner: Arc<InstanceRunner>,
    module: CompiledModule,
    export: String,
    memory_limit_mb: u32,
    environment: Arc<BTreeMap<String, String>>,
}

#[async_trait]
impl Handler for WasmHandler {
    async fn call(&self, event: Value, context: &InvocationContext) -> Result<Value, Failure> {
        let event = serde_json::to_vec(&event)
            .map_err(|e| Failure::protocol(format!("Failed to encode event: {e}")))?;
        let context_bytes = serde_json::to_vec(context)
            .map_err(|e| Failure::protocol(format!("Failed to encode context: {e}")))?;

        let spec = InvocationSpec {
            request_id: context.aws_request_id.clone(),
            memory_limit_mb: Some(self.memory_limit_mb),
            environment: (*self.environment).clone(),
            deadline_ms: context.deadline_ms,
        };
        let mut store = create_store(&self.engine, &self.execution, spec)?;

        let result = self
            .runner
            .invoke(&self.module, &mut store, &self.export, &event, &context_bytes)
            .await?;

        let metrics = &store.data().metrics;
        debug!(
            request_id = %context.aws_request_id,
            success = result.is_success(),
            trapped = result.is_trap(),
            fuel_consumed = metrics.fuel_consumed,
            memory_used_bytes = metrics.memory_used_bytes,
            duration_ms = metrics.duration.map_or(0, |d| d.as_millis()),
            "Wasm handler finished"
        );

        match result {
            ExecutionResult::Success { output } if output.is_empty() => Ok(Value::Null),
            ExecutionResult::Success { output } => serde_json::from_slice(&output).map_err(|e| {
                Failure::from(RuntimeError::InvalidOutput {
                    reason: e.to_string(),
                })
            }),
            ExecutionResult::Failed { message } => Err(Failure::handler_error(message)),
            ExecutionResult::Trap { message, code } => {
                let failure = Failure::handler_error(message);
                Err(match code {
                    Some(code) => failure.with_cause(code),
                    None => failure,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable in-memory loader.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    type Behavior = Arc<dyn Fn(Value, &InvocationContext) -> Result<Value, Failure> + Send + Sync>;

    /// Serves handlers from an in-memory table of `path -> behavior`.
    #[derive(Default)]
    pub struct FakeLoader {
        sources: Mutex<HashMap<PathBuf, Behavior>>,
        cache: Mutex<HashMap<PathBuf, Behavior>>,
        pub loads: AtomicUsize,
    }

    impl FakeLoader {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Set (or replace) the "on-disk" source for `path`.
        pub fn define(
            &self,
            path: impl Into<PathBuf>,
            behavior: impl Fn(Value, &InvocationContext) -> Result<Value, Failure>
            + Send
            + Sync
            + 'static,
        ) {
            self.sources.lock().insert(path.into(), Arc::new(behavior));
        }

        pub fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    struct FakeHandler(Behavior);

    #[async_trait]
    impl Handler for FakeHandler {
        async fn call(&self, event: Value, context: &InvocationContext) -> Result<Value, Failure> {
            (self.0)(event, context)
        }
    }

    impl ModuleLoader for FakeLoader {
        fn load(&self, handler: &HandlerRef) -> Result<Arc<dyn Handler>, LoadFailure> {
            if let Some(behavior) = self.cache.lock().get(&handler.path) {
                return Ok(Arc::new(FakeHandler(Arc::clone(behavior))));
            }

            let behavior = self
                .sources
                .lock()
                .get(&handler.path)
                .cloned()
                .ok_or_else(|| LoadFailure::new(format!("no module at {}", handler.path.display())))?;
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.cache
                .lock()
                .insert(handler.path.clone(), Arc::clone(&behavior));
            Ok(Arc::new(FakeHandler(behavior)))
        }

        fn invalidate(&self, keep: &Regex) -> usize {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|path, _| keep.is_match(&path.to_string_lossy()));
            before - cache.len()
        }

        fn cached_paths(&self) -> Vec<PathBuf> {
            self.cache.lock().keys().cloned().collect()
        }
    }

    /// A factory handing the same fake loader to every function.
    pub fn factory(loader: &Arc<FakeLoader>) -> LoaderFactory {
        let loader = Arc::clone(loader);
        Arc::new(move |_: &FunctionDefinition| Arc::clone(&loader) as Arc<dyn ModuleLoader>)
    }
}
