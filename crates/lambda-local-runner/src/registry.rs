//! The Function Registry.
//!
//! Maps function names to their [`HandlerRunner`]s and is the surface the
//! surrounding system (CLI driver, routers) talks to.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use lambda_local_common::{
    FunctionDefinition, InvocationContext, InvocationOutcome, LambdaContext, RuntimeConfig,
    RuntimeError,
};
use lambda_local_core::WasmEngine;

use crate::host_env::HostEnvironment;
use crate::loader::{LoaderFactory, wasm_loader_factory};
use crate::runner::HandlerRunner;

/// Shared handle to a registered function's runner.
pub type RunnerHandle = Arc<HandlerRunner>;

/// Errors from registering functions.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A function with this name is already registered.
    #[error("Function '{name}' is already registered")]
    DuplicateFunction {
        /// The duplicated name.
        name: String,
    },

    /// The definition or runtime configuration is invalid.
    #[error(transparent)]
    InvalidConfig(#[from] RuntimeError),
}

/// Owns one Handler Runner per registered function.
pub struct FunctionRegistry {
    config: Arc<RuntimeConfig>,
    host: HostEnvironment,
    loader_factory: LoaderFactory,
    runners: DashMap<String, RunnerHandle>,
}

impl FunctionRegistry {
    /// Create a registry whose native handlers are WebAssembly modules.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine cannot
    /// be created.
    pub fn new(config: RuntimeConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let engine = WasmEngine::new(&config.engine)?;
        let factory = wasm_loader_factory(engine, config.execution.clone());
        Ok(Self::with_loader_factory(config, factory))
    }

    /// Create a registry with a custom loader factory.
    pub fn with_loader_factory(config: RuntimeConfig, loader_factory: LoaderFactory) -> Self {
        Self {
            config: Arc::new(config),
            host: HostEnvironment::default(),
            loader_factory,
            runners: DashMap::new(),
        }
    }

    /// Override the detected host environment.
    #[must_use]
    pub fn with_host(mut self, host: HostEnvironment) -> Self {
        self.host = host;
        self
    }

    /// The runtime configuration shared by every runner.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a function. Nothing is spawned until its first invocation.
    pub fn register(&self, function: FunctionDefinition) -> Result<RunnerHandle, RegistryError> {
        match self.runners.entry(function.name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateFunction {
                name: function.name,
            }),
            Entry::Vacant(slot) => {
                info!(
                    function = %function.name,
                    runtime = %function.runtime,
                    handler = %function.handler,
                    "Registered function"
                );
                let runner = Arc::new(HandlerRunner::new(
                    function,
                    Arc::clone(&self.config),
                    self.host.clone(),
                    Arc::clone(&self.loader_factory),
                )?);
                slot.insert(Arc::clone(&runner));
                Ok(runner)
            }
        }
    }

    /// Look up a registered function.
    pub fn get(&self, name: &str) -> Option<RunnerHandle> {
        self.runners.get(name).map(|runner| Arc::clone(runner.value()))
    }

    /// Names of all registered functions, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Invoke a function with a freshly built context.
    #[instrument(skip(self, handle, event), fields(function = %handle.function().name))]
    pub async fn invoke(&self, handle: &RunnerHandle, event: Value) -> InvocationOutcome {
        let function = handle.function();
        let context = LambdaContext::new(&function.name, function.memory_size_mb)
            .create(Uuid::new_v4().to_string(), function.timeout());
        handle.run(event, context).await
    }

    /// Invoke a function with a caller-provided context.
    pub async fn invoke_with_context(
        &self,
        handle: &RunnerHandle,
        event: Value,
        context: InvocationContext,
    ) -> InvocationOutcome {
        handle.run(event, context).await
    }

    /// Clean up a function's runner and unregister it.
    pub async fn shutdown(&self, handle: &RunnerHandle) {
        handle.cleanup().await;
        self.runners
            .remove_if(&handle.function().name, |_, runner| Arc::ptr_eq(runner, handle));
    }

    /// Clean up every runner. Registrations are kept.
    pub async fn cleanup_all(&self) {
        let runners: Vec<RunnerHandle> = self
            .runners
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();

        for runner in runners {
            runner.cleanup().await;
        }
        info!(count = self.runners.len(), "Cleaned up all functions");
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.runners.len())
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use lambda_local_common::FailureKind;
    use serde_json::json;

    use super::*;
    use crate::loader::testing::{FakeLoader, factory};

    fn registry(loader: &Arc<FakeLoader>) -> FunctionRegistry {
        FunctionRegistry::with_loader_factory(RuntimeConfig::default(), factory(loader))
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let loader = FakeLoader::new();
        loader.define("src/hello", |_, context| {
            Ok(json!({
                "function": context.function_name,
                "memory": context.memory_limit_in_mb,
                "request_id_len": context.aws_request_id.len(),
            }))
        });
        let registry = registry(&loader);

        let handle = tokio_test::assert_ok!(registry.register(
            FunctionDefinition::new("hello", "src/hello.handler", "wasm").with_memory_size_mb(256)
        ));

        let outcome = registry.invoke(&handle, json!({})).await;
        assert_eq!(
            outcome.result(),
            Some(&json!({"function": "hello", "memory": "256", "request_id_len": 36}))
        );
    }

    #[tokio::test]
    async fn test_invoke_with_context() {
        let loader = FakeLoader::new();
        loader.define("src/hello", |_, context| Ok(json!(context.aws_request_id)));
        let registry = registry(&loader);
        let handle = registry
            .register(FunctionDefinition::new("hello", "src/hello.handler", "wasm"))
            .unwrap();

        let context = InvocationContext {
            aws_request_id: "x".into(),
            ..Default::default()
        };
        let outcome = registry.invoke_with_context(&handle, json!({}), context).await;
        assert_eq!(outcome.result(), Some(&json!("x")));
    }

    #[test]
    fn test_duplicate_registration() {
        let loader = FakeLoader::new();
        let registry = registry(&loader);

        registry
            .register(FunctionDefinition::new("hello", "a.handler", "wasm"))
            .unwrap();
        let err = registry
            .register(FunctionDefinition::new("hello", "b.handler", "wasm"))
            .unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateFunction { ref name } if name == "hello"));
        assert_eq!(registry.get("hello").unwrap().function().handler, "a.handler");
    }

    #[test]
    fn test_invalid_handler_is_rejected() {
        let loader = FakeLoader::new();
        let registry = registry(&loader);

        let err = registry
            .register(FunctionDefinition::new("bad", "nodot", "wasm"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
        assert!(registry.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_names_get_and_shutdown() {
        let loader = FakeLoader::new();
        let registry = registry(&loader);

        registry
            .register(FunctionDefinition::new("b", "b.handler", "wasm"))
            .unwrap();
        let a = registry
            .register(FunctionDefinition::new("a", "a.handler", "wasm"))
            .unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);

        registry.shutdown(&a).await;
        assert!(registry.get("a").is_none());
        assert_eq!(registry.names(), vec!["b"]);

        registry.cleanup_all().await;
        registry.cleanup_all().await;
        assert_eq!(registry.names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_unsupported_runtime_registers_but_fails() {
        let loader = FakeLoader::new();
        let registry = registry(&loader);
        let handle = registry
            .register(FunctionDefinition::new("x", "h.handler", "unsupported-lang"))
            .unwrap();

        let outcome = registry.invoke(&handle, json!({})).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::UnsupportedRuntime));
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = RuntimeConfig::default();
        config.cache.cache_keep_pattern = "(".into();

        assert!(matches!(
            FunctionRegistry::new(config),
            Err(RegistryError::InvalidConfig(_))
        ));
    }
}
