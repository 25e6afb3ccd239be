//! Function definitions and handler references.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Default runtime when a definition does not declare one.
pub const DEFAULT_RUNTIME: &str = "wasm32-wasip1";

/// Default memory size in megabytes.
pub const DEFAULT_MEMORY_SIZE_MB: u32 = 1024;

/// Default function timeout in seconds (15 min).
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 900;

/// Region reported to handlers.
pub const DEFAULT_REGION: &str = "us-east-1";

/// A registered function. Immutable after registration.
///
/// # Example
///
/// ```toml
/// [[functions]]
/// name = "hello"
/// handler = "handlers/hello.handler"
/// runtime = "wasm32-wasip1"
/// memory_size_mb = 256
/// timeout_seconds = 6
///
/// [functions.environment]
/// GREETING = "hi"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Function identifier.
    pub name: String,

    /// Handler reference in `path/to/module.export` form.
    pub handler: String,

    /// Declared runtime identifier.
    #[serde(default = "defaults::runtime")]
    pub runtime: String,

    /// Memory limit in megabytes.
    #[serde(default = "defaults::memory_size_mb")]
    pub memory_size_mb: u32,

    /// Timeout in seconds.
    #[serde(default = "defaults::timeout_seconds")]
    pub timeout_seconds: u64,

    /// Environment variables visible to the handler.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl FunctionDefinition {
    /// Create a definition with default limits.
    pub fn new(
        name: impl Into<String>,
        handler: impl Into<String>,
        runtime: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            runtime: runtime.into(),
            memory_size_mb: DEFAULT_MEMORY_SIZE_MB,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            environment: BTreeMap::new(),
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the memory limit.
    #[must_use]
    pub fn with_memory_size_mb(mut self, megabytes: u32) -> Self {
        self.memory_size_mb = megabytes;
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Parse the handler reference.
    pub fn handler_ref(&self) -> Result<HandlerRef, RuntimeError> {
        HandlerRef::parse(&self.handler)
    }

    /// Environment seen by the handler: platform variables overlaid with
    /// the function's own map.
    pub fn lambda_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("AWS_LAMBDA_FUNCTION_NAME".to_string(), self.name.clone()),
            ("AWS_LAMBDA_FUNCTION_VERSION".to_string(), "$LATEST".to_string()),
            (
                "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
                self.memory_size_mb.to_string(),
            ),
            (
                "AWS_LAMBDA_FUNCTION_TIMEOUT".to_string(),
                self.timeout_seconds.to_string(),
            ),
            ("AWS_REGION".to_string(), DEFAULT_REGION.to_string()),
            ("_HANDLER".to_string(), self.handler.clone()),
            ("IS_OFFLINE".to_string(), "true".to_string()),
        ]);
        env.extend(self.environment.clone());
        env
    }
}

/// A parsed `path/to/module.export` handler reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerRef {
    /// Module path without the export suffix.
    pub path: PathBuf,
    /// Exported symbol name.
    pub export: String,
}

impl HandlerRef {
    /// Create a reference from its parts.
    pub fn new(path: impl Into<PathBuf>, export: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            export: export.into(),
        }
    }

    /// Parse a handler string; the last `.` separates the export name.
    pub fn parse(handler: &str) -> Result<Self, RuntimeError> {
        let Some((path, export)) = handler.rsplit_once('.') else {
            return Err(RuntimeError::invalid_handler(
                handler,
                "expected 'path/to/module.export'",
            ));
        };

        if path.is_empty() || export.is_empty() || export.contains(['/', '\\']) {
            return Err(RuntimeError::invalid_handler(
                handler,
                "expected 'path/to/module.export'",
            ));
        }

        Ok(Self::new(path, export))
    }

    /// Resolve the module file: the path as given, then with each extension
    /// appended, in order.
    pub fn resolve_file(&self, extensions: &[&str]) -> Option<PathBuf> {
        if self.path.is_file() {
            return Some(self.path.clone());
        }

        extensions
            .iter()
            .map(|ext| append_extension(&self.path, ext))
            .find(|candidate| candidate.is_file())
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Default value functions for serde.
mod defaults {
    pub fn runtime() -> String {
        super::DEFAULT_RUNTIME.to_string()
    }

    pub const fn memory_size_mb() -> u32 {
        super::DEFAULT_MEMORY_SIZE_MB
    }

    pub const fn timeout_seconds() -> u64 {
        super::DEFAULT_TIMEOUT_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handler_ref() {
        let handler = HandlerRef::parse("src/handlers/echo.handler").unwrap();
        assert_eq!(handler.path, PathBuf::from("src/handlers/echo"));
        assert_eq!(handler.export, "handler");

        let handler = HandlerRef::parse("./a.b/c.run").unwrap();
        assert_eq!(handler.path, PathBuf::from("./a.b/c"));
        assert_eq!(handler.export, "run");
    }

    #[test]
    fn test_parse_handler_ref_invalid() {
        assert!(HandlerRef::parse("no_export").is_err());
        assert!(HandlerRef::parse("trailing.").is_err());
        assert!(HandlerRef::parse(".leading").is_err());
        assert!(HandlerRef::parse("dir.v2/module").is_err());
    }

    #[test]
    fn test_resolve_file_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.wat"), "(module)").unwrap();

        let handler = HandlerRef::new(dir.path().join("echo"), "handler");
        assert_eq!(
            handler.resolve_file(&["wasm", "wat"]),
            Some(dir.path().join("echo.wat"))
        );

        let missing = HandlerRef::new(dir.path().join("nope"), "handler");
        assert!(missing.resolve_file(&["wasm", "wat"]).is_none());
    }

    #[test]
    fn test_definition_defaults() {
        let def: FunctionDefinition =
            toml::from_str("name = \"hello\"\nhandler = \"h.handler\"").unwrap();

        assert_eq!(def.runtime, DEFAULT_RUNTIME);
        assert_eq!(def.memory_size_mb, 1024);
        assert_eq!(def.timeout(), Duration::from_secs(900));
        assert!(def.environment.is_empty());
    }

    #[test]
    fn test_lambda_environment_overlay() {
        let def = FunctionDefinition::new("hello", "h.handler", "python3.12")
            .with_memory_size_mb(256)
            .with_env("GREETING", "hi")
            .with_env("AWS_REGION", "eu-west-1");
        let env = def.lambda_environment();

        assert_eq!(env["AWS_LAMBDA_FUNCTION_NAME"], "hello");
        assert_eq!(env["AWS_LAMBDA_FUNCTION_MEMORY_SIZE"], "256");
        assert_eq!(env["_HANDLER"], "h.handler");
        assert_eq!(env["GREETING"], "hi");
        // Function variables win over platform defaults.
        assert_eq!(env["AWS_REGION"], "eu-west-1");
    }
}
