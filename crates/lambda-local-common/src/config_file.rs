//! Configuration file structures for lambda-local.
//!
//! A configuration file holds the runtime settings and the functions to
//! register at startup. Runtime settings can be overridden with environment
//! variables using the `LAMBDA_LOCAL__` prefix and `__` as the nesting
//! separator, e.g. `LAMBDA_LOCAL__ISOLATION__USE_ISOLATED_PROCESSES=true`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{FunctionDefinition, RuntimeConfig};

/// Environment variable prefix for runtime overrides.
pub const ENV_PREFIX: &str = "LAMBDA_LOCAL";

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.isolation]
/// use_isolated_processes = true
///
/// [runtime.cache]
/// skip_cache_invalidation = false
/// cache_keep_pattern = "vendor"
///
/// [[functions]]
/// name = "hello"
/// handler = "./handlers/hello.handler"
/// runtime = "wasm32-wasip1"
/// timeout_seconds = 6
///
/// [[functions]]
/// name = "report"
/// handler = "./handlers/report.handler"
/// runtime = "python3.12"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Functions to register at startup.
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Load a file and apply `LAMBDA_LOCAL__*` environment overrides to its
    /// runtime section.
    ///
    /// Function definitions are taken from the file verbatim: environment
    /// variable names inside them are case-sensitive.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let mut file = Self::from_file(path)?;
        file.runtime = apply_env_overrides(&file.runtime, ENV_PREFIX)?;
        file.runtime
            .validate()
            .map_err(|e| ConfigFileError::Invalid {
                message: e.to_string(),
            })?;
        Ok(file)
    }
}

/// Layer environment variables with the given prefix over `base`.
pub fn apply_env_overrides(
    base: &RuntimeConfig,
    prefix: &str,
) -> Result<RuntimeConfig, ConfigFileError> {
    let layered = config::Config::builder()
        .add_source(config::Config::try_from(base)?)
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let runtime: RuntimeConfig = layered.try_deserialize()?;
    debug!(prefix, "Applied environment overrides");
    Ok(runtime)
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// Failed to layer environment overrides.
    #[error("Failed to apply configuration overrides: {0}")]
    Layering(#[from] config::ConfigError),

    /// Parsed configuration is not usable.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}
