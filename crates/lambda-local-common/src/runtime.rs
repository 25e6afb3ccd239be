//! Runtime families.
//!
//! The host embeds a WebAssembly engine, so `wasm*` runtimes are native and can
//! run in-process, in an isolated process or in an isolated thread. Python and
//! Ruby runtimes are bridged through a short-lived interpreter subprocess.

use std::fmt;

/// Python runtime identifiers accepted for the subprocess bridge.
pub const SUPPORTED_PYTHON: &[&str] = &[
    "python2.7",
    "python3.6",
    "python3.7",
    "python3.8",
    "python3.9",
    "python3.10",
    "python3.11",
    "python3.12",
    "python3.13",
];

/// Ruby runtime identifiers accepted for the subprocess bridge.
pub const SUPPORTED_RUBY: &[&str] = &["ruby2.5", "ruby2.7", "ruby3.2", "ruby3.3"];

/// Languages with a subprocess adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptLanguage {
    /// CPython.
    Python,
    /// MRI Ruby.
    Ruby,
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => f.write_str("python"),
            Self::Ruby => f.write_str("ruby"),
        }
    }
}

/// A script runtime: language plus the interpreter executable to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptRuntime {
    /// Adapter language.
    pub language: ScriptLanguage,
    /// Interpreter executable name.
    pub interpreter: String,
}

/// Classification of a declared runtime identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeFamily {
    /// WebAssembly, executed by the host itself.
    Native,
    /// A language bridged through a subprocess.
    Script(ScriptRuntime),
}

impl RuntimeFamily {
    /// Classify a runtime identifier. Returns `None` when unsupported.
    pub fn classify(runtime: &str) -> Option<Self> {
        if runtime.starts_with("wasm") {
            return Some(Self::Native);
        }

        if SUPPORTED_PYTHON.contains(&runtime) {
            let interpreter = if cfg!(windows) {
                "python.exe".to_string()
            } else {
                // "python3.12" -> "python3"
                runtime.split('.').next().unwrap_or(runtime).to_string()
            };
            return Some(Self::Script(ScriptRuntime {
                language: ScriptLanguage::Python,
                interpreter,
            }));
        }

        if SUPPORTED_RUBY.contains(&runtime) {
            let interpreter = if cfg!(windows) { "ruby.exe" } else { "ruby" };
            return Some(Self::Script(ScriptRuntime {
                language: ScriptLanguage::Ruby,
                interpreter: interpreter.to_string(),
            }));
        }

        None
    }

    /// Returns `true` for the host's native family.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_native() {
        assert_eq!(RuntimeFamily::classify("wasm"), Some(RuntimeFamily::Native));
        assert!(RuntimeFamily::classify("wasm32-wasip1").unwrap().is_native());
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_python() {
        let family = RuntimeFamily::classify("python3.12").unwrap();
        assert_eq!(
            family,
            RuntimeFamily::Script(ScriptRuntime {
                language: ScriptLanguage::Python,
                interpreter: "python3".into(),
            })
        );

        let RuntimeFamily::Script(legacy) = RuntimeFamily::classify("python2.7").unwrap() else {
            panic!("expected script runtime");
        };
        assert_eq!(legacy.interpreter, "python2");
    }

    #[test]
    fn test_classify_ruby() {
        let Some(RuntimeFamily::Script(runtime)) = RuntimeFamily::classify("ruby3.3") else {
            panic!("expected script runtime");
        };
        assert_eq!(runtime.language, ScriptLanguage::Ruby);
    }

    #[test]
    fn test_classify_unsupported() {
        assert!(RuntimeFamily::classify("unsupported-lang").is_none());
        assert!(RuntimeFamily::classify("nodejs20.x").is_none());
        assert!(RuntimeFamily::classify("python4.0").is_none());
    }
}
