//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that remembers where the module came from and a hash of its source, so a
//! loader can tell an edited handler from a cached one.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use lambda_local_common::RuntimeError;

/// A compiled WebAssembly handler module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across stores.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original source bytes.
    content_hash: String,

    /// File the module was compiled from, if any.
    source_path: Option<PathBuf>,

    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from a `.wasm` binary or a `.wat` text file.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if the file does not exist, or a
    /// compilation error if its contents are not a valid module.
    #[instrument(skip(engine, path), fields(path = %path.as_ref().display()))]
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();

        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RuntimeError::module_not_found(path.display().to_string()),
            _ => RuntimeError::Io(e),
        })?;

        let mut compiled = if bytes.starts_with(b"\0asm") {
            Self::from_bytes(engine, &bytes)?
        } else {
            let text = std::str::from_utf8(&bytes).map_err(|_| {
                RuntimeError::compilation_failed(format!(
                    "{} is neither a Wasm binary nor UTF-8 text",
                    path.display()
                ))
            })?;
            Self::from_wat(engine, text)?
        };

        compiled.source_path = Some(path.to_path_buf());
        Ok(compiled)
    }

    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            source_path: None,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or compile.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            source_path: None,
            compiled_at: Instant::now(),
        })
    }

    /// Get the content hash of the original source.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the file this module was compiled from.
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Returns `true` if the module exports a function named `name`.
    pub fn exports_function(&self, name: &str) -> bool {
        self.module
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.module
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("source_path", &self.source_path)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use lambda_local_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(CompiledModule::validate_wasm_header(&[0x00, 0x61]).is_err());
        assert!(CompiledModule::validate_wasm_header(&[0, 0, 0, 0, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_module_compilation() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        assert!(!module.content_hash().is_empty());
        assert!(module.source_path().is_none());
    }

    #[test]
    fn test_from_file_wat_and_binary() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();

        let wat_path = dir.path().join("echo.wat");
        std::fs::write(&wat_path, r#"(module (func (export "handler")))"#).unwrap();
        let module = CompiledModule::from_file(engine.inner(), &wat_path).unwrap();
        assert_eq!(module.source_path(), Some(wat_path.as_path()));
        assert!(module.exports_function("handler"));
        assert!(!module.exports_function("missing"));

        let wasm_path = dir.path().join("empty.wasm");
        std::fs::write(&wasm_path, MINIMAL_WASM).unwrap();
        assert!(CompiledModule::from_file(engine.inner(), &wasm_path).is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let engine = engine();
        let err = CompiledModule::from_file(engine.inner(), "/no/such/module.wasm").unwrap_err();

        assert!(matches!(err, RuntimeError::ModuleNotFound { .. }));
        assert!(err.is_load_error());
    }

    #[test]
    fn test_from_wat_invalid() {
        let engine = engine();
        let err = CompiledModule::from_wat(engine.inner(), "(module (func").unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }
}
