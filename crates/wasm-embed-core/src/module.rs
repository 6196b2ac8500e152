//! Loading and validating WebAssembly modules.
//!
//! This module provides:
//! - [`AstModule`]: a parsed module exposing its import and export descriptors
//! - [`Loader`]: parses binaries, text and AOT artifacts into an [`AstModule`]
//! - [`Validator`]: checks an [`AstModule`] against the configured proposals
//!   and compiles it for instantiation
//!
//! Parsing only checks structure. A module must pass [`Validator::validate`]
//! before it can be instantiated.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};
use wasmparser::{Encoding, Parser, Payload};
use wasmtime::{Engine, Module, Precompiled};

use crate::WasmEngine;
use crate::compiler::AOT_SECTION_NAME;
use crate::types::{DescriptorBuilder, ExportDescriptor, ExternalType, ImportDescriptor};
use wasm_embed_common::RuntimeError;

/// A parsed WebAssembly module.
///
/// Cloning is cheap; clones share the parsed data and the compiled artifact.
#[derive(Clone)]
pub struct AstModule {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    /// Original binary, absent for native AOT artifacts.
    bytes: Option<Vec<u8>>,
    imports: Vec<ImportDescriptor>,
    exports: Vec<ExportDescriptor>,
    content_hash: String,
    /// Set by validation, or at load time for AOT artifacts.
    compiled: RwLock<Option<Module>>,
}

impl AstModule {
    fn new(
        bytes: Option<Vec<u8>>,
        imports: Vec<ImportDescriptor>,
        exports: Vec<ExportDescriptor>,
        content_hash: String,
        compiled: Option<Module>,
    ) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                bytes,
                imports,
                exports,
                content_hash,
                compiled: RwLock::new(compiled),
            }),
        }
    }

    /// Parse a module from WebAssembly text.
    ///
    /// This is primarily for tests and tooling.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Parse`] if the text is malformed.
    pub fn from_wat(wat: &str) -> Result<Self, RuntimeError> {
        let bytes = wat::parse_str(wat).map_err(|e| RuntimeError::parse(e.to_string()))?;
        parse_binary(bytes)
    }

    /// Declared imports, in binary order.
    pub fn imports(&self) -> &[ImportDescriptor] {
        &self.inner.imports
    }

    /// Declared exports, in binary order.
    pub fn exports(&self) -> &[ExportDescriptor] {
        &self.inner.exports
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<&ExportDescriptor> {
        self.inner.exports.iter().find(|e| e.external_name == name)
    }

    /// The original binary, if the module was loaded from one.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.inner.bytes.as_deref()
    }

    /// Hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.inner.content_hash
    }

    /// Whether the module is ready for instantiation.
    pub fn is_validated(&self) -> bool {
        self.inner.compiled.read().is_some()
    }

    pub(crate) fn compiled(&self) -> Option<Module> {
        self.inner.compiled.read().clone()
    }

    fn set_compiled(&self, module: Module) {
        *self.inner.compiled.write() = Some(module);
    }
}

impl std::fmt::Debug for AstModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AstModule")
            .field("content_hash", &self.inner.content_hash)
            .field("imports", &self.inner.imports.len())
            .field("exports", &self.inner.exports.len())
            .field("validated", &self.is_validated())
            .finish_non_exhaustive()
    }
}

/// Parses modules from files and buffers.
#[derive(Debug, Clone)]
pub struct Loader {
    engine: WasmEngine,
}

impl Loader {
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
        }
    }

    /// Parse a module from a file.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] if the file cannot be read, [`RuntimeError::Parse`]
    /// if its contents are malformed.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn parse_from_file(&self, path: impl AsRef<Path>) -> Result<AstModule, RuntimeError> {
        let bytes = std::fs::read(path.as_ref())?;
        self.parse_from_buffer(&bytes)
    }

    /// Parse a module from bytes.
    ///
    /// Accepts a WebAssembly binary, a native AOT artifact produced by this
    /// engine, or a binary carrying an embedded AOT section.
    ///
    /// Precompiled code is native machine code and runs as loaded. wasmtime
    /// only checks that it came from a compatible engine, not that it matches
    /// the WebAssembly it claims to be. Load precompiled input from trusted
    /// sources only, or set `ignore_precompiled` in the compiler options.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Parse`] on malformed input.
    #[instrument(skip(self, bytes), fields(bytes_len = bytes.len()))]
    pub fn parse_from_buffer(&self, bytes: &[u8]) -> Result<AstModule, RuntimeError> {
        let start = Instant::now();

        let ignore_precompiled = self.engine.config().compiler.ignore_precompiled;
        if let Some(Precompiled::Module) = self.engine.inner().detect_precompiled(bytes) {
            if ignore_precompiled {
                return Err(RuntimeError::parse(
                    "native artifacts are disabled by ignore_precompiled",
                ));
            }
            let module = self.load_native(bytes)?;
            info!(
                duration_ms = start.elapsed().as_millis(),
                "Native AOT artifact loaded"
            );
            return Ok(module);
        }

        let module = parse_binary(bytes.to_vec())?;

        let embedded = if ignore_precompiled {
            None
        } else {
            find_aot_section(bytes)
        };
        if let Some(section) = embedded {
            match self.deserialize(section) {
                Ok(compiled) => {
                    debug!("Using embedded AOT code");
                    module.set_compiled(compiled);
                }
                Err(e) => warn!(error = %e, "Embedded AOT code rejected, using plain bytes"),
            }
        }

        info!(
            content_hash = %module.content_hash(),
            imports = module.imports().len(),
            exports = module.exports().len(),
            duration_ms = start.elapsed().as_millis(),
            "Module parsed"
        );

        Ok(module)
    }

    fn load_native(&self, bytes: &[u8]) -> Result<AstModule, RuntimeError> {
        let compiled = self.deserialize(bytes)?;

        let imports = compiled
            .imports()
            .map(|import| {
                Ok(ImportDescriptor {
                    module_name: import.module().to_owned(),
                    external_name: import.name().to_owned(),
                    ty: ExternalType::from_wasmtime(&import.ty())?,
                })
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        let exports = compiled
            .exports()
            .map(|export| {
                Ok(ExportDescriptor {
                    external_name: export.name().to_owned(),
                    ty: ExternalType::from_wasmtime(&export.ty())?,
                })
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;

        Ok(AstModule::new(
            None,
            imports,
            exports,
            compute_hash(bytes),
            Some(compiled),
        ))
    }

    /// Load a precompiled artifact.
    ///
    /// The engine checks that the artifact was produced by a compatible
    /// engine configuration before accepting it. The code itself is trusted.
    #[allow(unsafe_code)]
    fn deserialize(&self, bytes: &[u8]) -> Result<Module, RuntimeError> {
        // SAFETY: `bytes` may come from any loaded input; they are executed as
        // native code without validation. Loading precompiled input is the
        // caller's trust decision, and `ignore_precompiled` keeps this path
        // unreachable. wasmtime rejects artifacts from another version or
        // configuration.
        unsafe { Module::deserialize(self.engine.inner(), bytes) }
            .map_err(|e| RuntimeError::parse(format!("invalid AOT artifact: {e}")))
    }
}

/// Checks modules and compiles them for instantiation.
#[derive(Debug, Clone)]
pub struct Validator {
    engine: WasmEngine,
}

impl Validator {
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
        }
    }

    /// Validate a module.
    ///
    /// The module's imports, exports and bytes are unchanged. On success the
    /// compiled code is cached inside the module for instantiation.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Validation`] with the validator's reason.
    #[instrument(skip(self, module), fields(content_hash = %module.content_hash()))]
    pub fn validate(&self, module: &AstModule) -> Result<(), RuntimeError> {
        if let Some(compiled) = module.compiled() {
            if Engine::same(compiled.engine(), self.engine.inner()) {
                debug!("Module already validated");
                return Ok(());
            }
        }

        let Some(bytes) = module.bytes() else {
            return Err(RuntimeError::validation(
                "native AOT artifact belongs to a different engine",
            ));
        };

        let start = Instant::now();

        wasmparser::Validator::new_with_features(self.engine.wasm_features())
            .validate_all(bytes)
            .map_err(|e| RuntimeError::validation(e.to_string()))?;

        let compiled = Module::from_binary(self.engine.inner(), bytes)
            .map_err(|e| RuntimeError::validation(format!("{e:#}")))?;
        module.set_compiled(compiled);

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Module validated"
        );

        Ok(())
    }
}

/// Parse a binary's structure and collect its descriptors.
fn parse_binary(bytes: Vec<u8>) -> Result<AstModule, RuntimeError> {
    validate_wasm_header(&bytes)?;

    let mut builder = DescriptorBuilder::default();
    for payload in Parser::new(0).parse_all(&bytes) {
        let payload = payload.map_err(|e| RuntimeError::parse(e.to_string()))?;
        collect(&mut builder, payload)?;
    }

    let content_hash = compute_hash(&bytes);
    Ok(AstModule::new(
        Some(bytes),
        builder.imports,
        builder.exports,
        content_hash,
        None,
    ))
}

fn collect(builder: &mut DescriptorBuilder, payload: Payload<'_>) -> Result<(), RuntimeError> {
    let parse = |e: wasmparser::BinaryReaderError| RuntimeError::parse(e.to_string());

    match payload {
        Payload::Version { encoding, .. } => {
            if encoding != Encoding::Module {
                return Err(RuntimeError::parse("components are not supported"));
            }
        }
        Payload::TypeSection(reader) => {
            for group in reader {
                for sub in group.map_err(parse)?.into_types() {
                    match &sub.composite_type.inner {
                        wasmparser::CompositeInnerType::Func(f) => builder.add_type(Some(f))?,
                        _ => builder.add_type(None)?,
                    }
                }
            }
        }
        Payload::ImportSection(reader) => {
            for import in reader {
                builder.add_import(&import.map_err(parse)?)?;
            }
        }
        Payload::FunctionSection(reader) => {
            for type_index in reader {
                builder.add_function(type_index.map_err(parse)?);
            }
        }
        Payload::TableSection(reader) => {
            for table in reader {
                builder.add_table(&table.map_err(parse)?.ty)?;
            }
        }
        Payload::MemorySection(reader) => {
            for memory in reader {
                builder.add_memory(&memory.map_err(parse)?);
            }
        }
        Payload::GlobalSection(reader) => {
            for global in reader {
                builder.add_global(&global.map_err(parse)?.ty)?;
            }
        }
        Payload::ExportSection(reader) => {
            for export in reader {
                builder.add_export(&export.map_err(parse)?)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Validate WebAssembly header (magic number and version).
fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
    if bytes.len() < 8 {
        return Err(RuntimeError::parse("Invalid Wasm: file too small"));
    }

    if &bytes[0..4] != b"\0asm" {
        return Err(RuntimeError::parse("Invalid Wasm: bad magic number"));
    }

    Ok(())
}

/// Payload of the embedded AOT custom section, if present.
pub(crate) fn find_aot_section(bytes: &[u8]) -> Option<&[u8]> {
    for payload in Parser::new(0).parse_all(bytes) {
        if let Ok(Payload::CustomSection(reader)) = payload {
            if reader.name() == AOT_SECTION_NAME {
                return Some(reader.data());
            }
        }
    }
    None
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
    use crate::types::ExternalKind;
    use crate::value::ValueKind;
    use wasm_embed_common::{Configuration, Proposal};

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    const DESCRIBED: &str = r#"
        (module
            (import "extern" "func-add" (func (param externref i32) (result i32)))
            (import "env" "mem" (memory 1))
            (table (export "tab") 2 10 externref)
            (global (export "glob-mut-i32") (mut i32) (i32.const 0))
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
        )
    "#;

    fn engine() -> WasmEngine {
        WasmEngine::new(&Configuration::default()).unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(validate_wasm_header(&[0x00, 0x61]).is_err());

        let bad = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let err = validate_wasm_header(bad).unwrap_err();
        assert!(matches!(err, RuntimeError::Parse { .. }));
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    #[test]
    fn test_parse_minimal() {
        let module = Loader::new(&engine()).parse_from_buffer(MINIMAL_WASM).unwrap();
        assert!(module.imports().is_empty());
        assert!(module.exports().is_empty());
        assert!(!module.is_validated());
    }

    #[test]
    fn test_parse_truncated() {
        let mut bytes = wat::parse_str(DESCRIBED).unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = Loader::new(&engine()).parse_from_buffer(&bytes).unwrap_err();
        assert!(matches!(err, RuntimeError::Parse { .. }));
    }

    #[test]
    fn test_parse_missing_file() {
        let err = Loader::new(&engine())
            .parse_from_file("/nonexistent/module.wasm")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Io(_)));
    }

    #[test]
    fn test_descriptors() {
        let module = AstModule::from_wat(DESCRIBED).unwrap();

        let imports = module.imports();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].module_name, "extern");
        assert_eq!(imports[0].external_name, "func-add");
        match &imports[0].ty {
            ExternalType::Function(ty) => {
                assert_eq!(ty.params(), &[ValueKind::ExternRef, ValueKind::I32]);
                assert_eq!(ty.returns(), &[ValueKind::I32]);
            }
            other => panic!("unexpected import type {other:?}"),
        }
        assert_eq!(imports[1].ty.kind(), ExternalKind::Memory);

        let exports: Vec<_> = module
            .exports()
            .iter()
            .map(|e| (e.external_name.as_str(), e.ty.kind()))
            .collect();
        assert_eq!(
            exports,
            vec![
                ("tab", ExternalKind::Table),
                ("glob-mut-i32", ExternalKind::Global),
                ("add", ExternalKind::Function),
            ]
        );
        match &module.export("add").unwrap().ty {
            ExternalType::Function(ty) => assert_eq!(ty.to_string(), "(i32, i32) -> (i32)"),
            other => panic!("unexpected export type {other:?}"),
        }
    }

    #[test]
    fn test_validate_reports_reason() {
        // Type error: returns i64 from an i32 function
        let module = AstModule::from_wat(
            r#"(module (func (result i32) i64.const 1))"#,
        )
        .unwrap();

        let err = Validator::new(&engine()).validate(&module).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation { .. }));
        assert!(!module.is_validated());
    }

    #[test]
    fn test_validate_leaves_descriptors_unchanged() {
        let module = AstModule::from_wat(DESCRIBED).unwrap();
        let imports = module.imports().to_vec();
        let exports = module.exports().to_vec();

        Validator::new(&engine()).validate(&module).unwrap();

        assert!(module.is_validated());
        assert_eq!(module.imports(), imports.as_slice());
        assert_eq!(module.exports(), exports.as_slice());
    }

    #[test]
    fn test_validate_honors_proposals() {
        let wat = r#"(module (func (param i32) (result i32) local.get 0 i32.extend8_s))"#;
        let module = AstModule::from_wat(wat).unwrap();

        let mut config = Configuration::default();
        config.remove_proposal(Proposal::SignExtensionOperators);
        let strict = WasmEngine::new(&config).unwrap();
        assert!(Validator::new(&strict).validate(&module).is_err());

        Validator::new(&engine()).validate(&module).unwrap();
    }
}
