//! Ahead-of-time compilation.
//!
//! Two output formats:
//! - `Native`: the engine's precompiled artifact, loadable only by a
//!   compatible engine
//! - `Wasm`: the original binary with the artifact appended as a custom
//!   section; engines that cannot use the artifact fall back to the bytes

use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument};
use wasm_encoder::{CustomSection, Encode, Section};

use crate::WasmEngine;
use crate::module::{Loader, Validator, find_aot_section};
use wasm_embed_common::{OutputFormat, RuntimeError};

/// Name of the custom section carrying embedded native code.
pub const AOT_SECTION_NAME: &str = "wasm-embed.aot";

/// Compiles modules ahead of time with the engine's settings.
#[derive(Debug, Clone)]
pub struct Compiler {
    engine: WasmEngine,
    loader: Loader,
    validator: Validator,
}

impl Compiler {
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
            loader: Loader::new(engine),
            validator: Validator::new(engine),
        }
    }

    /// Compile the module at `input` and write the artifact to `output`.
    ///
    /// # Errors
    ///
    /// Every failure, including unreadable or unwritable paths, is reported as
    /// [`RuntimeError::Compile`].
    #[instrument(
        skip(self, input, output),
        fields(input = %input.as_ref().display(), output = %output.as_ref().display())
    )]
    pub fn compile(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let input = input.as_ref();
        let output = output.as_ref();

        let bytes = std::fs::read(input).map_err(|e| {
            RuntimeError::compile(format!("failed to read {}: {e}", input.display()))
        })?;
        let artifact = self.compile_from_bytes(&bytes)?;
        std::fs::write(output, &artifact).map_err(|e| {
            RuntimeError::compile(format!("failed to write {}: {e}", output.display()))
        })?;

        Ok(())
    }

    /// Compile a module binary and return the artifact bytes.
    #[instrument(skip(self, bytes), fields(bytes_len = bytes.len()))]
    pub fn compile_from_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let start = Instant::now();

        let module = self
            .loader
            .parse_from_buffer(bytes)
            .map_err(|e| RuntimeError::compile(e.to_string()))?;
        let Some(wasm) = module.bytes() else {
            return Err(RuntimeError::compile("input is already a native artifact"));
        };
        if find_aot_section(wasm).is_some() {
            return Err(RuntimeError::compile("input already carries embedded native code"));
        }

        self.validator
            .validate(&module)
            .map_err(|e| RuntimeError::compile(e.to_string()))?;

        let native = self
            .engine
            .inner()
            .precompile_module(wasm)
            .map_err(|e| RuntimeError::compile(format!("{e:#}")))?;

        let format = self.engine.config().compiler.output_format;
        let artifact = match format {
            OutputFormat::Native => native,
            OutputFormat::Wasm => embed_native(wasm, &native),
        };

        info!(
            format = ?format,
            artifact_len = artifact.len(),
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(artifact)
    }
}

/// Append `native` to `wasm` as the AOT custom section.
fn embed_native(wasm: &[u8], native: &[u8]) -> Vec<u8> {
    let section = CustomSection {
        name: Cow::Borrowed(AOT_SECTION_NAME),
        data: Cow::Borrowed(native),
    };

    let mut out = Vec::with_capacity(wasm.len() + native.len() + 32);
    out.extend_from_slice(wasm);
    out.push(section.id());
    section.encode(&mut out);
    out
}
