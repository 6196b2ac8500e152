//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the embedding layer. It is:
//! - Thread-safe and shared by loaders, validators, stores and executors
//! - Built from a [`Configuration`] snapshot that cannot change afterwards
//! - Always set up with epoch interruption so executions can be cancelled

use std::sync::Arc;

use tracing::{debug, info};
use wasmparser::WasmFeatures;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use wasm_embed_common::{Configuration, EngineConfig, OptimizationLevel, Proposal, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Proposals**: every proposal with an engine switch follows the
///   configuration; the binary validator enforces the rest
/// - **Epoch Interruption**: always on, used for cooperative cancellation
/// - **Fuel Metering**: on when instruction counting, cost measuring or a
///   cost limit is configured
/// - **Pooling Allocator**: optional, for fast repeated instantiation
///
/// # Example
///
/// ```ignore
/// use wasm_embed_common::Configuration;
/// use wasm_embed_core::WasmEngine;
///
/// let engine = WasmEngine::new(&Configuration::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: Arc<Configuration>,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// The configuration is copied; later changes to `config` have no effect.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] if:
    /// - A proposal the engine cannot honor is enabled
    /// - The proposal combination is inconsistent
    /// - The pooling allocator cannot be initialized
    pub fn new(config: &Configuration) -> Result<Self, RuntimeError> {
        Self::check_proposals(config)?;

        let mut wasmtime_config = Config::new();

        // Cancellation hook for every store
        wasmtime_config.epoch_interruption(true);

        if config.statistics.needs_metering() {
            wasmtime_config.consume_fuel(true);
        }

        Self::apply_proposals(&mut wasmtime_config, config);

        wasmtime_config.cranelift_opt_level(match config.compiler.optimization_level {
            OptimizationLevel::O0 => wasmtime::OptLevel::None,
            OptimizationLevel::O1 | OptimizationLevel::O2 | OptimizationLevel::O3 => {
                wasmtime::OptLevel::Speed
            }
            OptimizationLevel::Os | OptimizationLevel::Oz => wasmtime::OptLevel::SpeedAndSize,
        });

        if config.compiler.dump_ir {
            let dir = std::env::temp_dir().join("wasm-embed-clif");
            debug!(dir = %dir.display(), "Dumping compiler IR");
            wasmtime_config.emit_clif(&dir);
        }

        if config.engine.pooling_allocator {
            let pooling_config = Self::create_pooling_config(&config.engine);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.engine.max_instances,
                instance_memory_mb = config.engine.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            proposals = config.proposals.len(),
            metering = config.statistics.needs_metering(),
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: Arc::new(config.clone()),
        })
    }

    fn check_proposals(config: &Configuration) -> Result<(), RuntimeError> {
        for unsupported in [Proposal::ExceptionHandling, Proposal::ComponentModel] {
            if config.has_proposal(unsupported) {
                return Err(RuntimeError::invalid_config(format!(
                    "proposal '{unsupported}' is not supported by the engine"
                )));
            }
        }
        if config.has_proposal(Proposal::Gc) && !config.has_proposal(Proposal::FunctionReferences)
        {
            return Err(RuntimeError::invalid_config(
                "proposal 'gc' requires 'function-references'",
            ));
        }
        Ok(())
    }

    fn apply_proposals(wasmtime_config: &mut Config, config: &Configuration) {
        let on = |p| config.has_proposal(p);
        wasmtime_config
            .wasm_multi_value(on(Proposal::MultiValue))
            .wasm_bulk_memory(on(Proposal::BulkMemoryOperations))
            .wasm_reference_types(on(Proposal::ReferenceTypes))
            .wasm_simd(on(Proposal::Simd))
            .wasm_relaxed_simd(on(Proposal::RelaxedSimd))
            .wasm_tail_call(on(Proposal::TailCall))
            .wasm_multi_memory(on(Proposal::MultiMemory))
            .wasm_extended_const(on(Proposal::ExtendedConst))
            .wasm_threads(on(Proposal::Threads))
            .wasm_memory64(on(Proposal::Memory64))
            .wasm_function_references(on(Proposal::FunctionReferences))
            .wasm_gc(on(Proposal::Gc));
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Binary-validator features matching the configured proposals.
    pub fn wasm_features(&self) -> WasmFeatures {
        let mut features = WasmFeatures::default();
        for proposal in Proposal::ALL {
            features.set(feature_flag(proposal), self.config.has_proposal(proposal));
        }
        features
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// The configuration snapshot this engine was built from.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Every running store re-checks its cancellation flag on the next
    /// function entry or loop back-edge.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.engine.pooling_allocator
    }

    /// Check if executions are metered with fuel.
    pub fn is_metering_enabled(&self) -> bool {
        self.config.statistics.needs_metering()
    }

    /// Whether two handles wrap the same engine.
    pub fn same(&self, other: &WasmEngine) -> bool {
        Engine::same(&self.engine, &other.engine)
    }
}

fn feature_flag(proposal: Proposal) -> WasmFeatures {
    match proposal {
        Proposal::ImportExportMutGlobals => WasmFeatures::MUTABLE_GLOBAL,
        Proposal::NonTrapFloatToIntConversions => WasmFeatures::SATURATING_FLOAT_TO_INT,
        Proposal::SignExtensionOperators => WasmFeatures::SIGN_EXTENSION,
        Proposal::MultiValue => WasmFeatures::MULTI_VALUE,
        Proposal::BulkMemoryOperations => WasmFeatures::BULK_MEMORY,
        Proposal::ReferenceTypes => WasmFeatures::REFERENCE_TYPES,
        Proposal::Simd => WasmFeatures::SIMD,
        Proposal::TailCall => WasmFeatures::TAIL_CALL,
        Proposal::MultiMemory => WasmFeatures::MULTI_MEMORY,
        Proposal::ExtendedConst => WasmFeatures::EXTENDED_CONST,
        Proposal::Threads => WasmFeatures::THREADS,
        Proposal::Memory64 => WasmFeatures::MEMORY64,
        Proposal::RelaxedSimd => WasmFeatures::RELAXED_SIMD,
        Proposal::FunctionReferences => WasmFeatures::FUNCTION_REFERENCES,
        Proposal::Gc => WasmFeatures::GC,
        Proposal::ExceptionHandling => WasmFeatures::EXCEPTIONS,
        Proposal::ComponentModel => WasmFeatures::COMPONENT_MODEL,
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("proposals", &self.config.proposals)
            .field("pooling_allocator", &self.config.engine.pooling_allocator)
            .field("metering", &self.is_metering_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let engine = WasmEngine::new(&Configuration::default());

        assert!(engine.is_ok());
        let engine = engine.unwrap();
        assert!(!engine.is_pooling_enabled());
        assert!(!engine.is_metering_enabled());
    }

    #[test]
    fn test_engine_keeps_a_snapshot() {
        let mut config = Configuration::default();
        let engine = WasmEngine::new(&config).unwrap();

        config.add_proposal(Proposal::TailCall);
        assert!(!engine.config().has_proposal(Proposal::TailCall));
    }

    #[test]
    fn test_engine_rejects_unsupported_proposals() {
        let mut config = Configuration::default();
        config.add_proposal(Proposal::ExceptionHandling);
        let err = WasmEngine::new(&config).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));

        let mut config = Configuration::default();
        config.add_proposal(Proposal::Gc);
        assert!(WasmEngine::new(&config).is_err());
    }

    #[test]
    fn test_metering_follows_statistics() {
        let mut config = Configuration::default();
        config.set_instruction_counting(true);
        let engine = WasmEngine::new(&config).unwrap();
        assert!(engine.is_metering_enabled());
    }

    #[test]
    fn test_wasm_features_follow_proposals() {
        let mut config = Configuration::default();
        config.remove_proposal(Proposal::Simd);
        config.add_proposal(Proposal::TailCall);
        let engine = WasmEngine::new(&config).unwrap();

        let features = engine.wasm_features();
        assert!(!features.contains(WasmFeatures::SIMD));
        assert!(features.contains(WasmFeatures::TAIL_CALL));
        assert!(features.contains(WasmFeatures::MULTI_VALUE));
    }

    #[test]
    fn test_engine_identity() {
        let a = WasmEngine::new(&Configuration::default()).unwrap();
        let b = WasmEngine::new(&Configuration::default()).unwrap();
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_engine_epoch_increment() {
        let engine = WasmEngine::new(&Configuration::default()).unwrap();

        // Should not panic
        engine.increment_epoch();
        engine.increment_epoch();
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&Configuration::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}
