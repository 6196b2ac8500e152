//! Configuration structures for wasm-embed.
//!
//! This module defines the [`Configuration`] record consumed when building the
//! engine, loader, validator and executor:
//! - [`Proposal`]: WebAssembly proposals that can be switched on or off
//! - [`HostRegistration`]: Host modules the VM registers automatically
//! - [`RuntimeLimits`], [`CompilerOptions`], [`StatisticsOptions`], [`EngineConfig`]
//!
//! Setters only touch this in-memory record. Nothing reaches the engine until a
//! `Configuration` is handed to an engine constructor, which keeps its own copy.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// WebAssembly proposals understood by the embedding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Proposal {
    ImportExportMutGlobals = 0,
    NonTrapFloatToIntConversions = 1,
    SignExtensionOperators = 2,
    MultiValue = 3,
    BulkMemoryOperations = 4,
    ReferenceTypes = 5,
    Simd = 6,
    TailCall = 7,
    MultiMemory = 8,
    ExtendedConst = 9,
    Threads = 10,
    Memory64 = 11,
    RelaxedSimd = 12,
    FunctionReferences = 13,
    Gc = 14,
    ExceptionHandling = 15,
    ComponentModel = 16,
}

impl Proposal {
    /// Every proposal, in ordinal order.
    pub const ALL: [Proposal; 17] = [
        Proposal::ImportExportMutGlobals,
        Proposal::NonTrapFloatToIntConversions,
        Proposal::SignExtensionOperators,
        Proposal::MultiValue,
        Proposal::BulkMemoryOperations,
        Proposal::ReferenceTypes,
        Proposal::Simd,
        Proposal::TailCall,
        Proposal::MultiMemory,
        Proposal::ExtendedConst,
        Proposal::Threads,
        Proposal::Memory64,
        Proposal::RelaxedSimd,
        Proposal::FunctionReferences,
        Proposal::Gc,
        Proposal::ExceptionHandling,
        Proposal::ComponentModel,
    ];

    /// Proposals enabled by a fresh [`Configuration`].
    pub const DEFAULTS: [Proposal; 7] = [
        Proposal::ImportExportMutGlobals,
        Proposal::NonTrapFloatToIntConversions,
        Proposal::SignExtensionOperators,
        Proposal::MultiValue,
        Proposal::BulkMemoryOperations,
        Proposal::ReferenceTypes,
        Proposal::Simd,
    ];

    /// Convert an integer ordinal back into a proposal.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for unknown ordinals.
    pub fn from_ordinal(ordinal: u32) -> Result<Self, RuntimeError> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| RuntimeError::invalid_config(format!("unknown proposal ordinal {ordinal}")))
    }

    /// The integer ordinal of this proposal.
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Stable kebab-case name, as used in configuration files.
    pub fn name(self) -> &'static str {
        match self {
            Proposal::ImportExportMutGlobals => "import-export-mut-globals",
            Proposal::NonTrapFloatToIntConversions => "non-trap-float-to-int-conversions",
            Proposal::SignExtensionOperators => "sign-extension-operators",
            Proposal::MultiValue => "multi-value",
            Proposal::BulkMemoryOperations => "bulk-memory-operations",
            Proposal::ReferenceTypes => "reference-types",
            Proposal::Simd => "simd",
            Proposal::TailCall => "tail-call",
            Proposal::MultiMemory => "multi-memory",
            Proposal::ExtendedConst => "extended-const",
            Proposal::Threads => "threads",
            Proposal::Memory64 => "memory64",
            Proposal::RelaxedSimd => "relaxed-simd",
            Proposal::FunctionReferences => "function-references",
            Proposal::Gc => "gc",
            Proposal::ExceptionHandling => "exception-handling",
            Proposal::ComponentModel => "component-model",
        }
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host modules a VM registers on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostRegistration {
    /// `wasi_snapshot_preview1`.
    Wasi = 0,
    /// Allowed-command process execution (`wasmedge_process`).
    Process = 1,
}

impl HostRegistration {
    /// Every registration kind, in ordinal order.
    pub const ALL: [HostRegistration; 2] = [HostRegistration::Wasi, HostRegistration::Process];

    /// Convert an integer ordinal back into a registration kind.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for unknown ordinals.
    pub fn from_ordinal(ordinal: u32) -> Result<Self, RuntimeError> {
        match ordinal {
            0 => Ok(HostRegistration::Wasi),
            1 => Ok(HostRegistration::Process),
            other => Err(RuntimeError::invalid_config(format!(
                "unknown host registration ordinal {other}"
            ))),
        }
    }

    /// The integer ordinal of this registration kind.
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Name of the import module the registration provides.
    pub fn module_name(self) -> &'static str {
        match self {
            HostRegistration::Wasi => "wasi_snapshot_preview1",
            HostRegistration::Process => "wasmedge_process",
        }
    }
}

/// AOT compiler optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizationLevel {
    /// Disable as many optimizations as possible.
    O0,
    /// Optimize quickly without destroying debuggability.
    O1,
    /// Optimize for fast execution without large compile-time growth.
    O2,
    /// Optimize for fast execution as much as possible.
    #[default]
    O3,
    /// Optimize for small code size.
    Os,
    /// Optimize for small code size as much as possible.
    Oz,
}

/// AOT compiler output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// The engine's native precompiled artifact.
    Native,
    /// The original WebAssembly binary with native code in a custom section.
    #[default]
    Wasm,
}

/// Top-level embedding configuration.
///
/// `Configuration` is a plain record. It can be built in code or loaded from
/// TOML through [`crate::ConfigFile`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Configuration {
    /// Enabled proposals.
    #[serde(default = "defaults::proposals")]
    pub proposals: BTreeSet<Proposal>,

    /// Host modules registered by the VM.
    #[serde(default)]
    pub host_registrations: BTreeSet<HostRegistration>,

    /// Resource limits applied to every store.
    #[serde(default)]
    pub runtime: RuntimeLimits,

    /// Compiler settings.
    #[serde(default)]
    pub compiler: CompilerOptions,

    /// Statistics collection.
    #[serde(default)]
    pub statistics: StatisticsOptions,

    /// Engine allocation settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            proposals: defaults::proposals(),
            host_registrations: BTreeSet::new(),
            runtime: RuntimeLimits::default(),
            compiler: CompilerOptions::default(),
            statistics: StatisticsOptions::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Configuration {
    /// Create a configuration with the default proposal set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a proposal.
    pub fn add_proposal(&mut self, proposal: Proposal) -> &mut Self {
        self.proposals.insert(proposal);
        self
    }

    /// Disable a proposal.
    pub fn remove_proposal(&mut self, proposal: Proposal) -> &mut Self {
        self.proposals.remove(&proposal);
        self
    }

    /// Whether a proposal is enabled. Unset proposals report `false`.
    pub fn has_proposal(&self, proposal: Proposal) -> bool {
        self.proposals.contains(&proposal)
    }

    /// Enable a host registration.
    pub fn add_host_registration(&mut self, host: HostRegistration) -> &mut Self {
        self.host_registrations.insert(host);
        self
    }

    /// Disable a host registration.
    pub fn remove_host_registration(&mut self, host: HostRegistration) -> &mut Self {
        self.host_registrations.remove(&host);
        self
    }

    /// Whether a host registration is enabled.
    pub fn has_host_registration(&self, host: HostRegistration) -> bool {
        self.host_registrations.contains(&host)
    }

    /// Set the maximum number of linear memory pages per memory.
    pub fn set_max_memory_pages(&mut self, pages: u32) -> &mut Self {
        self.runtime.max_memory_pages = pages;
        self
    }

    /// Maximum number of linear memory pages per memory.
    pub fn max_memory_pages(&self) -> u32 {
        self.runtime.max_memory_pages
    }

    /// Set the compiler optimization level.
    pub fn set_optimization_level(&mut self, level: OptimizationLevel) -> &mut Self {
        self.compiler.optimization_level = level;
        self
    }

    /// Set the AOT output format.
    pub fn set_output_format(&mut self, format: OutputFormat) -> &mut Self {
        self.compiler.output_format = format;
        self
    }

    /// Dump compiler IR while compiling.
    pub fn set_dump_ir(&mut self, dump: bool) -> &mut Self {
        self.compiler.dump_ir = dump;
        self
    }

    /// Compile for a generic CPU instead of the host's native features.
    pub fn set_generic_binary(&mut self, generic: bool) -> &mut Self {
        self.compiler.generic_binary = generic;
        self
    }

    /// Mark AOT artifacts as interruptible.
    pub fn set_interruptible(&mut self, interruptible: bool) -> &mut Self {
        self.compiler.interruptible = interruptible;
        self
    }

    /// Ignore precompiled code in loaded modules.
    pub fn set_ignore_precompiled(&mut self, ignore: bool) -> &mut Self {
        self.compiler.ignore_precompiled = ignore;
        self
    }

    /// Enable instruction counting.
    pub fn set_instruction_counting(&mut self, enabled: bool) -> &mut Self {
        self.statistics.instruction_counting = enabled;
        self
    }

    /// Enable cost measuring.
    pub fn set_cost_measuring(&mut self, enabled: bool) -> &mut Self {
        self.statistics.cost_measuring = enabled;
        self
    }

    /// Enable execution time measuring.
    pub fn set_time_measuring(&mut self, enabled: bool) -> &mut Self {
        self.statistics.time_measuring = enabled;
        self
    }

    /// Limit the total cost an execution may consume.
    pub fn set_cost_limit(&mut self, limit: u64) -> &mut Self {
        self.statistics.cost_limit = limit;
        self
    }
}

/// Resource limits applied to every store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuntimeLimits {
    /// Maximum pages (64 KiB each) a single linear memory may grow to.
    #[serde(default = "defaults::max_memory_pages")]
    pub max_memory_pages: u32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_memory_pages: defaults::max_memory_pages(),
        }
    }
}

/// Compiler settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct CompilerOptions {
    /// Optimization level.
    #[serde(default)]
    pub optimization_level: OptimizationLevel,

    /// AOT output format.
    #[serde(default)]
    pub output_format: OutputFormat,

    /// Emit compiler IR through the log while compiling.
    #[serde(default)]
    pub dump_ir: bool,

    /// Target a generic CPU instead of the host's native features.
    #[serde(default)]
    pub generic_binary: bool,

    /// Record that AOT artifacts were built to be interruptible.
    #[serde(default)]
    pub interruptible: bool,

    /// Refuse native artifacts and skip embedded AOT sections, so every
    /// module is compiled from its WebAssembly bytes.
    #[serde(default)]
    pub ignore_precompiled: bool,
}

/// Statistics collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatisticsOptions {
    /// Count executed instructions.
    #[serde(default)]
    pub instruction_counting: bool,

    /// Accumulate instruction and host-function cost.
    #[serde(default)]
    pub cost_measuring: bool,

    /// Measure wall-clock execution time.
    #[serde(default)]
    pub time_measuring: bool,

    /// Maximum total cost per execution.
    #[serde(default = "defaults::cost_limit")]
    pub cost_limit: u64,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        Self {
            instruction_counting: false,
            cost_measuring: false,
            time_measuring: false,
            cost_limit: defaults::cost_limit(),
        }
    }
}

impl StatisticsOptions {
    /// Whether any option needs the engine to meter execution.
    pub fn needs_metering(&self) -> bool {
        self.instruction_counting || self.cost_measuring || self.cost_limit != u64::MAX
    }
}

/// Engine allocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for fast instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instances.
    #[serde(default)]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: false,
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    use std::collections::BTreeSet;

    use super::Proposal;

    pub fn proposals() -> BTreeSet<Proposal> {
        Proposal::DEFAULTS.into_iter().collect()
    }

    pub const fn max_memory_pages() -> u32 {
        65536
    }

    pub const fn cost_limit() -> u64 {
        u64::MAX
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Configuration::default();

        for proposal in Proposal::DEFAULTS {
            assert!(config.has_proposal(proposal), "{proposal} should be on");
        }
        assert!(!config.has_proposal(Proposal::TailCall));
        assert!(!config.has_proposal(Proposal::Gc));
        assert!(!config.has_host_registration(HostRegistration::Wasi));

        assert_eq!(config.max_memory_pages(), 65536);
        assert_eq!(config.compiler.optimization_level, OptimizationLevel::O3);
        assert_eq!(config.compiler.output_format, OutputFormat::Wasm);
        assert!(!config.compiler.ignore_precompiled);
        assert_eq!(config.statistics.cost_limit, u64::MAX);
        assert!(!config.statistics.needs_metering());
        assert!(!config.engine.pooling_allocator);
    }

    #[test]
    fn test_setters_are_plain_mutation() {
        let mut config = Configuration::new();
        config
            .add_proposal(Proposal::TailCall)
            .remove_proposal(Proposal::Simd)
            .add_host_registration(HostRegistration::Wasi)
            .set_max_memory_pages(16)
            .set_instruction_counting(true);

        assert!(config.has_proposal(Proposal::TailCall));
        assert!(!config.has_proposal(Proposal::Simd));
        assert!(config.has_host_registration(HostRegistration::Wasi));
        assert_eq!(config.max_memory_pages(), 16);
        assert!(config.statistics.needs_metering());
    }

    #[test]
    fn test_proposal_ordinals() {
        for proposal in Proposal::ALL {
            assert_eq!(Proposal::from_ordinal(proposal.ordinal()).unwrap(), proposal);
        }
        let err = Proposal::from_ordinal(99).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_host_registration_ordinals() {
        assert_eq!(HostRegistration::from_ordinal(0).unwrap(), HostRegistration::Wasi);
        assert_eq!(HostRegistration::from_ordinal(1).unwrap(), HostRegistration::Process);
        assert!(HostRegistration::from_ordinal(2).is_err());
        assert_eq!(HostRegistration::Wasi.module_name(), "wasi_snapshot_preview1");
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Configuration::default();
        config.add_proposal(Proposal::Memory64);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Configuration = serde_json::from_str(&json).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"runtime": {"max_memory_pages": 8}, "host_registrations": ["wasi"]}"#;
        let config: Configuration = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_memory_pages(), 8);
        assert!(config.has_host_registration(HostRegistration::Wasi));
        // Defaults for unspecified fields
        assert!(config.has_proposal(Proposal::ReferenceTypes));
        assert_eq!(config.statistics.cost_limit, u64::MAX);
    }
}
