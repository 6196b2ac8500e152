//! Common types, errors, and configuration for wasm-embed.
//!
//! This crate provides shared functionality used across the wasm-embed workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - The [`Configuration`] record and its TOML file form

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    CompilerOptions, Configuration, EngineConfig, HostRegistration, OptimizationLevel,
    OutputFormat, Proposal, RuntimeLimits, StatisticsOptions,
};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry, ProcessSection, WasiSection};
pub use error::{HostFunctionError, RuntimeError, WasiError};
