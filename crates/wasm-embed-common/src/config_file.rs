//! Configuration file structures for wasm-embed.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`WasiSection`]: Arguments, environment and preopens for WASI
//! - [`ProcessSection`]: Commands the process host module may run
//! - [`ModuleEntry`]: Named module registered before the main module runs

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Configuration;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// proposals = ["simd", "bulk-memory-operations", "tail-call"]
/// host_registrations = ["wasi"]
///
/// [runtime]
/// max_memory_pages = 1024
///
/// [statistics]
/// instruction_counting = true
/// cost_limit = 10_000_000
///
/// [wasi]
/// args = ["--verbose"]
/// envs = ["RUST_LOG=debug"]
/// preopens = [".:."]
///
/// [process]
/// allowed_commands = ["echo"]
///
/// [[modules]]
/// name = "extern"
/// path = "./host.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Engine, compiler and statistics configuration.
    #[serde(flatten)]
    pub configuration: Configuration,

    /// WASI initialization values.
    #[serde(default)]
    pub wasi: WasiSection,

    /// Process host module settings.
    #[serde(default)]
    pub process: ProcessSection,

    /// Modules to register under a name before running.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let file = Self::from_toml(&content)?;
        debug!(
            path = %path.as_ref().display(),
            modules = file.modules.len(),
            "Configuration file loaded"
        );
        Ok(file)
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
}

/// WASI initialization values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WasiSection {
    /// Program arguments after the program name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment entries as `KEY=VALUE`.
    #[serde(default)]
    pub envs: Vec<String>,

    /// Preopened directories as `guest_path:host_path`.
    #[serde(default)]
    pub preopens: Vec<String>,
}

/// Process host module settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessSection {
    /// Commands guests may run. Empty means nothing is allowed.
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Allow every command. Takes precedence over `allowed_commands`.
    #[serde(default)]
    pub allow_all: bool,
}

/// A module registered under a name before the main module runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Import-module name other modules link against.
    pub name: String,

    /// Path to the WebAssembly module file.
    pub path: String,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostRegistration, OptimizationLevel, Proposal};

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.configuration, Configuration::default());
        assert!(config.wasi.args.is_empty());
        assert!(config.process.allowed_commands.is_empty());
        assert!(!config.process.allow_all);
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r"
            [runtime]
            max_memory_pages = 2
        ";

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.configuration.max_memory_pages(), 2);
        // Defaults applied
        assert!(config.configuration.has_proposal(Proposal::Simd));
        assert_eq!(config.configuration.statistics.cost_limit, u64::MAX);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            proposals = ["multi-value", "tail-call"]
            host_registrations = ["wasi", "process"]

            [runtime]
            max_memory_pages = 1024

            [compiler]
            optimization_level = "Oz"
            output_format = "native"

            [statistics]
            instruction_counting = true
            cost_limit = 5_000_000

            [engine]
            pooling_allocator = true
            max_instances = 500

            [wasi]
            args = ["a", "b"]
            envs = ["K=V"]
            preopens = [".:."]

            [process]
            allowed_commands = ["echo", "ls"]

            [[modules]]
            name = "extern"
            path = "./host.wasm"

            [[modules]]
            name = "util"
            path = "./util.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let c = &config.configuration;

        assert!(c.has_proposal(Proposal::TailCall));
        assert!(!c.has_proposal(Proposal::Simd));
        assert!(c.has_host_registration(HostRegistration::Process));
        assert_eq!(c.max_memory_pages(), 1024);
        assert_eq!(c.compiler.optimization_level, OptimizationLevel::Oz);
        assert!(c.statistics.instruction_counting);
        assert_eq!(c.statistics.cost_limit, 5_000_000);
        assert_eq!(c.engine.max_instances, 500);
        assert_eq!(config.wasi.args, vec!["a", "b"]);
        assert_eq!(config.wasi.preopens, vec![".:."]);
        assert_eq!(config.process.allowed_commands.len(), 2);
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.modules[0].name, "extern");
        assert_eq!(config.modules[1].path, "./util.wasm");
    }

    #[test]
    fn test_unknown_proposal_rejected() {
        let toml = r#"proposals = ["not-a-proposal"]"#;
        assert!(ConfigFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = ConfigFile::from_file("/nonexistent/wasm-embed.toml").unwrap_err();
        assert!(matches!(err, ConfigFileError::Io { .. }));
    }
}
