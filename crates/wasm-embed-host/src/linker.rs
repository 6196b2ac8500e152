//! Host module registration by [`HostRegistration`] kind.
//!
//! Each kind defines its guest imports in a [`Store`] under its own module
//! name and hands back a sub-API for configuring it from the host.

use tracing::debug;

use wasm_embed_common::{Configuration, HostRegistration, RuntimeError};
use wasm_embed_core::{ModuleInstance, Store};

use crate::process::{ProcessModule, ProcessPolicy};
use crate::wasi::WasiModule;

/// Sub-API of a registered host module.
#[derive(Debug, Clone)]
pub enum HostModule {
    Wasi(WasiModule),
    Process(ProcessModule),
}

impl HostModule {
    /// The registration kind this module came from.
    pub fn kind(&self) -> HostRegistration {
        match self {
            Self::Wasi(_) => HostRegistration::Wasi,
            Self::Process(_) => HostRegistration::Process,
        }
    }

    pub fn as_wasi(&self) -> Option<&WasiModule> {
        match self {
            Self::Wasi(module) => Some(module),
            Self::Process(_) => None,
        }
    }

    pub fn as_process(&self) -> Option<&ProcessModule> {
        match self {
            Self::Process(module) => Some(module),
            Self::Wasi(_) => None,
        }
    }
}

/// Register a single host module in `store`.
///
/// # Arguments
///
/// * `store` - The store to define the module in
/// * `kind` - Which host module to register
/// * `policy` - Allowed commands, used by [`HostRegistration::Process`] only
///
/// # Errors
///
/// [`RuntimeError::DuplicateName`] if the module name is already taken.
pub fn register_host(
    store: &Store,
    kind: HostRegistration,
    policy: &ProcessPolicy,
) -> Result<(HostModule, ModuleInstance), RuntimeError> {
    debug!(kind = ?kind, module = kind.module_name(), "Registering host module");
    match kind {
        HostRegistration::Wasi => {
            WasiModule::install(store).map(|(module, instance)| (HostModule::Wasi(module), instance))
        }
        HostRegistration::Process => ProcessModule::install(store, policy.clone())
            .map(|(module, instance)| (HostModule::Process(module), instance)),
    }
}

/// Register every host module enabled in `config`, in order.
pub fn register_all(
    store: &Store,
    config: &Configuration,
    policy: &ProcessPolicy,
) -> Result<Vec<HostModule>, RuntimeError> {
    config
        .host_registrations
        .iter()
        .map(|kind| register_host(store, *kind, policy).map(|(module, _)| module))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_embed_core::WasmEngine;

    fn store() -> Store {
        let engine = WasmEngine::new(&Configuration::default()).unwrap();
        Store::new(&engine).unwrap()
    }

    #[test]
    fn test_register_wasi() {
        let store = store();
        let (module, instance) = register_host(&store, HostRegistration::Wasi, &ProcessPolicy::none()).unwrap();

        assert_eq!(module.kind(), HostRegistration::Wasi);
        assert!(module.as_wasi().is_some());
        assert!(store.contains("wasi_snapshot_preview1"));
        assert!(instance.function("fd_write").is_some());
        assert!(instance.function("proc_exit").is_some());
    }

    #[test]
    fn test_register_process() {
        let store = store();
        let policy = ProcessPolicy::builder().allow_command("echo").build();
        let (module, instance) = register_host(&store, HostRegistration::Process, &policy).unwrap();

        let process = module.as_process().unwrap();
        assert_eq!(process.allowed_commands().unwrap(), vec!["echo".to_string()]);
        assert!(instance.function("wasmedge_process_run").is_some());
        assert_eq!(instance.function_names().len(), 11);
    }

    #[test]
    fn test_register_twice_is_duplicate() {
        let store = store();
        register_host(&store, HostRegistration::Process, &ProcessPolicy::none()).unwrap();

        let err = register_host(&store, HostRegistration::Process, &ProcessPolicy::none()).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateName { .. }));
    }

    #[test]
    fn test_register_all() {
        let store = store();
        let mut config = Configuration::default();
        config.add_host_registration(HostRegistration::Wasi);
        config.add_host_registration(HostRegistration::Process);

        let modules = register_all(&store, &config, &ProcessPolicy::none()).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(store.module_count(), 2);
    }
}
