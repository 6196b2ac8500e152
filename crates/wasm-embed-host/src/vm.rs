//! The [`Vm`] facade.
//!
//! A `Vm` owns one engine and one store, registers the host modules enabled
//! in its [`Configuration`], and walks a single "active" module through
//! load, validate and instantiate before executing its exports:
//!
//! ```text
//! Empty ──load──► Loaded ──validate──► Validated ──instantiate──► Instantiated
//!   ▲                                                                  │
//!   └────────────────────────────── cleanup ───────────────────────────┘
//! ```
//!
//! Named modules registered alongside the active one stay in the store until
//! it is closed.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, instrument};

use wasm_embed_common::{ConfigFile, Configuration, HostRegistration, RuntimeError};
use wasm_embed_core::{
    AstModule, AsyncExecution, Executor, FunctionInstance, FunctionType, ImportModule, Loader,
    ModuleInstance, Statistics, Store, Validator, Value, WasmEngine,
};

use crate::linker::{HostModule, register_all};
use crate::process::{ProcessModule, ProcessPolicy};
use crate::wasi::WasiModule;

#[derive(Debug, Clone)]
enum Stage {
    Empty,
    Loaded(AstModule),
    Validated(AstModule),
    Instantiated(AstModule, ModuleInstance),
}

impl Stage {
    fn module(&self) -> Option<&AstModule> {
        match self {
            Self::Empty => None,
            Self::Loaded(module) | Self::Validated(module) | Self::Instantiated(module, _) => {
                Some(module)
            }
        }
    }
}

/// Engine, store and host modules bundled behind one API.
pub struct Vm {
    config: Configuration,
    engine: WasmEngine,
    loader: Loader,
    validator: Validator,
    executor: Executor,
    store: Store,
    hosts: BTreeMap<HostRegistration, HostModule>,
    stage: Stage,
}

impl Vm {
    /// Create a VM with the host modules enabled in `config`.
    ///
    /// The process module, if enabled, starts with nothing allowed.
    pub fn new(config: &Configuration) -> Result<Self, RuntimeError> {
        Self::with_policy(config, &ProcessPolicy::none())
    }

    /// Create a VM whose process module starts with `policy`.
    pub fn with_policy(config: &Configuration, policy: &ProcessPolicy) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(config)?;
        let store = Store::new(&engine)?;

        let hosts: BTreeMap<_, _> = register_all(&store, config, policy)?
            .into_iter()
            .map(|module| (module.kind(), module))
            .collect();

        info!(
            store_id = %store.id(),
            hosts = hosts.len(),
            "VM created"
        );

        Ok(Self {
            config: config.clone(),
            loader: Loader::new(&engine),
            validator: Validator::new(&engine),
            executor: Executor::new(&engine),
            engine,
            store,
            hosts,
            stage: Stage::Empty,
        })
    }

    /// Create a VM from a configuration file.
    ///
    /// Applies the process policy, initializes WASI with `program` as the
    /// first argument, and registers every listed module under its name.
    pub fn from_config_file(file: &ConfigFile, program: &str) -> Result<Self, RuntimeError> {
        let vm = Self::with_policy(&file.configuration, &ProcessPolicy::from(&file.process))?;

        if let Some(wasi) = vm.wasi() {
            let args: Vec<&str> = std::iter::once(program)
                .chain(file.wasi.args.iter().map(String::as_str))
                .collect();
            wasi.init(&args, &file.wasi.envs, &file.wasi.preopens)?;
        }

        for entry in &file.modules {
            vm.register_module_from_file(&entry.name, &entry.path)?;
        }

        Ok(vm)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn statistics(&self) -> &Statistics {
        self.executor.statistics()
    }

    /// Sub-API of a host module, or `None` if `kind` was not enabled.
    pub fn host_module(&self, kind: HostRegistration) -> Option<&HostModule> {
        self.hosts.get(&kind)
    }

    pub fn wasi(&self) -> Option<&WasiModule> {
        self.host_module(HostRegistration::Wasi)
            .and_then(HostModule::as_wasi)
    }

    pub fn process(&self) -> Option<&ProcessModule> {
        self.host_module(HostRegistration::Process)
            .and_then(HostModule::as_process)
    }

    // ==========================================================================
    // Active module
    // ==========================================================================

    /// Load the active module from a file.
    pub fn load_wasm_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let module = self.loader.parse_from_file(path)?;
        self.stage = Stage::Loaded(module);
        Ok(())
    }

    /// Load the active module from bytes.
    pub fn load_wasm_from_bytes(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        let module = self.loader.parse_from_buffer(bytes)?;
        self.stage = Stage::Loaded(module);
        Ok(())
    }

    /// Use an already parsed module as the active module.
    pub fn load_wasm_from_module(&mut self, module: &AstModule) {
        self.stage = Stage::Loaded(module.clone());
    }

    /// Validate the active module.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] if nothing is loaded, otherwise as
    /// [`Validator::validate`].
    pub fn validate(&mut self) -> Result<(), RuntimeError> {
        let module = self
            .stage
            .module()
            .cloned()
            .ok_or_else(|| RuntimeError::invalid_argument("no module loaded"))?;
        self.validator.validate(&module)?;
        self.stage = Stage::Validated(module);
        Ok(())
    }

    /// Instantiate the active module, anonymously.
    ///
    /// A module instantiated earlier stays alive in the store but is no
    /// longer reachable through [`Vm::execute`].
    pub fn instantiate(&mut self) -> Result<(), RuntimeError> {
        let module = self
            .stage
            .module()
            .cloned()
            .ok_or_else(|| RuntimeError::invalid_argument("no module loaded"))?;
        let instance = self.executor.instantiate(&self.store, &module)?;
        self.stage = Stage::Instantiated(module, instance);
        Ok(())
    }

    /// The instantiated active module, if any.
    pub fn active_module(&self) -> Option<&ModuleInstance> {
        match &self.stage {
            Stage::Instantiated(_, instance) => Some(instance),
            _ => None,
        }
    }

    /// Call an export of the active module.
    pub fn execute(&self, func_name: &str, params: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let function = self.active_function(func_name)?;
        let mut returns = Vec::new();
        self.executor.invoke(&function, params, &mut returns)?;
        Ok(returns)
    }

    /// Start an export of the active module on a worker.
    pub fn async_execute(&self, func_name: &str, params: Vec<Value>) -> Result<AsyncExecution, RuntimeError> {
        let function = self.active_function(func_name)?;
        Ok(self.executor.run_async(&function, params))
    }

    /// Load, validate, instantiate and call `func_name` in one step.
    #[instrument(skip(self, path, params), fields(path = %path.as_ref().display()))]
    pub fn run_wasm_from_file(
        &mut self,
        path: impl AsRef<Path>,
        func_name: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, RuntimeError> {
        self.load_wasm_from_file(path)?;
        self.prepare()?;
        self.execute(func_name, params)
    }

    /// As [`Vm::run_wasm_from_file`], from bytes.
    #[instrument(skip(self, bytes, params), fields(bytes_len = bytes.len()))]
    pub fn run_wasm_from_bytes(
        &mut self,
        bytes: &[u8],
        func_name: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, RuntimeError> {
        self.load_wasm_from_bytes(bytes)?;
        self.prepare()?;
        self.execute(func_name, params)
    }

    /// As [`Vm::run_wasm_from_file`], from a parsed module.
    pub fn run_wasm_from_module(
        &mut self,
        module: &AstModule,
        func_name: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, RuntimeError> {
        self.load_wasm_from_module(module);
        self.prepare()?;
        self.execute(func_name, params)
    }

    /// Load, validate and instantiate a file, then start `func_name` on a worker.
    pub fn async_run_wasm_from_file(
        &mut self,
        path: impl AsRef<Path>,
        func_name: &str,
        params: Vec<Value>,
    ) -> Result<AsyncExecution, RuntimeError> {
        self.load_wasm_from_file(path)?;
        self.prepare()?;
        self.async_execute(func_name, params)
    }

    /// As [`Vm::async_run_wasm_from_file`], from bytes.
    pub fn async_run_wasm_from_bytes(
        &mut self,
        bytes: &[u8],
        func_name: &str,
        params: Vec<Value>,
    ) -> Result<AsyncExecution, RuntimeError> {
        self.load_wasm_from_bytes(bytes)?;
        self.prepare()?;
        self.async_execute(func_name, params)
    }

    /// Exports of the active module with their types, sorted by name.
    pub fn function_list(&self) -> Vec<(String, FunctionType)> {
        self.active_module()
            .map(|instance| {
                instance
                    .functions()
                    .map(|f| (f.name().to_string(), f.ty().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Type of an export of the active module.
    pub fn function_type(&self, func_name: &str) -> Option<FunctionType> {
        self.active_module()
            .and_then(|instance| instance.function(func_name))
            .map(|f| f.ty().clone())
    }

    /// Forget the active module and reset statistics.
    ///
    /// Registered modules and host modules are kept.
    pub fn cleanup(&mut self) {
        self.stage = Stage::Empty;
        self.statistics().clear();
        debug!("VM cleaned up");
    }

    // ==========================================================================
    // Registered modules
    // ==========================================================================

    /// Load a file and register it under `name`.
    pub fn register_module_from_file(
        &self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<ModuleInstance, RuntimeError> {
        let module = self.loader.parse_from_file(path)?;
        self.register_module_from_module(name, &module)
    }

    /// Load bytes and register them under `name`.
    pub fn register_module_from_bytes(&self, name: &str, bytes: &[u8]) -> Result<ModuleInstance, RuntimeError> {
        let module = self.loader.parse_from_buffer(bytes)?;
        self.register_module_from_module(name, &module)
    }

    /// Validate a parsed module if needed and register it under `name`.
    pub fn register_module_from_module(
        &self,
        name: &str,
        module: &AstModule,
    ) -> Result<ModuleInstance, RuntimeError> {
        self.validator.validate(module)?;
        self.executor.register(&self.store, module, name)
    }

    /// Register a host-built import module under its own name.
    pub fn register_import(&self, import: &ImportModule) -> Result<ModuleInstance, RuntimeError> {
        self.executor.register_import(&self.store, import)
    }

    /// Call `func_name` exported by the module registered as `module_name`.
    pub fn execute_registered(
        &self,
        module_name: &str,
        func_name: &str,
        params: &[Value],
    ) -> Result<Vec<Value>, RuntimeError> {
        let mut returns = Vec::new();
        self.executor
            .invoke_registered(&self.store, module_name, func_name, params, &mut returns)?;
        Ok(returns)
    }

    /// Start a registered export on a worker.
    pub fn async_execute_registered(
        &self,
        module_name: &str,
        func_name: &str,
        params: Vec<Value>,
    ) -> Result<AsyncExecution, RuntimeError> {
        let function = self.registered_function(module_name, func_name)?;
        Ok(self.executor.run_async(&function, params))
    }

    /// Type of a registered export.
    pub fn function_type_registered(&self, module_name: &str, func_name: &str) -> Option<FunctionType> {
        self.store
            .module(module_name)
            .and_then(|instance| instance.function(func_name))
            .map(|f| f.ty().clone())
    }

    /// Release the store early. Later calls through old handles fail.
    pub fn close(&mut self) {
        self.stage = Stage::Empty;
        self.store.close();
    }

    fn prepare(&mut self) -> Result<(), RuntimeError> {
        self.validate()?;
        self.instantiate()
    }

    fn active_function(&self, func_name: &str) -> Result<FunctionInstance, RuntimeError> {
        let instance = self
            .active_module()
            .ok_or_else(|| RuntimeError::invalid_argument("no module instantiated"))?;
        instance
            .function(func_name)
            .ok_or_else(|| RuntimeError::function_not_found(func_name))
    }

    fn registered_function(&self, module_name: &str, func_name: &str) -> Result<FunctionInstance, RuntimeError> {
        self.store
            .module(module_name)
            .and_then(|instance| instance.function(func_name))
            .ok_or_else(|| RuntimeError::function_not_found(format!("{module_name}.{func_name}")))
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("store_id", &self.store.id())
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: &str = r#"
        (module
          (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
    "#;

    #[test]
    fn test_host_module_only_when_enabled() {
        let vm = Vm::new(&Configuration::default()).unwrap();
        assert!(vm.host_module(HostRegistration::Wasi).is_none());
        assert!(vm.process().is_none());

        let mut config = Configuration::default();
        config.add_host_registration(HostRegistration::Process);
        let vm = Vm::new(&config).unwrap();
        assert!(vm.wasi().is_none());
        assert!(vm.process().is_some());
    }

    #[test]
    fn test_with_policy_registers_every_host() {
        let mut config = Configuration::default();
        config.add_host_registration(HostRegistration::Wasi);
        config.add_host_registration(HostRegistration::Process);
        let policy = ProcessPolicy::builder().allow_command("echo").build();

        let vm = Vm::with_policy(&config, &policy).unwrap();
        assert!(vm.wasi().is_some());
        assert_eq!(
            vm.process().unwrap().allowed_commands().unwrap(),
            vec!["echo".to_string()]
        );
        assert_eq!(vm.store().module_count(), 2);
    }

    fn add_wasm() -> Vec<u8> {
        wat::parse_str(ADD).unwrap()
    }

    #[test]
    fn test_stage_errors() {
        let mut vm = Vm::new(&Configuration::default()).unwrap();

        assert!(vm.validate().unwrap_err().is_argument_error());
        assert!(vm.instantiate().unwrap_err().is_argument_error());
        assert!(vm.execute("add", &[]).unwrap_err().is_argument_error());

        vm.load_wasm_from_bytes(&add_wasm()).unwrap();
        let err = vm.instantiate().unwrap_err();
        assert!(matches!(err, RuntimeError::Validation { .. }));
    }

    #[test]
    fn test_run_and_list() {
        let mut vm = Vm::new(&Configuration::default()).unwrap();
        let returns = vm
            .run_wasm_from_bytes(&add_wasm(), "add", &[Value::I32(2), Value::I32(3)])
            .unwrap();
        assert_eq!(returns, vec![Value::I32(5)]);

        let list = vm.function_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0, "add");
        assert!(vm.function_type("add").is_some());
        assert!(vm.function_type("sub").is_none());
        assert!(vm.execute("sub", &[]).unwrap_err().is_not_found());

        vm.cleanup();
        assert!(vm.active_module().is_none());
        assert!(vm.function_list().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut vm = Vm::new(&Configuration::default()).unwrap();
        vm.register_module_from_bytes("math", &add_wasm()).unwrap();

        vm.close();
        vm.close();
        assert!(vm.store().is_closed());
        assert!(vm.execute_registered("math", "add", &[]).is_err());
    }
}
