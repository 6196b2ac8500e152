//! Instantiation and synchronous invocation.
//!
//! The [`Executor`] handles:
//!
//! 1. Resolving a module's imports against a store and running its start function
//! 2. Binding instances and host-built import modules under a name
//! 3. Checking arguments against a function's signature before entering the engine
//! 4. Classifying engine failures into [`RuntimeError`] variants
//! 5. Updating [`Statistics`] around each call

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use wasmtime::{Engine, Linker, RootScope, Trap, Val};

use crate::async_exec::AsyncExecution;
use crate::host_func::ImportModule;
use crate::instance::{FunctionInstance, ModuleInstance};
use crate::module::AstModule;
use crate::statistics::Statistics;
use crate::store::{HostState, Store, calculate_fuel_consumed};
use crate::value::{Value, from_wasm, kinds_to_string, to_wasm};
use crate::WasmEngine;
use wasm_embed_common::RuntimeError;

/// Instantiates modules and invokes functions on one engine.
///
/// Cloning is cheap; clones share statistics.
#[derive(Clone)]
pub struct Executor {
    engine: WasmEngine,
    statistics: Statistics,
}

impl Executor {
    pub fn new(engine: &WasmEngine) -> Self {
        Self {
            engine: engine.clone(),
            statistics: Statistics::new(&engine.config().statistics),
        }
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Instantiate `module` in `store` without registering it.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Validation`] if the module was never validated
    /// - [`RuntimeError::Link`] if an import cannot be resolved
    /// - [`RuntimeError::Trap`] if the start function traps
    /// - [`RuntimeError::InvalidArgument`] if the store belongs to another engine
    #[instrument(skip(self, store, module), fields(store_id = %store.id(), module_hash = %module.content_hash()))]
    pub fn instantiate(&self, store: &Store, module: &AstModule) -> Result<ModuleInstance, RuntimeError> {
        self.check_store(store)?;
        self.instantiate_in(store, module, None)
    }

    /// Instantiate `module` and bind it under `name`.
    ///
    /// Later modules can import its exports by that name.
    ///
    /// # Errors
    ///
    /// As [`Executor::instantiate`], plus [`RuntimeError::DuplicateName`] if
    /// `name` is taken. The earlier instance stays registered unchanged.
    #[instrument(skip(self, store, module), fields(store_id = %store.id()))]
    pub fn register(
        &self,
        store: &Store,
        module: &AstModule,
        name: &str,
    ) -> Result<ModuleInstance, RuntimeError> {
        self.check_store(store)?;
        if store.contains(name) {
            return Err(RuntimeError::duplicate_name(name));
        }
        let instance = self.instantiate_in(store, module, Some(name))?;
        store.publish(name, &instance)?;

        info!(module = name, "Module registered");
        Ok(instance)
    }

    /// Bind a host-built import module under its own name.
    #[instrument(skip(self, store, import), fields(module = import.name()))]
    pub fn register_import(
        &self,
        store: &Store,
        import: &ImportModule,
    ) -> Result<ModuleInstance, RuntimeError> {
        self.check_store(store)?;
        store.install_host(import.name(), |linker, ctx| Ok(import.define(linker, ctx)?))
    }

    /// Call `function` with `params`, replacing the contents of `returns`.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::SignatureMismatch`] if `params` do not match the
    ///   declared parameters; the engine is not entered
    /// - [`RuntimeError::FunctionNotFound`] if the function's store was closed
    /// - [`RuntimeError::InvalidArgument`] if the function belongs to another
    ///   engine or a `funcref` is unknown to its store
    /// - [`RuntimeError::Trap`] on a runtime fault
    /// - [`RuntimeError::CostLimitExceeded`] if the cost limit is reached
    #[instrument(skip(self, function, params, returns), fields(function = function.name()))]
    pub fn invoke(
        &self,
        function: &FunctionInstance,
        params: &[Value],
        returns: &mut Vec<Value>,
    ) -> Result<(), RuntimeError> {
        self.invoke_with_cancel(function, params, returns, None)
    }

    /// Look up `module_name.func_name` in `store` and call it.
    pub fn invoke_registered(
        &self,
        store: &Store,
        module_name: &str,
        func_name: &str,
        params: &[Value],
        returns: &mut Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let function = store
            .module(module_name)
            .and_then(|m| m.function(func_name))
            .ok_or_else(|| RuntimeError::function_not_found(format!("{module_name}.{func_name}")))?;
        self.invoke(&function, params, returns)
    }

    /// Start `function` on a worker and return at once.
    pub fn run_async(&self, function: &FunctionInstance, params: Vec<Value>) -> AsyncExecution {
        AsyncExecution::spawn(self.clone(), function.clone(), params)
    }

    pub(crate) fn invoke_with_cancel(
        &self,
        function: &FunctionInstance,
        params: &[Value],
        returns: &mut Vec<Value>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<(), RuntimeError> {
        check_signature(function, params)?;

        let inner = function.store()?;
        if !self.engine.same(inner.engine()) {
            return Err(RuntimeError::invalid_argument(
                "function belongs to a store of another engine",
            ));
        }

        let mut guard = inner.context().lock();
        let ctx = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::function_not_found(function.name()))?;

        ctx.data_mut().set_cancel(cancel);
        ctx.data_mut().take_host_cost();
        ctx.set_epoch_deadline(1);
        if ctx.data().cancel_requested() {
            ctx.data_mut().set_cancel(None);
            return Err(interrupted());
        }

        let fuel = self.arm_fuel(ctx)?;
        let start = Instant::now();
        let outcome = call(ctx, function, params);
        let elapsed = start.elapsed();

        let consumed = fuel.map_or(0, |initial| calculate_fuel_consumed(initial, ctx));
        let host_cost = ctx.data_mut().take_host_cost();
        ctx.data_mut().set_cancel(None);
        if self.engine.is_metering_enabled() || self.engine.config().statistics.time_measuring {
            self.statistics.record(consumed, host_cost, elapsed);
        }

        match outcome? {
            Ok(values) => {
                debug!(
                    duration_ms = elapsed.as_millis() as u64,
                    fuel_consumed = consumed,
                    "Invocation completed"
                );
                *returns = values;
                Ok(())
            }
            Err(error) => {
                if let Some(exit) = error.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    info!(exit_code = exit.0, "Guest exited");
                    ctx.data_mut().record_exit(exit.0);
                    *returns = function
                        .ty()
                        .returns()
                        .iter()
                        .map(|k| Value::default_for(*k))
                        .collect();
                    return Ok(());
                }
                let err = self.classify(error, RuntimeError::engine);
                warn!(error = %err, "Invocation failed");
                Err(err)
            }
        }
    }

    fn instantiate_in(
        &self,
        store: &Store,
        module: &AstModule,
        name: Option<&str>,
    ) -> Result<ModuleInstance, RuntimeError> {
        let compiled = module
            .compiled()
            .ok_or_else(|| RuntimeError::validation("module has not been validated"))?;
        if !Engine::same(compiled.engine(), self.engine.inner()) {
            return Err(RuntimeError::invalid_argument(
                "module was validated by another engine",
            ));
        }

        let inner = store.inner();
        let mut linker = inner.linker().lock();
        let mut guard = inner.context().lock();
        let ctx = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::invalid_argument("store has been closed"))?;

        if let Some(name) = name {
            store.check_name_free(&linker, ctx, name)?;
        }

        let start = Instant::now();
        self.arm_fuel(ctx)?;
        let instance = linker
            .instantiate(&mut *ctx, &compiled)
            .map_err(|e| self.classify(e, RuntimeError::link))?;

        if let Some(name) = name {
            define_instance(&mut linker, ctx, name, instance)?;
        }

        let items: Vec<(String, wasmtime::Extern)> = instance
            .exports(&mut *ctx)
            .map(|export| (export.name().to_owned(), export.into_extern()))
            .collect();
        let result = ModuleInstance::from_externs(name, items, ctx, store.weak())?;

        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            functions = result.function_names().len(),
            "Module instantiated"
        );
        Ok(result)
    }

    fn check_store(&self, store: &Store) -> Result<(), RuntimeError> {
        if self.engine.same(store.engine()) {
            Ok(())
        } else {
            Err(RuntimeError::invalid_argument(
                "store belongs to another engine",
            ))
        }
    }

    /// Give the store its fuel budget, returning it when metering is on.
    fn arm_fuel(&self, ctx: &mut wasmtime::Store<HostState>) -> Result<Option<u64>, RuntimeError> {
        if !self.engine.is_metering_enabled() {
            return Ok(None);
        }
        let budget = self.statistics.fuel_budget();
        ctx.set_fuel(budget)
            .map_err(|e| RuntimeError::engine(format!("Failed to set fuel: {e}")))?;
        Ok(Some(budget))
    }

    /// Map an engine error onto the error taxonomy.
    fn classify(
        &self,
        error: wasmtime::Error,
        fallback: fn(String) -> RuntimeError,
    ) -> RuntimeError {
        if let Some(trap) = error.downcast_ref::<Trap>() {
            if *trap == Trap::OutOfFuel {
                return RuntimeError::CostLimitExceeded {
                    limit: self.statistics.cost_limit(),
                };
            }
            return RuntimeError::trap(trap.to_string(), Some(trap_code(*trap).to_string()));
        }
        match error.downcast::<RuntimeError>() {
            Ok(err @ (RuntimeError::Trap { .. } | RuntimeError::Engine { .. })) => err,
            Ok(other) => RuntimeError::trap(other.to_string(), Some("host".to_string())),
            Err(error) => fallback(format!("{error:#}")),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

fn check_signature(function: &FunctionInstance, params: &[Value]) -> Result<(), RuntimeError> {
    let expected = function.ty().params();
    let matches = expected.len() == params.len()
        && expected.iter().zip(params).all(|(k, v)| *k == v.kind());
    if matches {
        return Ok(());
    }
    Err(RuntimeError::SignatureMismatch {
        expected: kinds_to_string(expected.iter().copied()),
        actual: kinds_to_string(params.iter().map(Value::kind)),
    })
}

/// Marshal, call and unmarshal. The outer error covers marshaling, the
/// inner one what the engine reported.
fn call(
    ctx: &mut wasmtime::Store<HostState>,
    function: &FunctionInstance,
    params: &[Value],
) -> Result<wasmtime::Result<Vec<Value>>, RuntimeError> {
    let mut scope = RootScope::new(ctx);
    let args = params
        .iter()
        .map(|p| to_wasm(p, &mut scope))
        .collect::<Result<Vec<_>, _>>()?;
    let mut results = vec![Val::I32(0); function.ty().returns().len()];

    if let Err(error) = function.func().call(&mut scope, &args, &mut results) {
        return Ok(Err(error));
    }

    let values = results
        .iter()
        .map(|r| from_wasm(r, &mut scope))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Ok(values))
}

fn define_instance(
    linker: &mut Linker<HostState>,
    ctx: &mut wasmtime::Store<HostState>,
    name: &str,
    instance: wasmtime::Instance,
) -> Result<(), RuntimeError> {
    linker
        .instance(&mut *ctx, name, instance)
        .map(|_| ())
        .map_err(|e| RuntimeError::link(format!("{e:#}")))
}

fn interrupted() -> RuntimeError {
    RuntimeError::trap("execution was interrupted", Some(trap_code(Trap::Interrupt).to_string()))
}

/// Short, stable code for a trap.
#[allow(unreachable_patterns)]
fn trap_code(trap: Trap) -> &'static str {
    match trap {
        Trap::StackOverflow => "call stack exhausted",
        Trap::MemoryOutOfBounds => "out of bounds memory access",
        Trap::HeapMisaligned => "misaligned memory access",
        Trap::TableOutOfBounds => "undefined element",
        Trap::IndirectCallToNull => "uninitialized element",
        Trap::BadSignature => "indirect call type mismatch",
        Trap::IntegerOverflow => "integer overflow",
        Trap::IntegerDivisionByZero => "integer divide by zero",
        Trap::BadConversionToInteger => "invalid conversion to integer",
        Trap::UnreachableCodeReached => "unreachable",
        Trap::Interrupt => "interrupt",
        Trap::OutOfFuel => "cost limit exceeded",
        Trap::NullReference => "null reference",
        _ => "trap",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Validator;
    use wasm_embed_common::Configuration;

    fn setup() -> (WasmEngine, Executor, Store) {
        let engine = WasmEngine::new(&Configuration::default()).unwrap();
        let executor = Executor::new(&engine);
        let store = Store::new(&engine).unwrap();
        (engine, executor, store)
    }

    fn validated(engine: &WasmEngine, wat: &str) -> AstModule {
        let module = AstModule::from_wat(wat).unwrap();
        Validator::new(engine).validate(&module).unwrap();
        module
    }

    #[test]
    fn test_trap_codes() {
        assert_eq!(trap_code(Trap::UnreachableCodeReached), "unreachable");
        assert_eq!(trap_code(Trap::IntegerOverflow), "integer overflow");
        assert_eq!(trap_code(Trap::MemoryOutOfBounds), "out of bounds memory access");
        assert_eq!(trap_code(Trap::Interrupt), "interrupt");
    }

    #[test]
    fn test_unvalidated_module_is_rejected() {
        let (_engine, executor, store) = setup();
        let module = AstModule::from_wat("(module)").unwrap();

        let err = executor.instantiate(&store, &module).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation { .. }));
    }

    #[test]
    fn test_invoke_simple() {
        let (engine, executor, store) = setup();
        let module = validated(
            &engine,
            r#"(module (func (export "add") (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add))"#,
        );
        let instance = executor.instantiate(&store, &module).unwrap();
        let add = instance.function("add").unwrap();

        let mut returns = vec![Value::I64(9)];
        executor
            .invoke(&add, &[Value::I32(2), Value::I32(40)], &mut returns)
            .unwrap();
        assert_eq!(returns, vec![Value::I32(42)]);
    }

    #[test]
    fn test_signature_mismatch() {
        let (engine, executor, store) = setup();
        let module = validated(&engine, r#"(module (func (export "f") (param i64)))"#);
        let f = executor.instantiate(&store, &module).unwrap().function("f").unwrap();

        let mut returns = Vec::new();
        let err = executor.invoke(&f, &[Value::I32(1)], &mut returns).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::SignatureMismatch { ref expected, ref actual }
                if expected == "i64" && actual == "i32"
        ));

        let err = executor.invoke(&f, &[], &mut returns).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_trap_classification() {
        let (engine, executor, store) = setup();
        let module = validated(&engine, r#"(module (func (export "boom") unreachable))"#);
        let f = executor.instantiate(&store, &module).unwrap().function("boom").unwrap();

        let err = executor.invoke(&f, &[], &mut Vec::new()).unwrap_err();
        assert!(err.is_trap());
        assert_eq!(err.trap_code(), Some("unreachable"));
    }

    #[test]
    fn test_foreign_store_is_rejected() {
        let (engine, _executor, store) = setup();
        let other = Executor::new(&WasmEngine::new(&Configuration::default()).unwrap());
        let module = validated(&engine, "(module)");

        let err = other.instantiate(&store, &module).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_closed_store_reports_not_found() {
        let (engine, executor, store) = setup();
        let module = validated(&engine, r#"(module (func (export "f")))"#);
        let f = executor.instantiate(&store, &module).unwrap().function("f").unwrap();

        store.close();
        let err = executor.invoke(&f, &[], &mut Vec::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cost_limit() {
        let mut config = Configuration::default();
        config.set_cost_limit(50);
        let engine = WasmEngine::new(&config).unwrap();
        let executor = Executor::new(&engine);
        let store = Store::new(&engine).unwrap();
        let module = validated(
            &engine,
            r#"(module (func (export "spin") (loop (br 0))))"#,
        );
        let spin = executor.instantiate(&store, &module).unwrap().function("spin").unwrap();

        let err = executor.invoke(&spin, &[], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::CostLimitExceeded { limit: 50 }));
    }
}
