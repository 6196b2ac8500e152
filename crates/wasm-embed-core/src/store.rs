//! Stores and the per-store host state.
//!
//! This module provides:
//! - [`HostState`]: data every engine store carries, reachable from host functions
//! - [`Store`]: a named registry of module instances plus the engine store they live in
//!
//! A [`Store`] keeps two locks. The name registry (`RwLock`) serves lookups and
//! registration. The engine store (`Mutex`) is held for the duration of every
//! call into WebAssembly. Lookups by name never wait for a running execution.
//!
//! The registry lock is a leaf: it is taken briefly and never held while
//! another lock is acquired. A name is claimed by defining it in the linker,
//! and only then published in the registry.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use wasmtime::{Func, Linker, ResourceLimiter, Trap, UpdateDeadline};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use crate::instance::ModuleInstance;
use wasm_embed_common::RuntimeError;

const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Data carried by every engine store.
///
/// Host functions reach it through [`crate::CallContext::host_state`].
pub struct HostState {
    /// WASI preview1 context. Starts empty until a WASI host module sets it.
    wasi: WasiP1Ctx,

    /// Exit code recorded by `proc_exit`.
    wasi_exit_code: Option<i32>,

    /// Functions handed out as `funcref` values, addressed by index.
    func_refs: Vec<Func>,

    /// Cancellation flag of the execution currently running, if any.
    cancel: Option<Arc<AtomicBool>>,

    /// Cost charged by host functions during the current call.
    host_cost: u64,

    /// Largest linear memory allowed, in bytes.
    max_memory_bytes: usize,

    /// Typed state owned by host modules.
    extensions: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl HostState {
    fn new(max_memory_pages: u32) -> Self {
        Self {
            wasi: WasiCtxBuilder::new().build_p1(),
            wasi_exit_code: None,
            func_refs: Vec::new(),
            cancel: None,
            host_cost: 0,
            max_memory_bytes: (max_memory_pages as usize).saturating_mul(WASM_PAGE_SIZE),
            extensions: HashMap::new(),
        }
    }

    /// The WASI context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Replace the WASI context and forget any recorded exit code.
    pub fn set_wasi(&mut self, ctx: WasiP1Ctx) {
        self.wasi = ctx;
        self.wasi_exit_code = None;
    }

    /// Exit code passed to `proc_exit`, if the guest exited.
    pub fn wasi_exit_code(&self) -> Option<i32> {
        self.wasi_exit_code
    }

    pub(crate) fn record_exit(&mut self, code: i32) {
        self.wasi_exit_code = Some(code);
    }

    /// Typed host-module state.
    pub fn extension<T: Any + Send>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    /// Mutable typed host-module state.
    pub fn extension_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    /// Install typed host-module state, replacing any previous value.
    pub fn insert_extension<T: Any + Send>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub(crate) fn func_ref(&self, index: u32) -> Option<Func> {
        self.func_refs.get(index as usize).copied()
    }

    pub(crate) fn func_refs(&self) -> &[Func] {
        &self.func_refs
    }

    /// Append `func` to the reference table. Callers look it up first.
    pub(crate) fn push_func_ref(&mut self, func: Func) -> u32 {
        let index = u32::try_from(self.func_refs.len()).unwrap_or(u32::MAX);
        self.func_refs.push(func);
        index
    }

    pub(crate) fn set_cancel(&mut self, cancel: Option<Arc<AtomicBool>>) {
        self.cancel = cancel;
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub(crate) fn charge_host_cost(&mut self, cost: u64) {
        self.host_cost = self.host_cost.saturating_add(cost);
    }

    pub(crate) fn take_host_cost(&mut self) -> u64 {
        std::mem::take(&mut self.host_cost)
    }
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_memory_bytes {
            debug!(
                current_bytes = current,
                desired_bytes = desired,
                limit_bytes = self.max_memory_bytes,
                "Memory grow rejected: exceeds page limit"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// A namespace of module instances plus the engine store they live in.
///
/// Cloning is cheap; clones refer to the same store. The engine store is
/// released when the last clone is dropped, or early through [`Store::close`].
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    id: Uuid,
    engine: WasmEngine,
    registry: RwLock<BTreeMap<String, ModuleInstance>>,
    linker: Mutex<Linker<HostState>>,
    context: Mutex<Option<wasmtime::Store<HostState>>>,
}

impl Store {
    /// Create an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if fuel cannot be set on the engine store.
    pub fn new(engine: &WasmEngine) -> Result<Self, RuntimeError> {
        let state = HostState::new(engine.config().max_memory_pages());
        let mut context = wasmtime::Store::new(engine.inner(), state);

        context.limiter(|state| state);

        // Only the owning execution's flag can stop it; other stores' cancels
        // also bump the shared epoch.
        context.epoch_deadline_callback(|ctx| {
            if ctx.data().cancel_requested() {
                return Err(Trap::Interrupt.into());
            }
            Ok(UpdateDeadline::Continue(1))
        });
        context.set_epoch_deadline(1);

        if engine.is_metering_enabled() {
            context
                .set_fuel(u64::MAX)
                .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }

        let id = Uuid::new_v4();
        debug!(store_id = %id, "Store created");

        Ok(Self {
            inner: Arc::new(StoreInner {
                id,
                engine: engine.clone(),
                registry: RwLock::new(BTreeMap::new()),
                linker: Mutex::new(Linker::new(engine.inner())),
                context: Mutex::new(Some(context)),
            }),
        })
    }

    /// Unique store identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The engine this store belongs to.
    pub fn engine(&self) -> &WasmEngine {
        &self.inner.engine
    }

    /// Registered module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        self.inner.registry.read().keys().cloned().collect()
    }

    /// Look up a registered module instance.
    pub fn module(&self, name: &str) -> Option<ModuleInstance> {
        self.inner.registry.read().get(name).cloned()
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.read().contains_key(name)
    }

    /// Number of registered module instances.
    pub fn module_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Release the engine store and every registered instance.
    ///
    /// Handles obtained earlier report not-found or invalid-argument errors
    /// afterwards. Closing twice is a no-op.
    pub fn close(&self) {
        let released = self.inner.context.lock().take().is_some();
        if released {
            self.inner.registry.write().clear();
            info!(store_id = %self.inner.id, "Store closed");
        }
    }

    /// Whether [`Store::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.context.lock().is_none()
    }

    /// Define host items under `module_name` and register the result.
    ///
    /// `define` receives the store's linker and engine store; everything it
    /// adds under `module_name` becomes visible as a registered module
    /// instance.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DuplicateName`] if the name is taken. A
    /// [`RuntimeError`] raised by `define` is returned as is; any other
    /// failure becomes [`RuntimeError::Link`].
    pub fn install_host<F>(&self, module_name: &str, define: F) -> Result<ModuleInstance, RuntimeError>
    where
        F: FnOnce(&mut Linker<HostState>, &mut wasmtime::Store<HostState>) -> anyhow::Result<()>,
    {
        let mut linker = self.inner.linker.lock();
        let mut guard = self.inner.context.lock();
        let context = guard.as_mut().ok_or_else(closed)?;
        self.check_name_free(&linker, &mut *context, module_name)?;

        define(&mut linker, &mut *context).map_err(|e| match e.downcast::<RuntimeError>() {
            Ok(err) => err,
            Err(e) => RuntimeError::link(format!("{e:#}")),
        })?;

        let items: Vec<(String, wasmtime::Extern)> = linker
            .iter(&mut *context)
            .filter(|(module, _, _)| *module == module_name)
            .map(|(_, name, item)| (name.to_owned(), item))
            .collect();
        let instance =
            ModuleInstance::from_externs(Some(module_name), items, &mut *context, self.weak())?;
        drop(guard);
        drop(linker);

        self.publish(module_name, &instance)?;
        info!(module = module_name, "Host module installed");
        Ok(instance)
    }

    /// Run `f` with exclusive access to the host state.
    ///
    /// Blocks while an execution is running in this store.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] if the store was closed.
    pub fn with_host_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> Result<R, RuntimeError> {
        let mut guard = self.inner.context.lock();
        let context = guard.as_mut().ok_or_else(closed)?;
        Ok(f(context.data_mut()))
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    pub(crate) fn weak(&self) -> std::sync::Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    /// Fail if `name` is registered or already defined in `linker`.
    ///
    /// Callers hold the linker lock, so the check and the later definition
    /// are atomic with respect to other registrations.
    pub(crate) fn check_name_free(
        &self,
        linker: &Linker<HostState>,
        ctx: &mut wasmtime::Store<HostState>,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let defined = linker.iter(&mut *ctx).any(|(module, _, _)| module == name);
        if defined || self.contains(name) {
            return Err(RuntimeError::duplicate_name(name));
        }
        Ok(())
    }

    /// Make `instance` visible under `name`.
    pub(crate) fn publish(&self, name: &str, instance: &ModuleInstance) -> Result<(), RuntimeError> {
        let mut registry = self.inner.registry.write();
        if registry.contains_key(name) {
            return Err(RuntimeError::duplicate_name(name));
        }
        registry.insert(name.to_owned(), instance.clone());
        Ok(())
    }
}

impl StoreInner {
    pub(crate) fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Mutex<Linker<HostState>> {
        &self.linker
    }

    /// Run `f` against the engine store.
    pub(crate) fn with_context<R>(
        &self,
        f: impl FnOnce(&mut wasmtime::Store<HostState>) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let mut guard = self.context.lock();
        let context = guard.as_mut().ok_or_else(closed)?;
        f(context)
    }

    pub(crate) fn context(&self) -> &Mutex<Option<wasmtime::Store<HostState>>> {
        &self.context
    }
}

pub(crate) fn closed() -> RuntimeError {
    RuntimeError::invalid_argument("store has been closed")
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("modules", &self.module_names())
            .finish_non_exhaustive()
    }
}

/// Remaining fuel, if metering is enabled.
pub(crate) fn get_remaining_fuel(store: &wasmtime::Store<HostState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Fuel consumed since `initial_fuel` was set.
pub(crate) fn calculate_fuel_consumed(initial_fuel: u64, store: &wasmtime::Store<HostState>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(initial_fuel);
    initial_fuel.saturating_sub(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_embed_common::Configuration;

    fn engine() -> WasmEngine {
        WasmEngine::new(&Configuration::default()).unwrap()
    }

    #[test]
    fn test_store_creation() {
        let store = Store::new(&engine()).unwrap();
        assert_eq!(store.module_count(), 0);
        assert!(store.module("missing").is_none());
        assert!(!store.is_closed());
    }

    #[test]
    fn test_store_fuel() {
        let mut config = Configuration::default();
        config.set_instruction_counting(true);
        let engine = WasmEngine::new(&config).unwrap();
        let store = Store::new(&engine).unwrap();

        let remaining = store
            .inner()
            .with_context(|ctx| Ok(get_remaining_fuel(ctx)))
            .unwrap();
        assert_eq!(remaining, Some(u64::MAX));
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Store::new(&engine()).unwrap();
        store.close();
        store.close();

        assert!(store.is_closed());
        let err = store.with_host_state(|_| ()).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_host_state_extensions() {
        struct Counter(u32);

        let store = Store::new(&engine()).unwrap();
        store
            .with_host_state(|state| {
                assert!(state.extension::<Counter>().is_none());
                state.insert_extension(Counter(1));
                state.extension_mut::<Counter>().unwrap().0 += 1;
            })
            .unwrap();

        let value = store
            .with_host_state(|state| state.extension::<Counter>().map(|c| c.0))
            .unwrap();
        assert_eq!(value, Some(2));
    }

    #[test]
    fn test_memory_limit() {
        let mut state = HostState::new(2);
        assert!(state.memory_growing(0, 2 * WASM_PAGE_SIZE, None).unwrap());
        assert!(!state.memory_growing(0, 3 * WASM_PAGE_SIZE, None).unwrap());
    }

    #[test]
    fn test_install_host_rejects_duplicates() {
        let store = Store::new(&engine()).unwrap();
        let instance = store
            .install_host("env", |linker, _| {
                linker.func_wrap("env", "answer", || 42_i32)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(instance.function_names(), vec!["answer".to_string()]);

        let err = store.install_host("env", |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateName { .. }));
    }
}
