//! Host functions and host-built import modules.
//!
//! A host function is a [`HostFunction`] registered under a [`FunctionType`].
//! The bridge converts engine values to [`Value`]s before the callback runs and
//! converts the callback's results back, so `externref` parameters arrive as
//! registry keys and `externref` results may be any registered key.
//!
//! Callback errors and panics become traps. A callback that returns the wrong
//! number or kinds of values fails the call with [`RuntimeError::Engine`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;
use wasmtime::{Caller, Extern, Func, Global, Linker, Memory, Table};

use crate::externref::HostObject;
use crate::store::HostState;
use crate::types::{FunctionType, GlobalType, MemoryType, TableType};
use crate::value::{Value, ValueKind, from_wasm, kinds_to_string, to_ref, to_wasm};
use wasm_embed_common::{HostFunctionError, RuntimeError};

/// A host-implemented function callable from WebAssembly.
///
/// Closures with the matching signature implement this trait.
pub trait HostFunction: Send + Sync + 'static {
    /// Handle one call. `params` match the registered parameter kinds.
    fn call(&self, ctx: &mut CallContext<'_>, params: &[Value]) -> Result<Vec<Value>, RuntimeError>;
}

impl<F> HostFunction for F
where
    F: Fn(&mut CallContext<'_>, &[Value]) -> Result<Vec<Value>, RuntimeError> + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut CallContext<'_>, params: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        self(ctx, params)
    }
}

/// What a callback can reach during one call.
///
/// Nothing borrowed from it outlives the call.
pub struct CallContext<'a> {
    caller: Caller<'a, HostState>,
    user_data: Option<HostObject>,
}

impl CallContext<'_> {
    /// The calling instance's memory exported as `memory`.
    pub fn memory(&mut self) -> Option<MemoryView<'_>> {
        let memory = self.exported_memory()?;
        Some(MemoryView {
            data: memory.data_mut(&mut self.caller),
        })
    }

    /// The calling instance's memory together with the host state.
    pub fn memory_with_state(&mut self) -> Option<(MemoryView<'_>, &mut HostState)> {
        let memory = self.exported_memory()?;
        let (data, state) = memory.data_and_store_mut(&mut self.caller);
        Some((MemoryView { data }, state))
    }

    /// User data registered with the function, downcast to `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }

    pub fn host_state(&self) -> &HostState {
        self.caller.data()
    }

    pub fn host_state_mut(&mut self) -> &mut HostState {
        self.caller.data_mut()
    }

    fn exported_memory(&mut self) -> Option<Memory> {
        self.caller.get_export("memory").and_then(Extern::into_memory)
    }
}

/// Bounds-checked view of a linear memory, valid for one call.
pub struct MemoryView<'a> {
    data: &'a mut [u8],
}

impl MemoryView<'_> {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// [`HostFunctionError::MemoryOutOfBounds`] if the range leaves the memory.
    pub fn read(&self, offset: u32, len: u32) -> Result<&[u8], HostFunctionError> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), HostFunctionError> {
        let len = u32::try_from(bytes.len()).map_err(|_| HostFunctionError::MemoryOutOfBounds {
            offset: u64::from(offset),
            len: bytes.len() as u64,
        })?;
        let range = self.range(offset, len)?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read `len` bytes at `offset` as UTF-8.
    pub fn read_string(&self, offset: u32, len: u32) -> Result<String, HostFunctionError> {
        let bytes = self.read(offset, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| HostFunctionError::InvalidArgument {
            reason: format!("string at {offset} is not UTF-8: {e}"),
        })
    }

    fn range(&self, offset: u32, len: u32) -> Result<std::ops::Range<usize>, HostFunctionError> {
        let start = offset as usize;
        let end = start.checked_add(len as usize);
        match end {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(HostFunctionError::MemoryOutOfBounds {
                offset: u64::from(offset),
                len: u64::from(len),
            }),
        }
    }
}

/// A host function together with its type, user data and cost.
#[derive(Clone)]
pub struct HostFunctionDef {
    ty: FunctionType,
    callback: Arc<dyn HostFunction>,
    user_data: Option<HostObject>,
    cost: u64,
}

impl HostFunctionDef {
    pub fn new<F>(ty: FunctionType, callback: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &[Value]) -> Result<Vec<Value>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self::from_shared(ty, Arc::new(callback))
    }

    /// Wrap an existing trait object.
    pub fn from_shared(ty: FunctionType, callback: Arc<dyn HostFunction>) -> Self {
        Self {
            ty,
            callback,
            user_data: None,
            cost: 0,
        }
    }

    /// Attach data the callback reads through [`CallContext::user_data`].
    #[must_use]
    pub fn with_user_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.user_data = Some(Arc::new(data));
        self
    }

    /// Cost added to the statistics for every call.
    #[must_use]
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Create the engine function inside `store`.
    pub(crate) fn create_func(&self, store: &mut wasmtime::Store<HostState>) -> Func {
        let ty = self.ty.to_wasmtime(store.engine());
        let callback = Arc::clone(&self.callback);
        let user_data = self.user_data.clone();
        let returns = self.ty.returns().to_vec();
        let cost = self.cost;

        Func::new(&mut *store, ty, move |mut caller, params, results| {
            caller.data_mut().charge_host_cost(cost);

            let args = params
                .iter()
                .map(|v| from_wasm(v, &mut caller))
                .collect::<Result<Vec<_>, _>>()?;

            let mut ctx = CallContext {
                caller,
                user_data: user_data.clone(),
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.call(&mut ctx, &args)));
            let mut caller = ctx.caller;

            let values = match outcome {
                Ok(Ok(values)) => values,
                Ok(Err(err)) => return Err(err.into()),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(message = %message, "Host function panicked");
                    return Err(RuntimeError::trap(message, Some("host".to_string())).into());
                }
            };

            check_returns(&returns, &values)?;
            for (slot, value) in results.iter_mut().zip(&values) {
                *slot = to_wasm(value, &mut caller)?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for HostFunctionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunctionDef")
            .field("ty", &self.ty.to_string())
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

fn check_returns(expected: &[ValueKind], values: &[Value]) -> Result<(), RuntimeError> {
    let matches = expected.len() == values.len()
        && expected.iter().zip(values).all(|(k, v)| *k == v.kind());
    if matches {
        return Ok(());
    }
    Err(RuntimeError::engine(format!(
        "host function returned ({}), expected ({})",
        kinds_to_string(values.iter().map(Value::kind)),
        kinds_to_string(expected.iter().copied())
    )))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("host function panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("host function panicked: {s}")
    } else {
        "host function panicked".to_string()
    }
}

enum ImportItem {
    Function(HostFunctionDef),
    Table(TableType, Value),
    Memory(MemoryType),
    Global(GlobalType, Value),
}

/// A named set of host-defined imports, registered into a store as a unit.
///
/// # Example
///
/// ```ignore
/// let mut env = ImportModule::new("env");
/// env.add_function(
///     "add",
///     FunctionType::new([ValueKind::I32, ValueKind::I32], [ValueKind::I32]),
///     |_ctx, params| {
///         let a = params[0].as_i32().unwrap_or_default();
///         let b = params[1].as_i32().unwrap_or_default();
///         Ok(vec![Value::I32(a + b)])
///     },
/// );
/// executor.register_import(&store, env)?;
/// ```
pub struct ImportModule {
    name: String,
    items: Vec<(String, ImportItem)>,
}

impl ImportModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a host function with no user data and zero cost.
    pub fn add_function<F>(&mut self, name: impl Into<String>, ty: FunctionType, callback: F) -> &mut Self
    where
        F: Fn(&mut CallContext<'_>, &[Value]) -> Result<Vec<Value>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.add_function_def(name, HostFunctionDef::new(ty, callback))
    }

    pub fn add_function_def(&mut self, name: impl Into<String>, def: HostFunctionDef) -> &mut Self {
        self.items.push((name.into(), ImportItem::Function(def)));
        self
    }

    /// Add a table filled with `init`.
    pub fn add_table(&mut self, name: impl Into<String>, ty: TableType, init: Value) -> &mut Self {
        self.items.push((name.into(), ImportItem::Table(ty, init)));
        self
    }

    pub fn add_memory(&mut self, name: impl Into<String>, ty: MemoryType) -> &mut Self {
        self.items.push((name.into(), ImportItem::Memory(ty)));
        self
    }

    pub fn add_global(&mut self, name: impl Into<String>, ty: GlobalType, value: Value) -> &mut Self {
        self.items.push((name.into(), ImportItem::Global(ty, value)));
        self
    }

    /// Create every item in `store` and define it in `linker`.
    pub(crate) fn define(
        &self,
        linker: &mut Linker<HostState>,
        store: &mut wasmtime::Store<HostState>,
    ) -> Result<(), RuntimeError> {
        for (name, item) in &self.items {
            let item: Extern = match item {
                ImportItem::Function(def) => def.create_func(store).into(),
                ImportItem::Table(ty, init) => {
                    if init.kind() != ty.ref_kind {
                        return Err(RuntimeError::invalid_argument(format!(
                            "table '{name}' holds {}, init value is {}",
                            ty.ref_kind,
                            init.kind()
                        )));
                    }
                    let init = to_ref(init, &mut *store)?;
                    Table::new(&mut *store, ty.to_wasmtime()?, init)
                        .map_err(|e| RuntimeError::engine(format!("{e:#}")))?
                        .into()
                }
                ImportItem::Memory(ty) => {
                    if ty.shared {
                        return Err(RuntimeError::invalid_argument(format!(
                            "memory '{name}': shared memories cannot be host-defined"
                        )));
                    }
                    Memory::new(&mut *store, ty.to_wasmtime()?)
                        .map_err(|e| RuntimeError::engine(format!("{e:#}")))?
                        .into()
                }
                ImportItem::Global(ty, value) => {
                    if value.kind() != ty.kind {
                        return Err(RuntimeError::invalid_argument(format!(
                            "global '{name}' holds {}, init value is {}",
                            ty.kind,
                            value.kind()
                        )));
                    }
                    let value = to_wasm(value, &mut *store)?;
                    Global::new(&mut *store, ty.to_wasmtime(), value)
                        .map_err(|e| RuntimeError::engine(format!("{e:#}")))?
                        .into()
                }
            };
            linker
                .define(&*store, &self.name, name, item)
                .map_err(|e| RuntimeError::link(format!("{e:#}")))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ImportModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportModule")
            .field("name", &self.name)
            .field(
                "items",
                &self.items.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_view_bounds() {
        let mut backing = vec![0_u8; 16];
        let mut view = MemoryView {
            data: &mut backing,
        };

        view.write(4, b"wasm").unwrap();
        assert_eq!(view.read(4, 4).unwrap(), b"wasm");
        assert_eq!(view.read_string(4, 4).unwrap(), "wasm");
        assert_eq!(view.len(), 16);

        let err = view.read(14, 4).unwrap_err();
        assert!(matches!(err, HostFunctionError::MemoryOutOfBounds { offset: 14, len: 4 }));
        let err = view.write(14, b"wasm").unwrap_err();
        assert!(matches!(err, HostFunctionError::MemoryOutOfBounds { offset: 14, len: 4 }));
        assert!(view.write(u32::MAX, b"x").is_err());
    }

    #[test]
    fn test_read_string_rejects_invalid_utf8() {
        let mut backing = vec![0xff_u8, 0xfe];
        let view = MemoryView {
            data: &mut backing,
        };
        assert!(matches!(
            view.read_string(0, 2),
            Err(HostFunctionError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_check_returns() {
        assert!(check_returns(&[ValueKind::I32], &[Value::I32(1)]).is_ok());

        let err = check_returns(&[ValueKind::I32], &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::Engine { .. }));

        let err = check_returns(&[ValueKind::I32], &[Value::I64(1)]).unwrap_err();
        assert!(err.to_string().contains("(i64)"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "host function panicked: boom");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "host function panicked");
    }

    #[test]
    fn test_function_def_builder() {
        let def = HostFunctionDef::new(FunctionType::new([], [ValueKind::I32]), |_, _| {
            Ok(vec![Value::I32(1)])
        })
        .with_cost(5)
        .with_user_data(String::from("ctx"));

        assert_eq!(def.cost(), 5);
        assert_eq!(def.ty().returns(), &[ValueKind::I32]);
        assert!(format!("{def:?}").contains("() -> (i32)"));
    }
}
