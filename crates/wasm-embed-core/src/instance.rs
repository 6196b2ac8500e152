//! Module instances and the function, table, memory and global handles they export.
//!
//! Handles are cheap to clone and refer back to their store weakly. Once the
//! store is closed or dropped, function handles report
//! [`RuntimeError::FunctionNotFound`] and every other handle reports
//! [`RuntimeError::InvalidArgument`].

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use wasmtime::{Extern, Func, Global, Memory, RootScope, Table};

use crate::store::{HostState, StoreInner, closed};
use crate::types::{FunctionType, GlobalType, MemoryType, Mutability, TableType};
use crate::value::{Value, from_ref, from_wasm, to_ref, to_wasm};
use wasm_embed_common::RuntimeError;

/// Exports of one instantiated module, addressable by name.
#[derive(Clone)]
pub struct ModuleInstance {
    name: Option<String>,
    functions: BTreeMap<String, FunctionInstance>,
    tables: BTreeMap<String, TableInstance>,
    memories: BTreeMap<String, MemoryInstance>,
    globals: BTreeMap<String, GlobalInstance>,
}

impl ModuleInstance {
    #[allow(unreachable_patterns)]
    pub(crate) fn from_externs(
        name: Option<&str>,
        items: Vec<(String, Extern)>,
        ctx: &mut wasmtime::Store<HostState>,
        store: Weak<StoreInner>,
    ) -> Result<Self, RuntimeError> {
        let mut instance = Self {
            name: name.map(str::to_owned),
            functions: BTreeMap::new(),
            tables: BTreeMap::new(),
            memories: BTreeMap::new(),
            globals: BTreeMap::new(),
        };

        for (export, item) in items {
            match item {
                Extern::Func(func) => {
                    let ty = FunctionType::from_wasmtime(&func.ty(&*ctx))?;
                    instance.functions.insert(
                        export.clone(),
                        FunctionInstance {
                            func,
                            ty,
                            name: export,
                            store: store.clone(),
                        },
                    );
                }
                Extern::Table(table) => {
                    let ty = TableType::from_wasmtime(&table.ty(&*ctx))?;
                    instance.tables.insert(
                        export,
                        TableInstance {
                            table,
                            ty,
                            store: store.clone(),
                        },
                    );
                }
                Extern::Memory(memory) => {
                    let ty = MemoryType::from_wasmtime(&memory.ty(&*ctx));
                    instance.memories.insert(
                        export,
                        MemoryInstance {
                            memory,
                            ty,
                            store: store.clone(),
                        },
                    );
                }
                Extern::Global(global) => {
                    let ty = GlobalType::from_wasmtime(&global.ty(&*ctx))?;
                    instance.globals.insert(
                        export,
                        GlobalInstance {
                            global,
                            ty,
                            store: store.clone(),
                        },
                    );
                }
                // Shared memories and tags are not exposed.
                _ => {}
            }
        }

        Ok(instance)
    }

    /// Registration name, `None` for anonymous instances.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn function(&self, name: &str) -> Option<FunctionInstance> {
        self.functions.get(name).cloned()
    }

    pub fn table(&self, name: &str) -> Option<TableInstance> {
        self.tables.get(name).cloned()
    }

    pub fn memory(&self, name: &str) -> Option<MemoryInstance> {
        self.memories.get(name).cloned()
    }

    pub fn global(&self, name: &str) -> Option<GlobalInstance> {
        self.globals.get(name).cloned()
    }

    /// Exported function names, sorted.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn memory_names(&self) -> Vec<String> {
        self.memories.keys().cloned().collect()
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals.keys().cloned().collect()
    }

    /// Exported functions with their types, sorted by name.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionInstance> {
        self.functions.values()
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("memories", &self.memories.keys().collect::<Vec<_>>())
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run `f` against the engine store behind `store`.
fn with_live_store<R>(
    store: &Weak<StoreInner>,
    f: impl FnOnce(&mut wasmtime::Store<HostState>) -> Result<R, RuntimeError>,
) -> Result<R, RuntimeError> {
    let inner = store.upgrade().ok_or_else(closed)?;
    inner.with_context(f)
}

fn out_of_range(what: &str, index: u64) -> RuntimeError {
    RuntimeError::invalid_argument(format!("{what} {index} is out of range"))
}

/// An exported or host-defined function.
#[derive(Clone)]
pub struct FunctionInstance {
    func: Func,
    ty: FunctionType,
    name: String,
    store: Weak<StoreInner>,
}

impl FunctionInstance {
    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    /// Export name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn func(&self) -> Func {
        self.func
    }

    /// The owning store, if it is still alive.
    pub(crate) fn store(&self) -> Result<Arc<StoreInner>, RuntimeError> {
        self.store
            .upgrade()
            .ok_or_else(|| RuntimeError::function_not_found(&self.name))
    }
}

impl std::fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionInstance")
            .field("name", &self.name)
            .field("ty", &self.ty.to_string())
            .finish_non_exhaustive()
    }
}

/// A table of references.
#[derive(Clone)]
pub struct TableInstance {
    table: Table,
    ty: TableType,
    store: Weak<StoreInner>,
}

impl TableInstance {
    /// Type at the time the handle was created.
    pub fn ty(&self) -> TableType {
        self.ty
    }

    /// Current number of elements.
    pub fn size(&self) -> Result<u64, RuntimeError> {
        with_live_store(&self.store, |ctx| Ok(u64::from(self.table.size(&*ctx))))
    }

    /// Read the element at `index`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] if `index` is past the end.
    pub fn get(&self, index: u64) -> Result<Value, RuntimeError> {
        with_live_store(&self.store, |ctx| {
            let slot = index.try_into().map_err(|_| out_of_range("table index", index))?;
            let mut scope = RootScope::new(ctx);
            let element = self
                .table
                .get(&mut scope, slot)
                .ok_or_else(|| out_of_range("table index", index))?;
            from_ref(&element, &mut scope)
        })
    }

    /// Write `value` at `index`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] if the kind does not match the table's
    /// element kind, [`RuntimeError::Engine`] if the engine refuses the write.
    pub fn set(&self, index: u64, value: Value) -> Result<(), RuntimeError> {
        self.check_kind(&value)?;
        with_live_store(&self.store, |ctx| {
            let slot = index.try_into().map_err(|_| out_of_range("table index", index))?;
            let mut scope = RootScope::new(ctx);
            let element = to_ref(&value, &mut scope)?;
            self.table
                .set(&mut scope, slot, element)
                .map_err(|e| RuntimeError::engine(format!("{e:#}")))
        })
    }

    /// Append `delta` copies of `init`, returning the previous size.
    pub fn grow(&self, delta: u64, init: Value) -> Result<u64, RuntimeError> {
        self.check_kind(&init)?;
        with_live_store(&self.store, |ctx| {
            let delta = delta.try_into().map_err(|_| out_of_range("table delta", delta))?;
            let mut scope = RootScope::new(ctx);
            let element = to_ref(&init, &mut scope)?;
            let previous = self
                .table
                .grow(&mut scope, delta, element)
                .map_err(|e| RuntimeError::engine(format!("{e:#}")))?;
            Ok(u64::from(previous))
        })
    }

    fn check_kind(&self, value: &Value) -> Result<(), RuntimeError> {
        if value.kind() != self.ty.ref_kind {
            return Err(RuntimeError::invalid_argument(format!(
                "table holds {}, got {}",
                self.ty.ref_kind,
                value.kind()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInstance")
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

/// A linear memory. Pages are 64 KiB.
#[derive(Clone)]
pub struct MemoryInstance {
    memory: Memory,
    ty: MemoryType,
    store: Weak<StoreInner>,
}

impl MemoryInstance {
    pub fn ty(&self) -> MemoryType {
        self.ty
    }

    /// Current size in pages.
    pub fn page_count(&self) -> Result<u64, RuntimeError> {
        with_live_store(&self.store, |ctx| Ok(u64::from(self.memory.size(&*ctx))))
    }

    /// Current size in bytes.
    pub fn data_size(&self) -> Result<usize, RuntimeError> {
        with_live_store(&self.store, |ctx| Ok(self.memory.data_size(&*ctx)))
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, RuntimeError> {
        with_live_store(&self.store, |ctx| {
            let mut buf = vec![0; len];
            self.memory
                .read(&*ctx, offset, &mut buf)
                .map_err(|e| RuntimeError::invalid_argument(format!("{e} at {offset}+{len}")))?;
            Ok(buf)
        })
    }

    /// Copy `data` into memory starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), RuntimeError> {
        with_live_store(&self.store, |ctx| {
            self.memory.write(&mut *ctx, offset, data).map_err(|e| {
                RuntimeError::invalid_argument(format!("{e} at {offset}+{}", data.len()))
            })
        })
    }

    /// Grow by `delta` pages, returning the previous page count.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Engine`] if the memory's maximum or the configured
    /// page limit would be exceeded.
    pub fn grow(&self, delta: u64) -> Result<u64, RuntimeError> {
        with_live_store(&self.store, |ctx| {
            self.memory
                .grow(&mut *ctx, delta)
                .map_err(|e| RuntimeError::engine(format!("{e:#}")))
        })
    }
}

impl std::fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

/// A global variable.
#[derive(Clone)]
pub struct GlobalInstance {
    global: Global,
    ty: GlobalType,
    store: Weak<StoreInner>,
}

impl GlobalInstance {
    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub fn get(&self) -> Result<Value, RuntimeError> {
        with_live_store(&self.store, |ctx| {
            let mut scope = RootScope::new(ctx);
            let val = self.global.get(&mut scope);
            from_wasm(&val, &mut scope)
        })
    }

    /// Overwrite the value.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] on a kind mismatch,
    /// [`RuntimeError::Engine`] if the global is `Const`.
    pub fn set(&self, value: Value) -> Result<(), RuntimeError> {
        if value.kind() != self.ty.kind {
            return Err(RuntimeError::invalid_argument(format!(
                "global holds {}, got {}",
                self.ty.kind,
                value.kind()
            )));
        }
        if self.ty.mutability == Mutability::Const {
            return Err(RuntimeError::engine("immutable global cannot be set"));
        }
        with_live_store(&self.store, |ctx| {
            let mut scope = RootScope::new(ctx);
            let val = to_wasm(&value, &mut scope)?;
            self.global
                .set(&mut scope, val)
                .map_err(|e| RuntimeError::engine(format!("{e:#}")))
        })
    }
}

impl std::fmt::Debug for GlobalInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalInstance")
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}
