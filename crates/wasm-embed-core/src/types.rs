//! Type records shared by modules, instances and host functions.

use std::fmt;

use wasmtime::{Engine, RefType};

use crate::value::{ValueKind, kinds_to_string};
use wasm_embed_common::RuntimeError;

/// Size limits of a table or memory.
///
/// `max` is ignored when `has_max` is false, including by equality.
#[derive(Debug, Clone, Copy, Eq)]
pub struct Limit {
    has_max: bool,
    min: u64,
    max: u64,
}

impl Limit {
    pub fn new(has_max: bool, min: u64, max: u64) -> Self {
        Self { has_max, min, max }
    }

    /// Limit with a minimum only.
    pub fn unbounded(min: u64) -> Self {
        Self::new(false, min, 0)
    }

    /// Limit with both bounds.
    pub fn bounded(min: u64, max: u64) -> Self {
        Self::new(true, min, max)
    }

    pub fn has_max(&self) -> bool {
        self.has_max
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    /// The maximum, if one is set.
    pub fn max(&self) -> Option<u64> {
        self.has_max.then_some(self.max)
    }

    fn from_parts(min: u64, max: Option<u64>) -> Self {
        match max {
            Some(max) => Self::bounded(min, max),
            None => Self::unbounded(min),
        }
    }

    fn to_u32_parts(self) -> Result<(u32, Option<u32>), RuntimeError> {
        let narrow = |v: u64| {
            u32::try_from(v).map_err(|_| {
                RuntimeError::invalid_argument(format!("limit {v} does not fit in 32 bits"))
            })
        };
        Ok((narrow(self.min)?, self.max().map(narrow).transpose()?))
    }
}

impl PartialEq for Limit {
    fn eq(&self, other: &Self) -> bool {
        self.has_max == other.has_max
            && self.min == other.min
            && (!self.has_max || self.max == other.max)
    }
}

/// Parameter and return kinds of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    params: Vec<ValueKind>,
    returns: Vec<ValueKind>,
}

impl FunctionType {
    pub fn new(
        params: impl IntoIterator<Item = ValueKind>,
        returns: impl IntoIterator<Item = ValueKind>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            returns: returns.into_iter().collect(),
        }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn returns(&self) -> &[ValueKind] {
        &self.returns
    }

    pub(crate) fn from_wasmtime(ty: &wasmtime::FuncType) -> Result<Self, RuntimeError> {
        Ok(Self {
            params: ty
                .params()
                .map(|t| ValueKind::from_wasmtime(&t))
                .collect::<Result<_, _>>()?,
            returns: ty
                .results()
                .map(|t| ValueKind::from_wasmtime(&t))
                .collect::<Result<_, _>>()?,
        })
    }

    pub(crate) fn to_wasmtime(&self, engine: &Engine) -> wasmtime::FuncType {
        wasmtime::FuncType::new(
            engine,
            self.params.iter().map(|k| k.to_wasmtime()),
            self.returns.iter().map(|k| k.to_wasmtime()),
        )
    }

    fn from_parser(ty: &wasmparser::FuncType) -> Result<Self, RuntimeError> {
        Ok(Self {
            params: ty
                .params()
                .iter()
                .map(kind_from_parser)
                .collect::<Result<_, _>>()?,
            returns: ty
                .results()
                .iter()
                .map(kind_from_parser)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) -> ({})",
            kinds_to_string(self.params.iter().copied()),
            kinds_to_string(self.returns.iter().copied())
        )
    }
}

/// Whether a global can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutability {
    Const,
    Var,
}

/// Element kind and size limits of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub ref_kind: ValueKind,
    pub limit: Limit,
}

impl TableType {
    /// Create a table type.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::InvalidArgument`] if `ref_kind` is not a reference kind.
    pub fn new(ref_kind: ValueKind, limit: Limit) -> Result<Self, RuntimeError> {
        if !ref_kind.is_ref() {
            return Err(RuntimeError::invalid_argument(format!(
                "table elements must be references, got {ref_kind}"
            )));
        }
        Ok(Self { ref_kind, limit })
    }

    pub(crate) fn from_wasmtime(ty: &wasmtime::TableType) -> Result<Self, RuntimeError> {
        let ref_kind = ValueKind::from_wasmtime(&wasmtime::ValType::Ref(ty.element().clone()))?;
        Ok(Self {
            ref_kind,
            limit: Limit::from_parts(u64::from(ty.minimum()), ty.maximum().map(u64::from)),
        })
    }

    pub(crate) fn to_wasmtime(self) -> Result<wasmtime::TableType, RuntimeError> {
        let element = match self.ref_kind {
            ValueKind::FuncRef => RefType::FUNCREF,
            ValueKind::ExternRef => RefType::EXTERNREF,
            other => {
                return Err(RuntimeError::invalid_argument(format!(
                    "table elements must be references, got {other}"
                )));
            }
        };
        let (min, max) = self.limit.to_u32_parts()?;
        Ok(wasmtime::TableType::new(element, min, max))
    }
}

/// Page limits of a linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub limit: Limit,
    pub shared: bool,
}

impl MemoryType {
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            shared: false,
        }
    }

    pub(crate) fn from_wasmtime(ty: &wasmtime::MemoryType) -> Self {
        Self {
            limit: Limit::from_parts(ty.minimum(), ty.maximum()),
            shared: ty.is_shared(),
        }
    }

    pub(crate) fn to_wasmtime(self) -> Result<wasmtime::MemoryType, RuntimeError> {
        let (min, max) = self.limit.to_u32_parts()?;
        if self.shared {
            let max = max.ok_or_else(|| {
                RuntimeError::invalid_argument("shared memories need a maximum")
            })?;
            return Ok(wasmtime::MemoryType::shared(min, max));
        }
        Ok(wasmtime::MemoryType::new(min, max))
    }
}

/// Value kind and mutability of a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub kind: ValueKind,
    pub mutability: Mutability,
}

impl GlobalType {
    pub fn new(kind: ValueKind, mutability: Mutability) -> Self {
        Self { kind, mutability }
    }

    pub(crate) fn from_wasmtime(ty: &wasmtime::GlobalType) -> Result<Self, RuntimeError> {
        Ok(Self {
            kind: ValueKind::from_wasmtime(ty.content())?,
            mutability: match ty.mutability() {
                wasmtime::Mutability::Const => Mutability::Const,
                wasmtime::Mutability::Var => Mutability::Var,
            },
        })
    }

    pub(crate) fn to_wasmtime(self) -> wasmtime::GlobalType {
        let mutability = match self.mutability {
            Mutability::Const => wasmtime::Mutability::Const,
            Mutability::Var => wasmtime::Mutability::Var,
        };
        wasmtime::GlobalType::new(self.kind.to_wasmtime(), mutability)
    }
}

/// Kind of an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalKind {
    Function,
    Table,
    Memory,
    Global,
    Tag,
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExternalKind::Function => "func",
            ExternalKind::Table => "table",
            ExternalKind::Memory => "memory",
            ExternalKind::Global => "global",
            ExternalKind::Tag => "tag",
        })
    }
}

/// Type of an import or export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalType {
    Function(FunctionType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
    Tag,
}

impl ExternalType {
    pub fn kind(&self) -> ExternalKind {
        match self {
            ExternalType::Function(_) => ExternalKind::Function,
            ExternalType::Table(_) => ExternalKind::Table,
            ExternalType::Memory(_) => ExternalKind::Memory,
            ExternalType::Global(_) => ExternalKind::Global,
            ExternalType::Tag => ExternalKind::Tag,
        }
    }

    #[allow(unreachable_patterns)]
    pub(crate) fn from_wasmtime(ty: &wasmtime::ExternType) -> Result<Self, RuntimeError> {
        Ok(match ty {
            wasmtime::ExternType::Func(f) => ExternalType::Function(FunctionType::from_wasmtime(f)?),
            wasmtime::ExternType::Table(t) => ExternalType::Table(TableType::from_wasmtime(t)?),
            wasmtime::ExternType::Memory(m) => ExternalType::Memory(MemoryType::from_wasmtime(m)),
            wasmtime::ExternType::Global(g) => ExternalType::Global(GlobalType::from_wasmtime(g)?),
            _ => ExternalType::Tag,
        })
    }
}

/// One import of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub module_name: String,
    pub external_name: String,
    pub ty: ExternalType,
}

/// One export of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub external_name: String,
    pub ty: ExternalType,
}

pub(crate) fn kind_from_parser(ty: &wasmparser::ValType) -> Result<ValueKind, RuntimeError> {
    use wasmparser::{AbstractHeapType, HeapType, ValType};

    Ok(match ty {
        ValType::I32 => ValueKind::I32,
        ValType::I64 => ValueKind::I64,
        ValType::F32 => ValueKind::F32,
        ValType::F64 => ValueKind::F64,
        ValType::V128 => ValueKind::V128,
        ValType::Ref(r) => match r.heap_type() {
            HeapType::Concrete(_) => ValueKind::FuncRef,
            HeapType::Abstract { ty, .. } => match ty {
                AbstractHeapType::Func | AbstractHeapType::NoFunc => ValueKind::FuncRef,
                AbstractHeapType::Extern | AbstractHeapType::NoExtern => ValueKind::ExternRef,
                other => {
                    return Err(RuntimeError::parse(format!(
                        "unsupported reference type: {other:?}"
                    )));
                }
            },
        },
    })
}

/// Builds descriptors from parser records, resolving type indices.
#[derive(Default)]
pub(crate) struct DescriptorBuilder {
    types: Vec<Option<FunctionType>>,
    functions: Vec<u32>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    globals: Vec<GlobalType>,
    pub(crate) imports: Vec<ImportDescriptor>,
    pub(crate) exports: Vec<ExportDescriptor>,
}

impl DescriptorBuilder {
    pub(crate) fn add_type(&mut self, ty: Option<&wasmparser::FuncType>) -> Result<(), RuntimeError> {
        self.types.push(ty.map(FunctionType::from_parser).transpose()?);
        Ok(())
    }

    pub(crate) fn add_function(&mut self, type_index: u32) {
        self.functions.push(type_index);
    }

    pub(crate) fn add_table(&mut self, ty: &wasmparser::TableType) -> Result<(), RuntimeError> {
        let table = Self::table(ty)?;
        self.tables.push(table);
        Ok(())
    }

    pub(crate) fn add_memory(&mut self, ty: &wasmparser::MemoryType) {
        self.memories.push(Self::memory(ty));
    }

    pub(crate) fn add_global(&mut self, ty: &wasmparser::GlobalType) -> Result<(), RuntimeError> {
        let global = Self::global(ty)?;
        self.globals.push(global);
        Ok(())
    }

    pub(crate) fn add_import(&mut self, import: &wasmparser::Import<'_>) -> Result<(), RuntimeError> {
        use wasmparser::TypeRef;

        #[allow(unreachable_patterns)]
        let ty = match import.ty {
            TypeRef::Func(index) => {
                self.functions.push(index);
                ExternalType::Function(self.function_type(index)?)
            }
            TypeRef::Table(t) => {
                let table = Self::table(&t)?;
                self.tables.push(table);
                ExternalType::Table(table)
            }
            TypeRef::Memory(m) => {
                let memory = Self::memory(&m);
                self.memories.push(memory);
                ExternalType::Memory(memory)
            }
            TypeRef::Global(g) => {
                let global = Self::global(&g)?;
                self.globals.push(global);
                ExternalType::Global(global)
            }
            _ => ExternalType::Tag,
        };
        self.imports.push(ImportDescriptor {
            module_name: import.module.to_owned(),
            external_name: import.name.to_owned(),
            ty,
        });
        Ok(())
    }

    pub(crate) fn add_export(&mut self, export: &wasmparser::Export<'_>) -> Result<(), RuntimeError> {
        use wasmparser::ExternalKind as Kind;

        let index = export.index as usize;
        let missing = || {
            RuntimeError::parse(format!(
                "export '{}' refers to unknown {:?} index {}",
                export.name, export.kind, export.index
            ))
        };
        #[allow(unreachable_patterns)]
        let ty = match export.kind {
            Kind::Func => {
                let type_index = *self.functions.get(index).ok_or_else(missing)?;
                ExternalType::Function(self.function_type(type_index)?)
            }
            Kind::Table => ExternalType::Table(*self.tables.get(index).ok_or_else(missing)?),
            Kind::Memory => ExternalType::Memory(*self.memories.get(index).ok_or_else(missing)?),
            Kind::Global => ExternalType::Global(*self.globals.get(index).ok_or_else(missing)?),
            _ => ExternalType::Tag,
        };
        self.exports.push(ExportDescriptor {
            external_name: export.name.to_owned(),
            ty,
        });
        Ok(())
    }

    fn function_type(&self, index: u32) -> Result<FunctionType, RuntimeError> {
        self.types
            .get(index as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| RuntimeError::parse(format!("type index {index} is not a function type")))
    }

    fn table(ty: &wasmparser::TableType) -> Result<TableType, RuntimeError> {
        let ref_kind = kind_from_parser(&wasmparser::ValType::Ref(ty.element_type))?;
        Ok(TableType {
            ref_kind,
            limit: Limit::from_parts(u64::from(ty.initial), ty.maximum.map(u64::from)),
        })
    }

    fn memory(ty: &wasmparser::MemoryType) -> MemoryType {
        MemoryType {
            limit: Limit::from_parts(ty.initial, ty.maximum),
            shared: ty.shared,
        }
    }

    fn global(ty: &wasmparser::GlobalType) -> Result<GlobalType, RuntimeError> {
        Ok(GlobalType {
            kind: kind_from_parser(&ty.content_type)?,
            mutability: if ty.mutable {
                Mutability::Var
            } else {
                Mutability::Const
            },
        })
    }
}
