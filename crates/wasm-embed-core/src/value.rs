//! Tagged WebAssembly values and their marshaling to and from the engine.
//!
//! [`Value`] is what the embedding API hands out and accepts. Conversion to
//! the engine representation needs the owning store: `funcref` values index
//! the store's function-reference table, and `externref` values are wrapped
//! around an [`ExternRefKey`].

use std::any::Any;
use std::fmt;
use std::num::IntErrorKind;
use std::sync::Arc;

use wasmtime::{AsContextMut, ExternRef, Func, HeapType, Ref, Val, ValType};

use crate::externref::{ExternRefKey, ExternRefRegistry, HostObject};
use crate::store::HostState;
use wasm_embed_common::RuntimeError;

/// Kind tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValueKind {
    /// Whether this is a reference kind.
    pub fn is_ref(self) -> bool {
        matches!(self, ValueKind::FuncRef | ValueKind::ExternRef)
    }

    pub(crate) fn from_wasmtime(ty: &ValType) -> Result<Self, RuntimeError> {
        Ok(match ty {
            ValType::I32 => ValueKind::I32,
            ValType::I64 => ValueKind::I64,
            ValType::F32 => ValueKind::F32,
            ValType::F64 => ValueKind::F64,
            ValType::V128 => ValueKind::V128,
            ValType::Ref(r) => match r.heap_type() {
                HeapType::Func | HeapType::ConcreteFunc(_) | HeapType::NoFunc => {
                    ValueKind::FuncRef
                }
                HeapType::Extern | HeapType::NoExtern => ValueKind::ExternRef,
                other => {
                    return Err(RuntimeError::invalid_argument(format!(
                        "unsupported reference type: {other:?}"
                    )));
                }
            },
        })
    }

    pub(crate) fn to_wasmtime(self) -> ValType {
        match self {
            ValueKind::I32 => ValType::I32,
            ValueKind::I64 => ValType::I64,
            ValueKind::F32 => ValType::F32,
            ValueKind::F64 => ValType::F64,
            ValueKind::V128 => ValType::V128,
            ValueKind::FuncRef => ValType::FUNCREF,
            ValueKind::ExternRef => ValType::EXTERNREF,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::V128 => "v128",
            ValueKind::FuncRef => "funcref",
            ValueKind::ExternRef => "externref",
        })
    }
}

/// One WebAssembly value.
///
/// The payload is always read through the variant, so a value's kind cannot
/// change after construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(i128),
    /// Index into the owning store's function-reference table, `None` for null.
    FuncRef(Option<u32>),
    /// Registry key of the referenced host object, `None` for null.
    ExternRef(Option<ExternRefKey>),
}

impl Value {
    /// The kind tag.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::V128(_) => ValueKind::V128,
            Value::FuncRef(_) => ValueKind::FuncRef,
            Value::ExternRef(_) => ValueKind::ExternRef,
        }
    }

    /// The zero value of a kind: `0`, `0.0` or a null reference.
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::I32 => Value::I32(0),
            ValueKind::I64 => Value::I64(0),
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::F64 => Value::F64(0.0),
            ValueKind::V128 => Value::V128(0),
            ValueKind::FuncRef => Value::FuncRef(None),
            ValueKind::ExternRef => Value::ExternRef(None),
        }
    }

    /// Parse a `v128` from a decimal literal.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Range`] if the literal lies outside `[-2^127, 2^127-1]`,
    /// [`RuntimeError::InvalidArgument`] if it is not a decimal integer.
    pub fn v128_from_str(literal: &str) -> Result<Self, RuntimeError> {
        match literal.trim().parse::<i128>() {
            Ok(v) => Ok(Value::V128(v)),
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                    Err(RuntimeError::range(literal))
                }
                _ => Err(RuntimeError::invalid_argument(format!(
                    "'{literal}' is not a decimal v128 literal"
                ))),
            },
        }
    }

    /// Register `object` and wrap its key in an `externref`.
    pub fn extern_ref<T: Any + Send + Sync>(object: T) -> Self {
        Value::ExternRef(Some(ExternRefRegistry::insert(object)))
    }

    /// The host object behind an `externref`, if any.
    pub fn extern_ref_object(&self) -> Option<HostObject> {
        match self {
            Value::ExternRef(Some(key)) => ExternRefRegistry::get(*key),
            _ => None,
        }
    }

    /// The host object behind an `externref`, downcast to `T`.
    pub fn extern_ref_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::ExternRef(Some(key)) => ExternRefRegistry::get_as::<T>(*key),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_v128(&self) -> Option<i128> {
        match *self {
            Value::V128(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this is a null reference.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::FuncRef(None) | Value::ExternRef(None))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::V128(v) => write!(f, "{v:#034x}"),
            Value::FuncRef(Some(idx)) => write!(f, "funcref:{idx}"),
            Value::ExternRef(Some(key)) => write!(f, "externref:{key}"),
            Value::FuncRef(None) | Value::ExternRef(None) => f.write_str("null"),
        }
    }
}

/// Render a kind list as `i32, i64`.
pub(crate) fn kinds_to_string(kinds: impl IntoIterator<Item = ValueKind>) -> String {
    kinds
        .into_iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert an API value into the engine representation.
pub(crate) fn to_wasm(
    value: &Value,
    mut store: impl AsContextMut<Data = HostState>,
) -> Result<Val, RuntimeError> {
    Ok(match *value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
        Value::V128(v) => Val::V128(u128::from_le_bytes(v.to_le_bytes()).into()),
        Value::FuncRef(None) => Val::FuncRef(None),
        Value::FuncRef(Some(idx)) => {
            let func = store.as_context().data().func_ref(idx).ok_or_else(|| {
                RuntimeError::invalid_argument(format!("funcref {idx} is unknown to this store"))
            })?;
            Val::FuncRef(Some(func))
        }
        Value::ExternRef(None) => Val::ExternRef(None),
        Value::ExternRef(Some(key)) => {
            let r = ExternRef::new(&mut store, key)
                .map_err(|e| RuntimeError::engine(format!("failed to allocate externref: {e}")))?;
            Val::ExternRef(Some(r))
        }
    })
}

/// Convert an API value into a table element.
pub(crate) fn to_ref(
    value: &Value,
    store: impl AsContextMut<Data = HostState>,
) -> Result<Ref, RuntimeError> {
    match to_wasm(value, store)? {
        Val::FuncRef(f) => Ok(Ref::Func(f)),
        Val::ExternRef(r) => Ok(Ref::Extern(r)),
        _ => Err(RuntimeError::invalid_argument(format!(
            "{} is not a reference value",
            value.kind()
        ))),
    }
}

/// Index of `func` in the store's reference table, adding it on first sight.
fn intern_func(func: &Func, mut store: impl AsContextMut<Data = HostState>) -> u32 {
    let known = {
        let ctx = store.as_context();
        ctx.data()
            .func_refs()
            .iter()
            .position(|f| Func::ptr_eq(&ctx, f, func))
    };
    match known {
        Some(idx) => u32::try_from(idx).unwrap_or(u32::MAX),
        None => store.as_context_mut().data_mut().push_func_ref(*func),
    }
}

/// Convert an engine value back into the API representation.
pub(crate) fn from_wasm(
    val: &Val,
    mut store: impl AsContextMut<Data = HostState>,
) -> Result<Value, RuntimeError> {
    Ok(match val {
        Val::I32(v) => Value::I32(*v),
        Val::I64(v) => Value::I64(*v),
        Val::F32(bits) => Value::F32(f32::from_bits(*bits)),
        Val::F64(bits) => Value::F64(f64::from_bits(*bits)),
        Val::V128(v) => Value::V128(i128::from_le_bytes(v.as_u128().to_le_bytes())),
        Val::FuncRef(None) => Value::FuncRef(None),
        Val::FuncRef(Some(func)) => Value::FuncRef(Some(intern_func(func, &mut store))),
        Val::ExternRef(None) => Value::ExternRef(None),
        Val::ExternRef(Some(r)) => {
            let data = r
                .data(store.as_context())
                .map_err(|e| RuntimeError::engine(format!("stale externref: {e}")))?;
            let key = data
                .and_then(|d| d.downcast_ref::<ExternRefKey>())
                .copied()
                .ok_or_else(|| RuntimeError::engine("externref does not carry a registry key"))?;
            Value::ExternRef(Some(key))
        }
        other => {
            return Err(RuntimeError::engine(format!(
                "unsupported engine value: {other:?}"
            )));
        }
    })
}

/// Convert a table element back into the API representation.
pub(crate) fn from_ref(
    r: &Ref,
    store: impl AsContextMut<Data = HostState>,
) -> Result<Value, RuntimeError> {
    match r {
        Ref::Func(f) => from_wasm(&Val::FuncRef(*f), store),
        Ref::Extern(e) => from_wasm(&Val::ExternRef(*e), store),
        other => Err(RuntimeError::engine(format!(
            "unsupported table element: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_fixed_by_variant() {
        assert_eq!(Value::I32(1).kind(), ValueKind::I32);
        assert_eq!(Value::F64(1.5).kind(), ValueKind::F64);
        assert_eq!(Value::FuncRef(None).kind(), ValueKind::FuncRef);
        assert_eq!(Value::ExternRef(None).kind(), ValueKind::ExternRef);
    }

    #[test]
    fn test_v128_bounds() {
        let max = Value::v128_from_str("170141183460469231731687303715884105727").unwrap();
        assert_eq!(max, Value::V128(i128::MAX));

        let min = Value::v128_from_str("-170141183460469231731687303715884105728").unwrap();
        assert_eq!(min, Value::V128(i128::MIN));

        let err = Value::v128_from_str("170141183460469231731687303715884105728").unwrap_err();
        assert!(matches!(err, RuntimeError::Range { .. }));

        let err = Value::v128_from_str("-170141183460469231731687303715884105729").unwrap_err();
        assert!(matches!(err, RuntimeError::Range { .. }));

        let err = Value::v128_from_str("12abc").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_default_values() {
        assert_eq!(Value::default_for(ValueKind::I64), Value::I64(0));
        assert_eq!(Value::default_for(ValueKind::F32), Value::F32(0.0));
        assert!(Value::default_for(ValueKind::FuncRef).is_null());
        assert!(Value::default_for(ValueKind::ExternRef).is_null());
    }

    #[test]
    fn test_extern_ref_payload() {
        let value = Value::extern_ref(String::from("payload"));
        assert_eq!(value.kind(), ValueKind::ExternRef);
        assert_eq!(value.extern_ref_as::<String>().unwrap().as_str(), "payload");
        assert!(value.extern_ref_as::<i32>().is_none());

        if let Value::ExternRef(Some(key)) = value {
            ExternRefRegistry::remove(key);
        }
        assert!(value.extern_ref_object().is_none());
    }

    #[test]
    fn test_kind_round_trip_through_engine_types() {
        for kind in [
            ValueKind::I32,
            ValueKind::I64,
            ValueKind::F32,
            ValueKind::F64,
            ValueKind::V128,
            ValueKind::FuncRef,
            ValueKind::ExternRef,
        ] {
            assert_eq!(ValueKind::from_wasmtime(&kind.to_wasmtime()).unwrap(), kind);
        }
    }

    #[test]
    fn test_kinds_to_string() {
        assert_eq!(
            kinds_to_string([ValueKind::I32, ValueKind::ExternRef]),
            "i32, externref"
        );
        assert_eq!(kinds_to_string([]), "");
    }
}
