//! Process-wide registry of host objects referenced from WebAssembly.
//!
//! An `externref` crossing into the engine carries only an [`ExternRefKey`].
//! The host object itself lives here until the host calls
//! [`ExternRefRegistry::remove`]. Entries are never evicted automatically:
//! the engine cannot tell when a table or global stops referencing a key.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use uuid::Uuid;

/// Shared host object stored behind an `externref`.
pub type HostObject = Arc<dyn Any + Send + Sync>;

static REGISTRY: LazyLock<DashMap<ExternRefKey, HostObject>> = LazyLock::new(DashMap::new);

/// Opaque key identifying a registered host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternRefKey(Uuid);

impl ExternRefKey {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ExternRefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Accessor for the process-wide registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternRefRegistry;

impl ExternRefRegistry {
    /// Register a host object and return its fresh key.
    pub fn insert<T: Any + Send + Sync>(object: T) -> ExternRefKey {
        Self::insert_shared(Arc::new(object))
    }

    /// Register an already shared host object.
    ///
    /// Inserting the same `Arc` twice yields two keys pointing at one object.
    pub fn insert_shared(object: HostObject) -> ExternRefKey {
        let key = ExternRefKey::generate();
        REGISTRY.insert(key, object);
        key
    }

    /// Look up the object behind a key.
    pub fn get(key: ExternRefKey) -> Option<HostObject> {
        REGISTRY.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up the object behind a key and downcast it.
    pub fn get_as<T: Any + Send + Sync>(key: ExternRefKey) -> Option<Arc<T>> {
        Self::get(key).and_then(|object| object.downcast::<T>().ok())
    }

    /// Remove a key, returning the object it held.
    ///
    /// WebAssembly storage still holding the key will read back a key that no
    /// longer resolves.
    pub fn remove(key: ExternRefKey) -> Option<HostObject> {
        REGISTRY.remove(&key).map(|(_, object)| object)
    }

    /// Whether the key is registered.
    pub fn contains(key: ExternRefKey) -> bool {
        REGISTRY.contains_key(&key)
    }

    /// Number of live entries.
    pub fn len() -> usize {
        REGISTRY.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let key = ExternRefRegistry::insert(42_i32);
        assert!(ExternRefRegistry::contains(key));
        assert_eq!(*ExternRefRegistry::get_as::<i32>(key).unwrap(), 42);
        assert!(ExternRefRegistry::get_as::<String>(key).is_none());
        ExternRefRegistry::remove(key);
    }

    #[test]
    fn test_reference_identity() {
        let object: HostObject = Arc::new(String::from("host"));
        let key = ExternRefRegistry::insert_shared(Arc::clone(&object));

        let looked_up = ExternRefRegistry::get(key).unwrap();
        assert!(Arc::ptr_eq(&object, &looked_up));
        ExternRefRegistry::remove(key);
    }

    #[test]
    fn test_keys_are_unique() {
        let a = ExternRefRegistry::insert(1_u8);
        let b = ExternRefRegistry::insert(1_u8);
        assert_ne!(a, b);
        ExternRefRegistry::remove(a);
        ExternRefRegistry::remove(b);
    }

    #[test]
    fn test_remove_is_explicit() {
        let key = ExternRefRegistry::insert(vec![1, 2, 3]);
        let removed = ExternRefRegistry::remove(key).unwrap();
        assert!(removed.downcast_ref::<Vec<i32>>().is_some());
        assert!(!ExternRefRegistry::contains(key));
        assert!(ExternRefRegistry::remove(key).is_none());
    }
}
