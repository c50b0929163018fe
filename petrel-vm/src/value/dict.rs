//! Mutable insertion-ordered mappings.
//!
//! Iteration order is insertion order; the language is deterministic, so no
//! user-observable order may depend on hashing.

use core::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::value::cmp::{hash_value, values_equal_infallible};
use crate::value::Value;

/// A key with its cached hash. Equality is structural value equality; keys
/// are verified hashable before they get here, so it cannot fail.
struct DKey {
    hash: u64,
    key: Value,
}

impl Hash for DKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for DKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && values_equal_infallible(&self.key, &other.key)
    }
}

impl Eq for DKey {}

/// A mutable mapping with insertion-ordered entries.
pub struct Dict {
    entries: Mutex<IndexMap<DKey, Value>>,
    frozen: AtomicBool,
    pins: AtomicUsize,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    /// A fresh empty dictionary.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            frozen: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
        }
    }

    /// Entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned").len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("poisoned").is_empty()
    }

    /// Backing capacity, entries.
    pub(crate) fn capacity(&self) -> usize {
        self.entries.lock().expect("poisoned").capacity()
    }

    /// The value under `key`. Fails only when `key` is unhashable.
    pub fn get(&self, key: &Value) -> Result<Option<Value>, RuntimeError> {
        let dkey = DKey {
            hash: hash_value(key)?,
            key: key.clone(),
        };
        Ok(self.entries.lock().expect("poisoned").get(&dkey).cloned())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &Value) -> Result<bool, RuntimeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert `key → value`, returning the displaced value if any.
    pub fn insert(&self, key: Value, value: Value) -> Result<Option<Value>, RuntimeError> {
        self.check_mutable()?;
        let dkey = DKey {
            hash: hash_value(&key)?,
            key,
        };
        Ok(self.entries.lock().expect("poisoned").insert(dkey, value))
    }

    /// Insert, rejecting a key that is already present; dict literals use
    /// this to surface duplicate keys.
    pub fn insert_unique(&self, key: Value, value: Value) -> Result<(), RuntimeError> {
        self.check_mutable()?;
        let dkey = DKey {
            hash: hash_value(&key)?,
            key,
        };
        let mut entries = self.entries.lock().expect("poisoned");
        if entries.contains_key(&dkey) {
            return Err(RuntimeError::DuplicateDictKey {
                key: dkey.key.repr(),
            });
        }
        entries.insert(dkey, value);
        Ok(())
    }

    /// The entry at insertion position `i`.
    pub fn get_index(&self, i: usize) -> Option<(Value, Value)> {
        self.entries
            .lock()
            .expect("poisoned")
            .get_index(i)
            .map(|(k, v)| (k.key.clone(), v.clone()))
    }

    /// Copy of the entries, in insertion order.
    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.entries
            .lock()
            .expect("poisoned")
            .iter()
            .map(|(k, v)| (k.key.clone(), v.clone()))
            .collect()
    }

    /// Insert every entry of `other`, later entries overriding earlier ones.
    pub fn update_from(&self, other: &Dict) -> Result<(), RuntimeError> {
        for (k, v) in other.snapshot() {
            self.insert(k, v)?;
        }
        Ok(())
    }

    /// Freeze the dictionary and, deeply, its keys and values. Idempotent.
    pub fn freeze(&self) {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        for (k, v) in self.entries.lock().expect("poisoned").iter() {
            k.key.freeze();
            v.freeze();
        }
    }

    /// Whether the dictionary is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    fn check_mutable(&self) -> Result<(), RuntimeError> {
        if self.is_frozen() {
            return Err(RuntimeError::Immutable { type_name: "dict" });
        }
        if self.pins.load(Ordering::Acquire) > 0 {
            return Err(RuntimeError::MutatedDuringIteration { type_name: "dict" });
        }
        Ok(())
    }
}
