//! Mutable sequences.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::RuntimeError;
use crate::value::Value;

/// A mutable sequence of values.
///
/// Mutation is rejected once the list is frozen, and while any iteration
/// holds it pinned.
pub struct List {
    items: Mutex<Vec<Value>>,
    frozen: AtomicBool,
    pins: AtomicUsize,
}

impl List {
    /// A list over the given values.
    pub fn from_values(items: Vec<Value>) -> Self {
        Self {
            items: Mutex::new(items),
            frozen: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.items.lock().expect("poisoned").len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("poisoned").is_empty()
    }

    /// Backing capacity, elements.
    pub(crate) fn capacity(&self) -> usize {
        self.items.lock().expect("poisoned").capacity()
    }

    /// The element at `i`, if in range.
    pub fn get(&self, i: usize) -> Option<Value> {
        self.items.lock().expect("poisoned").get(i).cloned()
    }

    /// Replace the element at `i`.
    pub fn set(&self, i: usize, v: Value) -> Result<(), RuntimeError> {
        self.check_mutable()?;
        let mut items = self.items.lock().expect("poisoned");
        let len = items.len();
        match items.get_mut(i) {
            Some(slot) => {
                *slot = v;
                Ok(())
            }
            None => Err(RuntimeError::IndexOutOfRange {
                index: i64::try_from(i).unwrap_or(i64::MAX),
                len,
            }),
        }
    }

    /// Append one element.
    pub fn append(&self, v: Value) -> Result<(), RuntimeError> {
        self.check_mutable()?;
        self.items.lock().expect("poisoned").push(v);
        Ok(())
    }

    /// Run `f` over the backing vector after the mutability check. The
    /// in-place growth paths use this to extend through a thread-bound
    /// appender.
    pub(crate) fn with_backing_mut<R>(
        &self,
        f: impl FnOnce(&mut Vec<Value>) -> R,
    ) -> Result<R, RuntimeError> {
        self.check_mutable()?;
        let mut items = self.items.lock().expect("poisoned");
        Ok(f(&mut items))
    }

    /// Copy of the elements.
    pub fn snapshot(&self) -> Vec<Value> {
        self.items.lock().expect("poisoned").clone()
    }

    /// First element, used as an estimator template sample.
    pub(crate) fn sample_element(&self) -> Option<Value> {
        self.get(0)
    }

    /// Freeze the list and, deeply, its elements. Idempotent.
    pub fn freeze(&self) {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        for v in self.items.lock().expect("poisoned").iter() {
            v.freeze();
        }
    }

    /// Whether the list is frozen.
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
            return Err(RuntimeError::Immutable { type_name: "list" });
        }
        if self.pins.load(Ordering::Acquire) > 0 {
            return Err(RuntimeError::MutatedDuringIteration { type_name: "list" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_get_set() {
        let l = List::from_values(vec![Value::from(1i64)]);
        l.append(Value::from(2i64)).unwrap();
        assert_eq!(l.len(), 2);
        l.set(0, Value::from(10i64)).unwrap();
        assert_eq!(l.get(0).unwrap().repr(), "10");
        assert!(l.get(5).is_none());
        assert!(matches!(
            l.set(5, Value::None),
            Err(RuntimeError::IndexOutOfRange { index: 5, len: 2 })
        ));
    }

    #[test]
    fn frozen_lists_reject_mutation() {
        let l = List::from_values(vec![Value::from(1i64)]);
        l.freeze();
        l.freeze(); // idempotent
        assert!(matches!(
            l.append(Value::None),
            Err(RuntimeError::Immutable { type_name: "list" })
        ));
        assert!(l.set(0, Value::None).is_err());
    }

    #[test]
    fn pinned_lists_reject_mutation_until_unpinned() {
        let l = List::from_values(vec![Value::from(1i64)]);
        l.pin();
        assert!(matches!(
            l.append(Value::None),
            Err(RuntimeError::MutatedDuringIteration { type_name: "list" })
        ));
        l.unpin();
        l.append(Value::None).unwrap();
    }

    #[test]
    fn freezing_is_deep() {
        let inner = std::sync::Arc::new(List::from_values(vec![]));
        let l = List::from_values(vec![Value::List(std::sync::Arc::clone(&inner))]);
        l.freeze();
        assert!(inner.is_frozen());
    }
}
