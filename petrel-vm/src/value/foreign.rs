//! Host-defined values.
//!
//! A [`ForeignValue`] plugs a host type into the interpreter's capability
//! surface. The required capabilities have defaults; optional capabilities
//! are probed by the VM and exist in a plain and a thread-carrying ("safe")
//! variant. When the thread's required safety set is non-empty the VM only
//! uses safe variants; a value that implements none loses the capability on
//! such threads.

use crate::error::RuntimeError;
use crate::safety::Safety;
use crate::thread::Thread;
use crate::value::Value;

/// A host value exposed to programs.
///
/// `None` from an optional capability means "not supported"; `Some(Err(..))`
/// means the operation was attempted and failed.
#[allow(unused_variables)]
pub trait ForeignValue: Send + Sync {
    /// The value's type tag.
    fn type_name(&self) -> &'static str;

    /// Source-like rendering.
    fn repr(&self) -> String;

    /// Truthiness; defaults to true.
    fn truth(&self) -> bool {
        true
    }

    /// Deep, idempotent freeze.
    fn freeze(&self) {}

    /// Hash, or `None` when unhashable.
    fn hash_code(&self) -> Option<u64> {
        None
    }

    /// The advertised safety set; immutable once constructed. Empty by
    /// default: host values promise nothing.
    fn safety(&self) -> Safety {
        Safety::empty()
    }

    /// Retained heap size in bytes, overriding the estimator's default
    /// traversal for values that know their own footprint.
    fn estimated_size(&self) -> Option<u64> {
        None
    }

    /// Attribute names, used for spelling hints.
    fn attr_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Attribute load.
    fn attr(&self, name: &str) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Attribute load, safe variant.
    fn attr_safe(&self, thread: &Thread, name: &str) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Field store.
    fn set_field(&self, name: &str, v: Value) -> Option<Result<(), RuntimeError>> {
        None
    }

    /// Field store, safe variant.
    fn set_field_safe(
        &self,
        thread: &Thread,
        name: &str,
        v: Value,
    ) -> Option<Result<(), RuntimeError>> {
        None
    }

    /// Subscript load.
    fn index(&self, i: &Value) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Subscript load, safe variant.
    fn index_safe(&self, thread: &Thread, i: &Value) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Subscript store.
    fn set_index(&self, i: &Value, v: Value) -> Option<Result<(), RuntimeError>> {
        None
    }

    /// Subscript store, safe variant.
    fn set_index_safe(
        &self,
        thread: &Thread,
        i: &Value,
        v: Value,
    ) -> Option<Result<(), RuntimeError>> {
        None
    }

    /// Unary operation; `op` is the operator token (`"+"`, `"-"`, `"~"`).
    fn unary(&self, op: &'static str) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Unary operation, safe variant.
    fn unary_safe(
        &self,
        thread: &Thread,
        op: &'static str,
    ) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Binary operation; `this_on_left` distinguishes `x ∘ y` from `y ∘ x`.
    ///
    /// Invoking the plain variant is itself the side effect, so on a thread
    /// whose required safety is non-empty the VM never calls it, not even
    /// to probe: without a safe variant the capability is simply absent
    /// there.
    fn binary(
        &self,
        op: &'static str,
        other: &Value,
        this_on_left: bool,
    ) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Binary operation, safe variant.
    fn binary_safe(
        &self,
        thread: &Thread,
        op: &'static str,
        other: &Value,
        this_on_left: bool,
    ) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// Start an iteration.
    fn iterate(&self) -> Option<Box<dyn ForeignIter>> {
        None
    }

    /// Start an iteration, safe variant.
    fn iterate_safe(&self, thread: &Thread) -> Option<Box<dyn ForeignIter>> {
        None
    }
}

/// A pull-style iterator over a host sequence.
///
/// The VM calls [`ForeignIter::done`] exactly once when the iteration ends,
/// on both success and error paths, and surfaces [`ForeignIter::err`] after
/// exhaustion so a failing producer is not mistaken for a short one.
pub trait ForeignIter: Send {
    /// The next element, or `None` when exhausted or failed.
    fn next(&mut self) -> Option<Value>;

    /// Release resources. Called exactly once.
    fn done(&mut self) {}

    /// The error that ended the iteration early, if any.
    fn err(&self) -> Option<RuntimeError> {
        None
    }
}
