//! The value taxonomy the VM executes over.
//!
//! Values are polymorphic over a small, frozen capability set: every value
//! has a display form, a type tag, truthiness, a freeze operation, and a
//! hash-or-unhashable signal. Optional capabilities (callable, indexable,
//! iterable, attributes, ...) are probed at the VM boundary; host extension
//! points are the [`NativeCallable`] and [`ForeignValue`] trait objects,
//! which carry an advertised safety set fixed at construction.
//!
//! Values are cheap-to-clone handles; mutable containers share state behind
//! `Arc` and are owned, lifecycle-wise, by the host's memory system. The
//! core only accounts for their size.

use core::fmt;
use std::sync::{Arc, Mutex};

use crate::consts::MAX_COMPARE_DEPTH;
use crate::error::RuntimeError;
use crate::safety::Safety;

mod cmp;
mod dict;
mod foreign;
mod function;
mod int;
mod iter;
mod list;
mod native;
mod size;

pub use cmp::{compare_values, hash_value, values_equal};
pub use dict::Dict;
pub use foreign::{ForeignIter, ForeignValue};
pub use function::{Closure, ModuleEnv};
pub use int::Int;
pub(crate) use int::{div_step_cost, mul_step_cost};
pub use iter::{iterate, ValueIterator};
pub(crate) use iter::iterate_with;
pub use list::List;
pub use native::{NativeCallable, NativeFn};
pub(crate) use size::retained_size;

/// A Petrel value.
#[derive(Clone)]
pub enum Value {
    /// The `None` value.
    None,
    /// A boolean.
    Bool(bool),
    /// An integer; promotes from a word to a big integer on overflow.
    Int(Int),
    /// A float.
    Float(f64),
    /// An immutable string.
    Str(Arc<str>),
    /// An immutable sequence.
    Tuple(Arc<[Value]>),
    /// A mutable sequence.
    List(Arc<List>),
    /// A mutable insertion-ordered mapping.
    Dict(Arc<Dict>),
    /// An interpreted function with its captured environment.
    Function(Arc<Closure>),
    /// A host callable.
    Native(Arc<dyn NativeCallable>),
    /// A host-defined value.
    Foreign(Arc<dyn ForeignValue>),
    /// A single-slot box shared between an enclosing function and its
    /// nested closures. Only ever stored in frame locals and capture lists.
    Cell(Arc<CellSlot>),
    /// The marker in a defaults tuple for a keyword-only parameter with no
    /// default. Never observable by user programs.
    Mandatory,
    /// An unassigned frame slot. Never observable by user programs.
    Unbound,
}

impl Value {
    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(s.as_ref()))
    }

    /// Build an integer value.
    pub fn int(v: impl Into<Int>) -> Self {
        Self::Int(v.into())
    }

    /// The value's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Function(_) => "function",
            Self::Native(_) => "builtin_function_or_method",
            Self::Foreign(f) => f.type_name(),
            Self::Cell(_) => "cell",
            Self::Mandatory => "mandatory",
            Self::Unbound => "unbound",
        }
    }

    /// Truthiness.
    pub fn truth(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => !i.is_zero(),
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            Self::Foreign(f) => f.truth(),
            Self::Function(_) | Self::Native(_) => true,
            Self::Cell(_) | Self::Mandatory | Self::Unbound => true,
        }
    }

    /// Deep, idempotent freeze. Frozen containers reject mutation.
    pub fn freeze(&self) {
        match self {
            Self::List(l) => l.freeze(),
            Self::Dict(d) => d.freeze(),
            Self::Tuple(items) => {
                for v in items.iter() {
                    v.freeze();
                }
            }
            Self::Function(c) => c.freeze(),
            Self::Cell(cell) => cell.freeze(),
            Self::Foreign(f) => f.freeze(),
            _ => {}
        }
    }

    /// The advertised safety set.
    ///
    /// Interpreted functions honour budgets by construction and advertise
    /// everything; host callables advertise whatever they were constructed
    /// with (empty by default); plain data advertises everything.
    pub fn safety(&self) -> Safety {
        match self {
            Self::Native(n) => n.safety(),
            Self::Foreign(f) => f.safety(),
            _ => Safety::SAFE,
        }
    }

    /// Quoted, cycle-safe source-like rendering.
    pub fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, MAX_COMPARE_DEPTH);
        out
    }

    fn write_repr(&self, out: &mut String, depth: usize) {
        use core::fmt::Write;
        if depth == 0 {
            out.push_str("...");
            return;
        }
        match self {
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => {
                let _ = write!(out, "{}", fmt_float(*f));
            }
            Self::Str(s) => {
                let _ = write!(out, "{:?}", s.as_ref());
            }
            Self::Tuple(items) => {
                out.push('(');
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    v.write_repr(out, depth - 1);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::List(l) => {
                out.push('[');
                let len = l.len();
                for i in 0..len {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match l.get(i) {
                        Some(v) => v.write_repr(out, depth - 1),
                        None => break,
                    }
                }
                out.push(']');
            }
            Self::Dict(d) => {
                out.push('{');
                let len = d.len();
                for i in 0..len {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match d.get_index(i) {
                        Some((k, v)) => {
                            k.write_repr(out, depth - 1);
                            out.push_str(": ");
                            v.write_repr(out, depth - 1);
                        }
                        None => break,
                    }
                }
                out.push('}');
            }
            Self::Function(c) => {
                let _ = write!(out, "<function {}>", c.name());
            }
            Self::Native(n) => {
                let _ = write!(out, "<built-in function {}>", n.name());
            }
            Self::Foreign(f) => out.push_str(&f.repr()),
            Self::Cell(_) => out.push_str("<cell>"),
            Self::Mandatory => out.push_str("<mandatory>"),
            Self::Unbound => out.push_str("<unbound>"),
        }
    }
}

/// Display is the `str()` form: strings render unquoted, everything else as
/// its repr.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            other => f.write_str(&other.repr()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(Int::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s.as_str()))
    }
}

/// Render a float the way the language does: always with a decimal point or
/// exponent, so it reads back as a float.
pub(crate) fn fmt_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "+inf" } else { "-inf" }.to_owned();
    }
    if f == f.trunc() && f.abs() < 1e17 {
        return format!("{f:.1}");
    }
    format!("{f}")
}

/// A single-slot box carrying one value by shared reference, so an inner
/// closure and its enclosing function observe the same local.
pub struct CellSlot {
    value: Mutex<Value>,
}

impl CellSlot {
    /// A cell holding `v`.
    pub fn new(v: Value) -> Self {
        Self {
            value: Mutex::new(v),
        }
    }

    /// The current content.
    pub fn get(&self) -> Value {
        self.value.lock().expect("poisoned").clone()
    }

    /// Replace the content.
    pub fn set(&self, v: Value) {
        *self.value.lock().expect("poisoned") = v;
    }

    fn freeze(&self) {
        self.value.lock().expect("poisoned").freeze();
    }
}

impl fmt::Debug for CellSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellSlot({:?})", self.get())
    }
}

/// The error for an operation the operand types do not admit.
pub(crate) fn unsupported_binary(op: &'static str, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::UnsupportedBinary {
        op,
        left: left.type_name(),
        right: right.type_name(),
    }
}
