//! Interpreted functions and their module environment.

use core::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use num_bigint::BigInt;
use petrel_bytecode::{Constant, FuncCode, Program};

use crate::value::{Int, Value};

/// The environment one compiled module executes in: the program, its
/// constants converted to values, the global slots, and the predeclared
/// names the host supplied for this execution.
pub struct ModuleEnv {
    /// The immutable compiled program.
    pub program: Arc<Program>,
    /// Source filename, shared into backtraces.
    pub filename: Arc<str>,
    constants: Box<[Value]>,
    globals: Vec<Mutex<Option<Value>>>,
    predeclared: IndexMap<String, Value>,
}

impl ModuleEnv {
    /// Build the environment for `program`.
    ///
    /// # Panics
    ///
    /// A constant table carrying unparseable big-integer text is a compiler
    /// defect and panics.
    pub(crate) fn new(program: Arc<Program>, predeclared: IndexMap<String, Value>) -> Self {
        let constants = program
            .constants
            .iter()
            .map(|c| match c {
                Constant::Int(v) => Value::Int(Int::from(*v)),
                Constant::BigInt(digits) => {
                    let v = digits
                        .parse::<BigInt>()
                        .expect("malformed big-integer constant");
                    Value::Int(Int::from_bigint(v))
                }
                Constant::Float(v) => Value::Float(*v),
                Constant::Str(s) => Value::str(s),
            })
            .collect();
        let globals = program.globals.iter().map(|_| Mutex::new(None)).collect();
        Self {
            filename: Arc::from(program.filename.as_str()),
            program,
            constants,
            globals,
            predeclared,
        }
    }

    /// The constant at `i`.
    pub(crate) fn constant(&self, i: usize) -> Option<Value> {
        self.constants.get(i).cloned()
    }

    /// The global at slot `i`, if assigned.
    pub fn global(&self, i: usize) -> Option<Value> {
        self.globals.get(i)?.lock().expect("poisoned").clone()
    }

    pub(crate) fn set_global(&self, i: usize, v: Value) {
        if let Some(slot) = self.globals.get(i) {
            *slot.lock().expect("poisoned") = Some(v);
        }
    }

    /// The predeclared value under `name`.
    pub(crate) fn predeclared(&self, name: &str) -> Option<Value> {
        self.predeclared.get(name).cloned()
    }

    /// Names of the predeclared map, for spelling hints.
    pub(crate) fn predeclared_names(&self) -> impl Iterator<Item = &str> {
        self.predeclared.keys().map(String::as_str)
    }

    /// Snapshot of the assigned globals by name, in slot order.
    pub fn globals_snapshot(&self) -> IndexMap<String, Value> {
        self.program
            .globals
            .iter()
            .enumerate()
            .filter_map(|(i, binding)| Some((binding.name.clone(), self.global(i)?)))
            .collect()
    }

    /// Freeze every assigned global, deeply.
    pub fn freeze(&self) {
        for slot in &self.globals {
            if let Some(v) = slot.lock().expect("poisoned").as_ref() {
                v.freeze();
            }
        }
    }
}

impl fmt::Debug for ModuleEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEnv")
            .field("filename", &self.filename)
            .field("globals", &self.globals.len())
            .finish()
    }
}

/// An interpreted function bound to its captured environment: the function
/// body, the enclosing module, default parameter values, and captured
/// free-variable cells.
pub struct Closure {
    /// The compiled body.
    pub code: Arc<FuncCode>,
    /// The module the function was defined in.
    pub module: Arc<ModuleEnv>,
    /// Default values for trailing parameters; mandatory markers stand in
    /// for keyword-only parameters without defaults.
    pub defaults: Box<[Value]>,
    /// Captured cells, in the body's free-variable order.
    pub free: Box<[Value]>,
}

impl Closure {
    /// The function's name.
    pub fn name(&self) -> &str {
        &self.code.name
    }

    pub(crate) fn freeze(&self) {
        for v in self.defaults.iter().chain(self.free.iter()) {
            v.freeze();
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name())
    }
}
