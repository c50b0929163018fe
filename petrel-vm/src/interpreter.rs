//! The bytecode interpreter.
//!
//! A tagged-opcode loop over a byte-aligned instruction stream. Every
//! instruction debits one step and re-observes the cancellation state;
//! every allocation is priced by the estimator and debited before it is
//! materialised; every call is gated by the safety-flag check. The operand
//! stack is an indexed window into the executing frame's register vector.

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;

use petrel_bytecode::Program;

use crate::error::{EvalError, RuntimeError};
use crate::thread::Thread;
use crate::value::{Closure, ModuleEnv, Value, ValueIterator};

mod binary;
mod call;
mod executors;
mod flow;
mod frame;

pub(crate) use call::call_value;

/// A register window plus the frame's iterator stack. Pooled and recycled
/// between calls; see [`crate::pool::FramePool`].
#[derive(Default)]
pub(crate) struct Frame {
    /// Locals first, then the operand stack.
    pub(crate) regs: Vec<Value>,
    /// Live iterations, unwound LIFO at frame exit.
    pub(crate) iters: Vec<ValueIterator>,
}

impl Frame {
    pub(crate) fn clear(&mut self) {
        self.regs.clear();
        for it in &mut self.iters {
            it.done();
        }
        self.iters.clear();
    }
}

/// The result of executing a program's toplevel: its frozen global
/// environment.
#[derive(Debug)]
pub struct Module {
    globals: IndexMap<String, Value>,
}

impl Module {
    /// The frozen globals, in binding order.
    pub fn globals(&self) -> &IndexMap<String, Value> {
        &self.globals
    }

    /// One global by name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Expose the globals map.
    pub fn into_globals(self) -> IndexMap<String, Value> {
        self.globals
    }
}

/// Execute `program`'s toplevel on `thread` with the given predeclared
/// names, returning the frozen module globals.
///
/// The predeclared map is read-only during execution; the host may mutate
/// it between executions.
#[tracing::instrument(skip_all, fields(file = %program.filename, thread = %thread.name()))]
pub fn init_program(
    thread: &mut Thread,
    program: Arc<Program>,
    predeclared: IndexMap<String, Value>,
) -> Result<Module, EvalError> {
    if let Err(e) = program.validate() {
        return Err(EvalError::from_runtime(
            RuntimeError::Program(e),
            thread.call_stack(),
        ));
    }
    let env = Arc::new(ModuleEnv::new(Arc::clone(&program), predeclared));
    let toplevel = Arc::new(Closure {
        code: Arc::clone(&program.toplevel),
        module: Arc::clone(&env),
        defaults: Box::default(),
        free: Box::default(),
    });
    thread.started = true;
    call_value(thread, &Value::Function(toplevel), Vec::new(), Vec::new())?;
    env.freeze();
    Ok(Module {
        globals: env.globals_snapshot(),
    })
}

/// Invoke any callable value with positional and keyword arguments.
#[tracing::instrument(skip_all, fields(thread = %thread.name()))]
pub fn call(
    thread: &mut Thread,
    f: &Value,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, EvalError> {
    thread.started = true;
    call_value(thread, f, args, kwargs)
}

static UNIVERSE: OnceLock<IndexMap<String, Value>> = OnceLock::new();

/// Install the process-wide universe of predeclared names. Effective once;
/// returns whether this call installed it.
pub fn set_universe(map: IndexMap<String, Value>) -> bool {
    UNIVERSE.set(map).is_ok()
}

/// The process-wide universe map; empty unless [`set_universe`] ran.
pub fn universe() -> &'static IndexMap<String, Value> {
    UNIVERSE.get_or_init(IndexMap::new)
}

/// Capture the stack and wrap a runtime failure at its failure site.
pub(crate) fn eval_err(thread: &Thread, e: RuntimeError) -> EvalError {
    EvalError::from_runtime(e, thread.call_stack())
}

/// Iterate a value into a vector, finalising the iterator. Each produced
/// element debits one step.
pub(crate) fn collect_iterable(thread: &Thread, v: &Value) -> Result<Vec<Value>, RuntimeError> {
    let mut it = crate::value::iterate_with(thread, v)?;
    let mut out = Vec::new();
    while let Some(item) = it.next() {
        thread.add_steps(1u32)?;
        out.push(item);
    }
    it.done();
    if let Some(e) = it.err() {
        return Err(e);
    }
    Ok(out)
}
