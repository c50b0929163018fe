//! Petrel interpreter core.
//!
//! Petrel is a small, deterministic, Python-dialect configuration language.
//! This crate is the sandboxed core that executes programs compiled by the
//! front-end: a per-execution [`Thread`](thread::Thread) carrying memory and
//! step quotas, cancellation, and safety requirements; a stack-based bytecode
//! VM that enforces those quotas at every allocation and execution step; a
//! pessimistic size estimator that prices values before they are
//! materialised; and the capability gate between a thread and the host
//! callables it is permitted to invoke.
//!
//! The front-end (lexer, parser, resolver, compiler), the standard library
//! of built-ins, and the REPL live elsewhere and talk to this crate through
//! [`petrel_bytecode`] and the [`value`] capability surface.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod backtrace;
pub mod buffers;
pub mod checked;
pub mod consts;
pub mod context;
pub mod error;
pub mod estimate;
pub mod interpreter;
pub mod pool;
pub mod profiler;
pub mod safety;
pub mod thread;
pub mod value;

#[cfg(test)]
mod tests;

#[doc(no_inline)]
pub use petrel_bytecode;

pub mod prelude {
    //! Re-exports for embedding hosts.

    #[doc(no_inline)]
    pub use petrel_bytecode::{
        Binding, Constant, FuncCode, Opcode, Position, Program, CURRENT_VERSION,
    };

    pub use crate::{
        backtrace::CallStack,
        buffers::{SafeAppender, SafeStringBuilder},
        checked::SafeInt,
        context::{CancelContext, CancelReason, Done},
        error::{EvalError, RuntimeError, SafetyError},
        estimate::{estimate, estimate_make, MakeTemplate},
        interpreter::{call, init_program, set_universe, universe, Module},
        profiler::{ProfileData, ProfileReceiver, Profiler, StderrReceiver},
        safety::Safety,
        thread::{Thread, ThreadContext, ThreadHandle},
        value::{
            iterate, Closure, Dict, ForeignIter, ForeignValue, Int, List, ModuleEnv,
            NativeCallable, NativeFn, Value, ValueIterator,
        },
    };
}
