//! Call dispatch: safety gating, recursion detection, frame lifecycle.

use std::sync::Arc;

use crate::checked::SafeInt;
use crate::consts::MAX_CALL_STACK_DEPTH;
use crate::error::{EvalError, RuntimeError};
use crate::estimate::{estimate_make, MakeTemplate};
use crate::interpreter::{eval_err, executors, frame};
use crate::thread::{CallRecord, Thread};
use crate::value::{Closure, Value};

/// Invoke any callable. The safety check runs before any callee effect; the
/// stack depth after a successful call equals the depth before it.
pub(crate) fn call_value(
    thread: &mut Thread,
    f: &Value,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, EvalError> {
    if let Err(e) = thread.check_permits(f) {
        return Err(eval_err(thread, e.into()));
    }
    match f {
        Value::Function(c) => call_closure(thread, c, args, kwargs),
        Value::Native(n) => {
            if thread.stack.len() >= MAX_CALL_STACK_DEPTH {
                return Err(eval_err(thread, RuntimeError::StackOverflow));
            }
            let n = Arc::clone(n);
            thread.stack.push(CallRecord {
                callable: f.clone(),
                pc: 0,
            });
            thread.profiler.begin_span(n.name());
            let result = n.call(thread, args, kwargs);
            thread.profiler.end_span();
            thread.stack.pop();
            result
        }
        other => Err(eval_err(
            thread,
            RuntimeError::NotCallable {
                type_name: other.type_name(),
            },
        )),
    }
}

fn call_closure(
    thread: &mut Thread,
    closure: &Arc<Closure>,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, EvalError> {
    if thread.stack.len() >= MAX_CALL_STACK_DEPTH {
        return Err(eval_err(thread, RuntimeError::StackOverflow));
    }
    // Recursive self-invocation is forbidden unless the program opts in;
    // identity is the function body, not the closure.
    if !closure.module.program.recursion {
        for rec in &thread.stack {
            if let Value::Function(active) = &rec.callable {
                if Arc::ptr_eq(&active.code, &closure.code) {
                    return Err(eval_err(
                        thread,
                        RuntimeError::RecursionDisallowed {
                            name: closure.name().to_owned(),
                        },
                    ));
                }
            }
        }
    }

    // Operand and locals space is debited before the frame is populated.
    let slots = closure.code.frame_size() as usize;
    if let Err(e) = thread.add_allocs(estimate_make(
        &MakeTemplate::sequence_of::<Value>(),
        SafeInt::from(slots),
    )) {
        return Err(eval_err(thread, e.into()));
    }

    let mut fr = thread.pool.take();
    fr.regs.resize(closure.code.locals.len(), Value::Unbound);
    if let Err(e) = frame::bind_args(thread, closure, &mut fr, args, kwargs)
        .and_then(|()| frame::promote_cells(thread, closure, &mut fr))
    {
        let err = eval_err(thread, e);
        thread.pool.recycle(fr);
        return Err(err);
    }

    thread.stack.push(CallRecord {
        callable: Value::Function(Arc::clone(closure)),
        pc: 0,
    });
    thread.profiler.begin_span(closure.name());

    let (fr, result) = executors::exec(thread, closure, fr);

    thread.profiler.end_span();
    thread.stack.pop();
    thread.pool.recycle(fr);
    result
}
