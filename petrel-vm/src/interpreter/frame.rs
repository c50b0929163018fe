//! Frame entry: argument binding and cell promotion.

use std::sync::Arc;

use crate::checked::SafeInt;
use crate::consts::ALLOC_HEADER;
use crate::error::RuntimeError;
use crate::estimate::{estimate_make, round_alloc, MakeTemplate};
use crate::interpreter::Frame;
use crate::thread::Thread;
use crate::value::{CellSlot, Closure, Dict, Value};

/// Bind actual arguments to formal parameters in the frame's local slots.
///
/// Locals are laid out parameters first: positional-or-keyword parameters,
/// then keyword-only ones, then the `*args` slot, then the `**kwargs` slot.
/// Surplus positionals spill into `*args`, surplus keywords into `**kwargs`,
/// defaults fill the rest, and a mandatory marker in the defaults reports a
/// missing argument. Every container this builds is debited first.
pub(super) fn bind_args(
    thread: &mut Thread,
    closure: &Closure,
    frame: &mut Frame,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<(), RuntimeError> {
    let code = &closure.code;
    let func = code.name.as_str();
    let nparams = code.num_params as usize;
    let npos_params = nparams.saturating_sub(code.num_kwonly_params as usize);

    let kwdict = if code.has_kwargs {
        thread.add_allocs(estimate_make(
            &MakeTemplate::mapping_of_values(),
            SafeInt::from(kwargs.len()),
        ))?;
        Some(Arc::new(Dict::new()))
    } else {
        None
    };

    // Positional arguments, surplus into *args.
    let got = args.len();
    let mut args = args.into_iter();
    for slot in frame.regs.iter_mut().take(npos_params.min(got)) {
        if let Some(v) = args.next() {
            *slot = v;
        }
    }
    let surplus: Vec<Value> = args.collect();
    if code.has_varargs {
        thread.add_allocs(estimate_make(
            &MakeTemplate::sequence_of::<Value>(),
            SafeInt::from(surplus.len()),
        ))?;
        frame.regs[nparams] = Value::Tuple(Arc::from(surplus));
    } else if !surplus.is_empty() {
        return Err(RuntimeError::TooManyPositional {
            func: func.to_owned(),
            want: npos_params,
            got,
        });
    }

    // Keyword arguments, surplus into **kwargs.
    for (name, v) in kwargs {
        let param = code
            .locals
            .iter()
            .take(nparams)
            .position(|b| b.name == name);
        match param {
            Some(i) => {
                if !matches!(frame.regs[i], Value::Unbound) {
                    return Err(RuntimeError::MultipleValues {
                        func: func.to_owned(),
                        name,
                    });
                }
                frame.regs[i] = v;
            }
            None => match &kwdict {
                Some(kd) => {
                    let key = Value::str(&name);
                    if kd.contains(&key)? {
                        return Err(RuntimeError::DuplicateKeyword { name });
                    }
                    kd.insert(key, v)?;
                }
                None => {
                    return Err(RuntimeError::UnexpectedKeyword {
                        func: func.to_owned(),
                        name,
                    });
                }
            },
        }
    }
    if let Some(kd) = kwdict {
        let slot = nparams + usize::from(code.has_varargs);
        frame.regs[slot] = Value::Dict(kd);
    }

    // Defaults cover the trailing parameters; a mandatory marker means the
    // keyword-only parameter has no default and must have been supplied.
    let first_default = nparams.saturating_sub(closure.defaults.len());
    for i in 0..nparams {
        if !matches!(frame.regs[i], Value::Unbound) {
            continue;
        }
        let fallback = i
            .checked_sub(first_default)
            .and_then(|d| closure.defaults.get(d))
            .cloned();
        match fallback {
            Some(Value::Mandatory) | None => {
                return Err(RuntimeError::MissingArgument {
                    func: func.to_owned(),
                    name: code.locals[i].name.clone(),
                });
            }
            Some(v) => frame.regs[i] = v,
        }
    }
    Ok(())
}

/// Replace each local listed as a cell with a fresh single-slot box, each
/// box debited separately.
pub(super) fn promote_cells(
    thread: &mut Thread,
    closure: &Closure,
    frame: &mut Frame,
) -> Result<(), RuntimeError> {
    let cell_cost = round_alloc(SafeInt::from(
        ALLOC_HEADER + core::mem::size_of::<CellSlot>() as u64,
    ));
    for &i in &closure.code.cells {
        thread.add_allocs(cell_cost)?;
        let i = i as usize;
        let v = core::mem::replace(&mut frame.regs[i], Value::Unbound);
        frame.regs[i] = Value::Cell(Arc::new(CellSlot::new(v)));
    }
    Ok(())
}
