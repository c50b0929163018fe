//! The instruction loop.
//!
//! Each iteration debits one step (which also observes the cancellation
//! state), decodes the opcode and its immediate, and executes it. Every
//! failure breaks out of the loop with the program counter pinned into the
//! frame record so the backtrace names the failure site. The deferred tail
//! of frame exit drains the iterator stack in LIFO order, surfacing a late
//! iterator error that a normal return would otherwise swallow.

use std::sync::Arc;

use petrel_bytecode::{decode_uvarint, Opcode};

use crate::checked::SafeInt;
use crate::consts::ALLOC_HEADER;
use crate::error::{EvalError, RuntimeError};
use crate::estimate::{estimate_make, round_alloc, MakeTemplate};
use crate::interpreter::{binary, call, collect_iterable, eval_err, flow, universe, Frame};
use crate::interpreter::binary::BinOp;
use crate::thread::Thread;
use crate::value::{
    compare_values, iterate_with, values_equal, Closure, Dict, Value,
};

/// Execute `closure`'s body in `frame`, then run the deferred frame-exit
/// tail. The frame comes back for recycling in both outcomes.
pub(super) fn exec(
    thread: &mut Thread,
    closure: &Arc<Closure>,
    mut frame: Frame,
) -> (Frame, Result<Value, EvalError>) {
    let mut result = run(thread, closure, &mut frame);
    while let Some(mut it) = frame.iters.pop() {
        it.done();
        if result.is_ok() {
            if let Some(e) = it.err() {
                result = Err(eval_err(thread, e));
            }
        }
    }
    (frame, result)
}

fn fail(thread: &mut Thread, pc: usize, e: RuntimeError) -> EvalError {
    if let Some(top) = thread.stack.last_mut() {
        top.pc = u32::try_from(pc).unwrap_or(u32::MAX);
    }
    EvalError::from_runtime(e, thread.call_stack())
}

#[allow(clippy::too_many_lines)]
fn run(thread: &mut Thread, closure: &Arc<Closure>, frame: &mut Frame) -> Result<Value, EvalError> {
    let code_arc = Arc::clone(&closure.code);
    let code: &[u8] = &code_arc.code;
    let module = Arc::clone(&closure.module);
    let map_entry_cost = {
        let t = MakeTemplate::mapping_of_values();
        estimate_make(&t, SafeInt::from(1u32)) - estimate_make(&t, SafeInt::ZERO)
    };
    let mut pc: usize = 0;
    let mut op_pc: usize = 0;

    macro_rules! bail {
        ($e:expr) => {
            return Err(fail(thread, op_pc, $e.into()))
        };
    }
    macro_rules! tryrt {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(e) => bail!(e),
            }
        };
    }
    macro_rules! push {
        ($v:expr) => {
            frame.regs.push($v)
        };
    }
    macro_rules! pop {
        () => {
            frame.regs.pop().expect("operand stack underflow")
        };
    }
    macro_rules! binop {
        ($op:expr) => {{
            let y = pop!();
            let x = pop!();
            let v = tryrt!(binary::binary(thread, $op, &x, &y));
            push!(v);
        }};
    }
    macro_rules! unop {
        ($tok:expr) => {{
            let x = pop!();
            let v = tryrt!(binary::unary(thread, $tok, &x));
            push!(v);
        }};
    }
    macro_rules! cmpop {
        ($want:ident) => {{
            let y = pop!();
            let x = pop!();
            let ord = tryrt!(compare_values(&x, &y));
            push!(Value::Bool(ord.$want()));
        }};
    }

    loop {
        op_pc = pc;
        tryrt!(thread.add_steps(1u32));

        let byte = code[pc];
        pc += 1;
        let op = Opcode::try_from(byte).expect("validated opcode stream");
        let arg: u32 = if op.has_arg() {
            let (v, next) = decode_uvarint(code, pc).expect("validated immediate");
            pc = next;
            v
        } else {
            0
        };
        tracing::trace!(pc = op_pc, op = %op, arg, "instruction");

        match op {
            Opcode::Nop => {}
            Opcode::Dup => {
                let v = frame.regs.last().cloned().expect("operand stack underflow");
                push!(v);
            }
            Opcode::Dup2 => {
                let n = frame.regs.len();
                let a = frame.regs[n - 2].clone();
                let b = frame.regs[n - 1].clone();
                push!(a);
                push!(b);
            }
            Opcode::Pop => {
                let _ = pop!();
            }
            Opcode::Exch => {
                let n = frame.regs.len();
                frame.regs.swap(n - 1, n - 2);
            }

            Opcode::None => push!(Value::None),
            Opcode::True => push!(Value::Bool(true)),
            Opcode::False => push!(Value::Bool(false)),
            Opcode::Mandatory => push!(Value::Mandatory),
            Opcode::MakeDict => {
                let cost = estimate_make(&MakeTemplate::mapping_of_values(), SafeInt::ZERO)
                    + round_alloc(SafeInt::from(
                        ALLOC_HEADER + core::mem::size_of::<Dict>() as u64,
                    ));
                tryrt!(thread.add_allocs(cost));
                push!(Value::Dict(Arc::new(Dict::new())));
            }

            Opcode::Eq => {
                let y = pop!();
                let x = pop!();
                push!(Value::Bool(tryrt!(values_equal(&x, &y))));
            }
            Opcode::Ne => {
                let y = pop!();
                let x = pop!();
                push!(Value::Bool(!tryrt!(values_equal(&x, &y))));
            }
            Opcode::Lt => cmpop!(is_lt),
            Opcode::Le => cmpop!(is_le),
            Opcode::Gt => cmpop!(is_gt),
            Opcode::Ge => cmpop!(is_ge),

            Opcode::Add => binop!(BinOp::Add),
            Opcode::Sub => binop!(BinOp::Sub),
            Opcode::Mul => binop!(BinOp::Mul),
            Opcode::Div => binop!(BinOp::Div),
            Opcode::FloorDiv => binop!(BinOp::FloorDiv),
            Opcode::Mod => binop!(BinOp::Mod),
            Opcode::BitAnd => binop!(BinOp::BitAnd),
            Opcode::BitOr => binop!(BinOp::BitOr),
            Opcode::BitXor => binop!(BinOp::BitXor),
            Opcode::Shl => binop!(BinOp::Shl),
            Opcode::Shr => binop!(BinOp::Shr),

            Opcode::UPlus => unop!("+"),
            Opcode::UMinus => unop!("-"),
            Opcode::Invert => unop!("~"),
            Opcode::Not => {
                let x = pop!();
                push!(Value::Bool(!x.truth()));
            }
            Opcode::In => {
                let y = pop!();
                let x = pop!();
                push!(Value::Bool(tryrt!(flow::membership(thread, &x, &y))));
            }
            Opcode::NotIn => {
                let y = pop!();
                let x = pop!();
                push!(Value::Bool(!tryrt!(flow::membership(thread, &x, &y))));
            }

            Opcode::Index => {
                let i = pop!();
                let x = pop!();
                push!(tryrt!(flow::index(thread, &x, &i)));
            }
            Opcode::SetIndex => {
                let v = pop!();
                let i = pop!();
                let x = pop!();
                if matches!(x, Value::Dict(_)) {
                    tryrt!(thread.add_allocs(map_entry_cost));
                }
                tryrt!(flow::set_index(thread, &x, &i, v));
            }
            Opcode::SetKey | Opcode::SetKeyUnique => {
                let v = pop!();
                let k = pop!();
                let d = pop!();
                let Value::Dict(d) = d else {
                    bail!(RuntimeError::NotSettable {
                        type_name: d.type_name(),
                    });
                };
                tryrt!(thread.add_allocs(map_entry_cost));
                if op == Opcode::SetKeyUnique {
                    tryrt!(d.insert_unique(k, v));
                } else {
                    tryrt!(d.insert(k, v));
                }
            }
            Opcode::Append => {
                let v = pop!();
                let l = pop!();
                let Value::List(l) = l else {
                    bail!(RuntimeError::NotSettable {
                        type_name: l.type_name(),
                    });
                };
                tryrt!(flow::append_to_list(thread, &l, v));
            }
            Opcode::Slice => {
                let step = pop!();
                let hi = pop!();
                let lo = pop!();
                let x = pop!();
                push!(tryrt!(flow::slice(thread, &x, &lo, &hi, &step)));
            }

            Opcode::InplaceAdd => {
                let y = pop!();
                let x = pop!();
                if let Value::List(l) = &x {
                    tryrt!(flow::extend_list(thread, l, &y));
                    push!(x);
                } else {
                    let v = tryrt!(binary::binary(thread, BinOp::Add, &x, &y));
                    push!(v);
                }
            }
            Opcode::InplacePipe => {
                let y = pop!();
                let x = pop!();
                if let (Value::Dict(xd), Value::Dict(yd)) = (&x, &y) {
                    tryrt!(thread.add_allocs(map_entry_cost * SafeInt::from(yd.len())));
                    tryrt!(thread.add_steps(yd.len()));
                    tryrt!(xd.update_from(yd));
                    push!(x);
                } else {
                    let v = tryrt!(binary::binary(thread, BinOp::BitOr, &x, &y));
                    push!(v);
                }
            }

            Opcode::IterPush => {
                let x = pop!();
                let it = tryrt!(iterate_with(thread, &x));
                frame.iters.push(it);
            }
            Opcode::IterJmp => {
                let next = frame
                    .iters
                    .last_mut()
                    .expect("iterator stack underflow")
                    .next();
                match next {
                    Some(v) => push!(v),
                    None => {
                        if let Some(e) = frame.iters.last().and_then(|it| it.err()) {
                            bail!(e);
                        }
                        pc = arg as usize;
                    }
                }
            }
            Opcode::IterPop => {
                let mut it = frame.iters.pop().expect("iterator stack underflow");
                it.done();
                if let Some(e) = it.err() {
                    bail!(e);
                }
            }

            Opcode::Return => return Ok(pop!()),

            Opcode::Constant => {
                push!(module.constant(arg as usize).expect("constant index"));
            }
            Opcode::MakeTuple => {
                let n = arg as usize;
                tryrt!(thread.add_allocs(estimate_make(
                    &MakeTemplate::sequence_of::<Value>(),
                    SafeInt::from(n),
                )));
                let items = frame.regs.split_off(frame.regs.len() - n);
                push!(Value::Tuple(Arc::from(items)));
            }
            Opcode::MakeList => {
                let n = arg as usize;
                let cost = estimate_make(&MakeTemplate::sequence_of::<Value>(), SafeInt::from(n))
                    + round_alloc(SafeInt::from(
                        ALLOC_HEADER + core::mem::size_of::<crate::value::List>() as u64,
                    ));
                tryrt!(thread.add_allocs(cost));
                let items = frame.regs.split_off(frame.regs.len() - n);
                push!(Value::List(Arc::new(crate::value::List::from_values(
                    items
                ))));
            }
            Opcode::MakeFunc => {
                let Value::Tuple(free) = pop!() else {
                    panic!("malformed MakeFunc captures");
                };
                let Value::Tuple(defaults) = pop!() else {
                    panic!("malformed MakeFunc defaults");
                };
                let fc = module
                    .program
                    .functions
                    .get(arg as usize)
                    .expect("function index")
                    .clone();
                let slots = (defaults.len() + free.len()) as u64;
                tryrt!(thread.add_allocs(round_alloc(SafeInt::from(
                    ALLOC_HEADER
                        + core::mem::size_of::<Closure>() as u64
                        + slots * core::mem::size_of::<Value>() as u64,
                ))));
                push!(Value::Function(Arc::new(Closure {
                    code: fc,
                    module: Arc::clone(&module),
                    defaults: defaults.iter().cloned().collect(),
                    free: free.iter().cloned().collect(),
                })));
            }

            Opcode::Jmp => pc = arg as usize,
            Opcode::CJmp => {
                let c = pop!();
                if c.truth() {
                    pc = arg as usize;
                }
            }

            Opcode::Call | Opcode::CallVar | Opcode::CallKw | Opcode::CallVarKw => {
                let npos = (arg >> 8) as usize;
                let nnamed = (arg & 0xff) as usize;
                let kwargs_v = matches!(op, Opcode::CallKw | Opcode::CallVarKw)
                    .then(|| pop!());
                let varargs_v = matches!(op, Opcode::CallVar | Opcode::CallVarKw)
                    .then(|| pop!());
                let mut named: Vec<(String, Value)> = Vec::with_capacity(nnamed);
                for _ in 0..nnamed {
                    let v = pop!();
                    let Value::Str(k) = pop!() else {
                        panic!("malformed call: keyword name is not a string constant");
                    };
                    named.push((k.as_ref().to_owned(), v));
                }
                named.reverse();
                let mut pos = frame.regs.split_off(frame.regs.len() - npos);
                let f = pop!();
                if let Some(va) = varargs_v {
                    let extra = tryrt!(collect_iterable(thread, &va));
                    pos.extend(extra);
                }
                if let Some(kw) = kwargs_v {
                    let Value::Dict(kw) = kw else {
                        bail!(RuntimeError::Format {
                            msg: "argument after ** must be a dict".to_owned(),
                        });
                    };
                    for (k, v) in kw.snapshot() {
                        let Value::Str(k) = k else {
                            bail!(RuntimeError::KwargsNonStringKey {
                                type_name: k.type_name(),
                            });
                        };
                        if named.iter().any(|(n, _)| n.as_str() == k.as_ref()) {
                            bail!(RuntimeError::DuplicateKeyword {
                                name: k.as_ref().to_owned(),
                            });
                        }
                        named.push((k.as_ref().to_owned(), v));
                    }
                }
                // Interpreted callees are known not to mutate their
                // arguments; everything else gets a defensive copy, debited.
                if !matches!(f, Value::Function(_)) {
                    tryrt!(thread.add_allocs(estimate_make(
                        &MakeTemplate::sequence_of::<Value>(),
                        SafeInt::from(pos.len()),
                    )));
                }
                if let Some(top) = thread.stack.last_mut() {
                    top.pc = u32::try_from(op_pc).unwrap_or(u32::MAX);
                }
                let v = call::call_value(thread, &f, pos, named)?;
                push!(v);
            }

            Opcode::Load => {
                let n = arg as usize;
                let Value::Str(module_name) = pop!() else {
                    panic!("malformed load: module name is not a string");
                };
                let mut names = Vec::with_capacity(n);
                for _ in 0..n {
                    let Value::Str(name) = pop!() else {
                        panic!("malformed load: name is not a string");
                    };
                    names.push(name);
                }
                names.reverse();
                let Some(mut loader) = thread.load.take() else {
                    bail!(RuntimeError::LoadUnsupported);
                };
                // The loader runs outside the profiling span.
                thread.profiler.pause();
                let loaded = loader(thread, &module_name);
                thread.profiler.resume();
                thread.load = Some(loader);
                let map = loaded?;
                for name in names {
                    match map.get(name.as_ref()) {
                        Some(v) => push!(v.clone()),
                        None => bail!(RuntimeError::LoadNameMissing {
                            module: module_name.as_ref().to_owned(),
                            name: name.as_ref().to_owned(),
                            hint: flow::nearest_name(
                                &name,
                                map.keys().map(String::as_str)
                            ),
                        }),
                    }
                }
            }

            Opcode::Attr => {
                let name = &module.program.names[arg as usize];
                let x = pop!();
                push!(tryrt!(flow::attr(thread, &x, name)));
            }
            Opcode::SetField => {
                let name = &module.program.names[arg as usize];
                let v = pop!();
                let x = pop!();
                tryrt!(flow::set_field(thread, &x, name, v));
            }

            Opcode::Local => {
                let i = arg as usize;
                let v = frame.regs[i].clone();
                if matches!(v, Value::Unbound) {
                    bail!(RuntimeError::UnboundLocal {
                        name: code_arc.locals[i].name.clone(),
                    });
                }
                push!(v);
            }
            Opcode::SetLocal => {
                let v = pop!();
                frame.regs[arg as usize] = v;
            }
            Opcode::LocalCell => {
                let i = arg as usize;
                let Value::Cell(cell) = &frame.regs[i] else {
                    panic!("local slot {i} is not a cell");
                };
                let v = cell.get();
                if matches!(v, Value::Unbound) {
                    bail!(RuntimeError::UnboundLocal {
                        name: code_arc.locals[i].name.clone(),
                    });
                }
                push!(v);
            }
            Opcode::SetLocalCell => {
                let v = pop!();
                let Value::Cell(cell) = &frame.regs[arg as usize] else {
                    panic!("local slot {arg} is not a cell");
                };
                cell.set(v);
            }
            Opcode::Free => {
                push!(closure.free[arg as usize].clone());
            }
            Opcode::FreeCell => {
                let Value::Cell(cell) = &closure.free[arg as usize] else {
                    panic!("free variable {arg} is not a cell");
                };
                let v = cell.get();
                if matches!(v, Value::Unbound) {
                    bail!(RuntimeError::UnboundLocal {
                        name: code_arc.freevars[arg as usize].name.clone(),
                    });
                }
                push!(v);
            }
            Opcode::Global => {
                let i = arg as usize;
                match module.global(i) {
                    Some(v) => push!(v),
                    None => bail!(RuntimeError::UnboundGlobal {
                        name: module.program.globals[i].name.clone(),
                    }),
                }
            }
            Opcode::SetGlobal => {
                let v = pop!();
                module.set_global(arg as usize, v);
            }
            Opcode::Predeclared => {
                let name = &module.program.names[arg as usize];
                match module.predeclared(name) {
                    Some(v) => push!(v),
                    None => bail!(RuntimeError::UndefinedName {
                        name: name.clone(),
                        hint: flow::nearest_name(name, module.predeclared_names()),
                    }),
                }
            }
            Opcode::Universal => {
                let name = &module.program.names[arg as usize];
                match universe().get(name) {
                    Some(v) => push!(v.clone()),
                    None => bail!(RuntimeError::UndefinedName {
                        name: name.clone(),
                        hint: flow::nearest_name(
                            name,
                            universe().keys().map(String::as_str)
                        ),
                    }),
                }
            }

            Opcode::Unpack => {
                let want = arg as usize;
                let x = pop!();
                let mut it = tryrt!(iterate_with(thread, &x));
                let mut items = Vec::with_capacity(want);
                while items.len() < want {
                    match it.next() {
                        Some(v) => {
                            tryrt!(thread.add_steps(1u32));
                            items.push(v);
                        }
                        None => break,
                    }
                }
                let surplus = it.next().is_some();
                it.done();
                if let Some(e) = it.err() {
                    bail!(e);
                }
                let got = items.len();
                if got < want {
                    bail!(RuntimeError::UnpackTooFew {
                        want: arg,
                        got: u32::try_from(got).unwrap_or(u32::MAX),
                    });
                }
                if surplus {
                    bail!(RuntimeError::UnpackTooMany { want: arg });
                }
                for v in items {
                    push!(v);
                }
            }
        }
    }
}
