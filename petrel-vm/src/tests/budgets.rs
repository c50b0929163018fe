//! Quota enforcement end to end.

use indexmap::IndexMap;
use petrel_bytecode::Opcode;
use quickcheck_macros::quickcheck;

use crate::checked::SafeInt;
use crate::error::SafetyError;
use crate::interpreter::init_program;
use crate::tests::asm::{empty_program, Asm, ProgramBuilder};
use crate::thread::Thread;

/// `g = [0] * 1000`.
fn list_repeat_program() -> std::sync::Arc<petrel_bytecode::Program> {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (zero, n) = (b.int(0), b.int(1000));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, zero)
        .opa(Opcode::MakeList, 1)
        .opa(Opcode::Constant, n)
        .op(Opcode::Mul)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    b.build(a.build("<toplevel>"))
}

#[test]
fn list_repeat_fits_once_but_not_twice() {
    // Measure one unconstrained run to size the budget.
    let program = list_repeat_program();
    let mut probe = Thread::new("probe");
    init_program(&mut probe, program.clone(), IndexMap::new()).unwrap();
    let one_run = probe.allocs().get().unwrap();
    // 1000 elements cost at least 1000 value slots.
    assert!(one_run >= 1000 * core::mem::size_of::<crate::value::Value>() as i64);

    // With the budget set to exactly one run, the first run completes and
    // the second fails: the counter persists on the thread.
    let mut t = Thread::new("budgeted");
    t.set_max_allocs(one_run);
    init_program(&mut t, program.clone(), IndexMap::new()).unwrap();
    assert_eq!(t.allocs().get(), Some(one_run));
    let err = init_program(&mut t, program, IndexMap::new()).unwrap_err();
    assert!(matches!(
        err.safety(),
        Some(SafetyError::TooManyAllocs { .. })
    ));
}

/// 1000 iterations of `i = i + 1`.
fn counting_loop_program() -> std::sync::Arc<petrel_bytecode::Program> {
    let mut b = ProgramBuilder::new();
    let (zero, one, n) = (b.int(0), b.int(1), b.int(1000));
    let mut a = Asm::new().local("i");
    a.opa(Opcode::Constant, zero).opa(Opcode::SetLocal, 0);
    let top = a.here();
    a.opa(Opcode::Local, 0)
        .opa(Opcode::Constant, n)
        .op(Opcode::Ge);
    let exit = a.fwd(Opcode::CJmp);
    a.opa(Opcode::Local, 0)
        .opa(Opcode::Constant, one)
        .op(Opcode::Add)
        .opa(Opcode::SetLocal, 0)
        .opa(Opcode::Jmp, top);
    a.patch(exit);
    a.op(Opcode::None).op(Opcode::Return);
    b.build(a.build("<toplevel>"))
}

#[test]
fn step_budget_stops_the_loop_and_cancels() {
    let mut t = Thread::new("steps");
    t.set_max_steps(100);
    let err = init_program(&mut t, counting_loop_program(), IndexMap::new()).unwrap_err();
    assert!(matches!(err.safety(), Some(SafetyError::TooManySteps { .. })));
    // The breach is observable and the thread is cancelled.
    assert_eq!(t.steps().get(), Some(101));
    assert!(t.context().err().is_some());
    assert!(t.context().done().is_closed());
}

#[test]
fn excessive_repeat_is_refused_before_allocating() {
    // Baseline: an identical thread running `None` pays only frame entry.
    let mut baseline = Thread::new("baseline");
    init_program(&mut baseline, empty_program(), IndexMap::new()).unwrap();
    let frame_only = baseline.allocs().get().unwrap();

    let mut b = ProgramBuilder::new();
    let (s, n) = (b.str_("a"), b.int(1i64 << 31));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, s)
        .opa(Opcode::Constant, n)
        .op(Opcode::Mul)
        .op(Opcode::Return);
    let mut t = Thread::new("repeat");
    let err = init_program(&mut t, b.build(a.build("<toplevel>")), IndexMap::new()).unwrap_err();
    assert!(matches!(
        err.runtime(),
        Some(crate::error::RuntimeError::ExcessiveRepeat { .. })
    ));
    // The refusal happened before any repeat allocation was debited.
    assert_eq!(t.allocs().get(), Some(frame_only));
    assert!(t.context().err().is_none(), "no quota was breached");
}

#[quickcheck]
fn alloc_counter_is_the_checked_sum(deltas: Vec<i32>) -> bool {
    let t = Thread::new("sum");
    let mut expected = SafeInt::ZERO;
    let mut poisoned = false;
    for d in deltas {
        let result = t.add_allocs(i64::from(d));
        if poisoned {
            if result.is_ok() {
                return false;
            }
            continue;
        }
        let next = expected + SafeInt::from(i64::from(d));
        match next.non_negative() {
            Some(_) => {
                expected = next;
                if result.is_err() {
                    return false;
                }
            }
            None => {
                // Underflow poisons the counter and fails this and every
                // later call.
                poisoned = true;
                if result.is_ok() {
                    return false;
                }
            }
        }
    }
    if poisoned {
        !t.allocs().valid()
    } else {
        t.allocs() == expected
    }
}

#[quickcheck]
fn check_never_mutates(deltas: Vec<u16>) -> bool {
    let t = Thread::new("check");
    t.set_max_steps(1000);
    for d in &deltas {
        let first = t.check_steps(u32::from(*d)).is_ok();
        let second = t.check_steps(u32::from(*d)).is_ok();
        if first != second {
            return false;
        }
    }
    t.steps() == SafeInt::ZERO
}

#[test]
fn breach_point_is_the_first_offending_prefix() {
    let t = Thread::new("prefix");
    t.set_max_allocs(100);
    t.add_allocs(40u32).unwrap();
    t.add_allocs(40u32).unwrap();
    let err = t.add_allocs(40u32).unwrap_err();
    match err {
        SafetyError::TooManyAllocs { allocs, max } => {
            assert_eq!(allocs.get(), Some(120));
            assert_eq!(max.get(), Some(100));
        }
        other => panic!("unexpected: {other}"),
    }
    // Prior increments are observable.
    assert_eq!(t.allocs().get(), Some(120));
}
