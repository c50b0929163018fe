//! VM behaviour: dispatch, frames, closures, iteration, errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use petrel_bytecode::{Binding, Opcode, Position};

use crate::error::RuntimeError;
use crate::interpreter::{call, init_program, Module};
use crate::safety::Safety;
use crate::tests::asm::{Asm, ProgramBuilder};
use crate::thread::Thread;
use crate::value::{NativeFn, Value};

fn run(b: ProgramBuilder, toplevel: Asm) -> Module {
    let mut t = Thread::new("vm-test");
    init_program(&mut t, b.build(toplevel.build("<toplevel>")), IndexMap::new()).unwrap()
}

fn run_err(b: ProgramBuilder, toplevel: Asm) -> crate::error::EvalError {
    let mut t = Thread::new("vm-test");
    init_program(&mut t, b.build(toplevel.build("<toplevel>")), IndexMap::new()).unwrap_err()
}

#[test]
fn arithmetic_lands_in_globals() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (c1, c2, c3, c4) = (b.int(1), b.int(2), b.int(3), b.int(4));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, c1)
        .opa(Opcode::Constant, c2)
        .op(Opcode::Add)
        .opa(Opcode::Constant, c3)
        .op(Opcode::Mul)
        .opa(Opcode::Constant, c4)
        .op(Opcode::Sub)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "5");
}

#[test]
fn while_loop_counts_to_ten() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (zero, one, ten) = (b.int(0), b.int(1), b.int(10));
    let mut a = Asm::new().local("i");
    a.opa(Opcode::Constant, zero).opa(Opcode::SetLocal, 0);
    let top = a.here();
    a.opa(Opcode::Local, 0)
        .opa(Opcode::Constant, ten)
        .op(Opcode::Ge);
    let exit = a.fwd(Opcode::CJmp);
    a.opa(Opcode::Local, 0)
        .opa(Opcode::Constant, one)
        .op(Opcode::Add)
        .opa(Opcode::SetLocal, 0)
        .opa(Opcode::Jmp, top);
    a.patch(exit);
    a.opa(Opcode::Local, 0)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "10");
}

#[test]
fn function_call_with_keyword_argument() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let mut body = Asm::new().param("a").param("b");
    body.opa(Opcode::Local, 0)
        .opa(Opcode::Local, 1)
        .op(Opcode::Add)
        .op(Opcode::Return);
    let f = b.function(body.build("add"));
    let (three, four, kb) = (b.int(3), b.int(4), b.str_("b"));

    let mut a = Asm::new();
    a.opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeFunc, f)
        .opa(Opcode::Constant, three)
        .opa(Opcode::Constant, kb)
        .opa(Opcode::Constant, four)
        .opa(Opcode::Call, (1 << 8) | 1)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "7");
}

#[test]
fn defaults_varargs_and_kwargs_bind() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let mut body = Asm::new().param("a").param("b").local("args").local("kw");
    body.opa(Opcode::Local, 0)
        .opa(Opcode::Local, 1)
        .opa(Opcode::Local, 2)
        .opa(Opcode::Local, 3)
        .opa(Opcode::MakeTuple, 4)
        .op(Opcode::Return);
    let mut body = body.build("f");
    body.has_varargs = true;
    body.has_kwargs = true;
    let f = b.function(body);
    let (ten, one, two, three, kx, five) =
        (b.int(10), b.int(1), b.int(2), b.int(3), b.str_("x"), b.int(5));

    let mut a = Asm::new();
    a.opa(Opcode::Constant, ten)
        .opa(Opcode::MakeTuple, 1) // defaults: (10,)
        .opa(Opcode::MakeTuple, 0) // no captures
        .opa(Opcode::MakeFunc, f)
        .opa(Opcode::Constant, one)
        .opa(Opcode::Constant, two)
        .opa(Opcode::Constant, three)
        .opa(Opcode::Constant, kx)
        .opa(Opcode::Constant, five)
        .opa(Opcode::Call, (3 << 8) | 1)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "(1, 2, (3,), {\"x\": 5})");
}

#[test]
fn missing_mandatory_argument_is_reported() {
    let mut b = ProgramBuilder::new();
    let mut body = Asm::new().param("a");
    body.op(Opcode::None).op(Opcode::Return);
    let f = b.function(body.build("needy"));
    let mut a = Asm::new();
    a.opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeFunc, f)
        .opa(Opcode::Call, 0)
        .op(Opcode::Return);
    let err = run_err(b, a);
    assert!(matches!(
        err.runtime(),
        Some(RuntimeError::MissingArgument { .. })
    ));
    assert_eq!(err.to_string(), "needy: missing argument for a");
}

#[test]
fn closures_share_the_enclosing_cell() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    // inner: returns the captured x.
    let mut inner = Asm::new();
    inner.opa(Opcode::FreeCell, 0).op(Opcode::Return);
    let mut inner = inner.build("inner");
    inner.freevars = vec![Binding::new("x", Position::default())];
    let gi = b.function(inner);
    // outer: x = 5 (a cell), then builds and calls inner.
    let five = b.int(5);
    let mut outer = Asm::new().local("x").local("mk").cell(0);
    outer
        .opa(Opcode::Constant, five)
        .opa(Opcode::SetLocalCell, 0)
        .opa(Opcode::MakeTuple, 0)
        // Capturing a cell pushes the cell object itself.
        .opa(Opcode::Local, 0)
        .opa(Opcode::MakeTuple, 1)
        .opa(Opcode::MakeFunc, gi)
        .opa(Opcode::Call, 0)
        .op(Opcode::Return);
    let mut outer = outer.build("outer");
    outer.freevars = Vec::new();
    let fo = b.function(outer);

    let mut a = Asm::new();
    a.opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeFunc, fo)
        .opa(Opcode::Call, 0)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "5");
}

#[test]
fn unpack_arity_mismatches() {
    for (want, expect_too_few) in [(3u32, true), (1u32, false)] {
        let mut b = ProgramBuilder::new();
        let (one, two) = (b.int(1), b.int(2));
        let mut a = Asm::new().local("x").local("y").local("z");
        a.opa(Opcode::Constant, one)
            .opa(Opcode::Constant, two)
            .opa(Opcode::MakeTuple, 2)
            .opa(Opcode::Unpack, want);
        for i in 0..want {
            a.opa(Opcode::SetLocal, i);
        }
        a.op(Opcode::None).op(Opcode::Return);
        let err = run_err(b, a);
        match err.runtime() {
            Some(RuntimeError::UnpackTooFew { want: 3, got: 2 }) if expect_too_few => {}
            Some(RuntimeError::UnpackTooMany { want: 1 }) if !expect_too_few => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}

#[test]
fn for_loop_sums_a_list() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (zero, c1, c2, c3) = (b.int(0), b.int(1), b.int(2), b.int(3));
    let mut a = Asm::new().local("s");
    a.opa(Opcode::Constant, zero)
        .opa(Opcode::SetLocal, 0)
        .opa(Opcode::Constant, c1)
        .opa(Opcode::Constant, c2)
        .opa(Opcode::Constant, c3)
        .opa(Opcode::MakeList, 3)
        .op(Opcode::IterPush);
    let top = a.here();
    let exit = a.fwd(Opcode::IterJmp);
    a.opa(Opcode::Local, 0)
        .op(Opcode::Add)
        .opa(Opcode::SetLocal, 0)
        .opa(Opcode::Jmp, top);
    a.patch(exit);
    a.op(Opcode::IterPop)
        .opa(Opcode::Local, 0)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "6");
}

#[test]
fn dict_literals_reject_duplicate_keys() {
    let mut b = ProgramBuilder::new();
    let (k, one, two) = (b.str_("k"), b.int(1), b.int(2));
    let mut a = Asm::new();
    a.op(Opcode::MakeDict)
        .op(Opcode::Dup)
        .opa(Opcode::Constant, k)
        .opa(Opcode::Constant, one)
        .op(Opcode::SetKeyUnique)
        .op(Opcode::Dup)
        .opa(Opcode::Constant, k)
        .opa(Opcode::Constant, two)
        .op(Opcode::SetKeyUnique)
        .op(Opcode::Return);
    let err = run_err(b, a);
    assert!(matches!(
        err.runtime(),
        Some(RuntimeError::DuplicateDictKey { .. })
    ));
}

#[test]
fn string_slicing_end_to_end() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (s, one, four) = (b.str_("hello"), b.int(1), b.int(4));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, s)
        .opa(Opcode::Constant, one)
        .opa(Opcode::Constant, four)
        .op(Opcode::None)
        .op(Opcode::Slice)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "\"ell\"");
}

#[test]
fn augmented_assignment_extends_in_place() {
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (one, two, three) = (b.int(1), b.int(2), b.int(3));
    let mut a = Asm::new().local("l");
    a.opa(Opcode::Constant, one)
        .opa(Opcode::MakeList, 1)
        .opa(Opcode::SetLocal, 0)
        .opa(Opcode::Local, 0)
        .opa(Opcode::Constant, two)
        .opa(Opcode::Constant, three)
        .opa(Opcode::MakeTuple, 2)
        .op(Opcode::InplaceAdd)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let m = run(b, a);
    assert_eq!(m.get("g").unwrap().repr(), "[1, 2, 3]");
}

#[test]
fn recursion_needs_the_program_flag() {
    let build = |recursion: bool| {
        let mut b = ProgramBuilder::new();
        b.globals = vec!["r"];
        b.recursion = recursion;
        let mut body = Asm::new();
        body.opa(Opcode::Global, 0)
            .opa(Opcode::Call, 0)
            .op(Opcode::Return);
        let f = b.function(body.build("r"));
        let mut a = Asm::new();
        a.opa(Opcode::MakeTuple, 0)
            .opa(Opcode::MakeTuple, 0)
            .opa(Opcode::MakeFunc, f)
            .opa(Opcode::SetGlobal, 0)
            .opa(Opcode::Global, 0)
            .opa(Opcode::Call, 0)
            .op(Opcode::Return);
        (b, a)
    };

    let (b, a) = build(false);
    let err = run_err(b, a);
    assert!(matches!(
        err.runtime(),
        Some(RuntimeError::RecursionDisallowed { .. })
    ));

    // With recursion enabled the step budget is what stops it.
    let (b, a) = build(true);
    let mut t = Thread::new("rec");
    t.set_max_steps(10_000);
    let err = init_program(&mut t, b.build(a.build("<toplevel>")), IndexMap::new()).unwrap_err();
    assert!(err.is_safety_error());
}

#[test]
fn stack_depth_is_restored_after_calls() {
    let observed = Arc::new(AtomicUsize::new(0));
    let inner = observed.clone();
    let probe = NativeFn::new("probe", Safety::SAFE, move |thread, _args, _kwargs| {
        inner.store(thread.call_stack_depth(), Ordering::SeqCst);
        Ok(Value::None)
    })
    .into_value();

    let mut t = Thread::new("depth");
    assert_eq!(t.call_stack_depth(), 0);
    call(&mut t, &probe, vec![], vec![]).unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(t.call_stack_depth(), 0);
}

#[test]
fn load_statement_binds_names_and_hints_misses() {
    let loader = |_: &mut Thread, module: &str| {
        assert_eq!(module, "config");
        let mut m = IndexMap::new();
        m.insert("answer".to_owned(), Value::from(42i64));
        Ok(m)
    };

    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (n, m) = (b.str_("answer"), b.str_("config"));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, n)
        .opa(Opcode::Constant, m)
        .opa(Opcode::Load, 1)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let mut t = Thread::new("load");
    t.set_load(Box::new(loader));
    let module = init_program(&mut t, b.build(a.build("<toplevel>")), IndexMap::new()).unwrap();
    assert_eq!(module.get("g").unwrap().repr(), "42");

    // A misspelled name carries a suggestion.
    let mut b = ProgramBuilder::new();
    b.globals = vec!["g"];
    let (n, m) = (b.str_("anwser"), b.str_("config"));
    let mut a = Asm::new();
    a.opa(Opcode::Constant, n)
        .opa(Opcode::Constant, m)
        .opa(Opcode::Load, 1)
        .opa(Opcode::SetGlobal, 0)
        .op(Opcode::None)
        .op(Opcode::Return);
    let mut t = Thread::new("load");
    t.set_load(Box::new(loader));
    let err = init_program(&mut t, b.build(a.build("<toplevel>")), IndexMap::new()).unwrap_err();
    match err.runtime() {
        Some(RuntimeError::LoadNameMissing { hint, .. }) => {
            assert_eq!(hint.as_deref(), Some("answer"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn backtraces_name_every_frame() {
    let mut b = ProgramBuilder::new();
    let (one, zero) = (b.int(1), b.int(0));
    let mut body = Asm::new();
    body.opa(Opcode::Constant, one)
        .opa(Opcode::Constant, zero)
        .op(Opcode::Mod)
        .op(Opcode::Return);
    let f = b.function(body.build("divide"));
    let mut a = Asm::new();
    a.opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeTuple, 0)
        .opa(Opcode::MakeFunc, f)
        .opa(Opcode::Call, 0)
        .op(Opcode::Return);
    let err = run_err(b, a);
    assert!(matches!(err.runtime(), Some(RuntimeError::DivisionByZero)));
    let bt = err.backtrace();
    assert!(bt.contains("Traceback (most recent call last):"), "{bt}");
    assert!(bt.contains("<toplevel>"), "{bt}");
    assert!(bt.contains("divide"), "{bt}");
    assert!(bt.ends_with("Error: division by zero"), "{bt}");
    assert_eq!(err.call_stack().depth(), 2);
}

#[test]
fn predeclared_misses_carry_hints() {
    let mut b = ProgramBuilder::new();
    let n = b.name("lenght");
    let mut a = Asm::new();
    a.opa(Opcode::Predeclared, n).op(Opcode::Return);
    let mut predeclared = IndexMap::new();
    predeclared.insert("length".to_owned(), Value::from(0i64));
    let mut t = Thread::new("hints");
    let err = init_program(&mut t, b.build(a.build("<toplevel>")), predeclared).unwrap_err();
    match err.runtime() {
        Some(RuntimeError::UndefinedName { hint, .. }) => {
            assert_eq!(hint.as_deref(), Some("length"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}
