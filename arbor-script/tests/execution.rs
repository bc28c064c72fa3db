//! End-to-end runs over small built programs, exercised on both execution
//! substrates.

use anyhow::Result;
use pretty_assertions::assert_eq;

use arbor_script::{
    LvalOp, NullHost, Opcode, Program, ProgramBuilder, RegistryHost, ThreadedCode, TypeSel,
    Value, ValueView, Vm, VmOptions,
};

fn run(prog: &Program) -> Result<(Value, usize)> {
    let mut host = NullHost;
    let mut vm = Vm::new(prog.clone(), &mut host)?;
    let v = vm.run(&mut host)?;
    Ok((v, vm.live_objects()))
}

fn run_threaded(prog: &Program) -> Result<(Value, usize)> {
    let mut host = NullHost;
    let mut vm = Vm::new(prog.clone(), &mut host)?;
    let code = ThreadedCode::<NullHost>::translate(prog)?;
    let v = code.run(&mut vm, &mut host)?;
    Ok((v, vm.live_objects()))
}

/// Run under both substrates, assert they agree, that the result is an int
/// and that the heap ends empty.
fn expect_int(prog: &Program) -> i64 {
    let (a, live_a) = run(prog).unwrap();
    let (b, live_b) = run_threaded(prog).unwrap();
    assert_eq!(a, b, "substrates disagree");
    assert_eq!((live_a, live_b), (0, 0), "heap not empty after run");
    a.as_int().expect("expected an int result")
}

/// Run under the direct interpreter, expect an error, and assert that the
/// unwind left the heap empty. Returns the full rendered error.
fn expect_err(prog: &Program) -> String {
    let mut host = NullHost;
    let mut vm = Vm::new(prog.clone(), &mut host).unwrap();
    let err = vm.run(&mut host).unwrap_err();
    assert_eq!(vm.live_objects(), 0, "heap not empty after unwind");
    format!("{err:#}")
}

fn factorial_program() -> Program {
    let mut b = ProgramBuilder::new();
    let n = b.var();
    let fact = b.declare_fun("fact", &[(n, TypeSel::Any)], &[]);
    let main = b.declare_fun("main", &[], &[]);

    b.define_fun(fact);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::Le, &[]);
    let recurse = b.emit_jump(Opcode::Jz);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::RetV, &[]);
    b.patch(recurse);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::Sub, &[]);
    b.emit(Opcode::Call, &[fact]);
    b.emit(Opcode::Mul, &[]);
    b.emit(Opcode::RetV, &[]);

    b.define_fun(main);
    b.emit(Opcode::PushInt, &[5]);
    b.emit(Opcode::Call, &[fact]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    b.finish().unwrap()
}

#[test]
fn factorial_of_five() {
    assert_eq!(expect_int(&factorial_program()), 120);
}

#[test]
fn leak_report_is_empty_after_a_clean_run() {
    let mut host = NullHost;
    let mut vm = Vm::new(factorial_program(), &mut host).unwrap();
    vm.run(&mut host).unwrap();
    assert!(vm.leak_report().is_empty());
}

#[test]
fn factorial_survives_binary_roundtrip() {
    let bytes = factorial_program().to_bytes();
    let prog = Program::parse(&bytes).unwrap();
    assert_eq!(expect_int(&prog), 120);
}

#[test]
fn string_concat_allocates_fresh_result() {
    let mut b = ProgramBuilder::new();
    let foo = b.str_const("foo");
    let bar = b.str_const("bar");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushStr, &[foo]);
    b.emit(Opcode::PushStr, &[bar]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = NullHost;
    let mut vm = Vm::new(prog, &mut host).unwrap();
    let v = vm.run(&mut host).unwrap();
    // only the result object survives the run
    assert_eq!(vm.live_objects(), 1);
    match vm.view(&v) {
        ValueView::Str(s) => assert_eq!(s, "foobar"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn integer_division_by_zero_is_an_error() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Div, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("division by zero"), "{err}");
}

#[test]
fn float_division_by_zero_is_an_error() {
    let mut b = ProgramBuilder::new();
    let one = b.float_const(1.0);
    let zero = b.float_const(0.0);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushConst, &[one]);
    b.emit(Opcode::PushConst, &[zero]);
    b.emit(Opcode::Div, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("division by zero"), "{err}");
}

#[test]
fn modulo_by_zero_is_an_error() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[7]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Mod, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("division by zero"), "{err}");
}

fn dispatch_program(
    int_first: bool,
    push_arg: impl FnOnce(&mut ProgramBuilder),
) -> Program {
    let mut b = ProgramBuilder::new();
    let x = b.var();
    let y = b.var();
    let f_int = b.declare_fun("f", &[(x, TypeSel::Int)], &[]);
    let f_any = b.declare_fun("f", &[(y, TypeSel::Any)], &[]);
    let main = b.declare_fun("main", &[], &[]);

    b.define_fun(f_int);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::RetV, &[]);
    b.define_fun(f_any);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::RetV, &[]);

    b.define_fun(main);
    push_arg(&mut b);
    if int_first {
        b.emit(Opcode::CallMulti, &[2, f_int, f_any]);
    } else {
        b.emit(Opcode::CallMulti, &[2, f_any, f_int]);
    }
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    b.finish().unwrap()
}

#[test]
fn multi_dispatch_picks_first_matching_candidate() {
    let with_int = dispatch_program(true, |b| {
        b.emit(Opcode::PushInt, &[9]);
    });
    assert_eq!(expect_int(&with_int), 1);

    let with_float = dispatch_program(true, |b| {
        let f = b.float_const(1.5);
        b.emit(Opcode::PushConst, &[f]);
    });
    assert_eq!(expect_int(&with_float), 2);
}

#[test]
fn multi_dispatch_order_is_deterministic() {
    // an earlier any-typed candidate shadows the exact int match
    let any_first = dispatch_program(false, |b| {
        b.emit(Opcode::PushInt, &[9]);
    });
    assert_eq!(expect_int(&any_first), 2);
}

#[test]
fn multi_dispatch_with_no_match_is_an_error() {
    let mut b = ProgramBuilder::new();
    let x = b.var();
    let f_int = b.declare_fun("f", &[(x, TypeSel::Int)], &[]);
    let main = b.declare_fun("main", &[], &[]);
    let s = b.str_const("nope");

    b.define_fun(f_int);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::RetV, &[]);
    b.define_fun(main);
    b.emit(Opcode::PushStr, &[s]);
    b.emit(Opcode::CallMulti, &[1, f_int]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);

    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("no matching overload for f(str)"), "{err}");
}

#[test]
fn stack_growth_is_transparent() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    for _ in 0..64 {
        b.emit(Opcode::PushInt, &[1]);
    }
    for _ in 0..63 {
        b.emit(Opcode::Add, &[]);
    }
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = NullHost;
    let opts = VmOptions { initial_stack: 2, ..Default::default() };
    let mut vm = Vm::with_options(prog, &mut host, opts).unwrap();
    let v = vm.run(&mut host).unwrap();
    assert_eq!(v, Value::Int(64));
}

#[test]
fn stack_limit_is_enforced() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    for _ in 0..32 {
        b.emit(Opcode::PushInt, &[1]);
    }
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = NullHost;
    let opts = VmOptions { max_stack: 16, ..Default::default() };
    let mut vm = Vm::with_options(prog, &mut host, opts).unwrap();
    let err = vm.run(&mut host).unwrap_err();
    assert!(format!("{err:#}").contains("stack overflow"), "{err:#}");
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn runaway_recursion_hits_the_depth_limit() {
    let mut b = ProgramBuilder::new();
    let spin = b.declare_fun("spin", &[], &[]);
    b.define_fun(spin);
    b.emit(Opcode::Call, &[spin]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(spin);
    let prog = b.finish().unwrap();

    let mut host = NullHost;
    let opts = VmOptions { max_call_depth: 8, ..Default::default() };
    let mut vm = Vm::with_options(prog, &mut host, opts).unwrap();
    let err = vm.run(&mut host).unwrap_err();
    assert!(format!("{err:#}").contains("call depth exceeded"), "{err:#}");
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn box_roundtrip() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[7]);
    b.emit(Opcode::BoxNew, &[]);
    b.emit(Opcode::Unbox, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 7);
}

#[test]
fn vector_elementwise_arithmetic() {
    let mut b = ProgramBuilder::new();
    let ints = b.vector_type("ints");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    for v in [1u32, 2, 3] {
        b.emit(Opcode::PushInt, &[v]);
    }
    b.emit(Opcode::NewVec, &[ints, 3]);
    for v in [10u32, 20, 30] {
        b.emit(Opcode::PushInt, &[v]);
    }
    b.emit(Opcode::NewVec, &[ints, 3]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushIdx, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 22);
}

#[test]
fn vector_scalar_broadcast() {
    let mut b = ProgramBuilder::new();
    let ints = b.vector_type("ints");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    for v in [1u32, 2, 3] {
        b.emit(Opcode::PushInt, &[v]);
    }
    b.emit(Opcode::NewVec, &[ints, 3]);
    b.emit(Opcode::PushInt, &[10]);
    b.emit(Opcode::Mul, &[]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::PushIdx, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 30);
}

#[test]
fn vector_length_mismatch_is_an_error() {
    let mut b = ProgramBuilder::new();
    let ints = b.vector_type("ints");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::NewVec, &[ints, 1]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::NewVec, &[ints, 2]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("add not applicable"), "{err}");
}

#[test]
fn vector_index_out_of_range() {
    let mut b = ProgramBuilder::new();
    let ints = b.vector_type("ints");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::NewVec, &[ints, 1]);
    b.emit(Opcode::PushInt, &[5]);
    b.emit(Opcode::PushIdx, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("index 5 out of range (length 1)"), "{err}");
}

#[test]
fn struct_field_access() {
    let mut b = ProgramBuilder::new();
    let point = b.struct_type("point", &["x", "y"]);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[3]);
    b.emit(Opcode::PushInt, &[4]);
    b.emit(Opcode::NewStruct, &[point]);
    b.emit(Opcode::PushField, &[1]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 4);
}

#[test]
fn unknown_struct_field_is_an_error() {
    let mut b = ProgramBuilder::new();
    let point = b.struct_type("point", &["x", "y"]);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[3]);
    b.emit(Opcode::PushInt, &[4]);
    b.emit(Opcode::NewStruct, &[point]);
    b.emit(Opcode::PushField, &[5]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("no field 5 in point"), "{err}");
}

#[test]
fn lvalue_compound_assignment_flavors() {
    let mut b = ProgramBuilder::new();
    let x = b.var();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    // x = 10
    b.emit(Opcode::PushInt, &[10]);
    b.emit_lval_var(x, LvalOp::Write);
    // ++x pushing the new value (11), discarded
    b.emit_lval_var(x, LvalOp::IncrPushNew);
    b.emit(Opcode::Pop, &[]);
    // x += 5 pushing the old value (11), discarded
    b.emit(Opcode::PushInt, &[5]);
    b.emit_lval_var(x, LvalOp::AddPushOld);
    b.emit(Opcode::Pop, &[]);
    // x-- discarding
    b.emit_lval_var(x, LvalOp::DecrPost);
    b.emit(Opcode::PushVar, &[x]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    // 10 -> 11 -> 16 -> 15
    assert_eq!(expect_int(&b.finish().unwrap()), 15);
}

#[test]
fn lvalue_divide_by_zero_unwinds_cleanly() {
    let mut b = ProgramBuilder::new();
    let x = b.var();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[1]);
    b.emit_lval_var(x, LvalOp::Write);
    b.emit(Opcode::PushInt, &[0]);
    b.emit_lval_var(x, LvalOp::Div);
    b.emit(Opcode::PushVar, &[x]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("division by zero"), "{err}");
}

#[test]
fn lvalue_on_vector_element() {
    let mut b = ProgramBuilder::new();
    let ints = b.vector_type("ints");
    let x = b.var();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    for v in [1u32, 2, 3] {
        b.emit(Opcode::PushInt, &[v]);
    }
    b.emit(Opcode::NewVec, &[ints, 3]);
    b.emit_lval_var(x, LvalOp::WriteRef);
    // x[1] += 10
    b.emit(Opcode::PushVar, &[x]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[10]);
    b.emit_lval_idx(LvalOp::Add);
    b.emit(Opcode::PushVar, &[x]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushIdx, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 12);
}

#[test]
fn lvalue_on_struct_field() {
    let mut b = ProgramBuilder::new();
    let point = b.struct_type("point", &["x", "y"]);
    let p = b.var();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushInt, &[3]);
    b.emit(Opcode::PushInt, &[4]);
    b.emit(Opcode::NewStruct, &[point]);
    b.emit_lval_var(p, LvalOp::WriteRef);
    // p.y++ pushing the old value
    b.emit(Opcode::PushVar, &[p]);
    b.emit_lval_field(1, LvalOp::IncrPushOld);
    b.emit(Opcode::Pop, &[]);
    b.emit(Opcode::PushVar, &[p]);
    b.emit(Opcode::PushField, &[1]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 5);
}

#[test]
fn indirect_call_through_a_function_value() {
    let mut b = ProgramBuilder::new();
    let f = b.declare_fun("answer", &[], &[]);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(f);
    b.emit(Opcode::PushInt, &[42]);
    b.emit(Opcode::RetV, &[]);
    b.define_fun(main);
    b.emit(Opcode::PushFun, &[f]);
    b.emit(Opcode::CallIndirect, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 42);
}

#[test]
fn string_ordering_and_equality() {
    let mut b = ProgramBuilder::new();
    let abc = b.str_const("abc");
    let abd = b.str_const("abd");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    // ("abc" < "abd") + ("abc" == "abc")
    b.emit(Opcode::PushStr, &[abc]);
    b.emit(Opcode::PushStr, &[abd]);
    b.emit(Opcode::Lt, &[]);
    b.emit(Opcode::PushStr, &[abc]);
    b.emit(Opcode::PushStr, &[abc]);
    b.emit(Opcode::Eq, &[]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 2);
}

#[test]
fn truthiness_and_logic_ops() {
    let mut b = ProgramBuilder::new();
    let zero = b.float_const(0.0);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    // !nil + (1 and 2) + (0.0 or 0) + -(-1)
    b.emit(Opcode::PushNil, &[]);
    b.emit(Opcode::Not, &[]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::And, &[]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::PushConst, &[zero]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Or, &[]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::Neg, &[]);
    b.emit(Opcode::Neg, &[]);
    b.emit(Opcode::Add, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 3);
}

#[test]
fn foreign_calls_through_a_registry_host() {
    let mut b = ProgramBuilder::new();
    let add2 = b.import("add2", 2);
    let greet = b.import("greet", 1);
    let name = b.str_const("arbor");
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushStr, &[name]);
    b.emit(Opcode::ForeignCall, &[greet]);
    b.emit(Opcode::PopRef, &[]);
    b.emit(Opcode::PushInt, &[40]);
    b.emit(Opcode::PushInt, &[2]);
    b.emit(Opcode::ForeignCall, &[add2]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = RegistryHost::new();
    host.register("add2", 2, |args, ctx| {
        let (Some(a), Some(b)) = (args[0].as_int(), args[1].as_int()) else {
            anyhow::bail!("add2 wants ints");
        };
        let _ = ctx;
        Ok(Value::Int(a + b))
    });
    host.register("greet", 1, |args, ctx| {
        let ValueView::Str(s) = ctx.view(&args[0]) else {
            anyhow::bail!("greet wants a string");
        };
        let msg = format!("hello, {s}");
        Ok(ctx.alloc_str(msg))
    });

    let mut vm = Vm::new(prog, &mut host).unwrap();
    let v = vm.run(&mut host).unwrap();
    assert_eq!(v, Value::Int(42));
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn failing_foreign_call_is_reported() {
    let mut b = ProgramBuilder::new();
    let boom = b.import("boom", 0);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::ForeignCall, &[boom]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = RegistryHost::new();
    host.register("boom", 0, |_args, _ctx| anyhow::bail!("device unplugged"));
    let mut vm = Vm::new(prog, &mut host).unwrap();
    let err = vm.run(&mut host).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("foreign function boom failed"), "{msg}");
    assert!(msg.contains("device unplugged"), "{msg}");
    assert_eq!(vm.live_objects(), 0);
}

#[test]
fn unresolved_import_fails_at_load() {
    let mut b = ProgramBuilder::new();
    let missing = b.import("no_such_fn", 0);
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::ForeignCall, &[missing]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let prog = b.finish().unwrap();

    let mut host = RegistryHost::new();
    let err = Vm::new(prog, &mut host).unwrap_err();
    assert!(format!("{err:#}").contains("no_such_fn"), "{err:#}");
}

#[test]
fn error_trace_names_the_call_chain() {
    let mut b = ProgramBuilder::new();
    let file = b.file("demo.ab");
    let inner = b.declare_fun("inner", &[], &[]);
    let main = b.declare_fun("main", &[], &[]);

    b.define_fun(inner);
    b.line(file, 7);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Div, &[]);
    b.emit(Opcode::RetV, &[]);

    b.define_fun(main);
    b.line(file, 2);
    b.emit(Opcode::Call, &[inner]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);

    let err = expect_err(&b.finish().unwrap());
    assert!(err.contains("in inner at demo.ab:7"), "{err}");
    assert!(err.contains("in main at demo.ab:2"), "{err}");
    assert!(err.contains("division by zero"), "{err}");
}

#[test]
fn translation_rejects_bad_opcodes() {
    let mut b = ProgramBuilder::new();
    let main = b.declare_fun("main", &[], &[]);
    b.define_fun(main);
    b.emit(Opcode::PushNil, &[]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    let mut prog = b.finish().unwrap();
    prog.code[0] = 0xdead_beef;

    let err = ThreadedCode::<NullHost>::translate(&prog).unwrap_err();
    assert!(format!("{err}").contains("invalid opcode"), "{err}");
}

#[test]
fn locals_are_reentrant_across_recursion() {
    // g(n): local acc = n * 10; if n > 0 { g(n - 1); } return acc
    // with a shared variable table this only works because frames back
    // locals up on entry and restore them on exit
    let mut b = ProgramBuilder::new();
    let n = b.var();
    let acc = b.var();
    let g = b.declare_fun("g", &[(n, TypeSel::Any)], &[acc]);
    let main = b.declare_fun("main", &[], &[]);

    b.define_fun(g);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushInt, &[10]);
    b.emit(Opcode::Mul, &[]);
    b.emit_lval_var(acc, LvalOp::Write);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushInt, &[0]);
    b.emit(Opcode::Gt, &[]);
    let done = b.emit_jump(Opcode::Jz);
    b.emit(Opcode::PushVar, &[n]);
    b.emit(Opcode::PushInt, &[1]);
    b.emit(Opcode::Sub, &[]);
    b.emit(Opcode::Call, &[g]);
    b.emit(Opcode::Pop, &[]);
    b.patch(done);
    b.emit(Opcode::PushVar, &[acc]);
    b.emit(Opcode::RetV, &[]);

    b.define_fun(main);
    b.emit(Opcode::PushInt, &[3]);
    b.emit(Opcode::Call, &[g]);
    b.emit(Opcode::RetV, &[]);
    b.set_entry(main);
    assert_eq!(expect_int(&b.finish().unwrap()), 30);
}
