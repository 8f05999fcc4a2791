//! End-to-end coverage: build functions with [`FunctionBuilder`], compile them with
//! [`JitOrchestrator`], and call the resulting native code. Each test stands in for one of the
//! scenarios a front end driving this crate would actually produce.

use ecmajit_core::abi::signatures::helper_names;
use ecmajit_core::abi::{Capture, Closure, Locator, Value, ValueKind, Variable};
use ecmajit_core::builder::ir::IrInstr;
use ecmajit_core::builder::opcodes::BinaryOp;
use ecmajit_core::orchestrator::HostFunction;
use ecmajit_core::{FunctionBuilder, IrModule, JitOrchestrator};

// --- Host helper stand-ins ---------------------------------------------------------------------
//
// A real embedding would back these with its own coercion/object/promise machinery; here they
// implement just enough ECMAScript-ish semantics for the scenarios below to observe the right
// answer, so that a call into JIT-compiled code is exercising the real helper-call path rather
// than a value that happened to avoid it.

unsafe extern "C" fn runtime_to_numeric(_rt: *mut (), value: *const Value) -> f64 {
    let v = unsafe { &*value };
    match v.kind {
        ValueKind::Number => v.as_number().unwrap(),
        ValueKind::Boolean => {
            if v.as_boolean().unwrap() {
                1.0
            } else {
                0.0
            }
        }
        ValueKind::Null => 0.0,
        _ => f64::NAN,
    }
}

unsafe extern "C" fn runtime_to_boolean(_rt: *mut (), value: *const Value) -> u8 {
    let v = unsafe { &*value };
    let truthy = match v.kind {
        ValueKind::Undefined | ValueKind::Null => false,
        ValueKind::Boolean => v.as_boolean().unwrap(),
        ValueKind::Number => {
            let n = v.as_number().unwrap();
            n != 0.0 && !n.is_nan()
        }
        _ => true,
    };
    truthy as u8
}

unsafe extern "C" fn runtime_is_strictly_equal(_rt: *mut (), lhs: *const Value, rhs: *const Value) -> u8 {
    let a = unsafe { &*lhs };
    let b = unsafe { &*rhs };
    let eq = match (a.kind, b.kind) {
        (ValueKind::Number, ValueKind::Number) => a.as_number() == b.as_number(),
        (ValueKind::Boolean, ValueKind::Boolean) => a.as_boolean() == b.as_boolean(),
        (ValueKind::Undefined, ValueKind::Undefined) | (ValueKind::Null, ValueKind::Null) => true,
        _ => false,
    };
    eq as u8
}

unsafe extern "C" fn runtime_create_capture(_rt: *mut (), target: *mut Variable) -> *mut Capture {
    Box::into_raw(Box::new(Capture { target, escaped: Variable::new(0, true) }))
}

unsafe extern "C" fn runtime_create_closure(_rt: *mut (), lambda: *mut (), num_captures: i16) -> *mut Closure {
    let table: Vec<*mut Capture> = vec![std::ptr::null_mut(); num_captures as usize];
    let captures = Box::into_raw(table.into_boxed_slice()) as *mut *mut Capture;
    let lambda = unsafe { std::mem::transmute::<*mut (), ecmajit_core::abi::closure::Lambda>(lambda) };
    Box::into_raw(Box::new(Closure { lambda, num_captures: num_captures as u16, captures }))
}

unsafe extern "C" fn unexpected_helper_call() -> i64 {
    panic!("a helper not stubbed by this test was invoked")
}

fn host_functions() -> Vec<HostFunction> {
    helper_names::ALL
        .iter()
        .map(|&name| {
            let address: *const u8 = if name == helper_names::TO_NUMERIC {
                runtime_to_numeric as *const u8
            } else if name == helper_names::TO_BOOLEAN {
                runtime_to_boolean as *const u8
            } else if name == helper_names::IS_STRICTLY_EQUAL || name == helper_names::IS_LOOSELY_EQUAL {
                runtime_is_strictly_equal as *const u8
            } else if name == helper_names::CREATE_CAPTURE {
                runtime_create_capture as *const u8
            } else if name == helper_names::CREATE_CLOSURE {
                runtime_create_closure as *const u8
            } else {
                unexpected_helper_call as *const u8
            };
            HostFunction { name, address }
        })
        .collect()
}

fn call(lambda: ecmajit_core::abi::closure::Lambda, ctx: *mut (), args: &[Value]) -> (u32, Value) {
    let mut retv = Value::undefined();
    let status = unsafe { lambda(std::ptr::null_mut(), ctx, args.len(), args.as_ptr(), &mut retv as *mut Value) };
    (status, retv)
}

// --- E1: recursive calls (fib) -------------------------------------------------------------------

#[test]
fn fibonacci_recurses_through_call_closure() {
    let mut b = FunctionBuilder::new(0, "fib", 1);

    b.reference(0, Locator::argument(0));
    b.dereference().unwrap();
    b.const_number(2.0);
    b.binary_op(BinaryOp::Lt).unwrap();
    b.begin_if().unwrap();
    b.reference(0, Locator::argument(0));
    b.dereference().unwrap();
    b.return_stmt(true).unwrap();
    b.end_if();

    for offset in [1.0, 2.0] {
        b.const_function_ref(0);
        b.begin_arguments(1);
        b.reference(0, Locator::argument(0));
        b.dereference().unwrap();
        b.const_number(offset);
        b.binary_op(BinaryOp::Sub).unwrap();
        b.store_argument(0).unwrap();
        b.call(1).unwrap();
    }
    b.binary_op(BinaryOp::Add).unwrap();
    b.return_stmt(true).unwrap();

    let func = b.finish().expect("well-formed function");
    let mut module = IrModule::new();
    module.add_function(func);

    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let fib = orchestrator.lookup(0).expect("fib was registered");
    let (status, retv) = call(fib, std::ptr::null_mut(), &[Value::number(10.0)]);
    assert_eq!(status, 0);
    assert_eq!(retv.as_number(), Some(55.0));
}

// --- E3: closures capture a local that outlives the enclosing call ------------------------------

#[test]
fn closure_capture_survives_outer_return() {
    let mut make = FunctionBuilder::new(10, "make", 0);
    make.begin_scope();
    make.const_number(0.0);
    make.declare_variable(Locator::local(0), true).unwrap();
    make.reference(0, Locator::local(0));
    make.create_capture().unwrap();
    make.create_closure(11, 1).unwrap();
    make.return_stmt(true).unwrap();
    make.end_scope();
    let make_func = make.finish().expect("well-formed outer function");

    let mut inner = FunctionBuilder::new(11, "counter", 0);
    inner.reference(0, Locator::capture(0));
    inner.reference(0, Locator::capture(0));
    inner.dereference().unwrap();
    inner.const_number(1.0);
    inner.binary_op(BinaryOp::Add).unwrap();
    inner.assign().unwrap();
    inner.pop_discard().unwrap();
    inner.reference(0, Locator::capture(0));
    inner.dereference().unwrap();
    inner.return_stmt(true).unwrap();
    let inner_func = inner.finish().expect("well-formed inner function");

    let mut module = IrModule::new();
    module.add_function(make_func);
    module.add_function(inner_func);

    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let make_lambda = orchestrator.lookup(10).expect("make was registered");
    let (status, retv) = call(make_lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0);
    assert_eq!(retv.kind, ValueKind::Closure);
    let closure_ptr = retv.as_pointer().expect("closure value carries a pointer") as *mut Closure;

    // `make` has already returned: this exercises that `EscapeCapture` rewired the capture's
    // `target` away from `make`'s (now-dead) stack frame before control left it.
    let closure = unsafe { &*closure_ptr };
    let ctx = closure.captures as *mut ();
    for expected in [1.0, 2.0, 3.0] {
        let (status, retv) = call(closure.lambda, ctx, &[]);
        assert_eq!(status, 0);
        assert_eq!(retv.as_number(), Some(expected));
    }
}

// --- E5: switch with empty-case fall-through ------------------------------------------------------

#[test]
fn switch_falls_through_empty_case_to_the_next() {
    let mut b = FunctionBuilder::new(20, "switch_test", 0);
    b.const_number(2.0);
    b.begin_switch(None).unwrap();

    b.const_number(1.0);
    b.case_clause().unwrap();
    b.const_number(10.0);
    b.return_stmt(true).unwrap();

    b.const_number(2.0);
    b.case_clause().unwrap();
    // case 2 falls through to case 3 with no statements of its own.
    b.const_number(3.0);
    b.case_clause().unwrap();
    b.const_number(20.0);
    b.return_stmt(true).unwrap();

    b.default_clause();
    b.const_number(30.0);
    b.return_stmt(true).unwrap();

    b.end_switch();
    let func = b.finish().expect("well-formed function");

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let lambda = orchestrator.lookup(20).expect("switch_test was registered");
    let (status, retv) = call(lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0);
    assert_eq!(retv.as_number(), Some(20.0));
}

// --- Property 7: a labelled break exits past an intervening unlabelled loop ------------------------

#[test]
fn labelled_break_exits_the_labelled_loop_not_the_innermost_one() {
    let mut b = FunctionBuilder::new(30, "labelled_break", 0);
    const OUTER: u32 = 100;

    b.const_number(0.0);
    b.declare_variable(Locator::local(0), true).unwrap(); // acc = 0

    b.loop_init(Some(OUTER));
    b.loop_test_begin();
    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.const_number(3.0);
    b.binary_op(BinaryOp::Lt).unwrap();
    b.loop_test_end().unwrap();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.const_number(1.0);
    b.binary_op(BinaryOp::Add).unwrap();
    b.declare_variable(Locator::local(0), true).unwrap(); // acc += 1

    b.loop_init(None);
    b.loop_test_begin();
    b.const_boolean(true);
    b.loop_test_end().unwrap();
    b.break_stmt(Some(OUTER)).unwrap(); // jumps straight past the outer loop's own machinery
    b.loop_next_begin();
    b.loop_end();

    b.loop_next_begin();
    b.loop_end();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.return_stmt(true).unwrap();
    let func = b.finish().expect("well-formed function");

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let lambda = orchestrator.lookup(30).expect("labelled_break was registered");
    let (status, retv) = call(lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0);
    assert_eq!(retv.as_number(), Some(1.0), "the outer loop must run exactly once before the labelled break exits it");
}

// --- Loop-carried accumulation, exercising loop-header back-edge sealing --------------------------

#[test]
fn loop_sums_one_through_five() {
    let mut b = FunctionBuilder::new(40, "sum_to_five", 0);
    b.const_number(0.0);
    b.declare_variable(Locator::local(0), true).unwrap(); // acc
    b.const_number(1.0);
    b.declare_variable(Locator::local(1), true).unwrap(); // i

    b.loop_init(None);
    b.loop_test_begin();
    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.const_number(5.0);
    b.binary_op(BinaryOp::Lte).unwrap();
    b.loop_test_end().unwrap();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.binary_op(BinaryOp::Add).unwrap();
    b.declare_variable(Locator::local(0), true).unwrap();

    b.loop_next_begin();
    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.const_number(1.0);
    b.binary_op(BinaryOp::Add).unwrap();
    b.declare_variable(Locator::local(1), true).unwrap();
    b.loop_end();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.return_stmt(true).unwrap();
    let func = b.finish().expect("well-formed function");

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let lambda = orchestrator.lookup(40).expect("sum_to_five was registered");
    let (status, retv) = call(lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0);
    assert_eq!(retv.as_number(), Some(15.0));
}

// --- Property 6: ToBoolean is specialised away for statically-typed operands ----------------------

#[test]
fn to_boolean_on_any_goes_through_the_runtime_helper_and_agrees_with_ecmascript() {
    let mut b = FunctionBuilder::new(50, "truthy", 1);
    b.reference(0, Locator::argument(0));
    b.dereference().unwrap();
    b.to_boolean().unwrap();
    b.begin_if().unwrap();
    b.const_number(1.0);
    b.return_stmt(true).unwrap();
    b.end_if();
    b.const_number(0.0);
    b.return_stmt(true).unwrap();
    let func = b.finish().expect("well-formed function");

    assert!(
        func.blocks.iter().any(|blk| blk.instrs.iter().any(|i| matches!(i, IrInstr::ToBoolean { .. }))),
        "an Any operand must lower ToBoolean to a real instruction, not a compile-time fold"
    );

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();
    let lambda = orchestrator.lookup(50).expect("truthy was registered");

    for (value, expected) in [(Value::number(5.0), 1.0), (Value::number(0.0), 0.0), (Value::boolean(false), 0.0), (Value::undefined(), 0.0)] {
        let (status, retv) = call(lambda, std::ptr::null_mut(), &[value]);
        assert_eq!(status, 0);
        assert_eq!(retv.as_number(), Some(expected));
    }
}

// --- E2: a thrown value is caught and folded into the finally block ------------------------------

#[test]
fn try_catch_finally_merges_the_caught_value() {
    let mut b = FunctionBuilder::new(70, "try_catch_finally", 0);
    b.const_number(1.0);
    b.declare_variable(Locator::local(0), true).unwrap(); // x = 1

    b.begin_try();
    b.const_number(2.0);
    b.throw_stmt().unwrap();

    b.begin_catch();
    b.reference(0, Locator::local(0));
    b.caught_value();
    b.assign().unwrap();
    b.pop_discard().unwrap();

    b.enter_finally();
    b.reference(0, Locator::local(0));
    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.const_number(10.0);
    b.binary_op(BinaryOp::Add).unwrap();
    b.assign().unwrap();
    b.pop_discard().unwrap();

    b.end_try();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.return_stmt(true).unwrap();
    let func = b.finish().expect("well-formed function");

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let lambda = orchestrator.lookup(70).expect("try_catch_finally was registered");
    let (status, retv) = call(lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0, "the exception must be fully handled before the finally block falls through");
    assert_eq!(retv.as_number(), Some(12.0));
}

// --- E4: continue skips the loop body's remainder but the increment still runs -------------------

#[test]
fn continue_stmt_skips_the_body_but_not_the_increment() {
    let mut b = FunctionBuilder::new(80, "continue_test", 0);
    b.const_number(0.0);
    b.declare_variable(Locator::local(0), true).unwrap(); // acc
    b.const_number(0.0);
    b.declare_variable(Locator::local(1), true).unwrap(); // i

    b.loop_init(None);
    b.loop_test_begin();
    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.const_number(5.0);
    b.binary_op(BinaryOp::Lt).unwrap();
    b.loop_test_end().unwrap();

    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.const_number(2.0);
    b.binary_op(BinaryOp::StrictEq).unwrap();
    b.begin_if().unwrap();
    b.continue_stmt(None).unwrap();
    b.end_if();

    b.reference(0, Locator::local(0));
    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.const_number(1.0);
    b.binary_op(BinaryOp::Add).unwrap();
    b.assign().unwrap();
    b.pop_discard().unwrap();

    b.loop_next_begin();
    b.reference(0, Locator::local(1));
    b.dereference().unwrap();
    b.const_number(1.0);
    b.binary_op(BinaryOp::Add).unwrap();
    b.declare_variable(Locator::local(1), true).unwrap();
    b.loop_end();

    b.reference(0, Locator::local(0));
    b.dereference().unwrap();
    b.return_stmt(true).unwrap();
    let func = b.finish().expect("well-formed function");

    let mut module = IrModule::new();
    module.add_function(func);
    let mut orchestrator = JitOrchestrator::new(&host_functions()).expect("orchestrator construction");
    orchestrator.register_module(&module).expect("module registration and verification");
    orchestrator.finalize();

    let lambda = orchestrator.lookup(80).expect("continue_test was registered");
    let (status, retv) = call(lambda, std::ptr::null_mut(), &[]);
    assert_eq!(status, 0);
    assert_eq!(retv.as_number(), Some(4.0), "i=2 must skip the increment of acc but the loop must still reach i=5");
}

#[test]
fn to_boolean_on_a_statically_typed_operand_never_emits_a_helper_call() {
    let mut b = FunctionBuilder::new(60, "truthy_of_constant", 0);
    b.const_number(7.0);
    b.to_boolean().unwrap();
    b.pop_discard().unwrap();
    b.return_stmt(false).unwrap();
    let func = b.finish().expect("well-formed function");

    assert!(
        !func.blocks.iter().any(|blk| blk.instrs.iter().any(|i| matches!(i, IrInstr::ToBoolean { .. }))),
        "a statically Number operand must fold ToBoolean without a ToBoolean instruction"
    );
}
