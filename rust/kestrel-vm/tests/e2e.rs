//! End-to-end tests: build typed trees, compile them and run them in the VM.

use kestrel_compiler::ast::build::*;
use kestrel_compiler::ast::{self, BinaryOp, RangeKind};
use kestrel_compiler::compile;
use kestrel_core::{IntrinsicId, TestId, TypeId, TypeTable, Value, VectorValue};
use kestrel_vm::{
    link, run, run_tests, HostLibrary, Interpreter, LinkedProgram, TestOutcome, TypedValue,
    VmConfig, VmError,
};
use std::sync::Arc;

fn linked_with(program: &ast::Program, host: &HostLibrary) -> Arc<LinkedProgram> {
    let compiled = compile(program).expect("program should compile");
    Arc::new(link(compiled, host).expect("program should link"))
}

fn linked(program: &ast::Program) -> Arc<LinkedProgram> {
    linked_with(program, &HostLibrary::new())
}

fn run_globals(program: &ast::Program) -> Interpreter {
    Interpreter::new(linked(program), VmConfig::default()).expect("globals should run")
}

fn ints(items: &[i64]) -> Value {
    Value::vector(VectorValue::from_values(false, items.iter().map(|n| Value::Int(*n)).collect()).unwrap())
}

const INT: TypeId = TypeId::INT;

// ─── Globals ───

#[test]
fn e2e_global_arithmetic() {
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(
        vec![var("result", INT)],
        vec![bind(scope(0, 0), add(add(int(1), int(2)), int(3)))],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("result"), Some(Value::Int(6)));
}

#[test]
fn e2e_nested_blocks_address_outer_symbols() {
    // total = 1; { x = 2; { total = total + x } }
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(
        vec![var("total", INT)],
        vec![
            bind(scope(0, 0), int(1)),
            block(body(
                vec![var("x", INT)],
                vec![
                    bind(scope(0, 0), int(2)),
                    block(body(
                        vec![],
                        vec![store(
                            scope(2, 0),
                            add(local(2, 0, INT), local(1, 0, INT)),
                        )],
                    )),
                ],
            )),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("total"), Some(Value::Int(3)));
}

#[test]
fn e2e_negative_zero_equals_zero() {
    let mut types = TypeTable::new();
    let vec_double = types.vector_of(TypeId::DOUBLE);
    let mut program = ast::Program::new(types);
    program.globals = body(
        vec![var("scalars", TypeId::BOOL), var("vectors", TypeId::BOOL)],
        vec![
            bind(scope(0, 0), binary(BinaryOp::Equal, double(-0.0), double(0.0))),
            bind(
                scope(0, 1),
                binary(
                    BinaryOp::Equal,
                    construct(vec_double, vec![double(-0.0)]),
                    construct(vec_double, vec![double(0.0)]),
                ),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("scalars"), Some(Value::Bool(true)));
    assert_eq!(interp.global_value("vectors"), Some(Value::Bool(true)));
}

// ─── Calls and recursion ───

#[test]
fn e2e_fibonacci_prints_sequence() {
    let mut types = TypeTable::new();
    let fib_sig = types.function_of(INT, &[INT], true);
    let mut program = ast::Program::new(types);
    let fib = |arg| call(function(0, fib_sig), vec![arg], INT);
    program.functions.push(function_def(
        "fib",
        fib_sig,
        Some(body(
            vec![param("n", INT)],
            vec![
                if_else(
                    binary(BinaryOp::Smaller, local(0, 0, INT), int(2)),
                    body(vec![], vec![ret(local(1, 0, INT))]),
                    None,
                ),
                ret(add(
                    fib(sub(local(0, 0, INT), int(1))),
                    fib(sub(local(0, 0, INT), int(2))),
                )),
            ],
        )),
    ));
    program.globals = body(
        vec![],
        vec![for_range(
            RangeKind::Closed,
            int(0),
            int(10),
            body(vec![var("i", INT)], vec![print(fib(local(0, 0, INT)))]),
        )],
    );

    let interp = run_globals(&program);
    assert_eq!(
        interp.output(),
        &["0", "1", "1", "2", "3", "5", "8", "13", "21", "34", "55"]
    );
}

#[test]
fn e2e_open_range_and_while() {
    // for i in 0..<4 { sum = sum + i }; while n < 100 { n = n * 3 }
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(
        vec![var("sum", INT), var("n", INT)],
        vec![
            for_range(
                RangeKind::Open,
                int(0),
                int(4),
                body(
                    vec![var("i", INT)],
                    vec![store(scope(1, 0), add(local(1, 0, INT), local(0, 0, INT)))],
                ),
            ),
            bind(scope(0, 1), int(1)),
            while_loop(
                binary(BinaryOp::Smaller, local(0, 1, INT), int(100)),
                body(
                    vec![],
                    vec![store(scope(1, 1), binary(BinaryOp::Mul, local(1, 1, INT), int(3)))],
                ),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("sum"), Some(Value::Int(6)));
    assert_eq!(interp.global_value("n"), Some(Value::Int(243)));
}

#[test]
fn e2e_for_bound_is_fixed_when_the_loop_starts() {
    // n = 2; for i in 0...n { n = n + 1; count = count + 1 }
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(
        vec![var("n", INT), var("count", INT)],
        vec![
            bind(scope(0, 0), int(2)),
            for_range(
                RangeKind::Closed,
                int(0),
                local(0, 0, INT),
                body(
                    vec![var("i", INT)],
                    vec![
                        store(scope(1, 0), add(local(1, 0, INT), int(1))),
                        store(scope(1, 1), add(local(1, 1, INT), int(1))),
                    ],
                ),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("count"), Some(Value::Int(3)));
    assert_eq!(interp.global_value("n"), Some(Value::Int(5)));
}

#[test]
fn e2e_stack_is_balanced_after_calls() {
    let mut types = TypeTable::new();
    let sig = types.function_of(INT, &[INT, INT], true);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def(
        "plus",
        sig,
        Some(body(
            vec![param("a", INT), param("b", INT)],
            vec![ret(add(local(0, 0, INT), local(0, 1, INT)))],
        )),
    ));
    program.globals = body(
        vec![var("r", INT)],
        vec![bind(scope(0, 0), call(function(0, sig), vec![int(40), int(2)], INT))],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("r"), Some(Value::Int(42)));
    let globals = interp.program().program().globals.symbols.len();
    assert_eq!(interp.stack_len(), globals);
}

#[test]
fn e2e_intrinsic_called_through_a_value() {
    // f = size; direct = size("abc"); through_local = f("héllo")
    let mut types = TypeTable::new();
    let sig = types.function_of(INT, &[TypeId::STRING], true);
    let mut program = ast::Program::new(types);
    let size = || load(ast::VarAddress::Intrinsic(IntrinsicId::Size), sig);
    program.globals = body(
        vec![var("f", sig), var("direct", INT), var("through_local", INT)],
        vec![
            bind(scope(0, 0), size()),
            bind(scope(0, 1), call(size(), vec![string("abc")], INT)),
            bind(scope(0, 2), call(local(0, 0, sig), vec![string("héllo")], INT)),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("direct"), Some(Value::Int(3)));
    assert_eq!(interp.global_value("through_local"), Some(Value::Int(5)));
}

// ─── Collections and reference counts ───

#[test]
fn e2e_push_back_keeps_the_original() {
    let mut types = TypeTable::new();
    let vec_int = types.vector_of(INT);
    let mut program = ast::Program::new(types);
    program.globals = body(
        vec![var("a", vec_int), var("b", vec_int)],
        vec![
            bind(scope(0, 0), construct(vec_int, vec![int(1), int(2)])),
            bind(
                scope(0, 1),
                intrinsic(IntrinsicId::PushBack, vec![local(0, 0, vec_int), int(3)], vec_int),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("a"), Some(ints(&[1, 2])));
    assert_eq!(interp.global_value("b"), Some(ints(&[1, 2, 3])));
}

#[test]
fn e2e_copies_share_one_allocation() {
    let mut types = TypeTable::new();
    let vec_int = types.vector_of(INT);
    let mut program = ast::Program::new(types);
    program.globals = body(
        vec![var("a", vec_int), var("b", vec_int)],
        vec![
            bind(scope(0, 0), construct(vec_int, vec![int(1), int(2), int(3)])),
            bind(scope(0, 1), local(0, 0, vec_int)),
        ],
    );
    let interp = run_globals(&program);
    let a = interp.global_value("a").unwrap();
    // Two registers plus the clone held here.
    assert_eq!(a.strong_count(), Some(3));
}

#[test]
fn e2e_map_filter_reduce_call_back_into_bytecode() {
    let mut types = TypeTable::new();
    let vec_int = types.vector_of(INT);
    let unary = types.function_of(INT, &[INT], true);
    let pred = types.function_of(TypeId::BOOL, &[INT], true);
    let binop = types.function_of(INT, &[INT, INT], true);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def(
        "double",
        unary,
        Some(body(vec![param("x", INT)], vec![ret(add(local(0, 0, INT), local(0, 0, INT)))])),
    ));
    program.functions.push(function_def(
        "is_even",
        pred,
        Some(body(
            vec![param("x", INT)],
            vec![ret(binary(
                BinaryOp::Equal,
                binary(BinaryOp::Rem, local(0, 0, INT), int(2)),
                int(0),
            ))],
        )),
    ));
    program.functions.push(function_def(
        "plus",
        binop,
        Some(body(
            vec![param("a", INT), param("b", INT)],
            vec![ret(add(local(0, 0, INT), local(0, 1, INT)))],
        )),
    ));
    let numbers = |items: &[i64]| construct(vec_int, items.iter().map(|n| int(*n)).collect());
    program.globals = body(
        vec![var("doubled", vec_int), var("evens", vec_int), var("total", INT)],
        vec![
            bind(
                scope(0, 0),
                intrinsic(IntrinsicId::Map, vec![numbers(&[1, 2, 3]), function(0, unary)], vec_int),
            ),
            bind(
                scope(0, 1),
                intrinsic(IntrinsicId::Filter, vec![numbers(&[1, 2, 3, 4]), function(1, pred)], vec_int),
            ),
            bind(
                scope(0, 2),
                intrinsic(
                    IntrinsicId::Reduce,
                    vec![numbers(&[1, 2, 3]), int(0), function(2, binop)],
                    INT,
                ),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("doubled"), Some(ints(&[2, 4, 6])));
    assert_eq!(interp.global_value("evens"), Some(ints(&[2, 4])));
    assert_eq!(interp.global_value("total"), Some(Value::Int(6)));
}

#[test]
fn e2e_json_lookup_and_to_string() {
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(
        vec![var("name", TypeId::JSON), var("text", TypeId::STRING)],
        vec![
            bind(
                scope(0, 0),
                lookup(json(serde_json::json!({"name": "kestrel"})), string("name"), TypeId::JSON),
            ),
            bind(
                scope(0, 1),
                intrinsic(IntrinsicId::ToString, vec![local(0, 0, TypeId::JSON)], TypeId::STRING),
            ),
        ],
    );
    let interp = run_globals(&program);
    assert_eq!(interp.global_value("text"), Some(Value::string("\"kestrel\"")));
}

// ─── Runtime errors ───

#[test]
fn e2e_division_by_zero_reports_a_trace() {
    let mut types = TypeTable::new();
    let div_sig = types.function_of(INT, &[INT, INT], true);
    let main_sig = types.function_of(INT, &[], false);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def(
        "divide",
        div_sig,
        Some(body(
            vec![param("a", INT), param("b", INT)],
            vec![ret(binary(BinaryOp::Div, local(0, 0, INT), local(0, 1, INT)))],
        )),
    ));
    program.functions.push(function_def(
        "main",
        main_sig,
        Some(body(vec![], vec![ret(call(function(0, div_sig), vec![int(1), int(0)], INT))])),
    ));

    let err = run(linked(&program), &[], VmConfig::default()).unwrap_err();
    assert!(err.is_division_by_zero());
    let functions: Vec<&str> = err.stack_frames().iter().map(|f| f.function.as_str()).collect();
    assert_eq!(functions, vec!["main", "divide"]);
}

#[test]
fn e2e_vector_index_out_of_bounds() {
    let mut types = TypeTable::new();
    let vec_int = types.vector_of(INT);
    let main_sig = types.function_of(INT, &[], false);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def(
        "main",
        main_sig,
        Some(body(
            vec![],
            vec![ret(lookup(construct(vec_int, vec![int(1), int(2)]), int(5), INT))],
        )),
    ));
    let err = run(linked(&program), &[], VmConfig::default()).unwrap_err();
    assert!(err.is_index_out_of_bounds());
    assert!(err.message_contains("index 5 out of bounds for vector of size 2"));
}

#[test]
fn e2e_deep_recursion_overflows() {
    let mut types = TypeTable::new();
    let sig = types.function_of(INT, &[INT], true);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def(
        "forever",
        sig,
        Some(body(
            vec![param("n", INT)],
            vec![ret(call(function(0, sig), vec![add(local(0, 0, INT), int(1))], INT))],
        )),
    ));
    let mut interp = Interpreter::new(
        linked(&program),
        VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        },
    )
    .unwrap();
    let before = interp.stack_len();
    let forever = interp.program().program().find_function("forever").unwrap();
    let err = interp.call_function(forever, &[Value::Int(0)]).unwrap_err();
    assert!(err.message_contains("stack overflow"));
    assert_eq!(err.stack_frames().len(), 50);
    assert_eq!(interp.stack_len(), before);
}

// ─── Host functions ───

fn host_double(_: &mut Interpreter, args: &[TypedValue]) -> Result<Value, VmError> {
    let n = args[0].value.as_int().unwrap_or(0);
    Ok(Value::Int(n * 2))
}

fn host_program() -> ast::Program {
    let mut types = TypeTable::new();
    let sig = types.function_of(INT, &[INT], true);
    let main_sig = types.function_of(INT, &[], false);
    let mut program = ast::Program::new(types);
    program.functions.push(function_def("host_double", sig, None));
    program.functions.push(function_def(
        "main",
        main_sig,
        Some(body(vec![], vec![ret(call(function(0, sig), vec![int(21)], INT))])),
    ));
    program
}

#[test]
fn e2e_unimplemented_function_fails_when_called() {
    let err = run(linked(&host_program()), &[], VmConfig::default()).unwrap_err();
    assert!(err.message_contains("function 'host_double' is declared but not implemented"));
}

#[test]
fn e2e_native_function_from_host_library() {
    let mut host = HostLibrary::new();
    host.add_native("host_double", host_double);
    let outcome = run(linked_with(&host_program(), &host), &[], VmConfig::default()).unwrap();
    assert_eq!(outcome.exit_code, 42);
}

// ─── Entry points ───

#[test]
fn e2e_main_receives_arguments_and_sets_exit_code() {
    let mut types = TypeTable::new();
    let vec_str = types.vector_of(TypeId::STRING);
    let main_sig = types.function_of(INT, &[vec_str], false);
    let mut program = ast::Program::new(types);
    program.globals = body(vec![], vec![print(string("starting"))]);
    program.functions.push(function_def(
        "main",
        main_sig,
        Some(body(
            vec![param("args", vec_str)],
            vec![
                print(lookup(local(0, 0, vec_str), int(1), TypeId::STRING)),
                ret(intrinsic(IntrinsicId::Size, vec![local(0, 0, vec_str)], INT)),
            ],
        )),
    ));
    let args = vec!["first".to_string(), "second".to_string()];
    let outcome = run(linked(&program), &args, VmConfig::default()).unwrap();
    assert_eq!(outcome.exit_code, 2);
    assert_eq!(outcome.output, vec!["starting", "second"]);
    assert!(outcome.processes.is_empty());
}

#[test]
fn e2e_program_without_main_exits_zero() {
    let mut program = ast::Program::new(TypeTable::new());
    program.globals = body(vec![], vec![print(int(1))]);
    let outcome = run(linked(&program), &[], VmConfig::default()).unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.output, vec!["1"]);
}

#[test]
fn e2e_run_tests_isolates_failures() {
    let mut types = TypeTable::new();
    let sig = types.function_of(TypeId::VOID, &[], false);
    let mut program = ast::Program::new(types);
    let check = |cond| expr(intrinsic(IntrinsicId::Assert, vec![cond], TypeId::VOID));
    program.functions.push(function_def("passes", sig, Some(body(vec![], vec![check(boolean(true))]))));
    program.functions.push(function_def(
        "fails",
        sig,
        Some(body(vec![], vec![check(binary(BinaryOp::Equal, int(1), int(2)))])),
    ));
    program.functions.push(function_def("skipped", sig, Some(body(vec![], vec![]))));
    for name in ["passes", "fails", "skipped"] {
        program.tests.push(ast::TestDecl {
            module: "checks".into(),
            name: name.into(),
            function: name.into(),
        });
    }

    let linked = linked(&program);
    let mut interp = Interpreter::new(Arc::clone(&linked), VmConfig::default()).unwrap();
    let before = interp.stack_len();
    let wanted = [TestId::new("checks", "fails"), TestId::new("checks", "passes")];
    let results = run_tests(&mut interp, &linked.program().tests, &wanted);

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].outcome, TestOutcome::Success);
    match &results[1].outcome {
        TestOutcome::Failed(msg) => assert!(msg.contains("assertion failed"), "{}", msg),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(results[2].outcome, TestOutcome::NotRun);
    assert_eq!(interp.stack_len(), before);
}
