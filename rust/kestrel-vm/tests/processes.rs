//! Actor runtime tests: processes built from typed trees, run through `run`.

use kestrel_compiler::ast::build::*;
use kestrel_compiler::ast::{self, BinaryOp, ContainerDecl, Expression, ProcessDecl, Statement};
use kestrel_compiler::compile;
use kestrel_core::{IntrinsicId, TypeId, TypeTable, Value};
use kestrel_vm::{link, run, HostLibrary, RunOutcome, VmConfig, VmError};
use std::sync::Arc;

const INT: TypeId = TypeId::INT;
const STRING: TypeId = TypeId::STRING;

fn send(dest: &str, msg: Expression) -> Statement {
    expr(intrinsic(IntrinsicId::Send, vec![string(dest), msg], TypeId::VOID))
}

fn exit() -> Statement {
    expr(intrinsic(IntrinsicId::Exit, vec![], TypeId::VOID))
}

fn run_program(program: &ast::Program) -> Result<RunOutcome, VmError> {
    let compiled = compile(program).expect("program should compile");
    let linked = Arc::new(link(compiled, &HostLibrary::new()).expect("program should link"));
    run(linked, &[], VmConfig::default())
}

/// One process, `counter`, whose init sends `sends` and starts from 10. The
/// handler decrements on "dec" and exits on "stop".
fn counter_program(sends: &[(&str, &str)]) -> ast::Program {
    let mut types = TypeTable::new();
    let init_sig = types.function_of(INT, &[], false);
    let handler_sig = types.function_of(INT, &[INT, STRING], false);
    let mut program = ast::Program::new(types);

    let mut init = sends
        .iter()
        .map(|(dest, msg)| send(dest, string(msg)))
        .collect::<Vec<_>>();
    init.push(ret(int(10)));
    program.functions.push(function_def("counter_init", init_sig, Some(body(vec![], init))));

    let msg = || local(0, 1, STRING);
    let state = || local(0, 0, INT);
    program.functions.push(function_def(
        "counter_handle",
        handler_sig,
        Some(body(
            vec![param("state", INT), param("msg", STRING)],
            vec![
                if_else(
                    binary(BinaryOp::Equal, msg(), string("stop")),
                    body(vec![], vec![exit()]),
                    None,
                ),
                ret(conditional(
                    binary(BinaryOp::Equal, msg(), string("dec")),
                    sub(state(), int(1)),
                    state(),
                )),
            ],
        )),
    ));
    program.container = Some(ContainerDecl {
        name: "app".into(),
        processes: vec![ProcessDecl {
            name: "counter".into(),
            init: "counter_init".into(),
            handler: "counter_handle".into(),
            state_type: INT,
            message_type: STRING,
        }],
    });
    program
}

#[test]
fn counter_handles_its_own_messages_then_exits() {
    let program = counter_program(&[
        ("counter", "dec"),
        ("counter", "dec"),
        ("counter", "dec"),
        ("counter", "stop"),
    ]);
    let outcome = run_program(&program).unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.processes.len(), 1);
    assert_eq!(outcome.processes[0].name, "counter");
    assert_eq!(outcome.processes[0].final_state, Value::Int(7));
}

#[test]
fn send_to_unknown_process_is_ignored() {
    let program = counter_program(&[
        ("nobody", "dec"),
        ("counter", "dec"),
        ("counter", "stop"),
    ]);
    let outcome = run_program(&program).unwrap();
    assert_eq!(outcome.processes[0].final_state, Value::Int(9));
}

/// `main` takes strings, `worker` takes ints. `main_init` sends `first` to
/// the worker.
fn two_process_program(first: Expression) -> ast::Program {
    let mut types = TypeTable::new();
    let init_sig = types.function_of(INT, &[], false);
    let main_handler = types.function_of(INT, &[INT, STRING], false);
    let worker_handler = types.function_of(INT, &[INT, INT], false);
    let mut program = ast::Program::new(types);

    program.functions.push(function_def(
        "main_init",
        init_sig,
        Some(body(vec![], vec![send("worker", first), ret(int(0))])),
    ));
    program.functions.push(function_def(
        "main_handle",
        main_handler,
        Some(body(
            vec![param("state", INT), param("msg", STRING)],
            vec![exit(), ret(int(1))],
        )),
    ));
    program.functions.push(function_def(
        "worker_init",
        init_sig,
        Some(body(vec![], vec![ret(int(0))])),
    ));
    program.functions.push(function_def(
        "worker_handle",
        worker_handler,
        Some(body(
            vec![param("state", INT), param("msg", INT)],
            vec![
                print(local(0, 1, INT)),
                send("main", string("done")),
                exit(),
                ret(add(local(0, 0, INT), local(0, 1, INT))),
            ],
        )),
    ));
    program.container = Some(ContainerDecl {
        name: "pair".into(),
        processes: vec![
            ProcessDecl {
                name: "main".into(),
                init: "main_init".into(),
                handler: "main_handle".into(),
                state_type: INT,
                message_type: STRING,
            },
            ProcessDecl {
                name: "worker".into(),
                init: "worker_init".into(),
                handler: "worker_handle".into(),
                state_type: INT,
                message_type: INT,
            },
        ],
    });
    program
}

#[test]
fn processes_exchange_messages_across_threads() {
    let outcome = run_program(&two_process_program(int(5))).unwrap();
    let reports = &outcome.processes;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "main");
    assert_eq!(reports[0].final_state, Value::Int(1));
    assert_eq!(reports[1].name, "worker");
    assert_eq!(reports[1].final_state, Value::Int(5));
    assert_eq!(reports[1].output, vec!["5"]);
}

#[test]
fn mistyped_send_is_fatal() {
    let err = run_program(&two_process_program(string("hello"))).unwrap_err();
    assert!(
        err.message_contains("send to 'worker': expected message of type int, got string"),
        "{}",
        err
    );
}
