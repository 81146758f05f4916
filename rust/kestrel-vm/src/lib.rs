//! Kestrel VM: register stack machine, call dispatch and process runtime
//! for programs produced by `kestrel-compiler`.
//!
//! ```text
//! Program ──link──▶ LinkedProgram ──Interpreter::new──▶ globals initialised
//!                                         │
//!                       run: main(args) ──┴── or run_processes
//! ```

pub mod call;
pub mod config;
pub mod error;
pub mod interpreter;
mod intrinsics;
pub mod link;
pub mod processes;
pub mod stack;
pub mod test_runner;

pub use call::runtime_type;
pub use config::VmConfig;
pub use error::{StackFrame, VmError};
pub use interpreter::Interpreter;
pub use link::{link, ForeignFunction, HostLibrary, LinkError, LinkedFunction, LinkedProgram, NativeFn, TypedValue};
pub use processes::{run_processes, ProcessReport};
pub use test_runner::{run_tests, TestOutcome, TestResult};

use kestrel_core::{FunctionId, Type, TypeId, Value, VectorValue};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `main`'s integer result, 0 otherwise.
    pub exit_code: i64,
    /// Lines printed by the global frame and `main`.
    pub output: Vec<String>,
    /// One report per process when the program ran as a container.
    pub processes: Vec<ProcessReport>,
}

/// Run a linked program.
///
/// The global frame runs first. Then, if the program defines `main` taking
/// no arguments or a single `[string]`, `main` is called with `args` and its
/// integer result becomes the exit code. Otherwise the program's processes
/// run until every one of them exits.
pub fn run(linked: Arc<LinkedProgram>, args: &[String], config: VmConfig) -> Result<RunOutcome, VmError> {
    let mut interp = Interpreter::new(Arc::clone(&linked), config.clone())?;

    if let Some(main) = linked.program().find_function("main") {
        let params = linked.param_types(main)?.unwrap_or(&[]);
        let call_args = match params {
            [] => vec![],
            [list] if is_string_vector(&linked, *list) => {
                let strings = args.iter().map(|a| Value::string(a.as_str())).collect();
                vec![Value::vector(VectorValue::from_values(true, strings)?)]
            }
            _ => {
                return Err(VmError::TypeError(format!(
                    "main must take no arguments or a [string], found {} parameters",
                    params.len()
                )))
            }
        };
        debug!(args = call_args.len(), "calling main");
        let result = interp.call_function(main, &call_args)?;
        return Ok(RunOutcome {
            exit_code: result.as_int().unwrap_or(0),
            output: interp.take_output(),
            processes: vec![],
        });
    }

    let processes = if linked.program().container.is_some() {
        let globals = interp.globals()?;
        run_processes(&linked, &globals, &config)?
    } else {
        info!("program has neither main nor processes");
        vec![]
    };
    Ok(RunOutcome {
        exit_code: 0,
        output: interp.take_output(),
        processes,
    })
}

fn is_string_vector(linked: &LinkedProgram, ty: TypeId) -> bool {
    matches!(linked.types().get(ty), Type::Vector(e) if *e == TypeId::STRING)
}

/// Call a function of the interpreter's program from the host. Any-typed
/// parameters take the runtime type of the value passed.
pub fn call_function(interp: &mut Interpreter, id: FunctionId, args: &[Value]) -> Result<Value, VmError> {
    interp.call_function(id, args)
}
