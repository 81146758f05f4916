//! Kestrel compiler backend: typed AST to flat bytecode.

pub mod ast;
pub mod codegen;
pub mod error;

pub use error::{CompileError, MAX_CALL_ARGUMENTS, MAX_POP_BATCH};

use kestrel_core::{
    ContainerDef, FunctionDef, FunctionId, ProcessDecl, Program, StaticFrame, TestDef, TestId,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// Compile a typed program into its global frame, function frames, type
/// table, process declarations and tests.
pub fn compile(ast: &ast::Program) -> Result<Program, CompileError> {
    let global_count = ast.globals.symbols.len();
    let function_count = ast.functions.len();

    let globals = generate_safe("global", || {
        codegen::generate_frame("global", &ast.globals, &ast.types, global_count, function_count)
    })?;
    debug!(
        instructions = globals.instructions.len(),
        symbols = globals.symbols.len(),
        "compiled global frame"
    );

    let mut functions = Vec::with_capacity(function_count);
    for f in &ast.functions {
        let frame = match &f.body {
            Some(body) => {
                let frame = generate_safe(&f.name, || {
                    codegen::generate_frame(&f.name, body, &ast.types, global_count, function_count)
                })?;
                debug!(
                    function = %f.name,
                    instructions = frame.instructions.len(),
                    symbols = frame.symbols.len(),
                    args = frame.arg_count,
                    "compiled function"
                );
                Some(Arc::new(frame))
            }
            None => None,
        };
        functions.push(FunctionDef {
            name: f.name.clone(),
            linkage_name: f.linkage_name.clone().unwrap_or_else(|| f.name.clone()),
            signature: f.signature,
            frame,
        });
    }

    let find = |name: &str| -> Result<FunctionId, CompileError> {
        ast.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId::Defined(i as u32))
            .ok_or_else(|| CompileError::UnresolvedFunction(name.to_string()))
    };

    let container = match &ast.container {
        Some(c) => {
            let processes = c
                .processes
                .iter()
                .map(|p| {
                    Ok(ProcessDecl {
                        name: p.name.clone(),
                        init: find(&p.init)?,
                        handler: find(&p.handler)?,
                        state_type: p.state_type,
                        message_type: p.message_type,
                    })
                })
                .collect::<Result<Vec<_>, CompileError>>()?;
            Some(ContainerDef {
                name: c.name.clone(),
                processes,
            })
        }
        None => None,
    };

    let tests = ast
        .tests
        .iter()
        .map(|t| {
            Ok(TestDef {
                id: TestId::new(t.module.clone(), t.name.clone()),
                function: find(&t.function)?,
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    let program = Program {
        globals,
        functions,
        types: ast.types.clone(),
        container,
        tests,
    };
    program.validate()?;
    Ok(program)
}

/// Run code generation for one frame, turning a panic into
/// `CompileError::Internal` instead of unwinding through the host.
fn generate_safe(
    name: &str,
    generate: impl FnOnce() -> Result<StaticFrame, CompileError>,
) -> Result<StaticFrame, CompileError> {
    catch_unwind(AssertUnwindSafe(generate)).unwrap_or_else(|panic| {
        let msg = if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else {
            "code generation panicked".to_string()
        };
        Err(CompileError::Internal(format!("'{}': {}", name, msg)))
    })
}
