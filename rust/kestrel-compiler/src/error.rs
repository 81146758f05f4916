use kestrel_core::FrameError;
use thiserror::Error;

/// Calls carry at most this many arguments.
pub const MAX_CALL_ARGUMENTS: usize = 16;

/// `Popn` releases at most this many slots per instruction.
pub const MAX_POP_BATCH: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("call to '{callee}' passes {count} arguments, at most 16 are supported")]
    TooManyArguments { callee: String, count: usize },
    #[error("operator {op} is not defined for {ty}")]
    UnsupportedOperator { op: String, ty: String },
    #[error("unresolved function: {0}")]
    UnresolvedFunction(String),
    #[error("invalid variable address in '{function}': {detail}")]
    InvalidAddress { function: String, detail: String },
    #[error("'{function}' needs more than 65535 registers")]
    TooManyRegisters { function: String },
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("internal compiler error: {0}")]
    Internal(String),
}
