//! Runtime errors raised by the dispatch loop, the call dispatcher and the
//! intrinsics.

use kestrel_core::{FrameError, TypeId, ValueError};
use kestrel_runtime::SendError;
use thiserror::Error;

/// One entry of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub pc: usize,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("index {index} out of bounds for {what} of size {size}")]
    IndexOutOfBounds {
        what: &'static str,
        index: i64,
        size: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("function '{0}' is declared but not implemented")]
    UnimplementedFunction(String),
    #[error("json lookup on {0} value")]
    JsonLookup(String),
    #[error("key '{0}' not found")]
    KeyNotFound(String),
    #[error("send to '{process}': expected message of type {expected}, got {found}")]
    SendTypeMismatch {
        process: String,
        expected: String,
        found: String,
    },
    #[error("assertion failed")]
    AssertFailed,
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
    #[error("type error at runtime: {0}")]
    TypeError(String),
    #[error("register out of bounds: r{0}")]
    RegisterOutOfBounds(usize),
    #[error("foreign function '{0}' cannot be called: built without the `ffi` feature")]
    ForeignUnavailable(String),
    #[error("{message}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        message: String,
        stack_trace: String,
        frames: Vec<StackFrame>,
    },
}

impl VmError {
    /// Attach a stack trace, outermost call first. An empty trace returns
    /// the error unchanged and an error is never wrapped twice.
    pub fn with_stack_trace(self, frames: Vec<StackFrame>) -> Self {
        if frames.is_empty() || matches!(self, VmError::WithStackTrace { .. }) {
            return self;
        }
        let message = self.to_string();
        let mut trace = String::new();
        for (i, frame) in frames.iter().rev().enumerate() {
            trace.push_str(&format!(
                "\n  #{}: {} (instruction {})",
                i, frame.function, frame.pc
            ));
        }
        VmError::WithStackTrace {
            message,
            stack_trace: trace,
            frames,
        }
    }

    /// Check the message through the stack trace wrapper.
    pub fn message_contains(&self, needle: &str) -> bool {
        match self {
            VmError::WithStackTrace { message, .. } => message.contains(needle),
            other => other.to_string().contains(needle),
        }
    }

    pub fn is_division_by_zero(&self) -> bool {
        match self {
            VmError::DivisionByZero => true,
            VmError::WithStackTrace { message, .. } => message == "division by zero",
            _ => false,
        }
    }

    pub fn is_index_out_of_bounds(&self) -> bool {
        match self {
            VmError::IndexOutOfBounds { .. } => true,
            VmError::WithStackTrace { message, .. } => {
                message.starts_with("index ") && message.contains("out of bounds")
            }
            _ => false,
        }
    }

    pub fn stack_frames(&self) -> &[StackFrame] {
        match self {
            VmError::WithStackTrace { frames, .. } => frames,
            _ => &[],
        }
    }

    pub fn type_error(operation: &str, expected: &str, found: &str) -> Self {
        VmError::TypeError(format!(
            "cannot {} (expected {}, got {})",
            operation, expected, found
        ))
    }

    pub(crate) fn from_send(err: SendError, name_of: impl Fn(TypeId) -> String) -> Self {
        match err {
            SendError::TypeMismatch {
                process,
                expected,
                found,
            } => VmError::SendTypeMismatch {
                process,
                expected: name_of(expected),
                found: name_of(found),
            },
            SendError::Closed { process } => {
                VmError::Runtime(format!("process '{}' has shut down", process))
            }
        }
    }
}

impl From<ValueError> for VmError {
    fn from(err: ValueError) -> Self {
        VmError::TypeError(err.to_string())
    }
}

impl From<FrameError> for VmError {
    fn from(err: FrameError) -> Self {
        VmError::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_lists_innermost_first() {
        let err = VmError::DivisionByZero.with_stack_trace(vec![
            StackFrame {
                function: "main".into(),
                pc: 4,
            },
            StackFrame {
                function: "divide".into(),
                pc: 1,
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("division by zero\nStack trace"));
        assert!(text.contains("#0: divide (instruction 1)"));
        assert!(text.contains("#1: main (instruction 4)"));
        assert!(err.is_division_by_zero());
        assert_eq!(err.stack_frames().len(), 2);
    }

    #[test]
    fn wrapping_is_idempotent() {
        let frames = vec![StackFrame {
            function: "f".into(),
            pc: 0,
        }];
        let once = VmError::AssertFailed.with_stack_trace(frames.clone());
        let twice = once.clone().with_stack_trace(frames);
        assert_eq!(once, twice);
        assert_eq!(VmError::AssertFailed.with_stack_trace(vec![]), VmError::AssertFailed);
    }

    #[test]
    fn bounds_check_survives_wrapping() {
        let err = VmError::IndexOutOfBounds {
            what: "vector",
            index: 9,
            size: 2,
        };
        assert!(err.is_index_out_of_bounds());
        let wrapped = err.with_stack_trace(vec![StackFrame {
            function: "global".into(),
            pc: 3,
        }]);
        assert!(wrapped.is_index_out_of_bounds());
        assert!(wrapped.message_contains("vector of size 2"));
    }
}
