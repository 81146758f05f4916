//! Core data model shared by the Kestrel compiler and VM: bytecode, static
//! frames, the type table, runtime values and the compiled program.

pub mod bytecode;
pub mod frame;
pub mod program;
pub mod types;
pub mod values;

pub use bytecode::{Instruction, OpCode, Operand};
pub use frame::{Constant, FrameError, FrameId, StaticFrame, Symbol, SymbolKind};
pub use program::{
    ContainerDef, FunctionDef, FunctionId, IntrinsicId, ProcessDecl, Program, TestDef, TestId,
};
pub use types::{Storage, Type, TypeId, TypeTable};
pub use values::{compare_doubles, DictValue, Inplace, StructValue, Value, ValueError, VectorValue};
