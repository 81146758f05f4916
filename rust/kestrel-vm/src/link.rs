//! Function link table.
//!
//! Linking resolves every function of a compiled [`Program`] to exactly one
//! way of running it: its bytecode frame, a native Rust function, or a
//! foreign C function. The table is built once and never changes; every
//! interpreter of a run shares it through an `Arc`.

use crate::error::VmError;
use crate::interpreter::Interpreter;
use crate::intrinsics;
use kestrel_core::{FrameError, FunctionId, IntrinsicId, Program, StaticFrame, TypeId, TypeTable, Value};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// An argument as seen by a native function: the value and its type. For
/// any-typed parameters the type is the concrete one pushed by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub ty: TypeId,
    pub value: Value,
}

impl TypedValue {
    pub fn new(ty: TypeId, value: Value) -> Self {
        Self { ty, value }
    }
}

/// Signature of every native function, intrinsics included.
pub type NativeFn = fn(&mut Interpreter, &[TypedValue]) -> Result<Value, VmError>;

/// Address of a C function called through the foreign ABI.
///
/// The function receives the interpreter as an opaque first argument, then
/// `bool` as `u8`, `int` as `i64`, `double` as `f64`, `typeid` as `u32`, and
/// every other value as `*const Value`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ForeignFunction {
    addr: *const c_void,
}

// The address is only ever called, never dereferenced as data.
unsafe impl Send for ForeignFunction {}
unsafe impl Sync for ForeignFunction {}

impl ForeignFunction {
    /// # Safety
    /// `addr` must point to an `extern "C"` function whose parameters match
    /// the Kestrel signature it is linked under, as described on the type.
    pub unsafe fn new(addr: *const c_void) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> *const c_void {
        self.addr
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignFunction({:p})", self.addr)
    }
}

/// Host functions offered to the linker, keyed by linkage name.
#[derive(Default, Clone)]
pub struct HostLibrary {
    natives: HashMap<String, NativeFn>,
    foreign: HashMap<String, ForeignFunction>,
}

impl fmt::Debug for HostLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLibrary")
            .field("natives", &self.natives.keys().collect::<Vec<_>>())
            .field("foreign", &self.foreign)
            .finish()
    }
}

impl HostLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_native(&mut self, name: impl Into<String>, f: NativeFn) -> &mut Self {
        self.natives.insert(name.into(), f);
        self
    }

    pub fn add_foreign(&mut self, name: impl Into<String>, f: ForeignFunction) -> &mut Self {
        self.foreign.insert(name.into(), f);
        self
    }

    pub fn native(&self, name: &str) -> Option<NativeFn> {
        self.natives.get(name).copied()
    }

    pub fn foreign(&self, name: &str) -> Option<ForeignFunction> {
        self.foreign.get(name).copied()
    }
}

#[derive(Clone)]
pub enum LinkedFunction {
    Bytecode(Arc<StaticFrame>),
    Native(NativeFn),
    Foreign(ForeignFunction),
    /// Declared without a body and not provided by the host.
    Unimplemented,
}

impl fmt::Debug for LinkedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkedFunction::Bytecode(frame) => write!(f, "Bytecode({})", frame.name),
            LinkedFunction::Native(_) => write!(f, "Native"),
            LinkedFunction::Foreign(ff) => write!(f, "{:?}", ff),
            LinkedFunction::Unimplemented => write!(f, "Unimplemented"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("invalid program: {0}")]
    InvalidProgram(#[from] FrameError),
    #[error("function '{name}' has non-function signature {ty}")]
    NotAFunction { name: String, ty: String },
    #[error("'{0}' is provided both as a native and as a foreign function")]
    Ambiguous(String),
}

pub struct LinkedProgram {
    program: Program,
    functions: Vec<LinkedFunction>,
    intrinsics: Vec<NativeFn>,
}

impl fmt::Debug for LinkedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedProgram")
            .field("functions", &self.functions)
            .field("intrinsics", &self.intrinsics.len())
            .finish()
    }
}

impl LinkedProgram {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn types(&self) -> &TypeTable {
        &self.program.types
    }

    pub fn linked(&self, index: u32) -> Result<&LinkedFunction, VmError> {
        self.functions
            .get(index as usize)
            .ok_or_else(|| VmError::Runtime(format!("function #{} is not linked", index)))
    }

    pub fn intrinsic(&self, id: IntrinsicId) -> Result<NativeFn, VmError> {
        self.intrinsics
            .get(id.index() as usize)
            .copied()
            .ok_or_else(|| VmError::Runtime(format!("intrinsic '{}' is not linked", id.name())))
    }

    pub fn function_name(&self, id: FunctionId) -> String {
        match id {
            FunctionId::Defined(i) => self
                .program
                .functions
                .get(i as usize)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| format!("function#{}", i)),
            FunctionId::Intrinsic(i) => i.name().to_string(),
        }
    }

    /// Declared parameter types of a defined function. `None` for intrinsics,
    /// which take every argument as a typed pair.
    pub fn param_types(&self, id: FunctionId) -> Result<Option<&[TypeId]>, VmError> {
        match id {
            FunctionId::Intrinsic(_) => Ok(None),
            FunctionId::Defined(i) => {
                let def = self.program.functions.get(i as usize).ok_or_else(|| {
                    VmError::Runtime(format!("function #{} does not exist", i))
                })?;
                let sig = self.types().function_sig(def.signature).ok_or_else(|| {
                    VmError::type_error("call", "a function signature", &self.types().name(def.signature))
                })?;
                Ok(Some(sig.args.as_slice()))
            }
        }
    }

    pub fn return_type(&self, id: FunctionId) -> Option<TypeId> {
        match id {
            FunctionId::Intrinsic(_) => None,
            FunctionId::Defined(i) => {
                let def = self.program.functions.get(i as usize)?;
                self.types().function_sig(def.signature).map(|s| s.ret)
            }
        }
    }
}

/// Build the link table. Bodies in the program win over host entries; a
/// function with neither links as [`LinkedFunction::Unimplemented`] and only
/// fails if it is actually called.
pub fn link(program: Program, host: &HostLibrary) -> Result<LinkedProgram, LinkError> {
    program.validate()?;
    let mut functions = Vec::with_capacity(program.functions.len());
    for f in &program.functions {
        if program.types.function_sig(f.signature).is_none() {
            return Err(LinkError::NotAFunction {
                name: f.name.clone(),
                ty: program.types.name(f.signature),
            });
        }
        let linked = match (&f.frame, host.native(&f.linkage_name), host.foreign(&f.linkage_name)) {
            (Some(frame), _, _) => LinkedFunction::Bytecode(Arc::clone(frame)),
            (None, Some(_), Some(_)) => return Err(LinkError::Ambiguous(f.linkage_name.clone())),
            (None, Some(native), None) => LinkedFunction::Native(native),
            (None, None, Some(foreign)) => LinkedFunction::Foreign(foreign),
            (None, None, None) => {
                warn!(function = %f.name, linkage = %f.linkage_name, "no implementation linked");
                LinkedFunction::Unimplemented
            }
        };
        functions.push(linked);
    }
    debug!(
        functions = functions.len(),
        fingerprint = %program.fingerprint(),
        "linked program"
    );
    Ok(LinkedProgram {
        program,
        functions,
        intrinsics: intrinsics::table(),
    })
}
