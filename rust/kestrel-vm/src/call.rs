//! Call dispatch.
//!
//! A `Call` instruction finds the callee's arguments on top of the stack,
//! above the frame link pushed by `PushFramePtr`. The callee resolves to one
//! of three strategies:
//!
//! - **bytecode**: open the callee frame over the arguments and recurse into
//!   the dispatch loop;
//! - **native**: unpack the argument slots into [`TypedValue`]s (any-typed
//!   parameters take a type id slot and a value slot) and call the function
//!   pointer;
//! - **foreign**: same unpacking, then marshal through a cached libffi call
//!   interface with the interpreter as the implicit first argument.
//!
//! The result is written to the caller's destination register by absolute
//! offset, using the caller base stored in the frame link.

use crate::error::VmError;
use crate::interpreter::Interpreter;
use crate::link::{ForeignFunction, LinkedFunction, TypedValue};
use kestrel_core::{FrameId, FunctionId, IntrinsicId, StaticFrame, TypeId, Value};
use std::sync::Arc;
use tracing::trace;

impl Interpreter {
    /// `declared` is the type of the callee register in the caller's frame.
    pub(crate) fn dispatch_call(
        &mut self,
        dest: usize,
        callee: usize,
        argc: usize,
        declared: Option<TypeId>,
    ) -> Result<(), VmError> {
        let id = {
            let v = self.stack.get(callee)?;
            v.as_function()
                .ok_or_else(|| VmError::type_error("call", "function", v.kind_name()))?
        };
        let len = self.stack.len();
        if argc + 2 > len {
            return Err(VmError::Runtime(format!(
                "call with {} argument slots on a stack of {}",
                argc, len
            )));
        }
        let (caller_base, _) = self.stack.link_at(len - argc - 2)?;
        let result = match id {
            FunctionId::Intrinsic(intrinsic) => self.invoke_intrinsic_value(intrinsic, argc, declared)?,
            FunctionId::Defined(_) => self.invoke(id, argc)?,
        };
        self.stack.write_abs(caller_base + dest, result)
    }

    /// An intrinsic reached through a function value. A caller that only
    /// knew the value's signature pushed the arguments by that signature;
    /// otherwise every argument is a pair.
    fn invoke_intrinsic_value(
        &mut self,
        intrinsic: IntrinsicId,
        argc: usize,
        declared: Option<TypeId>,
    ) -> Result<Value, VmError> {
        let program = Arc::clone(self.program());
        trace!(callee = intrinsic.name(), argc, depth = self.depth, "call through value");
        let params = declared
            .and_then(|ty| program.types().function_sig(ty))
            .map(|sig| sig.args.clone());
        let args = match params {
            Some(params) if argc != 2 * params.len() => self.typed_args(&params, argc)?,
            _ => self.dynamic_args(argc)?,
        };
        let f = program.intrinsic(intrinsic)?;
        f(self, &args)
    }

    /// Call `id` with `argc` argument slots already on top of the stack.
    pub(crate) fn invoke(&mut self, id: FunctionId, argc: usize) -> Result<Value, VmError> {
        let program = Arc::clone(self.program());
        trace!(callee = %program.function_name(id), argc, depth = self.depth, "call");
        match id {
            FunctionId::Intrinsic(intrinsic) => {
                let f = program.intrinsic(intrinsic)?;
                let args = self.dynamic_args(argc)?;
                f(self, &args)
            }
            FunctionId::Defined(index) => match program.linked(index)? {
                LinkedFunction::Bytecode(frame) => {
                    self.call_bytecode(FrameId::Function(index), frame, argc)
                }
                LinkedFunction::Native(f) => {
                    let params = program.param_types(id)?.unwrap_or(&[]);
                    let args = self.typed_args(params, argc)?;
                    f(self, &args)
                }
                LinkedFunction::Foreign(f) => self.call_foreign(id, *f, argc),
                LinkedFunction::Unimplemented => {
                    Err(VmError::UnimplementedFunction(program.function_name(id)))
                }
            },
        }
    }

    fn call_bytecode(&mut self, id: FrameId, frame: &StaticFrame, argc: usize) -> Result<Value, VmError> {
        if argc != frame.arg_count {
            return Err(VmError::TypeError(format!(
                "'{}' takes {} argument slots, got {}",
                frame.name, frame.arg_count, argc
            )));
        }
        if self.depth >= self.config.max_call_depth {
            return Err(VmError::StackOverflow(self.config.max_call_depth));
        }
        let program = Arc::clone(self.program());
        let base = self.stack.open_frame_except_args(frame, program.types())?;
        self.stack.set_active(base, id);
        self.depth += 1;
        let result = self.execute(frame);
        self.depth -= 1;
        let value = result?;
        self.stack.close_frame(base, frame.arg_count);
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Argument unpacking
    // ------------------------------------------------------------------

    /// Every argument as a (type id, value) pair, the intrinsic convention.
    fn dynamic_args(&self, argc: usize) -> Result<Vec<TypedValue>, VmError> {
        if argc % 2 != 0 {
            return Err(VmError::Runtime(format!(
                "intrinsic call with odd slot count {}",
                argc
            )));
        }
        let slots = self.stack.top(argc)?;
        slots
            .chunks(2)
            .map(|pair| {
                let ty = pair[0].as_type_id().ok_or_else(|| {
                    VmError::type_error("read argument type", "typeid", pair[0].kind_name())
                })?;
                Ok(TypedValue::new(ty, pair[1].clone()))
            })
            .collect()
    }

    /// Arguments laid out by declared parameter types.
    fn typed_args(&self, params: &[TypeId], argc: usize) -> Result<Vec<TypedValue>, VmError> {
        let slots = self.stack.top(argc)?;
        let mut args = Vec::with_capacity(params.len());
        let mut next = 0;
        for ty in params {
            if *ty == TypeId::ANY {
                let (tag, value) = match (slots.get(next), slots.get(next + 1)) {
                    (Some(t), Some(v)) => (t, v),
                    _ => break,
                };
                let actual = tag.as_type_id().ok_or_else(|| {
                    VmError::type_error("read argument type", "typeid", tag.kind_name())
                })?;
                args.push(TypedValue::new(actual, (*value).clone()));
                next += 2;
            } else {
                match slots.get(next) {
                    Some(v) => args.push(TypedValue::new(*ty, (*v).clone())),
                    None => break,
                }
                next += 1;
            }
        }
        if next != argc || args.len() != params.len() {
            return Err(VmError::TypeError(format!(
                "{} argument slots do not match {} parameters",
                argc,
                params.len()
            )));
        }
        Ok(args)
    }

    /// Push `args` in the layout `id` expects. Returns the slot count.
    fn push_args(&mut self, id: FunctionId, args: &[TypedValue]) -> Result<usize, VmError> {
        let program = Arc::clone(self.program());
        let params = program.param_types(id)?;
        if let Some(params) = params {
            if params.len() != args.len() {
                return Err(VmError::TypeError(format!(
                    "'{}' takes {} arguments, got {}",
                    program.function_name(id),
                    params.len(),
                    args.len()
                )));
            }
        }
        let mut pushed = 0;
        for (i, a) in args.iter().enumerate() {
            let dynamic = params.map_or(true, |p| p[i] == TypeId::ANY);
            if dynamic {
                self.stack.push(Value::TypeId(a.ty));
                pushed += 1;
            }
            self.stack.push(a.value.clone());
            pushed += 1;
        }
        Ok(pushed)
    }

    // ------------------------------------------------------------------
    // Host entry points
    // ------------------------------------------------------------------

    /// Call back into any function from native code. The stack is restored
    /// afterwards whether or not the call succeeds.
    pub(crate) fn call_typed(&mut self, id: FunctionId, args: &[TypedValue]) -> Result<Value, VmError> {
        let cp = self.checkpoint();
        self.stack.push_link();
        let result = self
            .push_args(id, args)
            .and_then(|argc| self.invoke(id, argc));
        self.restore(cp);
        result
    }

    /// Host-driven call of a compiled function with typed arguments. Errors
    /// carry a stack trace.
    pub fn call_function_typed(&mut self, id: FunctionId, args: &[TypedValue]) -> Result<Value, VmError> {
        self.clear_trace();
        self.call_typed(id, args).map_err(|e| {
            let frames = self.take_trace();
            e.with_stack_trace(frames)
        })
    }

    /// Host-driven call of a compiled function by value. Arguments of
    /// any-typed parameters are tagged with their runtime type.
    pub fn call_function(&mut self, id: FunctionId, args: &[Value]) -> Result<Value, VmError> {
        let program = Arc::clone(self.program());
        let params = program.param_types(id)?;
        let typed: Vec<TypedValue> = args
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let declared = params.and_then(|p| p.get(i)).copied().unwrap_or(TypeId::ANY);
                let ty = if declared == TypeId::ANY {
                    runtime_type(v)
                } else {
                    declared
                };
                TypedValue::new(ty, v.clone())
            })
            .collect();
        self.call_function_typed(id, &typed)
    }

    // ------------------------------------------------------------------
    // Foreign calls
    // ------------------------------------------------------------------

    #[cfg(feature = "ffi")]
    fn call_foreign(&mut self, id: FunctionId, f: ForeignFunction, argc: usize) -> Result<Value, VmError> {
        let program = Arc::clone(self.program());
        let types = program.types();
        let signature = match id {
            FunctionId::Defined(i) => program.program().functions[i as usize].signature,
            FunctionId::Intrinsic(_) => {
                return Err(VmError::Runtime("intrinsics are never foreign".into()))
            }
        };
        let sig = types.function_sig(signature).ok_or_else(|| {
            VmError::type_error("call", "a function signature", &types.name(signature))
        })?;
        let args = self.typed_args(&sig.args, argc)?;
        let cif = self
            .cifs
            .entry(signature)
            .or_insert_with(|| ffi::build_cif(types, sig))
            .clone();
        ffi::call(self, &cif, f, types, sig, &args)
    }

    #[cfg(not(feature = "ffi"))]
    fn call_foreign(&mut self, id: FunctionId, _f: ForeignFunction, _argc: usize) -> Result<Value, VmError> {
        Err(VmError::ForeignUnavailable(self.program().function_name(id)))
    }
}

/// Best-effort type of a value whose static type is unknown.
pub fn runtime_type(v: &Value) -> TypeId {
    match v {
        Value::Bool(_) => TypeId::BOOL,
        Value::Int(_) => TypeId::INT,
        Value::Double(_) => TypeId::DOUBLE,
        Value::String(_) => TypeId::STRING,
        Value::Json(_) => TypeId::JSON,
        Value::TypeId(_) => TypeId::TYPEID,
        Value::Struct(s) => s.ty,
        Value::Undefined | Value::Function(_) | Value::Vector(_) | Value::Dict(_) => TypeId::ANY,
    }
}

#[cfg(feature = "ffi")]
pub(crate) mod ffi {
    use super::*;
    use kestrel_core::types::FunctionSig;
    use kestrel_core::{Type, TypeTable};
    use libffi::middle::{arg, Arg, Cif, CodePtr, Type as FfiType};
    use std::collections::HashMap;
    use std::ffi::c_void;

    /// One call interface per function signature type.
    pub(crate) type CifCache = HashMap<TypeId, Cif>;

    enum Raw {
        U8(u8),
        I64(i64),
        F64(f64),
        U32(u32),
        Ptr(*const Value),
    }

    fn ffi_type(types: &TypeTable, ty: TypeId) -> FfiType {
        match types.get(ty) {
            Type::Bool => FfiType::u8(),
            Type::Int => FfiType::i64(),
            Type::Double => FfiType::f64(),
            Type::TypeId => FfiType::u32(),
            Type::Void => FfiType::void(),
            _ => FfiType::pointer(),
        }
    }

    pub(crate) fn build_cif(types: &TypeTable, sig: &FunctionSig) -> Cif {
        let args: Vec<FfiType> = std::iter::once(FfiType::pointer())
            .chain(sig.args.iter().map(|t| ffi_type(types, *t)))
            .collect();
        Cif::new(args, ffi_type(types, sig.ret))
    }

    fn marshal(types: &TypeTable, param: TypeId, arg: &TypedValue) -> Result<Raw, VmError> {
        let mismatch = || VmError::type_error("pass to foreign function", &types.name(param), arg.value.kind_name());
        Ok(match types.get(param) {
            Type::Bool => Raw::U8(arg.value.as_bool().ok_or_else(mismatch)? as u8),
            Type::Int => Raw::I64(arg.value.as_int().ok_or_else(mismatch)?),
            Type::Double => Raw::F64(arg.value.as_double().ok_or_else(mismatch)?),
            Type::TypeId => Raw::U32(arg.value.as_type_id().ok_or_else(mismatch)?.0),
            _ => Raw::Ptr(&arg.value as *const Value),
        })
    }

    pub(crate) fn call(
        interp: &mut Interpreter,
        cif: &Cif,
        f: ForeignFunction,
        types: &TypeTable,
        sig: &FunctionSig,
        args: &[TypedValue],
    ) -> Result<Value, VmError> {
        let raws = sig
            .args
            .iter()
            .zip(args)
            .map(|(param, a)| marshal(types, *param, a))
            .collect::<Result<Vec<_>, _>>()?;
        let ctx = interp as *mut Interpreter as *mut c_void;
        let mut ffi_args: Vec<Arg> = Vec::with_capacity(raws.len() + 1);
        ffi_args.push(arg(&ctx));
        for raw in &raws {
            ffi_args.push(match raw {
                Raw::U8(v) => arg(v),
                Raw::I64(v) => arg(v),
                Raw::F64(v) => arg(v),
                Raw::U32(v) => arg(v),
                Raw::Ptr(v) => arg(v),
            });
        }
        let code = CodePtr::from_ptr(f.addr());
        // SAFETY: the cif was built from this signature and `ForeignFunction::new`
        // requires the address to match it. Every argument outlives the call.
        let value = unsafe {
            match types.get(sig.ret) {
                Type::Void => {
                    cif.call::<()>(code, &ffi_args);
                    Value::Undefined
                }
                Type::Bool => Value::Bool(cif.call::<u64>(code, &ffi_args) & 0xff != 0),
                Type::Int => Value::Int(cif.call::<i64>(code, &ffi_args)),
                Type::Double => Value::Double(cif.call::<f64>(code, &ffi_args)),
                Type::TypeId => Value::TypeId(TypeId(cif.call::<u64>(code, &ffi_args) as u32)),
                _ => {
                    let p = cif.call::<*const Value>(code, &ffi_args);
                    if p.is_null() {
                        Value::Undefined
                    } else {
                        (*p).clone()
                    }
                }
            }
        };
        Ok(value)
    }
}
