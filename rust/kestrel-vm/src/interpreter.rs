//! Register VM dispatch loop.
//!
//! An [`Interpreter`] owns one register stack and shares the linked program
//! with every other interpreter of the run. Bytecode calls recurse through
//! [`Interpreter::execute`]; the Rust call stack mirrors the frame links on
//! the register stack.

use crate::config::VmConfig;
use crate::error::{StackFrame, VmError};
use crate::link::LinkedProgram;
use crate::stack::RegisterStack;
use kestrel_core::{
    compare_doubles, DictValue, FrameId, FunctionId, Instruction, IntrinsicId, OpCode, Operand, StaticFrame, Type,
    TypeId, TypeTable, Value, VectorValue,
};
use kestrel_runtime::{ProcessHandle, ProcessRegistry};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// What the dispatch loop does after an instruction.
enum Flow {
    Next,
    Jump(i32),
    Return(Value),
}

/// The process an interpreter runs for, if any.
pub(crate) struct ProcessContext {
    pub(crate) registry: Arc<ProcessRegistry<Value>>,
    pub(crate) handle: Arc<ProcessHandle<Value>>,
}

/// Saved stack position, restored after a failed host call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    len: usize,
    base: usize,
    frame: FrameId,
    depth: usize,
}

pub struct Interpreter {
    program: Arc<LinkedProgram>,
    pub(crate) stack: RegisterStack,
    pub(crate) config: VmConfig,
    output: Vec<String>,
    pub(crate) depth: usize,
    executed: u64,
    trace: Vec<StackFrame>,
    pub(crate) process: Option<ProcessContext>,
    #[cfg(feature = "ffi")]
    pub(crate) cifs: crate::call::ffi::CifCache,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("stack_len", &self.stack.len())
            .field("depth", &self.depth)
            .field("executed", &self.executed)
            .field("output", &self.output.len())
            .finish()
    }
}

impl Interpreter {
    /// Create an interpreter and run the global frame once.
    pub fn new(program: Arc<LinkedProgram>, config: VmConfig) -> Result<Self, VmError> {
        let mut interp = Self::bare(program, config);
        let program = Arc::clone(&interp.program);
        let globals = &program.program().globals;
        let base = interp.stack.open_frame_except_args(globals, program.types())?;
        interp.stack.set_active(base, FrameId::Global);
        interp.execute(globals).map_err(|e| {
            let frames = interp.take_trace();
            e.with_stack_trace(frames)
        })?;
        debug!(
            globals = globals.symbols.len(),
            instructions = interp.executed,
            "global frame initialised"
        );
        Ok(interp)
    }

    /// Create an interpreter whose global frame is a copy of `globals`,
    /// without running the global frame again.
    pub fn with_globals(
        program: Arc<LinkedProgram>,
        config: VmConfig,
        globals: Vec<Value>,
    ) -> Result<Self, VmError> {
        let expected = program.program().globals.symbols.len();
        if globals.len() != expected {
            return Err(VmError::Runtime(format!(
                "global snapshot has {} values, program declares {}",
                globals.len(),
                expected
            )));
        }
        let mut interp = Self::bare(program, config);
        for v in globals {
            interp.stack.push(v);
        }
        interp.stack.set_active(0, FrameId::Global);
        Ok(interp)
    }

    fn bare(program: Arc<LinkedProgram>, config: VmConfig) -> Self {
        Self {
            program,
            stack: RegisterStack::new(config.stack_reserve),
            config,
            output: Vec::new(),
            depth: 0,
            executed: 0,
            trace: Vec::new(),
            process: None,
            #[cfg(feature = "ffi")]
            cifs: Default::default(),
        }
    }

    pub fn program(&self) -> &Arc<LinkedProgram> {
        &self.program
    }

    pub fn types(&self) -> &TypeTable {
        self.program.types()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Read a global by name.
    pub fn global_value(&self, name: &str) -> Option<Value> {
        let index = self.program.program().global_index(name)?;
        self.stack.global(index).ok().cloned()
    }

    /// Copies of every global slot.
    pub fn globals(&self) -> Result<Vec<Value>, VmError> {
        self.stack
            .snapshot(self.program.program().globals.symbols.len())
    }

    /// Lines written by `print`.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn print_line(&mut self, line: String) {
        if self.config.echo_print {
            println!("{}", line);
        }
        self.output.push(line);
    }

    pub(crate) fn attach_process(
        &mut self,
        registry: Arc<ProcessRegistry<Value>>,
        handle: Arc<ProcessHandle<Value>>,
    ) {
        self.process = Some(ProcessContext { registry, handle });
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.stack.len(),
            base: self.stack.base(),
            frame: self.stack.frame(),
            depth: self.depth,
        }
    }

    pub(crate) fn restore(&mut self, cp: Checkpoint) {
        self.stack.truncate(cp.len);
        self.stack.set_active(cp.base, cp.frame);
        self.depth = cp.depth;
    }

    /// Stack trace collected while the last error unwound, outermost first.
    pub(crate) fn take_trace(&mut self) -> Vec<StackFrame> {
        let mut frames = std::mem::take(&mut self.trace);
        frames.reverse();
        frames
    }

    pub(crate) fn clear_trace(&mut self) {
        self.trace.clear();
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Run `frame`, already opened as the active frame, until it returns or
    /// falls off the end (which yields `Undefined`).
    pub(crate) fn execute(&mut self, frame: &StaticFrame) -> Result<Value, VmError> {
        let program = Arc::clone(&self.program);
        let len = frame.instructions.len();
        let mut pc = 0usize;
        while let Some(instr) = frame.instructions.get(pc) {
            self.executed += 1;
            if let Some(limit) = self.config.instruction_limit {
                if self.executed > limit {
                    return Err(self.unwinding(frame, pc, VmError::InstructionLimitExceeded(limit)));
                }
            }
            match self.step(&program, frame, instr) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(offset)) => {
                    let target = pc as i64 + offset as i64;
                    if target < 0 || target > len as i64 {
                        let err = VmError::Runtime(format!(
                            "branch to {} outside {} instructions",
                            target, len
                        ));
                        return Err(self.unwinding(frame, pc, err));
                    }
                    pc = target as usize;
                }
                Ok(Flow::Return(v)) => return Ok(v),
                Err(e) => return Err(self.unwinding(frame, pc, e)),
            }
        }
        Ok(Value::Undefined)
    }

    fn unwinding(&mut self, frame: &StaticFrame, pc: usize, err: VmError) -> VmError {
        self.trace.push(StackFrame {
            function: frame.name.clone(),
            pc,
        });
        err
    }

    fn step(
        &mut self,
        program: &LinkedProgram,
        frame: &StaticFrame,
        instr: &Instruction,
    ) -> Result<Flow, VmError> {
        let types = program.types();
        let Instruction { op, a, b, c } = *instr;
        match op {
            OpCode::Nop => {}

            OpCode::LoadGlobalExt | OpCode::LoadGlobalInplace => {
                let v = self.stack.global(global(b)?)?.clone();
                self.stack.write(reg(a)?, v)?;
            }
            OpCode::StoreGlobalExt | OpCode::StoreGlobalInplace => {
                let v = self.stack.get(reg(b)?)?.clone();
                self.stack.write_global(global(a)?, v)?;
            }
            OpCode::CopyRegExt | OpCode::CopyRegInplace => self.stack.copy(reg(a)?, reg(b)?)?,
            OpCode::LoadIntrinsic => {
                let index = imm(b)?;
                let id = u16::try_from(index)
                    .ok()
                    .and_then(IntrinsicId::from_index)
                    .ok_or_else(|| VmError::Runtime(format!("unknown intrinsic #{}", index)))?;
                self.stack
                    .write(reg(a)?, Value::Function(FunctionId::Intrinsic(id)))?;
            }

            OpCode::GetStructMember => {
                let s = self.stack.get(reg(b)?)?;
                let s = s
                    .as_struct()
                    .ok_or_else(|| VmError::type_error("read member", "struct", s.kind_name()))?;
                let index = imm(c)?;
                let v = usize::try_from(index)
                    .ok()
                    .and_then(|i| s.members.get(i))
                    .cloned()
                    .ok_or(VmError::IndexOutOfBounds {
                        what: "struct",
                        index: index as i64,
                        size: s.members.len(),
                    })?;
                self.stack.write(reg(a)?, v)?;
            }
            OpCode::LookupString => {
                let s = self.str_at(reg(b)?)?;
                let index = self.int_at(reg(c)?)?;
                let ch = usize::try_from(index)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .ok_or_else(|| VmError::IndexOutOfBounds {
                        what: "string",
                        index,
                        size: s.chars().count(),
                    })?;
                self.stack.write(reg(a)?, Value::Int(ch as i64))?;
            }
            OpCode::LookupJson => {
                let v = lookup_json(self.stack.get(reg(b)?)?, self.stack.get(reg(c)?)?)?;
                self.stack.write(reg(a)?, v)?;
            }
            OpCode::LookupVectorExt | OpCode::LookupVectorInplace => {
                let v = self.vector_at(reg(b)?)?;
                let index = self.int_at(reg(c)?)?;
                let element = usize::try_from(index)
                    .ok()
                    .and_then(|i| v.get(i))
                    .ok_or(VmError::IndexOutOfBounds {
                        what: "vector",
                        index,
                        size: v.len(),
                    })?;
                self.stack.write(reg(a)?, element)?;
            }
            OpCode::LookupDictExt | OpCode::LookupDictInplace => {
                let d = self.dict_at(reg(b)?)?;
                let key = self.str_at(reg(c)?)?;
                let v = d.get(&key).ok_or_else(|| VmError::KeyNotFound(key.to_string()))?;
                self.stack.write(reg(a)?, v)?;
            }

            OpCode::SizeString => {
                let n = self.str_at(reg(b)?)?.chars().count();
                self.stack.write(reg(a)?, Value::Int(n as i64))?;
            }
            OpCode::SizeVector => {
                let n = self.vector_at(reg(b)?)?.len();
                self.stack.write(reg(a)?, Value::Int(n as i64))?;
            }
            OpCode::SizeDict => {
                let n = self.dict_at(reg(b)?)?.len();
                self.stack.write(reg(a)?, Value::Int(n as i64))?;
            }
            OpCode::SizeJson => {
                let n = json_size(self.stack.get(reg(b)?)?)?;
                self.stack.write(reg(a)?, Value::Int(n as i64))?;
            }

            OpCode::PushBackString => {
                let s = self.str_at(reg(b)?)?;
                let tail = self.stack.get(reg(c)?)?;
                let out = push_back_string(&s, tail)?;
                self.stack.write(reg(a)?, out)?;
            }
            OpCode::PushBackVectorExt | OpCode::PushBackVectorInplace => {
                let v = self.vector_at(reg(b)?)?;
                let element = self.stack.get(reg(c)?)?.clone();
                let out = v.push_back(element)?;
                self.stack.write(reg(a)?, Value::vector(out))?;
            }

            OpCode::NewVectorExt | OpCode::NewVectorInplace => {
                let count = count_operand(c)?;
                let elements: Vec<Value> = self.stack.top(count)?.into_iter().cloned().collect();
                let v = VectorValue::from_values(op == OpCode::NewVectorExt, elements)?;
                self.stack.write(reg(a)?, Value::vector(v))?;
            }
            OpCode::NewDictExt | OpCode::NewDictInplace => {
                let count = count_operand(c)?;
                let slots = self.stack.top(count * 2)?;
                let mut d = DictValue::empty(op == OpCode::NewDictExt);
                for pair in slots.chunks(2) {
                    let key = pair[0]
                        .as_str()
                        .ok_or_else(|| VmError::type_error("use as dict key", "string", pair[0].kind_name()))?;
                    d = d.insert(key.to_string(), pair[1].clone())?;
                }
                self.stack.write(reg(a)?, Value::dict(d))?;
            }
            OpCode::NewStruct => {
                let ty = TypeId(imm(b)? as u32);
                let count = count_operand(c)?;
                let members: Vec<Value> = self.stack.top(count)?.into_iter().cloned().collect();
                self.stack.write(reg(a)?, Value::structure(ty, members))?;
            }

            OpCode::PushFramePtr => self.stack.push_link(),
            OpCode::PopFramePtr => {
                self.stack.pop_link()?;
            }
            OpCode::PushInplace | OpCode::PushExt => {
                let v = self.stack.get(reg(a)?)?.clone();
                self.stack.push(v);
            }
            OpCode::Popn => self.stack.popn(count_operand(a)?, imm(b)? as u32)?,

            OpCode::AddInt | OpCode::SubInt | OpCode::MulInt | OpCode::DivInt | OpCode::RemInt => {
                let l = self.int_at(reg(b)?)?;
                let r = self.int_at(reg(c)?)?;
                let v = match op {
                    OpCode::AddInt => l.wrapping_add(r),
                    OpCode::SubInt => l.wrapping_sub(r),
                    OpCode::MulInt => l.wrapping_mul(r),
                    OpCode::DivInt if r == 0 => return Err(VmError::DivisionByZero),
                    OpCode::DivInt => l.wrapping_div(r),
                    _ if r == 0 => return Err(VmError::DivisionByZero),
                    _ => l.wrapping_rem(r),
                };
                self.stack.write(reg(a)?, Value::Int(v))?;
            }
            OpCode::AddDouble | OpCode::SubDouble | OpCode::MulDouble | OpCode::DivDouble => {
                let l = self.double_at(reg(b)?)?;
                let r = self.double_at(reg(c)?)?;
                let v = match op {
                    OpCode::AddDouble => l + r,
                    OpCode::SubDouble => l - r,
                    OpCode::MulDouble => l * r,
                    _ if r == 0.0 => return Err(VmError::DivisionByZero),
                    _ => l / r,
                };
                self.stack.write(reg(a)?, Value::Double(v))?;
            }
            OpCode::ConcatStrings => {
                let l = self.str_at(reg(b)?)?;
                let r = self.str_at(reg(c)?)?;
                let mut s = String::with_capacity(l.len() + r.len());
                s.push_str(&l);
                s.push_str(&r);
                self.stack.write(reg(a)?, Value::string(s))?;
            }
            OpCode::ConcatVectorsExt | OpCode::ConcatVectorsInplace => {
                let l = self.vector_at(reg(b)?)?;
                let r = self.vector_at(reg(c)?)?;
                let out = l.concat(&r)?;
                self.stack.write(reg(a)?, Value::vector(out))?;
            }

            OpCode::CompareSmaller
            | OpCode::CompareSmallerOrEqual
            | OpCode::CompareEqual
            | OpCode::CompareNotEqual => {
                let rb = reg(b)?;
                let ty = frame
                    .symbol(rb)
                    .map(|s| s.ty)
                    .ok_or(VmError::RegisterOutOfBounds(rb))?;
                let ord = compare_declared(
                    types,
                    ty,
                    self.stack.get(rb)?,
                    self.stack.get(reg(c)?)?,
                )?;
                let result = match op {
                    OpCode::CompareSmaller => ord == Ordering::Less,
                    OpCode::CompareSmallerOrEqual => ord != Ordering::Greater,
                    OpCode::CompareEqual => ord == Ordering::Equal,
                    _ => ord != Ordering::Equal,
                };
                self.stack.write(reg(a)?, Value::Bool(result))?;
            }
            OpCode::CompareSmallerInt
            | OpCode::CompareSmallerOrEqualInt
            | OpCode::CompareEqualInt
            | OpCode::CompareNotEqualInt => {
                let l = self.int_at(reg(b)?)?;
                let r = self.int_at(reg(c)?)?;
                let result = match op {
                    OpCode::CompareSmallerInt => l < r,
                    OpCode::CompareSmallerOrEqualInt => l <= r,
                    OpCode::CompareEqualInt => l == r,
                    _ => l != r,
                };
                self.stack.write(reg(a)?, Value::Bool(result))?;
            }

            OpCode::Branch => return Ok(Flow::Jump(imm(a)?)),
            OpCode::BranchFalseBool | OpCode::BranchTrueBool => {
                let cond = self.bool_at(reg(a)?)?;
                if cond == (op == OpCode::BranchTrueBool) {
                    return Ok(Flow::Jump(imm(b)?));
                }
            }
            OpCode::BranchSmallerInt | OpCode::BranchSmallerOrEqualInt => {
                let l = self.int_at(reg(a)?)?;
                let r = self.int_at(reg(b)?)?;
                let taken = if op == OpCode::BranchSmallerInt { l < r } else { l <= r };
                if taken {
                    return Ok(Flow::Jump(imm(c)?));
                }
            }

            OpCode::Call => {
                let callee = reg(b)?;
                let declared = frame.symbol(callee).map(|s| s.ty);
                self.dispatch_call(reg(a)?, callee, count_operand(c)?, declared)?
            }
            OpCode::Return => return Ok(Flow::Return(self.stack.get(reg(a)?)?.clone())),
        }
        Ok(Flow::Next)
    }

    // ------------------------------------------------------------------
    // Typed register reads
    // ------------------------------------------------------------------

    fn int_at(&self, r: usize) -> Result<i64, VmError> {
        let v = self.stack.get(r)?;
        v.as_int()
            .ok_or_else(|| VmError::type_error("read int", "int", v.kind_name()))
    }

    fn double_at(&self, r: usize) -> Result<f64, VmError> {
        let v = self.stack.get(r)?;
        v.as_double()
            .ok_or_else(|| VmError::type_error("read double", "double", v.kind_name()))
    }

    fn bool_at(&self, r: usize) -> Result<bool, VmError> {
        let v = self.stack.get(r)?;
        v.as_bool()
            .ok_or_else(|| VmError::type_error("branch", "bool", v.kind_name()))
    }

    fn str_at(&self, r: usize) -> Result<Arc<str>, VmError> {
        match self.stack.get(r)? {
            Value::String(s) => Ok(Arc::clone(s)),
            v => Err(VmError::type_error("read string", "string", v.kind_name())),
        }
    }

    fn vector_at(&self, r: usize) -> Result<Arc<VectorValue>, VmError> {
        match self.stack.get(r)? {
            Value::Vector(v) => Ok(Arc::clone(v)),
            v => Err(VmError::type_error("read vector", "vector", v.kind_name())),
        }
    }

    fn dict_at(&self, r: usize) -> Result<Arc<DictValue>, VmError> {
        match self.stack.get(r)? {
            Value::Dict(d) => Ok(Arc::clone(d)),
            v => Err(VmError::type_error("read dict", "dict", v.kind_name())),
        }
    }
}

fn reg(op: Operand) -> Result<usize, VmError> {
    op.reg()
        .ok_or_else(|| VmError::Runtime(format!("expected a register operand, found {}", op)))
}

fn imm(op: Operand) -> Result<i32, VmError> {
    op.imm()
        .ok_or_else(|| VmError::Runtime(format!("expected an immediate operand, found {}", op)))
}

fn global(op: Operand) -> Result<usize, VmError> {
    op.global()
        .ok_or_else(|| VmError::Runtime(format!("expected a global operand, found {}", op)))
}

fn count_operand(op: Operand) -> Result<usize, VmError> {
    let n = imm(op)?;
    usize::try_from(n).map_err(|_| VmError::Runtime(format!("negative count {}", n)))
}

/// Ordering for the generic comparison opcodes, driven by the declared type
/// of the left operand.
fn compare_declared(types: &TypeTable, ty: TypeId, l: &Value, r: &Value) -> Result<Ordering, VmError> {
    match types.get(ty) {
        Type::Undefined | Type::Void => Err(VmError::type_error(
            "compare",
            "a value type",
            &types.name(ty),
        )),
        Type::Double => {
            let (x, y) = match (l.as_double(), r.as_double()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(VmError::type_error("compare", "double", r.kind_name())),
            };
            Ok(compare_doubles(x, y))
        }
        _ => Ok(l.compare(r)),
    }
}

pub(crate) fn lookup_json(parent: &Value, key: &Value) -> Result<Value, VmError> {
    use serde_json::Value as J;
    let json = parent
        .as_json()
        .ok_or_else(|| VmError::type_error("index json", "json", parent.kind_name()))?;
    match (json, key) {
        (J::Object(map), Value::String(k)) => map
            .get(k.as_ref())
            .map(|v| Value::json(v.clone()))
            .ok_or_else(|| VmError::KeyNotFound(k.to_string())),
        (J::Array(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|idx| items.get(idx))
            .map(|v| Value::json(v.clone()))
            .ok_or(VmError::IndexOutOfBounds {
                what: "json array",
                index: *i,
                size: items.len(),
            }),
        (J::Object(_), k) => Err(VmError::type_error("index json object", "string", k.kind_name())),
        (J::Array(_), k) => Err(VmError::type_error("index json array", "int", k.kind_name())),
        (other, _) => Err(VmError::JsonLookup(json_kind(other).to_string())),
    }
}

pub(crate) fn json_kind(j: &serde_json::Value) -> &'static str {
    match j {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

pub(crate) fn json_size(v: &Value) -> Result<usize, VmError> {
    use serde_json::Value as J;
    match v.as_json() {
        Some(J::Object(m)) => Ok(m.len()),
        Some(J::Array(a)) => Ok(a.len()),
        Some(J::String(s)) => Ok(s.chars().count()),
        Some(other) => Err(VmError::type_error("take size of json", "object, array or string", json_kind(other))),
        None => Err(VmError::type_error("take size of json", "json", v.kind_name())),
    }
}

/// Append a character code or a string.
pub(crate) fn push_back_string(s: &str, tail: &Value) -> Result<Value, VmError> {
    let mut out = String::from(s);
    match tail {
        Value::Int(code) => {
            let ch = u32::try_from(*code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| VmError::TypeError(format!("{} is not a character code", code)))?;
            out.push(ch);
        }
        Value::String(t) => out.push_str(t),
        other => return Err(VmError::type_error("push_back onto string", "int or string", other.kind_name())),
    }
    Ok(Value::string(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{link, HostLibrary};
    use kestrel_core::{Constant, Program, Storage, Symbol, SymbolKind};

    fn sym(name: &str, ty: TypeId, kind: SymbolKind) -> Symbol {
        let storage = if ty == TypeId::STRING { Storage::External } else { Storage::Inplace };
        Symbol::new(name, ty, storage, kind)
    }

    fn run_globals(instructions: Vec<Instruction>, symbols: Vec<Symbol>) -> Result<Interpreter, VmError> {
        let program = Program {
            globals: StaticFrame::new("global", instructions, symbols, 0),
            functions: vec![],
            types: TypeTable::new(),
            container: None,
            tests: vec![],
        };
        let linked = link(program, &HostLibrary::new()).map_err(|e| VmError::Runtime(e.to_string()))?;
        Interpreter::new(Arc::new(linked), VmConfig::default())
    }

    fn r(i: u16) -> Operand {
        Operand::Reg(i)
    }

    #[test]
    fn arithmetic_on_constants() {
        let interp = run_globals(
            vec![
                Instruction::abc(OpCode::AddInt, r(0), r(1), r(2)),
                Instruction::abc(OpCode::MulInt, r(0), r(0), r(2)),
            ],
            vec![
                sym("result", TypeId::INT, SymbolKind::Mutable),
                sym("#k0", TypeId::INT, SymbolKind::Constant(Constant::Int(4))),
                sym("#k1", TypeId::INT, SymbolKind::Constant(Constant::Int(5))),
            ],
        )
        .unwrap();
        assert_eq!(interp.global_value("result"), Some(Value::Int(45)));
    }

    #[test]
    fn remainder_by_zero_is_fatal() {
        let err = run_globals(
            vec![Instruction::abc(OpCode::RemInt, r(0), r(1), r(0))],
            vec![
                sym("x", TypeId::INT, SymbolKind::Mutable),
                sym("#k0", TypeId::INT, SymbolKind::Constant(Constant::Int(7))),
            ],
        )
        .unwrap_err();
        assert!(err.is_division_by_zero());
        assert_eq!(err.stack_frames()[0].function, "global");
    }

    #[test]
    fn branch_skips_forward() {
        // x = 1; if false { x = 2 }
        let interp = run_globals(
            vec![
                Instruction::ab(OpCode::CopyRegInplace, r(0), r(1)),
                Instruction::ab(OpCode::BranchFalseBool, r(3), Operand::Imm(2)),
                Instruction::ab(OpCode::CopyRegInplace, r(0), r(2)),
            ],
            vec![
                sym("x", TypeId::INT, SymbolKind::Mutable),
                sym("#k0", TypeId::INT, SymbolKind::Constant(Constant::Int(1))),
                sym("#k1", TypeId::INT, SymbolKind::Constant(Constant::Int(2))),
                sym("#k2", TypeId::BOOL, SymbolKind::Constant(Constant::Bool(false))),
            ],
        )
        .unwrap();
        assert_eq!(interp.global_value("x"), Some(Value::Int(1)));
    }

    #[test]
    fn string_lookup_out_of_bounds() {
        let err = run_globals(
            vec![Instruction::abc(OpCode::LookupString, r(0), r(1), r(2))],
            vec![
                sym("c", TypeId::INT, SymbolKind::Mutable),
                sym("#k0", TypeId::STRING, SymbolKind::Constant(Constant::String("abc".into()))),
                sym("#k1", TypeId::INT, SymbolKind::Constant(Constant::Int(3))),
            ],
        )
        .unwrap_err();
        assert!(err.is_index_out_of_bounds());
    }

    #[test]
    fn string_lookup_yields_char_code() {
        let interp = run_globals(
            vec![Instruction::abc(OpCode::LookupString, r(0), r(1), r(2))],
            vec![
                sym("c", TypeId::INT, SymbolKind::Mutable),
                sym("#k0", TypeId::STRING, SymbolKind::Constant(Constant::String("abc".into()))),
                sym("#k1", TypeId::INT, SymbolKind::Constant(Constant::Int(1))),
            ],
        )
        .unwrap();
        assert_eq!(interp.global_value("c"), Some(Value::Int('b' as i64)));
    }

    #[test]
    fn instruction_limit_stops_an_endless_loop() {
        let program = Program {
            globals: StaticFrame::new("global", vec![Instruction::a(OpCode::Branch, Operand::Imm(0))], vec![], 0),
            functions: vec![],
            types: TypeTable::new(),
            container: None,
            tests: vec![],
        };
        let linked = Arc::new(link(program, &HostLibrary::new()).unwrap());
        let config = VmConfig {
            instruction_limit: Some(100),
            ..VmConfig::default()
        };
        let err = Interpreter::new(linked, config).unwrap_err();
        assert!(err.message_contains("instruction limit exceeded: 100"));
    }

    #[test]
    fn json_lookup_rules() {
        let obj = Value::json(serde_json::json!({"a": [1, 2]}));
        let a = lookup_json(&obj, &Value::string("a")).unwrap();
        assert_eq!(lookup_json(&a, &Value::Int(1)).unwrap(), Value::json(serde_json::json!(2)));
        assert!(matches!(lookup_json(&obj, &Value::string("b")), Err(VmError::KeyNotFound(_))));
        assert!(lookup_json(&a, &Value::Int(2)).unwrap_err().is_index_out_of_bounds());
        assert_eq!(
            lookup_json(&Value::json(serde_json::json!(3)), &Value::Int(0)),
            Err(VmError::JsonLookup("number".into()))
        );
    }

    #[test]
    fn push_back_string_accepts_codes_and_strings() {
        assert_eq!(push_back_string("ab", &Value::Int('c' as i64)).unwrap(), Value::string("abc"));
        assert_eq!(push_back_string("ab", &Value::string("cd")).unwrap(), Value::string("abcd"));
        assert!(push_back_string("ab", &Value::Int(-1)).is_err());
    }
}
