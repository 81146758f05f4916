//! Scope flattening code generator.
//!
//! Every lexical block is generated into its own [`ScopeCode`] whose symbols
//! start at index 0 and whose register operands are `(parent_steps, index)`
//! pairs. A finished block is spliced into its parent with
//! [`ScopeCode::flatten`]; once the function's root block is reached every
//! operand has zero steps and [`ScopeCode::finalize`] turns them into plain
//! frame registers.

use crate::ast::{
    BinaryOp, Body, ExprKind, Expression, RangeKind, Statement, UnaryOp, VarAddress,
};
use crate::error::{CompileError, MAX_CALL_ARGUMENTS, MAX_POP_BATCH};
use kestrel_core::{
    Constant, FunctionId, Instruction, IntrinsicId, OpCode, Operand, StaticFrame, Storage,
    Symbol, SymbolKind, Type, TypeId, TypeTable,
};
use std::mem;

/// Register address relative to the block being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenReg {
    pub parent_steps: u32,
    pub index: u32,
}

impl GenReg {
    pub fn local(index: u32) -> Self {
        Self {
            parent_steps: 0,
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenOperand {
    Unused,
    Reg(GenReg),
    Imm(i32),
    Global(u32),
}

impl GenOperand {
    fn rebase(self, parent_symbol_count: u32) -> Self {
        match self {
            GenOperand::Reg(r) if r.parent_steps == 0 => GenOperand::Reg(GenReg {
                parent_steps: 0,
                index: r.index + parent_symbol_count,
            }),
            GenOperand::Reg(r) => GenOperand::Reg(GenReg {
                parent_steps: r.parent_steps - 1,
                index: r.index,
            }),
            other => other,
        }
    }
}

/// Instruction whose register operands are still scope relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenInstruction {
    pub op: OpCode,
    pub a: GenOperand,
    pub b: GenOperand,
    pub c: GenOperand,
}

impl GenInstruction {
    pub fn new(op: OpCode, a: GenOperand, b: GenOperand, c: GenOperand) -> Self {
        Self { op, a, b, c }
    }
}

/// Symbols and instructions of one block.
#[derive(Debug, Clone, Default)]
pub struct ScopeCode {
    pub symbols: Vec<Symbol>,
    pub instructions: Vec<GenInstruction>,
}

impl ScopeCode {
    /// Splice `child` onto the end of this block. Operands addressing the
    /// child itself move past this block's symbols; operands addressing an
    /// enclosing block get one step closer.
    pub fn flatten(&mut self, child: ScopeCode) {
        let offset = self.symbols.len() as u32;
        self.instructions
            .extend(child.instructions.into_iter().map(|i| GenInstruction {
                op: i.op,
                a: i.a.rebase(offset),
                b: i.b.rebase(offset),
                c: i.c.rebase(offset),
            }));
        self.symbols.extend(child.symbols);
    }

    /// Convert a root block into a static frame.
    pub fn finalize(self, name: &str, arg_count: usize) -> Result<StaticFrame, CompileError> {
        if self.symbols.len() > u16::MAX as usize {
            return Err(CompileError::TooManyRegisters {
                function: name.to_string(),
            });
        }
        let convert = |o: GenOperand| -> Result<Operand, CompileError> {
            match o {
                GenOperand::Unused => Ok(Operand::Unused),
                GenOperand::Imm(v) => Ok(Operand::Imm(v)),
                GenOperand::Global(g) => u16::try_from(g).map(Operand::Global).map_err(|_| {
                    CompileError::TooManyRegisters {
                        function: name.to_string(),
                    }
                }),
                GenOperand::Reg(r) if r.parent_steps == 0 => Ok(Operand::Reg(r.index as u16)),
                GenOperand::Reg(r) => Err(CompileError::InvalidAddress {
                    function: name.to_string(),
                    detail: format!("{} scope steps left after flattening", r.parent_steps),
                }),
            }
        };
        let instructions = self
            .instructions
            .iter()
            .map(|i| {
                Ok(Instruction::abc(i.op, convert(i.a)?, convert(i.b)?, convert(i.c)?))
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(StaticFrame::new(name, instructions, self.symbols, arg_count))
    }
}

fn reg(r: GenReg) -> GenOperand {
    GenOperand::Reg(r)
}

fn imm(v: i64) -> GenOperand {
    GenOperand::Imm(v as i32)
}

/// Generate the static frame for one root body (a function or the globals).
pub fn generate_frame(
    name: &str,
    body: &Body,
    types: &TypeTable,
    global_count: usize,
    function_count: usize,
) -> Result<StaticFrame, CompileError> {
    let arg_count = body
        .symbols
        .iter()
        .take_while(|s| s.kind == SymbolKind::Parameter)
        .count();
    let mut gen = CodeGenerator {
        types,
        name,
        global_count,
        function_count,
        current: ScopeCode::default(),
        parents: Vec::new(),
        temp_counter: 0,
    };
    let root = gen.gen_body(body)?;
    root.finalize(name, arg_count)
}

struct CodeGenerator<'a> {
    types: &'a TypeTable,
    name: &'a str,
    global_count: usize,
    function_count: usize,
    current: ScopeCode,
    parents: Vec<ScopeCode>,
    temp_counter: usize,
}

impl<'a> CodeGenerator<'a> {
    // ----------------------------------------------------------------
    // Scope handling
    // ----------------------------------------------------------------

    fn storage(&self, ty: TypeId) -> Storage {
        self.types.storage(ty)
    }

    fn is_external(&self, ty: TypeId) -> bool {
        self.types.is_external(ty)
    }

    /// Generate `body` as a detached block. The caller flattens it.
    fn gen_body(&mut self, body: &Body) -> Result<ScopeCode, CompileError> {
        let symbols = body
            .symbols
            .iter()
            .map(|s| Symbol::new(s.name.clone(), s.ty, self.storage(s.ty), s.kind.clone()))
            .collect();
        let scope = ScopeCode {
            symbols,
            instructions: Vec::new(),
        };
        let parent = mem::replace(&mut self.current, scope);
        self.parents.push(parent);
        let result = body
            .statements
            .iter()
            .try_for_each(|s| self.gen_statement(s));
        let parent = self.parents.pop().unwrap_or_default();
        let block = mem::replace(&mut self.current, parent);
        result.map(|_| block)
    }

    fn emit(&mut self, op: OpCode, a: GenOperand, b: GenOperand, c: GenOperand) -> usize {
        self.current.instructions.push(GenInstruction::new(op, a, b, c));
        self.current.instructions.len() - 1
    }

    fn patch_offset(&mut self, at: usize) {
        let offset = (self.current.instructions.len() - at) as i64;
        let instr = &mut self.current.instructions[at];
        match instr.op {
            OpCode::Branch => instr.a = imm(offset),
            _ => instr.b = imm(offset),
        }
    }

    fn add_symbol(&mut self, symbol: Symbol) -> GenReg {
        self.current.symbols.push(symbol);
        GenReg::local(self.current.symbols.len() as u32 - 1)
    }

    fn add_temp(&mut self, ty: TypeId) -> GenReg {
        self.temp_counter += 1;
        let name = format!("#t{}", self.temp_counter);
        self.add_symbol(Symbol::new(name, ty, self.storage(ty), SymbolKind::Immutable))
    }

    fn add_constant(&mut self, ty: TypeId, value: Constant) -> GenReg {
        let name = format!("#k{}", self.current.symbols.len());
        self.add_symbol(Symbol::new(name, ty, self.storage(ty), SymbolKind::Constant(value)))
    }

    fn dest_or_temp(&mut self, target: Option<GenReg>, ty: TypeId) -> GenReg {
        match target {
            Some(t) => t,
            None => self.add_temp(ty),
        }
    }

    fn scope_at(&self, parent_steps: u32) -> Option<&ScopeCode> {
        if parent_steps == 0 {
            Some(&self.current)
        } else {
            self.parents
                .len()
                .checked_sub(parent_steps as usize)
                .and_then(|i| self.parents.get(i))
        }
    }

    fn symbol_at(&self, addr: VarAddress) -> Option<&Symbol> {
        let VarAddress::Scope {
            parent_steps,
            index,
        } = addr
        else {
            return None;
        };
        self.scope_at(parent_steps)?.symbols.get(index as usize)
    }

    fn resolve(&self, addr: VarAddress) -> Result<GenReg, CompileError> {
        let VarAddress::Scope {
            parent_steps,
            index,
        } = addr
        else {
            return Err(self.invalid(format!("{:?} is not a scope address", addr)));
        };
        let scope = self.scope_at(parent_steps);
        // The outermost entry of `parents` is the empty placeholder that sat
        // in `current` before the root body was pushed.
        let reachable = (parent_steps as usize) < self.parents.len();
        match scope {
            Some(s) if reachable && (index as usize) < s.symbols.len() => Ok(GenReg {
                parent_steps,
                index,
            }),
            _ => Err(self.invalid(format!(
                "no symbol {} at {} scope steps",
                index, parent_steps
            ))),
        }
    }

    fn invalid(&self, detail: String) -> CompileError {
        CompileError::InvalidAddress {
            function: self.name.to_string(),
            detail,
        }
    }

    fn check_global(&self, index: u32) -> Result<(), CompileError> {
        if (index as usize) < self.global_count {
            Ok(())
        } else {
            Err(self.invalid(format!("global {} out of range", index)))
        }
    }

    fn copy_op(&self, ty: TypeId) -> OpCode {
        if self.is_external(ty) {
            OpCode::CopyRegExt
        } else {
            OpCode::CopyRegInplace
        }
    }

    fn push_op(&self, ty: TypeId) -> OpCode {
        if self.is_external(ty) {
            OpCode::PushExt
        } else {
            OpCode::PushInplace
        }
    }

    fn move_into(&mut self, target: Option<GenReg>, src: GenReg, ty: TypeId) -> GenReg {
        match target {
            Some(t) if t != src => {
                let op = self.copy_op(ty);
                self.emit(op, reg(t), reg(src), GenOperand::Unused);
                t
            }
            _ => src,
        }
    }

    /// Release pushed slots, at most [`MAX_POP_BATCH`] per instruction.
    /// `external[i]` flags the i-th pushed slot.
    fn emit_pops(&mut self, external: &[bool]) {
        let mut remaining = external.len();
        while remaining > 0 {
            let n = remaining.min(MAX_POP_BATCH);
            let mask = external[remaining - n..remaining]
                .iter()
                .enumerate()
                .fold(0u32, |m, (i, ext)| if *ext { m | (1 << i) } else { m });
            self.emit(
                OpCode::Popn,
                imm(n as i64),
                GenOperand::Imm(mask as i32),
                GenOperand::Unused,
            );
            remaining -= n;
        }
    }

    // ----------------------------------------------------------------
    // Statements
    // ----------------------------------------------------------------

    fn gen_statement(&mut self, stmt: &Statement) -> Result<(), CompileError> {
        match stmt {
            Statement::Bind { dest, value } | Statement::Store { dest, value } => {
                self.gen_store(*dest, value)
            }
            Statement::Block(body) => {
                let block = self.gen_body(body)?;
                self.current.flatten(block);
                Ok(())
            }
            Statement::Return(value) => {
                let (r, _) = self.gen_expr(value, None)?;
                self.emit(OpCode::Return, reg(r), GenOperand::Unused, GenOperand::Unused);
                Ok(())
            }
            Statement::If {
                condition,
                then_body,
                else_body,
            } => self.gen_if(condition, then_body, else_body.as_ref()),
            Statement::For {
                range,
                start,
                end,
                body,
            } => self.gen_for(*range, start, end, body),
            Statement::While { condition, body } => self.gen_while(condition, body),
            Statement::Expression(e) => self.gen_expr(e, None).map(|_| ()),
        }
    }

    fn gen_store(&mut self, dest: VarAddress, value: &Expression) -> Result<(), CompileError> {
        match dest {
            VarAddress::Scope { .. } => {
                let target = self.resolve(dest)?;
                self.gen_expr(value, Some(target))?;
                Ok(())
            }
            VarAddress::Global(index) => {
                self.check_global(index)?;
                let (r, ty) = self.gen_expr(value, None)?;
                let op = if self.is_external(ty) {
                    OpCode::StoreGlobalExt
                } else {
                    OpCode::StoreGlobalInplace
                };
                self.emit(op, GenOperand::Global(index), reg(r), GenOperand::Unused);
                Ok(())
            }
            VarAddress::Intrinsic(id) => Err(self.invalid(format!(
                "cannot assign to intrinsic {}",
                id.name()
            ))),
        }
    }

    fn gen_if(
        &mut self,
        condition: &Expression,
        then_body: &Body,
        else_body: Option<&Body>,
    ) -> Result<(), CompileError> {
        let (cond, _) = self.gen_expr(condition, None)?;
        let then_code = self.gen_body(then_body)?;
        let then_len = then_code.instructions.len() as i64;
        match else_body {
            Some(else_body) => {
                let else_code = self.gen_body(else_body)?;
                let else_len = else_code.instructions.len() as i64;
                self.emit(OpCode::BranchFalseBool, reg(cond), imm(then_len + 2), GenOperand::Unused);
                self.current.flatten(then_code);
                self.emit(OpCode::Branch, imm(else_len + 1), GenOperand::Unused, GenOperand::Unused);
                self.current.flatten(else_code);
            }
            None => {
                self.emit(OpCode::BranchFalseBool, reg(cond), imm(then_len + 1), GenOperand::Unused);
                self.current.flatten(then_code);
            }
        }
        Ok(())
    }

    fn gen_for(
        &mut self,
        range: RangeKind,
        start: &Expression,
        end: &Expression,
        body: &Body,
    ) -> Result<(), CompileError> {
        if body.symbols.is_empty() {
            return Err(self.invalid("for loop body declares no counter".to_string()));
        }
        let (start_reg, _) = self.gen_expr(start, None)?;
        let (mut end_reg, _) = self.gen_expr(end, None)?;
        // The body may assign a variable bound; the loop keeps the first value.
        if let ExprKind::Load(addr) = end.kind {
            let assignable = matches!(
                self.symbol_at(addr).map(|s| &s.kind),
                Some(SymbolKind::Mutable | SymbolKind::Parameter)
            );
            if assignable {
                let bound = self.add_temp(TypeId::INT);
                self.emit(OpCode::CopyRegInplace, reg(bound), reg(end_reg), GenOperand::Unused);
                end_reg = bound;
            }
        }
        let one = self.add_constant(TypeId::INT, Constant::Int(1));
        let body_code = self.gen_body(body)?;
        let body_len = body_code.instructions.len() as i64;

        // The counter is the first body symbol, so after flattening it lands
        // right after everything this block has declared so far.
        let counter = GenReg::local(self.current.symbols.len() as u32);
        let (entry_op, exit_op) = match range {
            RangeKind::Closed => (OpCode::BranchSmallerInt, OpCode::BranchSmallerOrEqualInt),
            RangeKind::Open => (OpCode::BranchSmallerOrEqualInt, OpCode::BranchSmallerInt),
        };
        self.emit(OpCode::CopyRegInplace, reg(counter), reg(start_reg), GenOperand::Unused);
        self.emit(entry_op, reg(end_reg), reg(counter), imm(body_len + 3));
        self.current.flatten(body_code);
        self.emit(OpCode::AddInt, reg(counter), reg(counter), reg(one));
        self.emit(exit_op, reg(counter), reg(end_reg), imm(-(body_len + 1)));
        Ok(())
    }

    fn gen_while(&mut self, condition: &Expression, body: &Body) -> Result<(), CompileError> {
        let cond_start = self.current.instructions.len();
        let (cond, _) = self.gen_expr(condition, None)?;
        let cond_len = (self.current.instructions.len() - cond_start) as i64;
        let body_code = self.gen_body(body)?;
        let body_len = body_code.instructions.len() as i64;
        self.emit(OpCode::BranchFalseBool, reg(cond), imm(body_len + 2), GenOperand::Unused);
        self.current.flatten(body_code);
        self.emit(
            OpCode::Branch,
            imm(-(body_len + 1 + cond_len)),
            GenOperand::Unused,
            GenOperand::Unused,
        );
        Ok(())
    }

    // ----------------------------------------------------------------
    // Expressions
    // ----------------------------------------------------------------

    /// Generate `expr`, leaving its value in `target` if given. Returns the
    /// register that holds the result and the result's type.
    fn gen_expr(
        &mut self,
        expr: &Expression,
        target: Option<GenReg>,
    ) -> Result<(GenReg, TypeId), CompileError> {
        let ty = expr.ty;
        let r = match &expr.kind {
            ExprKind::Literal(c) => {
                if let Constant::Function(FunctionId::Defined(i)) = c {
                    if *i as usize >= self.function_count {
                        return Err(CompileError::UnresolvedFunction(format!("function #{}", i)));
                    }
                }
                let k = self.add_constant(ty, c.clone());
                self.move_into(target, k, ty)
            }
            ExprKind::Load(addr) => self.gen_load(*addr, ty, target)?,
            ExprKind::Member { parent, index } => {
                let (p, _) = self.gen_expr(parent, None)?;
                let dest = self.dest_or_temp(target, ty);
                self.emit(OpCode::GetStructMember, reg(dest), reg(p), imm(*index as i64));
                dest
            }
            ExprKind::Lookup { parent, key } => self.gen_lookup(parent, key, ty, target)?,
            ExprKind::Call { callee, args } => self.gen_call(callee, args, ty, target)?,
            ExprKind::IntrinsicCall { id, args } => self.gen_intrinsic(*id, args, ty, target)?,
            ExprKind::Unary { op, operand } => self.gen_unary(*op, operand, ty, target)?,
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs, ty, target)?,
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                let dest = self.dest_or_temp(target, ty);
                let (cond, _) = self.gen_expr(condition, None)?;
                let to_else = self.emit(OpCode::BranchFalseBool, reg(cond), imm(0), GenOperand::Unused);
                self.gen_expr(then_expr, Some(dest))?;
                let to_end = self.emit(OpCode::Branch, imm(0), GenOperand::Unused, GenOperand::Unused);
                self.patch_offset(to_else);
                self.gen_expr(else_expr, Some(dest))?;
                self.patch_offset(to_end);
                dest
            }
            ExprKind::ConstructValue { args } => self.gen_construct(args, ty, target)?,
        };
        Ok((r, ty))
    }

    fn gen_load(
        &mut self,
        addr: VarAddress,
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        match addr {
            VarAddress::Scope { .. } => {
                let src = self.resolve(addr)?;
                Ok(self.move_into(target, src, ty))
            }
            VarAddress::Global(index) => {
                self.check_global(index)?;
                let dest = self.dest_or_temp(target, ty);
                let op = if self.is_external(ty) {
                    OpCode::LoadGlobalExt
                } else {
                    OpCode::LoadGlobalInplace
                };
                self.emit(op, reg(dest), GenOperand::Global(index), GenOperand::Unused);
                Ok(dest)
            }
            VarAddress::Intrinsic(id) => {
                let dest = self.dest_or_temp(target, ty);
                self.emit(OpCode::LoadIntrinsic, reg(dest), imm(id.index() as i64), GenOperand::Unused);
                Ok(dest)
            }
        }
    }

    fn gen_lookup(
        &mut self,
        parent: &Expression,
        key: &Expression,
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        let op = match self.types.get(parent.ty) {
            Type::String => OpCode::LookupString,
            Type::Json => OpCode::LookupJson,
            Type::Vector(e) if self.is_external(*e) => OpCode::LookupVectorExt,
            Type::Vector(_) => OpCode::LookupVectorInplace,
            Type::Dict(e) if self.is_external(*e) => OpCode::LookupDictExt,
            Type::Dict(_) => OpCode::LookupDictInplace,
            _ => return Err(self.unsupported("[]", parent.ty)),
        };
        let (p, _) = self.gen_expr(parent, None)?;
        let (k, _) = self.gen_expr(key, None)?;
        let dest = self.dest_or_temp(target, ty);
        self.emit(op, reg(dest), reg(p), reg(k));
        Ok(dest)
    }

    fn unsupported(&self, op: &str, ty: TypeId) -> CompileError {
        CompileError::UnsupportedOperator {
            op: op.to_string(),
            ty: self.types.name(ty),
        }
    }

    fn gen_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expression,
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        let (x, _) = self.gen_expr(operand, None)?;
        let (opcode, zero) = match (op, self.types.get(operand.ty)) {
            (UnaryOp::Negate, Type::Int) => (OpCode::SubInt, Constant::Int(0)),
            (UnaryOp::Negate, Type::Double) => (OpCode::SubDouble, Constant::Double(0.0)),
            (UnaryOp::Not, Type::Bool) => (OpCode::CompareEqual, Constant::Bool(false)),
            (UnaryOp::Negate, _) => return Err(self.unsupported("-", operand.ty)),
            (UnaryOp::Not, _) => return Err(self.unsupported("!", operand.ty)),
        };
        let k = self.add_constant(operand.ty, zero);
        let dest = self.dest_or_temp(target, ty);
        match op {
            UnaryOp::Negate => self.emit(opcode, reg(dest), reg(k), reg(x)),
            UnaryOp::Not => self.emit(opcode, reg(dest), reg(x), reg(k)),
        };
        Ok(dest)
    }

    fn gen_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.gen_logical(op, lhs, rhs, target);
        }
        let operand_ty = lhs.ty;
        let is_int = operand_ty == TypeId::INT;
        let (opcode, swap) = match op {
            BinaryOp::Add => (self.add_op(operand_ty)?, false),
            BinaryOp::Sub => (self.arith_op("-", operand_ty, OpCode::SubInt, OpCode::SubDouble)?, false),
            BinaryOp::Mul => (self.arith_op("*", operand_ty, OpCode::MulInt, OpCode::MulDouble)?, false),
            BinaryOp::Div => (self.arith_op("/", operand_ty, OpCode::DivInt, OpCode::DivDouble)?, false),
            BinaryOp::Rem if is_int => (OpCode::RemInt, false),
            BinaryOp::Rem => return Err(self.unsupported("%", operand_ty)),
            BinaryOp::Smaller if is_int => (OpCode::CompareSmallerInt, false),
            BinaryOp::Smaller => (OpCode::CompareSmaller, false),
            BinaryOp::SmallerOrEqual if is_int => (OpCode::CompareSmallerOrEqualInt, false),
            BinaryOp::SmallerOrEqual => (OpCode::CompareSmallerOrEqual, false),
            BinaryOp::Larger if is_int => (OpCode::CompareSmallerInt, true),
            BinaryOp::Larger => (OpCode::CompareSmaller, true),
            BinaryOp::LargerOrEqual if is_int => (OpCode::CompareSmallerOrEqualInt, true),
            BinaryOp::LargerOrEqual => (OpCode::CompareSmallerOrEqual, true),
            BinaryOp::Equal if is_int => (OpCode::CompareEqualInt, false),
            BinaryOp::Equal => (OpCode::CompareEqual, false),
            BinaryOp::NotEqual if is_int => (OpCode::CompareNotEqualInt, false),
            BinaryOp::NotEqual => (OpCode::CompareNotEqual, false),
            BinaryOp::And | BinaryOp::Or => {
                return Err(CompileError::Internal("logical operator in arithmetic path".into()))
            }
        };
        let (l, _) = self.gen_expr(lhs, None)?;
        let (r, _) = self.gen_expr(rhs, None)?;
        let dest = self.dest_or_temp(target, ty);
        let (b, c) = if swap { (r, l) } else { (l, r) };
        self.emit(opcode, reg(dest), reg(b), reg(c));
        Ok(dest)
    }

    fn add_op(&self, ty: TypeId) -> Result<OpCode, CompileError> {
        match self.types.get(ty) {
            Type::Int => Ok(OpCode::AddInt),
            Type::Double => Ok(OpCode::AddDouble),
            Type::String => Ok(OpCode::ConcatStrings),
            Type::Vector(e) if self.is_external(*e) => Ok(OpCode::ConcatVectorsExt),
            Type::Vector(_) => Ok(OpCode::ConcatVectorsInplace),
            _ => Err(self.unsupported("+", ty)),
        }
    }

    fn arith_op(
        &self,
        symbol: &str,
        ty: TypeId,
        int_op: OpCode,
        double_op: OpCode,
    ) -> Result<OpCode, CompileError> {
        match self.types.get(ty) {
            Type::Int => Ok(int_op),
            Type::Double => Ok(double_op),
            _ => Err(self.unsupported(symbol, ty)),
        }
    }

    /// `and` / `or` with short circuit. The result goes through a fresh
    /// register so the left operand never clobbers a target the right
    /// operand still reads.
    fn gen_logical(
        &mut self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        if lhs.ty != TypeId::BOOL || rhs.ty != TypeId::BOOL {
            let symbol = if op == BinaryOp::And { "and" } else { "or" };
            return Err(self.unsupported(symbol, lhs.ty));
        }
        let result = self.add_temp(TypeId::BOOL);
        self.gen_expr(lhs, Some(result))?;
        let branch = if op == BinaryOp::And {
            OpCode::BranchFalseBool
        } else {
            OpCode::BranchTrueBool
        };
        let skip = self.emit(branch, reg(result), imm(0), GenOperand::Unused);
        self.gen_expr(rhs, Some(result))?;
        self.patch_offset(skip);
        Ok(self.move_into(target, result, TypeId::BOOL))
    }

    fn gen_construct(
        &mut self,
        args: &[Expression],
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        let (op, count) = match self.types.get(ty) {
            Type::Vector(e) if self.is_external(*e) => (OpCode::NewVectorExt, args.len()),
            Type::Vector(_) => (OpCode::NewVectorInplace, args.len()),
            Type::Dict(e) if args.len() % 2 == 0 => {
                let op = if self.is_external(*e) {
                    OpCode::NewDictExt
                } else {
                    OpCode::NewDictInplace
                };
                (op, args.len() / 2)
            }
            Type::Struct(def) if def.members.len() == args.len() => (OpCode::NewStruct, args.len()),
            _ => {
                return Err(CompileError::Internal(format!(
                    "cannot construct {} from {} values",
                    self.types.name(ty),
                    args.len()
                )))
            }
        };
        let mut regs = Vec::with_capacity(args.len());
        for a in args {
            regs.push(self.gen_expr(a, None)?.0);
        }
        let mut pushed = Vec::with_capacity(args.len());
        for (a, r) in args.iter().zip(&regs) {
            let push = self.push_op(a.ty);
            self.emit(push, reg(*r), GenOperand::Unused, GenOperand::Unused);
            pushed.push(push == OpCode::PushExt);
        }
        let dest = self.dest_or_temp(target, ty);
        self.emit(op, reg(dest), imm(ty.0 as i64), imm(count as i64));
        self.emit_pops(&pushed);
        Ok(dest)
    }

    // ----------------------------------------------------------------
    // Calls
    // ----------------------------------------------------------------

    fn gen_call(
        &mut self,
        callee: &Expression,
        args: &[Expression],
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        let callee_name = match &callee.kind {
            ExprKind::Literal(Constant::Function(FunctionId::Defined(i))) => format!("function #{}", i),
            ExprKind::Load(VarAddress::Global(i)) => format!("global #{}", i),
            _ => self.types.name(callee.ty),
        };
        if args.len() > MAX_CALL_ARGUMENTS {
            return Err(CompileError::TooManyArguments {
                callee: callee_name,
                count: args.len(),
            });
        }
        let sig = self
            .types
            .function_sig(callee.ty)
            .cloned()
            .ok_or_else(|| CompileError::Internal(format!("{} is not callable", callee_name)))?;
        if sig.args.len() != args.len() {
            return Err(CompileError::Internal(format!(
                "{} expects {} arguments, got {}",
                callee_name,
                sig.args.len(),
                args.len()
            )));
        }
        let simple_callee = matches!(callee.kind, ExprKind::Literal(_) | ExprKind::Load(_));
        let mut regs = Vec::with_capacity(args.len());
        for a in args {
            regs.push(self.gen_expr(a, None)?.0);
        }
        let early_callee = if simple_callee {
            None
        } else {
            Some(self.gen_expr(callee, None)?.0)
        };
        let dest = self.dest_or_temp(target, ty);
        self.emit(OpCode::PushFramePtr, GenOperand::Unused, GenOperand::Unused, GenOperand::Unused);
        let callee_reg = match early_callee {
            Some(r) => r,
            None => self.gen_expr(callee, None)?.0,
        };
        // Intrinsics take every argument as a (type id, value) pair.
        let dynamic: Vec<bool> = if matches!(callee.kind, ExprKind::Load(VarAddress::Intrinsic(_))) {
            vec![true; args.len()]
        } else {
            sig.args.iter().map(|t| *t == TypeId::ANY).collect()
        };
        self.finish_call(dest, callee_reg, args, &regs, &dynamic);
        Ok(dest)
    }

    /// Push arguments, call, release the arguments and restore the caller.
    fn finish_call(
        &mut self,
        dest: GenReg,
        callee: GenReg,
        args: &[Expression],
        regs: &[GenReg],
        dynamic: &[bool],
    ) {
        let mut pushed = Vec::with_capacity(args.len() * 2);
        for ((a, r), dynamic) in args.iter().zip(regs).zip(dynamic) {
            if *dynamic {
                let type_id = self.add_constant(TypeId::TYPEID, Constant::TypeId(a.ty));
                self.emit(OpCode::PushInplace, reg(type_id), GenOperand::Unused, GenOperand::Unused);
                self.emit(OpCode::PushExt, reg(*r), GenOperand::Unused, GenOperand::Unused);
                pushed.extend([false, true]);
            } else {
                let push = self.push_op(a.ty);
                self.emit(push, reg(*r), GenOperand::Unused, GenOperand::Unused);
                pushed.push(push == OpCode::PushExt);
            }
        }
        self.emit(OpCode::Call, reg(dest), reg(callee), imm(pushed.len() as i64));
        self.emit_pops(&pushed);
        self.emit(OpCode::PopFramePtr, GenOperand::Unused, GenOperand::Unused, GenOperand::Unused);
    }

    fn gen_intrinsic(
        &mut self,
        id: IntrinsicId,
        args: &[Expression],
        ty: TypeId,
        target: Option<GenReg>,
    ) -> Result<GenReg, CompileError> {
        if args.len() > MAX_CALL_ARGUMENTS {
            return Err(CompileError::TooManyArguments {
                callee: id.name().to_string(),
                count: args.len(),
            });
        }
        if let Some(op) = self.dedicated_opcode(id, args) {
            let (collection, _) = self.gen_expr(&args[0], None)?;
            let element = match args.get(1) {
                Some(e) => reg(self.gen_expr(e, None)?.0),
                None => GenOperand::Unused,
            };
            let dest = self.dest_or_temp(target, ty);
            self.emit(op, reg(dest), reg(collection), element);
            return Ok(dest);
        }

        let mut regs = Vec::with_capacity(args.len());
        for a in args {
            regs.push(self.gen_expr(a, None)?.0);
        }
        let dest = self.dest_or_temp(target, ty);
        let callee = self.add_temp(TypeId::ANY);
        self.emit(OpCode::PushFramePtr, GenOperand::Unused, GenOperand::Unused, GenOperand::Unused);
        self.emit(OpCode::LoadIntrinsic, reg(callee), imm(id.index() as i64), GenOperand::Unused);
        let dynamic = vec![true; args.len()];
        self.finish_call(dest, callee, args, &regs, &dynamic);
        Ok(dest)
    }

    /// `push_back` and `size` on a statically known representation compile
    /// to a single opcode.
    fn dedicated_opcode(&self, id: IntrinsicId, args: &[Expression]) -> Option<OpCode> {
        let first = args.first()?;
        match (id, args.len(), self.types.get(first.ty)) {
            (IntrinsicId::PushBack, 2, Type::String) => Some(OpCode::PushBackString),
            (IntrinsicId::PushBack, 2, Type::Vector(e)) if self.is_external(*e) => {
                Some(OpCode::PushBackVectorExt)
            }
            (IntrinsicId::PushBack, 2, Type::Vector(_)) => Some(OpCode::PushBackVectorInplace),
            (IntrinsicId::Size, 1, Type::String) => Some(OpCode::SizeString),
            (IntrinsicId::Size, 1, Type::Vector(_)) => Some(OpCode::SizeVector),
            (IntrinsicId::Size, 1, Type::Dict(_)) => Some(OpCode::SizeDict),
            (IntrinsicId::Size, 1, Type::Json) => Some(OpCode::SizeJson),
            _ => None,
        }
    }
}
