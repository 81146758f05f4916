//! Symbols and static frames: the immutable compiled unit for the global
//! scope and for each function.

use crate::bytecode::{Instruction, OpCode, Operand};
use crate::program::FunctionId;
use crate::types::{Storage, TypeId};
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

/// Precomputed value of a constant symbol. Written into the symbol's slot
/// when its frame opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Json(serde_json::Value),
    TypeId(TypeId),
    Function(FunctionId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SymbolKind {
    Parameter,
    Mutable,
    Immutable,
    Constant(Constant),
    NamedType,
}

/// A named slot in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub ty: TypeId,
    pub storage: Storage,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn new(name: impl Into<String>, ty: TypeId, storage: Storage, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            ty,
            storage,
            kind,
        }
    }

    pub fn is_external(&self) -> bool {
        self.storage == Storage::External
    }

    pub fn constant(&self) -> Option<&Constant> {
        match &self.kind {
            SymbolKind::Constant(c) => Some(c),
            _ => None,
        }
    }
}

/// Identity of a static frame, used in frame links on the register stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameId {
    Global,
    Function(u32),
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("{frame}@{pc}: register r{reg} outside symbol table of {count}")]
    RegisterOutOfBounds {
        frame: String,
        pc: usize,
        reg: usize,
        count: usize,
    },
    #[error("{frame}@{pc}: global g{index} outside global table of {count}")]
    GlobalOutOfBounds {
        frame: String,
        pc: usize,
        index: usize,
        count: usize,
    },
    #[error("{frame}@{pc}: branch target {target} outside 0..={len}")]
    BranchOutOfRange {
        frame: String,
        pc: usize,
        target: i64,
        len: usize,
    },
    #[error("{frame}: argument count {args} exceeds symbol count {count}")]
    BadArgCount {
        frame: String,
        args: usize,
        count: usize,
    },
}

/// Compiled instructions plus the symbol table they address.
///
/// The first `arg_count` symbols are the argument slots (any-typed
/// parameters occupy two: the type id followed by the value); the rest are
/// locals, constants and temporaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaticFrame {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub symbols: Vec<Symbol>,
    pub arg_count: usize,
    pub local_count: usize,
}

impl StaticFrame {
    pub fn new(
        name: impl Into<String>,
        instructions: Vec<Instruction>,
        symbols: Vec<Symbol>,
        arg_count: usize,
    ) -> Self {
        let local_count = symbols.len().saturating_sub(arg_count);
        Self {
            name: name.into(),
            instructions,
            symbols,
            arg_count,
            local_count,
        }
    }

    pub fn symbol(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }

    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s.name == name)
    }

    /// Check that every operand stays inside the tables it addresses.
    pub fn validate(&self, global_count: usize) -> Result<(), FrameError> {
        let count = self.symbols.len();
        if self.arg_count > count {
            return Err(FrameError::BadArgCount {
                frame: self.name.clone(),
                args: self.arg_count,
                count,
            });
        }
        for (pc, instr) in self.instructions.iter().enumerate() {
            for operand in instr.operands() {
                match operand {
                    Operand::Reg(r) if r as usize >= count => {
                        return Err(FrameError::RegisterOutOfBounds {
                            frame: self.name.clone(),
                            pc,
                            reg: r as usize,
                            count,
                        });
                    }
                    Operand::Global(g) if g as usize >= global_count => {
                        return Err(FrameError::GlobalOutOfBounds {
                            frame: self.name.clone(),
                            pc,
                            index: g as usize,
                            count: global_count,
                        });
                    }
                    _ => {}
                }
            }
            if let Some(offset) = branch_offset(instr) {
                let target = pc as i64 + offset as i64;
                if target < 0 || target > self.instructions.len() as i64 {
                    return Err(FrameError::BranchOutOfRange {
                        frame: self.name.clone(),
                        pc,
                        target,
                        len: self.instructions.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Human readable listing: symbol table, then one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "frame {} (args: {}, locals: {})",
            self.name, self.arg_count, self.local_count
        );
        for (i, sym) in self.symbols.iter().enumerate() {
            let kind = match &sym.kind {
                SymbolKind::Parameter => "param".to_string(),
                SymbolKind::Mutable => "mut".to_string(),
                SymbolKind::Immutable => "let".to_string(),
                SymbolKind::Constant(c) => format!("const {:?}", c),
                SymbolKind::NamedType => "type".to_string(),
            };
            let _ = writeln!(out, "  r{:<4} {:<16} {} {}", i, sym.name, sym.ty, kind);
        }
        for (pc, instr) in self.instructions.iter().enumerate() {
            let _ = writeln!(out, "  {:04}: {}", pc, instr);
        }
        out
    }
}

/// The offset operand of a branch instruction.
pub fn branch_offset(instr: &Instruction) -> Option<i32> {
    match instr.op {
        OpCode::Branch => instr.a.imm(),
        OpCode::BranchFalseBool | OpCode::BranchTrueBool => instr.b.imm(),
        OpCode::BranchSmallerInt | OpCode::BranchSmallerOrEqualInt => instr.c.imm(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_symbol(name: &str) -> Symbol {
        Symbol::new(name, TypeId::INT, Storage::Inplace, SymbolKind::Mutable)
    }

    #[test]
    fn validate_accepts_in_range_operands() {
        let frame = StaticFrame::new(
            "f",
            vec![
                Instruction::abc(OpCode::AddInt, Operand::Reg(1), Operand::Reg(0), Operand::Reg(0)),
                Instruction::a(OpCode::Return, Operand::Reg(1)),
            ],
            vec![int_symbol("a"), int_symbol("b")],
            1,
        );
        assert_eq!(frame.local_count, 1);
        assert!(frame.validate(0).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_register() {
        let frame = StaticFrame::new(
            "f",
            vec![Instruction::a(OpCode::Return, Operand::Reg(3))],
            vec![int_symbol("a")],
            0,
        );
        assert!(matches!(
            frame.validate(0),
            Err(FrameError::RegisterOutOfBounds { reg: 3, .. })
        ));
    }

    #[test]
    fn validate_rejects_unknown_global() {
        let frame = StaticFrame::new(
            "f",
            vec![Instruction::ab(OpCode::LoadGlobalInplace, Operand::Reg(0), Operand::Global(5))],
            vec![int_symbol("a")],
            0,
        );
        assert!(matches!(
            frame.validate(2),
            Err(FrameError::GlobalOutOfBounds { index: 5, .. })
        ));
    }

    #[test]
    fn validate_rejects_wild_branch() {
        let frame = StaticFrame::new(
            "f",
            vec![Instruction::a(OpCode::Branch, Operand::Imm(7))],
            vec![],
            0,
        );
        assert!(matches!(
            frame.validate(0),
            Err(FrameError::BranchOutOfRange { target: 7, .. })
        ));
    }

    #[test]
    fn disassembly_lists_symbols_and_code() {
        let frame = StaticFrame::new(
            "main",
            vec![Instruction::a(OpCode::Return, Operand::Reg(0))],
            vec![Symbol::new(
                "0",
                TypeId::INT,
                Storage::Inplace,
                SymbolKind::Constant(Constant::Int(0)),
            )],
            0,
        );
        let text = frame.disassemble();
        assert!(text.starts_with("frame main"));
        assert!(text.contains("const Int(0)"));
        assert!(text.contains("0000: return"));
    }
}
