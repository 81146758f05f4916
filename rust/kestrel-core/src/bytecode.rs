//! Bytecode instruction set.
//! Fixed-width instructions: an opcode plus three explicit operand fields.

use serde::Serialize;
use std::fmt;
use strum::{EnumCount, EnumIter, IntoStaticStr};

/// Opcodes for the Kestrel register VM.
///
/// Operand conventions are listed per opcode. `Reg` operands are relative to
/// the active frame base, `Global` operands index the global frame, and
/// `Imm` operands carry counts, offsets and ids. Branch offsets are the net
/// displacement of the program counter (an offset of 1 falls through).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EnumIter, EnumCount, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,

    // Register and global moves
    LoadGlobalExt = 1,      // a: Reg dest, b: Global src
    LoadGlobalInplace = 2,  // a: Reg dest, b: Global src
    StoreGlobalExt = 3,     // a: Global dest, b: Reg src
    StoreGlobalInplace = 4, // a: Global dest, b: Reg src
    CopyRegExt = 5,         // a: Reg dest, b: Reg src
    CopyRegInplace = 6,     // a: Reg dest, b: Reg src
    LoadIntrinsic = 7,      // a: Reg dest, b: Imm intrinsic id

    // Aggregate access
    GetStructMember = 8,      // a: dest, b: struct, c: Imm member index
    LookupString = 9,         // a: dest, b: string, c: Reg index
    LookupJson = 10,          // a: dest, b: json, c: Reg key (string or int)
    LookupVectorExt = 11,     // a: dest, b: vector, c: Reg index
    LookupVectorInplace = 12, // a: dest, b: vector, c: Reg index
    LookupDictExt = 13,       // a: dest, b: dict, c: Reg key
    LookupDictInplace = 14,   // a: dest, b: dict, c: Reg key
    SizeString = 15,          // a: dest, b: string
    SizeVector = 16,          // a: dest, b: vector
    SizeDict = 17,            // a: dest, b: dict
    SizeJson = 18,            // a: dest, b: json
    PushBackString = 19,        // a: dest, b: string, c: Reg char code
    PushBackVectorExt = 20,     // a: dest, b: vector, c: Reg element
    PushBackVectorInplace = 21, // a: dest, b: vector, c: Reg element

    // Construction from values already pushed on the stack
    NewVectorExt = 22,     // a: dest, b: Imm vector type, c: Imm element count
    NewVectorInplace = 23, // a: dest, b: Imm vector type, c: Imm element count
    NewDictExt = 24,       // a: dest, b: Imm dict type, c: Imm entry count (key, value slots)
    NewDictInplace = 25,   // a: dest, b: Imm dict type, c: Imm entry count
    NewStruct = 26,        // a: dest, b: Imm struct type, c: Imm member count

    // Stack discipline
    PushFramePtr = 27, // push caller frame link (two slots)
    PopFramePtr = 28,  // pop caller frame link and restore it
    PushInplace = 29,  // a: Reg
    PushExt = 30,      // a: Reg
    Popn = 31,         // a: Imm slot count (<= 32), b: Imm external-slot bitmask

    // Arithmetic
    AddInt = 32, // a: dest, b: lhs, c: rhs
    SubInt = 33,
    MulInt = 34,
    DivInt = 35,
    RemInt = 36,
    AddDouble = 37,
    SubDouble = 38,
    MulDouble = 39,
    DivDouble = 40,
    ConcatStrings = 41,
    ConcatVectorsExt = 42,
    ConcatVectorsInplace = 43,

    // Comparison, result is a bool in a. Generic forms use the declared
    // type of operand b from the active frame's symbol table.
    CompareSmaller = 44,
    CompareSmallerOrEqual = 45,
    CompareEqual = 46,
    CompareNotEqual = 47,
    CompareSmallerInt = 48,
    CompareSmallerOrEqualInt = 49,
    CompareEqualInt = 50,
    CompareNotEqualInt = 51,

    // Control flow
    Branch = 52,                  // a: Imm offset
    BranchFalseBool = 53,         // a: Reg cond, b: Imm offset
    BranchTrueBool = 54,          // a: Reg cond, b: Imm offset
    BranchSmallerInt = 55,        // a: lhs, b: rhs, c: Imm offset; taken if lhs < rhs
    BranchSmallerOrEqualInt = 56, // a: lhs, b: rhs, c: Imm offset; taken if lhs <= rhs

    // Calls
    Call = 57,   // a: Reg dest, b: Reg callee, c: Imm argument count
    Return = 58, // a: Reg value
}

impl OpCode {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Branch
                | OpCode::BranchFalseBool
                | OpCode::BranchTrueBool
                | OpCode::BranchSmallerInt
                | OpCode::BranchSmallerOrEqualInt
        )
    }
}

/// One operand field of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Operand {
    #[default]
    Unused,
    /// Slot relative to the active frame base.
    Reg(u16),
    /// Immediate value.
    Imm(i32),
    /// Slot in the global frame.
    Global(u16),
}

impl Operand {
    pub fn reg(self) -> Option<usize> {
        match self {
            Operand::Reg(r) => Some(r as usize),
            _ => None,
        }
    }

    pub fn imm(self) -> Option<i32> {
        match self {
            Operand::Imm(v) => Some(v),
            _ => None,
        }
    }

    pub fn global(self) -> Option<usize> {
        match self {
            Operand::Global(g) => Some(g as usize),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Unused => write!(f, "_"),
            Operand::Reg(r) => write!(f, "r{}", r),
            Operand::Imm(v) => write!(f, "#{}", v),
            Operand::Global(g) => write!(f, "g{}", g),
        }
    }
}

/// A single bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub op: OpCode,
    pub a: Operand,
    pub b: Operand,
    pub c: Operand,
}

impl Instruction {
    pub fn abc(op: OpCode, a: Operand, b: Operand, c: Operand) -> Self {
        Self { op, a, b, c }
    }

    pub fn ab(op: OpCode, a: Operand, b: Operand) -> Self {
        Self::abc(op, a, b, Operand::Unused)
    }

    pub fn a(op: OpCode, a: Operand) -> Self {
        Self::abc(op, a, Operand::Unused, Operand::Unused)
    }

    pub fn bare(op: OpCode) -> Self {
        Self::abc(op, Operand::Unused, Operand::Unused, Operand::Unused)
    }

    pub fn operands(&self) -> [Operand; 3] {
        [self.a, self.b, self.c]
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<28}", self.op.name())?;
        let used: Vec<String> = self
            .operands()
            .iter()
            .filter(|o| **o != Operand::Unused)
            .map(|o| o.to_string())
            .collect();
        write!(f, "{}", used.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_names_are_snake_case() {
        assert_eq!(OpCode::LoadGlobalExt.name(), "load_global_ext");
        assert_eq!(OpCode::BranchSmallerOrEqualInt.name(), "branch_smaller_or_equal_int");
    }

    #[test]
    fn opcode_discriminants_are_dense() {
        for (i, op) in OpCode::iter().enumerate() {
            assert_eq!(op as usize, i, "opcode {:?} out of order", op);
        }
        assert_eq!(OpCode::iter().count(), OpCode::COUNT);
    }

    #[test]
    fn instruction_display() {
        let instr = Instruction::abc(
            OpCode::AddInt,
            Operand::Reg(2),
            Operand::Reg(0),
            Operand::Reg(1),
        );
        assert_eq!(instr.to_string().trim_end(), format!("{:<28}r2, r0, r1", "add_int"));
        let call = Instruction::abc(OpCode::Call, Operand::Reg(3), Operand::Reg(4), Operand::Imm(2));
        assert!(call.to_string().ends_with("r3, r4, #2"));
    }

    #[test]
    fn branch_classification() {
        assert!(OpCode::BranchFalseBool.is_branch());
        assert!(!OpCode::Call.is_branch());
    }
}
