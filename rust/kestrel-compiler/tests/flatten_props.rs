//! Property tests for scope flattening.

use kestrel_compiler::codegen::{GenInstruction, GenOperand, GenReg, ScopeCode};
use kestrel_core::{OpCode, Operand, Storage, Symbol, SymbolKind, TypeId};
use proptest::prelude::*;
use proptest::sample::Index;

fn block(size: usize, prefix: &str) -> ScopeCode {
    ScopeCode {
        symbols: (0..size)
            .map(|i| {
                Symbol::new(
                    format!("{}{}", prefix, i),
                    TypeId::INT,
                    Storage::Inplace,
                    SymbolKind::Mutable,
                )
            })
            .collect(),
        instructions: Vec::new(),
    }
}

fn touch(reg: GenReg) -> GenInstruction {
    GenInstruction::new(OpCode::CopyRegInplace, GenOperand::Reg(reg), GenOperand::Unused, GenOperand::Unused)
}

proptest! {
    #[test]
    fn nested_locals_land_on_fixed_slots(
        root_size in 1usize..6,
        siblings in prop::collection::vec(1usize..5, 0..4),
        chain in prop::collection::vec(1usize..5, 1..5),
        picks in prop::collection::vec(any::<Index>(), 6),
    ) {
        let mut root = block(root_size, "r");
        for (n, size) in siblings.iter().enumerate() {
            let mut sibling = block(*size, &format!("s{}_", n));
            sibling.instructions.push(touch(GenReg::local(0)));
            sibling.instructions.push(touch(GenReg { parent_steps: 1, index: 0 }));
            root.flatten(sibling);
        }

        // Level 0 is the root, level L is `chain[L - 1]` deep.
        let depth = chain.len();
        let sizes: Vec<usize> = std::iter::once(root_size).chain(chain.iter().copied()).collect();
        let targets: Vec<usize> = (0..=depth).map(|level| picks[level].index(sizes[level])).collect();

        let mut levels: Vec<ScopeCode> = chain
            .iter()
            .enumerate()
            .map(|(i, size)| block(*size, &format!("l{}_", i + 1)))
            .collect();
        if let Some(innermost) = levels.last_mut() {
            for (level, index) in targets.iter().enumerate() {
                innermost.instructions.push(touch(GenReg {
                    parent_steps: (depth - level) as u32,
                    index: *index as u32,
                }));
            }
        }
        while levels.len() > 1 {
            let child = levels.pop().unwrap();
            levels.last_mut().unwrap().flatten(child);
        }
        let before_chain = root.symbols.len();
        root.flatten(levels.pop().unwrap());

        let frame = root.finalize("prop", 0).unwrap();
        let checked = &frame.instructions[frame.instructions.len() - targets.len()..];
        for (level, index) in targets.iter().enumerate() {
            let base = if level == 0 {
                0
            } else {
                before_chain + chain[..level - 1].iter().sum::<usize>()
            };
            prop_assert_eq!(checked[level].a, Operand::Reg((base + index) as u16));
        }
        prop_assert!(frame.validate(0).is_ok());
    }
}
