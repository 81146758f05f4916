//! The register stack.
//!
//! One growable array of slots shared by every frame of an interpreter. The
//! global frame sits at offset 0. A call pushes a two-slot frame link
//! (caller base, caller frame id), then the callee's arguments, then the
//! callee opens its remaining locals on top. Links are plain indices, never
//! pointers into the array, so growing the stack cannot invalidate them.
//!
//! Writing a slot follows bump, store, release: the incoming value is an
//! owned clone (the bump), it replaces the old content, and the old content
//! is dropped last (the release). Copying a register onto itself therefore
//! never frees the value in between.

use crate::error::VmError;
use kestrel_core::{FrameId, StaticFrame, SymbolKind, TypeTable, Value};

#[derive(Debug, Clone)]
pub enum Slot {
    Value(Value),
    CallerBase(usize),
    CallerFrame(FrameId),
}

#[derive(Debug)]
pub struct RegisterStack {
    slots: Vec<Slot>,
    base: usize,
    frame: FrameId,
}

impl RegisterStack {
    pub fn new(reserve: usize) -> Self {
        Self {
            slots: Vec::with_capacity(reserve),
            base: 0,
            frame: FrameId::Global,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Base offset of the active frame.
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn set_active(&mut self, base: usize, frame: FrameId) {
        self.base = base;
        self.frame = frame;
    }

    // ------------------------------------------------------------------
    // Slot access
    // ------------------------------------------------------------------

    pub fn get_abs(&self, abs: usize) -> Result<&Value, VmError> {
        match self.slots.get(abs) {
            Some(Slot::Value(v)) => Ok(v),
            Some(_) => Err(VmError::Runtime(format!("slot {} holds a frame link", abs))),
            None => Err(VmError::RegisterOutOfBounds(abs)),
        }
    }

    /// Register relative to the active frame.
    pub fn get(&self, reg: usize) -> Result<&Value, VmError> {
        self.get_abs(self.base + reg)
    }

    pub fn global(&self, index: usize) -> Result<&Value, VmError> {
        self.get_abs(index)
    }

    pub fn write_abs(&mut self, abs: usize, value: Value) -> Result<(), VmError> {
        match self.slots.get_mut(abs) {
            Some(slot @ Slot::Value(_)) => {
                let old = std::mem::replace(slot, Slot::Value(value));
                drop(old);
                Ok(())
            }
            Some(_) => Err(VmError::Runtime(format!("slot {} holds a frame link", abs))),
            None => Err(VmError::RegisterOutOfBounds(abs)),
        }
    }

    pub fn write(&mut self, reg: usize, value: Value) -> Result<(), VmError> {
        self.write_abs(self.base + reg, value)
    }

    pub fn write_global(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        self.write_abs(index, value)
    }

    /// Copy `src` into `dest`, both relative to the active frame.
    pub fn copy(&mut self, dest: usize, src: usize) -> Result<(), VmError> {
        let v = self.get(src)?.clone();
        self.write(dest, v)
    }

    // ------------------------------------------------------------------
    // Push / pop
    // ------------------------------------------------------------------

    pub fn push(&mut self, value: Value) {
        self.slots.push(Slot::Value(value));
    }

    /// Push the link to the active frame.
    pub fn push_link(&mut self) {
        self.slots.push(Slot::CallerBase(self.base));
        self.slots.push(Slot::CallerFrame(self.frame));
    }

    /// Pop the topmost frame link and make it the active frame again.
    pub fn pop_link(&mut self) -> Result<(usize, FrameId), VmError> {
        let frame = match self.slots.pop() {
            Some(Slot::CallerFrame(f)) => f,
            other => return Err(Self::broken_link(other)),
        };
        let base = match self.slots.pop() {
            Some(Slot::CallerBase(b)) => b,
            other => return Err(Self::broken_link(other)),
        };
        self.set_active(base, frame);
        Ok((base, frame))
    }

    /// Read the frame link whose first slot is at `pos` without popping it.
    pub fn link_at(&self, pos: usize) -> Result<(usize, FrameId), VmError> {
        match (self.slots.get(pos), self.slots.get(pos + 1)) {
            (Some(Slot::CallerBase(base)), Some(Slot::CallerFrame(frame))) => Ok((*base, *frame)),
            _ => Err(VmError::Runtime(format!("no frame link at slot {}", pos))),
        }
    }

    fn broken_link(found: Option<Slot>) -> VmError {
        VmError::Runtime(format!("expected a frame link on the stack, found {:?}", found))
    }

    /// Pop `count` value slots. Bit `i` of `external_mask` is set when slot
    /// `len - count + i` was pushed as external; a slot flagged inplace must
    /// not hold a shared value.
    pub fn popn(&mut self, count: usize, external_mask: u32) -> Result<(), VmError> {
        let len = self.slots.len();
        if count > len {
            return Err(VmError::Runtime(format!(
                "cannot pop {} slots from a stack of {}",
                count, len
            )));
        }
        let start = len - count;
        for (i, slot) in self.slots[start..].iter().enumerate() {
            match slot {
                Slot::Value(v) if v.is_external() && external_mask & (1 << i) == 0 => {
                    return Err(VmError::Runtime(format!(
                        "slot {} popped as inplace holds a {} value",
                        start + i,
                        v.kind_name()
                    )));
                }
                Slot::Value(_) => {}
                other => return Err(Self::broken_link(Some(other.clone()))),
            }
        }
        self.slots.truncate(start);
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// The `count` topmost slots as values.
    pub fn top(&self, count: usize) -> Result<Vec<&Value>, VmError> {
        let len = self.slots.len();
        if count > len {
            return Err(VmError::RegisterOutOfBounds(count));
        }
        (len - count..len).map(|i| self.get_abs(i)).collect()
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Open `frame` whose `arg_count` arguments already sit on top of the
    /// stack: constants get their value, every other local its type's zero
    /// value. Returns the new frame base.
    pub fn open_frame_except_args(
        &mut self,
        frame: &StaticFrame,
        types: &TypeTable,
    ) -> Result<usize, VmError> {
        let len = self.slots.len();
        if frame.arg_count > len {
            return Err(VmError::Runtime(format!(
                "frame '{}' expects {} argument slots, stack has {}",
                frame.name, frame.arg_count, len
            )));
        }
        let base = len - frame.arg_count;
        self.slots.reserve(frame.local_count);
        for symbol in &frame.symbols[frame.arg_count..] {
            let value = match &symbol.kind {
                SymbolKind::Constant(c) => Value::from_constant(c),
                _ => Value::default_for(types, symbol.ty),
            };
            self.slots.push(Slot::Value(value));
        }
        Ok(base)
    }

    /// Drop the locals of the frame at `base`, keeping its arguments for the
    /// caller's `Popn`.
    pub fn close_frame(&mut self, base: usize, arg_count: usize) {
        self.slots.truncate(base + arg_count);
    }

    /// Clones of the first `count` slots, the global frame.
    pub fn snapshot(&self, count: usize) -> Result<Vec<Value>, VmError> {
        (0..count).map(|i| self.get_abs(i).cloned()).collect()
    }

    /// Number of frame links currently on the stack.
    #[cfg(test)]
    fn link_depth(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::CallerFrame(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{Constant, Instruction, OpCode, Storage, Symbol, TypeId, VectorValue};

    fn vector(items: &[i64]) -> Value {
        Value::vector(
            VectorValue::from_values(false, items.iter().map(|n| Value::Int(*n)).collect()).unwrap(),
        )
    }

    #[test]
    fn self_assignment_keeps_the_value_alive() {
        let mut stack = RegisterStack::new(4);
        stack.push(vector(&[1, 2]));
        let held = stack.get(0).unwrap().clone();
        assert_eq!(held.strong_count(), Some(2));
        stack.copy(0, 0).unwrap();
        assert_eq!(held.strong_count(), Some(2));
        assert_eq!(stack.get(0).unwrap(), &vector(&[1, 2]));
    }

    #[test]
    fn overwrite_releases_previous_value() {
        let mut stack = RegisterStack::new(4);
        stack.push(vector(&[1]));
        let old = stack.get(0).unwrap().clone();
        assert_eq!(old.strong_count(), Some(2));
        stack.write(0, Value::Int(3)).unwrap();
        assert_eq!(old.strong_count(), Some(1));
    }

    #[test]
    fn popn_releases_and_checks_mask() {
        let mut stack = RegisterStack::new(4);
        let v = vector(&[7]);
        stack.push(Value::TypeId(TypeId::ANY));
        stack.push(v.clone());
        assert_eq!(v.strong_count(), Some(2));
        stack.popn(2, 0b10).unwrap();
        assert_eq!(v.strong_count(), Some(1));
        assert!(stack.is_empty());

        stack.push(v.clone());
        assert!(stack.popn(1, 0).is_err());
    }

    #[test]
    fn links_restore_the_caller() {
        let mut stack = RegisterStack::new(8);
        stack.push(Value::Int(1));
        stack.set_active(0, FrameId::Global);
        stack.push_link();
        stack.set_active(3, FrameId::Function(2));
        assert_eq!(stack.link_depth(), 1);
        assert_eq!(stack.pop_link().unwrap(), (0, FrameId::Global));
        assert_eq!(stack.frame(), FrameId::Global);
        assert!(stack.pop_link().is_err());
    }

    #[test]
    fn open_frame_initialises_constants_and_locals() {
        let types = TypeTable::new();
        let frame = StaticFrame::new(
            "f",
            vec![Instruction::a(OpCode::Return, kestrel_core::Operand::Reg(1))],
            vec![
                Symbol::new("x", TypeId::INT, Storage::Inplace, SymbolKind::Parameter),
                Symbol::new("s", TypeId::STRING, Storage::External, SymbolKind::Mutable),
                Symbol::new(
                    "#k0",
                    TypeId::INT,
                    Storage::Inplace,
                    SymbolKind::Constant(Constant::Int(42)),
                ),
            ],
            1,
        );
        let mut stack = RegisterStack::new(8);
        stack.push(Value::Int(5));
        let base = stack.open_frame_except_args(&frame, &types).unwrap();
        assert_eq!(base, 0);
        stack.set_active(base, FrameId::Function(0));
        assert_eq!(stack.get(0).unwrap(), &Value::Int(5));
        assert_eq!(stack.get(1).unwrap(), &Value::string(""));
        assert_eq!(stack.get(2).unwrap(), &Value::Int(42));
        stack.close_frame(base, 1);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn out_of_bounds_register() {
        let stack = RegisterStack::new(0);
        assert_eq!(stack.get(3), Err(VmError::RegisterOutOfBounds(3)));
    }
}
