//! The tagged operand stack and its overflow area.
//!
//! Every entry is one 64-bit slot plus a [`ValueTypeDescriptor`]. Primitives
//! and structs of at most one slot live in the slot itself. Larger structs
//! live out of line and the slot holds their address: either storage in the
//! [`OverflowStack`] owned by this stack, or an alias pointing straight into a
//! local's or argument's overflow storage (pushed by `ldloc`/`ldarg` without
//! copying). Aliases are turned into owned copies by [`OperandStack::normalize`]
//! before anything that could overwrite the storage they point at.
use crate::{
    types::{ValueTypeDescriptor, SLOT_SIZE},
    utils::align_up,
    value::StackValue,
    vm::error::VerificationError,
};
use std::fmt::{Debug, Formatter};

/// Growable storage for out-of-line struct values, allocated and released in
/// stack order.
#[derive(Default)]
pub struct OverflowStack {
    data: Vec<u64>,
    /// Slots in use.
    top: usize,
}

impl OverflowStack {
    pub fn contains(&self, address: usize) -> bool {
        let base = self.data.as_ptr() as usize;
        address >= base && address < base + self.top * SLOT_SIZE
    }

    /// Whether `address` is anywhere in the buffer, including the released
    /// region above the top.
    fn in_buffer(&self, address: usize) -> bool {
        let base = self.base();
        address >= base && address < base + self.data.len() * SLOT_SIZE
    }

    /// Bytes currently allocated.
    pub fn height(&self) -> usize {
        self.top * SLOT_SIZE
    }

    fn base(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Whether `slots` more slots fit without moving the buffer.
    fn fits(&self, slots: usize) -> bool {
        self.top + slots <= self.data.len()
    }

    /// Moves the buffer to one with room for `slots` more; returns the
    /// old base address.
    fn grow(&mut self, slots: usize) -> usize {
        let old = self.base();
        let wanted = (self.top + slots).max(self.data.len() * 2).max(32);
        let mut data = vec![0u64; wanted];
        data[..self.top].copy_from_slice(&self.data[..self.top]);
        self.data = data;
        old
    }

    /// Contents of the new allocation are unspecified: the caller copies
    /// into it, possibly from the region just released by a pop.
    fn allocate(&mut self, slots: usize) -> *mut u8 {
        let at = self.top;
        self.top += slots;
        // SAFETY: `at` is within the buffer after `fits`/`grow`.
        unsafe { self.data.as_mut_ptr().add(at).cast() }
    }

    /// Releases the allocation at `address` and everything above it.
    fn release(&mut self, address: usize) {
        if self.contains(address) {
            self.top = (address - self.base()) / SLOT_SIZE;
        }
    }
}

pub struct OperandStack {
    values: Box<[u64]>,
    types: Box<[ValueTypeDescriptor]>,
    len: usize,
    overflow: OverflowStack,
    /// Set once an alias has been pushed; cleared by `normalize`.
    may_alias: bool,
}

impl Debug for OperandStack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries((0..self.len).map(|i| (self.types[i], self.values[i])))
            .finish()
    }
}

/// Copies a struct value held in a stack slot (or at the address it holds)
/// to `dest`.
///
/// # Safety
/// `dest` must be valid for `ty.size()` bytes, and for out-of-line structs
/// `bits` must be the address of a live value.
pub unsafe fn copy_struct_out(ty: ValueTypeDescriptor, bits: u64, dest: *mut u8) {
    let size = ty.size();
    if ty.is_overflow() {
        std::ptr::copy(bits as *const u8, dest, size);
    } else {
        let bytes = bits.to_le_bytes();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, size.min(SLOT_SIZE));
    }
}

/// Reads an inline struct out of memory into slot form.
///
/// # Safety
/// `src` must be valid for `ty.size()` bytes.
pub unsafe fn read_inline(ty: ValueTypeDescriptor, src: *const u8) -> u64 {
    let mut bytes = [0u8; SLOT_SIZE];
    std::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), ty.size().min(SLOT_SIZE));
    u64::from_le_bytes(bytes)
}

impl OperandStack {
    pub fn new(max_stack: usize) -> Self {
        Self {
            values: vec![0; max_stack].into_boxed_slice(),
            types: vec![ValueTypeDescriptor::VOID; max_stack].into_boxed_slice(),
            len: 0,
            overflow: OverflowStack::default(),
            may_alias: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn overflow_height(&self) -> usize {
        self.overflow.height()
    }

    pub fn in_overflow(&self, address: usize) -> bool {
        self.overflow.contains(address)
    }

    fn push_slot(&mut self, ty: ValueTypeDescriptor, bits: u64) -> Result<(), VerificationError> {
        if self.len == self.values.len() {
            return Err(VerificationError::StackOverflow(self.values.len()));
        }
        debug_assert!(ty.is_stack_normal(), "pushing non-normalized {:?}", ty);
        self.values[self.len] = bits;
        self.types[self.len] = ty;
        self.len += 1;
        Ok(())
    }

    pub fn push(&mut self, value: StackValue) -> Result<(), VerificationError> {
        self.push_slot(ValueTypeDescriptor::Primitive(value.kind()), value.to_slot())
    }

    /// Pushes a primitive or inline struct given in slot form.
    pub fn push_raw(&mut self, ty: ValueTypeDescriptor, bits: u64) -> Result<(), VerificationError> {
        debug_assert!(!ty.is_overflow());
        self.push_slot(ty.normalize(), bits)
    }

    /// Pushes a copy of the value of type `ty` stored at `src`. Primitives
    /// are normalized, inline structs are read into the slot, and larger
    /// structs are copied into fresh overflow storage.
    ///
    /// # Safety
    /// `src` must be valid for reads of `ty.size()` bytes. It may point into
    /// this stack's own overflow storage.
    pub unsafe fn push_value(
        &mut self,
        ty: ValueTypeDescriptor,
        src: *const u8,
    ) -> Result<(), VerificationError> {
        match ty {
            ValueTypeDescriptor::Primitive(kind) => self.push(StackValue::load(src, kind)),
            ValueTypeDescriptor::InlineStruct { .. } => self.push_raw(ty, read_inline(ty, src)),
            ValueTypeDescriptor::OverflowStruct { .. } => {
                if self.len == self.values.len() {
                    return Err(VerificationError::StackOverflow(self.values.len()));
                }
                let slots = align_up(ty.size(), SLOT_SIZE) / SLOT_SIZE;
                let mut src = src as usize;
                if !self.overflow.fits(slots) {
                    let own = self.overflow.in_buffer(src);
                    let old = self.overflow.grow(slots);
                    self.rebase(old);
                    if own {
                        src = src - old + self.overflow.base();
                    }
                }
                let dest = self.overflow.allocate(slots);
                std::ptr::copy(src as *const u8, dest, ty.size());
                self.push_slot(ty, dest as u64)
            }
        }
    }

    /// Pushes an out-of-line struct without copying it. `address` must not be
    /// inside this stack's overflow storage.
    pub fn push_alias(&mut self, ty: ValueTypeDescriptor, address: *mut u8) -> Result<(), VerificationError> {
        debug_assert!(ty.is_overflow());
        debug_assert!(!self.overflow.contains(address as usize));
        self.may_alias = true;
        self.push_slot(ty, address as u64)
    }

    /// Pops the top entry. Overflow storage it owned is released but stays
    /// readable until the next push.
    pub fn pop(&mut self) -> Result<(ValueTypeDescriptor, u64), VerificationError> {
        if self.len == 0 {
            return Err(VerificationError::StackUnderflow);
        }
        self.len -= 1;
        let (ty, bits) = (self.types[self.len], self.values[self.len]);
        if ty.is_overflow() {
            self.overflow.release(bits as usize);
        }
        Ok((ty, bits))
    }

    pub fn pop_value(&mut self) -> Result<StackValue, VerificationError> {
        match self.pop()? {
            (ValueTypeDescriptor::Primitive(kind), bits) => Ok(StackValue::from_slot(kind, bits)),
            (actual, _) => Err(VerificationError::UnexpectedOperand {
                instruction: "pop",
                actual,
            }),
        }
    }

    /// Entry `depth` positions below the top (0 is the top).
    pub fn peek(&self, depth: usize) -> Result<(ValueTypeDescriptor, u64), VerificationError> {
        if depth >= self.len {
            return Err(VerificationError::StackUnderflow);
        }
        let i = self.len - 1 - depth;
        Ok((self.types[i], self.values[i]))
    }

    pub fn dup(&mut self) -> Result<(), VerificationError> {
        let (ty, bits) = self.peek(0)?;
        if ty.is_overflow() {
            // SAFETY: the top entry's address is live.
            unsafe { self.push_value(ty, bits as *const u8) }
        } else {
            self.push_slot(ty, bits)
        }
    }

    /// Empties the stack, releasing all overflow storage.
    pub fn clear(&mut self) {
        self.len = 0;
        self.overflow.top = 0;
        self.may_alias = false;
    }

    /// Replaces every alias with an owned copy, rebuilding the overflow
    /// storage in stack order.
    pub fn normalize(&mut self) {
        if !self.may_alias {
            return;
        }
        self.may_alias = false;
        let needed: usize = (0..self.len)
            .filter(|&i| self.types[i].is_overflow())
            .map(|i| align_up(self.types[i].size(), SLOT_SIZE) / SLOT_SIZE)
            .sum();
        let mut rebuilt = OverflowStack {
            data: vec![0u64; needed.max(self.overflow.data.len())],
            top: 0,
        };
        for i in 0..self.len {
            let ty = self.types[i];
            if !ty.is_overflow() {
                continue;
            }
            let slots = align_up(ty.size(), SLOT_SIZE) / SLOT_SIZE;
            let dest = rebuilt.allocate(slots);
            // SAFETY: every overflow entry points at a live value of its size,
            // and `rebuilt` is a separate buffer.
            unsafe { std::ptr::copy_nonoverlapping(self.values[i] as *const u8, dest, ty.size()) };
            self.values[i] = dest as u64;
        }
        self.overflow = rebuilt;
    }

    /// Adjusts entries that pointed into the overflow buffer at `old_base`.
    fn rebase(&mut self, old_base: usize) {
        let new_base = self.overflow.base();
        let end = old_base + self.overflow.top * SLOT_SIZE;
        for i in 0..self.len {
            if !self.types[i].is_overflow() {
                continue;
            }
            let address = self.values[i] as usize;
            if address >= old_base && address < end {
                self.values[i] = (address - old_base + new_base) as u64;
            }
        }
    }

    /// Live entries, bottom first, with the address of each slot.
    pub fn entries(&mut self) -> impl Iterator<Item = (ValueTypeDescriptor, *mut u64)> + '_ {
        let types = &self.types[..self.len];
        let values = self.values.as_mut_ptr();
        types
            .iter()
            .enumerate()
            // SAFETY: `i < len <= values.len()`.
            .map(move |(i, ty)| (*ty, unsafe { values.add(i) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeHandle;

    const LARGE: ValueTypeDescriptor = ValueTypeDescriptor::OverflowStruct {
        handle: TypeHandle(1),
        size: 24,
    };

    #[test]
    fn primitives_round_trip_with_their_tags() {
        let mut stack = OperandStack::new(4);
        stack.push(StackValue::Int32(-1)).unwrap();
        stack.push(StackValue::Double(2.5)).unwrap();
        assert_eq!(stack.pop_value().unwrap(), StackValue::Double(2.5));
        assert_eq!(stack.pop_value().unwrap(), StackValue::Int32(-1));
        assert_eq!(stack.pop(), Err(VerificationError::StackUnderflow));
    }

    #[test]
    fn max_stack_is_enforced() {
        let mut stack = OperandStack::new(1);
        stack.push(StackValue::Int32(1)).unwrap();
        assert_eq!(
            stack.push(StackValue::Int32(2)),
            Err(VerificationError::StackOverflow(1))
        );
    }

    #[test]
    fn large_push_pop_restores_overflow_height() {
        let mut stack = OperandStack::new(4);
        let value = [1u64, 2, 3];
        unsafe { stack.push_value(LARGE, value.as_ptr().cast()).unwrap() };
        let before = stack.overflow_height();
        unsafe { stack.push_value(LARGE, value.as_ptr().cast()).unwrap() };
        stack.pop().unwrap();
        assert_eq!(stack.overflow_height(), before);
        stack.pop().unwrap();
        assert_eq!(stack.overflow_height(), 0);
    }

    #[test]
    fn growth_rebases_existing_entries() {
        let mut stack = OperandStack::new(16);
        let value = [7u64, 8, 9];
        for _ in 0..12 {
            unsafe { stack.push_value(LARGE, value.as_ptr().cast()).unwrap() };
        }
        for _ in 0..12 {
            let (_, bits) = stack.pop().unwrap();
            let copy = unsafe { std::slice::from_raw_parts(bits as *const u64, 3) };
            assert_eq!(copy, &value);
        }
    }

    #[test]
    fn normalize_detaches_aliases() {
        let mut stack = OperandStack::new(4);
        let mut local = [1u64, 2, 3];
        stack.push_alias(LARGE, local.as_mut_ptr().cast()).unwrap();
        stack.normalize();
        local[0] = 99;
        let (_, bits) = stack.peek(0).unwrap();
        assert!(stack.in_overflow(bits as usize));
        assert_eq!(unsafe { *(bits as *const u64) }, 1);
    }
}
