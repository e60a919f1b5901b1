//! The register stack.
//!
//! A bounded byte region, separate from main memory, addressed by SPR.
//! `0 <= SPR <= capacity` always holds: an operation that would break the
//! bound fails with a [`StackFault`] before touching anything.

use std::fmt;

use thiserror::Error;

use crate::cpu::fault::error_id;
use crate::cpu::isa::Width;
use crate::cpu::registers::{FloatRegisters, Registers, FLOAT_REGISTER_COUNT, REGISTER_COUNT};

/// Default stack region size in bytes.
pub const DEFAULT_STACK_CAPACITY: u32 = 0x1_0000;

/// Why a stack operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackFault {
    #[error("stack overflow")]
    Overflow,

    #[error("stack underflow")]
    Underflow,
}

impl StackFault {
    /// The code recorded in HMEM by the fault protocol.
    pub fn error_id(self) -> u8 {
        match self {
            StackFault::Overflow => error_id::STACK_OVERFLOW,
            StackFault::Underflow => error_id::STACK_UNDERFLOW,
        }
    }
}

/// Number of registers in the wrapping range `start..=end` of a file with
/// `count` registers.
pub fn range_len(start: u8, end: u8, count: usize) -> u32 {
    let count = count as u32;
    let start = start as u32 % count;
    let end = end as u32 % count;
    (end + count - start) % count + 1
}

#[derive(Clone)]
pub struct Stack {
    bytes: Vec<u8>,
    spr: u32,
}

impl Stack {
    pub fn new(capacity: u32) -> Self {
        Self {
            bytes: vec![0; capacity as usize],
            spr: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Current stack pointer (bytes in use).
    pub fn spr(&self) -> u32 {
        self.spr
    }

    /// Empty the stack.
    pub fn reset(&mut self) {
        self.spr = 0;
    }

    fn reserve(&self, bytes: u32) -> Result<(), StackFault> {
        if self.spr as u64 + bytes as u64 > self.capacity() as u64 {
            return Err(StackFault::Overflow);
        }
        Ok(())
    }

    fn available(&self, bytes: u32) -> Result<(), StackFault> {
        if self.spr < bytes {
            return Err(StackFault::Underflow);
        }
        Ok(())
    }

    // Callers check bounds first.
    fn write(&mut self, width: Width, value: u32) {
        let n = width.bytes();
        for offset in 0..n {
            let shift = 8 * (n - 1 - offset);
            self.bytes[(self.spr + offset) as usize] = (value >> shift) as u8;
        }
        self.spr += n;
    }

    fn read(&mut self, width: Width) -> u32 {
        self.spr -= width.bytes();
        let start = self.spr as usize;
        self.bytes[start..start + width.bytes() as usize]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32)
    }

    pub fn push(&mut self, width: Width, value: u32) -> Result<(), StackFault> {
        self.reserve(width.bytes())?;
        self.write(width, value);
        Ok(())
    }

    pub fn pop(&mut self, width: Width) -> Result<u32, StackFault> {
        self.available(width.bytes())?;
        Ok(self.read(width))
    }

    pub fn push_float(&mut self, value: f32) -> Result<(), StackFault> {
        self.push(Width::W32, value.to_bits())
    }

    pub fn pop_float(&mut self) -> Result<f32, StackFault> {
        self.pop(Width::W32).map(f32::from_bits)
    }

    /// Push the 8-bit registers `start..=end` (wrapping), ascending.
    pub fn push_range(&mut self, regs: &Registers, start: u8, end: u8) -> Result<(), StackFault> {
        let count = range_len(start, end, REGISTER_COUNT);
        self.reserve(count)?;
        for i in 0..count {
            let index = ((start as u32 + i) % REGISTER_COUNT as u32) as u8;
            self.write(Width::W8, regs.get(index, Width::W8));
        }
        Ok(())
    }

    /// Pop into the 8-bit registers `end..=start` (wrapping), descending.
    pub fn pop_range(&mut self, regs: &mut Registers, start: u8, end: u8) -> Result<(), StackFault> {
        let count = range_len(start, end, REGISTER_COUNT);
        self.available(count)?;
        for i in 0..count {
            let index = ((end as u32 + REGISTER_COUNT as u32 - i) % REGISTER_COUNT as u32) as u8;
            let value = self.read(Width::W8);
            regs.set(index, Width::W8, value);
        }
        Ok(())
    }

    pub fn push_float_range(
        &mut self,
        fregs: &FloatRegisters,
        start: u8,
        end: u8,
    ) -> Result<(), StackFault> {
        let count = range_len(start, end, FLOAT_REGISTER_COUNT);
        self.reserve(count * 4)?;
        for i in 0..count {
            let index = ((start as u32 + i) % FLOAT_REGISTER_COUNT as u32) as u8;
            self.write(Width::W32, fregs.get(index).to_bits());
        }
        Ok(())
    }

    pub fn pop_float_range(
        &mut self,
        fregs: &mut FloatRegisters,
        start: u8,
        end: u8,
    ) -> Result<(), StackFault> {
        let count = range_len(start, end, FLOAT_REGISTER_COUNT);
        self.available(count * 4)?;
        for i in 0..count {
            let index =
                ((end as u32 + FLOAT_REGISTER_COUNT as u32 - i) % FLOAT_REGISTER_COUNT as u32) as u8;
            let bits = self.read(Width::W32);
            fregs.set(index, f32::from_bits(bits));
        }
        Ok(())
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("spr", &self.spr)
            .field("capacity", &self.capacity())
            .finish()
    }
}
