//! Operand decoder.
//!
//! Turns the bytes after a mode byte into resolved [`Operand`]s, driven by
//! the shapes of the selected [`Form`]. Decoding never fails: register
//! indices are masked, addresses wrap, and whatever a consuming unit finds
//! objectionable is its own business.

use std::fmt;
use std::ops::Deref;

use crate::cpu::isa::{Addr, Form, Shape, Width};
use crate::cpu::memory::{Memory, ADDRESS_MASK};
use crate::cpu::registers::Registers;

/// Mask for an integer register index byte.
pub const REGISTER_MASK: u8 = 0x1F;

/// Mask for a float register index byte.
pub const FLOAT_REGISTER_MASK: u8 = 0x0F;

/// Largest operand count of any form.
pub const MAX_OPERANDS: usize = 4;

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Reg { index: u8, width: Width },
    Imm { value: u32, width: Width },
    Mem { address: u32, width: Width },
    FReg(u8),
    FImm(f32),
    /// Address of a 4-byte float in memory.
    FMem(u32),
}

impl Operand {
    pub fn is_float(&self) -> bool {
        matches!(self, Operand::FReg(_) | Operand::FImm(_) | Operand::FMem(_))
    }

    /// Width of the value the operand names. Floats are 32 bits.
    pub fn width(&self) -> Width {
        match *self {
            Operand::Reg { width, .. } | Operand::Imm { width, .. } | Operand::Mem { width, .. } => {
                width
            }
            Operand::FReg(_) | Operand::FImm(_) | Operand::FMem(_) => Width::W32,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Reg { index, width } => f.write_str(&Registers::name(index, width)),
            Operand::Imm { value, .. } => write!(f, "#{value:#X}"),
            Operand::Mem { address, width } => write!(f, "({address:#08X}):{width}"),
            Operand::FReg(index) => write!(f, "F{index}"),
            Operand::FImm(value) => write!(f, "#{value}"),
            Operand::FMem(address) => write!(f, "({address:#08X}):f"),
        }
    }
}

/// The decoded operands of one instruction, in form order.
#[derive(Clone, Copy, PartialEq)]
pub struct Operands {
    items: [Operand; MAX_OPERANDS],
    len: usize,
}

impl Operands {
    fn new() -> Self {
        Self {
            items: [Operand::Imm { value: 0, width: Width::W8 }; MAX_OPERANDS],
            len: 0,
        }
    }

    fn push(&mut self, operand: Operand) {
        debug_assert!(self.len < MAX_OPERANDS);
        self.items[self.len] = operand;
        self.len += 1;
    }
}

impl Default for Operands {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Operands {
    type Target = [Operand];

    fn deref(&self) -> &[Operand] {
        &self.items[..self.len]
    }
}

impl fmt::Debug for Operands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl fmt::Display for Operands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, operand) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{operand}")?;
        }
        Ok(())
    }
}

/// Sequential reader over the instruction stream.
///
/// Holds its own copy of IPO; the caller stores [`Stream::position`] back
/// once the instruction is fully consumed.
pub struct Stream<'a> {
    mem: &'a Memory,
    ipo: u32,
}

impl<'a> Stream<'a> {
    pub fn new(mem: &'a Memory, ipo: u32) -> Self {
        Self {
            mem,
            ipo: ipo & ADDRESS_MASK,
        }
    }

    /// Address of the next unread byte.
    pub fn position(&self) -> u32 {
        self.ipo
    }

    fn fetch_bytes(&mut self, width: Width) -> u32 {
        let value = self.mem.get(width, self.ipo);
        self.ipo = self.ipo.wrapping_add(width.bytes()) & ADDRESS_MASK;
        value
    }

    pub fn fetch_u8(&mut self) -> u8 {
        self.fetch_bytes(Width::W8) as u8
    }

    pub fn fetch_u16(&mut self) -> u16 {
        self.fetch_bytes(Width::W16) as u16
    }

    pub fn fetch_u24(&mut self) -> u32 {
        self.fetch_bytes(Width::W24)
    }

    pub fn fetch_u32(&mut self) -> u32 {
        self.fetch_bytes(Width::W32)
    }

    /// Fetch a big-endian immediate of the given width.
    pub fn fetch(&mut self, width: Width) -> u32 {
        self.fetch_bytes(width)
    }

    pub fn fetch_f32(&mut self) -> f32 {
        f32::from_bits(self.fetch_u32())
    }
}

/// Split a mode byte and its continuation byte into the two register
/// indices of a packed pair. Only the low two bits of `mode` take part.
#[inline]
pub fn unpack_registers(mode: u8, next: u8) -> (u8, u8) {
    let first = ((mode << 3) & REGISTER_MASK) | (next >> 5);
    let second = next & REGISTER_MASK;
    (first, second)
}

/// Decode every operand of `form`.
///
/// `mode` is the already-fetched mode byte; `stream` is positioned right
/// after it.
pub fn decode_operands(form: &Form, mode: u8, stream: &mut Stream<'_>, regs: &Registers) -> Operands {
    let mut operands = Operands::new();
    let mut shapes = form.shapes.iter();

    if form.packed {
        let (first, second) = unpack_registers(mode, stream.fetch_u8());
        for (shape, index) in shapes.by_ref().take(2).zip([first, second]) {
            operands.push(register(*shape, index));
        }
    }

    for shape in shapes {
        operands.push(decode_operand(*shape, stream, regs));
    }
    operands
}

fn register(shape: Shape, index: u8) -> Operand {
    match shape {
        Shape::FReg => Operand::FReg(index & FLOAT_REGISTER_MASK),
        Shape::Reg(width) => Operand::Reg {
            index: index & REGISTER_MASK,
            width,
        },
        // Form::new only packs register shapes
        other => unreachable!("packed operand of shape {other}"),
    }
}

/// Decode one operand of the given shape from the stream.
pub fn decode_operand(shape: Shape, stream: &mut Stream<'_>, regs: &Registers) -> Operand {
    match shape {
        Shape::Reg(width) => Operand::Reg {
            index: stream.fetch_u8() & REGISTER_MASK,
            width,
        },
        Shape::Imm(width) => Operand::Imm {
            value: stream.fetch(width),
            width,
        },
        Shape::Mem(width, addr) => Operand::Mem {
            address: resolve_address(addr, stream, regs),
            width,
        },
        Shape::FReg => Operand::FReg(stream.fetch_u8() & FLOAT_REGISTER_MASK),
        Shape::FImm => Operand::FImm(stream.fetch_f32()),
        Shape::FMem(addr) => Operand::FMem(resolve_address(addr, stream, regs)),
    }
}

/// Base address plus optional sign-extended register displacement, mod 2^24.
fn resolve_address(addr: Addr, stream: &mut Stream<'_>, regs: &Registers) -> u32 {
    let (base, disp) = match addr {
        Addr::Abs(disp) => (stream.fetch_u24(), disp),
        Addr::Ind(disp) => {
            let index = stream.fetch_u8() & REGISTER_MASK;
            (regs.get(index, Width::W24), disp)
        }
    };

    match disp.width() {
        Some(width) => {
            let index = stream.fetch_u8() & REGISTER_MASK;
            let offset = width.sign_extend(regs.get(index, width));
            base.wrapping_add(offset as u32) & ADDRESS_MASK
        }
        None => base,
    }
}
