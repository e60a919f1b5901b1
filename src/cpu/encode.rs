//! Instruction encoder.
//!
//! Builds guest machine code from `(opcode, op, operands)` triples by
//! looking the form up in the instruction set, so the encoder and the
//! decoder can never disagree on layout.

use thiserror::Error;

use crate::cpu::decode::REGISTER_MASK;
use crate::cpu::isa::{Addr, Disp, FamilyBody, Form, InstructionSet, Op, Shape, Width};

/// An operand as written by a program author.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Reg(Width, u8),
    Imm(Width, u32),
    /// `(address)`
    Abs(Width, u32),
    /// `(address + disp register)`
    AbsIdx(Width, u32, Disp, u8),
    /// `(base register)`
    Ind(Width, u8),
    /// `(base register + disp register)`
    IndIdx(Width, u8, Disp, u8),
    FReg(u8),
    FImm(f32),
    FAbs(u32),
    FInd(u8),
}

impl Arg {
    pub fn shape(&self) -> Shape {
        match *self {
            Arg::Reg(w, _) => Shape::Reg(w),
            Arg::Imm(w, _) => Shape::Imm(w),
            Arg::Abs(w, _) => Shape::Mem(w, Addr::Abs(Disp::None)),
            Arg::AbsIdx(w, _, d, _) => Shape::Mem(w, Addr::Abs(d)),
            Arg::Ind(w, _) => Shape::Mem(w, Addr::Ind(Disp::None)),
            Arg::IndIdx(w, _, d, _) => Shape::Mem(w, Addr::Ind(d)),
            Arg::FReg(_) => Shape::FReg,
            Arg::FImm(_) => Shape::FImm,
            Arg::FAbs(_) => Shape::FMem(Addr::Abs(Disp::None)),
            Arg::FInd(_) => Shape::FMem(Addr::Ind(Disp::None)),
        }
    }

    fn register_index(&self) -> u8 {
        match *self {
            Arg::Reg(_, index) | Arg::FReg(index) => index,
            _ => 0,
        }
    }
}

/// Errors raised while encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("no instruction family for opcode {0:#04X}")]
    UnknownOpcode(u8),

    #[error("{family} takes no mode byte")]
    Bare { family: &'static str },

    #[error("{family} has operands; use emit")]
    Moded { family: &'static str },

    #[error("{family} has no form `{form}`")]
    NoSuchForm { family: &'static str, form: String },
}

/// Split two register indices into the low mode bits and the
/// continuation byte of a packed pair.
#[inline]
pub fn pack_registers(first: u8, second: u8) -> (u8, u8) {
    let first = first & REGISTER_MASK;
    ((first >> 3) & 0b11, ((first & 0b111) << 5) | (second & REGISTER_MASK))
}

/// Accumulates encoded instructions.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    bytes: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte to be written.
    pub fn position(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// Append raw bytes (data, or deliberately broken code).
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Emit a single-byte instruction (NOP, RET, HALT).
    pub fn bare(&mut self, opcode: u8) -> Result<&mut Self, EncodeError> {
        let family = InstructionSet::get()
            .family(opcode)
            .ok_or(EncodeError::UnknownOpcode(opcode))?;
        match family.body {
            FamilyBody::Bare(_) => {
                self.bytes.push(opcode);
                Ok(self)
            }
            FamilyBody::Moded(_) => Err(EncodeError::Moded { family: family.name }),
        }
    }

    /// Emit a moded instruction running `op` over `args`.
    pub fn emit(&mut self, opcode: u8, op: Op, args: &[Arg]) -> Result<&mut Self, EncodeError> {
        let family = InstructionSet::get()
            .family(opcode)
            .ok_or(EncodeError::UnknownOpcode(opcode))?;
        if let FamilyBody::Bare(_) = family.body {
            return Err(EncodeError::Bare { family: family.name });
        }

        let shapes: Vec<Shape> = args.iter().map(Arg::shape).collect();
        let index = family
            .position(op, &shapes)
            .ok_or_else(|| EncodeError::NoSuchForm {
                family: family.name,
                form: Form::new(op, shapes.clone()).to_string(),
            })?;
        let packed = family.form(index).map_or(false, |form| form.packed);

        self.bytes.push(opcode);
        let rest = if packed {
            let (low_bits, next) = pack_registers(args[0].register_index(), args[1].register_index());
            self.bytes.push((index << 2) | low_bits);
            self.bytes.push(next);
            &args[2..]
        } else {
            self.bytes.push(index << 2);
            args
        };

        for arg in rest {
            self.operand(arg);
        }
        Ok(self)
    }

    fn value(&mut self, width: Width, value: u32) {
        let n = width.bytes();
        for i in 0..n {
            self.bytes.push((value >> (8 * (n - 1 - i))) as u8);
        }
    }

    fn displacement(&mut self, disp: Disp, index: u8) {
        if disp.width().is_some() {
            self.bytes.push(index);
        }
    }

    fn operand(&mut self, arg: &Arg) {
        match *arg {
            Arg::Reg(_, index) | Arg::FReg(index) | Arg::Ind(_, index) | Arg::FInd(index) => {
                self.bytes.push(index)
            }
            Arg::Imm(width, value) => self.value(width, value),
            Arg::Abs(_, address) | Arg::FAbs(address) => self.value(Width::W24, address),
            Arg::AbsIdx(_, address, disp, index) => {
                self.value(Width::W24, address);
                self.displacement(disp, index);
            }
            Arg::IndIdx(_, base, disp, index) => {
                self.bytes.push(base);
                self.displacement(disp, index);
            }
            Arg::FImm(value) => self.value(Width::W32, value.to_bits()),
        }
    }
}
