//! CPU registers.
//!
//! The machine has:
//! - 26 byte-wide integer slots (A..Z) that combine into 16/24/32-bit groups
//! - 16 single-precision float registers (F0..F15)
//! - an 8-bit flag register

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cpu::isa::Width;

/// Number of 8-bit integer register slots.
pub const REGISTER_COUNT: usize = 26;

/// Number of float registers.
pub const FLOAT_REGISTER_COUNT: usize = 16;

/// Slot indices by name.
pub mod reg {
    pub const A: u8 = 0;
    pub const B: u8 = 1;
    pub const C: u8 = 2;
    pub const D: u8 = 3;
    pub const E: u8 = 4;
    pub const F: u8 = 5;
    pub const G: u8 = 6;
    pub const H: u8 = 7;
    pub const I: u8 = 8;
    pub const J: u8 = 9;
    pub const K: u8 = 10;
    pub const L: u8 = 11;
    pub const M: u8 = 12;
    pub const N: u8 = 13;
    pub const O: u8 = 14;
    pub const P: u8 = 15;
    pub const Q: u8 = 16;
    pub const R: u8 = 17;
    pub const S: u8 = 18;
    pub const T: u8 = 19;
    pub const U: u8 = 20;
    pub const V: u8 = 21;
    pub const W: u8 = 22;
    pub const X: u8 = 23;
    pub const Y: u8 = 24;
    pub const Z: u8 = 25;
}

/// The integer register file.
///
/// A `W`-bit register starting at slot `i` is the big-endian group
/// `i, i+1, ...` with slot indices wrapping modulo 26, so `YZA` is a
/// valid 24-bit register.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    slots: [u8; REGISTER_COUNT],
}

impl Registers {
    /// Create a register file with every slot zeroed.
    pub fn new() -> Self {
        Self {
            slots: [0; REGISTER_COUNT],
        }
    }

    pub fn reset(&mut self) {
        self.slots = [0; REGISTER_COUNT];
    }

    #[inline]
    fn slot(index: u8, offset: u32) -> usize {
        (index as usize + offset as usize) % REGISTER_COUNT
    }

    /// Read the register group of the given width starting at `index`.
    pub fn get(&self, index: u8, width: Width) -> u32 {
        (0..width.bytes()).fold(0u32, |acc, offset| {
            (acc << 8) | self.slots[Self::slot(index, offset)] as u32
        })
    }

    /// Write the low `width` bits of `value` to the group starting at `index`.
    pub fn set(&mut self, index: u8, width: Width, value: u32) {
        let bytes = width.bytes();
        for offset in 0..bytes {
            let shift = 8 * (bytes - 1 - offset);
            self.slots[Self::slot(index, offset)] = (value >> shift) as u8;
        }
    }

    /// Register group name, e.g. `A`, `BC`, `YZA`.
    pub fn name(index: u8, width: Width) -> String {
        (0..width.bytes())
            .map(|offset| (b'A' + Self::slot(index, offset) as u8) as char)
            .collect()
    }

    /// Raw slot contents, A first.
    pub fn slots(&self) -> &[u8; REGISTER_COUNT] {
        &self.slots
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show non-zero slots
        let mut map = f.debug_map();
        for (i, value) in self.slots.iter().enumerate().filter(|(_, v)| **v != 0) {
            map.entry(&Self::name(i as u8, Width::W8), value);
        }
        map.finish()
    }
}

/// The float register file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRegisters {
    regs: [f32; FLOAT_REGISTER_COUNT],
}

impl FloatRegisters {
    pub fn new() -> Self {
        Self {
            regs: [0.0; FLOAT_REGISTER_COUNT],
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0.0; FLOAT_REGISTER_COUNT];
    }

    #[inline]
    pub fn get(&self, index: u8) -> f32 {
        self.regs[index as usize % FLOAT_REGISTER_COUNT]
    }

    #[inline]
    pub fn set(&mut self, index: u8, value: f32) {
        self.regs[index as usize % FLOAT_REGISTER_COUNT] = value;
    }
}

impl Default for FloatRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FloatRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (i, value) in self.regs.iter().enumerate().filter(|(_, v)| v.to_bits() != 0) {
            map.entry(&format_args!("F{i}"), value);
        }
        map.finish()
    }
}

/// One bit of the flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    Zero = 0,
    Carry = 1,
    Sign = 2,
    Overflow = 3,
    /// Parity/odd. Written only by compare.
    Parity = 4,
    Equal = 5,
    Greater = 6,
    Less = 7,
}

impl Flag {
    pub const ALL: [Flag; 8] = [
        Flag::Zero,
        Flag::Carry,
        Flag::Sign,
        Flag::Overflow,
        Flag::Parity,
        Flag::Equal,
        Flag::Greater,
        Flag::Less,
    ];

    const fn letter(self) -> char {
        match self {
            Flag::Zero => 'Z',
            Flag::Carry => 'C',
            Flag::Sign => 'N',
            Flag::Overflow => 'V',
            Flag::Parity => 'P',
            Flag::Equal => 'E',
            Flag::Greater => 'G',
            Flag::Less => 'L',
        }
    }
}

/// The flag register.
///
/// Flags keep whatever the last flag-setting instruction wrote; nothing
/// clears them implicitly.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags {
    bits: u8,
}

impl Flags {
    pub const fn from_bits(bits: u8) -> Self {
        Self { bits }
    }

    pub const fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    pub fn get(&self, flag: Flag) -> bool {
        self.bits & (1 << flag as u8) != 0
    }

    #[inline]
    pub fn set(&mut self, flag: Flag, value: bool) {
        if value {
            self.bits |= 1 << flag as u8;
        } else {
            self.bits &= !(1 << flag as u8);
        }
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in Flag::ALL {
            let c = if self.get(flag) { flag.letter() } else { '-' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
