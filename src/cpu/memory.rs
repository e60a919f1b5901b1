//! Memory subsystem.
//!
//! Main memory is a flat 16 MiB, byte-addressable space. Every byte address
//! wraps modulo 2^24, so there are no out-of-range accesses. Multi-byte
//! values are stored big-endian.
//!
//! HMEM is a small system block, separate from RAM, that the fault protocol
//! reads the error handler address from and writes the error id to.

use std::fmt;

use crate::cpu::isa::Width;

/// The number of bytes in main memory.
pub const MEMORY_SIZE: usize = 1 << 24;

/// Mask applied to every address.
pub const ADDRESS_MASK: u32 = 0xFF_FFFF;

/// Main memory.
#[derive(Clone)]
pub struct Memory {
    cells: Vec<u8>,
}

impl Memory {
    /// Create a new memory with all bytes zeroed.
    pub fn new() -> Self {
        Self {
            cells: vec![0; MEMORY_SIZE],
        }
    }

    #[inline]
    fn index(address: u32) -> usize {
        (address & ADDRESS_MASK) as usize
    }

    #[inline]
    pub fn get_8(&self, address: u32) -> u8 {
        self.cells[Self::index(address)]
    }

    #[inline]
    pub fn set_8(&mut self, address: u32, value: u8) {
        self.cells[Self::index(address)] = value;
    }

    /// Read a big-endian value of the given width. Each byte address wraps
    /// independently, so a read at `0xFFFFFF` continues at `0`.
    pub fn get(&self, width: Width, address: u32) -> u32 {
        (0..width.bytes()).fold(0u32, |acc, offset| {
            (acc << 8) | self.get_8(address.wrapping_add(offset)) as u32
        })
    }

    /// Write the low `width` bits of `value` big-endian.
    pub fn set(&mut self, width: Width, address: u32, value: u32) {
        let bytes = width.bytes();
        for offset in 0..bytes {
            let shift = 8 * (bytes - 1 - offset);
            self.set_8(address.wrapping_add(offset), (value >> shift) as u8);
        }
    }

    pub fn get_16(&self, address: u32) -> u16 {
        self.get(Width::W16, address) as u16
    }

    pub fn set_16(&mut self, address: u32, value: u16) {
        self.set(Width::W16, address, value as u32);
    }

    pub fn get_24(&self, address: u32) -> u32 {
        self.get(Width::W24, address)
    }

    pub fn set_24(&mut self, address: u32, value: u32) {
        self.set(Width::W24, address, value);
    }

    pub fn get_32(&self, address: u32) -> u32 {
        self.get(Width::W32, address)
    }

    pub fn set_32(&mut self, address: u32, value: u32) {
        self.set(Width::W32, address, value);
    }

    /// Read an IEEE-754 single from its big-endian bit pattern.
    pub fn get_float(&self, address: u32) -> f32 {
        f32::from_bits(self.get_32(address))
    }

    pub fn set_float(&mut self, address: u32, value: f32) {
        self.set_32(address, value.to_bits());
    }

    /// Write `repeat` back-to-back copies of the `width`-byte pattern
    /// starting at `address`.
    pub fn fill_bytes(&mut self, address: u32, pattern: u32, width: Width, repeat: u32) {
        let step = width.bytes();
        let mut cursor = address;
        for _ in 0..repeat {
            self.set(width, cursor, pattern);
            cursor = cursor.wrapping_add(step) & ADDRESS_MASK;
        }
    }

    /// Copy `len` bytes from `src` to `dst`, ascending, one byte at a time.
    /// Overlapping ranges are not special-cased.
    pub fn copy_block(&mut self, dst: u32, src: u32, len: u32) {
        for offset in 0..len {
            let byte = self.get_8(src.wrapping_add(offset));
            self.set_8(dst.wrapping_add(offset), byte);
        }
    }

    /// Copy a raw image into memory starting at `origin`.
    pub fn load(&mut self, origin: u32, image: &[u8]) {
        for (offset, &byte) in image.iter().enumerate() {
            self.set_8(origin.wrapping_add(offset as u32), byte);
        }
    }

    /// Clear all memory to zeros.
    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Dump `count` bytes starting at `start` (for debugging).
    pub fn dump(&self, start: u32, count: u32) -> Vec<(u32, u8)> {
        (0..count)
            .map(|offset| {
                let address = start.wrapping_add(offset) & ADDRESS_MASK;
                (address, self.get_8(address))
            })
            .collect()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let non_zero = self.cells.iter().filter(|&&b| b != 0).count();
        f.debug_struct("Memory")
            .field("non_zero_bytes", &non_zero)
            .field("total_bytes", &MEMORY_SIZE)
            .finish()
    }
}

/// The number of bytes in HMEM.
pub const HMEM_SIZE: usize = 256;

/// HMEM offset of the 24-bit guest error handler address.
pub const ERROR_HANDLER_ADDRESS: usize = 0x00;

/// HMEM offset of the last error id.
pub const ERROR_ID: usize = 0x03;

/// Reserved system memory.
#[derive(Clone, PartialEq, Eq)]
pub struct Hmem {
    cells: [u8; HMEM_SIZE],
}

impl Hmem {
    pub fn new() -> Self {
        Self {
            cells: [0; HMEM_SIZE],
        }
    }

    #[inline]
    pub fn read(&self, index: usize) -> u8 {
        self.cells[index % HMEM_SIZE]
    }

    #[inline]
    pub fn write(&mut self, index: usize, value: u8) {
        self.cells[index % HMEM_SIZE] = value;
    }

    /// Where the fault protocol sends IPO.
    pub fn error_handler(&self) -> u32 {
        (0..3).fold(0u32, |acc, i| (acc << 8) | self.read(ERROR_HANDLER_ADDRESS + i) as u32)
    }

    pub fn set_error_handler(&mut self, address: u32) {
        let address = address & ADDRESS_MASK;
        self.write(ERROR_HANDLER_ADDRESS, (address >> 16) as u8);
        self.write(ERROR_HANDLER_ADDRESS + 1, (address >> 8) as u8);
        self.write(ERROR_HANDLER_ADDRESS + 2, address as u8);
    }

    pub fn error_id(&self) -> u8 {
        self.read(ERROR_ID)
    }

    pub fn set_error_id(&mut self, id: u8) {
        self.write(ERROR_ID, id);
    }

    pub fn clear(&mut self) {
        self.cells = [0; HMEM_SIZE];
    }
}

impl Default for Hmem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Hmem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hmem")
            .field("error_handler", &format_args!("{:#08X}", self.error_handler()))
            .field("error_id", &self.error_id())
            .finish()
    }
}
