//! # c93
//!
//! Execution core of a byte-oriented register machine: 26 byte-wide
//! registers that group into 16/24/32-bit values, 16 float registers, a
//! flag register, a 24-bit address space and a bounded call stack.
//!
//! ```
//! use c93::cpu::isa::opcode;
//! use c93::cpu::registers::reg;
//! use c93::{Arg, Cpu, Encoder, Op, Width};
//!
//! let mut asm = Encoder::new();
//! asm.emit(opcode::LD, Op::Ld, &[Arg::Reg(Width::W8, reg::A), Arg::Imm(Width::W8, 40)])
//!     .unwrap()
//!     .emit(opcode::ADD, Op::Add, &[Arg::Reg(Width::W8, reg::A), Arg::Imm(Width::W8, 2)])
//!     .unwrap()
//!     .bare(opcode::HALT)
//!     .unwrap();
//!
//! let mut cpu = Cpu::new();
//! cpu.load_program(asm.bytes());
//! cpu.run().unwrap();
//! assert_eq!(cpu.regs.get(reg::A, Width::W8), 42);
//! ```

pub mod config;
pub mod cpu;

// Re-export commonly used types
pub use config::{ConfigError, MachineConfig};
pub use cpu::{
    Arg, Cpu, CpuError, CpuState, Encoder, ErrorReporter, Flag, Flags, InstructionSet, Memory, Op,
    Registers, RuntimeError, Snapshot, Width,
};
