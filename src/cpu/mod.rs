//! The execution core.
//!
//! - `isa`: instruction families and their operand forms
//! - `decode` / `encode`: the byte-level form of those tables
//! - `alu`, `stack`: the arithmetic and stack units
//! - `execute`: the `Cpu` that ties them together

pub mod alu;
pub mod decode;
pub mod encode;
pub mod execute;
pub mod fault;
pub mod isa;
pub mod memory;
pub mod registers;
pub mod stack;

pub use decode::{Operand, Operands, Stream};
pub use encode::{Arg, EncodeError, Encoder};
pub use execute::{Cpu, CpuError, CpuState, Executed, Snapshot};
pub use fault::{ErrorReporter, LogReporter, RuntimeError};
pub use isa::{Cond, Form, InstructionSet, Op, Shape, Width};
pub use memory::{Hmem, Memory};
pub use registers::{Flag, Flags, FloatRegisters, Registers};
pub use stack::{Stack, StackFault};
