//! CPU execution engine.
//!
//! Implements the fetch-decode-execute cycle. Every moded instruction goes
//! through the same path: fetch the mode byte, pick the form, decode its
//! operands, then run the form's [`Op`] over them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MachineConfig;
use crate::cpu::alu;
use crate::cpu::decode::{decode_operands, Operand, Operands, Stream};
use crate::cpu::fault::{error_id, ErrorReporter, LogReporter, RuntimeError};
use crate::cpu::isa::{FamilyBody, InstructionSet, Op, Width};
use crate::cpu::memory::{Hmem, Memory, ADDRESS_MASK};
use crate::cpu::registers::{FloatRegisters, Flags, Registers};
use crate::cpu::stack::{Stack, StackFault};

/// CPU execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    /// CPU is running normally.
    Running,
    /// CPU has halted (executed HALT).
    Halted,
    /// CPU hit an illegal instruction.
    Error,
}

/// Record of one executed instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Executed {
    /// Address of the opcode byte.
    pub address: u32,
    pub opcode: u8,
    pub op: Op,
    pub operands: Operands,
}

impl fmt::Display for Executed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}: {}", self.address, self.op)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands)?;
        }
        Ok(())
    }
}

/// The machine.
pub struct Cpu {
    /// Integer register file.
    pub regs: Registers,
    /// Float register file.
    pub fregs: FloatRegisters,
    pub flags: Flags,
    /// Instruction pointer (24-bit).
    pub ipo: u32,
    pub stack: Stack,
    /// Main memory.
    pub mem: Memory,
    pub hmem: Hmem,
    /// Current execution state.
    pub state: CpuState,
    /// Instruction count.
    pub cycles: u64,
    config: MachineConfig,
    reporter: Box<dyn ErrorReporter>,
    last: Option<Executed>,
}

impl Cpu {
    /// Create a CPU with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MachineConfig::default())
    }

    pub fn with_config(config: MachineConfig) -> Self {
        let mut cpu = Self {
            regs: Registers::new(),
            fregs: FloatRegisters::new(),
            flags: Flags::default(),
            ipo: 0,
            stack: Stack::new(config.stack_capacity),
            mem: Memory::new(),
            hmem: Hmem::new(),
            state: CpuState::Running,
            cycles: 0,
            config,
            reporter: Box::new(LogReporter::new()),
            last: None,
        };
        cpu.reset();
        cpu
    }

    /// Replace the runtime error reporter.
    pub fn with_reporter(mut self, reporter: Box<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Reset the CPU to its initial state. Memory is cleared; HMEM gets the
    /// configured error handler.
    pub fn reset(&mut self) {
        self.regs.reset();
        self.fregs.reset();
        self.flags = Flags::default();
        self.stack.reset();
        self.mem.clear();
        self.hmem.clear();
        self.hmem.set_error_handler(self.config.error_handler);
        self.hmem.set_error_id(error_id::NONE);
        self.ipo = self.config.origin & ADDRESS_MASK;
        self.state = CpuState::Running;
        self.cycles = 0;
        self.last = None;
    }

    /// Copy a program image to the configured origin and point IPO at it.
    pub fn load_program(&mut self, image: &[u8]) {
        self.mem.load(self.config.origin, image);
        self.ipo = self.config.origin & ADDRESS_MASK;
    }

    /// Execute a single instruction.
    pub fn step(&mut self) -> Result<Executed, CpuError> {
        if self.state != CpuState::Running {
            return Err(CpuError::NotRunning(self.state));
        }

        let address = self.ipo;
        let mut stream = Stream::new(&self.mem, address);
        let opcode = stream.fetch_u8();

        let Some(family) = InstructionSet::get().family(opcode) else {
            self.state = CpuState::Error;
            return Err(CpuError::IllegalOpcode { opcode, address });
        };

        let (op, operands) = match &family.body {
            FamilyBody::Bare(op) => (*op, Operands::default()),
            FamilyBody::Moded(forms) => {
                let mode = stream.fetch_u8();
                let index = mode >> 2;
                let Some(form) = forms.get(index as usize) else {
                    self.state = CpuState::Error;
                    return Err(CpuError::IllegalForm { opcode, index, address });
                };
                (form.op, decode_operands(form, mode, &mut stream, &self.regs))
            }
        };
        self.ipo = stream.position();

        tracing::trace!("{address:06X}  {op} {operands}");

        if let Err(fault) = self.execute(op, &operands, address) {
            self.trap(fault, op, address);
        }

        self.cycles += 1;
        let executed = Executed {
            address,
            opcode,
            op,
            operands,
        };
        self.last = Some(executed);
        Ok(executed)
    }

    /// Run until halt or error.
    ///
    /// Returns the number of instructions executed.
    pub fn run(&mut self) -> Result<u64, CpuError> {
        let start_cycles = self.cycles;

        while self.state == CpuState::Running {
            self.step()?;
        }

        Ok(self.cycles - start_cycles)
    }

    /// Run for at most `max_cycles` instructions.
    pub fn run_limited(&mut self, max_cycles: u64) -> Result<u64, CpuError> {
        let start_cycles = self.cycles;
        let limit = self.cycles.saturating_add(max_cycles);

        while self.state == CpuState::Running && self.cycles < limit {
            self.step()?;
        }

        Ok(self.cycles - start_cycles)
    }

    /// Stack fault protocol: log, empty the stack, record the error id and
    /// continue at the guest error handler.
    fn trap(&mut self, fault: StackFault, op: Op, address: u32) {
        tracing::error!(
            instruction = %op,
            "{fault} at {address:#08X} (IPO {:#08X})",
            self.ipo
        );
        self.stack.reset();
        self.ipo = self.hmem.error_handler();
        self.hmem.set_error_id(fault.error_id());
    }

    fn report(&mut self, error: RuntimeError) {
        self.reporter.report(&error);
    }

    fn execute(&mut self, op: Op, operands: &[Operand], address: u32) -> Result<(), StackFault> {
        match op {
            Op::Nop => {}
            Op::Halt => self.state = CpuState::Halted,
            Op::Ret => self.ipo = self.stack.pop(Width::W24)?,

            Op::Ld => self.load(operands[0], operands[1]),
            Op::Fill => {
                let dst = operands[0];
                let pattern = self.read_int(operands[1]);
                let count = self.read_int(operands[2]);
                self.mem.fill_bytes(address_of(dst), pattern, dst.width(), count);
            }
            Op::Stamp => self.stamp(operands),
            Op::Copy => {
                let len = self.read_int(operands[2]);
                self.mem
                    .copy_block(address_of(operands[0]), address_of(operands[1]), len);
            }

            Op::Add | Op::Sub => self.add_sub(op, operands[0], operands[1]),
            Op::Mul => match operands[0] {
                dst if dst.is_float() => {
                    let value = self.read_float(dst) * self.read_float(operands[1]);
                    self.write_float(dst, value);
                }
                dst => self.integer(dst, operands[1], alu::mul),
            },
            Op::Div => match operands[0] {
                dst if dst.is_float() => {
                    let divisor = self.read_float(operands[1]);
                    if divisor == 0.0 {
                        self.report(RuntimeError::DivisionByZero { address });
                    } else {
                        let value = self.read_float(dst) / divisor;
                        self.write_float(dst, value);
                    }
                }
                dst => self.integer(dst, operands[1], alu::div),
            },
            Op::DivRem => {
                let (dst, src, rem) = (operands[0], operands[1], operands[2]);
                let width = dst.width();
                let (a, b) = (self.read_int(dst), self.read_int(src));
                let (quotient, remainder) = alu::div_rem(&mut self.flags, width, a, b);
                self.write_int(dst, quotient);
                self.write_int(rem, remainder);
            }
            Op::SDiv | Op::SDivRem => {
                let dst = operands[0];
                let (a, b) = (self.read_int(dst), self.read_int(operands[1]));
                match alu::sdiv_rem(&mut self.flags, dst.width(), a, b) {
                    Some((quotient, remainder)) => {
                        self.write_int(dst, quotient);
                        if let Some(&rem) = operands.get(2) {
                            self.write_int(rem, remainder);
                        }
                    }
                    None => self.report(RuntimeError::DivisionByZero { address }),
                }
            }
            Op::Inv => {
                let dst = operands[0];
                let value = self.read_float(*operands.last().unwrap_or(&dst));
                if value == 0.0 {
                    self.report(RuntimeError::DivisionByZero { address });
                } else {
                    self.write_float(dst, 1.0 / value);
                }
            }
            Op::Cp => match operands[0] {
                a if a.is_float() => {
                    let (a, b) = (self.read_float(a), self.read_float(operands[1]));
                    alu::compare_float(&mut self.flags, a, b);
                }
                a => {
                    let width = a.width();
                    let (a, b) = (self.read_int(a), self.read_int(operands[1]));
                    alu::compare(&mut self.flags, width, a, b);
                }
            },
            Op::Nand => self.integer(operands[0], operands[1], |_, w, a, b| alu::nand(w, a, b)),
            Op::Xnor => self.integer(operands[0], operands[1], |_, w, a, b| alu::xnor(w, a, b)),
            Op::Imply => self.integer(operands[0], operands[1], |_, w, a, b| alu::imply(w, a, b)),

            Op::Push => match operands[0] {
                Operand::FReg(index) => self.stack.push_float(self.fregs.get(index))?,
                src => {
                    let value = self.read_int(src);
                    self.stack.push(src.width(), value)?;
                }
            },
            Op::Pop => match operands[0] {
                Operand::FReg(index) => {
                    let value = self.stack.pop_float()?;
                    self.fregs.set(index, value);
                }
                dst => {
                    let value = self.stack.pop(dst.width())?;
                    self.write_int(dst, value);
                }
            },
            Op::PushRange => match (operands[0], operands[1]) {
                (Operand::FReg(start), Operand::FReg(end)) => {
                    self.stack.push_float_range(&self.fregs, start, end)?
                }
                (start, end) => {
                    self.stack
                        .push_range(&self.regs, register_index(start), register_index(end))?
                }
            },
            Op::PopRange => match (operands[0], operands[1]) {
                (Operand::FReg(start), Operand::FReg(end)) => {
                    self.stack.pop_float_range(&mut self.fregs, start, end)?
                }
                (start, end) => self.stack.pop_range(
                    &mut self.regs,
                    register_index(start),
                    register_index(end),
                )?,
            },

            Op::Djnz => {
                let (counter, target) = (operands[0], operands[1]);
                let target = self.read_int(target) & ADDRESS_MASK;
                let value = self.read_int(counter).wrapping_sub(1) & counter.width().mask();
                self.write_int(counter, value);
                if value != 0 {
                    self.ipo = target;
                }
            }
            Op::Jp(cond) => {
                if cond.holds(&self.flags) {
                    self.ipo = self.read_int(operands[0]) & ADDRESS_MASK;
                }
            }
            Op::Call => {
                let target = self.read_int(operands[0]) & ADDRESS_MASK;
                self.stack.push(Width::W24, self.ipo)?;
                self.ipo = target;
            }
        }

        Ok(())
    }

    /// Read an operand's raw value. Float operands yield their bit pattern.
    fn read_int(&self, operand: Operand) -> u32 {
        match operand {
            Operand::Reg { index, width } => self.regs.get(index, width),
            Operand::Imm { value, width } => value & width.mask(),
            Operand::Mem { address, width } => self.mem.get(width, address),
            Operand::FReg(index) => self.fregs.get(index).to_bits(),
            Operand::FImm(value) => value.to_bits(),
            Operand::FMem(address) => self.mem.get_32(address),
        }
    }

    fn write_int(&mut self, operand: Operand, value: u32) {
        match operand {
            Operand::Reg { index, width } => self.regs.set(index, width, value),
            Operand::Mem { address, width } => self.mem.set(width, address, value),
            Operand::FReg(index) => self.fregs.set(index, f32::from_bits(value)),
            Operand::FMem(address) => self.mem.set_32(address, value),
            Operand::Imm { .. } | Operand::FImm(_) => unreachable!("write to immediate {operand}"),
        }
    }

    /// Read an operand as a float. Integer operands convert from unsigned.
    fn read_float(&self, operand: Operand) -> f32 {
        match operand {
            Operand::FReg(index) => self.fregs.get(index),
            Operand::FImm(value) => value,
            Operand::FMem(address) => self.mem.get_float(address),
            int => self.read_int(int) as f32,
        }
    }

    fn write_float(&mut self, operand: Operand, value: f32) {
        self.write_int(operand, value.to_bits());
    }

    fn load(&mut self, dst: Operand, src: Operand) {
        match (dst.is_float(), src.is_float()) {
            (false, true) => {
                let float = self.read_float(src);
                let value = alu::float_to_int(&mut self.flags, dst.width(), float);
                self.write_int(dst, value);
            }
            (true, false) => {
                let value = self.read_int(src) as f32;
                self.write_float(dst, value);
            }
            _ => {
                let value = self.read_int(src);
                self.write_int(dst, value);
            }
        }
    }

    /// Two-operand integer operation writing back to `dst`.
    fn integer(
        &mut self,
        dst: Operand,
        src: Operand,
        op: impl FnOnce(&mut Flags, Width, u32, u32) -> u32,
    ) {
        let width = dst.width();
        let (a, b) = (self.read_int(dst), self.read_int(src));
        let value = op(&mut self.flags, width, a, b);
        self.write_int(dst, value);
    }

    fn add_sub(&mut self, op: Op, dst: Operand, src: Operand) {
        let subtract = op == Op::Sub;
        match (dst.is_float(), src.is_float()) {
            (true, _) => {
                let (a, b) = (self.read_float(dst), self.read_float(src));
                self.write_float(dst, if subtract { a - b } else { a + b });
            }
            (false, true) => {
                let (a, f) = (self.read_int(dst), self.read_float(src));
                let value = alu::add_float(&mut self.flags, dst.width(), a, f, subtract);
                self.write_int(dst, value);
            }
            (false, false) if subtract => self.integer(dst, src, alu::sub),
            (false, false) => self.integer(dst, src, alu::add),
        }
    }

    /// `repeat` stamps of `count` patterns each, laid end to end.
    fn stamp(&mut self, operands: &[Operand]) {
        let dst = operands[0];
        let width = dst.width();
        let pattern = self.read_int(operands[1]);
        let count = self.read_int(operands[2]);
        let repeat = self.read_int(operands[3]);

        let stride = count.wrapping_mul(width.bytes());
        let mut cursor = address_of(dst);
        for _ in 0..repeat {
            self.mem.fill_bytes(cursor, pattern, width, count);
            cursor = cursor.wrapping_add(stride) & ADDRESS_MASK;
        }
    }

    /// Get the last executed instruction.
    pub fn last_executed(&self) -> Option<Executed> {
        self.last
    }

    /// Check if the CPU is halted.
    pub fn is_halted(&self) -> bool {
        self.state == CpuState::Halted
    }

    /// Check if the CPU is running.
    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            cycles: self.cycles,
            ipo: self.ipo,
            spr: self.stack.spr(),
            flags: self.flags,
            registers: self.regs.clone(),
            float_registers: self.fregs.clone(),
            error_handler: self.hmem.error_handler(),
            error_id: self.hmem.error_id(),
        }
    }
}

fn address_of(operand: Operand) -> u32 {
    match operand {
        Operand::Mem { address, .. } | Operand::FMem(address) => address,
        other => unreachable!("{other} is not a memory operand"),
    }
}

fn register_index(operand: Operand) -> u8 {
    match operand {
        Operand::Reg { index, .. } | Operand::FReg(index) => index,
        other => unreachable!("{other} is not a register"),
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .field("ipo", &format_args!("{:06X}", self.ipo))
            .field("flags", &self.flags)
            .field("regs", &self.regs)
            .field("fregs", &self.fregs)
            .field("stack", &self.stack)
            .finish()
    }
}

/// Serializable view of the architectural state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: CpuState,
    pub cycles: u64,
    pub ipo: u32,
    pub spr: u32,
    pub flags: Flags,
    pub registers: Registers,
    pub float_registers: FloatRegisters,
    pub error_handler: u32,
    pub error_id: u8,
}

/// Errors that can occur during CPU execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("CPU not running: {0:?}")]
    NotRunning(CpuState),

    #[error("illegal opcode {opcode:#04X} at {address:#08X}")]
    IllegalOpcode { opcode: u8, address: u32 },

    #[error("illegal form {index} of opcode {opcode:#04X} at {address:#08X}")]
    IllegalForm { opcode: u8, index: u8, address: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::encode::{Arg, Encoder};
    use crate::cpu::isa::{opcode, Cond, Disp};
    use crate::cpu::registers::{reg, Flag};
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::cpu::isa::Width::{W16, W24, W32, W8};

    /// Collects reported runtime errors for inspection.
    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<RuntimeError>>>);

    impl Recorder {
        fn errors(&self) -> Vec<RuntimeError> {
            self.0.borrow().clone()
        }
    }

    impl ErrorReporter for Recorder {
        fn report(&mut self, error: &RuntimeError) {
            self.0.borrow_mut().push(*error);
        }
    }

    fn machine_with(config: MachineConfig, asm: &Encoder) -> (Cpu, Recorder) {
        let recorder = Recorder::default();
        let mut cpu = Cpu::with_config(config).with_reporter(Box::new(recorder.clone()));
        cpu.load_program(asm.bytes());
        (cpu, recorder)
    }

    fn machine(asm: &Encoder) -> (Cpu, Recorder) {
        machine_with(MachineConfig::default(), asm)
    }

    fn ld(asm: &mut Encoder, dst: Arg, src: Arg) {
        let family = match dst {
            Arg::Abs(..) | Arg::AbsIdx(..) | Arg::Ind(..) | Arg::IndIdx(..) => opcode::ST,
            Arg::FAbs(_) | Arg::FInd(_) => opcode::ST,
            _ => opcode::LD,
        };
        asm.emit(family, Op::Ld, &[dst, src]).unwrap();
    }

    fn halt(asm: &mut Encoder) {
        asm.bare(opcode::HALT).unwrap();
    }

    #[test]
    fn test_cpu_halt() {
        let mut asm = Encoder::new();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        let executed = cpu.run().unwrap();

        assert_eq!(executed, 1);
        assert!(cpu.is_halted());
        assert_eq!(cpu.step(), Err(CpuError::NotRunning(CpuState::Halted)));
    }

    #[test]
    fn test_cpu_nop_then_halt() {
        let mut asm = Encoder::new();
        asm.bare(opcode::NOP).unwrap().bare(opcode::NOP).unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        assert_eq!(cpu.run().unwrap(), 3);
        assert_eq!(cpu.ipo, 3);
    }

    #[test]
    fn test_add_wraps_and_sets_carry() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 0xFF));
        asm.emit(opcode::ADD, Op::Add, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 1)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W8), 0);
        assert!(cpu.flags.get(Flag::Zero));
        assert!(cpu.flags.get(Flag::Carry));
    }

    #[test]
    fn test_register_pair_arithmetic() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W16, reg::B), Arg::Imm(W16, 0x1234));
        ld(&mut asm, Arg::Reg(W16, reg::D), Arg::Imm(W16, 0x0101));
        asm.emit(opcode::ADD, Op::Add, &[Arg::Reg(W16, reg::B), Arg::Reg(W16, reg::D)])
            .unwrap();
        asm.emit(opcode::MUL, Op::Mul, &[Arg::Reg(W16, reg::D), Arg::Imm(W16, 2)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::B, W16), 0x1335);
        assert_eq!(cpu.regs.get(reg::D, W16), 0x0202);
    }

    #[test]
    fn test_store_through_indexed_pointer() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W24, reg::A), Arg::Imm(W24, 0x2000));
        ld(&mut asm, Arg::Reg(W8, reg::D), Arg::Imm(W8, 0xFE));
        ld(&mut asm, Arg::Reg(W16, reg::E), Arg::Imm(W16, 0xBEEF));
        ld(
            &mut asm,
            Arg::IndIdx(W16, reg::A, Disp::R8, reg::D),
            Arg::Reg(W16, reg::E),
        );
        ld(&mut asm, Arg::Reg(W8, reg::H), Arg::Abs(W8, 0x1FFF));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.mem.get_16(0x1FFE), 0xBEEF);
        assert_eq!(cpu.regs.get(reg::H, W8), 0xEF);
    }

    #[test]
    fn test_memory_to_memory_store() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Abs(W32, 0x100), Arg::Imm(W32, 0xCAFE_F00D));
        ld(&mut asm, Arg::Abs(W32, 0x200), Arg::Abs(W32, 0x100));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.mem.get_32(0x200), 0xCAFE_F00D);
    }

    #[test]
    fn test_loads_leave_flags_alone() {
        let mut asm = Encoder::new();
        asm.emit(opcode::CP, Op::Cp, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 1)])
            .unwrap();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 0));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.step().unwrap();
        let after_compare = cpu.flags;
        cpu.run().unwrap();

        assert_eq!(cpu.flags, after_compare);
    }

    #[test]
    fn test_unsigned_divide_by_zero_saturates_silently() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W16, reg::A), Arg::Imm(W16, 1234));
        asm.emit(opcode::DIV, Op::Div, &[Arg::Reg(W16, reg::A), Arg::Imm(W16, 0)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, recorder) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W16), 0xFFFF);
        assert!(cpu.flags.get(Flag::Carry));
        assert!(recorder.errors().is_empty());
    }

    #[test]
    fn test_divide_with_remainder() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W16, reg::A), Arg::Imm(W16, 1000));
        ld(&mut asm, Arg::Reg(W16, reg::C), Arg::Imm(W16, 7));
        asm.emit(
            opcode::DIV,
            Op::DivRem,
            &[Arg::Reg(W16, reg::A), Arg::Reg(W16, reg::C), Arg::Reg(W16, reg::E)],
        )
        .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W16), 142);
        assert_eq!(cpu.regs.get(reg::E, W16), 6);
    }

    #[test]
    fn test_signed_divide_by_zero_reports_and_skips() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 10));
        ld(&mut asm, Arg::Reg(W8, reg::B), Arg::Imm(W8, 0));
        asm.emit(opcode::CP, Op::Cp, &[Arg::Reg(W8, reg::A), Arg::Reg(W8, reg::B)])
            .unwrap();
        let sdiv_at = asm.position();
        asm.emit(opcode::SDIV, Op::SDiv, &[Arg::Reg(W8, reg::A), Arg::Reg(W8, reg::B)])
            .unwrap();
        ld(&mut asm, Arg::Reg(W8, reg::C), Arg::Imm(W8, 1));
        halt(&mut asm);
        let (mut cpu, recorder) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W8), 10);
        // flags are still those of CP 10, 0
        assert_eq!(cpu.flags.bits(), 0b0101_0000);
        assert_eq!(
            recorder.errors(),
            vec![RuntimeError::DivisionByZero { address: sdiv_at }]
        );
        // only the one instruction was abandoned
        assert_eq!(cpu.regs.get(reg::C, W8), 1);
        assert!(cpu.is_halted());
    }

    #[test]
    fn test_signed_divide_with_remainder() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W32, reg::A), Arg::Imm(W32, (-100i32) as u32));
        asm.emit(
            opcode::SDIV,
            Op::SDivRem,
            &[Arg::Reg(W32, reg::A), Arg::Imm(W32, 7), Arg::Reg(W32, reg::E)],
        )
        .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W32) as i32, -14);
        assert_eq!(cpu.regs.get(reg::E, W32) as i32, -2);
        assert!(cpu.flags.get(Flag::Sign));
    }

    #[test]
    fn test_bitwise_forms_leave_flags() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 0b1100));
        asm.emit(opcode::NAND, Op::Nand, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 0b1010)])
            .unwrap();
        ld(&mut asm, Arg::Abs(W8, 0x80), Arg::Imm(W8, 0xF0));
        asm.emit(opcode::XNOR, Op::Xnor, &[Arg::Abs(W8, 0x80), Arg::Reg(W8, reg::A)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W8), 0b1111_0111);
        assert_eq!(cpu.mem.get_8(0x80), !(0xF0u8 ^ 0b1111_0111));
        assert_eq!(cpu.flags.bits(), 0);
    }

    #[test]
    fn test_compare_and_jump() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 3));
        asm.emit(opcode::CP, Op::Cp, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 5)])
            .unwrap();
        // JP LT, imm24 is 5 bytes and the skipped LD is 4
        let target = asm.position() + 5 + 4;
        asm.emit(opcode::JP, Op::Jp(Cond::LT), &[Arg::Imm(W24, target)])
            .unwrap();
        ld(&mut asm, Arg::Reg(W8, reg::C), Arg::Imm(W8, 0xEE));
        assert_eq!(asm.position(), target);
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        assert_eq!(cpu.run().unwrap(), 4);
        assert_eq!(cpu.regs.get(reg::C, W8), 0);
    }

    #[test]
    fn test_jump_not_taken_falls_through() {
        let mut asm = Encoder::new();
        asm.emit(opcode::CP, Op::Cp, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 0)])
            .unwrap();
        ld(&mut asm, Arg::Reg(W24, reg::X), Arg::Imm(W24, 0x00_0000));
        asm.emit(opcode::JP, Op::Jp(Cond::NZ), &[Arg::Reg(W24, reg::X)])
            .unwrap();
        ld(&mut asm, Arg::Reg(W8, reg::C), Arg::Imm(W8, 0x42));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::C, W8), 0x42);
    }

    #[test]
    fn test_djnz_loop() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::B), Arg::Imm(W8, 5));
        let top = asm.position();
        asm.emit(opcode::ADD, Op::Add, &[Arg::Reg(W8, reg::A), Arg::Imm(W8, 3)])
            .unwrap();
        asm.emit(opcode::DJNZ, Op::Djnz, &[Arg::Reg(W8, reg::B), Arg::Imm(W24, top)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        // LD, 5 * (ADD, DJNZ), HALT
        assert_eq!(cpu.run().unwrap(), 12);
        assert_eq!(cpu.regs.get(reg::A, W8), 15);
        assert_eq!(cpu.regs.get(reg::B, W8), 0);
    }

    #[test]
    fn test_djnz_memory_counter_wraps() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W24, reg::T), Arg::Imm(W24, 0x00_0040));
        // counter starts at 0, so the first decrement wraps to 0xFFFF
        asm.emit(opcode::DJNZ, Op::Djnz, &[Arg::Abs(W16, 0x300), Arg::Reg(W24, reg::T)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);
        cpu.mem.set_8(0x40, opcode::HALT);

        cpu.run().unwrap();

        assert_eq!(cpu.mem.get_16(0x300), 0xFFFF);
        assert_eq!(cpu.ipo, 0x41);
    }

    #[test]
    fn test_call_and_return() {
        let mut asm = Encoder::new();
        // CALL imm24 is 5 bytes, HALT 1
        asm.emit(opcode::CALL, Op::Call, &[Arg::Imm(W24, 6)]).unwrap();
        halt(&mut asm);
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 7));
        asm.bare(opcode::RET).unwrap();
        let (mut cpu, _) = machine(&asm);

        cpu.step().unwrap();
        assert_eq!(cpu.ipo, 6);
        assert_eq!(cpu.stack.spr(), 3);

        cpu.run().unwrap();
        assert_eq!(cpu.regs.get(reg::A, W8), 7);
        assert_eq!(cpu.stack.spr(), 0);
        assert_eq!(cpu.ipo, 6);
    }

    #[test]
    fn test_stack_overflow_traps_to_handler() {
        let config = MachineConfig {
            stack_capacity: 4,
            error_handler: 0x100,
            ..MachineConfig::default()
        };
        let mut asm = Encoder::new();
        asm.emit(opcode::PUSH, Op::Push, &[Arg::Imm(W32, 1)]).unwrap();
        let push_at = asm.position();
        asm.emit(opcode::PUSH, Op::Push, &[Arg::Imm(W8, 2)]).unwrap();
        ld(&mut asm, Arg::Reg(W8, reg::Y), Arg::Imm(W8, 1));
        halt(&mut asm);

        let mut handler = Encoder::new();
        ld(&mut handler, Arg::Reg(W8, reg::Z), Arg::Imm(W8, 0x55));
        halt(&mut handler);

        let (mut cpu, recorder) = machine_with(config, &asm);
        cpu.mem.load(0x100, handler.bytes());

        cpu.step().unwrap();
        let executed = cpu.step().unwrap();
        assert_eq!(executed.address, push_at);
        assert_eq!(cpu.ipo, 0x100);
        assert_eq!(cpu.stack.spr(), 0);
        assert_eq!(cpu.hmem.error_id(), error_id::STACK_OVERFLOW);

        cpu.run().unwrap();
        assert_eq!(cpu.regs.get(reg::Z, W8), 0x55);
        assert_eq!(cpu.regs.get(reg::Y, W8), 0);
        assert!(recorder.errors().is_empty());
    }

    #[test]
    fn test_stack_underflow_traps() {
        let config = MachineConfig {
            error_handler: 0x80,
            ..MachineConfig::default()
        };
        let mut asm = Encoder::new();
        asm.emit(opcode::PUSH, Op::Push, &[Arg::Reg(W8, reg::A)]).unwrap();
        asm.emit(opcode::POP, Op::Pop, &[Arg::Reg(W16, reg::A)]).unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine_with(config, &asm);
        cpu.mem.set_8(0x80, opcode::HALT);

        cpu.run().unwrap();

        assert_eq!(cpu.hmem.error_id(), error_id::STACK_UNDERFLOW);
        assert_eq!(cpu.stack.spr(), 0);
        assert_eq!(cpu.ipo, 0x81);
    }

    #[test]
    fn test_ret_on_empty_stack_traps() {
        let config = MachineConfig {
            error_handler: 0x10,
            ..MachineConfig::default()
        };
        let mut asm = Encoder::new();
        asm.bare(opcode::RET).unwrap();
        let (mut cpu, _) = machine_with(config, &asm);
        cpu.mem.set_8(0x10, opcode::HALT);

        cpu.run().unwrap();

        assert_eq!(cpu.hmem.error_id(), error_id::STACK_UNDERFLOW);
        assert!(cpu.is_halted());
    }

    #[test]
    fn test_push_pop_register_widths() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W24, reg::A), Arg::Imm(W24, 0xAB_CDEF));
        ld(&mut asm, Arg::FReg(1), Arg::FImm(-4.5));
        asm.emit(opcode::PUSH, Op::Push, &[Arg::Reg(W24, reg::A)]).unwrap();
        asm.emit(opcode::PUSH, Op::Push, &[Arg::FReg(1)]).unwrap();
        asm.emit(opcode::POP, Op::Pop, &[Arg::FReg(7)]).unwrap();
        asm.emit(opcode::POP, Op::Pop, &[Arg::Reg(W24, reg::K)]).unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::K, W24), 0xAB_CDEF);
        assert_eq!(cpu.fregs.get(7), -4.5);
        assert_eq!(cpu.stack.spr(), 0);
    }

    #[test]
    fn test_register_range_roundtrip_wraps() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W32, reg::Y), Arg::Imm(W32, 0x5152_5354));
        asm.emit(
            opcode::PUSH,
            Op::PushRange,
            &[Arg::Reg(W8, reg::Y), Arg::Reg(W8, reg::B)],
        )
        .unwrap();
        ld(&mut asm, Arg::Reg(W32, reg::Y), Arg::Imm(W32, 0));
        asm.emit(
            opcode::POP,
            Op::PopRange,
            &[Arg::Reg(W8, reg::Y), Arg::Reg(W8, reg::B)],
        )
        .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::Y, W32), 0x5152_5354);
        assert_eq!(cpu.regs.get(reg::A, W8), 0x53);
        assert_eq!(cpu.stack.spr(), 0);
    }

    #[test]
    fn test_block_fill_stamp_and_copy() {
        let mut asm = Encoder::new();
        asm.emit(
            opcode::MEM,
            Op::Fill,
            &[Arg::Abs(W16, 0x3000), Arg::Imm(W16, 0xABCD), Arg::Imm(W24, 3)],
        )
        .unwrap();
        ld(&mut asm, Arg::Reg(W24, reg::D), Arg::Imm(W24, 3));
        asm.emit(
            opcode::MEM,
            Op::Stamp,
            &[
                Arg::Abs(W8, 0x4000),
                Arg::Imm(W8, 0x11),
                Arg::Imm(W24, 2),
                Arg::Reg(W24, reg::D),
            ],
        )
        .unwrap();
        asm.emit(
            opcode::MEM,
            Op::Copy,
            &[Arg::Abs(W8, 0x5000), Arg::Abs(W8, 0x3000), Arg::Imm(W24, 4)],
        )
        .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        let bytes = |start, count| -> Vec<u8> {
            cpu.mem.dump(start, count).into_iter().map(|(_, b)| b).collect()
        };
        assert_eq!(bytes(0x3000, 7), vec![0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD, 0x00]);
        assert_eq!(bytes(0x4000, 7), vec![0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x00]);
        assert_eq!(bytes(0x5000, 5), vec![0xAB, 0xCD, 0xAB, 0xCD, 0x00]);
    }

    #[test]
    fn test_fill_through_register_pointer_and_count() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W24, reg::A), Arg::Imm(W24, 0x6000));
        ld(&mut asm, Arg::Reg(W24, reg::D), Arg::Imm(W24, 2));
        asm.emit(
            opcode::MEM,
            Op::Fill,
            &[Arg::Ind(W32, reg::A), Arg::Imm(W32, 0x0102_0304), Arg::Reg(W24, reg::D)],
        )
        .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.mem.get_32(0x6000), 0x0102_0304);
        assert_eq!(cpu.mem.get_32(0x6004), 0x0102_0304);
        assert_eq!(cpu.mem.get_8(0x6008), 0);
    }

    #[test]
    fn test_narrowing_float_load() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::FReg(0), Arg::FImm(300.0));
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::FReg(0));
        halt(&mut asm);
        ld(&mut asm, Arg::FReg(1), Arg::FImm(12.4));
        ld(&mut asm, Arg::Reg(W8, reg::B), Arg::FReg(1));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();
        assert_eq!(cpu.regs.get(reg::A, W8), 255);
        assert!(cpu.flags.get(Flag::Overflow));

        cpu.state = CpuState::Running;
        cpu.run().unwrap();
        assert_eq!(cpu.regs.get(reg::B, W8), 12);
        assert!(!cpu.flags.get(Flag::Overflow));
    }

    #[test]
    fn test_integer_to_float_load_and_float_memory() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W32, reg::A), Arg::Imm(W32, 7));
        ld(&mut asm, Arg::FReg(3), Arg::Reg(W32, reg::A));
        ld(&mut asm, Arg::FAbs(0x700), Arg::FReg(3));
        ld(&mut asm, Arg::FReg(4), Arg::FAbs(0x700));
        asm.emit(opcode::MUL, Op::Mul, &[Arg::FReg(4), Arg::FImm(0.5)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.fregs.get(3), 7.0);
        assert_eq!(cpu.mem.get_float(0x700), 7.0);
        assert_eq!(cpu.fregs.get(4), 3.5);
    }

    #[test]
    fn test_float_added_to_integer_saturates() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 250));
        ld(&mut asm, Arg::FReg(0), Arg::FImm(10.0));
        asm.emit(opcode::ADD, Op::Add, &[Arg::Reg(W8, reg::A), Arg::FReg(0)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.regs.get(reg::A, W8), 255);
        assert!(cpu.flags.get(Flag::Overflow));
        assert!(!cpu.flags.get(Flag::Carry));
    }

    #[test]
    fn test_float_arithmetic_with_integer_source() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::FReg(2), Arg::FImm(1.25));
        ld(&mut asm, Arg::Reg(W16, reg::C), Arg::Imm(W16, 3));
        asm.emit(opcode::SUB, Op::Sub, &[Arg::FReg(2), Arg::Reg(W16, reg::C)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.fregs.get(2), -1.75);
        assert_eq!(cpu.flags.bits(), 0);
    }

    #[test]
    fn test_float_division_by_zero_reports() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::FReg(1), Arg::FImm(5.0));
        let div_at = asm.position();
        asm.emit(opcode::DIV, Op::Div, &[Arg::FReg(1), Arg::FReg(2)])
            .unwrap();
        let inv_at = asm.position();
        asm.emit(opcode::DIV, Op::Inv, &[Arg::FReg(2)]).unwrap();
        asm.emit(opcode::DIV, Op::Inv, &[Arg::FReg(3), Arg::FReg(1)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, recorder) = machine(&asm);

        cpu.run().unwrap();

        assert_eq!(cpu.fregs.get(1), 5.0);
        assert_eq!(cpu.fregs.get(2), 0.0);
        assert_eq!(cpu.fregs.get(3), 0.2);
        assert_eq!(
            recorder.errors(),
            vec![
                RuntimeError::DivisionByZero { address: div_at },
                RuntimeError::DivisionByZero { address: inv_at },
            ]
        );
    }

    #[test]
    fn test_float_compare_sets_flags() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::FReg(0), Arg::FImm(-1.0));
        asm.emit(opcode::CP, Op::Cp, &[Arg::FReg(0), Arg::FImm(2.0)])
            .unwrap();
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);

        cpu.run().unwrap();

        assert!(cpu.flags.get(Flag::Less));
        assert!(cpu.flags.get(Flag::Carry));
        assert!(cpu.flags.get(Flag::Sign));
        assert!(!cpu.flags.get(Flag::Parity));
    }

    #[test]
    fn test_illegal_opcode_stops_the_machine() {
        let mut asm = Encoder::new();
        asm.bare(opcode::NOP).unwrap().raw(&[0x77]);
        let (mut cpu, _) = machine(&asm);

        assert_eq!(
            cpu.run(),
            Err(CpuError::IllegalOpcode { opcode: 0x77, address: 1 })
        );
        assert_eq!(cpu.state, CpuState::Error);
        assert_eq!(cpu.step(), Err(CpuError::NotRunning(CpuState::Error)));
    }

    #[test]
    fn test_illegal_form() {
        let mut asm = Encoder::new();
        asm.raw(&[opcode::NAND, 40 << 2]);
        let (mut cpu, _) = machine(&asm);

        assert_eq!(
            cpu.step(),
            Err(CpuError::IllegalForm { opcode: opcode::NAND, index: 40, address: 0 })
        );
        assert_eq!(cpu.state, CpuState::Error);
    }

    #[test]
    fn test_run_limited() {
        let mut asm = Encoder::new();
        // JP 0: spin forever
        asm.emit(opcode::JP, Op::Jp(Cond::Always), &[Arg::Imm(W24, 0)])
            .unwrap();
        let (mut cpu, _) = machine(&asm);

        assert_eq!(cpu.run_limited(100).unwrap(), 100);
        assert!(cpu.is_running());
        assert_eq!(cpu.ipo, 0);
    }

    #[test]
    fn test_origin_and_reset() {
        let config = MachineConfig {
            origin: 0x1000,
            error_handler: 0x2000,
            ..MachineConfig::default()
        };
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 9));
        halt(&mut asm);
        let (mut cpu, _) = machine_with(config, &asm);

        assert_eq!(cpu.ipo, 0x1000);
        cpu.run().unwrap();
        assert_eq!(cpu.regs.get(reg::A, W8), 9);

        cpu.reset();
        assert_eq!(cpu.ipo, 0x1000);
        assert_eq!(cpu.regs.get(reg::A, W8), 0);
        assert_eq!(cpu.mem.get_8(0x1000), 0);
        assert_eq!(cpu.hmem.error_handler(), 0x2000);
        assert!(cpu.is_running());
    }

    #[test]
    fn test_last_executed_and_display() {
        let mut asm = Encoder::new();
        asm.emit(opcode::ADD, Op::Add, &[Arg::Reg(W16, reg::B), Arg::Reg(W16, reg::D)])
            .unwrap();
        let (mut cpu, _) = machine(&asm);

        let executed = cpu.step().unwrap();
        assert_eq!(cpu.last_executed(), Some(executed));
        assert_eq!(executed.to_string(), "000000: ADD BC, DE");
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut asm = Encoder::new();
        ld(&mut asm, Arg::Reg(W8, reg::A), Arg::Imm(W8, 1));
        halt(&mut asm);
        let (mut cpu, _) = machine(&asm);
        cpu.run().unwrap();

        let snapshot = cpu.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"Halted\""));

        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
