//! Instruction-set description.
//!
//! Every instruction family is a table of [`Form`]s. A form names the
//! operation to run and the shapes of its operands, so operand decoding is
//! done once, generically, by [`crate::cpu::decode`]. The tables below are
//! the wire contract: the position of a form inside its family is the form
//! index carried in the upper six bits of the mode byte.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::cpu::registers::{Flag, Flags};

/// Primary opcode bytes.
pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const LD: u8 = 0x01;
    pub const ST: u8 = 0x02;
    pub const MEM: u8 = 0x03;
    pub const ADD: u8 = 0x04;
    pub const SUB: u8 = 0x05;
    pub const MUL: u8 = 0x06;
    pub const DIV: u8 = 0x07;
    pub const SDIV: u8 = 0x08;
    pub const CP: u8 = 0x09;
    pub const NAND: u8 = 0x0A;
    pub const XNOR: u8 = 0x0B;
    pub const IMPLY: u8 = 0x0C;
    pub const PUSH: u8 = 0x0D;
    pub const POP: u8 = 0x0E;
    pub const DJNZ: u8 = 0x0F;
    pub const JP: u8 = 0x10;
    pub const CALL: u8 = 0x11;
    pub const RET: u8 = 0x12;
    pub const HALT: u8 = 0xFF;
}

/// Maximum number of forms a moded family can hold (six index bits).
pub const MAX_FORMS: usize = 64;

/// Integer operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W24,
    W32,
}

impl Width {
    pub const ALL: [Width; 4] = [Width::W8, Width::W16, Width::W24, Width::W32];

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W24 => 24,
            Width::W32 => 32,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// All-ones value of this width; also the largest unsigned value.
    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W24 => 0xFF_FFFF,
            Width::W32 => u32::MAX,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    /// Keep the low `bits()` bits of a widened value.
    #[inline]
    pub const fn truncate(self, value: u64) -> u32 {
        (value & self.mask() as u64) as u32
    }

    #[inline]
    pub const fn is_negative(self, value: u32) -> bool {
        value & self.sign_bit() != 0
    }

    /// Interpret the low `bits()` bits as a two's complement number.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> i32 {
        let shift = 32 - self.bits();
        ((value << shift) as i32) >> shift
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Signed displacement added to a memory operand's base address.
/// The displacement value always comes from a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disp {
    None,
    R8,
    R16,
    R24,
}

impl Disp {
    pub const ALL: [Disp; 4] = [Disp::None, Disp::R8, Disp::R16, Disp::R24];

    pub const fn width(self) -> Option<Width> {
        match self {
            Disp::None => None,
            Disp::R8 => Some(Width::W8),
            Disp::R16 => Some(Width::W16),
            Disp::R24 => Some(Width::W24),
        }
    }
}

/// How a memory operand's base address is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    /// 24-bit address in the instruction stream.
    Abs(Disp),
    /// 24-bit address held in a register.
    Ind(Disp),
}

const ABS: Addr = Addr::Abs(Disp::None);
const IND: Addr = Addr::Ind(Disp::None);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, disp) = match self {
            Addr::Abs(d) => ("addr", d),
            Addr::Ind(d) => ("r24", d),
        };
        match disp.width() {
            Some(w) => write!(f, "({base}+r{w})"),
            None => write!(f, "({base})"),
        }
    }
}

/// Operand shape: what the decoder must consume and what it resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Reg(Width),
    Imm(Width),
    Mem(Width, Addr),
    FReg,
    FImm,
    FMem(Addr),
}

impl Shape {
    /// Register shapes are the ones eligible for the packed register pair.
    pub const fn is_register(self) -> bool {
        matches!(self, Shape::Reg(_) | Shape::FReg)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Reg(w) => write!(f, "r{w}"),
            Shape::Imm(w) => write!(f, "n{w}"),
            Shape::Mem(w, a) => write!(f, "{a}:{w}"),
            Shape::FReg => write!(f, "f"),
            Shape::FImm => write!(f, "fn"),
            Shape::FMem(a) => write!(f, "{a}:f"),
        }
    }
}

/// Branch condition evaluated against the flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Always,
    Z,
    NZ,
    C,
    NC,
    SN,
    SP,
    OV,
    NO,
    PO,
    NPO,
    EQ,
    NE,
    GT,
    GTE,
    LT,
    LTE,
}

impl Cond {
    pub const ALL: [Cond; 17] = [
        Cond::Always,
        Cond::Z,
        Cond::NZ,
        Cond::C,
        Cond::NC,
        Cond::SN,
        Cond::SP,
        Cond::OV,
        Cond::NO,
        Cond::PO,
        Cond::NPO,
        Cond::EQ,
        Cond::NE,
        Cond::GT,
        Cond::GTE,
        Cond::LT,
        Cond::LTE,
    ];

    pub fn holds(self, flags: &Flags) -> bool {
        match self {
            Cond::Always => true,
            Cond::Z => flags.get(Flag::Zero),
            Cond::NZ => !flags.get(Flag::Zero),
            Cond::C => flags.get(Flag::Carry),
            Cond::NC => !flags.get(Flag::Carry),
            Cond::SN => flags.get(Flag::Sign),
            Cond::SP => !flags.get(Flag::Sign),
            Cond::OV => flags.get(Flag::Overflow),
            Cond::NO => !flags.get(Flag::Overflow),
            Cond::PO => flags.get(Flag::Parity),
            Cond::NPO => !flags.get(Flag::Parity),
            Cond::EQ => flags.get(Flag::Equal),
            Cond::NE => !flags.get(Flag::Equal),
            Cond::GT => flags.get(Flag::Greater),
            Cond::GTE => flags.get(Flag::Greater) || flags.get(Flag::Equal),
            Cond::LT => flags.get(Flag::Less),
            Cond::LTE => flags.get(Flag::Less) || flags.get(Flag::Equal),
        }
    }
}

/// Operation tag selected by a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Nop,
    Halt,
    Ret,
    Ld,
    Fill,
    Stamp,
    Copy,
    Add,
    Sub,
    Mul,
    Div,
    DivRem,
    SDiv,
    SDivRem,
    Inv,
    Cp,
    Nand,
    Xnor,
    Imply,
    Push,
    Pop,
    PushRange,
    PopRange,
    Djnz,
    Jp(Cond),
    Call,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Nop => "NOP",
            Op::Halt => "HALT",
            Op::Ret => "RET",
            Op::Ld => "LD",
            Op::Fill => "FILL",
            Op::Stamp => "STAMP",
            Op::Copy => "COPY",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div | Op::DivRem => "DIV",
            Op::SDiv | Op::SDivRem => "SDIV",
            Op::Inv => "INV",
            Op::Cp => "CP",
            Op::Nand => "NAND",
            Op::Xnor => "XNOR",
            Op::Imply => "IMPLY",
            Op::Push | Op::PushRange => "PUSH",
            Op::Pop | Op::PopRange => "POP",
            Op::Djnz => "DJNZ",
            Op::Jp(_) => "JP",
            Op::Call => "CALL",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Jp(Cond::Always) => f.write_str("JP"),
            Op::Jp(cond) => write!(f, "JP {cond:?}"),
            op => f.write_str(op.mnemonic()),
        }
    }
}

/// One table entry: operation plus operand shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    pub op: Op,
    pub shapes: Vec<Shape>,
    /// The first two operands share the mode byte and one continuation byte.
    pub packed: bool,
}

impl Form {
    pub fn new(op: Op, shapes: Vec<Shape>) -> Self {
        let packed = shapes.len() >= 2 && shapes[0].is_register() && shapes[1].is_register();
        Self { op, shapes, packed }
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        let separator = match self.op {
            Op::PushRange | Op::PopRange => " .. ",
            _ => ", ",
        };
        for (i, shape) in self.shapes.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { separator })?;
            write!(f, "{shape}")?;
        }
        Ok(())
    }
}

/// What follows the primary opcode byte.
#[derive(Debug, Clone)]
pub enum FamilyBody {
    /// Single-byte instruction.
    Bare(Op),
    /// A mode byte selects one of the forms.
    Moded(Vec<Form>),
}

/// An instruction family, keyed by its primary opcode.
#[derive(Debug, Clone)]
pub struct Family {
    pub opcode: u8,
    pub name: &'static str,
    pub body: FamilyBody,
}

impl Family {
    pub fn forms(&self) -> &[Form] {
        match &self.body {
            FamilyBody::Bare(_) => &[],
            FamilyBody::Moded(forms) => forms,
        }
    }

    pub fn form(&self, index: u8) -> Option<&Form> {
        self.forms().get(index as usize)
    }

    /// Index of the form running `op` over exactly these shapes.
    pub fn position(&self, op: Op, shapes: &[Shape]) -> Option<u8> {
        self.forms()
            .iter()
            .position(|form| form.op == op && form.shapes == shapes)
            .map(|index| index as u8)
    }
}

/// The complete dispatch structure: 256 primary opcode slots.
#[derive(Debug)]
pub struct InstructionSet {
    families: Vec<Option<Family>>,
}

static INSTRUCTION_SET: OnceLock<InstructionSet> = OnceLock::new();

impl InstructionSet {
    /// The shared, immutable instruction set.
    pub fn get() -> &'static InstructionSet {
        INSTRUCTION_SET.get_or_init(InstructionSet::build)
    }

    pub fn family(&self, opcode: u8) -> Option<&Family> {
        self.families[opcode as usize].as_ref()
    }

    pub fn by_name(&self, name: &str) -> Option<&Family> {
        self.families().find(|family| family.name.eq_ignore_ascii_case(name))
    }

    pub fn families(&self) -> impl Iterator<Item = &Family> {
        self.families.iter().flatten()
    }

    fn build() -> Self {
        let mut set = Self {
            families: vec![None; 256],
        };

        set.bare(opcode::NOP, "NOP", Op::Nop);
        set.bare(opcode::RET, "RET", Op::Ret);
        set.bare(opcode::HALT, "HALT", Op::Halt);

        set.moded(opcode::LD, "LD", load_forms());
        set.moded(opcode::ST, "ST", store_forms());
        set.moded(opcode::MEM, "MEM", block_forms());
        set.moded(opcode::ADD, "ADD", add_sub_forms(Op::Add));
        set.moded(opcode::SUB, "SUB", add_sub_forms(Op::Sub));
        set.moded(opcode::MUL, "MUL", [integer_matrix(Op::Mul), float_forms(Op::Mul)].concat());
        set.moded(opcode::DIV, "DIV", div_forms());
        set.moded(opcode::SDIV, "SDIV", sdiv_forms());
        set.moded(opcode::CP, "CP", [integer_matrix(Op::Cp), float_forms(Op::Cp)].concat());
        set.moded(opcode::NAND, "NAND", integer_matrix(Op::Nand));
        set.moded(opcode::XNOR, "XNOR", integer_matrix(Op::Xnor));
        set.moded(opcode::IMPLY, "IMPLY", integer_matrix(Op::Imply));
        set.moded(opcode::PUSH, "PUSH", push_forms());
        set.moded(opcode::POP, "POP", pop_forms());
        set.moded(opcode::DJNZ, "DJNZ", djnz_forms());
        set.moded(opcode::JP, "JP", jump_forms());
        set.moded(
            opcode::CALL,
            "CALL",
            vec![
                Form::new(Op::Call, vec![Shape::Imm(Width::W24)]),
                Form::new(Op::Call, vec![Shape::Reg(Width::W24)]),
            ],
        );

        set
    }

    fn bare(&mut self, opcode: u8, name: &'static str, op: Op) {
        self.families[opcode as usize] = Some(Family {
            opcode,
            name,
            body: FamilyBody::Bare(op),
        });
    }

    fn moded(&mut self, opcode: u8, name: &'static str, forms: Vec<Form>) {
        debug_assert!(forms.len() <= MAX_FORMS, "{name} has {} forms", forms.len());
        self.families[opcode as usize] = Some(Family {
            opcode,
            name,
            body: FamilyBody::Moded(forms),
        });
    }
}

/// The addressing matrix shared by every two-operand integer family.
/// Index = width * 8 + shape.
fn integer_matrix(op: Op) -> Vec<Form> {
    let mut forms = Vec::with_capacity(32);
    for w in Width::ALL {
        forms.push(Form::new(op, vec![Shape::Reg(w), Shape::Imm(w)]));
        forms.push(Form::new(op, vec![Shape::Reg(w), Shape::Reg(w)]));
        forms.push(Form::new(op, vec![Shape::Reg(w), Shape::Mem(w, ABS)]));
        forms.push(Form::new(op, vec![Shape::Reg(w), Shape::Mem(w, IND)]));
        forms.push(Form::new(op, vec![Shape::Mem(w, ABS), Shape::Imm(w)]));
        forms.push(Form::new(op, vec![Shape::Mem(w, ABS), Shape::Reg(w)]));
        forms.push(Form::new(op, vec![Shape::Mem(w, IND), Shape::Imm(w)]));
        forms.push(Form::new(op, vec![Shape::Mem(w, IND), Shape::Reg(w)]));
    }
    forms
}

/// Float destination with float register, immediate or memory source.
fn float_forms(op: Op) -> Vec<Form> {
    vec![
        Form::new(op, vec![Shape::FReg, Shape::FReg]),
        Form::new(op, vec![Shape::FReg, Shape::FImm]),
        Form::new(op, vec![Shape::FReg, Shape::FMem(ABS)]),
        Form::new(op, vec![Shape::FReg, Shape::FMem(IND)]),
    ]
}

fn add_sub_forms(op: Op) -> Vec<Form> {
    let mut forms = integer_matrix(op);
    forms.extend(float_forms(op));
    for w in Width::ALL {
        forms.push(Form::new(op, vec![Shape::FReg, Shape::Reg(w)]));
    }
    for w in Width::ALL {
        forms.push(Form::new(op, vec![Shape::Reg(w), Shape::FReg]));
    }
    forms
}

fn div_forms() -> Vec<Form> {
    let mut forms = integer_matrix(Op::Div);
    for w in Width::ALL {
        forms.push(Form::new(Op::DivRem, vec![Shape::Reg(w), Shape::Imm(w), Shape::Reg(w)]));
        forms.push(Form::new(Op::DivRem, vec![Shape::Reg(w), Shape::Reg(w), Shape::Reg(w)]));
    }
    forms.extend(float_forms(Op::Div));
    forms.push(Form::new(Op::Inv, vec![Shape::FReg]));
    forms.push(Form::new(Op::Inv, vec![Shape::FReg, Shape::FReg]));
    forms
}

fn sdiv_forms() -> Vec<Form> {
    let mut forms = Vec::with_capacity(16);
    for w in Width::ALL {
        forms.push(Form::new(Op::SDiv, vec![Shape::Reg(w), Shape::Imm(w)]));
        forms.push(Form::new(Op::SDiv, vec![Shape::Reg(w), Shape::Reg(w)]));
        forms.push(Form::new(Op::SDivRem, vec![Shape::Reg(w), Shape::Imm(w), Shape::Reg(w)]));
        forms.push(Form::new(Op::SDivRem, vec![Shape::Reg(w), Shape::Reg(w), Shape::Reg(w)]));
    }
    forms
}

fn load_forms() -> Vec<Form> {
    let mut forms = Vec::with_capacity(52);
    for w in Width::ALL {
        forms.push(Form::new(Op::Ld, vec![Shape::Reg(w), Shape::Imm(w)]));
        forms.push(Form::new(Op::Ld, vec![Shape::Reg(w), Shape::Reg(w)]));
        for d in Disp::ALL {
            forms.push(Form::new(Op::Ld, vec![Shape::Reg(w), Shape::Mem(w, Addr::Abs(d))]));
        }
        for d in Disp::ALL {
            forms.push(Form::new(Op::Ld, vec![Shape::Reg(w), Shape::Mem(w, Addr::Ind(d))]));
        }
    }
    forms.push(Form::new(Op::Ld, vec![Shape::FReg, Shape::FImm]));
    forms.push(Form::new(Op::Ld, vec![Shape::FReg, Shape::FReg]));
    forms.push(Form::new(Op::Ld, vec![Shape::FReg, Shape::FMem(ABS)]));
    forms.push(Form::new(Op::Ld, vec![Shape::FReg, Shape::FMem(IND)]));
    for w in Width::ALL {
        forms.push(Form::new(Op::Ld, vec![Shape::FReg, Shape::Reg(w)]));
    }
    for w in Width::ALL {
        forms.push(Form::new(Op::Ld, vec![Shape::Reg(w), Shape::FReg]));
    }
    forms
}

fn store_forms() -> Vec<Form> {
    let mut forms = Vec::with_capacity(48);
    for w in Width::ALL {
        for d in Disp::ALL {
            forms.push(Form::new(Op::Ld, vec![Shape::Mem(w, Addr::Abs(d)), Shape::Reg(w)]));
        }
        for d in Disp::ALL {
            forms.push(Form::new(Op::Ld, vec![Shape::Mem(w, Addr::Ind(d)), Shape::Reg(w)]));
        }
        forms.push(Form::new(Op::Ld, vec![Shape::Mem(w, ABS), Shape::Imm(w)]));
        forms.push(Form::new(Op::Ld, vec![Shape::Mem(w, IND), Shape::Imm(w)]));
        forms.push(Form::new(Op::Ld, vec![Shape::Mem(w, ABS), Shape::Mem(w, ABS)]));
    }
    forms.push(Form::new(Op::Ld, vec![Shape::FMem(ABS), Shape::FReg]));
    forms.push(Form::new(Op::Ld, vec![Shape::FMem(IND), Shape::FReg]));
    forms.push(Form::new(Op::Ld, vec![Shape::FMem(ABS), Shape::FImm]));
    forms.push(Form::new(Op::Ld, vec![Shape::FMem(IND), Shape::FImm]));
    forms
}

fn block_forms() -> Vec<Form> {
    let count = [Shape::Imm(Width::W24), Shape::Reg(Width::W24)];
    let mut forms = Vec::with_capacity(27);
    for w in Width::ALL {
        for base in [ABS, IND] {
            for n in count {
                forms.push(Form::new(Op::Fill, vec![Shape::Mem(w, base), Shape::Imm(w), n]));
            }
        }
    }
    for w in Width::ALL {
        for base in [ABS, IND] {
            forms.push(Form::new(
                Op::Stamp,
                vec![Shape::Mem(w, base), Shape::Imm(w), count[0], Shape::Reg(Width::W24)],
            ));
        }
    }
    let byte = |addr| Shape::Mem(Width::W8, addr);
    forms.push(Form::new(Op::Copy, vec![byte(ABS), byte(ABS), count[0]]));
    forms.push(Form::new(Op::Copy, vec![byte(IND), byte(IND), count[0]]));
    forms.push(Form::new(Op::Copy, vec![byte(IND), byte(IND), count[1]]));
    forms
}

fn push_forms() -> Vec<Form> {
    let mut forms: Vec<Form> = Width::ALL
        .iter()
        .map(|&w| Form::new(Op::Push, vec![Shape::Reg(w)]))
        .collect();
    forms.push(Form::new(Op::Push, vec![Shape::FReg]));
    forms.push(Form::new(Op::PushRange, vec![Shape::Reg(Width::W8), Shape::Reg(Width::W8)]));
    forms.push(Form::new(Op::PushRange, vec![Shape::FReg, Shape::FReg]));
    for w in Width::ALL {
        forms.push(Form::new(Op::Push, vec![Shape::Imm(w)]));
    }
    forms
}

fn pop_forms() -> Vec<Form> {
    let mut forms: Vec<Form> = Width::ALL
        .iter()
        .map(|&w| Form::new(Op::Pop, vec![Shape::Reg(w)]))
        .collect();
    forms.push(Form::new(Op::Pop, vec![Shape::FReg]));
    forms.push(Form::new(Op::PopRange, vec![Shape::Reg(Width::W8), Shape::Reg(Width::W8)]));
    forms.push(Form::new(Op::PopRange, vec![Shape::FReg, Shape::FReg]));
    forms
}

fn djnz_forms() -> Vec<Form> {
    let targets = [Shape::Imm(Width::W24), Shape::Reg(Width::W24)];
    let mut forms = Vec::with_capacity(24);
    for w in Width::ALL {
        for counter in [Shape::Reg(w), Shape::Mem(w, ABS), Shape::Mem(w, IND)] {
            for target in targets {
                forms.push(Form::new(Op::Djnz, vec![counter, target]));
            }
        }
    }
    forms
}

fn jump_forms() -> Vec<Form> {
    Cond::ALL
        .iter()
        .flat_map(|&cond| {
            [
                Form::new(Op::Jp(cond), vec![Shape::Imm(Width::W24)]),
                Form::new(Op::Jp(cond), vec![Shape::Reg(Width::W24)]),
            ]
        })
        .collect()
}
