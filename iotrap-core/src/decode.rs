//! Decoder for the faulting host instruction.
//!
//! Only the handful of load/store encodings a compiler emits for a plain memory access through a
//! pointer are recognized. Anything else is rejected rather than guessed at: resuming after a
//! misdecoded instruction would corrupt the guest beyond repair.

use crate::registers::RegisterIndex;
use crate::Width;
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::trace;
use std::fmt;
use thiserror::Error;

/// Upper bound on the length of a single host instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

const OPERAND_SIZE_PREFIX: u8 = 0x66;
const TWO_BYTE_ESCAPE: u8 = 0x0F;

const RM_SIB: u8 = 0b100;
const RM_DISP32: u8 = 0b101;
const SIB_BASE_NONE: u8 = 0b101;

/// What the faulting instruction does with its memory operand.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Operation {
    /// `movzx r, m8`
    ZeroExtendByte,
    /// `movzx r, m16`
    ZeroExtendWord,
    /// `movsx r, m8`
    SignExtendByte,
    /// `mov r8, m8` / `mov m8, r8`
    MoveByte,
    /// `mov r, m` / `mov m, r` at word or long width.
    Move,
    /// `mov m8, imm8`
    MoveImmediateByte,
    /// `or r8, m8` / `or m8, r8`
    OrByte,
    /// `and r8, m8`
    AndByte,
    /// `add r8, m8`
    AddByte,
    /// `cmp r8, m8`
    CompareByte,
}

impl Operation {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::ZeroExtendByte | Self::ZeroExtendWord => "movzx",
            Self::SignExtendByte => "movsx",
            Self::MoveByte | Self::Move | Self::MoveImmediateByte => "mov",
            Self::OrByte => "or",
            Self::AndByte => "and",
            Self::AddByte => "add",
            Self::CompareByte => "cmp",
        }
    }
}

/// Direction of the transfer between the hardware and the register.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    /// The hardware is read and the result lands in (or is combined with) a register.
    Load,
    /// The hardware is written.
    Store,
}

/// Decoded facts about the faulting instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct InstructionDescriptor {
    pub operation: Operation,
    /// Width of the register operand. Only byte-sized for the byte operations.
    pub width: Width,
    pub direction: Direction,
    /// ModR/M register field.
    pub register: RegisterIndex,
    /// Literal operand of [`Operation::MoveImmediateByte`].
    pub immediate: Option<u8>,
    /// Total encoded length in bytes, prefix included.
    pub length: usize,
}

impl InstructionDescriptor {
    /// Decode the instruction starting at `bytes[0]`.
    ///
    /// `bytes` may extend past the end of the instruction. It must at least cover the whole
    /// instruction, otherwise [`DecodeError::Truncated`] is returned.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);

        let mut default_width = Width::Long;
        let mut opcode = cursor.next()?;
        if opcode == OPERAND_SIZE_PREFIX {
            trace!("Operand-size prefix, narrowing operand to a word");
            default_width = Width::Word;
            opcode = cursor.next()?;
        }

        let (operation, direction, operand) = if opcode == TWO_BYTE_ESCAPE {
            let secondary = cursor.next()?;
            two_byte_opcode(secondary).ok_or(DecodeError::UnknownExtendedOpcode(secondary))?
        } else {
            one_byte_opcode(opcode).ok_or(DecodeError::UnknownOpcode(opcode))?
        };

        let modrm = ModRm(cursor.next()?);
        skip_addressing(modrm, &mut cursor)?;

        let immediate = match operation {
            Operation::MoveImmediateByte => Some(cursor.next()?),
            _ => None,
        };

        Ok(Self {
            operation,
            width: match operand {
                Operand::Byte => Width::Byte,
                Operand::Sized => default_width,
            },
            direction,
            register: RegisterIndex::from_u3(modrm.reg()),
            immediate,
            length: cursor.position(),
        })
    }

    /// Width of the access on the hardware side.
    pub fn bus_width(&self) -> Width {
        match self.operation {
            Operation::ZeroExtendWord => Width::Word,
            Operation::Move => self.width,
            _ => Width::Byte,
        }
    }
}

impl fmt::Display for InstructionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let register = self.width.bytes() * 8;
        let memory = self.bus_width().bytes() * 8;
        write!(f, "{} ", self.operation.mnemonic())?;
        match (self.direction, self.immediate) {
            (Direction::Load, _) => write!(f, "r{register}, m{memory}")?,
            (Direction::Store, Some(immediate)) => write!(f, "m{memory}, {immediate:#04x}")?,
            (Direction::Store, None) => write!(f, "m{memory}, r{register}")?,
        }
        write!(f, " ({}, {} bytes)", self.register, self.length)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("unknown opcode 0x0f {0:#04x}")]
    UnknownExtendedOpcode(u8),
    #[error("ModR/M byte {0:#04x} names a register instead of memory")]
    RegisterOperand(u8),
    #[error("instruction extends past the {0} available bytes")]
    Truncated(usize),
}

/// Whether the register operand follows the operand-size prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Operand {
    Byte,
    Sized,
}

fn one_byte_opcode(opcode: u8) -> Option<(Operation, Direction, Operand)> {
    match opcode {
        0x02 => Some((Operation::AddByte, Direction::Load, Operand::Byte)),
        0x08 => Some((Operation::OrByte, Direction::Store, Operand::Byte)),
        0x0A => Some((Operation::OrByte, Direction::Load, Operand::Byte)),
        0x22 => Some((Operation::AndByte, Direction::Load, Operand::Byte)),
        0x3A => Some((Operation::CompareByte, Direction::Load, Operand::Byte)),
        0x88 => Some((Operation::MoveByte, Direction::Store, Operand::Byte)),
        0x89 => Some((Operation::Move, Direction::Store, Operand::Sized)),
        0x8A => Some((Operation::MoveByte, Direction::Load, Operand::Byte)),
        0x8B => Some((Operation::Move, Direction::Load, Operand::Sized)),
        0xC6 => Some((Operation::MoveImmediateByte, Direction::Store, Operand::Byte)),
        _ => None,
    }
}

fn two_byte_opcode(opcode: u8) -> Option<(Operation, Direction, Operand)> {
    match opcode {
        0xB6 => Some((Operation::ZeroExtendByte, Direction::Load, Operand::Sized)),
        0xB7 => Some((Operation::ZeroExtendWord, Direction::Load, Operand::Sized)),
        0xBE => Some((Operation::SignExtendByte, Direction::Load, Operand::Sized)),
        _ => None,
    }
}

/// Advance `cursor` past the SIB byte and displacement selected by `modrm`.
fn skip_addressing(modrm: ModRm, cursor: &mut Cursor<'_>) -> Result<(), DecodeError> {
    let mode = modrm.mode();
    let mut displacement = match mode {
        Mode::Indirect if modrm.rm() == RM_DISP32 => 4,
        Mode::Indirect => 0,
        Mode::IndirectDisp8 => 1,
        Mode::IndirectDisp32 => 4,
        // A register operand never touches memory, so it cannot have faulted.
        Mode::Direct => return Err(DecodeError::RegisterOperand(modrm.0)),
    };

    if modrm.rm() == RM_SIB {
        let sib = Sib(cursor.next()?);
        if mode == Mode::Indirect && sib.base() == SIB_BASE_NONE {
            displacement = 4;
        }
    }

    cursor.skip(displacement)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Mode {
    Indirect,
    IndirectDisp8,
    IndirectDisp32,
    Direct,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct ModRm(u8);

impl ModRm {
    fn mode(self) -> Mode {
        match self.0.view_bits::<Lsb0>()[6..8].load::<u8>() {
            0b00 => Mode::Indirect,
            0b01 => Mode::IndirectDisp8,
            0b10 => Mode::IndirectDisp32,
            _ => Mode::Direct,
        }
    }

    fn reg(self) -> u8 {
        self.0.view_bits::<Lsb0>()[3..6].load()
    }

    fn rm(self) -> u8 {
        self.0.view_bits::<Lsb0>()[0..3].load()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Sib(u8);

impl Sib {
    fn base(self) -> u8 {
        self.0.view_bits::<Lsb0>()[0..3].load()
    }
}

/// Tracks how many instruction bytes have been consumed.
#[derive(Debug)]
struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn next(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.position)
            .ok_or(DecodeError::Truncated(self.bytes.len()))?;
        self.position += 1;
        Ok(byte)
    }

    fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        if self.bytes.len() - self.position < count {
            return Err(DecodeError::Truncated(self.bytes.len()));
        }
        self.position += count;
        Ok(())
    }

    fn position(&self) -> usize {
        self.position
    }
}
