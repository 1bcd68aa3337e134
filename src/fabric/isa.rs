use std::fmt;

use super::error::TaskError;

/// Reserved all-ones word that ends a program.
pub const HALT: u32 = 0xFFFF_FFFF;

const SEGMENT_MASK: u32 = 0xFFF0_0000;
const OFFSET_MASK: u32 = 0x000F_F000;
const OPCODE_MASK: u32 = 0x0000_0F00;
const IMM_MASK: u32 = 0x0000_00FF;

/// Byte arithmetic understood by the engine. Every operation works on the
/// fetched byte and the instruction's immediate and wraps modulo 256.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
    Mod = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = TaskError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Add),
            2 => Ok(Opcode::Sub),
            3 => Ok(Opcode::Mul),
            4 => Ok(Opcode::Div),
            5 => Ok(Opcode::Mod),
            other => Err(TaskError::UnknownOpcode(other)),
        }
    }
}

impl Opcode {
    pub const ALL: [Opcode; 5] =
        [Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div, Opcode::Mod];

    pub fn apply(self, value: u8, imm: u8) -> Result<u8, TaskError> {
        match self {
            Opcode::Add => Ok(value.wrapping_add(imm)),
            Opcode::Sub => Ok(value.wrapping_sub(imm)),
            Opcode::Mul => Ok(value.wrapping_mul(imm)),
            Opcode::Div => value.checked_div(imm).ok_or(TaskError::DivisionByZero),
            Opcode::Mod => value.checked_rem(imm).ok_or(TaskError::DivisionByZero),
        }
    }
}

/// A decoded instruction word.
///
/// Layout, most significant bit first:
///
/// - 12 bits: index of the task segment to operate on
/// - 8 bits: byte offset inside that segment's line
/// - 4 bits: opcode
/// - 8 bits: immediate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub segment: u16,
    pub offset: u8,
    pub imm: u8,
}

impl Instruction {
    pub fn new(op: Opcode, segment: u16, offset: u8, imm: u8) -> Self {
        Self {
            op,
            segment,
            offset,
            imm,
        }
    }

    /// Packs the instruction into a word. Segment indices wider than 12 bits
    /// are truncated.
    pub fn encode(&self) -> u32 {
        ((self.segment as u32) << 20) & SEGMENT_MASK
            | (self.offset as u32) << 12
            | (self.op as u32) << 8
            | self.imm as u32
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} seg{}[{}] {:#04X}",
            self.op, self.segment, self.offset, self.imm
        )
    }
}

/// One step of a program: either an instruction or the end marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Word {
    Exec(Instruction),
    Halt,
}

impl Word {
    pub fn decode(word: u32) -> Result<Self, TaskError> {
        if word == HALT {
            return Ok(Word::Halt);
        }
        let op = Opcode::try_from(((word & OPCODE_MASK) >> 8) as u8)?;
        Ok(Word::Exec(Instruction {
            op,
            segment: ((word & SEGMENT_MASK) >> 20) as u16,
            offset: ((word & OFFSET_MASK) >> 12) as u8,
            imm: (word & IMM_MASK) as u8,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_default_program() {
        assert_eq!(
            Word::decode(0x0000_0145),
            Ok(Word::Exec(Instruction::new(Opcode::Add, 0, 0, 0x45)))
        );
        assert_eq!(
            Word::decode(0x0000_2120),
            Ok(Word::Exec(Instruction::new(Opcode::Add, 0, 2, 0x20)))
        );
        assert_eq!(
            Word::decode(0x0000_A130),
            Ok(Word::Exec(Instruction::new(Opcode::Add, 0, 10, 0x30)))
        );
        assert_eq!(Word::decode(HALT), Ok(Word::Halt));
    }

    #[test]
    fn fields_land_in_their_bits() {
        let word = Instruction::new(Opcode::Mod, 0xABC, 0xDE, 0x7F).encode();
        assert_eq!(word, 0xABCD_E57F);
        assert_eq!(
            Word::decode(word),
            Ok(Word::Exec(Instruction::new(Opcode::Mod, 0xABC, 0xDE, 0x7F)))
        );
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        for op in [0u32, 6, 9, 0xF] {
            assert_eq!(
                Word::decode(op << 8),
                Err(TaskError::UnknownOpcode(op as u8))
            );
        }
        // all ones apart from the immediate is not the halt word
        assert_eq!(
            Word::decode(0xFFFF_FF00),
            Err(TaskError::UnknownOpcode(0xF))
        );
    }

    #[test]
    fn arithmetic_wraps_at_byte_width() {
        assert_eq!(Opcode::Add.apply(250, 10), Ok(4));
        assert_eq!(Opcode::Sub.apply(5, 10), Ok(251));
        assert_eq!(Opcode::Mul.apply(16, 17), Ok(16));
        assert_eq!(Opcode::Div.apply(200, 7), Ok(28));
        assert_eq!(Opcode::Mod.apply(200, 7), Ok(4));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(Opcode::Div.apply(9, 0), Err(TaskError::DivisionByZero));
        assert_eq!(Opcode::Mod.apply(0, 0), Err(TaskError::DivisionByZero));
    }
}
