use crate::DecodeError;
use std::fmt;
use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator, IntoStaticStr};
use thiserror::Error;

/// The discriminant is the byte written to the code stream; the order is
/// part of the object format.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    EnumCount,
    FromRepr,
    IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Opcode {
    Halt,

    IAdd,
    ISub,
    IMul,
    IDiv,
    SAdd,

    Or,
    And,
    INeg,
    Not,

    I2s,

    IEq,
    INeq,
    ILt,
    ILe,
    IGt,
    IGe,
    SEq,
    SNeq,
    SGt,
    SGe,
    SLt,
    SLe,

    Br,
    Brf,

    IConst,
    SConst,

    Load,
    Store,
    SIndex,

    Pop,
    Call,
    Locals,
    Ret,

    Print,
    SLen,
    SFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandWidth {
    Short,
    Word,
}

impl OperandWidth {
    pub fn bytes(self) -> usize {
        match self {
            OperandWidth::Short => 2,
            OperandWidth::Word => 4,
        }
    }

    pub fn fits(self, value: i32) -> bool {
        match self {
            OperandWidth::Short => i16::try_from(value).is_ok(),
            OperandWidth::Word => true,
        }
    }
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::iter().find(|opcode| opcode.mnemonic() == name)
    }

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Opcode::from_repr(byte)
    }

    pub fn operand_widths(self) -> &'static [OperandWidth] {
        use OperandWidth::*;
        match self {
            Opcode::Br | Opcode::Brf | Opcode::IConst => &[Word],
            Opcode::SConst
            | Opcode::Load
            | Opcode::Store
            | Opcode::Locals
            | Opcode::SFree => &[Short],
            Opcode::Call => &[Word, Short],
            _ => &[],
        }
    }

    pub fn operand_count(self) -> usize {
        self.operand_widths().len()
    }

    pub fn size(self) -> usize {
        1 + self
            .operand_widths()
            .iter()
            .map(|width| width.bytes())
            .sum::<usize>()
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Br | Opcode::Brf | Opcode::Call)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("operand mismatch; expecting {expected}, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("operand {value} does not fit in {bytes} bytes")]
    OutOfRange { value: i32, bytes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    opcode: Opcode,
    operands: [i32; 2],
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: &[i32]) -> Result<Self, EncodeError> {
        let widths = opcode.operand_widths();
        if operands.len() != widths.len() {
            return Err(EncodeError::Arity {
                expected: widths.len(),
                found: operands.len(),
            });
        }

        let mut stored = [0; 2];
        for (slot, (&value, width)) in
            stored.iter_mut().zip(operands.iter().zip(widths))
        {
            if !width.fits(value) {
                return Err(EncodeError::OutOfRange {
                    value,
                    bytes: width.bytes(),
                });
            }
            *slot = value;
        }

        Ok(Self {
            opcode,
            operands: stored,
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn operands(&self) -> &[i32] {
        &self.operands[..self.opcode.operand_count()]
    }

    pub fn operand(&self, index: usize) -> i32 {
        self.operands[index]
    }

    pub fn size(&self) -> usize {
        self.opcode.size()
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.push(self.opcode as u8);
        for (&value, width) in
            self.operands().iter().zip(self.opcode.operand_widths())
        {
            match width {
                OperandWidth::Short => {
                    bytes.extend_from_slice(&(value as i16).to_le_bytes())
                }
                OperandWidth::Word => {
                    bytes.extend_from_slice(&value.to_le_bytes())
                }
            }
        }
        bytes
    }

    pub fn decode(code: &[u8], address: usize) -> Result<Self, DecodeError> {
        let byte = *code.get(address).ok_or(DecodeError::OutOfBounds {
            address,
            length: code.len(),
        })?;
        let opcode = Opcode::from_byte(byte).ok_or(DecodeError::InvalidOpcode {
            opcode: byte,
            address,
        })?;

        let truncated = || DecodeError::TruncatedOperand {
            opcode: opcode.mnemonic(),
            address,
        };

        let mut operands = [0; 2];
        let mut cursor = address + 1;
        for (slot, width) in operands.iter_mut().zip(opcode.operand_widths()) {
            let end = cursor + width.bytes();
            let bytes = code.get(cursor..end).ok_or_else(truncated)?;
            *slot = match width {
                OperandWidth::Short => {
                    i16::from_le_bytes([bytes[0], bytes[1]]) as i32
                }
                OperandWidth::Word => {
                    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                }
            };
            cursor = end;
        }

        Ok(Self { opcode, operands })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let operands = self
            .operands()
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<String>>()
            .join(", ");
        if operands.is_empty() {
            write!(f, "{}", self.opcode)
        } else {
            write!(f, "{} {}", self.opcode, operands)
        }
    }
}

pub const NUM_INSTRUCTIONS: usize = Opcode::COUNT;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_opcodes_are_dense_and_ordered() {
        let expected = [
            "HALT", "IADD", "ISUB", "IMUL", "IDIV", "SADD", "OR", "AND", "INEG",
            "NOT", "I2S", "IEQ", "INEQ", "ILT", "ILE", "IGT", "IGE", "SEQ",
            "SNEQ", "SGT", "SGE", "SLT", "SLE", "BR", "BRF", "ICONST", "SCONST",
            "LOAD", "STORE", "SINDEX", "POP", "CALL", "LOCALS", "RET", "PRINT",
            "SLEN", "SFREE",
        ];
        assert_eq!(NUM_INSTRUCTIONS, expected.len());
        for (code, mnemonic) in expected.iter().enumerate() {
            let opcode = Opcode::from_byte(code as u8).unwrap();
            assert_eq!(opcode.mnemonic(), *mnemonic);
            assert_eq!(opcode as usize, code);
        }
        assert_eq!(Opcode::from_byte(NUM_INSTRUCTIONS as u8), None);
    }

    #[test]
    fn test_lookup_by_mnemonic() {
        let tests = [
            ("HALT", Some(Opcode::Halt)),
            ("I2S", Some(Opcode::I2s)),
            ("SINDEX", Some(Opcode::SIndex)),
            ("CALL", Some(Opcode::Call)),
            ("call", None),
            ("JMP", None),
            ("", None),
        ];
        for (name, expected) in tests {
            assert_eq!(Opcode::from_mnemonic(name), expected, "{}", name);
        }
    }

    #[test]
    fn test_operand_widths() {
        let tests = [
            (Opcode::Halt, 1),
            (Opcode::IAdd, 1),
            (Opcode::Br, 5),
            (Opcode::Brf, 5),
            (Opcode::IConst, 5),
            (Opcode::SConst, 3),
            (Opcode::Load, 3),
            (Opcode::Store, 3),
            (Opcode::Locals, 3),
            (Opcode::SFree, 3),
            (Opcode::Call, 7),
        ];
        for (opcode, size) in tests {
            assert_eq!(opcode.size(), size, "{}", opcode);
        }
    }

    #[test]
    fn test_instruction_as_bytes() -> Result<()> {
        let tests = [
            (Instruction::new(Opcode::Halt, &[])?, vec![0]),
            (
                Instruction::new(Opcode::IConst, &[-2])?,
                vec![25, 0xFE, 0xFF, 0xFF, 0xFF],
            ),
            (Instruction::new(Opcode::SConst, &[258])?, vec![26, 2, 1]),
            (
                Instruction::new(Opcode::Call, &[20, 2])?,
                vec![31, 20, 0, 0, 0, 2, 0],
            ),
        ];

        for (instruction, expected) in tests {
            assert_eq!(instruction.as_bytes(), expected);
        }
        Ok(())
    }

    #[test]
    fn test_every_opcode_round_trips() -> Result<()> {
        for opcode in Opcode::iter() {
            let operands: Vec<i32> = opcode
                .operand_widths()
                .iter()
                .map(|width| match width {
                    OperandWidth::Short => -300,
                    OperandWidth::Word => 70_000,
                })
                .collect();
            let instruction = Instruction::new(opcode, &operands)?;
            let bytes = instruction.as_bytes();
            assert_eq!(bytes.len(), opcode.size());

            let decoded = Instruction::decode(&bytes, 0)?;
            assert_eq!(decoded.opcode().mnemonic(), opcode.mnemonic());
            assert_eq!(decoded.operands(), operands.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_new_rejects_bad_operands() {
        assert_eq!(
            Instruction::new(Opcode::IConst, &[]),
            Err(EncodeError::Arity {
                expected: 1,
                found: 0
            })
        );
        assert_eq!(
            Instruction::new(Opcode::Call, &[1]),
            Err(EncodeError::Arity {
                expected: 2,
                found: 1
            })
        );
        assert_eq!(
            Instruction::new(Opcode::Load, &[40_000]),
            Err(EncodeError::OutOfRange {
                value: 40_000,
                bytes: 2
            })
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            Instruction::decode(&[200], 0),
            Err(DecodeError::InvalidOpcode {
                opcode: 200,
                address: 0
            })
        );
        assert_eq!(
            Instruction::decode(&[0, 25, 1, 0], 1),
            Err(DecodeError::TruncatedOperand {
                opcode: "ICONST",
                address: 1
            })
        );
    }

    #[test]
    fn test_instruction_strings() -> Result<()> {
        let tests = [
            (Instruction::new(Opcode::Print, &[])?, "PRINT"),
            (Instruction::new(Opcode::IConst, &[-7])?, "ICONST -7"),
            (Instruction::new(Opcode::Call, &[12, 2])?, "CALL 12, 2"),
        ];
        for (instruction, expected) in tests {
            assert_eq!(instruction.to_string(), expected);
        }
        Ok(())
    }
}
