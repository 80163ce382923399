use crate::{DecodeError, Instruction, VmString};
use std::collections::BTreeMap;

/// Function start addresses and their names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FunctionTable {
    names: BTreeMap<u32, String>,
    max_address: u32,
}

impl FunctionTable {
    pub fn with_max_address(max_address: u32) -> Self {
        Self {
            names: BTreeMap::new(),
            max_address,
        }
    }

    pub fn declare(&mut self, address: u32, name: String) {
        self.max_address = self.max_address.max(address);
        self.names.insert(address, name);
    }

    pub fn name_at(&self, address: u32) -> Option<&str> {
        self.names.get(&address).map(String::as_str)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.iter()
            .find(|(_, declared)| *declared == name)
            .map(|(address, _)| address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .map(|(address, name)| (*address, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn max_address(&self) -> usize {
        self.max_address as usize
    }
}

/// A loaded program: encoded code, string constants and function names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Program {
    pub code: Vec<u8>,
    pub strings: Vec<VmString>,
    pub functions: FunctionTable,
}

impl Program {
    pub fn new(
        code: Vec<u8>,
        strings: Vec<VmString>,
        functions: FunctionTable,
    ) -> Self {
        Self {
            code,
            strings,
            functions,
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: &self.code,
            address: 0,
        }
    }

    pub fn disassemble(&self) -> String {
        let mut lines = Vec::new();
        for entry in self.instructions() {
            match entry {
                Ok((address, instruction)) => {
                    if let Some(name) = self.functions.name_at(address as u32) {
                        lines.push(format!("{}:", name));
                    }
                    lines.push(format!("{:0>4} {}", address, instruction));
                }
                Err(error) => {
                    lines.push(format!("error: {}", error));
                    break;
                }
            }
        }
        lines.join("\n")
    }
}

pub struct Instructions<'a> {
    code: &'a [u8],
    address: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.address >= self.code.len() {
            return None;
        }
        let address = self.address;
        match Instruction::decode(self.code, address) {
            Ok(instruction) => {
                self.address += instruction.size();
                Some(Ok((address, instruction)))
            }
            Err(error) => {
                self.address = self.code.len();
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;
    use anyhow::Result;

    fn encode(instructions: &[Instruction]) -> Vec<u8> {
        instructions
            .iter()
            .flat_map(|instruction| instruction.as_bytes())
            .collect()
    }

    #[test]
    fn test_function_table_lookup() {
        let mut functions = FunctionTable::with_max_address(12);
        functions.declare(0, "main".to_string());
        functions.declare(12, "foo".to_string());

        assert_eq!(functions.lookup("main"), Some(0));
        assert_eq!(functions.lookup("foo"), Some(12));
        assert_eq!(functions.lookup("bar"), None);
        assert_eq!(functions.name_at(12), Some("foo"));
        assert_eq!(functions.name_at(5), None);
        assert_eq!(functions.name_at(400), None);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions.max_address(), 12);
    }

    #[test]
    fn test_function_table_is_sparse() {
        let mut functions = FunctionTable::with_max_address(u32::MAX);
        functions.declare(u32::MAX, "last".to_string());
        assert_eq!(functions.lookup("last"), Some(u32::MAX));
        assert_eq!(functions.len(), 1);
        assert_eq!(functions.max_address(), u32::MAX as usize);
    }

    #[test]
    fn test_disassemble() -> Result<()> {
        let code = encode(&[
            Instruction::new(Opcode::IConst, &[1])?,
            Instruction::new(Opcode::Call, &[13, 1])?,
            Instruction::new(Opcode::Halt, &[])?,
            Instruction::new(Opcode::Load, &[0])?,
            Instruction::new(Opcode::Print, &[])?,
            Instruction::new(Opcode::Ret, &[])?,
        ]);

        let mut functions = FunctionTable::with_max_address(13);
        functions.declare(0, "main".to_string());
        functions.declare(13, "show".to_string());
        let program = Program::new(code, vec![], functions);

        let expected = [
            "main:",
            "0000 ICONST 1",
            "0005 CALL 13, 1",
            "0012 HALT",
            "show:",
            "0013 LOAD 0",
            "0016 PRINT",
            "0017 RET",
        ]
        .join("\n");

        assert_eq!(program.disassemble(), expected);
        Ok(())
    }

    #[test]
    fn test_disassemble_stops_at_bad_opcode() {
        let program = Program::new(vec![0, 99], vec![], FunctionTable::default());
        assert_eq!(
            program.disassemble(),
            "0000 HALT\nerror: invalid opcode: 99 at ip=1"
        );
    }
}
