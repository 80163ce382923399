//! Reads the textual object format into a [`Program`].
//!
//! ```text
//! 2 strings
//!     0: 2/hi
//!     1: 3/bye
//! 2 functions maxaddr=11
//!     0: 4/main
//!    11: 3/foo
//! 6 instr, 18 bytes
//!     SCONST 1
//!     CALL 11, 1   ; CALL addr32, nargs16
//!     ...
//! ```
//!
//! Dropping a malformed instruction line shifts every later address, so
//! each drop is logged and strict loading refuses the program outright.

use crate::{
    EncodeError, FunctionTable, Instruction, LoadError, Opcode, Program, VmString,
};
use std::{borrow::Cow, collections::HashSet, fmt, io::BufRead, str::Chars};
use tracing::{debug, warn};

/// SCONST carries a 2-byte signed index.
pub const MAX_STRINGS: usize = i16::MAX as usize + 1;
/// Branch and call targets are 4-byte signed addresses.
pub const MAX_CODE_BYTES: usize = i32::MAX as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub strict: bool,
}

impl LoadOptions {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    UnknownBytecode(String),
    OperandMismatch { expected: usize, found: usize },
    OperandOutOfRange { value: i32, bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub kind: DiagnosticKind,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            DiagnosticKind::UnknownBytecode(name) => {
                write!(f, "unknown bytecode {}; ignoring", name)
            }
            DiagnosticKind::OperandMismatch { expected, found } => write!(
                f,
                "operand mismatch; expecting {}, found {}",
                expected, found
            ),
            DiagnosticKind::OperandOutOfRange { value, bytes } => write!(
                f,
                "operand {} does not fit in {} bytes; ignoring",
                value, bytes
            ),
        }
    }
}

#[derive(Debug)]
pub struct Loaded {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Loader<R> {
    reader: R,
    line_number: usize,
    options: LoadOptions,
}

pub fn load<R: BufRead>(reader: R) -> Result<Loaded, LoadError> {
    Loader::new(reader).load()
}

impl<R: BufRead> Loader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_options(reader, LoadOptions::default())
    }

    pub fn with_options(reader: R, options: LoadOptions) -> Self {
        Self {
            reader,
            line_number: 0,
            options,
        }
    }

    pub fn load(mut self) -> Result<Loaded, LoadError> {
        let strings = self.read_strings()?;
        let functions = self.read_functions()?;
        let (code, diagnostics) = self.read_code()?;
        self.expect_end()?;

        let program = Program::new(code, strings, functions);
        verify(&program)?;

        debug!(
            strings = program.strings.len(),
            functions = program.functions.len(),
            bytes = program.len(),
            dropped = diagnostics.len(),
            "program loaded"
        );

        Ok(Loaded {
            program,
            diagnostics,
        })
    }

    /// Next non-blank line as raw bytes, without its newline.
    fn next_line(&mut self) -> Result<Option<(usize, Vec<u8>)>, LoadError> {
        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if !is_blank(&line) {
                return Ok(Some((self.line_number, line)));
            }
        }
    }

    fn require_line(
        &mut self,
        expected: &'static str,
    ) -> Result<(usize, Vec<u8>), LoadError> {
        self.next_line()?
            .ok_or(LoadError::UnexpectedEof { expected })
    }

    fn require_text(
        &mut self,
        expected: &'static str,
    ) -> Result<(usize, String), LoadError> {
        let (line, bytes) = self.require_line(expected)?;
        Ok((line, lossy(&bytes).into_owned()))
    }

    fn read_strings(&mut self) -> Result<Vec<VmString>, LoadError> {
        const HEADER: &str = "`<count> strings`";
        let (line, text) = self.require_text(HEADER)?;
        let mut cursor = Cursor::new(&text);
        let count = cursor
            .count()
            .filter(|_| cursor.literal("strings") && cursor.at_end())
            .ok_or_else(|| format_error(line, HEADER, &text))?;
        if count > MAX_STRINGS {
            return Err(LoadError::TooLarge {
                line,
                what: "string count",
                requested: count,
                limit: MAX_STRINGS,
            });
        }

        let mut strings: Vec<Option<VmString>> = vec![None; count];
        for _ in 0..count {
            const ENTRY: &str = "`<index>: <length>/<text>`";
            let (line, bytes) = self.require_line(ENTRY)?;
            let (index, literal) = entry(line, &bytes, ENTRY)?;
            let slot = strings.get_mut(index).ok_or(LoadError::StringIndex {
                line,
                index,
                count,
            })?;
            if slot.is_some() {
                return Err(LoadError::DuplicateString { line, index });
            }
            *slot = Some(VmString::from_bytes(literal));
        }

        strings
            .into_iter()
            .enumerate()
            .map(|(index, string)| string.ok_or(LoadError::MissingString { index }))
            .collect()
    }

    fn read_functions(&mut self) -> Result<FunctionTable, LoadError> {
        const HEADER: &str = "`<count> functions maxaddr=<address>`";
        let (line, text) = self.require_text(HEADER)?;
        let mut cursor = Cursor::new(&text);
        let count = cursor.count();
        let max_address = count
            .filter(|_| cursor.literal("functions") && cursor.literal("maxaddr="))
            .and_then(|_| cursor.count())
            .filter(|_| cursor.at_end())
            .ok_or_else(|| format_error(line, HEADER, &text))?;
        let max_address = u32::try_from(max_address)
            .ok()
            .filter(|max| *max as usize <= MAX_CODE_BYTES)
            .ok_or(LoadError::TooLarge {
                line,
                what: "maxaddr",
                requested: max_address,
                limit: MAX_CODE_BYTES,
            })?;
        let count = count.unwrap_or_default();

        let mut functions = FunctionTable::with_max_address(max_address);
        for _ in 0..count {
            const ENTRY: &str = "`<address>: <length>/<name>`";
            let (line, bytes) = self.require_line(ENTRY)?;
            let (address, name) = entry(line, &bytes, ENTRY)?;
            let address = u32::try_from(address)
                .ok()
                .filter(|address| *address <= max_address)
                .ok_or(LoadError::FunctionAddress {
                    line,
                    address: address as u32,
                    max_address,
                })?;
            functions.declare(address, lossy(name).into_owned());
        }
        Ok(functions)
    }

    fn read_code(&mut self) -> Result<(Vec<u8>, Vec<Diagnostic>), LoadError> {
        const HEADER: &str = "`<count> instr, <bytes> bytes`";
        let (line, text) = self.require_text(HEADER)?;
        let mut cursor = Cursor::new(&text);
        let count = cursor.count();
        let declared = count
            .filter(|_| cursor.literal("instr") && cursor.literal(","))
            .and_then(|_| cursor.count())
            .filter(|_| cursor.literal("bytes") && cursor.at_end())
            .ok_or_else(|| format_error(line, HEADER, &text))?;
        if declared > MAX_CODE_BYTES {
            return Err(LoadError::TooLarge {
                line,
                what: "code size",
                requested: declared,
                limit: MAX_CODE_BYTES,
            });
        }
        let count = count.unwrap_or_default();

        let mut code = Vec::new();
        code.try_reserve_exact(declared)
            .map_err(|_| LoadError::Allocation {
                line,
                requested: declared,
            })?;
        code.resize(declared, 0);

        let mut ip = 0;
        let mut diagnostics = Vec::new();
        let mut read = 0;
        while read < count {
            let (line, text) = self.require_text("an instruction")?;
            let source = strip_comment(&text).trim();
            if source.is_empty() {
                continue;
            }
            read += 1;

            let instruction = match encode_line(source) {
                Ok(instruction) => instruction,
                Err(kind) => {
                    let diagnostic = Diagnostic { line, kind };
                    warn!(line, "{}", diagnostic);
                    diagnostics.push(diagnostic);
                    continue;
                }
            };

            let bytes = instruction.as_bytes();
            let target = code
                .get_mut(ip..ip + bytes.len())
                .ok_or(LoadError::CodeOverflow { line, declared })?;
            target.copy_from_slice(&bytes);
            ip += bytes.len();
        }

        if let Some(first) = diagnostics.first() {
            warn!(
                dropped = diagnostics.len(),
                shortfall = declared - ip,
                "instruction lines dropped; addresses after line {} are shifted",
                first.line
            );
            if self.options.strict {
                return Err(LoadError::Rejected {
                    count: diagnostics.len(),
                    first_line: first.line,
                    first_message: first.to_string(),
                });
            }
        } else if ip < declared {
            debug!(encoded = ip, declared, "code padded with HALT");
        }

        Ok((code, diagnostics))
    }

    fn expect_end(&mut self) -> Result<(), LoadError> {
        while let Some((line, bytes)) = self.next_line()? {
            let text = lossy(&bytes);
            if !strip_comment(&text).trim().is_empty() {
                return Err(format_error(line, "end of input", &text));
            }
        }
        Ok(())
    }
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn format_error(line: usize, expected: &'static str, found: &str) -> LoadError {
    LoadError::Format {
        line,
        expected,
        found: found.to_string(),
    }
}

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or_default()
}

/// Parses `<number>: <length>/<text>`. The text is exactly `length` raw
/// bytes and may hold anything but a newline.
fn entry<'a>(
    line: usize,
    text: &'a [u8],
    expected: &'static str,
) -> Result<(usize, &'a [u8]), LoadError> {
    let malformed = || format_error(line, expected, &lossy(text));
    let slash = text.iter().position(|&b| b == b'/').ok_or_else(malformed)?;
    let prefix = std::str::from_utf8(&text[..slash]).map_err(|_| malformed())?;
    let mut cursor = Cursor::new(prefix);
    let (number, length) = cursor
        .count()
        .filter(|_| cursor.literal(":"))
        .zip(cursor.count())
        .filter(|_| cursor.at_end())
        .ok_or_else(malformed)?;

    let rest = &text[slash + 1..];
    match rest.get(..length) {
        Some(literal) if is_blank(&rest[length..]) => Ok((number, literal)),
        _ => {
            let padding = rest.iter().rev().take_while(|b| b.is_ascii_whitespace());
            Err(LoadError::LengthMismatch {
                line,
                text: lossy(rest).into_owned(),
                declared: length,
                actual: rest.len() - padding.count(),
            })
        }
    }
}

fn encode_line(source: &str) -> Result<Instruction, DiagnosticKind> {
    let (name, operand_text) = source
        .split_once(char::is_whitespace)
        .unwrap_or((source, ""));

    let opcode = Opcode::from_mnemonic(name)
        .ok_or_else(|| DiagnosticKind::UnknownBytecode(name.to_string()))?;

    let operands: Vec<i32> = if operand_text.trim().is_empty() {
        Vec::new()
    } else {
        operand_text
            .split(',')
            .map(|operand| operand.trim().parse::<i32>())
            .take_while(Result::is_ok)
            .flatten()
            .collect()
    };

    Instruction::new(opcode, &operands).map_err(|error| match error {
        EncodeError::Arity { expected, found } => {
            DiagnosticKind::OperandMismatch { expected, found }
        }
        EncodeError::OutOfRange { value, bytes } => {
            DiagnosticKind::OperandOutOfRange { value, bytes }
        }
    })
}

fn verify(program: &Program) -> Result<(), LoadError> {
    let mut starts = HashSet::new();
    let mut decoded = Vec::new();
    for entry in program.instructions() {
        let (address, instruction) = entry?;
        starts.insert(address);
        decoded.push((address, instruction));
    }

    for (address, instruction) in decoded {
        let opcode = instruction.opcode();
        if opcode.is_branch() {
            let target = instruction.operand(0);
            let valid = usize::try_from(target)
                .map(|target| starts.contains(&target))
                .unwrap_or(false);
            if !valid {
                return Err(LoadError::BadTarget {
                    address,
                    opcode: opcode.mnemonic(),
                    target,
                    length: program.len(),
                });
            }
        }
        if opcode == Opcode::SConst {
            let index = instruction.operand(0);
            if usize::try_from(index).map_or(true, |i| i >= program.strings.len()) {
                return Err(LoadError::BadConstant {
                    address,
                    index,
                    count: program.strings.len(),
                });
            }
        }
    }
    Ok(())
}

struct Cursor<'a> {
    chars: Chars<'a>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars(),
        }
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.chars.clone().nth(n)
    }

    fn take_while(&mut self, mut predicate: impl FnMut(char) -> bool) -> String {
        let mut taken = String::new();
        while let Some(c) = self.peek_nth(0).filter(|c| predicate(*c)) {
            taken.push(c);
            self.chars.next();
        }
        taken
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn count(&mut self) -> Option<usize> {
        self.skip_whitespace();
        self.take_while(|c| c.is_ascii_digit()).parse().ok()
    }

    fn literal(&mut self, expected: &str) -> bool {
        self.skip_whitespace();
        match self.chars.as_str().strip_prefix(expected) {
            Some(rest) => {
                self.chars = rest.chars();
                true
            }
            None => false,
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.chars.as_str().is_empty()
    }
}
