use thiserror::Error;

#[derive(Debug, Error)]
pub enum StringError {
    #[error("string index {index} out of range for string of length {length}")]
    IndexOutOfRange { index: i32, length: usize },

    #[error("concatenation cannot be applied to two missing strings")]
    BothOperandsMissing,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read object file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected {expected}, found {found:?}")]
    Format {
        line: usize,
        expected: &'static str,
        found: String,
    },

    #[error("unexpected end of input: expected {expected}")]
    UnexpectedEof { expected: &'static str },

    #[error("line {line}: string index {index} is outside a table of {count} strings")]
    StringIndex { line: usize, index: usize, count: usize },

    #[error("line {line}: string index {index} declared twice")]
    DuplicateString { line: usize, index: usize },

    #[error("string index {index} was never declared")]
    MissingString { index: usize },

    #[error("line {line}: function address {address} exceeds maxaddr={max_address}")]
    FunctionAddress {
        line: usize,
        address: u32,
        max_address: u32,
    },

    #[error("line {line}: {text} has length {actual}, declared {declared}")]
    LengthMismatch {
        line: usize,
        text: String,
        declared: usize,
        actual: usize,
    },

    #[error("line {line}: {what} {requested} exceeds the limit of {limit}")]
    TooLarge {
        line: usize,
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("line {line}: cannot allocate {requested} bytes of code")]
    Allocation { line: usize, requested: usize },

    #[error("line {line}: instruction overflows the declared {declared} bytes")]
    CodeOverflow { line: usize, declared: usize },

    #[error("{opcode} at {address} targets {target}, which is not an instruction in {length} bytes of code")]
    BadTarget {
        address: usize,
        opcode: &'static str,
        target: i32,
        length: usize,
    },

    #[error("SCONST at {address} references string {index}, table has {count}")]
    BadConstant {
        address: usize,
        index: i32,
        count: usize,
    },

    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("{count} instruction line(s) dropped, first at line {first_line}: {first_message}")]
    Rejected {
        count: usize,
        first_line: usize,
        first_message: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("address {address} is outside {length} bytes of code")]
    OutOfBounds { address: usize, length: usize },

    #[error("invalid opcode: {opcode} at ip={address}")]
    InvalidOpcode { opcode: u8, address: usize },

    #[error("operand of {opcode} at ip={address} runs past the end of the code")]
    TruncatedOperand {
        opcode: &'static str,
        address: usize,
    },
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no function named main")]
    MainNotFound,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("operand stack overflow: capacity {capacity}")]
    StackOverflow { capacity: usize },

    #[error("operand stack underflow at ip={address}")]
    StackUnderflow { address: usize },

    #[error("call stack overflow: capacity {capacity}")]
    CallStackOverflow { capacity: usize },

    #[error("{opcode} at ip={address} expected {expected}, found {found}")]
    TypeMismatch {
        opcode: &'static str,
        address: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{opcode} at ip={address}: local slot {slot} outside {declared} declared locals of {function}")]
    LocalOutOfRange {
        opcode: &'static str,
        address: usize,
        slot: i32,
        declared: usize,
        function: String,
    },

    #[error("CALL at ip={address} passes {nargs} arguments, capacity is {capacity}")]
    ArgumentCount {
        address: usize,
        nargs: i32,
        capacity: usize,
    },

    #[error("{function} declares {requested} locals, capacity is {capacity}")]
    TooManyLocals {
        function: String,
        requested: i64,
        capacity: usize,
    },

    #[error("SCONST at ip={address} references string {index}, table has {count}")]
    BadConstant {
        address: usize,
        index: i32,
        count: usize,
    },

    #[error("{opcode} at ip={address} jumps to {target}, outside {length} bytes of code")]
    BadTarget {
        opcode: &'static str,
        address: usize,
        target: i32,
        length: usize,
    },

    #[error("division by zero at ip={address}")]
    DivisionByZero { address: usize },

    #[error("{source} at ip={address}")]
    String {
        address: usize,
        #[source]
        source: StringError,
    },
}
