use crate::VmString;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Element {
    /// A slot that was never written, or whose string was released by
    /// `SFREE`.
    #[default]
    Empty,
    Integer(i32),
    Bool(bool),
    Str(VmString),
}

impl Element {
    pub fn type_name(&self) -> &'static str {
        match self {
            Element::Empty => "empty slot",
            Element::Integer(_) => "integer",
            Element::Bool(_) => "boolean",
            Element::Str(_) => "string",
        }
    }

    /// Appends the form PRINT writes. Strings go out as raw bytes.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Element::Str(s) => out.extend_from_slice(s.as_bytes()),
            other => out.extend_from_slice(other.to_string().as_bytes()),
        }
    }

    /// Like `write_to`, but strings are quoted so `"1"` and `1` differ.
    pub fn write_trace(&self, out: &mut Vec<u8>) {
        if let Element::Str(s) = self {
            out.push(b'"');
            out.extend_from_slice(s.as_bytes());
            out.push(b'"');
        } else {
            self.write_to(out);
        }
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Element::Empty => write!(f, "?"),
            Element::Integer(v) => write!(f, "{}", v),
            Element::Bool(v) => write!(f, "{}", v),
            Element::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Element {
    fn from(value: i32) -> Self {
        Element::Integer(value)
    }
}

impl From<bool> for Element {
    fn from(value: bool) -> Self {
        Element::Bool(value)
    }
}

impl From<VmString> for Element {
    fn from(value: VmString) -> Self {
        Element::Str(value)
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::Str(VmString::new(value))
    }
}
