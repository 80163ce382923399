use crate::StringError;
use std::{
    fmt::{self, Display, Formatter},
    rc::Rc,
};

/// Shared, immutable byte string. Cloning copies the handle; `SFREE` on one
/// slot drops only that slot's handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmString(Rc<[u8]>);

impl VmString {
    pub fn new(text: &str) -> Self {
        Self::from_bytes(text.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Rc::from(bytes))
    }

    pub fn duplicate(&self) -> Self {
        Self::from_bytes(&self.0)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes(&[byte])
    }

    pub fn from_int(value: i32) -> Self {
        Self::new(&value.to_string())
    }

    /// A missing or empty operand yields the other operand's handle.
    pub fn concat(
        left: Option<&VmString>,
        right: Option<&VmString>,
    ) -> Result<VmString, StringError> {
        match (left, right) {
            (None, None) => Err(StringError::BothOperandsMissing),
            (Some(left), None) => Ok(left.clone()),
            (None, Some(right)) => Ok(right.clone()),
            (Some(left), Some(right)) if right.is_empty() => Ok(left.clone()),
            (Some(left), Some(right)) if left.is_empty() => Ok(right.clone()),
            (Some(left), Some(right)) => {
                let mut bytes = Vec::with_capacity(left.len() + right.len());
                bytes.extend_from_slice(&left.0);
                bytes.extend_from_slice(&right.0);
                Ok(Self(Rc::from(bytes)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The one-byte string at a 1-based `index`.
    pub fn byte_at(&self, index: i32) -> Result<VmString, StringError> {
        usize::try_from(index)
            .ok()
            .and_then(|index| index.checked_sub(1))
            .and_then(|position| self.0.get(position))
            .map(|&byte| Self::from_byte(byte))
            .ok_or(StringError::IndexOutOfRange {
                index,
                length: self.len(),
            })
    }

    pub fn equal(&self, other: &VmString) -> bool {
        self.0 == other.0
    }

    pub fn not_equal(&self, other: &VmString) -> bool {
        !self.equal(other)
    }

    pub fn greater_than(&self, other: &VmString) -> bool {
        self.0 > other.0
    }

    pub fn greater_than_or_equal(&self, other: &VmString) -> bool {
        self.0 >= other.0
    }

    pub fn less_than(&self, other: &VmString) -> bool {
        self.0 < other.0
    }

    pub fn less_than_or_equal(&self, other: &VmString) -> bool {
        self.0 <= other.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for VmString {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for VmString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
