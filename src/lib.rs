//! A stack-based bytecode virtual machine.
//!
//! Programs arrive as textual object files, are encoded into a byte array
//! by the [`Loader`], and run on the [`VirtualMachine`].

mod error;
mod instruction;
mod loader;
mod program;
mod strings;
mod value;
mod vm;

pub use self::{
    error::*, instruction::*, loader::*, program::*, strings::*, value::*,
    vm::*,
};
