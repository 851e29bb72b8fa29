//! Bytecode representation and the virtual machine.
//!
//! - `op` — opcode definitions and operand encodings
//! - `code` — immutable code objects
//! - `builder` — the assembler producing them
//! - `vm` — the stack interpreter

pub use builder::{CodeBuilder, Label};
pub use code::{Code, CodeFlags, Const, LineEntry};
pub use op::{Opcode, OperandKind};

pub(crate) mod builder;
pub(crate) mod code;
pub(crate) mod op;
pub(crate) mod vm;
