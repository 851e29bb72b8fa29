//! Compiled code objects.
//!
//! A [`Code`] is the immutable unit the engine executes: bytecode bytes, a
//! constant pool (which may nest further code objects), name tables, and a
//! line table for tracebacks. The engine treats it as read-only; embedders
//! produce them with [`crate::bytecode::CodeBuilder`] or an external
//! compiler.

use std::rc::Rc;

use crate::intern::StringId;

/// Code object flags.
///
/// Kept as a transparent bit set rather than a bitflags dependency; the
/// handful of flags does not warrant one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(u16);

impl CodeFlags {
    /// The code object collects excess positional args into `*args`.
    pub const VARARGS: Self = Self(1 << 0);
    /// The code object collects excess keyword args into `**kwargs`.
    pub const VARKEYWORDS: Self = Self(1 << 1);
    /// Calling produces a generator instead of running the body.
    pub const GENERATOR: Self = Self(1 << 2);
    /// Calling produces a coroutine.
    pub const COROUTINE: Self = Self(1 << 3);
    /// Calling produces an async generator.
    pub const ASYNC_GENERATOR: Self = Self(1 << 4);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }
}

/// A constant-pool entry.
///
/// Strings are interned ids; nested functions appear as `Code` constants
/// referenced by `MakeFunction`.
#[derive(Debug, Clone)]
pub enum Const {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Str(StringId),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Const]>),
    Code(Rc<Code>),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // Bit comparison: the pool must distinguish 0.0 from -0.0.
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Complex { real: ar, imag: ai }, Self::Complex { real: br, imag: bi }) => {
                ar.to_bits() == br.to_bits() && ai.to_bits() == bi.to_bits()
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Maps a `[start, end)` bytecode offset range to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

/// An immutable compiled unit.
#[derive(Debug)]
pub struct Code {
    bytecode: Vec<u8>,
    consts: Vec<Const>,
    /// Names for globals, attributes, and imports.
    names: Vec<StringId>,
    /// Local variable names; the first `arg_count + kwonly_arg_count`
    /// (plus `*args`/`**kwargs` slots when flagged) are parameters.
    var_names: Vec<StringId>,
    /// Cells created by this code (captured by inner functions).
    cell_vars: Vec<StringId>,
    /// Cells received from the enclosing function's closure.
    free_vars: Vec<StringId>,
    arg_count: u16,
    kwonly_arg_count: u16,
    flags: CodeFlags,
    /// Upper bound on operand-stack growth, used to pre-size the stack.
    stack_size: u16,
    line_table: Vec<LineEntry>,
    filename: StringId,
    name: StringId,
}

impl Code {
    #[expect(clippy::too_many_arguments, reason = "assembled once, by the builder")]
    #[must_use]
    pub(crate) fn new(
        bytecode: Vec<u8>,
        consts: Vec<Const>,
        names: Vec<StringId>,
        var_names: Vec<StringId>,
        cell_vars: Vec<StringId>,
        free_vars: Vec<StringId>,
        arg_count: u16,
        kwonly_arg_count: u16,
        flags: CodeFlags,
        stack_size: u16,
        line_table: Vec<LineEntry>,
        filename: StringId,
        name: StringId,
    ) -> Self {
        Self {
            bytecode,
            consts,
            names,
            var_names,
            cell_vars,
            free_vars,
            arg_count,
            kwonly_arg_count,
            flags,
            stack_size,
            line_table,
            filename,
            name,
        }
    }

    #[inline]
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[inline]
    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.consts
    }

    #[inline]
    #[must_use]
    pub fn names(&self) -> &[StringId] {
        &self.names
    }

    #[inline]
    #[must_use]
    pub fn var_names(&self) -> &[StringId] {
        &self.var_names
    }

    #[inline]
    #[must_use]
    pub fn cell_vars(&self) -> &[StringId] {
        &self.cell_vars
    }

    #[inline]
    #[must_use]
    pub fn free_vars(&self) -> &[StringId] {
        &self.free_vars
    }

    /// Total cell slots a frame of this code needs.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cell_vars.len() + self.free_vars.len()
    }

    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.arg_count
    }

    #[must_use]
    pub fn kwonly_arg_count(&self) -> u16 {
        self.kwonly_arg_count
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR) || self.flags.contains(CodeFlags::ASYNC_GENERATOR)
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    #[must_use]
    pub fn stack_size(&self) -> u16 {
        self.stack_size
    }

    #[must_use]
    pub fn filename(&self) -> StringId {
        self.filename
    }

    #[must_use]
    pub fn name(&self) -> StringId {
        self.name
    }

    /// Resolves a bytecode offset to a source line.
    ///
    /// Entries are ordered by offset; the match is the entry whose
    /// `[start, end)` range contains the offset.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        match self
            .line_table
            .binary_search_by(|entry| {
                if offset < entry.start {
                    std::cmp::Ordering::Greater
                } else if offset >= entry.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
            Ok(index) => self.line_table[index].line,
            Err(_) => 0,
        }
    }

    /// Index of a local slot by name, if the name is a local.
    #[must_use]
    pub fn local_slot(&self, name: StringId) -> Option<usize> {
        self.var_names.iter().position(|&n| n == name)
    }

    /// Index of a cell slot by name, searching cell vars then free vars.
    #[must_use]
    pub fn cell_slot(&self, name: StringId) -> Option<usize> {
        self.cell_vars
            .iter()
            .chain(self.free_vars.iter())
            .position(|&n| n == name)
    }

    /// Renders a human-readable listing of the bytecode.
    #[must_use]
    pub fn disassemble(&self, interns: &crate::intern::Interns) -> String {
        use crate::bytecode::op::{Opcode, OperandKind};
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({}): {} bytes, stack {}",
            interns.get_str(self.name),
            interns.get_str(self.filename),
            self.bytecode.len(),
            self.stack_size
        );
        let mut ip = 0;
        while ip < self.bytecode.len() {
            let byte = self.bytecode[ip];
            let Some(opcode) = Opcode::from_repr(byte) else {
                let _ = writeln!(out, "{ip:>6}  <invalid {byte:#04x}>");
                ip += 1;
                continue;
            };
            let line = self.line_for_offset(ip);
            let _ = write!(out, "{ip:>6}  {opcode:<22}");
            ip += 1;
            match opcode.operand_kind() {
                OperandKind::None => {}
                OperandKind::Byte => {
                    let _ = write!(out, " {}", self.bytecode[ip]);
                    ip += 1;
                }
                OperandKind::Word => {
                    let operand = u16::from_le_bytes([self.bytecode[ip], self.bytecode[ip + 1]]);
                    if opcode.is_jump() {
                        let offset = i16::from_le_bytes(operand.to_le_bytes());
                        let target = ip as i64 + 2 + i64::from(offset);
                        let _ = write!(out, " -> {target}");
                    } else {
                        let _ = write!(out, " {operand}");
                    }
                    ip += 2;
                }
                OperandKind::ByteWord => {
                    let flags = self.bytecode[ip];
                    let operand = u16::from_le_bytes([self.bytecode[ip + 1], self.bytecode[ip + 2]]);
                    let _ = write!(out, " flags={flags} const={operand}");
                    ip += 3;
                }
            }
            if line > 0 {
                let _ = write!(out, "    ; line {line}");
            }
            out.push('\n');
        }
        // Nested code objects follow their parent.
        for constant in &self.consts {
            if let Const::Code(inner) = constant {
                out.push('\n');
                out.push_str(&inner.disassemble(interns));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = CodeFlags::GENERATOR.union(CodeFlags::VARARGS);
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(flags.contains(CodeFlags::VARARGS));
        assert!(!flags.contains(CodeFlags::COROUTINE));
    }

    #[test]
    fn line_lookup_uses_half_open_ranges() {
        let code = Code::new(
            vec![0; 12],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            0,
            0,
            CodeFlags::empty(),
            0,
            vec![
                LineEntry { start: 0, end: 4, line: 1 },
                LineEntry { start: 4, end: 10, line: 2 },
                LineEntry { start: 10, end: 12, line: 4 },
            ],
            StringId::default(),
            StringId::default(),
        );
        assert_eq!(code.line_for_offset(0), 1);
        assert_eq!(code.line_for_offset(3), 1);
        assert_eq!(code.line_for_offset(4), 2);
        assert_eq!(code.line_for_offset(11), 4);
    }
}
