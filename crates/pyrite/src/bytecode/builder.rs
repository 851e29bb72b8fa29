//! Assembler for [`Code`] objects.
//!
//! `CodeBuilder` is how embedders (and this crate's tests) produce code:
//! emit opcodes, reference constants and names by value, mark jump targets
//! with labels, and call [`CodeBuilder::finish`] to patch offsets and seal
//! the object. The builder tracks a conservative stack-depth upper bound
//! for the code object's `stack_size` hint.

use std::rc::Rc;

use crate::{
    bytecode::{
        code::{Code, CodeFlags, Const, LineEntry},
        op::{Opcode, OperandKind},
    },
    intern::Interns,
};

/// A forward-referencable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental assembler for one code object.
#[derive(Debug)]
pub struct CodeBuilder<'a> {
    interns: &'a mut Interns,
    name: String,
    filename: String,
    code: Vec<u8>,
    consts: Vec<Const>,
    names: Vec<crate::intern::StringId>,
    var_names: Vec<crate::intern::StringId>,
    cell_vars: Vec<crate::intern::StringId>,
    free_vars: Vec<crate::intern::StringId>,
    arg_count: u16,
    kwonly_arg_count: u16,
    flags: CodeFlags,
    labels: Vec<Option<usize>>,
    /// `(operand_offset, label)` pairs patched in `finish`.
    patches: Vec<(usize, Label)>,
    /// `(bytecode_offset, line)` markers, converted to ranges in `finish`.
    line_marks: Vec<(usize, u32)>,
    depth: i32,
    max_depth: i32,
}

impl<'a> CodeBuilder<'a> {
    pub fn new(interns: &'a mut Interns, name: &str, filename: &str) -> Self {
        Self {
            interns,
            name: name.to_owned(),
            filename: filename.to_owned(),
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
            cell_vars: Vec::new(),
            free_vars: Vec::new(),
            arg_count: 0,
            kwonly_arg_count: 0,
            flags: CodeFlags::empty(),
            labels: Vec::new(),
            patches: Vec::new(),
            line_marks: Vec::new(),
            depth: 0,
            max_depth: 0,
        }
    }

    // ------------------------------------------------------------------
    // Symbol tables
    // ------------------------------------------------------------------

    /// Declares the positional parameters; they occupy the first local slots.
    pub fn params(&mut self, names: &[&str]) -> &mut Self {
        assert!(self.var_names.is_empty(), "params must be declared first");
        for name in names {
            let id = self.interns.intern(name);
            self.var_names.push(id);
        }
        self.arg_count = u16::try_from(names.len()).expect("too many parameters");
        self
    }

    /// Declares keyword-only parameters, after the positional ones.
    pub fn kwonly_params(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            let id = self.interns.intern(name);
            self.var_names.push(id);
        }
        self.kwonly_arg_count = u16::try_from(names.len()).expect("too many parameters");
        self
    }

    /// Declares a `*args` parameter and sets the VARARGS flag.
    pub fn varargs(&mut self, name: &str) -> &mut Self {
        let id = self.interns.intern(name);
        self.var_names.push(id);
        self.flags = self.flags.union(CodeFlags::VARARGS);
        self
    }

    /// Declares a `**kwargs` parameter and sets the VARKEYWORDS flag.
    pub fn varkeywords(&mut self, name: &str) -> &mut Self {
        let id = self.interns.intern(name);
        self.var_names.push(id);
        self.flags = self.flags.union(CodeFlags::VARKEYWORDS);
        self
    }

    pub fn set_flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Declares a cell created by this code (captured by inner functions).
    pub fn cell_var(&mut self, name: &str) -> u16 {
        let id = self.interns.intern(name);
        if let Some(pos) = self.cell_vars.iter().position(|&n| n == id) {
            return u16::try_from(pos).expect("too many cells");
        }
        self.cell_vars.push(id);
        u16::try_from(self.cell_vars.len() - 1).expect("too many cells")
    }

    /// Declares a cell received from the enclosing closure.
    ///
    /// Free-var slots come after all cell vars, so the returned index is
    /// usable directly by `LoadDeref`/`StoreDeref`.
    pub fn free_var(&mut self, name: &str) -> u16 {
        let id = self.interns.intern(name);
        let base = self.cell_vars.len();
        if let Some(pos) = self.free_vars.iter().position(|&n| n == id) {
            return u16::try_from(base + pos).expect("too many cells");
        }
        self.free_vars.push(id);
        u16::try_from(base + self.free_vars.len() - 1).expect("too many cells")
    }

    /// Returns (registering if needed) the slot of a local variable.
    pub fn local(&mut self, name: &str) -> u16 {
        let id = self.interns.intern(name);
        if let Some(pos) = self.var_names.iter().position(|&n| n == id) {
            return u16::try_from(pos).expect("too many locals");
        }
        self.var_names.push(id);
        u16::try_from(self.var_names.len() - 1).expect("too many locals")
    }

    /// Returns (registering if needed) the index of a name-table entry.
    pub fn name_idx(&mut self, name: &str) -> u16 {
        let id = self.interns.intern(name);
        if let Some(pos) = self.names.iter().position(|&n| n == id) {
            return u16::try_from(pos).expect("too many names");
        }
        self.names.push(id);
        u16::try_from(self.names.len() - 1).expect("too many names")
    }

    /// Returns (deduplicating) the index of a constant.
    pub fn const_idx(&mut self, value: Const) -> u16 {
        if let Some(pos) = self.consts.iter().position(|c| *c == value) {
            return u16::try_from(pos).expect("too many constants");
        }
        self.consts.push(value);
        u16::try_from(self.consts.len() - 1).expect("too many constants")
    }

    // ------------------------------------------------------------------
    // Raw emission
    // ------------------------------------------------------------------

    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::None);
        self.push_op(opcode);
        self
    }

    pub fn op_u8(&mut self, opcode: Opcode, operand: u8) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Byte);
        self.push_op(opcode);
        self.code.push(operand);
        self
    }

    pub fn op_i8(&mut self, opcode: Opcode, operand: i8) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Byte);
        self.push_op(opcode);
        self.code.push(operand.to_ne_bytes()[0]);
        self
    }

    pub fn op_u16(&mut self, opcode: Opcode, operand: u16) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Word);
        debug_assert!(!opcode.is_jump(), "jumps go through CodeBuilder::jump");
        self.push_op(opcode);
        self.code.extend_from_slice(&operand.to_le_bytes());
        self
    }

    /// Emits a packed operand: low byte + high byte.
    pub fn op_packed(&mut self, opcode: Opcode, lo: u8, hi: u8) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Word);
        self.push_op(opcode);
        self.code.push(lo);
        self.code.push(hi);
        self
    }

    fn push_op(&mut self, opcode: Opcode) {
        self.code.push(opcode as u8);
        self.track_stack(opcode);
    }

    // ------------------------------------------------------------------
    // Labels and jumps
    // ------------------------------------------------------------------

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Emits a jump-family opcode targeting `label`.
    ///
    /// Offsets are relative to the ip after the operand; the placeholder is
    /// patched in [`CodeBuilder::finish`].
    pub fn jump(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        debug_assert!(opcode.is_jump());
        self.push_op(opcode);
        self.patches.push((self.code.len(), label));
        self.code.extend_from_slice(&0_i16.to_le_bytes());
        self
    }

    // ------------------------------------------------------------------
    // Convenience emitters
    // ------------------------------------------------------------------

    pub fn load_const(&mut self, value: Const) -> &mut Self {
        let idx = self.const_idx(value);
        self.op_u16(Opcode::LoadConst, idx)
    }

    /// Loads an integer via the cheapest encoding.
    pub fn load_int(&mut self, value: i64) -> &mut Self {
        match value {
            0 => self.op(Opcode::LoadZero),
            1 => self.op(Opcode::LoadOne),
            v if i8::try_from(v).is_ok() => self.op_i8(Opcode::LoadSmallInt, v as i8),
            v => self.load_const(Const::Int(v)),
        }
    }

    pub fn load_str(&mut self, value: &str) -> &mut Self {
        let id = self.interns.intern(value);
        self.load_const(Const::Str(id))
    }

    pub fn load_local(&mut self, name: &str) -> &mut Self {
        let slot = self.local(name);
        match slot {
            0 => self.op(Opcode::LoadLocal0),
            1 => self.op(Opcode::LoadLocal1),
            2 => self.op(Opcode::LoadLocal2),
            3 => self.op(Opcode::LoadLocal3),
            s if s <= u16::from(u8::MAX) => self.op_u8(Opcode::LoadLocal, s as u8),
            s => self.op_u16(Opcode::LoadLocalW, s),
        }
    }

    pub fn store_local(&mut self, name: &str) -> &mut Self {
        let slot = self.local(name);
        match slot {
            0 => self.op(Opcode::StoreLocal0),
            1 => self.op(Opcode::StoreLocal1),
            2 => self.op(Opcode::StoreLocal2),
            3 => self.op(Opcode::StoreLocal3),
            s if s <= u16::from(u8::MAX) => self.op_u8(Opcode::StoreLocal, s as u8),
            s => self.op_u16(Opcode::StoreLocalW, s),
        }
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::LoadGlobal, idx)
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::StoreGlobal, idx)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::LoadName, idx)
    }

    pub fn store_name(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::StoreName, idx)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::LoadAttr, idx)
    }

    pub fn store_attr(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::StoreAttr, idx)
    }

    pub fn load_method(&mut self, name: &str) -> &mut Self {
        let idx = self.name_idx(name);
        self.op_u16(Opcode::LoadMethod, idx)
    }

    pub fn call(&mut self, argc: u8) -> &mut Self {
        self.op_u8(Opcode::Call, argc)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::ReturnValue)
    }

    /// Emits `MakeFunction` for a nested code object.
    pub fn make_function(&mut self, code: Rc<Code>, flags: u8) -> &mut Self {
        let idx = self.const_idx(Const::Code(code));
        self.push_op(Opcode::MakeFunction);
        self.code.push(flags);
        self.code.extend_from_slice(&idx.to_le_bytes());
        self
    }

    /// Marks subsequent instructions as belonging to `line`.
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.line_marks.push((self.code.len(), line));
        self
    }

    // ------------------------------------------------------------------
    // Finish
    // ------------------------------------------------------------------

    /// Patches jumps, seals the line table, and produces the code object.
    ///
    /// # Panics
    /// Panics if a jump references an unbound label or an offset does not
    /// fit in i16.
    #[must_use]
    pub fn finish(self) -> Rc<Code> {
        let mut code = self.code;
        for (operand_offset, label) in self.patches {
            let target = self.labels[label.0].expect("jump to unbound label");
            let base = operand_offset + 2;
            let delta = i64::try_from(target).expect("offset overflow") - i64::try_from(base).expect("offset overflow");
            let delta = i16::try_from(delta).expect("jump offset exceeds i16");
            code[operand_offset..operand_offset + 2].copy_from_slice(&delta.to_le_bytes());
        }

        let mut line_table = Vec::with_capacity(self.line_marks.len());
        for (index, &(start, line)) in self.line_marks.iter().enumerate() {
            let end = self
                .line_marks
                .get(index + 1)
                .map_or(code.len(), |&(next_start, _)| next_start);
            if end > start {
                line_table.push(LineEntry {
                    start: u32::try_from(start).expect("code too large"),
                    end: u32::try_from(end).expect("code too large"),
                    line,
                });
            }
        }

        let interns = self.interns;
        let filename = interns.intern(&self.filename);
        let name = interns.intern(&self.name);
        // Safety margin over the tracked maximum: specialized arms may
        // momentarily widen the stack by a couple of slots.
        let stack_size = u16::try_from((self.max_depth.max(0) as usize) + 4).unwrap_or(u16::MAX);
        Rc::new(Code::new(
            code,
            self.consts,
            self.names,
            self.var_names,
            self.cell_vars,
            self.free_vars,
            self.arg_count,
            self.kwonly_arg_count,
            self.flags,
            stack_size,
            line_table,
            filename,
            name,
        ))
    }

    /// Conservative per-opcode stack accounting for the `stack_size` hint.
    ///
    /// The hint only pre-sizes the operand stack (which grows on demand),
    /// so unknown shapes lean positive rather than exact.
    fn track_stack(&mut self, opcode: Opcode) {
        use Opcode::*;
        let effect: i32 = match opcode {
            Pop | ReturnValue | StoreLocal | StoreLocal0 | StoreLocal1 | StoreLocal2 | StoreLocal3 | StoreLocalW
            | StoreGlobal | StoreName | StoreDeref | PopJumpIfTrue | PopJumpIfFalse | ListAppend | SetAdd
            | BinaryAdd | BinarySub | BinaryMul | BinaryDiv | BinaryFloorDiv | BinaryMod | BinaryPow | BinaryAnd
            | BinaryOr | BinaryXor | BinaryLShift | BinaryRShift | InplaceAdd | InplaceSub | InplaceMul
            | InplaceDiv | InplaceFloorDiv | InplaceMod | InplacePow | InplaceAnd | InplaceOr | InplaceXor
            | InplaceLShift | InplaceRShift | CompareEq | CompareNe | CompareLt | CompareLe | CompareGt
            | CompareGe | CompareIs | CompareIsNot | CompareIn | CompareNotIn | AddIntFast | SubIntFast
            | MulIntFast | DivIntFast | AddFloatFast | SubFloatFast | MulFloatFast | DivFloatFast | LtIntFast
            | LeIntFast | GtIntFast | GeIntFast | EqIntFast | NeIntFast | BinarySubscr | ListExtend | DictUpdate
            | DictMerge | ExceptionMatch | YieldFrom | ImportFrom => -1,
            MapAdd | StoreSubscr | DeleteSubscr => -2,
            LtIntJumpIfFalse | LeIntJumpIfFalse | GtIntJumpIfFalse | GeIntJumpIfFalse | EqIntJumpIfFalse
            | NeIntJumpIfFalse => -2,
            Dup | LoadNone | LoadTrue | LoadFalse | LoadZero | LoadOne | LoadSmallInt | LoadConst
            | BuildEmptyList | BuildEmptyTuple | BuildEmptyDict | LoadLocal | LoadLocalW | LoadLocal0
            | LoadLocal1 | LoadLocal2 | LoadLocal3 | LoadGlobal | LoadName | LoadDeref | LoadClosure
            | AddConstFast | ForIter | GetLen | LoadBuildClass | MakeFunction => 1,
            Dup2 | LoadFastLoadFast | LoadFastLoadConst | LoadConstLoadFast | LoadGlobalLoadFast | LoadMethod
            | ExtractStar => 2,
            _ => 0,
        };
        self.depth += effect;
        if self.depth < 0 {
            self.depth = 0;
        }
        self.max_depth = self.max_depth.max(self.depth + 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_offsets_are_relative_to_next_ip() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(&mut interns, "t", "t.py");
        let end = b.label();
        b.op(Opcode::LoadTrue);
        b.jump(Opcode::PopJumpIfFalse, end);
        b.load_int(1);
        b.bind(end);
        b.ret();
        let code = b.finish();
        // PopJumpIfFalse sits at offset 1; operand at 2..4; next ip is 4.
        let lo = code.bytecode()[2];
        let hi = code.bytecode()[3];
        let offset = i16::from_le_bytes([lo, hi]);
        // Target is the ReturnValue at offset 6 (LoadSmallInt is 2 bytes... LoadOne is 1).
        let target = 4 + i64::from(offset);
        assert_eq!(code.bytecode()[usize::try_from(target).unwrap()], Opcode::ReturnValue as u8);
    }

    #[test]
    fn const_pool_dedups() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new(&mut interns, "t", "t.py");
        let a = b.const_idx(Const::Int(500));
        let c = b.const_idx(Const::Int(500));
        assert_eq!(a, c);
        assert_ne!(b.const_idx(Const::Int(501)), a);
    }
}
