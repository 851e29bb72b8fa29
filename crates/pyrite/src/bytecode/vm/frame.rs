//! Call frames and the block stack.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::{bytecode::Code, heap::HeapId, intern::StringId, value::Value};

/// Why a block was pushed; decides how the unwinder treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Loop body; discarded during unwinding.
    Loop,
    /// `try` protected by `except` arms.
    Except,
    /// `try` protected by `finally`.
    Finally,
    /// `with` body; the unwinder calls `__exit__` and may suppress.
    With,
    /// `try` protected by `except*` arms.
    ExceptGroup,
    /// An `except` handler body is running; popping it drops the
    /// handled-exception entry it pushed.
    Handler,
}

/// A control-flow marker on the frame's block stack.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub kind: BlockKind,
    /// Bytecode offset to jump to when the block is triggered.
    pub handler: usize,
    /// Operand-stack height (absolute) when the block was pushed.
    pub stack_level: usize,
    /// Handled-exception-stack depth when the block was pushed.
    pub exc_depth: usize,
}

/// One activation record.
///
/// Locals are frame-owned slots sized to the code object's `var_names`;
/// cells are heap boxes shared with closures. The operand stack is
/// VM-global with `stack_base` marking this frame's region.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<Code>,
    pub ip: usize,
    pub stack_base: usize,
    pub locals: Vec<Value>,
    /// Cell slots: created cells first, then captured free cells.
    pub cells: Vec<HeapId>,
    /// The module namespace serving as this frame's globals.
    pub globals: HeapId,
    /// Class-body namespace; when set, `LoadName`/`StoreName` hit this
    /// before the globals, and its insertion order becomes the class
    /// member order.
    pub class_ns: Option<IndexMap<StringId, Value>>,
    pub blocks: Vec<Block>,
    /// Display name for tracebacks.
    pub name: StringId,
    /// The generator that owns this frame while it is resumed.
    pub gen_id: Option<HeapId>,
    /// Handled-exception-stack depth when this frame was (re)installed;
    /// generator suspension splits the stack here.
    pub exc_base: usize,
}

impl Frame {
    /// Builds a frame for a code object with empty locals.
    #[must_use]
    pub fn new(code: Rc<Code>, stack_base: usize, globals: HeapId, name: StringId) -> Self {
        let local_count = code.var_names().len();
        let mut locals = Vec::with_capacity(local_count);
        locals.resize_with(local_count, || Value::Undefined);
        Self {
            code,
            ip: 0,
            stack_base,
            locals,
            cells: Vec::new(),
            globals,
            class_ns: None,
            blocks: Vec::new(),
            name,
            gen_id: None,
            exc_base: 0,
        }
    }

    /// Heap ids owned by this frame (for generator storage release).
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for value in &self.locals {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
        out.extend(self.cells.iter().copied());
        out.push(self.globals);
        if let Some(ns) = &self.class_ns {
            for value in ns.values() {
                if let Value::Ref(id) = value {
                    out.push(*id);
                }
            }
        }
    }
}
