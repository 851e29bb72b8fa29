//! Generator and coroutine objects.
//!
//! A generator owns its frame exclusively. Resumption installs the frame
//! as the engine's current frame and re-enters the dispatcher in a mode
//! that treats `YieldValue`/`YieldFrom` as suspension points; suspension
//! moves the frame (and the operand-stack segment above its base) back
//! into the object. The handled-exception stack segment accumulated
//! inside the generator is saved with it, so nested generators compose.

use crate::{bytecode::vm::Frame, except::ExcInstance, heap::HeapId, intern::StringId, value::Value};

/// Which calling-convention flag produced this object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenKind {
    Generator,
    Coroutine,
}

/// The four-state lifecycle FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Built but never resumed; `send` requires `None`.
    Created,
    /// Currently executing; re-entry is an error.
    Running,
    /// Parked at a yield, frame saved.
    Suspended,
    /// Returned, raised, or closed; further resumes raise StopIteration.
    Closed,
}

/// A suspendable frame plus its saved engine state.
#[derive(Debug)]
pub struct Generator {
    pub kind: GenKind,
    /// Display name (the function's name).
    pub name: StringId,
    pub state: GenState,
    /// The owned frame; `None` while RUNNING (installed in the engine)
    /// and after CLOSED.
    pub frame: Option<Frame>,
    /// Operand-stack segment above the frame's base at suspension.
    pub saved_stack: Vec<Value>,
    /// Private copy of the handled-exception stack entries pushed inside
    /// this generator.
    pub saved_handled: Vec<ExcInstance>,
}

impl Generator {
    #[must_use]
    pub fn new(kind: GenKind, name: StringId, frame: Frame) -> Self {
        Self {
            kind,
            name,
            state: GenState::Created,
            frame: Some(frame),
            saved_stack: Vec::new(),
            saved_handled: Vec::new(),
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        if let Some(frame) = &self.frame {
            frame.collect_refs(out);
        }
        for value in &self.saved_stack {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}
