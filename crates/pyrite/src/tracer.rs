//! Execution tracing hooks.
//!
//! The VM is generic over a [`VmTracer`]; the default [`NoopTracer`]
//! monomorphizes every hook into nothing. `StderrTracer` gives a quick
//! instruction log; `RecordingTracer` captures events for tests.

use crate::bytecode::Opcode;

/// Hooks invoked by the dispatch loop.
pub trait VmTracer {
    /// Called before each instruction executes.
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize);

    /// Called when a frame is pushed (calls, generator resume).
    fn on_frame_push(&mut self, frame_depth: usize);

    /// Called when a frame is popped (returns, unwinding).
    fn on_frame_pop(&mut self, frame_depth: usize);
}

/// Tracer that compiles to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    #[inline]
    fn on_frame_push(&mut self, _frame_depth: usize) {}

    #[inline]
    fn on_frame_pop(&mut self, _frame_depth: usize) {}
}

/// Tracer that prints one line per instruction to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        eprintln!("[{frame_depth}] {ip:>6}  {opcode:<20} stack={stack_depth}");
    }

    fn on_frame_push(&mut self, frame_depth: usize) {
        eprintln!("-> frame push (depth {frame_depth})");
    }

    fn on_frame_pop(&mut self, frame_depth: usize) {
        eprintln!("<- frame pop (depth {frame_depth})");
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Instruction { ip: usize, opcode: Opcode },
    FramePush { depth: usize },
    FramePop { depth: usize },
}

/// Tracer that records events for assertions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        self.events.push(TraceEvent::Instruction { ip, opcode });
    }

    fn on_frame_push(&mut self, frame_depth: usize) {
        self.events.push(TraceEvent::FramePush { depth: frame_depth });
    }

    fn on_frame_pop(&mut self, frame_depth: usize) {
        self.events.push(TraceEvent::FramePop { depth: frame_depth });
    }
}
