//! The stack interpreter.
//!
//! One `Vm` executes one interpreter's frames. The dispatch loop fetches
//! an opcode byte (plus little-endian operand bytes), executes the arm,
//! and repeats until the frame that was on top when [`Vm::run_until`] was
//! entered returns or yields. Nested engine re-entry — builtin functions
//! driving user callables, dunder invocation, generator resumption —
//! pushes a frame and runs a nested `run_until` with a higher floor.
//!
//! Specialized arms (`AddIntFast`, the fast-local family, fused
//! compare-and-jump) check operand shapes and fall back to the generic
//! arm on mismatch, so they are behaviorally identical to their generic
//! counterparts.

mod attr;
mod binary;
mod call;
mod collections;
mod compare;
mod frame;
mod r#gen;
mod matching;
mod raise;

pub use frame::{Block, BlockKind, Frame};
pub(crate) use binary::BinOp;
pub(crate) use r#gen::{GenOutcome, ResumeWith};

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    args::ArgValues,
    builtins::NativeFn,
    bytecode::{
        Code,
        code::Const,
        op::Opcode,
    },
    except::{ExcType, FrameInfo, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    import::ModuleSystem,
    intern::{Interns, StringId},
    io::PrintWriter,
    resource::{DEFAULT_CHECK_INTERVAL, ResourceTracker},
    tracer::VmTracer,
    value::{Value, py_truth},
};

use call::CallDone;

/// How a monitored frame left the dispatch loop.
#[derive(Debug)]
pub enum Finished {
    /// The frame returned this value.
    Returned(Value),
    /// The frame is a generator frame and suspended at a yield.
    Yielded(Value),
}

/// Marker pushed above a pending return value routed through `finally`.
const WHY_RETURN: i64 = 1;

/// The interpreter engine for one execution.
pub struct Vm<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> {
    /// Operand stack shared by all frames; each frame owns the region
    /// above its `stack_base`.
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) heap: &'a mut Heap<T>,
    pub(crate) interns: &'a mut Interns,
    /// The builtins namespace (kernel + embedder registrations).
    pub(crate) builtins: &'a AHashMap<StringId, Value>,
    /// Embedder-registered native functions, indexed by `Builtins::Native`.
    pub(crate) natives: &'a [NativeFn],
    pub(crate) print_writer: &'a mut P,
    pub(crate) tracer: &'a mut Tr,
    /// Module registry access (search paths, loaders, loaded cache).
    pub(crate) modules: &'a mut ModuleSystem,
    /// Stack of exceptions currently being handled (`__context__` source).
    pub(crate) handled_exc: Vec<crate::except::ExcInstance>,
    /// Offset of the opcode currently executing, for line resolution.
    pub(crate) instruction_ip: usize,
    /// Class-body namespace rescued from the most recently cleaned frame.
    captured_class_ns: Option<indexmap::IndexMap<StringId, crate::value::Value>>,
    /// Embedder cancellation handle, polled with the tracker.
    cancel: Option<crate::resource::CancelHandle>,
    /// Instructions remaining until the next cancellation poll.
    check_countdown: u32,
    check_interval: u32,
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    #[expect(clippy::too_many_arguments, reason = "wired once by the interpreter front-end")]
    pub fn new(
        heap: &'a mut Heap<T>,
        interns: &'a mut Interns,
        builtins: &'a AHashMap<StringId, Value>,
        natives: &'a [NativeFn],
        print_writer: &'a mut P,
        tracer: &'a mut Tr,
        modules: &'a mut ModuleSystem,
        check_interval: u32,
        cancel: Option<crate::resource::CancelHandle>,
    ) -> Self {
        let check_interval = if check_interval == 0 { DEFAULT_CHECK_INTERVAL } else { check_interval };
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            heap,
            interns,
            builtins,
            natives,
            print_writer,
            tracer,
            modules,
            handled_exc: Vec::new(),
            instruction_ip: 0,
            captured_class_ns: None,
            cancel,
            check_countdown: check_interval,
            check_interval,
        }
    }

    // ==================================================================
    // Stack primitives
    // ==================================================================

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    #[inline]
    pub(crate) fn peek(&self) -> &Value {
        self.stack.last().expect("operand stack underflow")
    }

    #[inline]
    pub(crate) fn peek_at(&self, depth: usize) -> &Value {
        let len = self.stack.len();
        &self.stack[len - 1 - depth]
    }

    /// Pops `count` values, returned in stack order (deepest first).
    pub(crate) fn pop_n(&mut self, count: usize) -> Vec<Value> {
        let len = self.stack.len();
        assert!(count <= len, "operand stack underflow");
        self.stack.split_off(len - count)
    }

    /// Drops the top `count` values with refcounting.
    pub(crate) fn drop_top(&mut self, count: usize) {
        for _ in 0..count {
            let value = self.pop();
            value.drop_with_heap(self.heap);
        }
    }

    // ==================================================================
    // Frame primitives
    // ==================================================================

    #[inline]
    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Pushes a frame, enforcing the recursion ceiling.
    pub(crate) fn push_frame(&mut self, frame: Frame) -> RunResult<()> {
        self.heap.tracker().check_recursion_depth(self.frames.len())?;
        self.frames.push(frame);
        self.tracer.on_frame_push(self.frames.len());
        Ok(())
    }


    pub(crate) fn cleanup_frame(&mut self, frame: Frame) {
        // Discard any leftovers in the frame's stack region.
        while self.stack.len() > frame.stack_base {
            let value = self.pop();
            value.drop_with_heap(self.heap);
        }
        for value in frame.locals {
            value.drop_with_heap(self.heap);
        }
        for cell in frame.cells {
            self.heap.dec_ref(cell);
        }
        self.heap.dec_ref(frame.globals);
        // Class-body namespaces survive cleanup so BuildClass can collect
        // them into the class member table.
        if let Some(ns) = frame.class_ns {
            self.captured_class_ns = Some(ns);
        }
    }

    /// Takes the namespace rescued from the last class-body frame.
    pub(crate) fn take_captured_class_ns(&mut self) -> Option<indexmap::IndexMap<StringId, Value>> {
        self.captured_class_ns.take()
    }

    /// Source position of the instruction currently executing.
    pub(crate) fn current_frame_info(&self) -> FrameInfo {
        let frame = self.frame();
        FrameInfo {
            file: frame.code.filename(),
            line: frame.code.line_for_offset(self.instruction_ip),
            name: frame.name,
        }
    }

    // ==================================================================
    // Operand fetching
    // ==================================================================

    #[inline]
    fn fetch_opcode(&mut self) -> Opcode {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.code.bytecode()[frame.ip];
        frame.ip += 1;
        Opcode::from_repr(byte).expect("invalid opcode in bytecode")
    }

    #[inline]
    fn fetch_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.code.bytecode()[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn fetch_i8(&mut self) -> i8 {
        i8::from_ne_bytes([self.fetch_u8()])
    }

    #[inline]
    fn fetch_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let lo = frame.code.bytecode()[frame.ip];
        let hi = frame.code.bytecode()[frame.ip + 1];
        frame.ip += 2;
        u16::from_le_bytes([lo, hi])
    }

    #[inline]
    fn fetch_i16(&mut self) -> i16 {
        let raw = self.fetch_u16();
        i16::from_le_bytes(raw.to_le_bytes())
    }

    /// Packed operand: `(low byte, high byte)`.
    #[inline]
    fn fetch_packed(&mut self) -> (u8, u8) {
        let frame = self.frames.last_mut().expect("no active frame");
        let lo = frame.code.bytecode()[frame.ip];
        let hi = frame.code.bytecode()[frame.ip + 1];
        frame.ip += 2;
        (lo, hi)
    }

    #[inline]
    pub(crate) fn jump_rel(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("no active frame");
        let ip = i64::try_from(frame.ip).expect("instruction pointer exceeds i64") + i64::from(offset);
        frame.ip = usize::try_from(ip).expect("jump produced a negative instruction pointer");
    }

    /// Resolves a name-table index of the current code object.
    #[inline]
    pub(crate) fn name_at(&self, index: u16) -> StringId {
        self.frame().code.names()[index as usize]
    }

    /// Converts a constant-pool entry to a value.
    pub(crate) fn const_to_value(&mut self, constant: &Const) -> RunResult<Value> {
        Ok(match constant {
            Const::None => Value::None,
            Const::Ellipsis => Value::Ellipsis,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(i) => Value::Int(*i),
            Const::Float(f) => Value::Float(*f),
            Const::Str(id) => Value::InternString(*id),
            Const::Complex { real, imag } => {
                let id = self
                    .heap
                    .allocate(HeapData::Complex(crate::types::Complex::new(*real, *imag)))?;
                Value::Ref(id)
            }
            Const::Bytes(bytes) => {
                let id = self
                    .heap
                    .allocate(HeapData::Bytes(crate::types::Bytes::from(bytes.as_ref())))?;
                Value::Ref(id)
            }
            Const::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items.iter() {
                    values.push(self.const_to_value(item)?);
                }
                let id = self.heap.allocate(HeapData::Tuple(crate::types::Tuple::from(values)))?;
                Value::Ref(id)
            }
            Const::Code(_) => {
                return Err(RunError::internal("code constants are only consumed by MakeFunction"));
            }
        })
    }

    pub(crate) fn load_const_value(&mut self, index: u16) -> RunResult<Value> {
        let constant = self.frame().code.consts()[index as usize].clone();
        self.const_to_value(&constant)
    }

    // ==================================================================
    // The dispatch loop
    // ==================================================================

    /// Runs until the frame stack drops back to `floor` frames.
    ///
    /// Returns the departing frame's return value, or the value it
    /// yielded when that frame belongs to a generator being resumed.
    pub fn run_until(&mut self, floor: usize) -> RunResult<Finished> {
        debug_assert!(self.frames.len() > floor, "run_until needs a frame to run");
        loop {
            // Cancellation / deadline poll every `check_interval` ops.
            self.check_countdown -= 1;
            if self.check_countdown == 0 {
                self.check_countdown = self.check_interval;
                let signal = self
                    .cancel
                    .as_ref()
                    .map_or(Ok(()), crate::resource::CancelHandle::check)
                    .and_then(|()| self.heap.tracker_mut().check_time());
                if let Err(err) = signal {
                    match self.handle_exception(err.into(), floor) {
                        Ok(()) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }

            self.instruction_ip = self.frame().ip;
            let opcode = self.fetch_opcode();
            self.tracer.on_instruction(
                self.instruction_ip,
                opcode,
                self.stack.len() - self.frame().stack_base,
                self.frames.len(),
            );

            // Arms that can raise route through this; a caught exception
            // resumes the loop, an uncaught one leaves run_until.
            macro_rules! try_op {
                ($expr:expr) => {
                    match $expr {
                        Ok(value) => value,
                        Err(err) => {
                            self.handle_exception(err, floor)?;
                            continue;
                        }
                    }
                };
            }

            match opcode {
                // ====================================================
                // Stack shuffling
                // ====================================================
                Opcode::Nop => {}
                Opcode::Pop => {
                    let value = self.pop();
                    value.drop_with_heap(self.heap);
                }
                Opcode::Dup => {
                    let value = self.peek().clone_with_heap(self.heap);
                    self.push(value);
                }
                Opcode::Dup2 => {
                    let b = self.peek().clone_with_heap(self.heap);
                    let a = self.peek_at(1).clone_with_heap(self.heap);
                    self.push(a);
                    self.push(b);
                }
                Opcode::Rot2 => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                Opcode::Rot3 => {
                    let top = self.pop();
                    let len = self.stack.len();
                    self.stack.insert(len - 2, top);
                }

                // ====================================================
                // Immediates
                // ====================================================
                Opcode::LoadNone => self.push(Value::None),
                Opcode::LoadTrue => self.push(Value::Bool(true)),
                Opcode::LoadFalse => self.push(Value::Bool(false)),
                Opcode::LoadZero => self.push(Value::Int(0)),
                Opcode::LoadOne => self.push(Value::Int(1)),
                Opcode::LoadSmallInt => {
                    let value = self.fetch_i8();
                    self.push(Value::Int(i64::from(value)));
                }
                Opcode::LoadConst => {
                    let index = self.fetch_u16();
                    let value = try_op!(self.load_const_value(index));
                    self.push(value);
                }
                Opcode::BuildEmptyList => {
                    let id = try_op!(self.heap.allocate(HeapData::List(crate::types::List::new())).map_err(RunError::from));
                    self.push(Value::Ref(id));
                }
                Opcode::BuildEmptyTuple => {
                    let id = try_op!(self.heap.empty_tuple().map_err(RunError::from));
                    self.push(Value::Ref(id));
                }
                Opcode::BuildEmptyDict => {
                    let id = try_op!(self.heap.allocate(HeapData::Dict(crate::types::Dict::new())).map_err(RunError::from));
                    self.push(Value::Ref(id));
                }

                // ====================================================
                // Locals
                // ====================================================
                Opcode::LoadLocal => {
                    let slot = self.fetch_u8();
                    try_op!(self.load_local(usize::from(slot)));
                }
                Opcode::LoadLocalW => {
                    let slot = self.fetch_u16();
                    try_op!(self.load_local(usize::from(slot)));
                }
                Opcode::LoadLocal0 => try_op!(self.load_local(0)),
                Opcode::LoadLocal1 => try_op!(self.load_local(1)),
                Opcode::LoadLocal2 => try_op!(self.load_local(2)),
                Opcode::LoadLocal3 => try_op!(self.load_local(3)),
                Opcode::StoreLocal => {
                    let slot = self.fetch_u8();
                    self.store_local(usize::from(slot));
                }
                Opcode::StoreLocalW => {
                    let slot = self.fetch_u16();
                    self.store_local(usize::from(slot));
                }
                Opcode::StoreLocal0 => self.store_local(0),
                Opcode::StoreLocal1 => self.store_local(1),
                Opcode::StoreLocal2 => self.store_local(2),
                Opcode::StoreLocal3 => self.store_local(3),
                Opcode::DeleteLocal => {
                    let slot = usize::from(self.fetch_u8());
                    try_op!(self.delete_local(slot));
                }
                Opcode::IncrementFast => {
                    let slot = usize::from(self.fetch_u8());
                    try_op!(self.step_local(slot, 1));
                }
                Opcode::DecrementFast => {
                    let slot = usize::from(self.fetch_u8());
                    try_op!(self.step_local(slot, -1));
                }
                Opcode::NegateFast => {
                    let slot = usize::from(self.fetch_u8());
                    try_op!(self.negate_local(slot));
                }
                Opcode::AddConstFast => {
                    let (slot, const_idx) = self.fetch_packed();
                    try_op!(self.add_const_fast(usize::from(slot), u16::from(const_idx)));
                }
                Opcode::AccumulateFast => {
                    let (dst, src) = self.fetch_packed();
                    try_op!(self.accumulate_fast(usize::from(dst), usize::from(src)));
                }

                // ====================================================
                // Fused loads
                // ====================================================
                Opcode::LoadFastLoadFast => {
                    let (a, b) = self.fetch_packed();
                    try_op!(self.load_local(usize::from(a)));
                    try_op!(self.load_local(usize::from(b)));
                }
                Opcode::LoadFastLoadConst => {
                    let (slot, const_idx) = self.fetch_packed();
                    try_op!(self.load_local(usize::from(slot)));
                    let value = try_op!(self.load_const_value(u16::from(const_idx)));
                    self.push(value);
                }
                Opcode::StoreFastLoadFast => {
                    let (store, load) = self.fetch_packed();
                    self.store_local(usize::from(store));
                    try_op!(self.load_local(usize::from(load)));
                }
                Opcode::LoadConstLoadFast => {
                    let (slot, const_idx) = self.fetch_packed();
                    let value = try_op!(self.load_const_value(u16::from(const_idx)));
                    self.push(value);
                    try_op!(self.load_local(usize::from(slot)));
                }
                Opcode::LoadGlobalLoadFast => {
                    let (slot, name_idx) = self.fetch_packed();
                    let name = self.name_at(u16::from(name_idx));
                    try_op!(self.load_global(name));
                    try_op!(self.load_local(usize::from(slot)));
                }

                // ====================================================
                // Globals / names / cells
                // ====================================================
                Opcode::LoadGlobal => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.load_global(name));
                }
                Opcode::StoreGlobal => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    let value = self.pop();
                    try_op!(self.store_global(name, value));
                }
                Opcode::DeleteGlobal => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.delete_global(name));
                }
                Opcode::LoadName => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.load_name(name));
                }
                Opcode::StoreName => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    let value = self.pop();
                    try_op!(self.store_name(name, value));
                }
                Opcode::DeleteName => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.delete_name(name));
                }
                Opcode::LoadDeref => {
                    let slot = usize::from(self.fetch_u16());
                    try_op!(self.load_deref(slot));
                }
                Opcode::StoreDeref => {
                    let slot = usize::from(self.fetch_u16());
                    let value = self.pop();
                    let cell_id = self.frame().cells[slot];
                    let old = std::mem::replace(self.cell_value_mut(cell_id), value);
                    old.drop_with_heap(self.heap);
                }
                Opcode::LoadClosure => {
                    let slot = usize::from(self.fetch_u16());
                    let cell_id = self.frame().cells[slot];
                    self.heap.inc_ref(cell_id);
                    self.push(Value::Ref(cell_id));
                }

                // ====================================================
                // Attributes and subscripts
                // ====================================================
                Opcode::LoadAttr => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_load_attr(name));
                }
                Opcode::StoreAttr => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_store_attr(name));
                }
                Opcode::DeleteAttr => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_delete_attr(name));
                }
                Opcode::LoadMethod => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_load_method(name));
                }
                Opcode::CallMethod => {
                    let argc = usize::from(self.fetch_u8());
                    match try_op!(self.op_call_method(argc)) {
                        CallDone::Pushed => {}
                        CallDone::Value(value) => self.push(value),
                    }
                }
                Opcode::BinarySubscr => try_op!(self.op_binary_subscr()),
                Opcode::StoreSubscr => try_op!(self.op_store_subscr()),
                Opcode::DeleteSubscr => try_op!(self.op_delete_subscr()),

                // ====================================================
                // Arithmetic / unary / compare
                // ====================================================
                Opcode::BinaryAdd | Opcode::InplaceAdd => try_op!(self.op_binary(binary::BinOp::Add, opcode == Opcode::InplaceAdd)),
                Opcode::BinarySub | Opcode::InplaceSub => try_op!(self.op_binary(binary::BinOp::Sub, opcode == Opcode::InplaceSub)),
                Opcode::BinaryMul | Opcode::InplaceMul => try_op!(self.op_binary(binary::BinOp::Mul, opcode == Opcode::InplaceMul)),
                Opcode::BinaryDiv | Opcode::InplaceDiv => try_op!(self.op_binary(binary::BinOp::Div, opcode == Opcode::InplaceDiv)),
                Opcode::BinaryFloorDiv | Opcode::InplaceFloorDiv => {
                    try_op!(self.op_binary(binary::BinOp::FloorDiv, opcode == Opcode::InplaceFloorDiv));
                }
                Opcode::BinaryMod | Opcode::InplaceMod => try_op!(self.op_binary(binary::BinOp::Mod, opcode == Opcode::InplaceMod)),
                Opcode::BinaryPow | Opcode::InplacePow => try_op!(self.op_binary(binary::BinOp::Pow, opcode == Opcode::InplacePow)),
                Opcode::BinaryAnd | Opcode::InplaceAnd => try_op!(self.op_binary(binary::BinOp::And, opcode == Opcode::InplaceAnd)),
                Opcode::BinaryOr | Opcode::InplaceOr => try_op!(self.op_binary(binary::BinOp::Or, opcode == Opcode::InplaceOr)),
                Opcode::BinaryXor | Opcode::InplaceXor => try_op!(self.op_binary(binary::BinOp::Xor, opcode == Opcode::InplaceXor)),
                Opcode::BinaryLShift | Opcode::InplaceLShift => {
                    try_op!(self.op_binary(binary::BinOp::LShift, opcode == Opcode::InplaceLShift));
                }
                Opcode::BinaryRShift | Opcode::InplaceRShift => {
                    try_op!(self.op_binary(binary::BinOp::RShift, opcode == Opcode::InplaceRShift));
                }
                Opcode::UnaryNeg => try_op!(self.op_unary_neg()),
                Opcode::UnaryPos => try_op!(self.op_unary_pos()),
                Opcode::UnaryInvert => try_op!(self.op_unary_invert()),
                Opcode::UnaryNot => {
                    let value = self.pop();
                    let truth = try_op!(self.value_truth(&value));
                    value.drop_with_heap(self.heap);
                    self.push(Value::Bool(!truth));
                }
                Opcode::CompareEq => try_op!(self.op_compare_eq(false)),
                Opcode::CompareNe => try_op!(self.op_compare_eq(true)),
                Opcode::CompareLt => try_op!(self.op_compare_ord(compare::CmpOp::Lt)),
                Opcode::CompareLe => try_op!(self.op_compare_ord(compare::CmpOp::Le)),
                Opcode::CompareGt => try_op!(self.op_compare_ord(compare::CmpOp::Gt)),
                Opcode::CompareGe => try_op!(self.op_compare_ord(compare::CmpOp::Ge)),
                Opcode::CompareIs => self.op_compare_is(false),
                Opcode::CompareIsNot => self.op_compare_is(true),
                Opcode::CompareIn => try_op!(self.op_compare_in(false)),
                Opcode::CompareNotIn => try_op!(self.op_compare_in(true)),

                // ====================================================
                // Type-specialized arms
                // ====================================================
                Opcode::AddIntFast => try_op!(self.op_binary_int_fast(binary::BinOp::Add)),
                Opcode::SubIntFast => try_op!(self.op_binary_int_fast(binary::BinOp::Sub)),
                Opcode::MulIntFast => try_op!(self.op_binary_int_fast(binary::BinOp::Mul)),
                Opcode::DivIntFast => try_op!(self.op_binary_int_fast(binary::BinOp::Div)),
                Opcode::AddFloatFast => try_op!(self.op_binary_float_fast(binary::BinOp::Add)),
                Opcode::SubFloatFast => try_op!(self.op_binary_float_fast(binary::BinOp::Sub)),
                Opcode::MulFloatFast => try_op!(self.op_binary_float_fast(binary::BinOp::Mul)),
                Opcode::DivFloatFast => try_op!(self.op_binary_float_fast(binary::BinOp::Div)),
                Opcode::LtIntFast => try_op!(self.op_compare_int_fast(compare::CmpOp::Lt)),
                Opcode::LeIntFast => try_op!(self.op_compare_int_fast(compare::CmpOp::Le)),
                Opcode::GtIntFast => try_op!(self.op_compare_int_fast(compare::CmpOp::Gt)),
                Opcode::GeIntFast => try_op!(self.op_compare_int_fast(compare::CmpOp::Ge)),
                Opcode::EqIntFast => try_op!(self.op_compare_eq_int_fast(false)),
                Opcode::NeIntFast => try_op!(self.op_compare_eq_int_fast(true)),
                Opcode::LtIntJumpIfFalse
                | Opcode::LeIntJumpIfFalse
                | Opcode::GtIntJumpIfFalse
                | Opcode::GeIntJumpIfFalse
                | Opcode::EqIntJumpIfFalse
                | Opcode::NeIntJumpIfFalse => {
                    let offset = self.fetch_i16();
                    let truth = try_op!(self.fused_compare_value(opcode));
                    if !truth {
                        self.jump_rel(offset);
                    }
                }

                // ====================================================
                // Control flow
                // ====================================================
                Opcode::Jump => {
                    let offset = self.fetch_i16();
                    self.jump_rel(offset);
                }
                Opcode::PopJumpIfTrue => {
                    let offset = self.fetch_i16();
                    let value = self.pop();
                    let truth = try_op!(self.value_truth(&value));
                    value.drop_with_heap(self.heap);
                    if truth {
                        self.jump_rel(offset);
                    }
                }
                Opcode::PopJumpIfFalse => {
                    let offset = self.fetch_i16();
                    let value = self.pop();
                    let truth = try_op!(self.value_truth(&value));
                    value.drop_with_heap(self.heap);
                    if !truth {
                        self.jump_rel(offset);
                    }
                }
                Opcode::JumpIfTrueOrPop => {
                    let offset = self.fetch_i16();
                    let probe = self.peek().clone_with_heap(self.heap);
                    let truth = try_op!(self.value_truth(&probe));
                    probe.drop_with_heap(self.heap);
                    if truth {
                        self.jump_rel(offset);
                    } else {
                        let value = self.pop();
                        value.drop_with_heap(self.heap);
                    }
                }
                Opcode::JumpIfFalseOrPop => {
                    let offset = self.fetch_i16();
                    let probe = self.peek().clone_with_heap(self.heap);
                    let truth = try_op!(self.value_truth(&probe));
                    probe.drop_with_heap(self.heap);
                    if !truth {
                        self.jump_rel(offset);
                    } else {
                        let value = self.pop();
                        value.drop_with_heap(self.heap);
                    }
                }

                // ====================================================
                // Iteration
                // ====================================================
                Opcode::GetIter => {
                    let value = self.pop();
                    let iter = try_op!(self.get_iter_value(value));
                    self.push(iter);
                }
                Opcode::ForIter => {
                    let offset = self.fetch_i16();
                    match try_op!(self.advance_top_iterator()) {
                        Some(value) => self.push(value),
                        None => {
                            let iterator = self.pop();
                            iterator.drop_with_heap(self.heap);
                            self.jump_rel(offset);
                        }
                    }
                }

                // ====================================================
                // Collection construction
                // ====================================================
                Opcode::BuildTuple => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_build_tuple(count));
                }
                Opcode::BuildList => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_build_list(count));
                }
                Opcode::BuildSet => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_build_set(count));
                }
                Opcode::BuildMap => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_build_map(count));
                }
                Opcode::BuildSlice => {
                    let argc = self.fetch_u8();
                    try_op!(self.op_build_slice(argc));
                }
                Opcode::ListAppend => {
                    let depth = usize::from(self.fetch_u8());
                    try_op!(self.op_list_append(depth));
                }
                Opcode::SetAdd => {
                    let depth = usize::from(self.fetch_u8());
                    try_op!(self.op_set_add(depth));
                }
                Opcode::MapAdd => {
                    let depth = usize::from(self.fetch_u8());
                    try_op!(self.op_map_add(depth));
                }
                Opcode::UnpackSequence => {
                    let count = usize::from(self.fetch_u8());
                    try_op!(self.op_unpack_sequence(count));
                }
                Opcode::UnpackEx => {
                    let (before, after) = self.fetch_packed();
                    try_op!(self.op_unpack_ex(usize::from(before), usize::from(after)));
                }
                Opcode::ListExtend => try_op!(self.op_list_extend()),
                Opcode::DictUpdate => try_op!(self.op_dict_update(false)),
                Opcode::DictMerge => try_op!(self.op_dict_update(true)),
                Opcode::ListToTuple => try_op!(self.op_list_to_tuple()),

                // ====================================================
                // Calls and function construction
                // ====================================================
                Opcode::Call => {
                    let argc = usize::from(self.fetch_u8());
                    match try_op!(self.op_call(argc)) {
                        CallDone::Pushed => {}
                        CallDone::Value(value) => self.push(value),
                    }
                }
                Opcode::CallKw => {
                    let argc = usize::from(self.fetch_u8());
                    match try_op!(self.op_call_kw(argc)) {
                        CallDone::Pushed => {}
                        CallDone::Value(value) => self.push(value),
                    }
                }
                Opcode::CallEx => {
                    let flags = self.fetch_u8();
                    match try_op!(self.op_call_ex(flags)) {
                        CallDone::Pushed => {}
                        CallDone::Value(value) => self.push(value),
                    }
                }
                Opcode::MakeFunction => {
                    let flags = self.fetch_u8();
                    let code_idx = self.fetch_u16();
                    try_op!(self.op_make_function(flags, code_idx));
                }

                // ====================================================
                // Return / yield
                // ====================================================
                Opcode::ReturnValue => {
                    let value = self.pop();
                    if let Some(finished) = try_op!(self.start_return(value, floor)) {
                        return Ok(finished);
                    }
                }
                Opcode::YieldValue => {
                    let value = self.pop();
                    return self.suspend_generator(value, floor);
                }
                Opcode::YieldFrom => {
                    match try_op!(self.op_yield_from(floor)) {
                        Some(yielded) => return Ok(yielded),
                        None => {}
                    }
                }

                // ====================================================
                // Blocks and exceptions
                // ====================================================
                Opcode::SetupLoop => {
                    let offset = self.fetch_i16();
                    self.push_block(BlockKind::Loop, offset);
                }
                Opcode::SetupExcept => {
                    let offset = self.fetch_i16();
                    self.push_block(BlockKind::Except, offset);
                }
                Opcode::SetupFinally => {
                    let offset = self.fetch_i16();
                    self.push_block(BlockKind::Finally, offset);
                }
                Opcode::SetupExceptGroup => {
                    let offset = self.fetch_i16();
                    self.push_block(BlockKind::ExceptGroup, offset);
                }
                Opcode::SetupWith => {
                    let offset = self.fetch_i16();
                    try_op!(self.op_setup_with(offset));
                }
                Opcode::PopBlock => {
                    self.frame_mut().blocks.pop().expect("PopBlock on empty block stack");
                }
                Opcode::PopExcept => {
                    self.op_pop_except();
                }
                Opcode::ClearException => {
                    if let Some(exc) = self.handled_exc.pop() {
                        drop(exc);
                    }
                }
                Opcode::EndFinally => {
                    if let Some(finished) = try_op!(self.op_end_finally(floor)) {
                        return Ok(finished);
                    }
                }
                Opcode::ExceptionMatch => try_op!(self.op_exception_match()),
                Opcode::RaiseVarargs => {
                    let argc = self.fetch_u8();
                    let err = self.op_raise_varargs(argc);
                    self.handle_exception(err, floor)?;
                }
                Opcode::CheckExcGroupMatch => try_op!(self.op_check_group_match()),
                Opcode::RethrowGroupRemainder => {
                    if let Some(err) = try_op!(self.op_rethrow_group_remainder()) {
                        self.handle_exception(err, floor)?;
                    }
                }
                Opcode::WithCleanup => try_op!(self.op_with_cleanup()),

                // ====================================================
                // Import
                // ====================================================
                Opcode::ImportName => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_import_name(name));
                }
                Opcode::ImportFrom => {
                    let index = self.fetch_u16();
                    let name = self.name_at(index);
                    try_op!(self.op_import_from(name));
                }
                Opcode::ImportStar => try_op!(self.op_import_star()),

                // ====================================================
                // Pattern matching
                // ====================================================
                Opcode::MatchSequence => self.op_match_sequence(),
                Opcode::MatchStar => {
                    let min_len = usize::from(self.fetch_u16());
                    self.op_match_star(min_len);
                }
                Opcode::ExtractStar => {
                    let (before, after) = self.fetch_packed();
                    try_op!(self.op_extract_star(usize::from(before), usize::from(after)));
                }
                Opcode::MatchMapping => self.op_match_mapping(),
                Opcode::MatchKeys => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_match_keys(count));
                }
                Opcode::CopyDictWithoutKeys => {
                    let count = usize::from(self.fetch_u16());
                    try_op!(self.op_copy_dict_without_keys(count));
                }
                Opcode::MatchClass => {
                    let count = usize::from(self.fetch_u8());
                    try_op!(self.op_match_class(count));
                }
                Opcode::GetLen => {
                    let len = try_op!(self.op_get_len());
                    self.push(Value::Int(len));
                }

                // ====================================================
                // Introspection
                // ====================================================
                Opcode::LoadBuildClass => {
                    self.push(Value::Builtin(crate::builtins::Builtins::Fn(
                        crate::builtins::BuiltinFn::BuildClass,
                    )));
                }
                Opcode::GetAwaitable => try_op!(self.op_get_awaitable()),
                Opcode::GetAiter | Opcode::GetAnext => {
                    try_op!(Err::<(), RunError>(ExcType::type_error(
                        "async iteration is not supported by this engine",
                    )));
                }
            }
        }
    }

    // ==================================================================
    // Local-variable helpers (incl. the fast-local specializations)
    // ==================================================================

    fn load_local(&mut self, slot: usize) -> RunResult<()> {
        let frame = self.frame();
        let value = frame
            .locals
            .get(slot)
            .ok_or_else(|| RunError::internal("local slot out of range"))?;
        if matches!(value, Value::Undefined) {
            let name = frame.code.var_names()[slot];
            let name = self.interns.get_str(name).to_owned();
            return Err(ExcType::unbound_local_error(&name));
        }
        let value = value.clone_with_heap(self.heap);
        self.push(value);
        Ok(())
    }

    fn store_local(&mut self, slot: usize) {
        let value = self.pop();
        let frame = self.frames.last_mut().expect("no active frame");
        let old = std::mem::replace(&mut frame.locals[slot], value);
        old.drop_with_heap(self.heap);
    }

    fn delete_local(&mut self, slot: usize) -> RunResult<()> {
        let frame = self.frames.last_mut().expect("no active frame");
        if matches!(frame.locals[slot], Value::Undefined) {
            let name = frame.code.var_names()[slot];
            let name = self.interns.get_str(name).to_owned();
            return Err(ExcType::unbound_local_error(&name));
        }
        let old = std::mem::replace(&mut frame.locals[slot], Value::Undefined);
        old.drop_with_heap(self.heap);
        Ok(())
    }

    /// `locals[slot] += delta` when the local is an int; falls back to the
    /// generic add for any other shape.
    fn step_local(&mut self, slot: usize, delta: i64) -> RunResult<()> {
        let frame = self.frames.last_mut().expect("no active frame");
        if let Value::Int(current) = frame.locals[slot] {
            let next = current
                .checked_add(delta)
                .ok_or_else(|| ExcType::overflow_error("integer addition overflows 64 bits"))?;
            frame.locals[slot] = Value::Int(next);
            return Ok(());
        }
        self.load_local(slot)?;
        self.push(Value::Int(delta));
        self.op_binary(binary::BinOp::Add, true)?;
        self.store_local(slot);
        Ok(())
    }

    fn negate_local(&mut self, slot: usize) -> RunResult<()> {
        let frame = self.frames.last_mut().expect("no active frame");
        match frame.locals[slot] {
            Value::Int(current) => {
                let negated = current
                    .checked_neg()
                    .ok_or_else(|| ExcType::overflow_error("integer negation overflows 64 bits"))?;
                frame.locals[slot] = Value::Int(negated);
                Ok(())
            }
            Value::Float(current) => {
                frame.locals[slot] = Value::Float(-current);
                Ok(())
            }
            _ => {
                self.load_local(slot)?;
                self.op_unary_neg()?;
                self.store_local(slot);
                Ok(())
            }
        }
    }

    /// Push `locals[slot] + consts[idx]`, specialized for int/int.
    fn add_const_fast(&mut self, slot: usize, const_idx: u16) -> RunResult<()> {
        let constant = self.frame().code.consts()[const_idx as usize].clone();
        if let (Some(Value::Int(local)), Const::Int(rhs)) = (self.frame().locals.get(slot), &constant) {
            if let Some(sum) = local.checked_add(*rhs) {
                self.push(Value::Int(sum));
                return Ok(());
            }
        }
        self.load_local(slot)?;
        let value = self.const_to_value(&constant)?;
        self.push(value);
        self.op_binary(binary::BinOp::Add, false)
    }

    /// `locals[dst] += locals[src]`, specialized for int/int.
    fn accumulate_fast(&mut self, dst: usize, src: usize) -> RunResult<()> {
        let frame = self.frames.last_mut().expect("no active frame");
        if let (Some(Value::Int(a)), Some(Value::Int(b))) = (frame.locals.get(dst), frame.locals.get(src)) {
            if let Some(sum) = a.checked_add(*b) {
                frame.locals[dst] = Value::Int(sum);
                return Ok(());
            }
        }
        self.load_local(dst)?;
        self.load_local(src)?;
        self.op_binary(binary::BinOp::Add, true)?;
        self.store_local(dst);
        Ok(())
    }

    // ==================================================================
    // Globals / names / cells
    // ==================================================================

    fn load_global(&mut self, name: StringId) -> RunResult<()> {
        let globals_id = self.frame().globals;
        if let HeapData::Module(module) = self.heap.get(globals_id)
            && let Some(value) = module.namespace.get(&name)
        {
            let value = value.clone_with_heap(self.heap);
            self.push(value);
            return Ok(());
        }
        if let Some(value) = self.builtins.get(&name) {
            let value = value.clone_with_heap(self.heap);
            self.push(value);
            return Ok(());
        }
        Err(ExcType::name_error(self.interns.get_str(name)))
    }

    fn store_global(&mut self, name: StringId, value: Value) -> RunResult<()> {
        let globals_id = self.frame().globals;
        let HeapData::Module(module) = self.heap.get_mut(globals_id) else {
            return Err(RunError::internal("frame globals is not a module"));
        };
        let old = module.namespace.insert(name, value);
        if let Some(old) = old {
            old.drop_with_heap(self.heap);
        }
        Ok(())
    }

    fn delete_global(&mut self, name: StringId) -> RunResult<()> {
        let globals_id = self.frame().globals;
        let HeapData::Module(module) = self.heap.get_mut(globals_id) else {
            return Err(RunError::internal("frame globals is not a module"));
        };
        match module.namespace.shift_remove(&name) {
            Some(old) => {
                old.drop_with_heap(self.heap);
                Ok(())
            }
            None => Err(ExcType::name_error(self.interns.get_str(name))),
        }
    }

    /// Name lookup: class namespace, then globals, then builtins.
    fn load_name(&mut self, name: StringId) -> RunResult<()> {
        if let Some(ns) = &self.frame().class_ns
            && let Some(value) = ns.get(&name)
        {
            let value = value.clone_with_heap(self.heap);
            self.push(value);
            return Ok(());
        }
        self.load_global(name)
    }

    fn store_name(&mut self, name: StringId, value: Value) -> RunResult<()> {
        if self.frame().class_ns.is_some() {
            let frame = self.frames.last_mut().expect("no active frame");
            let ns = frame.class_ns.as_mut().expect("checked above");
            if let Some(old) = ns.insert(name, value) {
                old.drop_with_heap(self.heap);
            }
            return Ok(());
        }
        self.store_global(name, value)
    }

    fn delete_name(&mut self, name: StringId) -> RunResult<()> {
        if self.frame().class_ns.is_some() {
            let frame = self.frames.last_mut().expect("no active frame");
            let ns = frame.class_ns.as_mut().expect("checked above");
            if let Some(old) = ns.shift_remove(&name) {
                old.drop_with_heap(self.heap);
                return Ok(());
            }
            return Err(ExcType::name_error(self.interns.get_str(name)));
        }
        self.delete_global(name)
    }

    fn load_deref(&mut self, slot: usize) -> RunResult<()> {
        let cell_id = self.frame().cells[slot];
        let HeapData::Cell(value) = self.heap.get(cell_id) else {
            return Err(RunError::internal("cell slot does not hold a cell"));
        };
        if matches!(value, Value::Undefined) {
            let code = &self.frame().code;
            let name = code
                .cell_vars()
                .iter()
                .chain(code.free_vars().iter())
                .nth(slot)
                .copied()
                .unwrap_or_default();
            return Err(ExcType::name_error(self.interns.get_str(name)));
        }
        let value = value.clone_with_heap(self.heap);
        self.push(value);
        Ok(())
    }

    fn cell_value_mut(&mut self, cell_id: HeapId) -> &mut Value {
        match self.heap.get_mut(cell_id) {
            HeapData::Cell(value) => value,
            _ => panic!("cell slot does not hold a cell"),
        }
    }

    // ==================================================================
    // Blocks
    // ==================================================================

    pub(crate) fn push_block(&mut self, kind: BlockKind, offset: i16) {
        let handler_base = self.frame().ip;
        let handler = usize::try_from(
            i64::try_from(handler_base).expect("ip fits i64") + i64::from(offset),
        )
        .expect("block handler offset out of range");
        let stack_level = self.stack.len();
        let exc_depth = self.handled_exc.len();
        self.frame_mut().blocks.push(Block {
            kind,
            handler,
            stack_level,
            exc_depth,
        });
    }

    /// Handles `ReturnValue`, routing the value through open `finally` and
    /// `with` blocks before actually leaving the frame.
    fn start_return(&mut self, value: Value, floor: usize) -> RunResult<Option<Finished>> {
        let mut value = value;
        loop {
            let Some(block) = self.frame_mut().blocks.pop() else {
                break;
            };
            match block.kind {
                BlockKind::Loop | BlockKind::Except | BlockKind::ExceptGroup => {
                    self.truncate_stack(block.stack_level);
                }
                BlockKind::Handler => {
                    self.handled_exc.truncate(block.exc_depth);
                }
                BlockKind::Finally => {
                    self.truncate_stack(block.stack_level);
                    self.push(value);
                    self.push(Value::Int(WHY_RETURN));
                    self.frame_mut().ip = block.handler;
                    return Ok(None);
                }
                BlockKind::With => {
                    self.truncate_stack(block.stack_level);
                    let exit_method = self.pop();
                    let result = self.call_to_completion(
                        exit_method,
                        ArgValues::Many(vec![Value::None, Value::None, Value::None]),
                    );
                    match result {
                        Ok(result) => result.drop_with_heap(self.heap),
                        Err(err) => {
                            value.drop_with_heap(self.heap);
                            return Err(err);
                        }
                    }
                }
            }
        }

        // No interception: leave the frame.
        let frame = self.frames.pop().expect("no active frame");
        self.tracer.on_frame_pop(self.frames.len());
        self.cleanup_frame(frame);
        if self.frames.len() == floor {
            return Ok(Some(Finished::Returned(value)));
        }
        self.push(value);
        Ok(None)
    }

    pub(crate) fn truncate_stack(&mut self, level: usize) {
        while self.stack.len() > level {
            let value = self.pop();
            value.drop_with_heap(self.heap);
        }
    }

    // ==================================================================
    // Shared value helpers (dunder-aware wrappers live in compare/attr)
    // ==================================================================

    /// Truthiness, calling `__bool__`/`__len__` on instances.
    pub(crate) fn value_truth(&mut self, value: &Value) -> RunResult<bool> {
        if let Value::Ref(id) = value
            && matches!(self.heap.get(*id), HeapData::Instance(_))
        {
            if let Some(result) = self.call_dunder(value, crate::intern::StaticStrings::DunderBool.into(), ArgValues::Empty)? {
                return match result {
                    Value::Bool(b) => Ok(b),
                    other => {
                        let type_name = other.type_name(self.heap, self.interns);
                        other.drop_with_heap(self.heap);
                        Err(ExcType::type_error(format!("__bool__ should return bool, returned {type_name}")))
                    }
                };
            }
            if let Some(result) = self.call_dunder(value, crate::intern::StaticStrings::DunderLen.into(), ArgValues::Empty)? {
                return match result {
                    Value::Int(n) => Ok(n != 0),
                    Value::Bool(b) => Ok(b),
                    other => {
                        let type_name = other.type_name(self.heap, self.interns);
                        other.drop_with_heap(self.heap);
                        Err(ExcType::type_error(format!("__len__ should return int, returned {type_name}")))
                    }
                };
            }
        }
        Ok(py_truth(value, self.heap, self.interns))
    }

    /// `str()` rendering, honoring `__str__`/`__repr__` on instances.
    pub(crate) fn value_str(&mut self, value: &Value) -> RunResult<String> {
        if let Some(result) = self.instance_stringify(value, crate::intern::StaticStrings::DunderStr.into())? {
            return Ok(result);
        }
        Ok(crate::value::py_str(value, self.heap, self.interns))
    }

    /// `repr()` rendering, honoring `__repr__` on instances.
    pub(crate) fn value_repr(&mut self, value: &Value) -> RunResult<String> {
        if let Some(result) = self.instance_stringify(value, crate::intern::StaticStrings::DunderRepr.into())? {
            return Ok(result);
        }
        Ok(crate::value::py_repr(value, self.heap, self.interns))
    }

    fn instance_stringify(&mut self, value: &Value, name: StringId) -> RunResult<Option<String>> {
        let Value::Ref(id) = value else { return Ok(None) };
        if !matches!(self.heap.get(*id), HeapData::Instance(_)) {
            return Ok(None);
        }
        let Some(result) = self.call_dunder(value, name, ArgValues::Empty)? else {
            // __str__ falls back to __repr__ before the default rendering.
            if name == crate::intern::StaticStrings::DunderStr.into() {
                return self.instance_stringify(value, crate::intern::StaticStrings::DunderRepr.into());
            }
            return Ok(None);
        };
        let Some(text) = result.as_str(self.heap, self.interns).map(str::to_owned) else {
            let type_name = result.type_name(self.heap, self.interns);
            result.drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!("__str__ returned non-string (type {type_name})")));
        };
        result.drop_with_heap(self.heap);
        Ok(Some(text))
    }

    /// Allocates a heap string value.
    pub(crate) fn make_str(&mut self, text: String) -> RunResult<Value> {
        let id = self.heap.allocate(HeapData::Str(crate::types::Str::from(text)))?;
        Ok(Value::Ref(id))
    }

    /// Creates the root frame for a module body and runs it to completion.
    pub fn run_module(&mut self, code: Rc<Code>, module_id: HeapId) -> RunResult<Value> {
        let floor = self.frames.len();
        self.heap.inc_ref(module_id);
        let name = crate::intern::StaticStrings::Module.into();
        let mut frame = Frame::new(code, self.stack.len(), module_id, name);
        frame.cells = self.make_cells(&frame.code)?;
        self.push_frame(frame)?;
        match self.run_until(floor) {
            Ok(Finished::Returned(value)) => Ok(value),
            Ok(Finished::Yielded(_)) => Err(RunError::internal("module body yielded")),
            Err(err) => Err(err),
        }
    }

    /// Allocates fresh cells for a code object's `cell_vars`; `free_vars`
    /// slots are appended by the caller from the closure.
    pub(crate) fn make_cells(&mut self, code: &Rc<Code>) -> RunResult<Vec<HeapId>> {
        let mut cells = Vec::with_capacity(code.cell_count());
        for _ in code.cell_vars() {
            let id = self.heap.allocate(HeapData::Cell(Value::Undefined))?;
            cells.push(id);
        }
        Ok(cells)
    }
}
