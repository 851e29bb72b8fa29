//! Generator and coroutine resumption.
//!
//! Resuming means temporarily installing the generator's frame as the
//! engine's current frame and running until the next yield or return.
//! The object keeps private copies of the engine state it owns: the
//! operand-stack segment above its base, and the handled-exception
//! entries pushed inside it — so nested generators compose. Block-stack
//! levels are stored relative to the frame base across suspensions and
//! rebased on resume.

use crate::{
    except::{ExcInstance, ExcPayload, ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::GenState,
    value::Value,
};

use super::{Finished, Vm};
use crate::bytecode::Opcode;

/// What a resumption delivers into the suspended frame.
pub(crate) enum ResumeWith {
    /// `send(v)` / `__next__` (`v = None`).
    Send(Value),
    /// `throw(exc)`: injected through the frame's block stack.
    Throw(ExcInstance),
}

/// How the generator left the dispatcher.
pub(crate) enum GenOutcome {
    Yielded(Value),
    Returned(Value),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Resumes a generator/coroutine, re-entering the dispatcher.
    pub(crate) fn resume_generator(&mut self, gen_id: HeapId, input: ResumeWith) -> RunResult<GenOutcome> {
        // Extract the suspended frame, validating the FSM.
        let (mut frame, saved_stack, saved_handled, started) = {
            let HeapData::Generator(generator) = self.heap.get_mut(gen_id) else {
                return Err(RunError::internal("resume_generator on non-generator"));
            };
            match generator.state {
                GenState::Running => {
                    if let ResumeWith::Send(value) = input {
                        value.drop_with_heap(self.heap);
                    }
                    return Err(ExcType::value_error("generator already executing"));
                }
                GenState::Closed => {
                    if let ResumeWith::Send(value) = input {
                        value.drop_with_heap(self.heap);
                    }
                    return Err(ExcType::stop_iteration());
                }
                GenState::Created | GenState::Suspended => {}
            }
            let started = generator.state == GenState::Suspended;
            generator.state = GenState::Running;
            let frame = generator.frame.take().expect("suspended generator owns its frame");
            let saved_stack = std::mem::take(&mut generator.saved_stack);
            let saved_handled = std::mem::take(&mut generator.saved_handled);
            (frame, saved_stack, saved_handled, started)
        };

        if !started
            && let ResumeWith::Send(value) = &input
            && !matches!(value, Value::None)
        {
            // Undo the Running transition before erroring.
            self.park_generator(gen_id, frame, saved_stack, saved_handled, GenState::Created);
            if let ResumeWith::Send(value) = input {
                value.drop_with_heap(self.heap);
            }
            return Err(ExcType::type_error("can't send non-None value to a just-started generator"));
        }

        // Install the frame: rebase the stack segment, block levels, and
        // handled-exception depths onto the current engine state.
        let floor = self.frames.len();
        frame.stack_base = self.stack.len();
        frame.exc_base = self.handled_exc.len();
        for block in &mut frame.blocks {
            block.stack_level += frame.stack_base;
            block.exc_depth += frame.exc_base;
        }
        frame.gen_id = Some(gen_id);
        self.stack.extend(saved_stack);
        self.handled_exc.extend(saved_handled);
        self.push_frame(frame)?;

        match input {
            ResumeWith::Send(value) => {
                if started {
                    self.push(value);
                } else {
                    value.drop_with_heap(self.heap);
                }
            }
            ResumeWith::Throw(exc) => {
                if let Some(outcome) = self.delegate_throw(exc, floor, gen_id)? {
                    return Ok(outcome);
                }
            }
        }

        self.drive_generator(gen_id, floor)
    }

    /// Runs an installed generator frame to its next suspension point.
    fn drive_generator(&mut self, gen_id: HeapId, floor: usize) -> RunResult<GenOutcome> {
        match self.run_until(floor) {
            Ok(Finished::Yielded(value)) => Ok(GenOutcome::Yielded(value)),
            Ok(Finished::Returned(value)) => {
                self.close_generator_state(gen_id);
                Ok(GenOutcome::Returned(value))
            }
            Err(err) => {
                self.close_generator_state(gen_id);
                Err(err)
            }
        }
    }

    /// Routes a thrown exception, delegating through `yield from` when
    /// the frame is parked on one with a sub-generator on top.
    ///
    /// Returns `Some` when the delegation already produced an outcome.
    fn delegate_throw(&mut self, exc: ExcInstance, floor: usize, gen_id: HeapId) -> RunResult<Option<GenOutcome>> {
        let delegation = {
            let frame = self.frame();
            let at_yield_from = frame
                .code
                .bytecode()
                .get(frame.ip)
                .is_some_and(|&byte| byte == Opcode::YieldFrom as u8);
            if at_yield_from {
                match self.peek() {
                    Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Generator(_)) => Some(*id),
                    _ => None,
                }
            } else {
                None
            }
        };

        match delegation {
            Some(sub_id) => match self.resume_generator(sub_id, ResumeWith::Throw(exc)) {
                Ok(GenOutcome::Yielded(value)) => {
                    // The sub-generator handled the throw and yielded:
                    // the outer frame suspends again at the same spot.
                    let yielded = self.suspend_generator(value, floor)?;
                    let Finished::Yielded(value) = yielded else {
                        return Err(RunError::internal("suspension produced a return"));
                    };
                    Ok(Some(GenOutcome::Yielded(value)))
                }
                Ok(GenOutcome::Returned(value)) => {
                    // Sub-generator finished: its return value replaces the
                    // iterator and the delegation opcode is skipped.
                    let iterator = self.pop();
                    iterator.drop_with_heap(self.heap);
                    self.push(value);
                    self.frame_mut().ip += 1;
                    Ok(None)
                }
                Err(err) => {
                    self.handle_exception(err, floor).map_err(|err| {
                        self.close_generator_state(gen_id);
                        err
                    })?;
                    Ok(None)
                }
            },
            None => {
                self.handle_exception(RunError::Exc(Box::new(exc)), floor).map_err(|err| {
                    self.close_generator_state(gen_id);
                    err
                })?;
                Ok(None)
            }
        }
    }

    /// `YieldValue`: parks the generator frame and leaves the dispatcher.
    pub(super) fn suspend_generator(&mut self, value: Value, floor: usize) -> RunResult<Finished> {
        let Some(gen_id) = self.frame().gen_id else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("yield outside a generator frame"));
        };
        if self.frames.len() != floor + 1 {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("yield crossed a call boundary"));
        }
        let mut frame = self.frames.pop().expect("generator frame present");
        self.tracer.on_frame_pop(self.frames.len());
        frame.gen_id = None;

        let saved_stack = self.stack.split_off(frame.stack_base);
        let saved_handled = self.handled_exc.split_off(frame.exc_base);
        // Block levels become frame-relative across the suspension.
        for block in &mut frame.blocks {
            block.stack_level -= frame.stack_base;
            block.exc_depth -= frame.exc_base;
        }
        self.park_generator(gen_id, frame, saved_stack, saved_handled, GenState::Suspended);
        Ok(Finished::Yielded(value))
    }

    fn park_generator(
        &mut self,
        gen_id: HeapId,
        frame: super::Frame,
        saved_stack: Vec<Value>,
        saved_handled: Vec<ExcInstance>,
        state: GenState,
    ) {
        let HeapData::Generator(generator) = self.heap.get_mut(gen_id) else {
            panic!("park_generator on non-generator");
        };
        generator.frame = Some(frame);
        generator.saved_stack = saved_stack;
        generator.saved_handled = saved_handled;
        generator.state = state;
    }

    fn close_generator_state(&mut self, gen_id: HeapId) {
        if let HeapData::Generator(generator) = self.heap.get_mut(gen_id) {
            generator.state = GenState::Closed;
            // The frame was consumed by the return/unwind; release any
            // leftovers parked on the object.
            let leftovers = std::mem::take(&mut generator.saved_stack);
            let frame = generator.frame.take();
            for value in leftovers {
                value.drop_with_heap(self.heap);
            }
            if let Some(frame) = frame {
                let mut refs = Vec::new();
                frame.collect_refs(&mut refs);
                for id in refs {
                    self.heap.dec_ref(id);
                }
            }
        }
    }

    /// `close()`: throw GeneratorExit, absorbing it if the generator
    /// complies.
    pub(crate) fn close_generator(&mut self, gen_id: HeapId) -> RunResult<()> {
        let state = {
            let HeapData::Generator(generator) = self.heap.get(gen_id) else {
                return Err(RunError::internal("close on non-generator"));
            };
            generator.state
        };
        match state {
            GenState::Closed => Ok(()),
            GenState::Created => {
                // Never started: close without running the body.
                self.close_generator_state(gen_id);
                Ok(())
            }
            GenState::Running => Err(ExcType::value_error("generator already executing")),
            GenState::Suspended => {
                let exit = ExcInstance::new(ExcType::GeneratorExit);
                match self.resume_generator(gen_id, ResumeWith::Throw(exit)) {
                    Ok(GenOutcome::Returned(value)) => {
                        value.drop_with_heap(self.heap);
                        Ok(())
                    }
                    Ok(GenOutcome::Yielded(value)) => {
                        value.drop_with_heap(self.heap);
                        Err(ExcInstance::with_message(ExcType::RuntimeError, "generator ignored GeneratorExit").into())
                    }
                    Err(err) if err.is_exception_type(ExcType::GeneratorExit) => Ok(()),
                    Err(err) if err.is_stop_iteration() => Ok(()),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// `send(v)` driver shared by the generator method and `yield from`.
    pub(crate) fn send_into_generator(&mut self, gen_id: HeapId, value: Value) -> RunResult<GenOutcome> {
        self.resume_generator(gen_id, ResumeWith::Send(value))
    }

    /// `YieldFrom`: delegate to the sub-iterator at TOS1 with the sent
    /// value at TOS. Yields what the sub-iterator yields, rewinding the
    /// instruction pointer so resumption re-enters the delegation; on
    /// exhaustion the sub-iterator's return value replaces it.
    pub(super) fn op_yield_from(&mut self, floor: usize) -> RunResult<Option<Finished>> {
        let sent = self.pop();
        let delegate = {
            match self.peek() {
                Value::Ref(id) => Some(*id),
                _ => None,
            }
        };
        let Some(delegate_id) = delegate else {
            sent.drop_with_heap(self.heap);
            return Err(ExcType::type_error("cannot 'yield from' a non-iterator"));
        };

        enum Target {
            Gen,
            Iter,
        }
        let target = match self.heap.get(delegate_id) {
            HeapData::Generator(_) => Target::Gen,
            HeapData::Iter(_) => Target::Iter,
            _ => {
                sent.drop_with_heap(self.heap);
                return Err(ExcType::type_error("cannot 'yield from' a non-iterator"));
            }
        };

        match target {
            Target::Gen => match self.send_into_generator(delegate_id, sent)? {
                GenOutcome::Yielded(value) => {
                    // Rewind so the next resume re-executes this opcode.
                    self.frame_mut().ip = self.instruction_ip;
                    Ok(Some(self.suspend_generator(value, floor)?))
                }
                GenOutcome::Returned(value) => {
                    let iterator = self.pop();
                    iterator.drop_with_heap(self.heap);
                    self.push(value);
                    Ok(None)
                }
            },
            Target::Iter => {
                sent.drop_with_heap(self.heap);
                match self.iter_next_by_id(delegate_id)? {
                    Some(value) => {
                        self.frame_mut().ip = self.instruction_ip;
                        Ok(Some(self.suspend_generator(value, floor)?))
                    }
                    None => {
                        let iterator = self.pop();
                        iterator.drop_with_heap(self.heap);
                        // Plain iterators return None on exhaustion.
                        self.push(Value::None);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// `GetAwaitable`: validates TOS is awaitable (a coroutine).
    pub(super) fn op_get_awaitable(&mut self) -> RunResult<()> {
        let value = self.peek();
        if let Value::Ref(id) = value
            && let HeapData::Generator(generator) = self.heap.get(*id)
            && generator.kind == crate::types::GenKind::Coroutine
        {
            return Ok(());
        }
        let message = format!(
            "object {} can't be used in 'await' expression",
            self.peek().type_name(self.heap, self.interns)
        );
        let value = self.pop();
        value.drop_with_heap(self.heap);
        Err(ExcType::type_error(message))
    }

    /// Converts a generator return into the StopIteration carrying it.
    pub(crate) fn stop_iteration_with_value(&mut self, value: Value) -> RunError {
        let payload = match &value {
            Value::None => None,
            Value::Bool(b) => Some(ExcPayload::Bool(*b)),
            Value::Int(i) => Some(ExcPayload::Int(*i)),
            Value::Float(f) => Some(ExcPayload::Float(*f)),
            other => Some(ExcPayload::Str(crate::value::py_str(other, self.heap, self.interns))),
        };
        value.drop_with_heap(self.heap);
        match payload {
            Some(payload) => ExcInstance::with_payload(ExcType::StopIteration, payload).into(),
            None => ExcType::stop_iteration(),
        }
    }
}
