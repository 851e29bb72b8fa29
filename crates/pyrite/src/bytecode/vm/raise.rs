//! Raise, match, unwind, finally, and `except*` support.
//!
//! The unwinder walks the current frame's block stack newest-first:
//! except blocks receive the exception and jump to their handler, finally
//! blocks run with the obligation to re-raise via `EndFinally`, loop
//! blocks are discarded, with blocks invoke `__exit__` (which may
//! suppress). When the block stack is exhausted the frame is popped, a
//! traceback entry is appended, and unwinding continues in the caller.
//! Execution-control signals and internal errors bypass user handlers
//! entirely but still unwind frames for traceback accumulation.

use crate::{
    args::ArgValues,
    builtins::Builtins,
    except::{ExcInstance, ExcPayload, ExcType, FrameInfo, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{StaticStrings, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

use super::{Block, BlockKind, Finished, Vm, WHY_RETURN};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    // ==================================================================
    // The unwinder
    // ==================================================================

    /// Routes a raised error to a handler, or returns it if none catches.
    ///
    /// `Ok(())` means a handler (or a finally/with interception) was
    /// armed and the dispatch loop should continue; `Err` means the
    /// error escaped past `floor`.
    pub(crate) fn handle_exception(&mut self, mut err: RunError, floor: usize) -> Result<(), RunError> {
        if matches!(err, RunError::Internal(_)) {
            return Err(err);
        }
        let catchable = matches!(err, RunError::Exc(_));

        match &mut err {
            RunError::Exc(exc) | RunError::UncatchableExc(exc) => {
                if exc.trace.is_empty() {
                    let info = self.current_frame_info();
                    exc.push_frame(info);
                }
            }
            RunError::Internal(_) => {}
        }
        // Implicit context: the exception currently being handled.
        if let RunError::Exc(exc) = &mut err
            && let Some(active) = self.handled_exc.last()
        {
            exc.set_context(active.clone());
        }

        loop {
            while let Some(block) = self.frame_mut().blocks.pop() {
                match block.kind {
                    BlockKind::Loop => {
                        self.truncate_stack(block.stack_level);
                    }
                    BlockKind::Handler => {
                        self.handled_exc.truncate(block.exc_depth);
                    }
                    BlockKind::Except | BlockKind::ExceptGroup if catchable => {
                        self.truncate_stack(block.stack_level);
                        let RunError::Exc(exc) = err else { unreachable!() };
                        // The handler body runs with this exception active.
                        let exc_depth = self.handled_exc.len();
                        self.frame_mut().blocks.push(Block {
                            kind: BlockKind::Handler,
                            handler: 0,
                            stack_level: block.stack_level,
                            exc_depth,
                        });
                        self.handled_exc.push((*exc).clone());
                        let value = self.alloc_exc_value(*exc)?;
                        self.push(value);
                        self.frame_mut().ip = block.handler;
                        return Ok(());
                    }
                    BlockKind::Finally if catchable => {
                        self.truncate_stack(block.stack_level);
                        let RunError::Exc(exc) = err else { unreachable!() };
                        let value = self.alloc_exc_value(*exc)?;
                        self.push(value);
                        self.frame_mut().ip = block.handler;
                        return Ok(());
                    }
                    BlockKind::With if catchable => {
                        self.truncate_stack(block.stack_level);
                        let exit_method = self.pop();
                        let RunError::Exc(exc) = err else { unreachable!() };
                        let exc_class = Value::Builtin(Builtins::ExcClass(exc.exc_type));
                        let exc_value = self.alloc_exc_value((*exc).clone())?;
                        let outcome = self.call_to_completion(
                            exit_method,
                            ArgValues::Many(vec![exc_class, exc_value, Value::None]),
                        );
                        match outcome {
                            Ok(result) => {
                                let suppress = self.value_truth(&result)?;
                                result.drop_with_heap(self.heap);
                                if suppress {
                                    self.frame_mut().ip = block.handler;
                                    return Ok(());
                                }
                                err = RunError::Exc(exc);
                            }
                            Err(exit_err) => {
                                // __exit__ raised: it replaces the original,
                                // which becomes its context.
                                err = exit_err;
                                if let RunError::Exc(new_exc) = &mut err {
                                    new_exc.set_context(*exc);
                                }
                            }
                        }
                    }
                    // Uncatchable errors discard every block.
                    _ => {
                        self.truncate_stack(block.stack_level);
                        if block.kind == BlockKind::Handler {
                            self.handled_exc.truncate(block.exc_depth);
                        }
                    }
                }
            }

            // No handler here: pop the frame and continue in the caller.
            let frame = self.frames.pop().expect("no active frame during unwind");
            self.tracer.on_frame_pop(self.frames.len());
            self.cleanup_frame(frame);
            if self.frames.len() <= floor {
                return Err(err);
            }
            let info = self.caller_frame_info();
            err.push_frame(info);
        }
    }

    /// Traceback entry for the frame now on top (a caller mid-call).
    fn caller_frame_info(&self) -> FrameInfo {
        let frame = self.frame();
        FrameInfo {
            file: frame.code.filename(),
            line: frame.code.line_for_offset(frame.ip.saturating_sub(1)),
            name: frame.name,
        }
    }

    /// Allocates the heap value handlers bind with `as e`.
    pub(crate) fn alloc_exc_value(&mut self, exc: ExcInstance) -> Result<Value, RunError> {
        let id = self.heap.allocate(HeapData::Exception(exc))?;
        Ok(Value::Ref(id))
    }

    // ==================================================================
    // Raise
    // ==================================================================

    /// `RaiseVarargs`: 0 = re-raise, 1 = `raise e`, 2 = `raise e from c`.
    pub(super) fn op_raise_varargs(&mut self, argc: u8) -> RunError {
        match argc {
            0 => match self.handled_exc.last() {
                Some(active) => RunError::Exc(Box::new(active.clone())),
                None => ExcInstance::with_message(ExcType::RuntimeError, "No active exception to re-raise").into(),
            },
            1 => {
                let value = self.pop();
                self.exception_from_value(value, None)
            }
            2 => {
                let cause = self.pop();
                let value = self.pop();
                self.exception_from_value(value, Some(cause))
            }
            _ => RunError::internal("RaiseVarargs operand out of range"),
        }
    }

    /// Builds the raise error from an arbitrary value, per the
    /// construction rules (classes instantiate, strings wrap, anything
    /// else is a TypeError).
    pub(crate) fn exception_from_value(&mut self, value: Value, cause: Option<Value>) -> RunError {
        let mut exc = match self.coerce_exc_instance(value) {
            Ok(exc) => exc,
            Err(err) => return err,
        };
        if let Some(cause_value) = cause {
            if matches!(cause_value, Value::None) {
                // `from None`: suppress context with no cause.
                exc.set_cause(None);
            } else {
                match self.coerce_exc_instance(cause_value) {
                    Ok(cause_exc) => exc.set_cause(Some(cause_exc)),
                    Err(err) => return err,
                }
            }
        }
        RunError::Exc(Box::new(exc))
    }

    /// Converts a raised value into an exception instance.
    pub(crate) fn coerce_exc_instance(&mut self, value: Value) -> Result<ExcInstance, RunError> {
        match &value {
            Value::Builtin(Builtins::ExcClass(exc_type)) => Ok(ExcInstance::new(*exc_type)),
            Value::InternString(id) => {
                // Legacy path: a bare string raises a generic Exception.
                let text = self.interns.get_str(*id).to_owned();
                Ok(ExcInstance::with_message(ExcType::Exception, text))
            }
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Exception(exc) => {
                        let exc = exc.clone();
                        value.drop_with_heap(self.heap);
                        Ok(exc)
                    }
                    HeapData::Str(s) => {
                        let text = s.as_str().to_owned();
                        value.drop_with_heap(self.heap);
                        Ok(ExcInstance::with_message(ExcType::Exception, text))
                    }
                    HeapData::Class(class) => {
                        if class.exc_base.is_none() {
                            value.drop_with_heap(self.heap);
                            return Err(ExcType::type_error("exceptions must derive from BaseException"));
                        }
                        // `raise C`: instantiate with no arguments.
                        let result = self.call_value(value, ArgValues::Empty);
                        match result {
                            Ok(super::call::CallDone::Value(instance)) => self.coerce_exc_instance(instance),
                            Ok(super::call::CallDone::Pushed) => {
                                Err(RunError::internal("class call left a frame pending"))
                            }
                            Err(err) => Err(err),
                        }
                    }
                    HeapData::Instance(_) => {
                        let exc = self.instance_to_exc(id);
                        value.drop_with_heap(self.heap);
                        exc.ok_or_else(|| ExcType::type_error("exceptions must derive from BaseException"))
                    }
                    _ => {
                        value.drop_with_heap(self.heap);
                        Err(ExcType::type_error("exceptions must derive from BaseException"))
                    }
                }
            }
            _ => {
                value.drop_with_heap(self.heap);
                Err(ExcType::type_error("exceptions must derive from BaseException"))
            }
        }
    }

    /// Converts a user exception instance to the raise representation:
    /// builtin base from the MRO, class-name chain for `except` matching,
    /// message from the stored `args`.
    fn instance_to_exc(&mut self, instance_id: HeapId) -> Option<ExcInstance> {
        let class_id = self.class_of_instance(instance_id)?;
        let (exc_base, mro_names) = {
            let HeapData::Class(class) = self.heap.get(class_id) else {
                return None;
            };
            let mut exc_base = None;
            let mut names = Vec::with_capacity(class.mro.len());
            for &ancestor_id in &class.mro {
                let HeapData::Class(ancestor) = self.heap.get(ancestor_id) else {
                    continue;
                };
                names.push(self.interns.get_str(ancestor.name).to_owned());
                if exc_base.is_none() {
                    exc_base = ancestor.exc_base;
                }
            }
            (exc_base?, names)
        };

        let args: Vec<ExcPayload> = {
            let HeapData::Instance(instance) = self.heap.get(instance_id) else {
                return None;
            };
            instance
                .attrs
                .as_ref()
                .and_then(|attrs| attrs.get(&StringId::from(StaticStrings::Args)))
                .map(|stored| self.value_to_payloads(stored))
                .unwrap_or_default()
        };

        let mut exc = ExcInstance::new(exc_base);
        exc.custom_class_name = mro_names.first().cloned();
        exc.custom_mro_names = mro_names;
        exc.message = match args.as_slice() {
            [] => None,
            [single] => Some(single.to_string()),
            many => Some(format!(
                "({})",
                many.iter().map(ExcPayload::to_string).collect::<Vec<_>>().join(", ")
            )),
        };
        exc.args = args;
        Some(exc)
    }

    /// Flattens a stored `args` tuple into scalar payloads.
    fn value_to_payloads(&self, stored: &Value) -> Vec<ExcPayload> {
        let items: Vec<&Value> = match stored {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(tuple) => tuple.items().iter().collect(),
                _ => vec![stored],
            },
            other => vec![other],
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::None => ExcPayload::None,
                Value::Bool(b) => ExcPayload::Bool(*b),
                Value::Int(i) => ExcPayload::Int(*i),
                Value::Float(f) => ExcPayload::Float(*f),
                other => ExcPayload::Str(crate::value::py_str(other, self.heap, self.interns)),
            })
            .collect()
    }

    // ==================================================================
    // Handler-side opcodes
    // ==================================================================

    /// `ExceptionMatch`: TOS the handler class (or tuple), beneath it the
    /// exception value, which stays put. Pushes the match verdict.
    pub(super) fn op_exception_match(&mut self) -> RunResult<()> {
        let handler = self.pop();
        let matched = {
            let exc_value = self.peek();
            let Some(exc) = self.exc_ref_from_value(exc_value) else {
                handler.drop_with_heap(self.heap);
                return Err(RunError::internal("ExceptionMatch on a non-exception"));
            };
            self.exception_matches(&exc, &handler)?
        };
        handler.drop_with_heap(self.heap);
        self.push(Value::Bool(matched));
        Ok(())
    }

    fn exc_ref_from_value(&self, value: &Value) -> Option<ExcInstance> {
        if let Value::Ref(id) = value
            && let HeapData::Exception(exc) = self.heap.get(*id)
        {
            return Some(exc.clone());
        }
        None
    }

    /// Whether `except handler:` catches `exc`.
    pub(crate) fn exception_matches(&self, exc: &ExcInstance, handler: &Value) -> RunResult<bool> {
        match handler {
            Value::Builtin(Builtins::ExcClass(exc_type)) => Ok(exc.matches_builtin(*exc_type)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Class(class) => {
                    let name = self.interns.get_str(class.name);
                    Ok(exc.matches_class_name(name)
                        || class.exc_base.is_some_and(|base| exc.custom_mro_names.is_empty() && exc.matches_builtin(base)))
                }
                HeapData::Tuple(tuple) => {
                    for item in tuple.items() {
                        if self.exception_matches(exc, item)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(ExcType::type_error(
                    "catching classes that do not inherit from BaseException is not allowed",
                )),
            },
            _ => Err(ExcType::type_error(
                "catching classes that do not inherit from BaseException is not allowed",
            )),
        }
    }

    /// `PopExcept`: leave a handler body.
    pub(super) fn op_pop_except(&mut self) {
        // Remove the Handler block pushed when the handler was entered.
        let block = {
            let frame = self.frame_mut();
            frame
                .blocks
                .iter()
                .rposition(|b| b.kind == BlockKind::Handler)
                .map(|position| frame.blocks.remove(position))
        };
        match block {
            Some(block) => self.handled_exc.truncate(block.exc_depth),
            None => {
                self.handled_exc.pop();
            }
        }
    }

    /// `EndFinally`: act on the marker the finally protocol left at TOS.
    pub(super) fn op_end_finally(&mut self, floor: usize) -> RunResult<Option<Finished>> {
        let marker = self.pop();
        match marker {
            // Normal fall-through.
            Value::None => Ok(None),
            // A return value is waiting beneath the marker.
            Value::Int(WHY_RETURN) => {
                let value = self.pop();
                self.start_return(value, floor)
            }
            // A pending exception resumes unwinding.
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Exception(_)) => {
                let HeapData::Exception(exc) = self.heap.get(id) else { unreachable!() };
                let err = RunError::Exc(Box::new(exc.clone()));
                marker.drop_with_heap(self.heap);
                self.handle_exception(err, floor)?;
                Ok(None)
            }
            other => {
                other.drop_with_heap(self.heap);
                Err(RunError::internal("EndFinally found an unexpected marker"))
            }
        }
    }

    // ==================================================================
    // with blocks
    // ==================================================================

    /// `SetupWith`: enter the context manager, stash `__exit__`, push the
    /// block, push the `__enter__` result.
    pub(super) fn op_setup_with(&mut self, offset: i16) -> RunResult<()> {
        let manager = self.pop();
        let exit_method = self.getattr_value(&manager, StaticStrings::DunderExit.into())?;
        let enter_method = match self.getattr_value(&manager, StaticStrings::DunderEnter.into()) {
            Ok(method) => method,
            Err(err) => {
                exit_method.drop_with_heap(self.heap);
                manager.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        manager.drop_with_heap(self.heap);
        let entered = match self.call_to_completion(enter_method, ArgValues::Empty) {
            Ok(value) => value,
            Err(err) => {
                exit_method.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        self.push(exit_method);
        self.push_block(BlockKind::With, offset);
        self.push(entered);
        Ok(())
    }

    /// `WithCleanup`: normal fall-through exit of a with body.
    pub(super) fn op_with_cleanup(&mut self) -> RunResult<()> {
        let exit_method = self.pop();
        let result = self.call_to_completion(
            exit_method,
            ArgValues::Many(vec![Value::None, Value::None, Value::None]),
        )?;
        result.drop_with_heap(self.heap);
        Ok(())
    }

    // ==================================================================
    // except* groups
    // ==================================================================

    /// `CheckExcGroupMatch`: TOS the handler class, beneath it the group.
    /// Replaces them with `[remainder_or_none, matched_or_none]`.
    pub(super) fn op_check_group_match(&mut self) -> RunResult<()> {
        let handler = self.pop();
        let group_value = self.pop();
        let Some(group) = self.exc_ref_from_value(&group_value) else {
            handler.drop_with_heap(self.heap);
            group_value.drop_with_heap(self.heap);
            return Err(RunError::internal("CheckExcGroupMatch on a non-exception"));
        };
        group_value.drop_with_heap(self.heap);

        let Value::Builtin(Builtins::ExcClass(handler_type)) = handler else {
            let message = ExcType::type_error("except* handlers must name exception classes");
            handler.drop_with_heap(self.heap);
            return Err(message);
        };

        let (matched, remainder) = group.split_group(handler_type);
        let remainder_value = match remainder {
            Some(rest) => self.alloc_exc_value(rest)?,
            None => Value::None,
        };
        let matched_value = match matched {
            Some(matched) => self.alloc_exc_value(matched)?,
            None => Value::None,
        };
        self.push(remainder_value);
        self.push(matched_value);
        Ok(())
    }

    /// `RethrowGroupRemainder`: TOS is the remainder (or None).
    pub(super) fn op_rethrow_group_remainder(&mut self) -> RunResult<Option<RunError>> {
        let remainder = self.pop();
        match &remainder {
            Value::None => {
                remainder.drop_with_heap(self.heap);
                Ok(None)
            }
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Exception(_)) => {
                let HeapData::Exception(exc) = self.heap.get(*id) else { unreachable!() };
                let err = RunError::Exc(Box::new(exc.clone()));
                remainder.drop_with_heap(self.heap);
                Ok(Some(err))
            }
            _ => {
                remainder.drop_with_heap(self.heap);
                Err(RunError::internal("RethrowGroupRemainder found a non-exception"))
            }
        }
    }

}
