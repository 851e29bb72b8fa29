//! The calling convention.
//!
//! One entry point, [`Vm::call_value`], switches on the callee's shape:
//! builtins run natively, bound methods prepend their receiver, user
//! functions get a frame with full parameter binding (positional,
//! keyword, defaults, `*args`/`**kwargs`, cell promotion), classes
//! allocate an instance and run `__init__`, and GENERATOR/COROUTINE
//! code returns a suspended generator object instead of executing.
//!
//! Calls made from inside the engine (dunders, builtin-driven callables)
//! use [`Vm::call_to_completion`], which pushes the frame and re-enters
//! the dispatch loop until that frame returns.

use std::rc::Rc;

use crate::{
    args::{ArgValues, Kwargs},
    bytecode::{Code, code::Const},
    except::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{StaticStrings, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, GenKind, Generator, Instance, Tuple, function::Function},
    value::Value,
};

use super::{Finished, Frame, Vm};

/// Result of dispatching a call opcode.
pub(super) enum CallDone {
    /// A frame was pushed; the dispatch loop continues into it.
    Pushed,
    /// The call completed natively with this value.
    Value(Value),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    // ==================================================================
    // Opcode entry points
    // ==================================================================

    pub(super) fn op_call(&mut self, argc: usize) -> RunResult<CallDone> {
        let args = ArgValues::from_vec(self.pop_n(argc));
        let callee = self.pop();
        self.call_value(callee, args)
    }

    pub(super) fn op_call_kw(&mut self, argc: usize) -> RunResult<CallDone> {
        // TOS is a tuple of keyword names; beneath are the argument
        // values, keyword values last.
        let names_value = self.pop();
        let names = self.keyword_names(&names_value)?;
        names_value.drop_with_heap(self.heap);
        if names.len() > argc {
            return Err(RunError::internal("CallKw keyword names exceed argument count"));
        }
        let mut values = self.pop_n(argc);
        let kw_values = values.split_off(argc - names.len());
        let kwargs: Kwargs = names.into_iter().zip(kw_values).collect();
        let callee = self.pop();
        self.call_value(callee, ArgValues::WithKwargs { args: values, kwargs })
    }

    fn keyword_names(&mut self, names_value: &Value) -> RunResult<Vec<StringId>> {
        enum NameRef {
            Id(StringId),
            Text(String),
        }
        let raw: Vec<NameRef> = {
            let Value::Ref(id) = names_value else {
                return Err(RunError::internal("CallKw expects a tuple of names"));
            };
            let HeapData::Tuple(tuple) = self.heap.get(*id) else {
                return Err(RunError::internal("CallKw expects a tuple of names"));
            };
            let mut raw = Vec::with_capacity(tuple.len());
            for item in tuple.items() {
                match item {
                    Value::InternString(name) => raw.push(NameRef::Id(*name)),
                    Value::Ref(sid) => {
                        let HeapData::Str(s) = self.heap.get(*sid) else {
                            return Err(RunError::internal("keyword name is not a string"));
                        };
                        raw.push(NameRef::Text(s.as_str().to_owned()));
                    }
                    _ => return Err(RunError::internal("keyword name is not a string")),
                }
            }
            raw
        };
        Ok(raw
            .into_iter()
            .map(|name| match name {
                NameRef::Id(id) => id,
                NameRef::Text(text) => self.interns.intern(&text),
            })
            .collect())
    }

    /// `f(*args)` / `f(*args, **kwargs)`.
    pub(super) fn op_call_ex(&mut self, flags: u8) -> RunResult<CallDone> {
        let kwargs_value = if flags & 1 != 0 { Some(self.pop()) } else { None };
        let args_value = self.pop();
        let callee = self.pop();

        let positional = self.collect_iterable(args_value)?;
        let mut kwargs: Kwargs = Vec::new();
        if let Some(kwargs_value) = kwargs_value {
            let Value::Ref(dict_id) = &kwargs_value else {
                let message = format!(
                    "argument after ** must be a mapping, not {}",
                    kwargs_value.type_name(self.heap, self.interns)
                );
                kwargs_value.drop_with_heap(self.heap);
                callee.drop_with_heap(self.heap);
                for value in positional {
                    value.drop_with_heap(self.heap);
                }
                return Err(ExcType::type_error(message));
            };
            let entries: Vec<(Value, Value)> = {
                let HeapData::Dict(dict) = self.heap.get(*dict_id) else {
                    let message = format!(
                        "argument after ** must be a mapping, not {}",
                        kwargs_value.type_name(self.heap, self.interns)
                    );
                    kwargs_value.drop_with_heap(self.heap);
                    callee.drop_with_heap(self.heap);
                    for value in positional {
                        value.drop_with_heap(self.heap);
                    }
                    return Err(ExcType::type_error(message));
                };
                dict.iter()
                    .map(|(k, v)| (k.clone_with_heap(self.heap), v.clone_with_heap(self.heap)))
                    .collect()
            };
            kwargs_value.drop_with_heap(self.heap);
            for (key, value) in entries {
                let Some(name) = key.as_str(self.heap, self.interns).map(str::to_owned) else {
                    key.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    callee.drop_with_heap(self.heap);
                    for v in positional {
                        v.drop_with_heap(self.heap);
                    }
                    for (_, v) in kwargs {
                        v.drop_with_heap(self.heap);
                    }
                    return Err(ExcType::type_error("keywords must be strings"));
                };
                key.drop_with_heap(self.heap);
                kwargs.push((self.interns.intern(&name), value));
            }
        }

        self.call_value(callee, ArgValues::WithKwargs { args: positional, kwargs })
    }

    pub(super) fn op_call_method(&mut self, argc: usize) -> RunResult<CallDone> {
        let args_vec = self.pop_n(argc);
        let receiver = self.pop();
        let callee = self.pop();
        let args = if matches!(receiver, Value::Undefined) {
            ArgValues::from_vec(args_vec)
        } else {
            ArgValues::from_vec(args_vec).prepend(receiver)
        };
        self.call_value(callee, args)
    }

    // ==================================================================
    // The call switch
    // ==================================================================

    /// Calls any callable shape, consuming callee and args.
    pub(crate) fn call_value(&mut self, callee: Value, args: ArgValues) -> RunResult<CallDone> {
        match &callee {
            Value::Builtin(builtin) => {
                let builtin = *builtin;
                let result = self.call_builtin(builtin, args)?;
                Ok(CallDone::Value(result))
            }
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Function(_) => {
                        let done = self.call_function(id, args)?;
                        callee.drop_with_heap(self.heap);
                        Ok(done)
                    }
                    HeapData::BoundMethod(method) => {
                        let func = method.func.clone_with_heap(self.heap);
                        let receiver = method.receiver.clone_with_heap(self.heap);
                        callee.drop_with_heap(self.heap);
                        self.call_value(func, args.prepend(receiver))
                    }
                    HeapData::Class(_) => {
                        let result = self.call_class(id, args)?;
                        callee.drop_with_heap(self.heap);
                        Ok(CallDone::Value(result))
                    }
                    HeapData::Instance(_) => {
                        if let Some(result) = self.call_dunder(&callee, StaticStrings::DunderCall.into(), args)? {
                            callee.drop_with_heap(self.heap);
                            return Ok(CallDone::Value(result));
                        }
                        let message = ExcType::not_callable(callee.type_name(self.heap, self.interns));
                        callee.drop_with_heap(self.heap);
                        Err(message)
                    }
                    _ => {
                        let message = ExcType::not_callable(callee.type_name(self.heap, self.interns));
                        callee.drop_with_heap(self.heap);
                        args.drop_with_heap(self.heap);
                        Err(message)
                    }
                }
            }
            _ => {
                let message = ExcType::not_callable(callee.type_name(self.heap, self.interns));
                callee.drop_with_heap(self.heap);
                args.drop_with_heap(self.heap);
                Err(message)
            }
        }
    }

    /// Pushes a frame and re-enters the dispatcher until it returns.
    pub(crate) fn call_to_completion(&mut self, callee: Value, args: ArgValues) -> RunResult<Value> {
        let floor = self.frames.len();
        match self.call_value(callee, args)? {
            CallDone::Value(value) => Ok(value),
            CallDone::Pushed => match self.run_until(floor)? {
                Finished::Returned(value) => Ok(value),
                Finished::Yielded(_) => Err(RunError::internal("call yielded outside generator resumption")),
            },
        }
    }

    // ==================================================================
    // User functions
    // ==================================================================

    fn call_function(&mut self, func_id: HeapId, args: ArgValues) -> RunResult<CallDone> {
        let (code, globals, name, defaults, kw_defaults, closure) = {
            let HeapData::Function(function) = self.heap.get(func_id) else {
                return Err(RunError::internal("call_function on non-function"));
            };
            (
                Rc::clone(&function.code),
                function.globals,
                function.name,
                function.defaults.iter().map(|v| v.clone_with_heap(self.heap)).collect::<Vec<_>>(),
                function
                    .kw_defaults
                    .iter()
                    .map(|(n, v)| (*n, v.clone_with_heap(self.heap)))
                    .collect::<Vec<_>>(),
                function.closure.clone(),
            )
        };

        let locals = self.bind_args(&code, name, args, defaults, kw_defaults)?;

        // Fresh cells for cell_vars, promoting parameters named there.
        let mut cells = self.make_cells(&code)?;
        let mut locals = locals;
        for (slot, &cell_name) in code.cell_vars().iter().enumerate() {
            if let Some(local_slot) = code.local_slot(cell_name) {
                let promoted = std::mem::replace(&mut locals[local_slot], Value::Undefined);
                let cell_id = cells[slot];
                let HeapData::Cell(cell_value) = self.heap.get_mut(cell_id) else {
                    return Err(RunError::internal("cell slot does not hold a cell"));
                };
                *cell_value = promoted;
            }
        }
        // Captured free cells follow the created ones.
        for &cell_id in &closure {
            self.heap.inc_ref(cell_id);
            cells.push(cell_id);
        }

        self.heap.inc_ref(globals);
        let mut frame = Frame::new(Rc::clone(&code), self.stack.len(), globals, name);
        frame.locals = locals;
        frame.cells = cells;

        if code.is_generator() || code.is_coroutine() {
            let kind = if code.is_coroutine() { GenKind::Coroutine } else { GenKind::Generator };
            let generator = Generator::new(kind, name, frame);
            let gen_id = self.heap.allocate(HeapData::Generator(generator))?;
            return Ok(CallDone::Value(Value::Ref(gen_id)));
        }

        self.push_frame(frame)?;
        Ok(CallDone::Pushed)
    }

    /// Binds call arguments into a fresh locals vector.
    fn bind_args(
        &mut self,
        code: &Rc<Code>,
        func_name: StringId,
        args: ArgValues,
        defaults: Vec<Value>,
        kw_defaults: Vec<(StringId, Value)>,
    ) -> RunResult<Vec<Value>> {
        let (mut positional, kwargs) = args.into_parts();
        let arg_count = usize::from(code.arg_count());
        let kwonly_count = usize::from(code.kwonly_arg_count());
        let has_varargs = code.flags().contains(crate::bytecode::code::CodeFlags::VARARGS);
        let has_varkw = code.flags().contains(crate::bytecode::code::CodeFlags::VARKEYWORDS);

        let mut locals = Vec::with_capacity(code.var_names().len());
        locals.resize_with(code.var_names().len(), || Value::Undefined);

        let name = self.interns.get_str(func_name).to_owned();

        // Positional binding with *args overflow.
        let excess = if positional.len() > arg_count {
            if !has_varargs {
                let given = positional.len();
                for value in positional {
                    value.drop_with_heap(self.heap);
                }
                for (_, value) in kwargs {
                    value.drop_with_heap(self.heap);
                }
                for value in defaults {
                    value.drop_with_heap(self.heap);
                }
                for (_, value) in kw_defaults {
                    value.drop_with_heap(self.heap);
                }
                return Err(ExcType::arg_count_error(&name, arg_count, given));
            }
            positional.split_off(arg_count)
        } else {
            Vec::new()
        };
        for (slot, value) in positional.into_iter().enumerate() {
            locals[slot] = value;
        }
        if has_varargs {
            let varargs_slot = arg_count + kwonly_count;
            let tuple_id = self.heap.allocate(HeapData::Tuple(Tuple::from(excess)))?;
            locals[varargs_slot] = Value::Ref(tuple_id);
        }

        // Keyword binding against named parameters.
        let mut kw_rest: Vec<(StringId, Value)> = Vec::new();
        for (kw_name, value) in kwargs {
            let slot = code.var_names()[..arg_count + kwonly_count]
                .iter()
                .position(|&param| param == kw_name);
            match slot {
                Some(slot) => {
                    if !matches!(locals[slot], Value::Undefined) {
                        let param = self.interns.get_str(kw_name).to_owned();
                        value.drop_with_heap(self.heap);
                        for (_, v) in kw_rest {
                            v.drop_with_heap(self.heap);
                        }
                        for v in locals {
                            v.drop_with_heap(self.heap);
                        }
                        for v in defaults {
                            v.drop_with_heap(self.heap);
                        }
                        for (_, v) in kw_defaults {
                            v.drop_with_heap(self.heap);
                        }
                        return Err(ExcType::type_error(format!(
                            "{name}() got multiple values for argument '{param}'"
                        )));
                    }
                    locals[slot] = value;
                }
                None => {
                    if has_varkw {
                        kw_rest.push((kw_name, value));
                    } else {
                        let param = self.interns.get_str(kw_name).to_owned();
                        value.drop_with_heap(self.heap);
                        for (_, v) in kw_rest {
                            v.drop_with_heap(self.heap);
                        }
                        for v in locals {
                            v.drop_with_heap(self.heap);
                        }
                        for v in defaults {
                            v.drop_with_heap(self.heap);
                        }
                        for (_, v) in kw_defaults {
                            v.drop_with_heap(self.heap);
                        }
                        return Err(ExcType::type_error(format!(
                            "{name}() got an unexpected keyword argument '{param}'"
                        )));
                    }
                }
            }
        }
        if has_varkw {
            let kw_slot = arg_count + kwonly_count + usize::from(has_varargs);
            let mut dict = Dict::with_capacity(kw_rest.len());
            for (kw_name, value) in kw_rest {
                self.dict_raw_insert(&mut dict, Value::InternString(kw_name), value)?;
            }
            let dict_id = self.heap.allocate(HeapData::Dict(dict))?;
            locals[kw_slot] = Value::Ref(dict_id);
        } else {
            debug_assert!(kw_rest.is_empty());
        }

        // Defaults fill the trailing positional slots still unset.
        let default_start = arg_count - defaults.len().min(arg_count);
        for (offset, value) in defaults.into_iter().enumerate() {
            let slot = default_start + offset;
            if matches!(locals[slot], Value::Undefined) {
                locals[slot] = value;
            } else {
                value.drop_with_heap(self.heap);
            }
        }
        // Keyword-only defaults by name.
        for (kw_name, value) in kw_defaults {
            let slot = code.var_names()[arg_count..arg_count + kwonly_count]
                .iter()
                .position(|&param| param == kw_name)
                .map(|offset| arg_count + offset);
            match slot {
                Some(slot) if matches!(locals[slot], Value::Undefined) => locals[slot] = value,
                _ => value.drop_with_heap(self.heap),
            }
        }

        // Everything named must now be bound.
        for slot in 0..arg_count + kwonly_count {
            if matches!(locals[slot], Value::Undefined) {
                let param = self.interns.get_str(code.var_names()[slot]).to_owned();
                for v in locals {
                    v.drop_with_heap(self.heap);
                }
                return Err(ExcType::type_error(format!(
                    "{name}() missing required argument: '{param}'"
                )));
            }
        }

        Ok(locals)
    }

    // ==================================================================
    // Class instantiation
    // ==================================================================

    fn call_class(&mut self, class_id: HeapId, args: ArgValues) -> RunResult<Value> {
        let instance = {
            let HeapData::Class(class) = self.heap.get(class_id) else {
                return Err(RunError::internal("call_class on non-class"));
            };
            Instance::for_class(class_id, class)
        };
        self.heap.inc_ref(class_id);
        let instance_id = self.heap.allocate(HeapData::Instance(instance))?;
        let instance_value = Value::Ref(instance_id);

        // __init__ from the MRO, with the instance prepended.
        let init = {
            let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
            class
                .mro_lookup(self.heap, class_id, StaticStrings::DunderInit.into())
                .map(|(value, _)| value.clone_with_heap(self.heap))
        };
        match init {
            Some(init) => {
                let receiver = instance_value.clone_with_heap(self.heap);
                let result = match self.call_to_completion(init, args.prepend(receiver)) {
                    Ok(result) => result,
                    Err(err) => {
                        instance_value.drop_with_heap(self.heap);
                        return Err(err);
                    }
                };
                if !matches!(result, Value::None) {
                    let type_name = result.type_name(self.heap, self.interns);
                    result.drop_with_heap(self.heap);
                    instance_value.drop_with_heap(self.heap);
                    return Err(ExcType::type_error(format!(
                        "__init__() should return None, not '{type_name}'"
                    )));
                }
            }
            None => {
                let exc_based = {
                    let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                    class.exc_base.is_some()
                };
                if exc_based {
                    // Exception subclasses without __init__ keep their
                    // constructor arguments as the `args` tuple.
                    let (positional, kwargs) = args.into_parts();
                    for (_, value) in kwargs {
                        value.drop_with_heap(self.heap);
                    }
                    let args_tuple = self.heap.allocate(HeapData::Tuple(Tuple::from(positional)))?;
                    let inserted = {
                        let HeapData::Instance(instance) = self.heap.get_mut(instance_id) else { unreachable!() };
                        match instance.attrs.as_mut() {
                            Some(attrs) => {
                                attrs.insert(StaticStrings::Args.into(), Value::Ref(args_tuple));
                                true
                            }
                            None => false,
                        }
                    };
                    if !inserted {
                        self.heap.dec_ref(args_tuple);
                    }
                } else if args.count() > 0 || args.has_kwargs() {
                    let count = args.count();
                    args.drop_with_heap(self.heap);
                    instance_value.drop_with_heap(self.heap);
                    let class_name = {
                        let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                        self.interns.get_str(class.name).to_owned()
                    };
                    return Err(ExcType::type_error(format!(
                        "{class_name}() takes no arguments ({count} given)"
                    )));
                } else {
                    args.drop_with_heap(self.heap);
                }
            }
        }

        Ok(instance_value)
    }

    // ==================================================================
    // Function construction
    // ==================================================================

    pub(super) fn op_make_function(&mut self, flags: u8, code_idx: u16) -> RunResult<()> {
        let Const::Code(code) = &self.frame().code.consts()[usize::from(code_idx)] else {
            return Err(RunError::internal("MakeFunction operand is not a code constant"));
        };
        let code = Rc::clone(code);

        // Popped topmost-first: closure, kw-defaults, defaults.
        let closure = if flags & 4 != 0 {
            let closure_value = self.pop();
            let cells = self.extract_closure_cells(&closure_value)?;
            closure_value.drop_with_heap(self.heap);
            cells
        } else {
            Vec::new()
        };
        let kw_defaults = if flags & 2 != 0 {
            let dict_value = self.pop();
            let pairs = self.extract_kw_defaults(&dict_value)?;
            dict_value.drop_with_heap(self.heap);
            pairs
        } else {
            Vec::new()
        };
        let defaults = if flags & 1 != 0 {
            let tuple_value = self.pop();
            let items = self.extract_default_tuple(&tuple_value)?;
            tuple_value.drop_with_heap(self.heap);
            items
        } else {
            Vec::new()
        };

        let globals = self.frame().globals;
        self.heap.inc_ref(globals);
        let function = Function {
            name: code.name(),
            code,
            globals,
            defaults,
            kw_defaults,
            closure,
            attrs: None,
        };
        let id = self.heap.allocate(HeapData::Function(function))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    fn extract_closure_cells(&mut self, closure_value: &Value) -> RunResult<Vec<HeapId>> {
        let Value::Ref(id) = closure_value else {
            return Err(RunError::internal("MakeFunction closure is not a tuple"));
        };
        let HeapData::Tuple(tuple) = self.heap.get(*id) else {
            return Err(RunError::internal("MakeFunction closure is not a tuple"));
        };
        let mut cells = Vec::with_capacity(tuple.len());
        for item in tuple.items() {
            let Value::Ref(cell_id) = item else {
                return Err(RunError::internal("closure entry is not a cell"));
            };
            cells.push(*cell_id);
        }
        for &cell_id in &cells {
            self.heap.inc_ref(cell_id);
        }
        Ok(cells)
    }

    fn extract_kw_defaults(&mut self, dict_value: &Value) -> RunResult<Vec<(StringId, Value)>> {
        let Value::Ref(id) = dict_value else {
            return Err(RunError::internal("MakeFunction kw-defaults is not a dict"));
        };
        let entries: Vec<(StringId, Value)> = {
            let HeapData::Dict(dict) = self.heap.get(*id) else {
                return Err(RunError::internal("MakeFunction kw-defaults is not a dict"));
            };
            let mut entries = Vec::with_capacity(dict.len());
            for (key, value) in dict.iter() {
                let Value::InternString(name) = key else {
                    return Err(RunError::internal("kw-default key is not an interned string"));
                };
                entries.push((*name, value.clone_with_heap(self.heap)));
            }
            entries
        };
        Ok(entries)
    }

    fn extract_default_tuple(&mut self, tuple_value: &Value) -> RunResult<Vec<Value>> {
        let Value::Ref(id) = tuple_value else {
            return Err(RunError::internal("MakeFunction defaults is not a tuple"));
        };
        let HeapData::Tuple(tuple) = self.heap.get(*id) else {
            return Err(RunError::internal("MakeFunction defaults is not a tuple"));
        };
        Ok(tuple.items().iter().map(|v| v.clone_with_heap(self.heap)).collect())
    }
}
