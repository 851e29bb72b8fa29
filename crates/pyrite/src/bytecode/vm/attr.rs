//! The attribute and descriptor protocol.
//!
//! Instance reads scan the MRO once for a data descriptor (a `property`),
//! then the instance's own storage, then the MRO again for plain members —
//! binding functions into methods and unwrapping classmethod/staticmethod.
//! Class reads expose the synthetic `__mro__`/`__bases__`/`__name__`/
//! `__dict__` attributes and return property objects raw. `super` mirrors
//! the instance scan but starts at its stored MRO index.

use crate::{
    args::ArgValues,
    builtins::{Builtins, MethodFn},
    except::{ExcPayload, ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{StaticStrings, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Tuple, Type, function::BoundMethod, userdata},
    value::Value,
};

use super::Vm;

/// What an MRO scan found, decoupled from heap borrows.
enum MemberPlan {
    /// A `property` object; `getter` is its getter (if any).
    Property { getter: Option<Value>, setter: Option<Value> },
    /// A plain function: binds to the receiver on instance access.
    Function(Value),
    /// `classmethod` wrapper: binds the class.
    ClassMethod(Value),
    /// `staticmethod` wrapper: unwraps.
    StaticMethod(Value),
    /// Anything else is returned as-is.
    Plain(Value),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    // ==================================================================
    // Opcode entry points
    // ==================================================================

    pub(super) fn op_load_attr(&mut self, name: StringId) -> RunResult<()> {
        let receiver = self.pop();
        let result = self.getattr_value(&receiver, name);
        receiver.drop_with_heap(self.heap);
        let value = result?;
        self.push(value);
        Ok(())
    }

    pub(super) fn op_store_attr(&mut self, name: StringId) -> RunResult<()> {
        let receiver = self.pop();
        let value = self.pop();
        let result = self.setattr_value(&receiver, name, value);
        receiver.drop_with_heap(self.heap);
        result
    }

    pub(crate) fn op_delete_attr(&mut self, name: StringId) -> RunResult<()> {
        let receiver = self.pop();
        let result = self.delattr_value(&receiver, name);
        receiver.drop_with_heap(self.heap);
        result
    }

    /// `LoadMethod`: pushes `[callable, receiver]`, avoiding bound-method
    /// allocation for the common instance-function case. When the
    /// attribute is not a plain method, pushes `[attr, Undefined]`.
    pub(super) fn op_load_method(&mut self, name: StringId) -> RunResult<()> {
        let receiver = self.pop();
        if let Value::Ref(id) = &receiver
            && let HeapData::Instance(instance) = self.heap.get(*id)
        {
            let class_id = instance.class_id;
            let shadowed = instance.attrs.as_ref().is_some_and(|a| a.contains_key(&name));
            if !shadowed {
                match self.scan_mro(class_id, name) {
                    Some(MemberPlan::Function(func)) => {
                        self.push(func);
                        self.push(receiver);
                        return Ok(());
                    }
                    other => drop_member_plan(other, self),
                }
            }
        }
        let result = self.getattr_value(&receiver, name);
        receiver.drop_with_heap(self.heap);
        let attr = result?;
        self.push(attr);
        self.push(Value::Undefined);
        Ok(())
    }

    // ==================================================================
    // Get
    // ==================================================================

    /// Full attribute read on any value shape.
    pub(crate) fn getattr_value(&mut self, receiver: &Value, name: StringId) -> RunResult<Value> {
        if let Value::Ref(id) = receiver {
            let id = *id;
            match self.heap.get(id) {
                HeapData::Instance(_) => return self.instance_getattr(receiver, id, name),
                HeapData::Class(_) => return self.class_getattr(id, name),
                HeapData::Module(_) => return self.module_getattr(id, name),
                HeapData::Super(_) => return self.super_getattr(id, name),
                HeapData::Generator(_) => {
                    if let Some(method) = generator_method(self.interns.get_str(name)) {
                        return self.bind_builtin_method(method, receiver);
                    }
                }
                HeapData::Exception(_) => return self.exception_getattr(receiver, id, name),
                HeapData::UserData(_) => return self.userdata_getattr(receiver, id, name),
                HeapData::Function(function) => {
                    if name == StaticStrings::DunderName.into() {
                        let text = self.interns.get_str(function.name).to_owned();
                        return self.make_str(text);
                    }
                    if let Some(attrs) = &function.attrs
                        && let Some(value) = attrs.get(&name)
                    {
                        return Ok(value.clone_with_heap(self.heap));
                    }
                }
                _ => {}
            }
        }
        // Builtin container methods.
        let shape = receiver.py_type(self.heap);
        if let Some(method) = builtin_method_for(shape, self.interns.get_str(name)) {
            return self.bind_builtin_method(method, receiver);
        }
        Err(ExcType::attribute_error(
            receiver.type_name(self.heap, self.interns),
            self.interns.get_str(name),
        ))
    }

    fn bind_builtin_method(&mut self, method: MethodFn, receiver: &Value) -> RunResult<Value> {
        let bound = BoundMethod {
            func: Value::Builtin(Builtins::Method(method)),
            receiver: receiver.clone_with_heap(self.heap),
        };
        let id = self.heap.allocate(HeapData::BoundMethod(bound))?;
        Ok(Value::Ref(id))
    }

    /// The instance protocol: data descriptor, instance storage, member.
    fn instance_getattr(&mut self, receiver: &Value, id: HeapId, name: StringId) -> RunResult<Value> {
        let HeapData::Instance(instance) = self.heap.get(id) else {
            return Err(RunError::internal("instance_getattr on non-instance"));
        };
        let class_id = instance.class_id;
        let member = self.scan_mro(class_id, name);

        // Data descriptors win over instance storage.
        let member = match member {
            Some(MemberPlan::Property { getter, setter }) => {
                if let Some(s) = setter {
                    s.drop_with_heap(self.heap);
                }
                let Some(getter) = getter else {
                    return Err(ExcType::attribute_error(
                        receiver.type_name(self.heap, self.interns),
                        self.interns.get_str(name),
                    ));
                };
                let receiver_arg = receiver.clone_with_heap(self.heap);
                return self.call_to_completion(getter, ArgValues::One(receiver_arg));
            }
            other => other,
        };

        // Instance storage.
        let stored = {
            let HeapData::Instance(instance) = self.heap.get(id) else { unreachable!() };
            if let Some(attrs) = &instance.attrs {
                attrs.get(&name).map(|v| v.clone_with_heap(self.heap))
            } else if let (Some(slots), HeapData::Class(class)) =
                (instance.slot_values.as_ref(), self.heap.get(class_id))
            {
                class.slot_index(name).and_then(|slot| {
                    let value = &slots[slot];
                    if matches!(value, Value::Undefined) {
                        None
                    } else {
                        Some(value.clone_with_heap(self.heap))
                    }
                })
            } else {
                None
            }
        };
        if let Some(value) = stored {
            drop_member_plan(member, self);
            return Ok(value);
        }

        // Non-data members from the class.
        match member {
            Some(MemberPlan::Function(func)) => {
                let bound = BoundMethod {
                    func,
                    receiver: receiver.clone_with_heap(self.heap),
                };
                let bound_id = self.heap.allocate(HeapData::BoundMethod(bound))?;
                Ok(Value::Ref(bound_id))
            }
            Some(MemberPlan::ClassMethod(func)) => {
                self.heap.inc_ref(class_id);
                let bound = BoundMethod {
                    func,
                    receiver: Value::Ref(class_id),
                };
                let bound_id = self.heap.allocate(HeapData::BoundMethod(bound))?;
                Ok(Value::Ref(bound_id))
            }
            Some(MemberPlan::StaticMethod(func)) => Ok(func),
            Some(MemberPlan::Plain(value)) => Ok(value),
            Some(MemberPlan::Property { .. }) => unreachable!("handled above"),
            None => {
                // Last resort: __getattr__.
                let getattr_name: StringId = StaticStrings::DunderGetattr.into();
                if name != getattr_name {
                    let attr_text = self.interns.get_str(name).to_owned();
                    let attr_value = self.make_str(attr_text)?;
                    if let Some(result) = self.call_dunder(receiver, getattr_name, ArgValues::One(attr_value))? {
                        return Ok(result);
                    }
                }
                Err(ExcType::attribute_error(
                    receiver.type_name(self.heap, self.interns),
                    self.interns.get_str(name),
                ))
            }
        }
    }

    fn class_getattr(&mut self, class_id: HeapId, name: StringId) -> RunResult<Value> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return Err(RunError::internal("class_getattr on non-class"));
        };

        // Synthetic attributes first.
        if name == StaticStrings::DunderName.into() {
            let text = self.interns.get_str(class.name).to_owned();
            return self.make_str(text);
        }
        if name == StaticStrings::DunderMro.into() {
            let mro = class.mro.clone();
            for &id in &mro {
                self.heap.inc_ref(id);
            }
            let items: Vec<Value> = mro.into_iter().map(Value::Ref).collect();
            let id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
            return Ok(Value::Ref(id));
        }
        if name == StaticStrings::DunderBases.into() {
            let bases = class.bases.clone();
            for &id in &bases {
                self.heap.inc_ref(id);
            }
            let items: Vec<Value> = bases.into_iter().map(Value::Ref).collect();
            let id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
            return Ok(Value::Ref(id));
        }
        if name == StaticStrings::DunderDict.into() {
            let entries: Vec<(StringId, Value)> = {
                let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                class
                    .members
                    .iter()
                    .map(|(k, v)| (*k, v.clone_with_heap(self.heap)))
                    .collect()
            };
            let mut dict = crate::types::Dict::with_capacity(entries.len());
            for (key_id, value) in entries {
                let key = Value::InternString(key_id);
                self.dict_raw_insert(&mut dict, key, value)?;
            }
            let id = self.heap.allocate(HeapData::Dict(dict))?;
            return Ok(Value::Ref(id));
        }

        // Class access returns the raw member: properties unwrapped only
        // on instances, functions unbound, classmethods bound to the class.
        match self.scan_mro(class_id, name) {
            Some(MemberPlan::ClassMethod(func)) => {
                self.heap.inc_ref(class_id);
                let bound = BoundMethod {
                    func,
                    receiver: Value::Ref(class_id),
                };
                let bound_id = self.heap.allocate(HeapData::BoundMethod(bound))?;
                Ok(Value::Ref(bound_id))
            }
            Some(MemberPlan::StaticMethod(func)) => Ok(func),
            Some(MemberPlan::Function(value) | MemberPlan::Plain(value)) => Ok(value),
            Some(member @ MemberPlan::Property { .. }) => {
                // The raw property object sits in the member table.
                drop_member_plan(Some(member), self);
                let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                let raw = class
                    .mro_lookup(self.heap, class_id, name)
                    .map(|(value, _)| value.clone_with_heap(self.heap));
                raw.ok_or_else(|| RunError::internal("property vanished from member table"))
            }
            None => {
                let class_name = {
                    let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                    self.interns.get_str(class.name).to_owned()
                };
                Err(ExcType::attribute_error(format!("type[{class_name}]"), self.interns.get_str(name)))
            }
        }
    }

    fn module_getattr(&mut self, module_id: HeapId, name: StringId) -> RunResult<Value> {
        let HeapData::Module(module) = self.heap.get(module_id) else {
            return Err(RunError::internal("module_getattr on non-module"));
        };
        if name == StaticStrings::DunderName.into() {
            let text = self.interns.get_str(module.name).to_owned();
            return self.make_str(text);
        }
        if let Some(value) = module.namespace.get(&name) {
            return Ok(value.clone_with_heap(self.heap));
        }
        let module_name = self.interns.get_str(module.name).to_owned();
        Err(ExcType::attribute_error(
            format!("module '{module_name}'"),
            self.interns.get_str(name),
        ))
    }

    /// `super()` attribute read: the instance scan, starting mid-MRO.
    fn super_getattr(&mut self, super_id: HeapId, name: StringId) -> RunResult<Value> {
        let (start_class, receiver, mro_index) = {
            let HeapData::Super(proxy) = self.heap.get(super_id) else {
                return Err(RunError::internal("super_getattr on non-super"));
            };
            (
                proxy.start_class,
                proxy.receiver.clone_with_heap(self.heap),
                proxy.mro_index,
            )
        };
        let mro: Vec<HeapId> = {
            let HeapData::Class(class) = self.heap.get(start_class) else {
                receiver.drop_with_heap(self.heap);
                return Err(RunError::internal("super start class is not a class"));
            };
            class.mro.clone()
        };

        for &ancestor_id in mro.get(mro_index..).unwrap_or(&[]) {
            let member = {
                let HeapData::Class(ancestor) = self.heap.get(ancestor_id) else { continue };
                ancestor.members.get(&name).map(|v| v.clone_with_heap(self.heap))
            };
            let Some(member) = member else { continue };
            let plan = self.classify_member(member);
            match plan {
                MemberPlan::Function(func) => {
                    let bound = BoundMethod { func, receiver };
                    let bound_id = self.heap.allocate(HeapData::BoundMethod(bound))?;
                    return Ok(Value::Ref(bound_id));
                }
                MemberPlan::ClassMethod(func) => {
                    receiver.drop_with_heap(self.heap);
                    self.heap.inc_ref(start_class);
                    let bound = BoundMethod {
                        func,
                        receiver: Value::Ref(start_class),
                    };
                    let bound_id = self.heap.allocate(HeapData::BoundMethod(bound))?;
                    return Ok(Value::Ref(bound_id));
                }
                MemberPlan::StaticMethod(func) => {
                    receiver.drop_with_heap(self.heap);
                    return Ok(func);
                }
                MemberPlan::Property { getter, setter } => {
                    if let Some(s) = setter {
                        s.drop_with_heap(self.heap);
                    }
                    let Some(getter) = getter else {
                        receiver.drop_with_heap(self.heap);
                        return Err(ExcType::attribute_error("super", self.interns.get_str(name)));
                    };
                    return self.call_to_completion(getter, ArgValues::One(receiver));
                }
                MemberPlan::Plain(value) => {
                    receiver.drop_with_heap(self.heap);
                    return Ok(value);
                }
            }
        }
        receiver.drop_with_heap(self.heap);
        Err(ExcType::attribute_error("super", self.interns.get_str(name)))
    }

    fn exception_getattr(&mut self, receiver: &Value, exc_id: HeapId, name: StringId) -> RunResult<Value> {
        if name == StaticStrings::Args.into() {
            let payloads: Vec<ExcPayload> = {
                let HeapData::Exception(exc) = self.heap.get(exc_id) else { unreachable!() };
                exc.args.clone()
            };
            let mut items = Vec::with_capacity(payloads.len());
            for payload in payloads {
                items.push(self.payload_to_value(payload)?);
            }
            let id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
            return Ok(Value::Ref(id));
        }
        if name == StaticStrings::Value.into() {
            let payload = {
                let HeapData::Exception(exc) = self.heap.get(exc_id) else { unreachable!() };
                exc.args.first().cloned()
            };
            return match payload {
                Some(payload) => self.payload_to_value(payload),
                None => Ok(Value::None),
            };
        }
        if name == StaticStrings::AddNote.into() {
            return self.bind_builtin_method(MethodFn::ExcAddNote, receiver);
        }
        Err(ExcType::attribute_error(
            receiver.type_name(self.heap, self.interns),
            self.interns.get_str(name),
        ))
    }

    pub(crate) fn payload_to_value(&mut self, payload: ExcPayload) -> RunResult<Value> {
        Ok(match payload {
            ExcPayload::None => Value::None,
            ExcPayload::Bool(b) => Value::Bool(b),
            ExcPayload::Int(i) => Value::Int(i),
            ExcPayload::Float(f) => Value::Float(f),
            ExcPayload::Str(s) => self.make_str(s)?,
        })
    }

    fn userdata_getattr(&mut self, receiver: &Value, data_id: HeapId, name: StringId) -> RunResult<Value> {
        let type_id = {
            let HeapData::UserData(data) = self.heap.get(data_id) else { unreachable!() };
            data.type_id
        };
        let Some(table) = userdata::metatable(type_id) else {
            return Err(RunError::internal("userdata metatable missing from index"));
        };
        let attr = self.interns.get_str(name).to_owned();
        if let Some(index) = table.method_index(&attr) {
            let bound = BoundMethod {
                func: Value::Builtin(Builtins::UserMethod { type_id, index }),
                receiver: receiver.clone_with_heap(self.heap),
            };
            let id = self.heap.allocate(HeapData::BoundMethod(bound))?;
            return Ok(Value::Ref(id));
        }
        if let Some(property) = table.property_named(&attr) {
            let result = {
                let HeapData::UserData(data) = self.heap.get(data_id) else { unreachable!() };
                (property.get)(data.data.as_ref())
            };
            let object = result.map_err(|msg| RunError::from(crate::except::wrap_foreign(&msg)))?;
            return crate::object::object_to_value(&object, self.heap, self.interns);
        }
        Err(ExcType::attribute_error(table.name.clone(), &attr))
    }

    // ==================================================================
    // Set / delete
    // ==================================================================

    pub(crate) fn setattr_value(&mut self, receiver: &Value, name: StringId, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = receiver {
            let id = *id;
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    let class_id = instance.class_id;
                    // Data descriptor setter takes priority.
                    if let Some(MemberPlan::Property { getter, setter }) = self.scan_mro(class_id, name) {
                        if let Some(g) = getter {
                            g.drop_with_heap(self.heap);
                        }
                        let Some(setter) = setter else {
                            value.drop_with_heap(self.heap);
                            return Err(ExcType::attribute_error(
                                receiver.type_name(self.heap, self.interns),
                                self.interns.get_str(name),
                            ));
                        };
                        let receiver_arg = receiver.clone_with_heap(self.heap);
                        let result = self.call_to_completion(setter, ArgValues::Two(receiver_arg, value))?;
                        result.drop_with_heap(self.heap);
                        return Ok(());
                    }

                    let slot_index = {
                        let HeapData::Instance(instance) = self.heap.get(id) else { unreachable!() };
                        if instance.attrs.is_some() {
                            None
                        } else {
                            let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                            Some(class.slot_index(name))
                        }
                    };
                    match slot_index {
                        // Dict-backed instance.
                        None => {
                            let HeapData::Instance(instance) = self.heap.get_mut(id) else { unreachable!() };
                            let attrs = instance.attrs.as_mut().expect("dict-backed instance");
                            if let Some(old) = attrs.insert(name, value) {
                                old.drop_with_heap(self.heap);
                            }
                            return Ok(());
                        }
                        // Slot-backed with a declared slot.
                        Some(Some(slot)) => {
                            let HeapData::Instance(instance) = self.heap.get_mut(id) else { unreachable!() };
                            let slots = instance.slot_values.as_mut().expect("slot-backed instance");
                            let old = std::mem::replace(&mut slots[slot], value);
                            old.drop_with_heap(self.heap);
                            return Ok(());
                        }
                        // Slot-backed without such a slot.
                        Some(None) => {
                            let message = ExcType::attribute_error(
                                receiver.type_name(self.heap, self.interns),
                                self.interns.get_str(name),
                            );
                            value.drop_with_heap(self.heap);
                            return Err(message);
                        }
                    }
                }
                HeapData::Class(_) => {
                    let HeapData::Class(class) = self.heap.get_mut(id) else { unreachable!() };
                    if let Some(old) = class.members.insert(name, value) {
                        old.drop_with_heap(self.heap);
                    }
                    return Ok(());
                }
                HeapData::Module(_) => {
                    let HeapData::Module(module) = self.heap.get_mut(id) else { unreachable!() };
                    if let Some(old) = module.namespace.insert(name, value) {
                        old.drop_with_heap(self.heap);
                    }
                    return Ok(());
                }
                HeapData::Function(_) => {
                    let HeapData::Function(function) = self.heap.get_mut(id) else { unreachable!() };
                    let attrs = function.attrs.get_or_insert_with(indexmap::IndexMap::new);
                    if let Some(old) = attrs.insert(name, value) {
                        old.drop_with_heap(self.heap);
                    }
                    return Ok(());
                }
                HeapData::UserData(_) => {
                    return self.userdata_setattr(id, name, value);
                }
                _ => {}
            }
        }
        let message = format!(
            "'{}' object has no attribute '{}' and no __dict__ for setting new attributes",
            receiver.type_name(self.heap, self.interns),
            self.interns.get_str(name)
        );
        value.drop_with_heap(self.heap);
        Err(ExcType::type_error(message))
    }

    fn userdata_setattr(&mut self, data_id: HeapId, name: StringId, value: Value) -> RunResult<()> {
        let type_id = {
            let HeapData::UserData(data) = self.heap.get(data_id) else { unreachable!() };
            data.type_id
        };
        let Some(table) = userdata::metatable(type_id) else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("userdata metatable missing from index"));
        };
        let attr = self.interns.get_str(name).to_owned();
        let Some(property) = table.property_named(&attr) else {
            value.drop_with_heap(self.heap);
            return Err(ExcType::attribute_error(table.name.clone(), &attr));
        };
        let Some(setter) = &property.set else {
            value.drop_with_heap(self.heap);
            return Err(ExcType::attribute_error(table.name.clone(), &attr));
        };
        let object = crate::object::value_to_object(&value, self.heap, self.interns);
        value.drop_with_heap(self.heap);
        let result = {
            let HeapData::UserData(data) = self.heap.get_mut(data_id) else { unreachable!() };
            setter(data.data.as_mut(), object)
        };
        result.map_err(|msg| RunError::from(crate::except::wrap_foreign(&msg)))
    }

    fn delattr_value(&mut self, receiver: &Value, name: StringId) -> RunResult<()> {
        if let Value::Ref(id) = receiver {
            let id = *id;
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if instance.attrs.is_some() {
                        let HeapData::Instance(instance) = self.heap.get_mut(id) else { unreachable!() };
                        let attrs = instance.attrs.as_mut().expect("checked above");
                        if let Some(old) = attrs.shift_remove(&name) {
                            old.drop_with_heap(self.heap);
                            return Ok(());
                        }
                    }
                }
                HeapData::Class(_) => {
                    let HeapData::Class(class) = self.heap.get_mut(id) else { unreachable!() };
                    if let Some(old) = class.members.shift_remove(&name) {
                        old.drop_with_heap(self.heap);
                        return Ok(());
                    }
                }
                HeapData::Module(_) => {
                    let HeapData::Module(module) = self.heap.get_mut(id) else { unreachable!() };
                    if let Some(old) = module.namespace.shift_remove(&name) {
                        old.drop_with_heap(self.heap);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::attribute_error(
            receiver.type_name(self.heap, self.interns),
            self.interns.get_str(name),
        ))
    }

    // ==================================================================
    // MRO plumbing
    // ==================================================================

    pub(crate) fn class_of_instance(&self, id: HeapId) -> Option<HeapId> {
        match self.heap.get(id) {
            HeapData::Instance(instance) => Some(instance.class_id),
            _ => None,
        }
    }

    pub(crate) fn class_has_member(&self, class_id: HeapId, name: StringId) -> bool {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return false;
        };
        class.mro_lookup(self.heap, class_id, name).is_some()
    }

    /// Scans the MRO for `name`, classifying the found member.
    ///
    /// The returned plan owns counted clones; abandon it only through
    /// [`drop_member_plan`].
    fn scan_mro(&mut self, class_id: HeapId, name: StringId) -> Option<MemberPlan> {
        let member = {
            let HeapData::Class(class) = self.heap.get(class_id) else {
                return None;
            };
            let (member, _) = class.mro_lookup(self.heap, class_id, name)?;
            member.clone_with_heap(self.heap)
        };
        Some(self.classify_member(member))
    }

    fn classify_member(&mut self, member: Value) -> MemberPlan {
        enum Shape {
            Property { getter: Option<Value>, setter: Option<Value> },
            Wrapped(Value, bool),
            Function,
            Plain,
        }
        let shape = if let Value::Ref(id) = &member {
            match self.heap.get(*id) {
                HeapData::Property(property) => Shape::Property {
                    getter: property.getter.as_ref().map(|g| g.clone_with_heap(self.heap)),
                    setter: property.setter.as_ref().map(|s| s.clone_with_heap(self.heap)),
                },
                HeapData::ClassMethod(inner) => Shape::Wrapped(inner.clone_with_heap(self.heap), true),
                HeapData::StaticMethod(inner) => Shape::Wrapped(inner.clone_with_heap(self.heap), false),
                HeapData::Function(_) => Shape::Function,
                _ => Shape::Plain,
            }
        } else {
            Shape::Plain
        };
        match shape {
            Shape::Property { getter, setter } => {
                member.drop_with_heap(self.heap);
                MemberPlan::Property { getter, setter }
            }
            Shape::Wrapped(inner, true) => {
                member.drop_with_heap(self.heap);
                MemberPlan::ClassMethod(inner)
            }
            Shape::Wrapped(inner, false) => {
                member.drop_with_heap(self.heap);
                MemberPlan::StaticMethod(inner)
            }
            Shape::Function => MemberPlan::Function(member),
            Shape::Plain => MemberPlan::Plain(member),
        }
    }

    // ==================================================================
    // Dunder dispatch
    // ==================================================================

    /// Looks up `name` on an instance's class (skipping the instance
    /// dict) and calls it with the receiver prepended. `Ok(None)` means
    /// the class does not define the dunder.
    pub(crate) fn call_dunder(&mut self, receiver: &Value, name: StringId, args: ArgValues) -> RunResult<Option<Value>> {
        let Value::Ref(id) = receiver else {
            args.drop_with_heap(self.heap);
            return Ok(None);
        };
        let Some(class_id) = self.class_of_instance(*id) else {
            args.drop_with_heap(self.heap);
            return Ok(None);
        };
        let Some(plan) = self.scan_mro(class_id, name) else {
            args.drop_with_heap(self.heap);
            return Ok(None);
        };
        match plan {
            MemberPlan::Function(func) => {
                let receiver_arg = receiver.clone_with_heap(self.heap);
                let result = self.call_to_completion(func, args.prepend(receiver_arg))?;
                Ok(Some(result))
            }
            MemberPlan::ClassMethod(func) => {
                self.heap.inc_ref(class_id);
                let result = self.call_to_completion(func, args.prepend(Value::Ref(class_id)))?;
                Ok(Some(result))
            }
            MemberPlan::StaticMethod(func) => {
                let result = self.call_to_completion(func, args)?;
                Ok(Some(result))
            }
            MemberPlan::Plain(value) => {
                // A non-descriptor callable member still dispatches.
                let receiver_arg = receiver.clone_with_heap(self.heap);
                let result = self.call_to_completion(value, args.prepend(receiver_arg))?;
                Ok(Some(result))
            }
            member @ MemberPlan::Property { .. } => {
                drop_member_plan(Some(member), self);
                args.drop_with_heap(self.heap);
                Ok(None)
            }
        }
    }
}

/// Releases any values still owned by an abandoned member plan.
fn drop_member_plan<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(plan: Option<MemberPlan>, vm: &mut Vm<'_, T, P, Tr>) {
    match plan {
        Some(MemberPlan::Property { getter, setter }) => {
            if let Some(g) = getter {
                g.drop_with_heap(vm.heap);
            }
            if let Some(s) = setter {
                s.drop_with_heap(vm.heap);
            }
        }
        Some(
            MemberPlan::Function(value)
            | MemberPlan::ClassMethod(value)
            | MemberPlan::StaticMethod(value)
            | MemberPlan::Plain(value),
        ) => value.drop_with_heap(vm.heap),
        None => {}
    }
}

/// Builtin methods exposed on container and string shapes.
fn builtin_method_for(shape: Type, name: &str) -> Option<MethodFn> {
    Some(match (shape, name) {
        (Type::List, "append") => MethodFn::ListAppend,
        (Type::List, "extend") => MethodFn::ListExtend,
        (Type::List, "pop") => MethodFn::ListPop,
        (Type::List, "insert") => MethodFn::ListInsert,
        (Type::List, "remove") => MethodFn::ListRemove,
        (Type::Dict, "get") => MethodFn::DictGet,
        (Type::Dict, "keys") => MethodFn::DictKeys,
        (Type::Dict, "values") => MethodFn::DictValues,
        (Type::Dict, "items") => MethodFn::DictItems,
        (Type::Dict, "pop") => MethodFn::DictPop,
        (Type::Dict, "setdefault") => MethodFn::DictSetdefault,
        (Type::Dict, "update") => MethodFn::DictUpdate,
        (Type::Set, "add") => MethodFn::SetAdd,
        (Type::Set, "remove") => MethodFn::SetRemove,
        (Type::Set, "discard") => MethodFn::SetDiscard,
        (Type::Str, "join") => MethodFn::StrJoin,
        (Type::Str, "split") => MethodFn::StrSplit,
        (Type::Str, "upper") => MethodFn::StrUpper,
        (Type::Str, "lower") => MethodFn::StrLower,
        (Type::Str, "strip") => MethodFn::StrStrip,
        (Type::Str, "startswith") => MethodFn::StrStartswith,
        (Type::Str, "endswith") => MethodFn::StrEndswith,
        (Type::Str, "find") => MethodFn::StrFind,
        (Type::Str, "replace") => MethodFn::StrReplace,
        _ => return None,
    })
}

/// Generator protocol methods.
fn generator_method(name: &str) -> Option<MethodFn> {
    Some(match name {
        "send" => MethodFn::GenSend,
        "throw" => MethodFn::GenThrow,
        "close" => MethodFn::GenClose,
        "__next__" => MethodFn::GenNext,
        _ => return None,
    })
}
