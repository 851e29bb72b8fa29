//! Collection construction, subscripting, unpacking, and iteration.

use crate::{
    args::ArgValues,
    except::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::StaticStrings,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, GenState, Iter, List, Set, SetStorage, Slice, Str, Tuple, slice::normalize_slice},
    value::{Value, values_equal},
};

use super::Vm;

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    // ==================================================================
    // Construction
    // ==================================================================

    pub(super) fn op_build_tuple(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count);
        let id = if items.is_empty() {
            self.heap.empty_tuple()?
        } else {
            self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?
        };
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn op_build_list(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count);
        let id = self.heap.allocate(HeapData::List(List::from(items)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn op_build_set(&mut self, count: usize) -> RunResult<()> {
        let items = self.pop_n(count);
        let mut storage = SetStorage::new();
        for item in items {
            let hash = match self.value_hash(&item) {
                Ok(hash) => hash,
                Err(err) => {
                    item.drop_with_heap(self.heap);
                    return Err(err);
                }
            };
            self.storage_add(&mut storage, item, hash);
        }
        let id = self.heap.allocate(HeapData::Set(Set(storage)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn op_build_map(&mut self, pair_count: usize) -> RunResult<()> {
        let mut flat = self.pop_n(pair_count * 2);
        let mut dict = Dict::with_capacity(pair_count);
        // Entries were pushed key, value, key, value ... oldest first.
        let mut drain = flat.drain(..);
        while let (Some(key), Some(value)) = (drain.next(), drain.next()) {
            self.dict_raw_insert(&mut dict, key, value)?;
        }
        drop(drain);
        let id = self.heap.allocate(HeapData::Dict(dict))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Inserts into a detached dict with full hashing and key equality.
    ///
    /// An existing key keeps its original key object; the new value
    /// replaces the old one and both displaced values are released.
    pub(crate) fn dict_raw_insert(&mut self, dict: &mut Dict, key: Value, value: Value) -> RunResult<()> {
        let hash = match self.value_hash(&key) {
            Ok(hash) => hash,
            Err(err) => {
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let existing = dict.get_mut(hash, |existing| values_equal(existing, &key, self.heap, self.interns));
        if let Some(slot) = existing {
            let old = std::mem::replace(slot, value);
            old.drop_with_heap(self.heap);
            key.drop_with_heap(self.heap);
        } else {
            let replaced = dict.insert(key, hash, value, |_| false);
            debug_assert!(replaced.is_none());
        }
        Ok(())
    }

    pub(super) fn op_build_slice(&mut self, argc: u8) -> RunResult<()> {
        let (start, stop, step) = match argc {
            2 => {
                let stop = self.pop();
                let start = self.pop();
                (start, stop, Value::None)
            }
            3 => {
                let step = self.pop();
                let stop = self.pop();
                let start = self.pop();
                (start, stop, step)
            }
            _ => return Err(RunError::internal("BuildSlice expects 2 or 3 components")),
        };
        let id = self.heap.allocate(HeapData::Slice(Slice { start, stop, step }))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn op_list_append(&mut self, depth: usize) -> RunResult<()> {
        let value = self.pop();
        let Value::Ref(list_id) = self.peek_at(depth - 1) else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("ListAppend target is not a list"));
        };
        let list_id = *list_id;
        let HeapData::List(list) = self.heap.get_mut(list_id) else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("ListAppend target is not a list"));
        };
        list.push(value);
        Ok(())
    }

    pub(super) fn op_set_add(&mut self, depth: usize) -> RunResult<()> {
        let value = self.pop();
        let Value::Ref(set_id) = self.peek_at(depth - 1) else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("SetAdd target is not a set"));
        };
        let set_id = *set_id;
        let hash = self.value_hash(&value)?;
        let mut data = self.heap.take_data(set_id);
        let HeapData::Set(set) = &mut data else {
            self.heap.restore_data(set_id, data);
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("SetAdd target is not a set"));
        };
        self.storage_add(&mut set.0, value, hash);
        self.heap.restore_data(set_id, data);
        Ok(())
    }

    pub(super) fn op_map_add(&mut self, depth: usize) -> RunResult<()> {
        let value = self.pop();
        let key = self.pop();
        let Value::Ref(dict_id) = self.peek_at(depth - 1) else {
            key.drop_with_heap(self.heap);
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("MapAdd target is not a dict"));
        };
        let dict_id = *dict_id;
        self.dict_insert_value(dict_id, key, value)
    }

    /// Inserts into a heap dict via the take/restore pattern.
    pub(crate) fn dict_insert_value(&mut self, dict_id: HeapId, key: Value, value: Value) -> RunResult<()> {
        let hash = match self.value_hash(&key) {
            Ok(hash) => hash,
            Err(err) => {
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let mut data = self.heap.take_data(dict_id);
        let HeapData::Dict(dict) = &mut data else {
            self.heap.restore_data(dict_id, data);
            key.drop_with_heap(self.heap);
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("dict operation on non-dict"));
        };
        let mut displaced = None;
        let existing = dict.get_mut(hash, |existing| values_equal(existing, &key, self.heap, self.interns));
        if let Some(slot) = existing {
            displaced = Some((std::mem::replace(slot, value), key));
        } else {
            let replaced = dict.insert(key, hash, value, |_| false);
            debug_assert!(replaced.is_none());
        }
        self.heap.restore_data(dict_id, data);
        if let Some((old_value, dup_key)) = displaced {
            old_value.drop_with_heap(self.heap);
            dup_key.drop_with_heap(self.heap);
        }
        Ok(())
    }

    /// Looks up a dict entry, cloning the value out.
    pub(crate) fn dict_get_value(&mut self, dict_id: HeapId, key: &Value) -> RunResult<Option<Value>> {
        let hash = self.value_hash(key)?;
        let HeapData::Dict(dict) = self.heap.get(dict_id) else {
            return Err(RunError::internal("dict operation on non-dict"));
        };
        Ok(dict
            .get(hash, |existing| values_equal(existing, key, self.heap, self.interns))
            .map(|value| value.clone_with_heap(self.heap)))
    }

    /// Removes a dict entry, returning its value.
    pub(crate) fn dict_remove_value(&mut self, dict_id: HeapId, key: &Value) -> RunResult<Option<Value>> {
        let hash = self.value_hash(key)?;
        let mut data = self.heap.take_data(dict_id);
        let HeapData::Dict(dict) = &mut data else {
            self.heap.restore_data(dict_id, data);
            return Err(RunError::internal("dict operation on non-dict"));
        };
        let removed = dict.remove(hash, |existing| values_equal(existing, key, self.heap, self.interns));
        self.heap.restore_data(dict_id, data);
        match removed {
            Some((old_key, value)) => {
                old_key.drop_with_heap(self.heap);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub(super) fn op_list_extend(&mut self) -> RunResult<()> {
        let iterable = self.pop();
        let items = self.collect_iterable(iterable)?;
        let Value::Ref(list_id) = self.peek() else {
            for item in items {
                item.drop_with_heap(self.heap);
            }
            return Err(RunError::internal("ListExtend target is not a list"));
        };
        let list_id = *list_id;
        let HeapData::List(list) = self.heap.get_mut(list_id) else {
            for item in items {
                item.drop_with_heap(self.heap);
            }
            return Err(RunError::internal("ListExtend target is not a list"));
        };
        list.items_mut().extend(items);
        Ok(())
    }

    /// `DictUpdate`/`DictMerge`: fold the mapping at TOS into the dict
    /// beneath it. `strict` raises on duplicate keys (`**` in calls).
    pub(super) fn op_dict_update(&mut self, strict: bool) -> RunResult<()> {
        let source = self.pop();
        let Value::Ref(source_id) = &source else {
            let message = format!("'{}' object is not a mapping", source.type_name(self.heap, self.interns));
            source.drop_with_heap(self.heap);
            return Err(ExcType::type_error(message));
        };
        let source_id = *source_id;
        let Value::Ref(target_id) = self.peek() else {
            source.drop_with_heap(self.heap);
            return Err(RunError::internal("DictUpdate target is not a dict"));
        };
        let target_id = *target_id;
        self.dict_update_from_checked(target_id, source_id, strict)?;
        source.drop_with_heap(self.heap);
        Ok(())
    }

    fn dict_update_from_checked(&mut self, target_id: HeapId, source_id: HeapId, strict: bool) -> RunResult<()> {
        if !matches!(self.heap.get(source_id), HeapData::Dict(_)) {
            return Err(ExcType::type_error("argument must be a mapping"));
        }
        self.dict_update_from(target_id, source_id, strict)
    }

    /// Copies every entry of `source` into `target`.
    pub(crate) fn dict_update_from(&mut self, target_id: HeapId, source_id: HeapId, strict: bool) -> RunResult<()> {
        let entries: Vec<(Value, Value, u64)> = {
            let HeapData::Dict(source) = self.heap.get(source_id) else {
                return Err(RunError::internal("dict update from non-dict"));
            };
            source
                .iter_with_hash()
                .map(|(k, v, h)| (k.clone_with_heap(self.heap), v.clone_with_heap(self.heap), h))
                .collect()
        };
        for (key, value, hash) in entries {
            if strict {
                let HeapData::Dict(target) = self.heap.get(target_id) else {
                    return Err(RunError::internal("dict update on non-dict"));
                };
                if target.contains(hash, |existing| values_equal(existing, &key, self.heap, self.interns)) {
                    let repr = crate::value::py_repr(&key, self.heap, self.interns);
                    key.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    return Err(ExcType::type_error(format!("got multiple values for keyword argument {repr}")));
                }
            }
            let mut data = self.heap.take_data(target_id);
            let HeapData::Dict(target) = &mut data else {
                self.heap.restore_data(target_id, data);
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
                return Err(RunError::internal("dict update on non-dict"));
            };
            let mut displaced = None;
            let existing = target.get_mut(hash, |existing| values_equal(existing, &key, self.heap, self.interns));
            if let Some(slot) = existing {
                displaced = Some((std::mem::replace(slot, value), key));
            } else {
                let replaced = target.insert(key, hash, value, |_| false);
                debug_assert!(replaced.is_none());
            }
            self.heap.restore_data(target_id, data);
            if let Some((old_value, dup_key)) = displaced {
                old_value.drop_with_heap(self.heap);
                dup_key.drop_with_heap(self.heap);
            }
        }
        Ok(())
    }

    pub(super) fn op_list_to_tuple(&mut self) -> RunResult<()> {
        let value = self.pop();
        let Value::Ref(id) = &value else {
            value.drop_with_heap(self.heap);
            return Err(RunError::internal("ListToTuple on non-list"));
        };
        let items: Vec<Value> = {
            let HeapData::List(list) = self.heap.get(*id) else {
                let message = RunError::internal("ListToTuple on non-list");
                value.drop_with_heap(self.heap);
                return Err(message);
            };
            list.items().iter().map(|v| v.clone_with_heap(self.heap)).collect()
        };
        value.drop_with_heap(self.heap);
        let id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    // ==================================================================
    // Unpacking
    // ==================================================================

    pub(super) fn op_unpack_sequence(&mut self, count: usize) -> RunResult<()> {
        let value = self.pop();
        let items = self.collect_iterable(value)?;
        if items.len() != count {
            let message = if items.len() < count {
                format!("not enough values to unpack (expected {count}, got {})", items.len())
            } else {
                format!("too many values to unpack (expected {count})")
            };
            for item in items {
                item.drop_with_heap(self.heap);
            }
            return Err(ExcType::value_error(message));
        }
        // Pushed in reverse so the first target pops first.
        for item in items.into_iter().rev() {
            self.push(item);
        }
        Ok(())
    }

    pub(super) fn op_unpack_ex(&mut self, before: usize, after: usize) -> RunResult<()> {
        let value = self.pop();
        let items = self.collect_iterable(value)?;
        if items.len() < before + after {
            let message = format!(
                "not enough values to unpack (expected at least {}, got {})",
                before + after,
                items.len()
            );
            for item in items {
                item.drop_with_heap(self.heap);
            }
            return Err(ExcType::value_error(message));
        }
        let mut items = items;
        let tail: Vec<Value> = items.split_off(items.len() - after);
        let star: Vec<Value> = items.split_off(before);
        let star_id = self.heap.allocate(HeapData::List(List::from(star)))?;
        // Push in reverse target order: after-targets, star, before-targets.
        for item in tail.into_iter().rev() {
            self.push(item);
        }
        self.push(Value::Ref(star_id));
        for item in items.into_iter().rev() {
            self.push(item);
        }
        Ok(())
    }

    // ==================================================================
    // Subscripts
    // ==================================================================

    pub(super) fn op_binary_subscr(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        let result = self.subscr_get(&container, &index);
        index.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        let value = result?;
        self.push(value);
        Ok(())
    }

    pub(crate) fn subscr_get(&mut self, container: &Value, index: &Value) -> RunResult<Value> {
        // Slicing first: it applies to every positional sequence.
        if let Value::Ref(index_id) = index
            && matches!(self.heap.get(*index_id), HeapData::Slice(_))
        {
            return self.slice_get(container, *index_id);
        }

        if let Some(s) = container.as_str(self.heap, self.interns) {
            let Some(i) = index.as_int() else {
                return Err(ExcType::type_error(format!(
                    "string indices must be integers, not '{}'",
                    index.type_name(self.heap, self.interns)
                )));
            };
            let c = Str::from(s).char_at(i)?;
            return self.make_str(c.to_string());
        }

        if let Value::Ref(id) = container {
            match self.heap.get(*id) {
                HeapData::List(list) => {
                    if let Some(i) = index.as_int() {
                        let idx = list.resolve_index(i)?;
                        return Ok(list.items()[idx].clone_with_heap(self.heap));
                    }
                    return Err(ExcType::type_error(format!(
                        "list indices must be integers or slices, not '{}'",
                        index.type_name(self.heap, self.interns)
                    )));
                }
                HeapData::Tuple(tuple) => {
                    if let Some(i) = index.as_int() {
                        let idx = tuple.resolve_index(i)?;
                        return Ok(tuple.items()[idx].clone_with_heap(self.heap));
                    }
                    return Err(ExcType::type_error("tuple indices must be integers or slices"));
                }
                HeapData::Bytes(bytes) => {
                    if let Some(i) = index.as_int() {
                        return Ok(Value::Int(bytes.byte_at(i)?));
                    }
                    return Err(ExcType::type_error("byte indices must be integers or slices"));
                }
                HeapData::Range(range) => {
                    if let Some(i) = index.as_int() {
                        return Ok(Value::Int(range.item_at(i)?));
                    }
                    return Err(ExcType::type_error("range indices must be integers or slices"));
                }
                HeapData::Dict(_) => {
                    return match self.dict_get_value(*id, index)? {
                        Some(value) => Ok(value),
                        None => Err(ExcType::key_error(crate::value::py_repr(index, self.heap, self.interns))),
                    };
                }
                HeapData::Instance(_) => {
                    let arg = index.clone_with_heap(self.heap);
                    if let Some(result) =
                        self.call_dunder(container, StaticStrings::DunderGetitem.into(), ArgValues::One(arg))?
                    {
                        return Ok(result);
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name(self.heap, self.interns)
        )))
    }

    /// Reads a slice's components as optional ints.
    fn slice_components(&self, slice_id: HeapId) -> RunResult<(Option<i64>, Option<i64>, Option<i64>)> {
        let HeapData::Slice(slice) = self.heap.get(slice_id) else {
            return Err(RunError::internal("slice_components on non-slice"));
        };
        let component = |value: &Value| -> RunResult<Option<i64>> {
            match value {
                Value::None => Ok(None),
                other => other
                    .as_int()
                    .map(Some)
                    .ok_or_else(|| ExcType::type_error("slice indices must be integers or None")),
            }
        };
        Ok((component(&slice.start)?, component(&slice.stop)?, component(&slice.step)?))
    }

    fn slice_get(&mut self, container: &Value, slice_id: HeapId) -> RunResult<Value> {
        let (start, stop, step) = self.slice_components(slice_id)?;

        if let Some(s) = container.as_str(self.heap, self.interns) {
            let string = Str::from(s);
            let indices = normalize_slice(start, stop, step, string.char_len())?;
            let sliced = string.slice_chars(indices.iter());
            return self.make_str(sliced);
        }

        if let Value::Ref(id) = container {
            match self.heap.get(*id) {
                HeapData::List(list) => {
                    let indices = normalize_slice(start, stop, step, list.len())?;
                    let items: Vec<Value> = {
                        let HeapData::List(list) = self.heap.get(*id) else { unreachable!() };
                        indices
                            .iter()
                            .map(|i| list.items()[i].clone_with_heap(self.heap))
                            .collect()
                    };
                    let new_id = self.heap.allocate(HeapData::List(List::from(items)))?;
                    return Ok(Value::Ref(new_id));
                }
                HeapData::Tuple(tuple) => {
                    let indices = normalize_slice(start, stop, step, tuple.len())?;
                    let items: Vec<Value> = {
                        let HeapData::Tuple(tuple) = self.heap.get(*id) else { unreachable!() };
                        indices
                            .iter()
                            .map(|i| tuple.items()[i].clone_with_heap(self.heap))
                            .collect()
                    };
                    let new_id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
                    return Ok(Value::Ref(new_id));
                }
                HeapData::Bytes(bytes) => {
                    let indices = normalize_slice(start, stop, step, bytes.len())?;
                    let slice: Vec<u8> = {
                        let HeapData::Bytes(bytes) = self.heap.get(*id) else { unreachable!() };
                        indices.iter().map(|i| bytes.as_slice()[i]).collect()
                    };
                    let new_id = self.heap.allocate(HeapData::Bytes(crate::types::Bytes::from(slice)))?;
                    return Ok(Value::Ref(new_id));
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object is not sliceable",
            container.type_name(self.heap, self.interns)
        )))
    }

    pub(super) fn op_store_subscr(&mut self) -> RunResult<()> {
        // Stack: value, container, key (key on top).
        let key = self.pop();
        let container = self.pop();
        let value = self.pop();
        let result = self.subscr_set(&container, key, value);
        container.drop_with_heap(self.heap);
        result
    }

    fn subscr_set(&mut self, container: &Value, key: Value, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = container {
            match self.heap.get(*id) {
                HeapData::List(_) => {
                    let Some(i) = key.as_int() else {
                        let message = format!(
                            "list indices must be integers or slices, not '{}'",
                            key.type_name(self.heap, self.interns)
                        );
                        key.drop_with_heap(self.heap);
                        value.drop_with_heap(self.heap);
                        return Err(ExcType::type_error(message));
                    };
                    key.drop_with_heap(self.heap);
                    let HeapData::List(list) = self.heap.get(*id) else { unreachable!() };
                    let idx = match list.resolve_index(i) {
                        Ok(idx) => idx,
                        Err(err) => {
                            value.drop_with_heap(self.heap);
                            return Err(err);
                        }
                    };
                    let HeapData::List(list) = self.heap.get_mut(*id) else { unreachable!() };
                    let old = std::mem::replace(&mut list.items_mut()[idx], value);
                    old.drop_with_heap(self.heap);
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    return self.dict_insert_value(*id, key, value);
                }
                HeapData::Instance(_) => {
                    if self
                        .class_of_instance(*id)
                        .is_some_and(|class_id| self.class_has_member(class_id, StaticStrings::DunderSetitem.into()))
                    {
                        let result =
                            self.call_dunder(container, StaticStrings::DunderSetitem.into(), ArgValues::Two(key, value))?;
                        if let Some(result) = result {
                            result.drop_with_heap(self.heap);
                            return Ok(());
                        }
                        return Err(RunError::internal("__setitem__ vanished during dispatch"));
                    }
                }
                _ => {}
            }
        }
        let message = format!(
            "'{}' object does not support item assignment",
            container.type_name(self.heap, self.interns)
        );
        key.drop_with_heap(self.heap);
        value.drop_with_heap(self.heap);
        Err(ExcType::type_error(message))
    }

    pub(super) fn op_delete_subscr(&mut self) -> RunResult<()> {
        let key = self.pop();
        let container = self.pop();
        let result = self.subscr_delete(&container, &key);
        key.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        result
    }

    fn subscr_delete(&mut self, container: &Value, key: &Value) -> RunResult<()> {
        if let Value::Ref(id) = container {
            match self.heap.get(*id) {
                HeapData::List(list) => {
                    let Some(i) = key.as_int() else {
                        return Err(ExcType::type_error("list indices must be integers or slices"));
                    };
                    let idx = list.resolve_index(i)?;
                    let HeapData::List(list) = self.heap.get_mut(*id) else { unreachable!() };
                    let old = list.items_mut().remove(idx);
                    old.drop_with_heap(self.heap);
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    return match self.dict_remove_value(*id, key)? {
                        Some(old) => {
                            old.drop_with_heap(self.heap);
                            Ok(())
                        }
                        None => Err(ExcType::key_error(crate::value::py_repr(key, self.heap, self.interns))),
                    };
                }
                HeapData::Instance(_) => {
                    let arg = key.clone_with_heap(self.heap);
                    if let Some(result) =
                        self.call_dunder(container, StaticStrings::DunderDelitem.into(), ArgValues::One(arg))?
                    {
                        result.drop_with_heap(self.heap);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object does not support item deletion",
            container.type_name(self.heap, self.interns)
        )))
    }

    // ==================================================================
    // Iteration
    // ==================================================================

    /// `GetIter`: converts a value into an iterator value, consuming it.
    pub(crate) fn get_iter_value(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = &value {
            match self.heap.get(*id) {
                // Iterators and generators are their own iterators.
                HeapData::Iter(_) | HeapData::Generator(_) => return Ok(value),
                HeapData::Range(range) => {
                    let iter = Iter::from_range(*range);
                    value.drop_with_heap(self.heap);
                    let id = self.heap.allocate(HeapData::Iter(iter))?;
                    return Ok(Value::Ref(id));
                }
                HeapData::Instance(_) => {
                    if let Some(result) = self.call_dunder(&value, StaticStrings::DunderIter.into(), ArgValues::Empty)? {
                        value.drop_with_heap(self.heap);
                        return self.require_iterator(result);
                    }
                    // An instance with __next__ but no __iter__ still drives.
                    if self
                        .class_of_instance(*id)
                        .is_some_and(|class_id| self.class_has_member(class_id, StaticStrings::DunderNext.into()))
                    {
                        let iter = Iter::Dunder(value);
                        let id = self.heap.allocate(HeapData::Iter(iter))?;
                        return Ok(Value::Ref(id));
                    }
                    let message = ExcType::not_iterable(value.type_name(self.heap, self.interns));
                    value.drop_with_heap(self.heap);
                    return Err(message);
                }
                _ => {}
            }
        }
        let items = self.materialize_items(&value)?;
        match items {
            Some(items) => {
                value.drop_with_heap(self.heap);
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(items)))?;
                Ok(Value::Ref(id))
            }
            None => {
                let message = ExcType::not_iterable(value.type_name(self.heap, self.interns));
                value.drop_with_heap(self.heap);
                Err(message)
            }
        }
    }

    fn require_iterator(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = &value
            && matches!(self.heap.get(*id), HeapData::Iter(_) | HeapData::Generator(_) | HeapData::Instance(_))
        {
            return Ok(value);
        }
        let message = format!(
            "iter() returned non-iterator of type '{}'",
            value.type_name(self.heap, self.interns)
        );
        value.drop_with_heap(self.heap);
        Err(ExcType::type_error(message))
    }

    /// Materializes the items of a builtin iterable snapshot.
    fn materialize_items(&mut self, value: &Value) -> RunResult<Option<Vec<Value>>> {
        if let Some(s) = value.as_str(self.heap, self.interns) {
            let chars: Vec<String> = s.chars().map(|c| c.to_string()).collect();
            let mut items = Vec::with_capacity(chars.len());
            for c in chars {
                items.push(self.make_str(c)?);
            }
            return Ok(Some(items));
        }
        let Value::Ref(id) = value else { return Ok(None) };
        let items: Vec<Value> = match self.heap.get(*id) {
            HeapData::List(list) => list.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            HeapData::Tuple(tuple) => tuple.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            HeapData::Bytes(bytes) => bytes.as_slice().iter().map(|&b| Value::Int(i64::from(b))).collect(),
            HeapData::Dict(dict) => dict.iter().map(|(k, _)| k.clone_with_heap(self.heap)).collect(),
            HeapData::Set(set) => set.0.iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            HeapData::FrozenSet(set) => set.iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            HeapData::Range(range) => {
                let range = *range;
                (0..range.len())
                    .map(|i| Value::Int(range.item_at(i as i64).expect("index within range length")))
                    .collect()
            }
            _ => return Ok(None),
        };
        Ok(Some(items))
    }

    /// Advances the iterator at TOS; `None` means exhausted.
    pub(super) fn advance_top_iterator(&mut self) -> RunResult<Option<Value>> {
        let Value::Ref(iter_id) = self.peek() else {
            return Err(RunError::internal("ForIter on a non-iterator"));
        };
        let iter_id = *iter_id;
        self.iter_next_by_id(iter_id)
    }

    /// Advances any iterator-shaped heap value.
    pub(crate) fn iter_next_by_id(&mut self, iter_id: HeapId) -> RunResult<Option<Value>> {
        match self.heap.get(iter_id) {
            HeapData::Generator(_) => {
                return self.generator_next(iter_id);
            }
            // A user iterator driving itself (`__iter__` returned self).
            HeapData::Instance(_) => {
                let receiver = Value::Ref(iter_id);
                self.heap.inc_ref(iter_id);
                let result = self.call_dunder(&receiver, StaticStrings::DunderNext.into(), ArgValues::Empty);
                receiver.drop_with_heap(self.heap);
                return match result {
                    Ok(Some(value)) => Ok(Some(value)),
                    Ok(None) => Err(ExcType::type_error("iterator object has no __next__")),
                    Err(err) if err.is_stop_iteration() => Ok(None),
                    Err(err) => Err(err),
                };
            }
            HeapData::Iter(_) => {}
            _ => return Err(RunError::internal("ForIter on a non-iterator")),
        }

        // Two-phase advance: peek and clone with a shared borrow, then bump.
        enum Plan {
            Done,
            Item(Value),
            Range,
            Gen(HeapId),
            Dunder(Value),
        }
        let plan = {
            let HeapData::Iter(iter) = self.heap.get(iter_id) else { unreachable!() };
            match iter {
                Iter::Items { .. } => match iter.peek() {
                    Some(value) => Plan::Item(value.clone_with_heap(self.heap)),
                    None => Plan::Done,
                },
                Iter::Range { .. } => Plan::Range,
                Iter::Gen(gen_id) => Plan::Gen(*gen_id),
                Iter::Dunder(obj) => Plan::Dunder(obj.clone_with_heap(self.heap)),
            }
        };

        match plan {
            Plan::Done => Ok(None),
            Plan::Item(value) => {
                let HeapData::Iter(iter) = self.heap.get_mut(iter_id) else { unreachable!() };
                iter.advance();
                Ok(Some(value))
            }
            Plan::Range => {
                let HeapData::Iter(iter) = self.heap.get_mut(iter_id) else { unreachable!() };
                Ok(iter.range_next().map(Value::Int))
            }
            Plan::Gen(gen_id) => self.generator_next(gen_id),
            Plan::Dunder(obj) => {
                let result = self.call_dunder(&obj, StaticStrings::DunderNext.into(), ArgValues::Empty);
                obj.drop_with_heap(self.heap);
                match result {
                    Ok(Some(value)) => Ok(Some(value)),
                    Ok(None) => Err(ExcType::type_error("iterator object has no __next__")),
                    Err(err) if err.is_stop_iteration() => Ok(None),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Drives `__next__` on a generator heap value.
    fn generator_next(&mut self, gen_id: HeapId) -> RunResult<Option<Value>> {
        let HeapData::Generator(generator) = self.heap.get(gen_id) else {
            return Err(RunError::internal("generator_next on non-generator"));
        };
        if generator.state == GenState::Closed {
            return Ok(None);
        }
        match self.resume_generator(gen_id, super::r#gen::ResumeWith::Send(Value::None))? {
            super::r#gen::GenOutcome::Yielded(value) => Ok(Some(value)),
            super::r#gen::GenOutcome::Returned(value) => {
                value.drop_with_heap(self.heap);
                Ok(None)
            }
        }
    }

    /// Collects any iterable into an owned vector.
    pub(crate) fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        if let Some(items) = self.materialize_items(&value)? {
            value.drop_with_heap(self.heap);
            return Ok(items);
        }
        // Driver-shaped iterables: drain through the iterator protocol.
        let iter = self.get_iter_value(value)?;
        let Value::Ref(iter_id) = &iter else {
            iter.drop_with_heap(self.heap);
            return Err(RunError::internal("iterator is not heap-allocated"));
        };
        let iter_id = *iter_id;
        let mut items = Vec::new();
        loop {
            match self.iter_next_by_id(iter_id) {
                Ok(Some(value)) => items.push(value),
                Ok(None) => break,
                Err(err) => {
                    for item in items {
                        item.drop_with_heap(self.heap);
                    }
                    iter.drop_with_heap(self.heap);
                    return Err(err);
                }
            }
        }
        iter.drop_with_heap(self.heap);
        Ok(items)
    }

    /// `GetLen`: length of the subject without popping it.
    pub(super) fn op_get_len(&mut self) -> RunResult<i64> {
        let subject = self.peek().clone_with_heap(self.heap);
        let result = self.value_len(&subject);
        subject.drop_with_heap(self.heap);
        result
    }

    /// Dunder-aware `len()`.
    pub(crate) fn value_len(&mut self, value: &Value) -> RunResult<i64> {
        if let Some(len) = crate::value::py_len(value, self.heap, self.interns) {
            return Ok(i64::try_from(len).unwrap_or(i64::MAX));
        }
        if let Some(result) = self.call_dunder(value, StaticStrings::DunderLen.into(), ArgValues::Empty)? {
            return match result.as_int() {
                Some(len) => Ok(len),
                None => {
                    result.drop_with_heap(self.heap);
                    Err(ExcType::type_error("__len__ should return an int"))
                }
            };
        }
        Err(ExcType::type_error(format!(
            "object of type '{}' has no len()",
            value.type_name(self.heap, self.interns)
        )))
    }
}
