//! Builtin methods on containers and strings.
//!
//! These are reached through attribute lookup (`xs.append`, `d.get`, ...)
//! as bound methods carrying a [`MethodFn`] selector; the receiver
//! arrives prepended to the positional arguments.

use crate::{
    args::ArgValues,
    bytecode::vm::Vm,
    except::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Iter, List, Tuple},
    value::{Value, values_equal},
};

use super::MethodFn;

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    pub(super) fn call_container_method(&mut self, method: MethodFn, args: ArgValues) -> RunResult<Value> {
        match method {
            MethodFn::ListAppend => {
                let (receiver, value) = args.get_two("append", self.heap)?;
                let list_id = self.expect_list(&receiver, &value)?;
                let HeapData::List(list) = self.heap.get_mut(list_id) else { unreachable!() };
                list.push(value);
                receiver.drop_with_heap(self.heap);
                Ok(Value::None)
            }
            MethodFn::ListExtend => {
                let (receiver, iterable) = args.get_two("extend", self.heap)?;
                let list_id = self.expect_list(&receiver, &iterable)?;
                let items = self.collect_iterable(iterable)?;
                let HeapData::List(list) = self.heap.get_mut(list_id) else { unreachable!() };
                list.items_mut().extend(items);
                receiver.drop_with_heap(self.heap);
                Ok(Value::None)
            }
            MethodFn::ListPop => {
                let (receiver, index) = args.get_one_or_two("pop", self.heap)?;
                let Value::Ref(list_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    return Err(RunError::internal("pop on non-list"));
                };
                let list_id = *list_id;
                let index = match index {
                    Some(value) => {
                        let i = value
                            .as_int()
                            .ok_or_else(|| ExcType::type_error("list indices must be integers"))?;
                        Some(i)
                    }
                    None => None,
                };
                let result = {
                    let HeapData::List(list) = self.heap.get_mut(list_id) else {
                        receiver.drop_with_heap(self.heap);
                        return Err(RunError::internal("pop on non-list"));
                    };
                    if list.is_empty() {
                        Err(ExcType::index_error("pop from empty list"))
                    } else {
                        let len = list.len() as i64;
                        let idx = index.unwrap_or(len - 1);
                        let idx = if idx < 0 { idx + len } else { idx };
                        if idx < 0 || idx >= len {
                            Err(ExcType::index_error("pop"))
                        } else {
                            Ok(list.items_mut().remove(idx as usize))
                        }
                    }
                };
                receiver.drop_with_heap(self.heap);
                result
            }
            MethodFn::ListInsert => {
                let (positional, _) = args.into_parts();
                let mut iter = positional.into_iter();
                let (Some(receiver), Some(index), Some(value)) = (iter.next(), iter.next(), iter.next()) else {
                    return Err(ExcType::arg_count_error("insert", 2, 0));
                };
                let Some(at) = index.as_int() else {
                    receiver.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("list indices must be integers"));
                };
                let Value::Ref(list_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    return Err(RunError::internal("insert on non-list"));
                };
                let list_id = *list_id;
                let HeapData::List(list) = self.heap.get_mut(list_id) else {
                    receiver.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    return Err(RunError::internal("insert on non-list"));
                };
                let len = list.len() as i64;
                let at = at.clamp(-len, len);
                let at = if at < 0 { at + len } else { at };
                list.items_mut().insert(at as usize, value);
                receiver.drop_with_heap(self.heap);
                Ok(Value::None)
            }
            MethodFn::ListRemove => {
                let (receiver, probe) = args.get_two("remove", self.heap)?;
                let Value::Ref(list_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    probe.drop_with_heap(self.heap);
                    return Err(RunError::internal("remove on non-list"));
                };
                let list_id = *list_id;
                let position = {
                    let HeapData::List(list) = self.heap.get(list_id) else {
                        receiver.drop_with_heap(self.heap);
                        probe.drop_with_heap(self.heap);
                        return Err(RunError::internal("remove on non-list"));
                    };
                    list.items()
                        .iter()
                        .position(|item| values_equal(item, &probe, self.heap, self.interns))
                };
                probe.drop_with_heap(self.heap);
                let result = match position {
                    Some(position) => {
                        let HeapData::List(list) = self.heap.get_mut(list_id) else { unreachable!() };
                        let removed = list.items_mut().remove(position);
                        removed.drop_with_heap(self.heap);
                        Ok(Value::None)
                    }
                    None => Err(ExcType::value_error("list.remove(x): x not in list")),
                };
                receiver.drop_with_heap(self.heap);
                result
            }

            MethodFn::DictGet => {
                let (receiver, key, default) = args.get_up_to_three("get", self.heap)?;
                let Some(key) = key else {
                    receiver.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("get", 1, 0));
                };
                let Value::Ref(dict_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    key.drop_with_heap(self.heap);
                    return Err(RunError::internal("get on non-dict"));
                };
                let dict_id = *dict_id;
                let found = self.dict_get_value(dict_id, &key)?;
                key.drop_with_heap(self.heap);
                receiver.drop_with_heap(self.heap);
                match found {
                    Some(value) => {
                        if let Some(default) = default {
                            default.drop_with_heap(self.heap);
                        }
                        Ok(value)
                    }
                    None => Ok(default.unwrap_or(Value::None)),
                }
            }
            MethodFn::DictKeys | MethodFn::DictValues | MethodFn::DictItems => {
                let receiver = args.get_one("keys", self.heap)?;
                let Value::Ref(dict_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    return Err(RunError::internal("dict view on non-dict"));
                };
                let dict_id = *dict_id;
                let entries: Vec<(Value, Value)> = {
                    let HeapData::Dict(dict) = self.heap.get(dict_id) else {
                        receiver.drop_with_heap(self.heap);
                        return Err(RunError::internal("dict view on non-dict"));
                    };
                    dict.iter()
                        .map(|(k, v)| (k.clone_with_heap(self.heap), v.clone_with_heap(self.heap)))
                        .collect()
                };
                receiver.drop_with_heap(self.heap);
                let mut items = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    match method {
                        MethodFn::DictKeys => {
                            value.drop_with_heap(self.heap);
                            items.push(key);
                        }
                        MethodFn::DictValues => {
                            key.drop_with_heap(self.heap);
                            items.push(value);
                        }
                        MethodFn::DictItems => {
                            let pair_id = self.heap.allocate(HeapData::Tuple(Tuple::from(vec![key, value])))?;
                            items.push(Value::Ref(pair_id));
                        }
                        _ => unreachable!(),
                    }
                }
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(items)))?;
                Ok(Value::Ref(id))
            }
            MethodFn::DictPop => {
                let (receiver, key, default) = args.get_up_to_three("pop", self.heap)?;
                let Some(key) = key else {
                    receiver.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("pop", 1, 0));
                };
                let Value::Ref(dict_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    key.drop_with_heap(self.heap);
                    return Err(RunError::internal("pop on non-dict"));
                };
                let dict_id = *dict_id;
                let removed = self.dict_remove_value(dict_id, &key)?;
                receiver.drop_with_heap(self.heap);
                match removed {
                    Some(value) => {
                        key.drop_with_heap(self.heap);
                        if let Some(default) = default {
                            default.drop_with_heap(self.heap);
                        }
                        Ok(value)
                    }
                    None => match default {
                        Some(default) => {
                            key.drop_with_heap(self.heap);
                            Ok(default)
                        }
                        None => {
                            let repr = crate::value::py_repr(&key, self.heap, self.interns);
                            key.drop_with_heap(self.heap);
                            Err(ExcType::key_error(repr))
                        }
                    },
                }
            }
            MethodFn::DictSetdefault => {
                let (receiver, key, default) = args.get_up_to_three("setdefault", self.heap)?;
                let Some(key) = key else {
                    receiver.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("setdefault", 1, 0));
                };
                let Value::Ref(dict_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    key.drop_with_heap(self.heap);
                    return Err(RunError::internal("setdefault on non-dict"));
                };
                let dict_id = *dict_id;
                let existing = self.dict_get_value(dict_id, &key)?;
                receiver.drop_with_heap(self.heap);
                match existing {
                    Some(value) => {
                        key.drop_with_heap(self.heap);
                        if let Some(default) = default {
                            default.drop_with_heap(self.heap);
                        }
                        Ok(value)
                    }
                    None => {
                        let default = default.unwrap_or(Value::None);
                        let result = default.clone_with_heap(self.heap);
                        self.dict_insert_value(dict_id, key, default)?;
                        Ok(result)
                    }
                }
            }
            MethodFn::DictUpdate => {
                let (receiver, other) = args.get_two("update", self.heap)?;
                let (Value::Ref(target_id), Value::Ref(source_id)) = (&receiver, &other) else {
                    receiver.drop_with_heap(self.heap);
                    other.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("update() argument must be a dict"));
                };
                let (target_id, source_id) = (*target_id, *source_id);
                if !matches!(self.heap.get(source_id), HeapData::Dict(_)) {
                    receiver.drop_with_heap(self.heap);
                    other.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("update() argument must be a dict"));
                }
                self.dict_update_from(target_id, source_id, false)?;
                receiver.drop_with_heap(self.heap);
                other.drop_with_heap(self.heap);
                Ok(Value::None)
            }

            MethodFn::SetAdd | MethodFn::SetRemove | MethodFn::SetDiscard => {
                let (receiver, member) = args.get_two("add", self.heap)?;
                let Value::Ref(set_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    member.drop_with_heap(self.heap);
                    return Err(RunError::internal("set method on non-set"));
                };
                let set_id = *set_id;
                let hash = self.value_hash(&member)?;
                let result = match method {
                    MethodFn::SetAdd => {
                        let mut data = self.heap.take_data(set_id);
                        let HeapData::Set(set) = &mut data else {
                            self.heap.restore_data(set_id, data);
                            member.drop_with_heap(self.heap);
                            receiver.drop_with_heap(self.heap);
                            return Err(RunError::internal("set method on non-set"));
                        };
                        self.storage_add(&mut set.0, member, hash);
                        self.heap.restore_data(set_id, data);
                        Ok(Value::None)
                    }
                    MethodFn::SetRemove | MethodFn::SetDiscard => {
                        let mut data = self.heap.take_data(set_id);
                        let HeapData::Set(set) = &mut data else {
                            self.heap.restore_data(set_id, data);
                            member.drop_with_heap(self.heap);
                            receiver.drop_with_heap(self.heap);
                            return Err(RunError::internal("set method on non-set"));
                        };
                        let removed = set
                            .0
                            .remove(hash, |existing| values_equal(existing, &member, self.heap, self.interns));
                        self.heap.restore_data(set_id, data);
                        match removed {
                            Some(removed) => {
                                removed.drop_with_heap(self.heap);
                                member.drop_with_heap(self.heap);
                                Ok(Value::None)
                            }
                            None if method == MethodFn::SetDiscard => {
                                member.drop_with_heap(self.heap);
                                Ok(Value::None)
                            }
                            None => {
                                let repr = crate::value::py_repr(&member, self.heap, self.interns);
                                member.drop_with_heap(self.heap);
                                Err(ExcType::key_error(repr))
                            }
                        }
                    }
                    _ => unreachable!(),
                };
                receiver.drop_with_heap(self.heap);
                result
            }

            MethodFn::StrJoin => {
                let (receiver, iterable) = args.get_two("join", self.heap)?;
                let Some(separator) = receiver.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    iterable.drop_with_heap(self.heap);
                    return Err(RunError::internal("join on non-string"));
                };
                receiver.drop_with_heap(self.heap);
                let items = self.collect_iterable(iterable)?;
                let mut pieces = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let Some(piece) = item.as_str(self.heap, self.interns) else {
                        let message = ExcType::type_error(format!(
                            "sequence item {index}: expected str instance, {} found",
                            item.type_name(self.heap, self.interns)
                        ));
                        for item in items {
                            item.drop_with_heap(self.heap);
                        }
                        return Err(message);
                    };
                    pieces.push(piece.to_owned());
                }
                for item in items {
                    item.drop_with_heap(self.heap);
                }
                self.make_str(pieces.join(&separator))
            }
            MethodFn::StrSplit => {
                let (receiver, separator) = args.get_one_or_two("split", self.heap)?;
                let Some(text) = receiver.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    return Err(RunError::internal("split on non-string"));
                };
                receiver.drop_with_heap(self.heap);
                let pieces: Vec<String> = match separator {
                    Some(sep_value) => {
                        let Some(sep) = sep_value.as_str(self.heap, self.interns).map(str::to_owned) else {
                            sep_value.drop_with_heap(self.heap);
                            return Err(ExcType::type_error("separator must be a string"));
                        };
                        sep_value.drop_with_heap(self.heap);
                        if sep.is_empty() {
                            return Err(ExcType::value_error("empty separator"));
                        }
                        text.split(&sep).map(str::to_owned).collect()
                    }
                    None => text.split_whitespace().map(str::to_owned).collect(),
                };
                let mut items = Vec::with_capacity(pieces.len());
                for piece in pieces {
                    items.push(self.make_str(piece)?);
                }
                let id = self.heap.allocate(HeapData::List(List::from(items)))?;
                Ok(Value::Ref(id))
            }
            MethodFn::StrUpper | MethodFn::StrLower | MethodFn::StrStrip => {
                let receiver = args.get_one("str method", self.heap)?;
                let Some(text) = receiver.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    return Err(RunError::internal("string method on non-string"));
                };
                receiver.drop_with_heap(self.heap);
                let result = match method {
                    MethodFn::StrUpper => text.to_uppercase(),
                    MethodFn::StrLower => text.to_lowercase(),
                    MethodFn::StrStrip => text.trim().to_owned(),
                    _ => unreachable!(),
                };
                self.make_str(result)
            }
            MethodFn::StrStartswith | MethodFn::StrEndswith => {
                let (receiver, probe) = args.get_two("startswith", self.heap)?;
                let Some(text) = receiver.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    probe.drop_with_heap(self.heap);
                    return Err(RunError::internal("string method on non-string"));
                };
                let Some(needle) = probe.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    probe.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("argument must be str"));
                };
                receiver.drop_with_heap(self.heap);
                probe.drop_with_heap(self.heap);
                let verdict = if method == MethodFn::StrStartswith {
                    text.starts_with(&needle)
                } else {
                    text.ends_with(&needle)
                };
                Ok(Value::Bool(verdict))
            }
            MethodFn::StrFind => {
                let (receiver, probe) = args.get_two("find", self.heap)?;
                let Some(text) = receiver.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    probe.drop_with_heap(self.heap);
                    return Err(RunError::internal("string method on non-string"));
                };
                let Some(needle) = probe.as_str(self.heap, self.interns).map(str::to_owned) else {
                    receiver.drop_with_heap(self.heap);
                    probe.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("argument must be str"));
                };
                receiver.drop_with_heap(self.heap);
                probe.drop_with_heap(self.heap);
                // Byte offset converts to a code-point index.
                let position = text
                    .find(&needle)
                    .map_or(-1, |byte_pos| text[..byte_pos].chars().count() as i64);
                Ok(Value::Int(position))
            }
            MethodFn::StrReplace => {
                let (positional, _) = args.into_parts();
                let mut iter = positional.into_iter();
                let (Some(receiver), Some(from), Some(to)) = (iter.next(), iter.next(), iter.next()) else {
                    return Err(ExcType::arg_count_error("replace", 2, 0));
                };
                let text = receiver.as_str(self.heap, self.interns).map(str::to_owned);
                let from_text = from.as_str(self.heap, self.interns).map(str::to_owned);
                let to_text = to.as_str(self.heap, self.interns).map(str::to_owned);
                receiver.drop_with_heap(self.heap);
                from.drop_with_heap(self.heap);
                to.drop_with_heap(self.heap);
                let (Some(text), Some(from_text), Some(to_text)) = (text, from_text, to_text) else {
                    return Err(ExcType::type_error("replace arguments must be str"));
                };
                self.make_str(text.replace(&from_text, &to_text))
            }

            other => Err(RunError::internal(format!("method {other:?} reached container dispatch"))),
        }
    }

    fn expect_list(&mut self, receiver: &Value, payload: &Value) -> RunResult<HeapId> {
        if let Value::Ref(id) = receiver
            && matches!(self.heap.get(*id), HeapData::List(_))
        {
            return Ok(*id);
        }
        let _ = payload;
        Err(RunError::internal("list method on non-list"))
    }
}
