//! Structural pattern-matching opcodes.

use crate::{
    except::{ExcType, RunError, RunResult},
    heap::HeapData,
    intern::{StaticStrings, StringId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Dict, Tuple},
    value::{Value, values_equal},
};

use super::Vm;

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `MatchSequence`: is the subject a positional sequence?
    ///
    /// Strings and bytes are explicitly not sequences for match purposes.
    pub(super) fn op_match_sequence(&mut self) {
        let is_sequence = matches!(
            self.peek(),
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::List(_) | HeapData::Tuple(_))
        );
        self.push(Value::Bool(is_sequence));
    }

    /// `MatchStar`: does the subject meet the minimum length for a
    /// starred subpattern?
    pub(super) fn op_match_star(&mut self, min_len: usize) {
        let long_enough = match self.peek() {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(l) => l.len() >= min_len,
                HeapData::Tuple(t) => t.len() >= min_len,
                _ => false,
            },
            _ => false,
        };
        self.push(Value::Bool(long_enough));
    }

    /// `ExtractStar`: materialize the starred slice; identical stack
    /// protocol to `UnpackEx`.
    pub(super) fn op_extract_star(&mut self, before: usize, after: usize) -> RunResult<()> {
        self.op_unpack_ex(before, after)
    }

    /// `MatchMapping`: is the subject a mapping?
    pub(super) fn op_match_mapping(&mut self) {
        let is_mapping = matches!(
            self.peek(),
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Dict(_))
        );
        self.push(Value::Bool(is_mapping));
    }

    /// `MatchKeys`: TOS a tuple of keys, beneath it the subject dict.
    /// Pushes a tuple of the corresponding values, or None when any key
    /// is missing — the collection is atomic.
    pub(super) fn op_match_keys(&mut self, _count: usize) -> RunResult<()> {
        let keys_value = self.pop();
        let keys: Vec<Value> = {
            let Value::Ref(id) = &keys_value else {
                keys_value.drop_with_heap(self.heap);
                return Err(RunError::internal("MatchKeys expects a tuple of keys"));
            };
            let HeapData::Tuple(tuple) = self.heap.get(*id) else {
                keys_value.drop_with_heap(self.heap);
                return Err(RunError::internal("MatchKeys expects a tuple of keys"));
            };
            tuple.items().iter().map(|k| k.clone_with_heap(self.heap)).collect()
        };
        keys_value.drop_with_heap(self.heap);

        let Value::Ref(subject_id) = self.peek() else {
            for key in keys {
                key.drop_with_heap(self.heap);
            }
            self.push(Value::None);
            return Ok(());
        };
        let subject_id = *subject_id;
        if !matches!(self.heap.get(subject_id), HeapData::Dict(_)) {
            for key in keys {
                key.drop_with_heap(self.heap);
            }
            self.push(Value::None);
            return Ok(());
        }

        let mut collected = Vec::with_capacity(keys.len());
        let mut missing = false;
        for key in &keys {
            match self.dict_get_value(subject_id, key)? {
                Some(value) => collected.push(value),
                None => {
                    missing = true;
                    break;
                }
            }
        }
        for key in keys {
            key.drop_with_heap(self.heap);
        }
        if missing {
            for value in collected {
                value.drop_with_heap(self.heap);
            }
            self.push(Value::None);
            return Ok(());
        }
        let id = self.heap.allocate(HeapData::Tuple(Tuple::from(collected)))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// `CopyDictWithoutKeys`: the `**rest` capture — TOS a tuple of
    /// matched keys, beneath it the subject dict; pushes the copy.
    pub(super) fn op_copy_dict_without_keys(&mut self, _count: usize) -> RunResult<()> {
        let keys_value = self.pop();
        let excluded: Vec<Value> = {
            let Value::Ref(id) = &keys_value else {
                keys_value.drop_with_heap(self.heap);
                return Err(RunError::internal("CopyDictWithoutKeys expects a tuple"));
            };
            let HeapData::Tuple(tuple) = self.heap.get(*id) else {
                keys_value.drop_with_heap(self.heap);
                return Err(RunError::internal("CopyDictWithoutKeys expects a tuple"));
            };
            tuple.items().iter().map(|k| k.clone_with_heap(self.heap)).collect()
        };
        keys_value.drop_with_heap(self.heap);

        let Value::Ref(subject_id) = self.peek() else {
            for key in excluded {
                key.drop_with_heap(self.heap);
            }
            return Err(RunError::internal("CopyDictWithoutKeys expects a dict subject"));
        };
        let subject_id = *subject_id;
        let entries: Vec<(Value, Value)> = {
            let HeapData::Dict(dict) = self.heap.get(subject_id) else {
                for key in excluded {
                    key.drop_with_heap(self.heap);
                }
                return Err(RunError::internal("CopyDictWithoutKeys expects a dict subject"));
            };
            dict.iter()
                .map(|(k, v)| (k.clone_with_heap(self.heap), v.clone_with_heap(self.heap)))
                .collect()
        };

        let mut rest = Dict::new();
        for (key, value) in entries {
            let skip = excluded
                .iter()
                .any(|ex| values_equal(ex, &key, self.heap, self.interns));
            if skip {
                key.drop_with_heap(self.heap);
                value.drop_with_heap(self.heap);
            } else {
                self.dict_raw_insert(&mut rest, key, value)?;
            }
        }
        for key in excluded {
            key.drop_with_heap(self.heap);
        }
        let id = self.heap.allocate(HeapData::Dict(rest))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// `MatchClass`: TOS the class, beneath it the subject. Pushes a
    /// tuple of positionally-extracted attributes (via `__match_args__`)
    /// on success, or None on failure.
    pub(super) fn op_match_class(&mut self, positional_count: usize) -> RunResult<()> {
        let class_value = self.pop();
        let subject = self.peek().clone_with_heap(self.heap);

        let matches_type = self.isinstance_check(&subject, &class_value)?;
        if !matches_type {
            class_value.drop_with_heap(self.heap);
            subject.drop_with_heap(self.heap);
            self.push(Value::None);
            return Ok(());
        }

        if positional_count == 0 {
            class_value.drop_with_heap(self.heap);
            subject.drop_with_heap(self.heap);
            let id = self.heap.empty_tuple()?;
            self.push(Value::Ref(id));
            return Ok(());
        }

        // Positional subpatterns resolve through __match_args__.
        let match_args: Vec<crate::intern::StringId> = {
            let names = match &class_value {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Class(class) => class
                        .members
                        .get(&StringId::from(StaticStrings::DunderMatchArgs))
                        .map(|v| v.clone_with_heap(self.heap)),
                    _ => None,
                },
                _ => None,
            };
            match names {
                Some(names_value) => {
                    let collected = {
                        let Value::Ref(id) = &names_value else {
                            names_value.drop_with_heap(self.heap);
                            class_value.drop_with_heap(self.heap);
                            subject.drop_with_heap(self.heap);
                            return Err(ExcType::type_error("__match_args__ must be a tuple"));
                        };
                        let HeapData::Tuple(tuple) = self.heap.get(*id) else {
                            names_value.drop_with_heap(self.heap);
                            class_value.drop_with_heap(self.heap);
                            subject.drop_with_heap(self.heap);
                            return Err(ExcType::type_error("__match_args__ must be a tuple"));
                        };
                        let mut ids = Vec::with_capacity(tuple.len());
                        let mut texts = Vec::new();
                        for item in tuple.items() {
                            match item {
                                Value::InternString(name) => ids.push(Some(*name)),
                                Value::Ref(sid) => {
                                    if let HeapData::Str(s) = self.heap.get(*sid) {
                                        ids.push(None);
                                        texts.push(s.as_str().to_owned());
                                    } else {
                                        ids.push(None);
                                        texts.push(String::new());
                                    }
                                }
                                _ => {
                                    ids.push(None);
                                    texts.push(String::new());
                                }
                            }
                        }
                        (ids, texts)
                    };
                    names_value.drop_with_heap(self.heap);
                    let (ids, mut texts) = collected;
                    let mut resolved = Vec::with_capacity(ids.len());
                    let mut text_iter = texts.drain(..);
                    for id in ids {
                        match id {
                            Some(id) => resolved.push(id),
                            None => {
                                let text = text_iter.next().unwrap_or_default();
                                resolved.push(self.interns.intern(&text));
                            }
                        }
                    }
                    resolved
                }
                None => Vec::new(),
            }
        };

        if positional_count > match_args.len() {
            class_value.drop_with_heap(self.heap);
            subject.drop_with_heap(self.heap);
            self.push(Value::None);
            return Ok(());
        }
        class_value.drop_with_heap(self.heap);

        let mut extracted = Vec::with_capacity(positional_count);
        for &name in match_args.iter().take(positional_count) {
            match self.getattr_value(&subject, name) {
                Ok(value) => extracted.push(value),
                Err(_) => {
                    for value in extracted {
                        value.drop_with_heap(self.heap);
                    }
                    subject.drop_with_heap(self.heap);
                    self.push(Value::None);
                    return Ok(());
                }
            }
        }
        subject.drop_with_heap(self.heap);
        let id = self.heap.allocate(HeapData::Tuple(Tuple::from(extracted)))?;
        self.push(Value::Ref(id));
        Ok(())
    }
}
