//! Class objects, instances, `super` proxies, and C3 linearization.

use indexmap::IndexMap;

use crate::{
    except::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    resource::MAX_MRO_LENGTH,
    value::Value,
};
use crate::resource::ResourceTracker;

/// A class: name, bases, member table, and computed MRO.
#[derive(Debug)]
pub struct ClassObject {
    pub name: StringId,
    /// Direct bases, as written in the class statement.
    pub bases: Vec<HeapId>,
    /// Full linearization, starting with this class, ending with `object`.
    pub mro: Vec<HeapId>,
    /// Class body namespace in declaration order.
    pub members: IndexMap<StringId, Value>,
    /// When declared, instances use fixed slot layout instead of a dict.
    pub slots: Option<Vec<StringId>>,
    /// The builtin exception class this class descends from, if any.
    /// Set when a class (transitively) inherits a builtin exception.
    pub exc_base: Option<ExcType>,
}

impl ClassObject {
    /// Looks the name up along the MRO; returns the defining class too.
    #[must_use]
    pub fn mro_lookup<'h, T: ResourceTracker>(
        &'h self,
        heap: &'h Heap<T>,
        self_id: HeapId,
        name: StringId,
    ) -> Option<(&'h Value, HeapId)> {
        for &class_id in &self.mro {
            let class = if class_id == self_id {
                self
            } else {
                match heap.get(class_id) {
                    HeapData::Class(cls) => cls,
                    _ => continue,
                }
            };
            if let Some(value) = class.members.get(&name) {
                return Some((value, class_id));
            }
        }
        None
    }

    /// Slot index of `name` in this class's slot layout.
    #[must_use]
    pub fn slot_index(&self, name: StringId) -> Option<usize> {
        self.slots.as_ref()?.iter().position(|&slot| slot == name)
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        out.extend(self.bases.iter().copied());
        // The MRO shares ids with bases but also pins ancestors.
        out.extend(self.mro.iter().filter(|&&id| !self.bases.contains(&id)));
        for value in self.members.values() {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}

/// An instance: bound class plus dict- or slot-backed state.
#[derive(Debug)]
pub struct Instance {
    pub class_id: HeapId,
    /// Per-instance attributes; `None` when the class declares slots.
    pub attrs: Option<IndexMap<StringId, Value>>,
    /// Fixed-layout storage parallel to the class's slot list.
    pub slot_values: Option<Vec<Value>>,
}

impl Instance {
    /// Allocates instance state matching the class's storage declaration.
    #[must_use]
    pub fn for_class(class_id: HeapId, class: &ClassObject) -> Self {
        match &class.slots {
            Some(slots) => Self {
                class_id,
                attrs: None,
                slot_values: Some((0..slots.len()).map(|_| Value::Undefined).collect()),
            },
            None => Self {
                class_id,
                attrs: Some(IndexMap::new()),
                slot_values: None,
            },
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        out.push(self.class_id);
        if let Some(attrs) = &self.attrs {
            for value in attrs.values() {
                if let Value::Ref(id) = value {
                    out.push(*id);
                }
            }
        }
        if let Some(slots) = &self.slot_values {
            for value in slots {
                if let Value::Ref(id) = value {
                    out.push(*id);
                }
            }
        }
    }
}

/// The object returned by `super()`.
///
/// Attribute lookup starts at `mro_index` within the MRO of
/// `start_class`, skipping the class whose method called `super()`.
#[derive(Debug)]
pub struct SuperProxy {
    pub start_class: HeapId,
    pub receiver: Value,
    pub mro_index: usize,
}

impl SuperProxy {
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        out.push(self.start_class);
        if let Value::Ref(id) = &self.receiver {
            out.push(*id);
        }
    }
}

/// Computes the C3 linearization for a class under construction.
///
/// Merges the linearizations of all bases plus the base list itself:
/// repeatedly take a head that appears in no other list's tail. A failed
/// merge (no valid head) means the hierarchy is inconsistent and class
/// construction fails, naming the offending bases.
pub fn compute_c3_mro<T: ResourceTracker>(
    self_id: HeapId,
    bases: &[HeapId],
    heap: &mut Heap<T>,
    interns: &Interns,
) -> RunResult<Vec<HeapId>> {
    if bases.contains(&self_id) {
        return Err(ExcType::type_error("a class cannot inherit from itself"));
    }
    let object_id = heap.object_class_id()?;
    if bases.is_empty() {
        return Ok(vec![self_id, object_id]);
    }

    let mut linearizations: Vec<Vec<HeapId>> = Vec::with_capacity(bases.len() + 1);
    for &base_id in bases {
        match heap.get(base_id) {
            HeapData::Class(cls) => linearizations.push(cls.mro.clone()),
            _ => return Err(ExcType::type_error("bases must be classes")),
        }
    }
    linearizations.push(bases.to_vec());

    let mut result = vec![self_id];
    loop {
        linearizations.retain(|l| !l.is_empty());
        if linearizations.is_empty() {
            break;
        }

        // A good head appears in no other list's tail.
        let mut found = None;
        for lin in &linearizations {
            let candidate = lin[0];
            let in_tail = linearizations.iter().any(|other| other[1..].contains(&candidate));
            if !in_tail {
                found = Some(candidate);
                break;
            }
        }

        let Some(next) = found else {
            let base_names: Vec<&str> = bases
                .iter()
                .map(|&id| match heap.get(id) {
                    HeapData::Class(cls) => interns.get_str(cls.name),
                    _ => "?",
                })
                .collect();
            return Err(ExcType::type_error(format!(
                "Cannot create a consistent method resolution order (MRO) for bases {}",
                base_names.join(", ")
            )));
        };

        result.push(next);
        for lin in &mut linearizations {
            if !lin.is_empty() && lin[0] == next {
                lin.remove(0);
            }
        }
        if result.len() > MAX_MRO_LENGTH {
            return Err(ExcType::type_error("MRO exceeds maximum length"));
        }
    }

    // Base MROs all end with `object`, so the merge emits it last; classes
    // synthesized for builtin exception bases are the one path that can
    // leave it out.
    if !result.contains(&object_id) {
        result.push(object_id);
    }
    Ok(result)
}
