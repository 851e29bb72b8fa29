//! Boundary values exchanged with embedders.
//!
//! `Object` mirrors the value universe without heap handles: containers
//! carry their contents by value, and shapes the boundary cannot express
//! degrade to their repr text. Conversions are deep copies — boundary
//! values never alias engine state.

use crate::{
    except::RunResult,
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::{Dict, List, Set, SetStorage, Tuple},
    value::{Value, py_hash, py_repr},
};

/// A self-contained runtime value at the embedder boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    Set(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    /// Anything without a boundary shape, rendered as its repr.
    Repr(String),
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{}", crate::types::str::format_float(*v)),
            Self::Complex { real, imag } => {
                write!(f, "{}", crate::types::Complex::new(*real, *imag).repr())
            }
            Self::Str(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "{}", crate::types::Bytes::from(b.as_slice()).repr()),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Self::Set(items) => {
                if items.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Self::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Repr(text) => write!(f, "{text}"),
        }
    }
}

impl TryFrom<&Object> for i64 {
    type Error = ();

    fn try_from(value: &Object) -> Result<Self, ()> {
        match value {
            Object::Int(v) => Ok(*v),
            Object::Bool(b) => Ok(i64::from(*b)),
            _ => Err(()),
        }
    }
}

impl TryFrom<&Object> for String {
    type Error = ();

    fn try_from(value: &Object) -> Result<Self, ()> {
        match value {
            Object::Str(s) => Ok(s.clone()),
            _ => Err(()),
        }
    }
}

/// Deep-copies an engine value into a boundary object.
#[must_use]
pub(crate) fn value_to_object(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Object {
    match value {
        Value::Undefined | Value::None => Object::None,
        Value::Ellipsis => Object::Repr("Ellipsis".to_owned()),
        Value::NotImplemented => Object::Repr("NotImplemented".to_owned()),
        Value::Bool(b) => Object::Bool(*b),
        Value::Int(i) => Object::Int(*i),
        Value::Float(f) => Object::Float(*f),
        Value::InternString(id) => Object::Str(interns.get_str(*id).to_owned()),
        Value::Builtin(_) => Object::Repr(py_repr(value, heap, interns)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Object::Str(s.as_str().to_owned()),
            HeapData::Bytes(b) => Object::Bytes(b.as_slice().to_vec()),
            HeapData::Complex(c) => Object::Complex {
                real: c.real,
                imag: c.imag,
            },
            HeapData::List(l) => Object::List(l.items().iter().map(|v| value_to_object(v, heap, interns)).collect()),
            HeapData::Tuple(t) => Object::Tuple(t.items().iter().map(|v| value_to_object(v, heap, interns)).collect()),
            HeapData::Set(s) => Object::Set(s.0.iter().map(|v| value_to_object(v, heap, interns)).collect()),
            HeapData::FrozenSet(s) => Object::Set(s.iter().map(|v| value_to_object(v, heap, interns)).collect()),
            HeapData::Dict(d) => Object::Dict(
                d.iter()
                    .map(|(k, v)| (value_to_object(k, heap, interns), value_to_object(v, heap, interns)))
                    .collect(),
            ),
            _ => Object::Repr(py_repr(value, heap, interns)),
        },
    }
}

/// Materializes a boundary object as an engine value.
pub(crate) fn object_to_value(
    object: &Object,
    heap: &mut Heap<impl ResourceTracker>,
    interns: &Interns,
) -> RunResult<Value> {
    Ok(match object {
        Object::None => Value::None,
        Object::Bool(b) => Value::Bool(*b),
        Object::Int(i) => Value::Int(*i),
        Object::Float(f) => Value::Float(*f),
        Object::Complex { real, imag } => {
            let id = heap.allocate(HeapData::Complex(crate::types::Complex::new(*real, *imag)))?;
            Value::Ref(id)
        }
        Object::Str(s) => {
            let id = heap.allocate(HeapData::Str(crate::types::Str::from(s.as_str())))?;
            Value::Ref(id)
        }
        Object::Bytes(b) => {
            let id = heap.allocate(HeapData::Bytes(crate::types::Bytes::from(b.as_slice())))?;
            Value::Ref(id)
        }
        Object::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(object_to_value(item, heap, interns)?);
            }
            let id = heap.allocate(HeapData::List(List::from(values)))?;
            Value::Ref(id)
        }
        Object::Tuple(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(object_to_value(item, heap, interns)?);
            }
            let id = heap.allocate(HeapData::Tuple(Tuple::from(values)))?;
            Value::Ref(id)
        }
        Object::Set(items) => {
            let mut storage = SetStorage::new();
            for item in items {
                let value = object_to_value(item, heap, interns)?;
                let hash = py_hash(&value, heap, interns)?;
                if storage.contains(hash, |existing| {
                    crate::value::values_equal(existing, &value, heap, interns)
                }) {
                    value.drop_with_heap(heap);
                } else {
                    let duplicate = storage.add(value, hash, |_| false);
                    debug_assert!(duplicate.is_none());
                }
            }
            let id = heap.allocate(HeapData::Set(Set(storage)))?;
            Value::Ref(id)
        }
        Object::Dict(entries) => {
            let mut dict = Dict::with_capacity(entries.len());
            for (key, value) in entries {
                let key = object_to_value(key, heap, interns)?;
                let value = object_to_value(value, heap, interns)?;
                let hash = py_hash(&key, heap, interns)?;
                let existing = dict.get_mut(hash, |k| crate::value::values_equal(k, &key, heap, interns));
                if let Some(slot) = existing {
                    let old = std::mem::replace(slot, value);
                    old.drop_with_heap(heap);
                    key.drop_with_heap(heap);
                } else {
                    let replaced = dict.insert(key, hash, value, |_| false);
                    debug_assert!(replaced.is_none());
                }
            }
            let id = heap.allocate(HeapData::Dict(dict))?;
            Value::Ref(id)
        }
        Object::Repr(text) => {
            let id = heap.allocate(HeapData::Str(crate::types::Str::from(text.as_str())))?;
            Value::Ref(id)
        }
    })
}
