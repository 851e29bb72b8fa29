//! The runtime value universe.
//!
//! `Value` is a small tagged enum: immediates (none, bools, 64-bit ints,
//! floats, interned strings, builtin callables) are stored inline, and
//! everything structured lives in the arena behind `Value::Ref`.
//!
//! `Clone` is intentionally not derived: heap refs are reference-counted,
//! so copies go through [`Value::clone_with_heap`] and disposal through
//! [`Value::drop_with_heap`]. A plain move transfers ownership of the
//! count.
//!
//! Equality, ordering, hashing, truth, and repr live here as free
//! functions over `(&Value, &Heap)`. Container equality and repr are
//! cycle-tolerant: a revisited pair of containers compares equal, and a
//! revisited container renders as `[...]`/`{...}`. User-defined dunder
//! overrides are layered on by the VM; the functions here implement the
//! builtin shapes and default to identity for instances.

use std::{cmp::Ordering, fmt::Write as _};

use crate::{
    builtins::Builtins,
    except::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    py_hash::{TupleHasher, hash_bytes, hash_complex, hash_float, hash_frozenset, hash_int, hash_str},
    resource::{MAX_DATA_RECURSION_DEPTH, ResourceTracker},
    types::{Type, str::format_float, str::repr_string},
};

/// Smallest interned int; `a is b` holds for equal ints in this range.
pub const SMALL_INT_MIN: i64 = -5;
/// Largest interned int.
pub const SMALL_INT_MAX: i64 = 256;

/// A runtime value.
#[derive(Debug)]
pub enum Value {
    /// Unset local slot / freshly deleted binding. Never observable from
    /// interpreted code.
    Undefined,
    None,
    Ellipsis,
    /// Returned by binary dunders to signal "try the reflected form".
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// An interned string; content lives in the interner.
    InternString(StringId),
    /// A builtin callable, type constructor, or exception class.
    Builtin(Builtins),
    /// Everything heap-allocated.
    Ref(HeapId),
}

impl Value {
    /// The shape discriminator.
    #[must_use]
    pub fn py_type(&self, heap: &Heap<impl ResourceTracker>) -> Type {
        match self {
            Self::Undefined => panic!("cannot take the type of an unset slot"),
            Self::None => Type::NoneType,
            Self::Ellipsis => Type::Ellipsis,
            Self::NotImplemented => Type::NotImplementedType,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::InternString(_) => Type::Str,
            Self::Builtin(b) => b.py_type(),
            Self::Ref(id) => heap.get(*id).py_type(),
        }
    }

    /// Display name for error messages; instances report their class.
    #[must_use]
    pub fn type_name(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
        if let Self::Ref(id) = self {
            match heap.get(*id) {
                HeapData::Instance(inst) => {
                    if let HeapData::Class(cls) = heap.get(inst.class_id) {
                        return interns.get_str(cls.name).to_owned();
                    }
                }
                HeapData::Exception(exc) => return exc.class_name().to_owned(),
                _ => {}
            }
        }
        self.py_type(heap).to_string()
    }


    /// Copies the value, bumping the refcount of heap refs.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        if let Self::Ref(id) = self {
            heap.inc_ref(*id);
        }
        self.clone_shallow()
    }

    /// Clones the enum payload without touching refcounts.
    ///
    /// Only correct when the caller separately accounts for the reference
    /// (e.g. immediately after `inc_ref`, or for immediates).
    #[must_use]
    fn clone_shallow(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::None => Self::None,
            Self::Ellipsis => Self::Ellipsis,
            Self::NotImplemented => Self::NotImplemented,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::InternString(id) => Self::InternString(*id),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::Ref(id) => Self::Ref(*id),
        }
    }

    /// Releases the value, decrementing the refcount of heap refs.
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// Identity (`is`).
    ///
    /// Heap values compare by slot; immediates by value, except that ints
    /// outside the interned range `[-5, 256]` are never identical (they
    /// model separately materialized boxes).
    #[must_use]
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) | (Self::NotImplemented, Self::NotImplemented) => {
                true
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b && (SMALL_INT_MIN..=SMALL_INT_MAX).contains(a),
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::InternString(a), Self::InternString(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Extracts an `i64` if the value is integral (bool counts).
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extracts an `f64` from any real numeric value.
    #[must_use]
    pub fn as_float(&self, heap: &Heap<impl ResourceTracker>) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Ref(_) => None,
            _ => {
                let _ = heap;
                None
            }
        }
    }

    /// Resolves string content from either representation.
    #[must_use]
    pub fn as_str<'a>(&'a self, heap: &'a Heap<impl ResourceTracker>, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::InternString(id) => Some(interns.get_str(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------
// Truth
// ----------------------------------------------------------------------

/// Builtin truthiness. Instances default to true; the VM intercepts
/// `__bool__`/`__len__` before reaching here.
#[must_use]
pub fn py_truth(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
    match value {
        Value::Undefined | Value::None => false,
        Value::Ellipsis | Value::NotImplemented | Value::Builtin(_) => true,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::InternString(id) => !interns.get_str(*id).is_empty(),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => !s.is_empty(),
            HeapData::Bytes(b) => !b.is_empty(),
            HeapData::Tuple(t) => !t.is_empty(),
            HeapData::List(l) => !l.is_empty(),
            HeapData::Dict(d) => !d.is_empty(),
            HeapData::Set(s) => !s.0.is_empty(),
            HeapData::FrozenSet(s) => !s.is_empty(),
            HeapData::Range(r) => !r.is_empty(),
            HeapData::Complex(c) => c.real != 0.0 || c.imag != 0.0,
            _ => true,
        },
    }
}

/// Builtin length (`len()` shapes only).
#[must_use]
pub fn py_len(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<usize> {
    match value {
        Value::InternString(id) => Some(interns.get_str(*id).chars().count()),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Some(s.char_len()),
            HeapData::Bytes(b) => Some(b.len()),
            HeapData::Tuple(t) => Some(t.len()),
            HeapData::List(l) => Some(l.len()),
            HeapData::Dict(d) => Some(d.len()),
            HeapData::Set(s) => Some(s.0.len()),
            HeapData::FrozenSet(s) => Some(s.len()),
            HeapData::Range(r) => Some(r.len()),
            _ => None,
        },
        _ => None,
    }
}

// ----------------------------------------------------------------------
// Equality
// ----------------------------------------------------------------------

/// Structural equality with cycle tolerance.
#[must_use]
pub fn values_equal(a: &Value, b: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
    let mut visited = Vec::new();
    eq_inner(a, b, heap, interns, &mut visited, MAX_DATA_RECURSION_DEPTH)
}

fn eq_inner(
    a: &Value,
    b: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    visited: &mut Vec<(HeapId, HeapId)>,
    depth: u16,
) -> bool {
    if depth == 0 {
        // Equality deeper than the data recursion cap degenerates to
        // identity rather than overflowing the host stack.
        return a.is_identical(b);
    }
    // Identical heap slots are equal without looking inside.
    if let (Value::Ref(ia), Value::Ref(ib)) = (a, b)
        && ia == ib
    {
        return true;
    }

    // Integral values compare exactly, floats by widening.
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (numeric_scalar(a, heap), numeric_scalar(b, heap)) {
        return x == y;
    }
    if let Some((ar, ai)) = complex_parts(a, heap) {
        if let Some((br, bi)) = complex_parts(b, heap) {
            return ar == br && ai == bi;
        }
        if let Some(s) = numeric_scalar(b, heap) {
            return ar == s && ai == 0.0;
        }
        return false;
    }
    if let Some((br, bi)) = complex_parts(b, heap) {
        if let Some(s) = numeric_scalar(a, heap) {
            return br == s && bi == 0.0;
        }
        return false;
    }

    // Strings compare by content regardless of interning.
    if let (Some(sa), Some(sb)) = (a.as_str(heap, interns), b.as_str(heap, interns)) {
        return sa == sb;
    }

    match (a, b) {
        (Value::None, Value::None)
        | (Value::Ellipsis, Value::Ellipsis)
        | (Value::NotImplemented, Value::NotImplemented) => true,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Ref(ia), Value::Ref(ib)) => {
            let pair = (*ia, *ib);
            // A revisited pair of containers is treated as equal: the
            // comparison is already in progress higher in the stack.
            if visited.contains(&pair) {
                return true;
            }
            visited.push(pair);
            let result = eq_heap(*ia, *ib, heap, interns, visited, depth - 1);
            visited.pop();
            result
        }
        _ => false,
    }
}

fn eq_heap(
    ia: HeapId,
    ib: HeapId,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    visited: &mut Vec<(HeapId, HeapId)>,
    depth: u16,
) -> bool {
    match (heap.get(ia), heap.get(ib)) {
        (HeapData::Bytes(x), HeapData::Bytes(y)) => x == y,
        (HeapData::Range(x), HeapData::Range(y)) => {
            // Ranges compare by the sequence they denote.
            x.len() == y.len() && (x.is_empty() || (x.start == y.start && (x.len() == 1 || x.step == y.step)))
        }
        (HeapData::List(x), HeapData::List(y)) => {
            eq_sequences(x.items(), y.items(), heap, interns, visited, depth)
        }
        (HeapData::Tuple(x), HeapData::Tuple(y)) => {
            eq_sequences(x.items(), y.items(), heap, interns, visited, depth)
        }
        (HeapData::Dict(x), HeapData::Dict(y)) => {
            if x.len() != y.len() {
                return false;
            }
            // Linear scan keeps the comparison cycle-safe without needing
            // mutable heap access for hash lookups.
            x.iter().all(|(key, value)| {
                y.iter().any(|(other_key, other_value)| {
                    eq_inner(key, other_key, heap, interns, visited, depth)
                        && eq_inner(value, other_value, heap, interns, visited, depth)
                })
            })
        }
        (HeapData::Set(x), HeapData::Set(y)) => eq_members(x.0.iter(), y.0.iter(), x.0.len(), y.0.len(), heap, interns, visited, depth),
        (HeapData::FrozenSet(x), HeapData::FrozenSet(y)) => {
            eq_members(x.iter(), y.iter(), x.len(), y.len(), heap, interns, visited, depth)
        }
        (HeapData::Set(x), HeapData::FrozenSet(y)) => {
            eq_members(x.0.iter(), y.iter(), x.0.len(), y.len(), heap, interns, visited, depth)
        }
        (HeapData::FrozenSet(x), HeapData::Set(y)) => {
            eq_members(x.iter(), y.0.iter(), x.len(), y.0.len(), heap, interns, visited, depth)
        }
        (HeapData::Exception(x), HeapData::Exception(y)) => x == y,
        // Classes, instances, functions, modules: identity (already
        // unequal here since the ids differ).
        _ => false,
    }
}

fn eq_sequences(
    xs: &[Value],
    ys: &[Value],
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    visited: &mut Vec<(HeapId, HeapId)>,
    depth: u16,
) -> bool {
    xs.len() == ys.len()
        && xs
            .iter()
            .zip(ys.iter())
            .all(|(x, y)| eq_inner(x, y, heap, interns, visited, depth))
}

#[expect(clippy::too_many_arguments, reason = "internal equality plumbing")]
fn eq_members<'v>(
    xs: impl Iterator<Item = &'v Value> + Clone,
    ys: impl Iterator<Item = &'v Value> + Clone,
    x_len: usize,
    y_len: usize,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    visited: &mut Vec<(HeapId, HeapId)>,
    depth: u16,
) -> bool {
    if x_len != y_len {
        return false;
    }
    xs.clone()
        .all(|x| ys.clone().any(|y| eq_inner(x, y, heap, interns, visited, depth)))
}

fn numeric_scalar(value: &Value, heap: &Heap<impl ResourceTracker>) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => {
            let _ = heap;
            None
        }
    }
}

fn complex_parts(value: &Value, heap: &Heap<impl ResourceTracker>) -> Option<(f64, f64)> {
    if let Value::Ref(id) = value
        && let HeapData::Complex(c) = heap.get(*id)
    {
        return Some((c.real, c.imag));
    }
    None
}

// ----------------------------------------------------------------------
// Ordering
// ----------------------------------------------------------------------

/// Builtin ordering for `<`/`<=`/`>`/`>=`.
///
/// Numbers order across widths; str, bytes, list, and tuple order
/// lexicographically. Anything else is a TypeError naming both operands.
pub fn py_cmp(
    a: &Value,
    b: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
) -> RunResult<Ordering> {
    if let (Some(x), Some(y)) = (numeric_scalar(a, heap), numeric_scalar(b, heap)) {
        return x.partial_cmp(&y).ok_or_else(|| {
            ExcType::type_error("comparison with NaN has no defined order")
        });
    }
    if let (Some(x), Some(y)) = (a.as_str(heap, interns), b.as_str(heap, interns)) {
        return Ok(x.cmp(y));
    }
    if let (Value::Ref(ia), Value::Ref(ib)) = (a, b) {
        match (heap.get(*ia), heap.get(*ib)) {
            (HeapData::Bytes(x), HeapData::Bytes(y)) => return Ok(x.as_slice().cmp(y.as_slice())),
            (HeapData::List(x), HeapData::List(y)) => {
                return cmp_sequences(x.items(), y.items(), heap, interns);
            }
            (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                return cmp_sequences(x.items(), y.items(), heap, interns);
            }
            _ => {}
        }
    }
    Err(ExcType::type_error(format!(
        "'<' not supported between instances of '{}' and '{}'",
        a.type_name(heap, interns),
        b.type_name(heap, interns)
    )))
}

fn cmp_sequences(
    xs: &[Value],
    ys: &[Value],
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
) -> RunResult<Ordering> {
    for (x, y) in xs.iter().zip(ys.iter()) {
        if !values_equal(x, y, heap, interns) {
            return py_cmp(x, y, heap, interns);
        }
    }
    Ok(xs.len().cmp(&ys.len()))
}

// ----------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------

/// Builtin hashing; unhashable shapes raise TypeError.
///
/// Hashes agree across numeric widenings, and instances (without a
/// user `__hash__`, which the VM layers on) hash by identity.
pub fn py_hash(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> RunResult<u64> {
    hash_inner(value, heap, interns, MAX_DATA_RECURSION_DEPTH)
}

fn hash_inner(
    value: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    depth: u16,
) -> RunResult<u64> {
    if depth == 0 {
        return Err(ExcType::value_error("maximum data depth exceeded while hashing"));
    }
    match value {
        Value::Undefined => Err(crate::except::RunError::internal("operation on unset value slot")),
        Value::None => Ok(hash_int(0x6e6f_6e65)),
        Value::Ellipsis => Ok(hash_int(0x656c_6c69)),
        Value::NotImplemented => Ok(hash_int(0x6e6f_7469)),
        Value::Bool(b) => Ok(hash_int(i64::from(*b))),
        Value::Int(i) => Ok(hash_int(*i)),
        Value::Float(f) => Ok(hash_float(*f)),
        Value::InternString(id) => Ok(hash_str(interns.get_str(*id))),
        Value::Builtin(b) => Ok(hash_int(b.stable_tag())),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Ok(hash_str(s.as_str())),
            HeapData::Bytes(b) => Ok(hash_bytes(b.as_slice())),
            HeapData::Complex(c) => Ok(hash_complex(c.real, c.imag)),
            HeapData::Range(r) => {
                let mut hasher = TupleHasher::new();
                hasher.write(hash_int(r.start));
                hasher.write(hash_int(r.stop));
                hasher.write(hash_int(r.step));
                Ok(hasher.finish())
            }
            HeapData::Tuple(t) => {
                let mut hasher = TupleHasher::new();
                for item in t.items() {
                    hasher.write(hash_inner(item, heap, interns, depth - 1)?);
                }
                Ok(hasher.finish())
            }
            HeapData::FrozenSet(s) => {
                let mut member_hashes = Vec::with_capacity(s.len());
                for (_, h) in s.iter_with_hash() {
                    member_hashes.push(h);
                }
                Ok(hash_frozenset(member_hashes.into_iter()))
            }
            HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_) | HeapData::Slice(_) | HeapData::Iter(_) => {
                Err(ExcType::unhashable(value.py_type(heap)))
            }
            // Everything else hashes by identity.
            _ => Ok(hash_int(heap.object_id(*id))),
        },
    }
}


// ----------------------------------------------------------------------
// Repr / str
// ----------------------------------------------------------------------

/// Builtin `repr()` rendering, cycle-safe.
#[must_use]
pub fn py_repr(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
    let mut out = String::new();
    let mut visited = Vec::new();
    repr_inner(value, heap, interns, &mut out, &mut visited, MAX_DATA_RECURSION_DEPTH);
    out
}

/// Builtin `str()` rendering: strings render raw, exceptions render their
/// message, everything else falls back to `repr`.
#[must_use]
pub fn py_str(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
    if let Some(s) = value.as_str(heap, interns) {
        return s.to_owned();
    }
    if let Value::Ref(id) = value
        && let HeapData::Exception(exc) = heap.get(*id)
    {
        return exc.message.clone().unwrap_or_default();
    }
    py_repr(value, heap, interns)
}

fn repr_inner(
    value: &Value,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    out: &mut String,
    visited: &mut Vec<HeapId>,
    depth: u16,
) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match value {
        Value::Undefined => out.push_str("<unset>"),
        Value::None => out.push_str("None"),
        Value::Ellipsis => out.push_str("Ellipsis"),
        Value::NotImplemented => out.push_str("NotImplemented"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::InternString(id) => out.push_str(&repr_string(interns.get_str(*id))),
        Value::Builtin(b) => b.repr_into(out),
        Value::Ref(id) => repr_heap(*id, heap, interns, out, visited, depth),
    }
}

fn repr_heap(
    id: HeapId,
    heap: &Heap<impl ResourceTracker>,
    interns: &Interns,
    out: &mut String,
    visited: &mut Vec<HeapId>,
    depth: u16,
) {
    match heap.get(id) {
        HeapData::Str(s) => out.push_str(&repr_string(s.as_str())),
        HeapData::Bytes(b) => out.push_str(&b.repr()),
        HeapData::Complex(c) => out.push_str(&c.repr()),
        HeapData::Range(r) => out.push_str(&r.repr()),
        HeapData::Tuple(t) => {
            if visited.contains(&id) {
                out.push_str("(...)");
                return;
            }
            visited.push(id);
            out.push('(');
            for (i, item) in t.items().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                repr_inner(item, heap, interns, out, visited, depth - 1);
            }
            if t.len() == 1 {
                out.push(',');
            }
            out.push(')');
            visited.pop();
        }
        HeapData::List(l) => {
            if visited.contains(&id) {
                out.push_str("[...]");
                return;
            }
            visited.push(id);
            out.push('[');
            for (i, item) in l.items().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                repr_inner(item, heap, interns, out, visited, depth - 1);
            }
            out.push(']');
            visited.pop();
        }
        HeapData::Dict(d) => {
            if visited.contains(&id) {
                out.push_str("{...}");
                return;
            }
            if d.is_empty() {
                out.push_str("{}");
                return;
            }
            visited.push(id);
            out.push('{');
            for (i, (key, value)) in d.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                repr_inner(key, heap, interns, out, visited, depth - 1);
                out.push_str(": ");
                repr_inner(value, heap, interns, out, visited, depth - 1);
            }
            out.push('}');
            visited.pop();
        }
        HeapData::Set(s) => {
            if s.0.is_empty() {
                out.push_str("set()");
                return;
            }
            if visited.contains(&id) {
                out.push_str("{...}");
                return;
            }
            visited.push(id);
            out.push('{');
            for (i, item) in s.0.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                repr_inner(item, heap, interns, out, visited, depth - 1);
            }
            out.push('}');
            visited.pop();
        }
        HeapData::FrozenSet(s) => {
            if visited.contains(&id) {
                out.push_str("frozenset(...)");
                return;
            }
            visited.push(id);
            out.push_str("frozenset(");
            if !s.is_empty() {
                out.push('{');
                for (i, item) in s.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    repr_inner(item, heap, interns, out, visited, depth - 1);
                }
                out.push('}');
            }
            out.push(')');
            visited.pop();
        }
        HeapData::Slice(s) => {
            out.push_str("slice(");
            repr_inner(&s.start, heap, interns, out, visited, depth - 1);
            out.push_str(", ");
            repr_inner(&s.stop, heap, interns, out, visited, depth - 1);
            out.push_str(", ");
            repr_inner(&s.step, heap, interns, out, visited, depth - 1);
            out.push(')');
        }
        HeapData::Iter(_) => {
            let _ = write!(out, "<iterator at {:#x}>", heap.object_id(id));
        }
        HeapData::Cell(_) => {
            let _ = write!(out, "<cell at {:#x}>", heap.object_id(id));
        }
        HeapData::Function(f) => {
            let _ = write!(out, "<function {}>", interns.get_str(f.name));
        }
        HeapData::BoundMethod(m) => {
            out.push_str("<bound method ");
            repr_inner(&m.func, heap, interns, out, visited, depth - 1);
            out.push('>');
        }
        HeapData::Property(_) => out.push_str("<property object>"),
        HeapData::ClassMethod(_) => out.push_str("<classmethod object>"),
        HeapData::StaticMethod(_) => out.push_str("<staticmethod object>"),
        HeapData::Class(c) => {
            let _ = write!(out, "<class '{}'>", interns.get_str(c.name));
        }
        HeapData::Instance(inst) => {
            let class_name = match heap.get(inst.class_id) {
                HeapData::Class(c) => interns.get_str(c.name),
                _ => "?",
            };
            let _ = write!(out, "<{class_name} object at {:#x}>", heap.object_id(id));
        }
        HeapData::Super(s) => {
            let class_name = match heap.get(s.start_class) {
                HeapData::Class(c) => interns.get_str(c.name),
                _ => "?",
            };
            let _ = write!(out, "<super: '{class_name}'>");
        }
        HeapData::Generator(g) => {
            let kind = match g.kind {
                crate::types::GenKind::Generator => "generator",
                crate::types::GenKind::Coroutine => "coroutine",
            };
            let _ = write!(out, "<{kind} object {} at {:#x}>", interns.get_str(g.name), heap.object_id(id));
        }
        HeapData::Exception(exc) => {
            let _ = write!(out, "{}({})", exc.class_name(), exc.args.iter().map(|a| match a {
                crate::except::ExcPayload::Str(s) => repr_string(s),
                other => other.to_string(),
            }).collect::<Vec<_>>().join(", "));
        }
        HeapData::Module(m) => {
            let _ = write!(out, "<module '{}'>", interns.get_str(m.name));
        }
        HeapData::UserData(u) => {
            let _ = write!(out, "<{} userdata at {:#x}>", u.data.type_name(), heap.object_id(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::NoLimitTracker, types::List};

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    #[test]
    fn small_int_identity() {
        assert!(Value::Int(5).is_identical(&Value::Int(5)));
        assert!(!Value::Int(1000).is_identical(&Value::Int(1000)));
        let heap = heap();
        let interns = Interns::new();
        assert!(values_equal(&Value::Int(1000), &Value::Int(1000), &heap, &interns));
    }

    #[test]
    fn numeric_equality_crosses_types() {
        let heap = heap();
        let interns = Interns::new();
        assert!(values_equal(&Value::Bool(true), &Value::Int(1), &heap, &interns));
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0), &heap, &interns));
        assert!(!values_equal(&Value::Int(2), &Value::Float(2.5), &heap, &interns));
    }

    #[test]
    fn hash_agrees_across_numeric_widths() {
        let heap = heap();
        let interns = Interns::new();
        let h_true = py_hash(&Value::Bool(true), &heap, &interns).unwrap();
        let h_one = py_hash(&Value::Int(1), &heap, &interns).unwrap();
        let h_onef = py_hash(&Value::Float(1.0), &heap, &interns).unwrap();
        assert_eq!(h_true, h_one);
        assert_eq!(h_one, h_onef);
    }

    #[test]
    fn list_is_unhashable() {
        let mut heap = heap();
        let interns = Interns::new();
        let id = heap.allocate(HeapData::List(List::new())).unwrap();
        assert!(py_hash(&Value::Ref(id), &heap, &interns).is_err());
    }

    #[test]
    fn cyclic_lists_compare_equal() {
        let mut heap = heap();
        let interns = Interns::new();
        let a = heap.allocate(HeapData::List(List::new())).unwrap();
        let b = heap.allocate(HeapData::List(List::new())).unwrap();
        heap.inc_ref(a);
        heap.inc_ref(b);
        if let HeapData::List(list) = heap.get_mut(a) {
            list.push(Value::Ref(a));
        }
        if let HeapData::List(list) = heap.get_mut(b) {
            list.push(Value::Ref(b));
        }
        assert!(values_equal(&Value::Ref(a), &Value::Ref(b), &heap, &interns));
    }

    #[test]
    fn cyclic_repr_terminates() {
        let mut heap = heap();
        let interns = Interns::new();
        let a = heap.allocate(HeapData::List(List::new())).unwrap();
        heap.inc_ref(a);
        if let HeapData::List(list) = heap.get_mut(a) {
            list.push(Value::Ref(a));
        }
        assert_eq!(py_repr(&Value::Ref(a), &heap, &interns), "[[...]]");
    }

    #[test]
    fn sequence_ordering_is_lexicographic() {
        let mut heap = heap();
        let interns = Interns::new();
        let a = heap
            .allocate(HeapData::List(List::from(vec![Value::Int(1), Value::Int(2)])))
            .unwrap();
        let b = heap
            .allocate(HeapData::List(List::from(vec![Value::Int(1), Value::Int(3)])))
            .unwrap();
        assert_eq!(
            py_cmp(&Value::Ref(a), &Value::Ref(b), &heap, &interns).unwrap(),
            Ordering::Less
        );
    }
}
