//! Comparison, identity, and membership.

use std::cmp::Ordering;

use crate::{
    args::ArgValues,
    bytecode::Opcode,
    except::{ExcType, RunResult},
    heap::HeapData,
    intern::StaticStrings,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{Value, py_cmp, py_hash, values_equal},
};

use super::Vm;

/// Ordering comparison selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn dunder(self) -> StaticStrings {
        match self {
            Self::Lt => StaticStrings::DunderLt,
            Self::Le => StaticStrings::DunderLe,
            Self::Gt => StaticStrings::DunderGt,
            Self::Ge => StaticStrings::DunderGe,
        }
    }

    fn matches(self, ordering: Ordering) -> bool {
        match self {
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// `==` / `!=` with `__eq__` support.
    pub(super) fn op_compare_eq(&mut self, negate: bool) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        let equal = self.values_equal_dunder(&lhs, &rhs)?;
        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);
        self.push(Value::Bool(equal != negate));
        Ok(())
    }

    /// Equality that consults `__eq__`/`__ne__` on instances, falling back
    /// to the builtin structural rules (identity for plain instances).
    pub(crate) fn values_equal_dunder(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        for (receiver, other) in [(lhs, rhs), (rhs, lhs)] {
            if let Value::Ref(id) = receiver
                && matches!(self.heap.get(*id), HeapData::Instance(_))
            {
                let arg = other.clone_with_heap(self.heap);
                if let Some(result) = self.call_dunder(receiver, StaticStrings::DunderEq.into(), ArgValues::One(arg))? {
                    match result {
                        Value::NotImplemented => {}
                        other_result => {
                            let truth = self.value_truth(&other_result)?;
                            other_result.drop_with_heap(self.heap);
                            return Ok(truth);
                        }
                    }
                }
            }
        }
        Ok(values_equal(lhs, rhs, self.heap, self.interns))
    }

    /// Dunder-aware hash, used wherever values become dict/set keys.
    pub(crate) fn value_hash(&mut self, value: &Value) -> RunResult<u64> {
        if let Value::Ref(id) = value
            && matches!(self.heap.get(*id), HeapData::Instance(_))
        {
            if let Some(result) = self.call_dunder(value, StaticStrings::DunderHash.into(), ArgValues::Empty)? {
                return match result.as_int() {
                    Some(hash) => Ok(crate::py_hash::hash_int(hash)),
                    None => {
                        let type_name = result.type_name(self.heap, self.interns);
                        result.drop_with_heap(self.heap);
                        Err(ExcType::type_error(format!("__hash__ method should return an integer, not {type_name}")))
                    }
                };
            }
        }
        py_hash(value, self.heap, self.interns)
    }

    /// `<` / `<=` / `>` / `>=` with ordering dunders.
    pub(super) fn op_compare_ord(&mut self, op: CmpOp) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        if let Value::Ref(id) = &lhs
            && matches!(self.heap.get(*id), HeapData::Instance(_))
        {
            let arg = rhs.clone_with_heap(self.heap);
            if let Some(result) = self.call_dunder(&lhs, op.dunder().into(), ArgValues::One(arg))? {
                if !matches!(result, Value::NotImplemented) {
                    lhs.drop_with_heap(self.heap);
                    rhs.drop_with_heap(self.heap);
                    let truth = self.value_truth(&result)?;
                    result.drop_with_heap(self.heap);
                    self.push(Value::Bool(truth));
                    return Ok(());
                }
                result.drop_with_heap(self.heap);
            }
        }
        let ordering = py_cmp(&lhs, &rhs, self.heap, self.interns);
        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);
        self.push(Value::Bool(op.matches(ordering?)));
        Ok(())
    }

    /// Specialized `<`-family arm for int/int.
    pub(super) fn op_compare_int_fast(&mut self, op: CmpOp) -> RunResult<()> {
        if let (Value::Int(a), Value::Int(b)) = (self.peek_at(1), self.peek_at(0)) {
            let result = op.matches(a.cmp(b));
            self.drop_top(2);
            self.push(Value::Bool(result));
            return Ok(());
        }
        self.op_compare_ord(op)
    }

    /// Specialized `==`/`!=` arm for int/int.
    pub(super) fn op_compare_eq_int_fast(&mut self, negate: bool) -> RunResult<()> {
        if let (Value::Int(a), Value::Int(b)) = (self.peek_at(1), self.peek_at(0)) {
            let result = (a == b) != negate;
            self.drop_top(2);
            self.push(Value::Bool(result));
            return Ok(());
        }
        self.op_compare_eq(negate)
    }

    /// Value half of the fused compare-and-jump arms.
    ///
    /// On int/int the comparison runs inline; otherwise the generic
    /// comparison produces the bool that decides the jump.
    pub(super) fn fused_compare_value(&mut self, opcode: Opcode) -> RunResult<bool> {
        if let (Value::Int(a), Value::Int(b)) = (self.peek_at(1), self.peek_at(0)) {
            let ordering = a.cmp(b);
            let result = match opcode {
                Opcode::LtIntJumpIfFalse => ordering == Ordering::Less,
                Opcode::LeIntJumpIfFalse => ordering != Ordering::Greater,
                Opcode::GtIntJumpIfFalse => ordering == Ordering::Greater,
                Opcode::GeIntJumpIfFalse => ordering != Ordering::Less,
                Opcode::EqIntJumpIfFalse => ordering == Ordering::Equal,
                Opcode::NeIntJumpIfFalse => ordering != Ordering::Equal,
                _ => unreachable!("fused_compare_value on non-fused opcode"),
            };
            self.drop_top(2);
            return Ok(result);
        }
        match opcode {
            Opcode::LtIntJumpIfFalse => self.op_compare_ord(CmpOp::Lt)?,
            Opcode::LeIntJumpIfFalse => self.op_compare_ord(CmpOp::Le)?,
            Opcode::GtIntJumpIfFalse => self.op_compare_ord(CmpOp::Gt)?,
            Opcode::GeIntJumpIfFalse => self.op_compare_ord(CmpOp::Ge)?,
            Opcode::EqIntJumpIfFalse => self.op_compare_eq(false)?,
            Opcode::NeIntJumpIfFalse => self.op_compare_eq(true)?,
            _ => unreachable!("fused_compare_value on non-fused opcode"),
        }
        let result = self.pop();
        let truth = matches!(result, Value::Bool(true));
        result.drop_with_heap(self.heap);
        Ok(truth)
    }

    /// `is` / `is not`.
    pub(super) fn op_compare_is(&mut self, negate: bool) {
        let rhs = self.pop();
        let lhs = self.pop();
        let identical = lhs.is_identical(&rhs);
        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);
        self.push(Value::Bool(identical != negate));
    }

    /// `in` / `not in`: substring on str, hashed lookup on dict/set,
    /// equality scan on sequences, `__contains__` then iteration on
    /// instances.
    pub(super) fn op_compare_in(&mut self, negate: bool) -> RunResult<()> {
        let container = self.pop();
        let needle = self.pop();
        let contains = self.value_contains(&container, &needle)?;
        needle.drop_with_heap(self.heap);
        container.drop_with_heap(self.heap);
        self.push(Value::Bool(contains != negate));
        Ok(())
    }

    pub(crate) fn value_contains(&mut self, container: &Value, needle: &Value) -> RunResult<bool> {
        // Substring search.
        if let Some(haystack) = container.as_str(self.heap, self.interns) {
            let Some(sub) = needle.as_str(self.heap, self.interns) else {
                return Err(ExcType::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    needle.type_name(self.heap, self.interns)
                )));
            };
            return Ok(haystack.contains(sub));
        }

        if let Value::Ref(id) = container {
            match self.heap.get(*id) {
                HeapData::Bytes(bytes) => {
                    if let Some(byte) = needle.as_int() {
                        let byte = u8::try_from(byte)
                            .map_err(|_| ExcType::value_error("byte must be in range(0, 256)"))?;
                        return Ok(bytes.contains_bytes(&[byte]));
                    }
                    if let Value::Ref(nid) = needle
                        && let HeapData::Bytes(sub) = self.heap.get(*nid)
                    {
                        let sub = sub.as_slice().to_vec();
                        let HeapData::Bytes(bytes) = self.heap.get(*id) else { unreachable!() };
                        return Ok(bytes.contains_bytes(&sub));
                    }
                    return Err(ExcType::type_error("a bytes-like object is required"));
                }
                HeapData::Range(range) => {
                    return Ok(needle.as_int().is_some_and(|i| range.contains_int(i)));
                }
                // Equality scan over positional sequences.
                HeapData::List(_) | HeapData::Tuple(_) => {
                    let items: Vec<Value> = match self.heap.get(*id) {
                        HeapData::List(l) => l.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
                        HeapData::Tuple(t) => t.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
                        _ => unreachable!(),
                    };
                    let mut found = false;
                    for item in &items {
                        if !found && self.values_equal_dunder(item, needle)? {
                            found = true;
                        }
                    }
                    for item in items {
                        item.drop_with_heap(self.heap);
                    }
                    return Ok(found);
                }
                // Hashed membership.
                HeapData::Set(_) | HeapData::FrozenSet(_) => {
                    let hash = self.value_hash(needle)?;
                    let found = match self.heap.get(*id) {
                        HeapData::Set(s) => s
                            .0
                            .contains(hash, |m| values_equal(m, needle, self.heap, self.interns)),
                        HeapData::FrozenSet(s) => {
                            s.contains(hash, |m| values_equal(m, needle, self.heap, self.interns))
                        }
                        _ => unreachable!(),
                    };
                    return Ok(found);
                }
                HeapData::Dict(_) => {
                    let hash = self.value_hash(needle)?;
                    let HeapData::Dict(dict) = self.heap.get(*id) else { unreachable!() };
                    return Ok(dict.contains(hash, |k| values_equal(k, needle, self.heap, self.interns)));
                }
                HeapData::Instance(_) => {
                    let arg = needle.clone_with_heap(self.heap);
                    if let Some(result) =
                        self.call_dunder(container, StaticStrings::DunderContains.into(), ArgValues::One(arg))?
                    {
                        let truth = self.value_truth(&result)?;
                        result.drop_with_heap(self.heap);
                        return Ok(truth);
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name(self.heap, self.interns)
        )))
    }
}
