//! Binary and unary arithmetic.
//!
//! The generic arms implement the full coercion matrix (bool -> int ->
//! float -> complex, sequence concatenation/repetition, set algebra, dict
//! merge, `%`-formatting, operator dunders with reflected fallback). The
//! `*IntFast`/`*FloatFast` arms are type-gated shortcuts over the same
//! semantics and defer to the generic path on any shape mismatch.

use crate::{
    args::ArgValues,
    except::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    intern::StaticStrings,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Complex, Dict, List, SetStorage, Str, Tuple, strfmt},
    value::Value,
};

use super::Vm;

/// Binary operator selector shared by generic and specialized arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
    Xor,
    LShift,
    RShift,
}

impl BinOp {
    /// Operator glyph for error messages.
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
            Self::LShift => "<<",
            Self::RShift => ">>",
        }
    }

    /// Forward and reflected dunder names, when the operator has them.
    fn dunder_names(self) -> Option<(StaticStrings, StaticStrings)> {
        match self {
            Self::Add => Some((StaticStrings::DunderAdd, StaticStrings::DunderRadd)),
            Self::Sub => Some((StaticStrings::DunderSub, StaticStrings::DunderRsub)),
            Self::Mul => Some((StaticStrings::DunderMul, StaticStrings::DunderRmul)),
            Self::Div => Some((StaticStrings::DunderTruediv, StaticStrings::DunderRtruediv)),
            Self::FloorDiv => Some((StaticStrings::DunderFloordiv, StaticStrings::DunderFloordiv)),
            Self::Mod => Some((StaticStrings::DunderMod, StaticStrings::DunderMod)),
            Self::Pow => Some((StaticStrings::DunderPow, StaticStrings::DunderPow)),
            _ => None,
        }
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Pops two operands, applies `op`, pushes the result.
    pub(super) fn op_binary(&mut self, op: BinOp, inplace: bool) -> RunResult<()> {
        let rhs = self.pop();
        let lhs = self.pop();
        let result = self.binary_values(lhs, rhs, op, inplace)?;
        self.push(result);
        Ok(())
    }

    /// Specialized arm for int/int; falls back to the generic path.
    pub(super) fn op_binary_int_fast(&mut self, op: BinOp) -> RunResult<()> {
        if let (Value::Int(a), Value::Int(b)) = (self.peek_at(1), self.peek_at(0)) {
            let (a, b) = (*a, *b);
            let result = int_binary(a, b, op)?;
            self.drop_top(2);
            self.push(result);
            return Ok(());
        }
        self.op_binary(op, false)
    }

    /// Specialized arm for float/float; falls back to the generic path.
    pub(super) fn op_binary_float_fast(&mut self, op: BinOp) -> RunResult<()> {
        if let (Value::Float(a), Value::Float(b)) = (self.peek_at(1), self.peek_at(0)) {
            let (a, b) = (*a, *b);
            let result = float_binary(a, b, op)?;
            self.drop_top(2);
            self.push(result);
            return Ok(());
        }
        self.op_binary(op, false)
    }

    /// Applies `op` to two owned operands, producing an owned result.
    pub(crate) fn binary_values(&mut self, lhs: Value, rhs: Value, op: BinOp, inplace: bool) -> RunResult<Value> {
        // int ∘ int (bool coerces to int).
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int())
            && !matches!(lhs, Value::Ref(_))
            && !matches!(rhs, Value::Ref(_))
        {
            return int_binary(a, b, op);
        }

        // Real scalar ∘ real scalar with at least one float.
        if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
            if let (Some(a), Some(b)) = (lhs.as_float(self.heap), rhs.as_float(self.heap)) {
                return float_binary(a, b, op);
            }
        }

        // complex ∘ (complex | real scalar).
        if let Some(result) = self.complex_binary(&lhs, &rhs, op)? {
            lhs.drop_with_heap(self.heap);
            rhs.drop_with_heap(self.heap);
            return Ok(result);
        }

        // String concatenation / repetition / %-formatting.
        if lhs.as_str(self.heap, self.interns).is_some() {
            match op {
                BinOp::Add => {
                    if let Some(result) = self.str_concat(&lhs, &rhs)? {
                        lhs.drop_with_heap(self.heap);
                        rhs.drop_with_heap(self.heap);
                        return Ok(result);
                    }
                }
                BinOp::Mul => {
                    if let Some(count) = rhs.as_int() {
                        let text = {
                            let s = lhs.as_str(self.heap, self.interns).expect("checked above");
                            Str::from(s).repeat(count)?
                        };
                        lhs.drop_with_heap(self.heap);
                        rhs.drop_with_heap(self.heap);
                        return self.make_str(text);
                    }
                }
                BinOp::Mod => {
                    let formatted = strfmt::format_percent(self, &lhs, &rhs)?;
                    lhs.drop_with_heap(self.heap);
                    rhs.drop_with_heap(self.heap);
                    return self.make_str(formatted);
                }
                _ => {}
            }
        }

        // Heap container algebra.
        if let (Value::Ref(lid), Value::Ref(rid)) = (&lhs, &rhs) {
            if let Some(result) = self.container_binary(*lid, *rid, op, inplace)? {
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                return Ok(result);
            }
        }
        if let Value::Ref(lid) = &lhs
            && op == BinOp::Mul
            && let Some(count) = rhs.as_int()
        {
            if let Some(result) = self.sequence_repeat(*lid, count)? {
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                return Ok(result);
            }
        }
        // `n * seq` mirrors `seq * n`.
        if let Value::Ref(rid) = &rhs
            && op == BinOp::Mul
            && let Some(count) = lhs.as_int()
        {
            if let Some(result) = self.sequence_repeat(*rid, count)? {
                lhs.drop_with_heap(self.heap);
                rhs.drop_with_heap(self.heap);
                return Ok(result);
            }
        }

        // Operator dunders with reflected fallback.
        if let Some((forward, reflected)) = op.dunder_names() {
            if self.is_instance_value(&lhs) {
                let arg = rhs.clone_with_heap(self.heap);
                if let Some(result) = self.call_dunder(&lhs, forward.into(), ArgValues::One(arg))? {
                    if !matches!(result, Value::NotImplemented) {
                        lhs.drop_with_heap(self.heap);
                        rhs.drop_with_heap(self.heap);
                        return Ok(result);
                    }
                }
            }
            if self.is_instance_value(&rhs) {
                let arg = lhs.clone_with_heap(self.heap);
                if let Some(result) = self.call_dunder(&rhs, reflected.into(), ArgValues::One(arg))? {
                    if !matches!(result, Value::NotImplemented) {
                        lhs.drop_with_heap(self.heap);
                        rhs.drop_with_heap(self.heap);
                        return Ok(result);
                    }
                }
            }
        }

        let message = format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            lhs.type_name(self.heap, self.interns),
            rhs.type_name(self.heap, self.interns)
        );
        lhs.drop_with_heap(self.heap);
        rhs.drop_with_heap(self.heap);
        Err(ExcType::type_error(message))
    }

    fn is_instance_value(&self, value: &Value) -> bool {
        matches!(value, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Instance(_)))
    }

    fn complex_binary(&mut self, lhs: &Value, rhs: &Value, op: BinOp) -> RunResult<Option<Value>> {
        let lhs_c = self.as_complex(lhs);
        let rhs_c = self.as_complex(rhs);
        let (a, b) = match (lhs_c, rhs_c) {
            (Some(a), Some(b)) => (a, b),
            (Some(a), None) => match rhs.as_float(self.heap) {
                Some(scalar) => (a, Complex::new(scalar, 0.0)),
                None => return Ok(None),
            },
            (None, Some(b)) => match lhs.as_float(self.heap) {
                Some(scalar) => (Complex::new(scalar, 0.0), b),
                None => return Ok(None),
            },
            (None, None) => return Ok(None),
        };
        let result = match op {
            BinOp::Add => a.add(b),
            BinOp::Sub => a.sub(b),
            BinOp::Mul => a.mul(b),
            BinOp::Div => {
                if b.is_zero_denominator() {
                    return Err(ExcType::zero_division("complex division by zero"));
                }
                a.div(b)
            }
            _ => {
                return Err(ExcType::type_error(format!(
                    "unsupported operand type(s) for {}: 'complex'",
                    op.symbol()
                )));
            }
        };
        let id = self.heap.allocate(HeapData::Complex(result))?;
        Ok(Some(Value::Ref(id)))
    }

    fn as_complex(&self, value: &Value) -> Option<Complex> {
        if let Value::Ref(id) = value
            && let HeapData::Complex(c) = self.heap.get(*id)
        {
            return Some(*c);
        }
        None
    }

    fn str_concat(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        let Some(a) = lhs.as_str(self.heap, self.interns) else {
            return Ok(None);
        };
        let Some(b) = rhs.as_str(self.heap, self.interns) else {
            return Err(ExcType::type_error(format!(
                "can only concatenate str (not \"{}\") to str",
                rhs.type_name(self.heap, self.interns)
            )));
        };
        let mut combined = String::with_capacity(a.len() + b.len());
        combined.push_str(a);
        combined.push_str(b);
        Ok(Some(self.make_str(combined)?))
    }

    /// Sequence and mapping algebra between two heap values.
    fn container_binary(&mut self, lid: HeapId, rid: HeapId, op: BinOp, inplace: bool) -> RunResult<Option<Value>> {
        match (self.heap.get(lid), self.heap.get(rid), op) {
            (HeapData::List(_), HeapData::List(_), BinOp::Add) => {
                if inplace {
                    // `lhs += rhs` extends in place and yields lhs itself.
                    let extension: Vec<Value> = {
                        let HeapData::List(rhs) = self.heap.get(rid) else { unreachable!() };
                        rhs.items().iter().map(|v| v.clone_with_heap(self.heap)).collect()
                    };
                    let HeapData::List(lhs) = self.heap.get_mut(lid) else { unreachable!() };
                    lhs.items_mut().extend(extension);
                    self.heap.inc_ref(lid);
                    return Ok(Some(Value::Ref(lid)));
                }
                let mut combined = Vec::new();
                {
                    let HeapData::List(lhs) = self.heap.get(lid) else { unreachable!() };
                    combined.extend(lhs.items().iter().map(|v| v.clone_with_heap(self.heap)));
                    let HeapData::List(rhs) = self.heap.get(rid) else { unreachable!() };
                    combined.extend(rhs.items().iter().map(|v| v.clone_with_heap(self.heap)));
                }
                let id = self.heap.allocate(HeapData::List(List::from(combined)))?;
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Tuple(_), HeapData::Tuple(_), BinOp::Add) => {
                let mut combined = Vec::new();
                {
                    let HeapData::Tuple(lhs) = self.heap.get(lid) else { unreachable!() };
                    combined.extend(lhs.items().iter().map(|v| v.clone_with_heap(self.heap)));
                    let HeapData::Tuple(rhs) = self.heap.get(rid) else { unreachable!() };
                    combined.extend(rhs.items().iter().map(|v| v.clone_with_heap(self.heap)));
                }
                let id = self.heap.allocate(HeapData::Tuple(Tuple::from(combined)))?;
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Bytes(_), HeapData::Bytes(_), BinOp::Add) => {
                let combined = {
                    let HeapData::Bytes(lhs) = self.heap.get(lid) else { unreachable!() };
                    let HeapData::Bytes(rhs) = self.heap.get(rid) else { unreachable!() };
                    let mut combined = Vec::with_capacity(lhs.len() + rhs.len());
                    combined.extend_from_slice(lhs.as_slice());
                    combined.extend_from_slice(rhs.as_slice());
                    combined
                };
                let id = self.heap.allocate(HeapData::Bytes(crate::types::Bytes::from(combined)))?;
                Ok(Some(Value::Ref(id)))
            }
            (HeapData::Set(_) | HeapData::FrozenSet(_), HeapData::Set(_) | HeapData::FrozenSet(_), BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Sub) => {
                self.set_algebra(lid, rid, op).map(Some)
            }
            (HeapData::Dict(_), HeapData::Dict(_), BinOp::Or) => {
                let merged = self.clone_dict(lid)?;
                self.dict_update_from(merged, rid, false)?;
                Ok(Some(Value::Ref(merged)))
            }
            _ => Ok(None),
        }
    }

    fn sequence_repeat(&mut self, id: HeapId, count: i64) -> RunResult<Option<Value>> {
        match self.heap.get(id) {
            HeapData::List(list) => {
                let repeats = list.check_repeat(count)?;
                let items: Vec<Value> = {
                    let HeapData::List(list) = self.heap.get(id) else { unreachable!() };
                    let mut items = Vec::with_capacity(list.len() * repeats);
                    for _ in 0..repeats {
                        items.extend(list.items().iter().map(|v| v.clone_with_heap(self.heap)));
                    }
                    items
                };
                let new_id = self.heap.allocate(HeapData::List(List::from(items)))?;
                Ok(Some(Value::Ref(new_id)))
            }
            HeapData::Tuple(tuple) => {
                if tuple.len().saturating_mul(count.max(0) as usize) > crate::resource::MAX_SEQ_REPEAT_ITEMS {
                    return Err(ExcType::memory_cap("tuple repetition"));
                }
                let repeats = count.max(0) as usize;
                let items: Vec<Value> = {
                    let HeapData::Tuple(tuple) = self.heap.get(id) else { unreachable!() };
                    let mut items = Vec::with_capacity(tuple.len() * repeats);
                    for _ in 0..repeats {
                        items.extend(tuple.items().iter().map(|v| v.clone_with_heap(self.heap)));
                    }
                    items
                };
                let new_id = self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?;
                Ok(Some(Value::Ref(new_id)))
            }
            _ => Ok(None),
        }
    }

    fn set_algebra(&mut self, lid: HeapId, rid: HeapId, op: BinOp) -> RunResult<Value> {
        let lhs_members = self.clone_set_members(lid);
        let rhs_members = self.clone_set_members(rid);

        let mut result = SetStorage::new();
        match op {
            BinOp::Or => {
                for (value, hash) in lhs_members {
                    self.storage_add(&mut result, value, hash);
                }
                for (value, hash) in rhs_members {
                    self.storage_add(&mut result, value, hash);
                }
            }
            BinOp::And => {
                for (value, hash) in lhs_members {
                    if self.member_in(&rhs_members, &value, hash) {
                        self.storage_add(&mut result, value, hash);
                    } else {
                        value.drop_with_heap(self.heap);
                    }
                }
                for (value, _) in rhs_members {
                    value.drop_with_heap(self.heap);
                }
            }
            BinOp::Sub => {
                for (value, hash) in lhs_members {
                    if self.member_in(&rhs_members, &value, hash) {
                        value.drop_with_heap(self.heap);
                    } else {
                        self.storage_add(&mut result, value, hash);
                    }
                }
                for (value, _) in rhs_members {
                    value.drop_with_heap(self.heap);
                }
            }
            BinOp::Xor => {
                for (value, hash) in &lhs_members {
                    if !self.member_in(&rhs_members, value, *hash) {
                        let cloned = value.clone_with_heap(self.heap);
                        self.storage_add(&mut result, cloned, *hash);
                    }
                }
                for (value, hash) in &rhs_members {
                    if !self.member_in(&lhs_members, value, *hash) {
                        let cloned = value.clone_with_heap(self.heap);
                        self.storage_add(&mut result, cloned, *hash);
                    }
                }
                for (value, _) in lhs_members {
                    value.drop_with_heap(self.heap);
                }
                for (value, _) in rhs_members {
                    value.drop_with_heap(self.heap);
                }
            }
            _ => unreachable!("set_algebra called with non-set operator"),
        }

        // The result mirrors the left operand's mutability.
        let data = if matches!(self.heap.get(lid), HeapData::FrozenSet(_)) {
            HeapData::FrozenSet(result)
        } else {
            HeapData::Set(crate::types::Set(result))
        };
        let id = self.heap.allocate(data)?;
        Ok(Value::Ref(id))
    }

    fn clone_set_members(&self, id: HeapId) -> Vec<(Value, u64)> {
        let members: Vec<(Value, u64)> = match self.heap.get(id) {
            HeapData::Set(s) => s
                .0
                .iter_with_hash()
                .map(|(v, h)| (v.clone_with_heap(self.heap), h))
                .collect(),
            HeapData::FrozenSet(s) => s
                .iter_with_hash()
                .map(|(v, h)| (v.clone_with_heap(self.heap), h))
                .collect(),
            _ => Vec::new(),
        };
        members
    }

    fn member_in(&self, members: &[(Value, u64)], probe: &Value, hash: u64) -> bool {
        members
            .iter()
            .any(|(m, h)| *h == hash && crate::value::values_equal(m, probe, self.heap, self.interns))
    }

    /// Adds an owned member to a detached set storage, deduplicating.
    pub(crate) fn storage_add(&mut self, storage: &mut SetStorage, value: Value, hash: u64) {
        let already = storage.contains(hash, |existing| {
            crate::value::values_equal(existing, &value, self.heap, self.interns)
        });
        if already {
            value.drop_with_heap(self.heap);
        } else {
            let duplicate = storage.add(value, hash, |_| false);
            debug_assert!(duplicate.is_none());
        }
    }

    /// Shallow-copies a dict (entries cloned, hashes reused).
    pub(super) fn clone_dict(&mut self, id: HeapId) -> RunResult<HeapId> {
        let entries: Vec<(Value, Value, u64)> = {
            let HeapData::Dict(dict) = self.heap.get(id) else {
                return Err(crate::except::RunError::internal("clone_dict on non-dict"));
            };
            dict.iter_with_hash()
                .map(|(k, v, h)| (k.clone_with_heap(self.heap), v.clone_with_heap(self.heap), h))
                .collect()
        };
        let mut copy = Dict::with_capacity(entries.len());
        for (key, value, hash) in entries {
            // Keys were unique in the source; no equality probe needed.
            let replaced = copy.insert(key, hash, value, |_| false);
            debug_assert!(replaced.is_none());
        }
        let new_id = self.heap.allocate(HeapData::Dict(copy))?;
        Ok(new_id)
    }

    // ==================================================================
    // Unary operators
    // ==================================================================

    pub(super) fn op_unary_neg(&mut self) -> RunResult<()> {
        let value = self.pop();
        match &value {
            Value::Bool(b) => {
                self.push(Value::Int(-i64::from(*b)));
            }
            Value::Int(i) => {
                let negated = i
                    .checked_neg()
                    .ok_or_else(|| ExcType::overflow_error("integer negation overflows 64 bits"))?;
                self.push(Value::Int(negated));
            }
            Value::Float(f) => self.push(Value::Float(-f)),
            Value::Ref(id) => {
                if let HeapData::Complex(c) = self.heap.get(*id) {
                    let negated = c.neg();
                    value.drop_with_heap(self.heap);
                    let new_id = self.heap.allocate(HeapData::Complex(negated))?;
                    self.push(Value::Ref(new_id));
                    return Ok(());
                }
                if let Some(result) = self.call_dunder(&value, StaticStrings::DunderNeg.into(), ArgValues::Empty)? {
                    value.drop_with_heap(self.heap);
                    self.push(result);
                    return Ok(());
                }
                let message = format!("bad operand type for unary -: '{}'", value.type_name(self.heap, self.interns));
                value.drop_with_heap(self.heap);
                return Err(ExcType::type_error(message));
            }
            _ => {
                let message = format!("bad operand type for unary -: '{}'", value.type_name(self.heap, self.interns));
                value.drop_with_heap(self.heap);
                return Err(ExcType::type_error(message));
            }
        }
        Ok(())
    }

    pub(super) fn op_unary_pos(&mut self) -> RunResult<()> {
        let value = self.pop();
        match &value {
            Value::Bool(b) => self.push(Value::Int(i64::from(*b))),
            Value::Int(_) | Value::Float(_) => {
                self.push(value);
                return Ok(());
            }
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Complex(_)) => {
                self.push(value);
                return Ok(());
            }
            _ => {
                let message = format!("bad operand type for unary +: '{}'", value.type_name(self.heap, self.interns));
                value.drop_with_heap(self.heap);
                return Err(ExcType::type_error(message));
            }
        }
        Ok(())
    }

    pub(super) fn op_unary_invert(&mut self) -> RunResult<()> {
        let value = self.pop();
        match value.as_int() {
            Some(i) => {
                self.push(Value::Int(!i));
                Ok(())
            }
            None => {
                let message = format!("bad operand type for unary ~: '{}'", value.type_name(self.heap, self.interns));
                value.drop_with_heap(self.heap);
                Err(ExcType::type_error(message))
            }
        }
    }
}

/// int ∘ int with the documented rounding, shift, and overflow policy.
pub(crate) fn int_binary(a: i64, b: i64, op: BinOp) -> RunResult<Value> {
    Ok(match op {
        BinOp::Add => Value::Int(
            a.checked_add(b)
                .ok_or_else(|| ExcType::overflow_error("integer addition overflows 64 bits"))?,
        ),
        BinOp::Sub => Value::Int(
            a.checked_sub(b)
                .ok_or_else(|| ExcType::overflow_error("integer subtraction overflows 64 bits"))?,
        ),
        BinOp::Mul => Value::Int(
            a.checked_mul(b)
                .ok_or_else(|| ExcType::overflow_error("integer multiplication overflows 64 bits"))?,
        ),
        BinOp::Div => {
            if b == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            Value::Float(a as f64 / b as f64)
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let quotient = a
                .checked_div(b)
                .ok_or_else(|| ExcType::overflow_error("integer division overflows 64 bits"))?;
            let remainder = a % b;
            // Round toward negative infinity.
            if remainder != 0 && (remainder < 0) != (b < 0) {
                Value::Int(quotient - 1)
            } else {
                Value::Int(quotient)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let remainder = a.checked_rem(b).unwrap_or(0);
            // The result takes the divisor's sign.
            if remainder != 0 && (remainder < 0) != (b < 0) {
                Value::Int(remainder + b)
            } else {
                Value::Int(remainder)
            }
        }
        BinOp::Pow => {
            if b < 0 {
                // Negative exponent promotes to float.
                Value::Float((a as f64).powf(b as f64))
            } else {
                let exp = u32::try_from(b).map_err(|_| ExcType::overflow_error("exponent too large"))?;
                Value::Int(
                    a.checked_pow(exp)
                        .ok_or_else(|| ExcType::overflow_error("integer power overflows 64 bits"))?,
                )
            }
        }
        BinOp::And => Value::Int(a & b),
        BinOp::Or => Value::Int(a | b),
        BinOp::Xor => Value::Int(a ^ b),
        BinOp::LShift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            if b >= 64 {
                // Shifts past the word collapse to zero.
                Value::Int(0)
            } else {
                Value::Int(((a as u64) << b) as i64)
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            if b >= 64 {
                Value::Int(if a < 0 { -1 } else { 0 })
            } else {
                Value::Int(a >> b)
            }
        }
    })
}

/// float ∘ float; divisor-sign modulo, floor division, zero-division errors.
pub(crate) fn float_binary(a: f64, b: f64, op: BinOp) -> RunResult<Value> {
    Ok(match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float division by zero"));
            }
            Value::Float(a / b)
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float floor division by zero"));
            }
            Value::Float((a / b).floor())
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float modulo"));
            }
            let mut remainder = a % b;
            if remainder != 0.0 && (remainder < 0.0) != (b < 0.0) {
                remainder += b;
            }
            Value::Float(remainder)
        }
        BinOp::Pow => Value::Float(a.powf(b)),
        _ => {
            return Err(ExcType::type_error(format!(
                "unsupported operand type(s) for {}: 'float'",
                op.symbol()
            )));
        }
    })
}
