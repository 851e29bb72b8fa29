//! The mutable list type.

use crate::{
    except::{ExcType, RunResult},
    heap::HeapId,
    resource::MAX_SEQ_REPEAT_ITEMS,
    value::Value,
};

/// Mutable ordered sequence.
#[derive(Debug, Default)]
pub struct List(Vec<Value>);

impl From<Vec<Value>> for List {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

impl List {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.0
    }

    #[inline]
    pub fn items_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    /// Normalizes a (possibly negative) index against the current length.
    pub fn resolve_index(&self, index: i64) -> RunResult<usize> {
        let len = self.0.len() as i64;
        let idx = if index < 0 { index + len } else { index };
        if idx < 0 || idx >= len {
            return Err(ExcType::index_error("list"));
        }
        Ok(idx as usize)
    }

    /// Checks the repetition cap for `list * count`.
    pub fn check_repeat(&self, count: i64) -> RunResult<usize> {
        if count <= 0 {
            return Ok(0);
        }
        let total = self.0.len().saturating_mul(count as usize);
        if total > MAX_SEQ_REPEAT_ITEMS {
            return Err(ExcType::memory_cap("list repetition"));
        }
        Ok(count as usize)
    }

    pub fn take_items(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.0)
    }

    /// Collects heap ids referenced by the elements, for release.
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for value in &self.0 {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}
