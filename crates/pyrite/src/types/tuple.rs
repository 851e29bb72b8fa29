//! The immutable tuple type.

use crate::{
    except::{ExcType, RunResult},
    heap::HeapId,
    value::Value,
};

/// Immutable ordered sequence. Hashable iff all elements are.
#[derive(Debug, Default)]
pub struct Tuple(Vec<Value>);

impl From<Vec<Value>> for Tuple {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

impl Tuple {
    #[inline]
    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn resolve_index(&self, index: i64) -> RunResult<usize> {
        let len = self.0.len() as i64;
        let idx = if index < 0 { index + len } else { index };
        if idx < 0 || idx >= len {
            return Err(ExcType::index_error("tuple"));
        }
        Ok(idx as usize)
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for value in &self.0 {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}
