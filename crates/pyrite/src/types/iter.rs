//! Iterator objects driven by `for` loops and `next()`.
//!
//! An iterator is either a materialized item list with a cursor, or a
//! driver for a generator/coroutine or a user object implementing
//! `__next__`. Materialized iteration is advanced by the VM in two phases
//! (peek with a shared heap borrow, then bump the cursor) to avoid borrow
//! conflicts while cloning the yielded value.

use crate::{heap::HeapId, types::Range, value::Value};

/// Iteration state.
#[derive(Debug)]
pub enum Iter {
    /// Materialized items and a cursor.
    Items { items: Vec<Value>, index: usize },
    /// Lazy arithmetic progression.
    Range { range: Range, index: usize },
    /// Driver for a suspended generator/coroutine.
    Gen(HeapId),
    /// Driver for a user object with `__next__`.
    Dunder(Value),
}

impl Iter {
    #[must_use]
    pub fn from_items(items: Vec<Value>) -> Self {
        Self::Items { items, index: 0 }
    }

    #[must_use]
    pub fn from_range(range: Range) -> Self {
        Self::Range { range, index: 0 }
    }

    /// Peeks the next materialized item without advancing.
    ///
    /// Returns `None` at exhaustion or for driver variants (which the VM
    /// advances by re-entering the engine).
    #[must_use]
    pub fn peek(&self) -> Option<&Value> {
        match self {
            Self::Items { items, index } => items.get(*index),
            _ => None,
        }
    }

    /// Next value of a range iterator, advancing in place.
    pub fn range_next(&mut self) -> Option<i64> {
        if let Self::Range { range, index } = self {
            let value = range.item_at(*index as i64).ok()?;
            *index += 1;
            return Some(value);
        }
        None
    }

    /// Bumps the materialized cursor.
    pub fn advance(&mut self) {
        if let Self::Items { index, .. } = self {
            *index += 1;
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::Items { items, index } => {
                // Only the unconsumed tail is still owned for release
                // purposes; consumed items were cloned out, and their
                // references remain owned by the iterator until drop.
                let _ = index;
                for value in items {
                    if let Value::Ref(id) = value {
                        out.push(*id);
                    }
                }
            }
            Self::Range { .. } => {}
            Self::Gen(id) => out.push(*id),
            Self::Dunder(value) => {
                if let Value::Ref(id) = value {
                    out.push(*id);
                }
            }
        }
    }
}
