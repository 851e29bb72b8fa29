//! The slice type and index derivation.

use crate::{
    except::{ExcType, RunResult},
    heap::HeapId,
    value::Value,
};

/// `(start, stop, step)` where any component may be absent.
#[derive(Debug)]
pub struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Normalized slice parameters for a sequence of known length.
///
/// `start`/`stop` are clamped; iterating `k = start, start+step, ...`
/// while `k != stop` (in the step direction) visits exactly the selected
/// index set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceIndices {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
    pub len: usize,
}

impl SliceIndices {
    /// The selected positions, in visit order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut current = self.start;
        let step = self.step;
        let stop = self.stop;
        std::iter::from_fn(move || {
            let in_range = if step > 0 { current < stop } else { current > stop };
            if !in_range {
                return None;
            }
            let item = current as usize;
            current += step;
            Some(item)
        })
    }
}

impl Slice {
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for value in [&self.start, &self.stop, &self.step] {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}

/// Derives clamped indices for a sequence of `seq_len` items.
///
/// Components must be ints or absent (`None`); a zero step is an error.
pub fn normalize_slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>, seq_len: usize) -> RunResult<SliceIndices> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ExcType::value_error("slice step cannot be zero"));
    }
    let len = seq_len as i64;

    let clamp = |idx: i64, low: i64, high: i64| idx.clamp(low, high);
    let resolve = |idx: i64| if idx < 0 { idx + len } else { idx };

    let (start, stop) = if step > 0 {
        let start = clamp(start.map_or(0, resolve), 0, len);
        let stop = clamp(stop.map_or(len, resolve), 0, len);
        (start, stop)
    } else {
        let start = clamp(start.map_or(len - 1, resolve), -1, len - 1);
        let stop = clamp(stop.map_or(-1, resolve), -1, len - 1);
        (start, stop)
    };

    let count = if step > 0 {
        if stop > start { ((stop - start - 1) / step + 1) as usize } else { 0 }
    } else if start > stop {
        ((start - stop - 1) / (-step) + 1) as usize
    } else {
        0
    };

    Ok(SliceIndices {
        start,
        stop,
        step,
        len: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(start: Option<i64>, stop: Option<i64>, step: Option<i64>, len: usize) -> Vec<usize> {
        normalize_slice(start, stop, step, len).unwrap().iter().collect()
    }

    #[test]
    fn full_slice_is_identity() {
        assert_eq!(collect(None, None, None, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reverse_slice() {
        assert_eq!(collect(None, None, Some(-1), 4), vec![3, 2, 1, 0]);
    }

    #[test]
    fn stepped_and_clamped() {
        assert_eq!(collect(Some(1), Some(100), Some(2), 6), vec![1, 3, 5]);
        assert_eq!(collect(Some(-100), Some(2), None, 6), vec![0, 1]);
        assert_eq!(collect(Some(-2), None, None, 6), vec![4, 5]);
    }

    #[test]
    fn zero_step_rejected() {
        assert!(normalize_slice(None, None, Some(0), 3).is_err());
    }

    #[test]
    fn count_matches_iteration() {
        for (start, stop, step) in [(None, None, Some(2_i64)), (Some(5), None, Some(-2)), (Some(1), Some(5), None)] {
            let indices = normalize_slice(start, stop, step, 7).unwrap();
            assert_eq!(indices.len, indices.iter().count());
        }
    }
}
