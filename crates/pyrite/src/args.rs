//! Call-argument carriers.
//!
//! Most calls pass zero, one, or two positional arguments, so
//! [`ArgValues`] has dedicated variants for those shapes and only
//! allocates for wider or keyword-carrying calls. Values inside are
//! owned; every consuming path must either hand them on or release them
//! with `drop_with_heap`.

use crate::{
    except::{ExcType, RunResult},
    heap::Heap,
    intern::StringId,
    resource::ResourceTracker,
    value::Value,
};

/// Keyword arguments: interned name plus value, in call order.
pub type Kwargs = Vec<(StringId, Value)>;

/// Positional (and optionally keyword) arguments for one call.
#[derive(Debug, Default)]
pub enum ArgValues {
    #[default]
    Empty,
    One(Value),
    Two(Value, Value),
    Many(Vec<Value>),
    WithKwargs {
        args: Vec<Value>,
        kwargs: Kwargs,
    },
}

impl ArgValues {
    /// Builds the cheapest variant for a positional vector.
    #[must_use]
    pub fn from_vec(mut args: Vec<Value>) -> Self {
        match args.len() {
            0 => Self::Empty,
            1 => Self::One(args.pop().expect("len checked")),
            2 => {
                let b = args.pop().expect("len checked");
                let a = args.pop().expect("len checked");
                Self::Two(a, b)
            }
            _ => Self::Many(args),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(_) => 1,
            Self::Two(..) => 2,
            Self::Many(args) => args.len(),
            Self::WithKwargs { args, .. } => args.len(),
        }
    }

    #[must_use]
    pub fn has_kwargs(&self) -> bool {
        matches!(self, Self::WithKwargs { kwargs, .. } if !kwargs.is_empty())
    }

    /// Flattens into a positional vector plus keywords.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Value>, Kwargs) {
        match self {
            Self::Empty => (Vec::new(), Vec::new()),
            Self::One(a) => (vec![a], Vec::new()),
            Self::Two(a, b) => (vec![a, b], Vec::new()),
            Self::Many(args) => (args, Vec::new()),
            Self::WithKwargs { args, kwargs } => (args, kwargs),
        }
    }

    /// Prepends a receiver (bound-method calls).
    #[must_use]
    pub fn prepend(self, receiver: Value) -> Self {
        match self {
            Self::Empty => Self::One(receiver),
            Self::One(a) => Self::Two(receiver, a),
            Self::Two(a, b) => Self::Many(vec![receiver, a, b]),
            Self::Many(mut args) => {
                args.insert(0, receiver);
                Self::Many(args)
            }
            Self::WithKwargs { mut args, kwargs } => {
                args.insert(0, receiver);
                Self::WithKwargs { args, kwargs }
            }
        }
    }

    /// Releases every contained value.
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        let (args, kwargs) = self.into_parts();
        for value in args {
            value.drop_with_heap(heap);
        }
        for (_, value) in kwargs {
            value.drop_with_heap(heap);
        }
    }

    /// Requires exactly zero arguments.
    pub fn check_zero(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<()> {
        match self {
            Self::Empty => Ok(()),
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::arg_count_error(name, 0, count))
            }
        }
    }

    /// Requires exactly one positional argument.
    pub fn get_one(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Value> {
        match self {
            Self::One(a) => Ok(a),
            Self::Many(mut args) if args.len() == 1 => Ok(args.pop().expect("len checked")),
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::arg_count_error(name, 1, count))
            }
        }
    }

    /// Requires exactly two positional arguments.
    pub fn get_two(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<(Value, Value)> {
        match self {
            Self::Two(a, b) => Ok((a, b)),
            Self::Many(mut args) if args.len() == 2 => {
                let b = args.pop().expect("len checked");
                let a = args.pop().expect("len checked");
                Ok((a, b))
            }
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::arg_count_error(name, 2, count))
            }
        }
    }

    /// Requires one or two positional arguments.
    pub fn get_one_or_two(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<(Value, Option<Value>)> {
        match self {
            Self::One(a) => Ok((a, None)),
            Self::Two(a, b) => Ok((a, Some(b))),
            Self::Many(mut args) if args.len() == 1 => Ok((args.pop().expect("len checked"), None)),
            Self::Many(mut args) if args.len() == 2 => {
                let b = args.pop().expect("len checked");
                let a = args.pop().expect("len checked");
                Ok((a, Some(b)))
            }
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::arg_count_error(name, 2, count))
            }
        }
    }

    /// Requires between one and three positional arguments.
    pub fn get_up_to_three(
        self,
        name: &str,
        heap: &mut Heap<impl ResourceTracker>,
    ) -> RunResult<(Value, Option<Value>, Option<Value>)> {
        match self {
            Self::One(a) => Ok((a, None, None)),
            Self::Two(a, b) => Ok((a, Some(b), None)),
            Self::Many(mut args) if (1..=3).contains(&args.len()) => {
                let c = if args.len() == 3 { args.pop() } else { None };
                let b = if args.len() == 2 { args.pop() } else { None };
                let a = args.pop().expect("len checked");
                Ok((a, b, c))
            }
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::arg_count_error(name, 3, count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn shapes_collapse_to_cheapest_variant() {
        assert!(matches!(ArgValues::from_vec(vec![]), ArgValues::Empty));
        assert!(matches!(ArgValues::from_vec(vec![Value::None]), ArgValues::One(_)));
        assert!(matches!(
            ArgValues::from_vec(vec![Value::None, Value::None]),
            ArgValues::Two(..)
        ));
        assert!(matches!(
            ArgValues::from_vec(vec![Value::None, Value::None, Value::None]),
            ArgValues::Many(_)
        ));
    }

    #[test]
    fn arity_errors_release_values() {
        let mut heap = Heap::new(NoLimitTracker);
        let args = ArgValues::Two(Value::Int(1), Value::Int(2));
        assert!(args.get_one("f", &mut heap).is_err());
    }

    #[test]
    fn prepend_builds_method_shapes() {
        let args = ArgValues::One(Value::Int(2)).prepend(Value::Int(1));
        let (positional, kwargs) = args.into_parts();
        assert!(kwargs.is_empty());
        assert!(matches!(positional[0], Value::Int(1)));
        assert!(matches!(positional[1], Value::Int(2)));
    }
}
