//! Callable object shapes: user functions, bound methods, descriptors.

use std::rc::Rc;

use crate::{bytecode::Code, heap::HeapId, intern::StringId, value::Value};

/// A user-defined function.
#[derive(Debug)]
pub struct Function {
    /// Display name, usually the code object's name.
    pub name: StringId,
    pub code: Rc<Code>,
    /// The module namespace the function was defined in.
    pub globals: HeapId,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    /// Defaults for keyword-only parameters.
    pub kw_defaults: Vec<(StringId, Value)>,
    /// Captured cells, in `free_vars` order.
    pub closure: Vec<HeapId>,
    /// Attribute dictionary, created lazily on first attribute write.
    pub attrs: Option<indexmap::IndexMap<StringId, Value>>,
}

impl Function {
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        out.push(self.globals);
        for value in &self.defaults {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
        for (_, value) in &self.kw_defaults {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
        out.extend(self.closure.iter().copied());
        if let Some(attrs) = &self.attrs {
            for value in attrs.values() {
                if let Value::Ref(id) = value {
                    out.push(*id);
                }
            }
        }
    }
}

/// A callable bound to its receiver; calling prepends the receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

impl BoundMethod {
    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        if let Value::Ref(id) = &self.func {
            out.push(*id);
        }
        if let Value::Ref(id) = &self.receiver {
            out.push(*id);
        }
    }
}

/// The `property` data descriptor: up to three callables and a docstring.
#[derive(Debug)]
pub struct Property {
    pub getter: Option<Value>,
    pub setter: Option<Value>,
    pub deleter: Option<Value>,
    pub doc: Option<StringId>,
}

impl Property {
    #[must_use]
    pub fn with_getter(getter: Value) -> Self {
        Self {
            getter: Some(getter),
            setter: None,
            deleter: None,
            doc: None,
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for slot in [&self.getter, &self.setter, &self.deleter] {
            if let Some(Value::Ref(id)) = slot {
                out.push(*id);
            }
        }
    }
}
