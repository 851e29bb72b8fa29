//! The module object.

use indexmap::IndexMap;

use crate::{heap::HeapId, intern::StringId, value::Value};

/// A loaded module: a named, insertion-ordered namespace.
///
/// The namespace doubles as the globals map of frames executing the
/// module's code, so declaration order is preserved for free.
#[derive(Debug)]
pub struct Module {
    pub name: StringId,
    pub namespace: IndexMap<StringId, Value>,
    /// Package name used to resolve relative imports.
    pub package: Option<StringId>,
    /// Name of the loader that produced this module, for diagnostics.
    pub loader: Option<StringId>,
}

impl Module {
    #[must_use]
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            namespace: IndexMap::new(),
            package: None,
            loader: None,
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for value in self.namespace.values() {
            if let Value::Ref(id) = value {
                out.push(*id);
            }
        }
    }
}
