//! Embedder-supplied opaque values with type metatables.
//!
//! A `userdata` value wraps a `Box<dyn UserValue>` plus a [`MetaTypeId`]
//! into the process-wide metatable index. Metatables declare methods and
//! properties as boundary-typed callables (`Object` in, `Object` out);
//! errors they return are classified by the foreign-error rules.
//!
//! The index is shared by all interpreters and guarded by its own
//! read-write lock; registration takes the write lock, lookup a read
//! lock.

use std::{
    any::Any,
    fmt,
    sync::{Arc, OnceLock, RwLock},
};

use crate::{heap::HeapId, object::Object};

/// Trait for embedder payloads stored in userdata values.
pub trait UserValue: Any + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Display name used in reprs and error messages.
    fn type_name(&self) -> &str;
}

/// A method on a userdata type.
pub type UserMethod = Arc<dyn Fn(&mut dyn UserValue, &[Object]) -> Result<Object, String> + Send + Sync>;

/// A property getter on a userdata type.
pub type UserGetter = Arc<dyn Fn(&dyn UserValue) -> Result<Object, String> + Send + Sync>;

/// A property setter on a userdata type.
pub type UserSetter = Arc<dyn Fn(&mut dyn UserValue, Object) -> Result<(), String> + Send + Sync>;

/// A property on a userdata type: getter plus optional setter.
pub struct UserProperty {
    pub get: UserGetter,
    pub set: Option<UserSetter>,
}

/// Index into the process-wide metatable registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaTypeId(u32);

/// Methods and properties shared by all userdata values of one type.
///
/// Entries are vectors so callable references can be carried as plain
/// `(MetaTypeId, index)` pairs inside immediate values.
#[derive(Default)]
pub struct MetaTable {
    pub name: String,
    methods: Vec<(String, UserMethod)>,
    properties: Vec<(String, UserProperty)>,
}

impl fmt::Debug for MetaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaTable")
            .field("name", &self.name)
            .field("methods", &self.methods.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("properties", &self.properties.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl MetaTable {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&mut dyn UserValue, &[Object]) -> Result<Object, String> + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((name.into(), Arc::new(f)));
        self
    }

    pub fn property(mut self, name: impl Into<String>, property: UserProperty) -> Self {
        self.properties.push((name.into(), property));
        self
    }

    #[must_use]
    pub fn method_index(&self, name: &str) -> Option<u16> {
        self.methods
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| u16::try_from(i).expect("metatable method index overflow"))
    }

    #[must_use]
    pub fn method_at(&self, index: u16) -> Option<&UserMethod> {
        self.methods.get(usize::from(index)).map(|(_, m)| m)
    }

    #[must_use]
    pub fn property_named(&self, name: &str) -> Option<&UserProperty> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }
}

fn registry() -> &'static RwLock<Vec<Arc<MetaTable>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<MetaTable>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Registers a metatable in the process-wide index.
pub fn register_metatable(table: MetaTable) -> MetaTypeId {
    let mut index = registry().write().expect("metatable index poisoned");
    index.push(Arc::new(table));
    MetaTypeId(u32::try_from(index.len() - 1).expect("metatable index overflow"))
}

/// Fetches a metatable by id.
#[must_use]
pub fn metatable(id: MetaTypeId) -> Option<Arc<MetaTable>> {
    registry()
        .read()
        .expect("metatable index poisoned")
        .get(id.0 as usize)
        .cloned()
}

/// Clears the process-wide metatable index (test isolation).
pub(crate) fn reset_metatables() {
    registry().write().expect("metatable index poisoned").clear();
}

/// An opaque embedder value bound to its metatable.
#[derive(Debug)]
pub struct UserData {
    pub type_id: MetaTypeId,
    pub data: Box<dyn UserValue>,
}

impl UserData {
    pub fn collect_refs(&self, _out: &mut Vec<HeapId>) {
        // Userdata payloads cannot hold engine values.
    }
}
