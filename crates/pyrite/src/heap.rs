//! The reference-counted slot arena.
//!
//! Every mutable or structured runtime value lives in one arena slot,
//! addressed by [`HeapId`]. Values reference slots via `Value::Ref`;
//! cloning a ref increments the slot's count, dropping one decrements it,
//! and a count of zero frees the slot (recursively releasing children)
//! and recycles it through a free list.
//!
//! Reference cycles are not collected during execution; the equality and
//! repr paths are cycle-tolerant on their own, and cyclic garbage is
//! reclaimed when the interpreter is dropped.
//!
//! Container operations that need the heap while mutating a container use
//! the take/restore pattern: [`Heap::take_data`] detaches the slot's data
//! (leaving a borrow marker), the caller works on it with full heap
//! access, then [`Heap::restore_data`] reattaches it. Touching a slot
//! while its data is detached is an engine bug and panics.

use std::cell::Cell;

use ahash::AHashMap;

use crate::{
    except::{ExcInstance, ExcType, RunResult},
    intern::{Interns, StaticStrings, StringId},
    resource::{ResourceError, ResourceTracker},
    types::{
        Bytes, ClassObject, Complex, Dict, Function, Generator, Instance, Iter, List, Module, Range, Set, SetStorage,
        Slice, Str, SuperProxy, Tuple, Type, UserData,
        function::{BoundMethod, Property},
    },
    value::Value,
};

/// Arena slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(usize);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Every heap-allocated object shape.
#[derive(Debug)]
pub enum HeapData {
    Str(Str),
    Bytes(Bytes),
    Tuple(Tuple),
    FrozenSet(SetStorage),
    List(List),
    Dict(Dict),
    Set(Set),
    Range(Range),
    Slice(Slice),
    Complex(Complex),
    Iter(Iter),
    /// Single mutable slot shared between a frame and its closures.
    Cell(Value),
    Function(Function),
    BoundMethod(BoundMethod),
    Property(Property),
    /// Descriptor wrapper binding the class instead of the instance.
    ClassMethod(Value),
    /// Descriptor wrapper returning the callable unbound.
    StaticMethod(Value),
    Class(ClassObject),
    Instance(Instance),
    Super(SuperProxy),
    Generator(Generator),
    Exception(ExcInstance),
    Module(Module),
    UserData(UserData),
}

impl HeapData {
    /// Shape discriminator.
    #[must_use]
    pub fn py_type(&self) -> Type {
        match self {
            Self::Str(_) => Type::Str,
            Self::Bytes(_) => Type::Bytes,
            Self::Tuple(_) => Type::Tuple,
            Self::FrozenSet(_) => Type::FrozenSet,
            Self::List(_) => Type::List,
            Self::Dict(_) => Type::Dict,
            Self::Set(_) => Type::Set,
            Self::Range(_) => Type::Range,
            Self::Slice(_) => Type::Slice,
            Self::Complex(_) => Type::Complex,
            Self::Iter(_) => Type::Iterator,
            Self::Cell(_) => Type::Cell,
            Self::Function(_) => Type::Function,
            Self::BoundMethod(_) => Type::Method,
            Self::Property(_) => Type::Property,
            Self::ClassMethod(_) => Type::ClassMethod,
            Self::StaticMethod(_) => Type::StaticMethod,
            Self::Class(_) => Type::Class,
            Self::Instance(_) => Type::Instance,
            Self::Super(_) => Type::Super,
            Self::Generator(g) => match g.kind {
                crate::types::GenKind::Generator => Type::Generator,
                crate::types::GenKind::Coroutine => Type::Coroutine,
            },
            Self::Exception(_) => Type::Exception,
            Self::Module(_) => Type::Module,
            Self::UserData(_) => Type::UserData,
        }
    }

    /// Rough byte size for the resource tracker.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.as_str().len(),
            Self::Bytes(b) => b.len(),
            Self::Tuple(t) => t.len() * size_of::<Value>(),
            Self::FrozenSet(s) => s.len() * (size_of::<Value>() + 16),
            Self::List(l) => l.len() * size_of::<Value>(),
            Self::Dict(d) => d.len() * (2 * size_of::<Value>() + 16),
            Self::Set(s) => s.0.len() * (size_of::<Value>() + 16),
            Self::Iter(Iter::Items { items, .. }) => items.len() * size_of::<Value>(),
            Self::Class(c) => c.members.len() * (size_of::<Value>() + 8),
            Self::Instance(i) => i.attrs.as_ref().map_or(0, |a| a.len() * (size_of::<Value>() + 8)),
            Self::Module(m) => m.namespace.len() * (size_of::<Value>() + 8),
            _ => 0,
        };
        64 + payload
    }

    /// Child heap ids that must be released when this object dies.
    fn collect_refs(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::Range(_) | Self::Complex(_) | Self::Exception(_) => {}
            Self::Tuple(t) => t.collect_refs(out),
            Self::FrozenSet(s) => s.collect_refs(out),
            Self::List(l) => l.collect_refs(out),
            Self::Dict(d) => d.collect_refs(out),
            Self::Set(s) => s.0.collect_refs(out),
            Self::Slice(s) => s.collect_refs(out),
            Self::Iter(i) => i.collect_refs(out),
            Self::Cell(v) | Self::ClassMethod(v) | Self::StaticMethod(v) => {
                if let Value::Ref(id) = v {
                    out.push(*id);
                }
            }
            Self::Function(f) => f.collect_refs(out),
            Self::BoundMethod(m) => m.collect_refs(out),
            Self::Property(p) => p.collect_refs(out),
            Self::Class(c) => c.collect_refs(out),
            Self::Instance(i) => i.collect_refs(out),
            Self::Super(s) => s.collect_refs(out),
            Self::Generator(g) => g.collect_refs(out),
            Self::Module(m) => m.collect_refs(out),
            Self::UserData(u) => u.collect_refs(out),
        }
    }
}

#[derive(Debug)]
struct HeapValue {
    /// Interior mutability lets `inc_ref` take `&self`, avoiding borrow
    /// conflicts during attribute and MRO scans.
    refcount: Cell<usize>,
    /// `None` while detached via `take_data`.
    data: Option<HeapData>,
}

/// The arena.
#[derive(Debug)]
pub struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    /// Recycled slots, consumed before the vector grows.
    free_list: Vec<HeapId>,
    /// Per-slot reuse counters so `id()` stays distinct across reuse.
    generations: Vec<u32>,
    tracker: T,
    /// Singleton `()`; empty tuples are identical.
    empty_tuple_id: Option<HeapId>,
    /// Lazily created class object for `object`.
    object_class: Option<HeapId>,
    /// Lazily created class objects for builtin exception classes.
    exc_class_ids: AHashMap<ExcType, HeapId>,
}

impl<T: ResourceTracker> Heap<T> {
    #[must_use]
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            generations: Vec::new(),
            tracker,
            empty_tuple_id: None,
            object_class: None,
            exc_class_ids: AHashMap::new(),
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a slot with refcount 1.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let entry = HeapValue {
            refcount: Cell::new(1),
            data: Some(data),
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.generations[id.index()] = self.generations[id.index()].wrapping_add(1);
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            self.generations.push(0);
            id
        };
        Ok(id)
    }

    /// The singleton empty tuple, with its count bumped for the caller.
    pub fn empty_tuple(&mut self) -> Result<HeapId, ResourceError> {
        if let Some(id) = self.empty_tuple_id {
            self.inc_ref(id);
            return Ok(id);
        }
        let id = self.allocate(HeapData::Tuple(Tuple::default()))?;
        self.empty_tuple_id = Some(id);
        // One extra reference keeps the singleton alive for the heap's life.
        self.inc_ref(id);
        Ok(id)
    }

    /// Increments a slot's reference count.
    ///
    /// # Panics
    /// Panics on a freed or missing slot.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Decrements a slot's count, freeing it (and children) at zero.
    ///
    /// # Panics
    /// Panics on a freed or missing slot.
    pub fn dec_ref(&mut self, id: HeapId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.get();
            if count > 1 {
                entry.refcount.set(count - 1);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        self.free_list.push(id);
        if let Some(data) = value.data {
            self.tracker.on_free(|| data.estimate_size());
            let mut child_ids = Vec::new();
            data.collect_refs(&mut child_ids);
            drop(data);
            for child in child_ids {
                self.dec_ref(child);
            }
        }
    }

    /// Immutable access to a slot's data.
    ///
    /// # Panics
    /// Panics on a freed slot or while the data is detached.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
            .as_ref()
            .expect("Heap::get: data currently detached")
    }

    /// Mutable access to a slot's data.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
            .as_mut()
            .expect("Heap::get_mut: data currently detached")
    }

    /// Detaches a slot's data for heap-coupled mutation.
    pub fn take_data(&mut self, id: HeapId) -> HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::take_data: slot missing")
            .as_mut()
            .expect("Heap::take_data: object already freed")
            .data
            .take()
            .expect("Heap::take_data: data already detached")
    }

    /// Reattaches data detached by [`Heap::take_data`].
    pub fn restore_data(&mut self, id: HeapId, data: HeapData) {
        let slot = self
            .entries
            .get_mut(id.index())
            .expect("Heap::restore_data: slot missing")
            .as_mut()
            .expect("Heap::restore_data: object already freed");
        debug_assert!(slot.data.is_none(), "Heap::restore_data: slot not detached");
        slot.data = Some(data);
    }

    /// Stable identity for `id()`: slot index tagged with its generation.
    #[must_use]
    pub fn object_id(&self, id: HeapId) -> i64 {
        let generation = u64::from(self.generations[id.index()]);
        ((generation << 48) | id.index() as u64) as i64
    }

    /// Current refcount (test support).
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount.get())
    }

    /// Number of live slots (test support).
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// The class object for `object`, root of every MRO.
    pub fn object_class_id(&mut self) -> RunResult<HeapId> {
        if let Some(id) = self.object_class {
            self.inc_ref(id);
            return Ok(id);
        }
        let id = self.allocate(HeapData::Class(ClassObject {
            name: StringId::from(StaticStrings::Object),
            bases: Vec::new(),
            mro: Vec::new(),
            members: indexmap::IndexMap::new(),
            slots: None,
            exc_base: None,
        }))?;
        if let HeapData::Class(cls) = self.get_mut(id) {
            cls.mro = vec![id];
        }
        self.object_class = Some(id);
        // Pinned for the heap's life.
        self.inc_ref(id);
        Ok(id)
    }

    /// The synthesized class object for a builtin exception class.
    ///
    /// Built on demand when user code subclasses (or introspects) a
    /// builtin exception; the MRO embeds the [`ExcType`] parent chain and
    /// terminates at `object`.
    pub fn exc_class_id(&mut self, exc: ExcType, interns: &mut Interns) -> RunResult<HeapId> {
        if let Some(&id) = self.exc_class_ids.get(&exc) {
            self.inc_ref(id);
            return Ok(id);
        }
        let parent_id = match exc.parent() {
            Some(parent) => Some(self.exc_class_id(parent, interns)?),
            None => None,
        };
        let object_id = self.object_class_id()?;
        let name = interns.intern(exc.name());
        let mut mro = vec![];
        let bases = match parent_id {
            Some(pid) => {
                if let HeapData::Class(parent_cls) = self.get(pid) {
                    mro.extend(parent_cls.mro.iter().copied());
                }
                vec![pid]
            }
            None => {
                mro.push(object_id);
                Vec::new()
            }
        };
        let id = self.allocate(HeapData::Class(ClassObject {
            name,
            bases,
            mro: Vec::new(),
            members: indexmap::IndexMap::new(),
            slots: None,
            exc_base: Some(exc),
        }))?;
        let mut full_mro = vec![id];
        full_mro.extend(mro);
        if let HeapData::Class(cls) = self.get_mut(id) {
            cls.mro = full_mro;
        }
        self.exc_class_ids.insert(exc, id);
        // Pinned for the heap's life.
        self.inc_ref(id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn refcounting_frees_and_recycles_slots() {
        let mut heap = Heap::new(NoLimitTracker);
        let id = heap.allocate(HeapData::Str(Str::from("hello"))).unwrap();
        assert_eq!(heap.refcount(id), 1);
        heap.inc_ref(id);
        heap.dec_ref(id);
        assert_eq!(heap.refcount(id), 1);
        heap.dec_ref(id);
        assert_eq!(heap.refcount(id), 0);

        let reused = heap.allocate(HeapData::Str(Str::from("again"))).unwrap();
        assert_eq!(reused, id, "freed slot is recycled");
    }

    #[test]
    fn freeing_a_container_releases_children() {
        let mut heap = Heap::new(NoLimitTracker);
        let child = heap.allocate(HeapData::Str(Str::from("x"))).unwrap();
        let list = heap
            .allocate(HeapData::List(List::from(vec![Value::Ref(child)])))
            .unwrap();
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(list);
        assert_eq!(heap.refcount(child), 0);
    }

    #[test]
    fn object_ids_stay_distinct_across_reuse() {
        let mut heap = Heap::new(NoLimitTracker);
        let a = heap.allocate(HeapData::Str(Str::from("a"))).unwrap();
        let first_id = heap.object_id(a);
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str(Str::from("b"))).unwrap();
        assert_eq!(a, b);
        assert_ne!(first_id, heap.object_id(b));
    }

    #[test]
    fn exception_class_mro_reaches_object() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut interns = Interns::new();
        let id = heap.exc_class_id(ExcType::KeyError, &mut interns).unwrap();
        let HeapData::Class(cls) = heap.get(id) else {
            panic!("expected class");
        };
        assert_eq!(cls.exc_base, Some(ExcType::KeyError));
        // KeyError -> LookupError -> Exception -> BaseException -> object
        assert_eq!(cls.mro.len(), 5);
        let object_id = *cls.mro.last().unwrap();
        let HeapData::Class(root) = heap.get(object_id) else {
            panic!("expected object class");
        };
        assert!(root.exc_base.is_none());
    }
}
