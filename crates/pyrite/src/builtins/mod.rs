//! The built-in kernel.
//!
//! `Builtins` is the immediate value behind every native callable: kernel
//! functions, type constructors, exception classes, container methods,
//! and embedder-registered natives. The kernel implements only what the
//! language semantics require; everything else belongs to embedder
//! modules.

mod methods;

use std::{borrow::Cow, sync::Arc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    args::ArgValues,
    bytecode::vm::Vm,
    except::{ExcInstance, ExcPayload, ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{Interns, StaticStrings, StringId},
    io::PrintWriter,
    object::Object,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{
        ClassObject, Dict, GenState, Instance, Iter, List, Range, Set, SetStorage, Slice, SuperProxy, Tuple, Type,
        class::compute_c3_mro,
        function::Property,
        userdata::{self, MetaTypeId},
    },
    value::Value,
};

/// An embedder-registered native function.
///
/// Natives speak boundary values; errors they return are classified by
/// the foreign-error rules (longest-prefix match against exception class
/// names, `RuntimeError` otherwise).
pub type NativeFn = Arc<dyn Fn(&[Object], &[(String, Object)]) -> Result<Object, String> + Send + Sync>;

/// Every native callable shape, kept `Copy` so it fits in an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtins {
    /// A kernel function.
    Fn(BuiltinFn),
    /// A builtin method bound at attribute-lookup time.
    Method(MethodFn),
    /// A builtin exception class.
    ExcClass(ExcType),
    /// A builtin type used as constructor and isinstance target.
    TypeCtor(Type),
    /// The root `object` class.
    ObjectClass,
    /// An embedder-registered native, by registry index.
    Native(u32),
    /// A userdata method, addressed through the metatable index.
    UserMethod { type_id: MetaTypeId, index: u16 },
}

impl Builtins {
    #[must_use]
    pub fn py_type(self) -> Type {
        match self {
            Self::ExcClass(_) | Self::TypeCtor(_) | Self::ObjectClass => Type::Class,
            _ => Type::BuiltinFunction,
        }
    }

    /// Stable tag for identity hashing of builtin values.
    #[must_use]
    pub fn stable_tag(self) -> i64 {
        match self {
            Self::Fn(f) => 0x1_0000 + f as i64,
            Self::Method(m) => 0x2_0000 + m as i64,
            Self::ExcClass(e) => 0x3_0000 + e as i64,
            Self::TypeCtor(t) => 0x4_0000 + t as i64,
            Self::ObjectClass => 0x5_0000,
            Self::Native(i) => 0x6_0000 + i64::from(i),
            Self::UserMethod { type_id, index } => {
                0x7_0000 + (i64::from(index) << 24) + i64::from(type_id_raw(type_id))
            }
        }
    }

    /// Writes the repr of this builtin value.
    pub fn repr_into(self, out: &mut String) {
        use std::fmt::Write as _;
        match self {
            Self::Fn(f) => {
                let _ = write!(out, "<built-in function {}>", f.name());
            }
            Self::Method(m) => {
                let _ = write!(out, "<built-in method {m:?}>");
            }
            Self::ExcClass(e) => {
                let _ = write!(out, "<class '{}'>", e.name());
            }
            Self::TypeCtor(t) => {
                let _ = write!(out, "<class '{t}'>");
            }
            Self::ObjectClass => out.push_str("<class 'object'>"),
            Self::Native(i) => {
                let _ = write!(out, "<native function #{i}>");
            }
            Self::UserMethod { .. } => out.push_str("<userdata method>"),
        }
    }
}

fn type_id_raw(id: MetaTypeId) -> u32 {
    // MetaTypeId is a plain index; hashing only needs stability.
    let formatted = format!("{id:?}");
    formatted.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)))
}

/// Kernel functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFn {
    Print,
    Len,
    Repr,
    Hash,
    Id,
    Iter,
    Next,
    Isinstance,
    Issubclass,
    Getattr,
    Setattr,
    Hasattr,
    Delattr,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Map,
    Filter,
    Any,
    All,
    Ord,
    Chr,
    Divmod,
    Pow,
    Round,
    Callable,
    Super,
    Property,
    Classmethod,
    Staticmethod,
    Vars,
    Globals,
    Type,
    BuildClass,
}

impl BuiltinFn {
    /// The name exposed in the builtins namespace (empty = internal).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Len => "len",
            Self::Repr => "repr",
            Self::Hash => "hash",
            Self::Id => "id",
            Self::Iter => "iter",
            Self::Next => "next",
            Self::Isinstance => "isinstance",
            Self::Issubclass => "issubclass",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Hasattr => "hasattr",
            Self::Delattr => "delattr",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::Enumerate => "enumerate",
            Self::Zip => "zip",
            Self::Map => "map",
            Self::Filter => "filter",
            Self::Any => "any",
            Self::All => "all",
            Self::Ord => "ord",
            Self::Chr => "chr",
            Self::Divmod => "divmod",
            Self::Pow => "pow",
            Self::Round => "round",
            Self::Callable => "callable",
            Self::Super => "super",
            Self::Property => "property",
            Self::Classmethod => "classmethod",
            Self::Staticmethod => "staticmethod",
            Self::Vars => "vars",
            Self::Globals => "globals",
            Self::Type => "type",
            Self::BuildClass => "__build_class__",
        }
    }
}

/// Builtin methods reached through attribute lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFn {
    ListAppend,
    ListExtend,
    ListPop,
    ListInsert,
    ListRemove,
    DictGet,
    DictKeys,
    DictValues,
    DictItems,
    DictPop,
    DictSetdefault,
    DictUpdate,
    SetAdd,
    SetRemove,
    SetDiscard,
    StrJoin,
    StrSplit,
    StrUpper,
    StrLower,
    StrStrip,
    StrStartswith,
    StrEndswith,
    StrFind,
    StrReplace,
    GenSend,
    GenThrow,
    GenClose,
    GenNext,
    ExcAddNote,
}

const KERNEL_FNS: &[BuiltinFn] = &[
    BuiltinFn::Print,
    BuiltinFn::Len,
    BuiltinFn::Repr,
    BuiltinFn::Hash,
    BuiltinFn::Id,
    BuiltinFn::Iter,
    BuiltinFn::Next,
    BuiltinFn::Isinstance,
    BuiltinFn::Issubclass,
    BuiltinFn::Getattr,
    BuiltinFn::Setattr,
    BuiltinFn::Hasattr,
    BuiltinFn::Delattr,
    BuiltinFn::Abs,
    BuiltinFn::Min,
    BuiltinFn::Max,
    BuiltinFn::Sum,
    BuiltinFn::Sorted,
    BuiltinFn::Reversed,
    BuiltinFn::Enumerate,
    BuiltinFn::Zip,
    BuiltinFn::Map,
    BuiltinFn::Filter,
    BuiltinFn::Any,
    BuiltinFn::All,
    BuiltinFn::Ord,
    BuiltinFn::Chr,
    BuiltinFn::Divmod,
    BuiltinFn::Pow,
    BuiltinFn::Round,
    BuiltinFn::Callable,
    BuiltinFn::Super,
    BuiltinFn::Property,
    BuiltinFn::Classmethod,
    BuiltinFn::Staticmethod,
    BuiltinFn::Vars,
    BuiltinFn::Globals,
    BuiltinFn::Type,
    BuiltinFn::BuildClass,
];

const TYPE_CTORS: &[(&str, Type)] = &[
    ("int", Type::Int),
    ("float", Type::Float),
    ("bool", Type::Bool),
    ("complex", Type::Complex),
    ("str", Type::Str),
    ("bytes", Type::Bytes),
    ("list", Type::List),
    ("tuple", Type::Tuple),
    ("dict", Type::Dict),
    ("set", Type::Set),
    ("frozenset", Type::FrozenSet),
    ("range", Type::Range),
    ("slice", Type::Slice),
];

const EXPORTED_EXC_CLASSES: &[ExcType] = &[
    ExcType::BaseException,
    ExcType::Exception,
    ExcType::ExceptionGroup,
    ExcType::KeyboardInterrupt,
    ExcType::SystemExit,
    ExcType::GeneratorExit,
    ExcType::ArithmeticError,
    ExcType::ZeroDivisionError,
    ExcType::OverflowError,
    ExcType::LookupError,
    ExcType::IndexError,
    ExcType::KeyError,
    ExcType::RuntimeError,
    ExcType::NotImplementedError,
    ExcType::RecursionError,
    ExcType::AttributeError,
    ExcType::NameError,
    ExcType::UnboundLocalError,
    ExcType::ValueError,
    ExcType::TypeError,
    ExcType::AssertionError,
    ExcType::MemoryError,
    ExcType::StopIteration,
    ExcType::StopAsyncIteration,
    ExcType::TimeoutError,
    ExcType::ImportError,
    ExcType::ModuleNotFoundError,
    ExcType::OSError,
    ExcType::FileNotFoundError,
    ExcType::FileExistsError,
    ExcType::PermissionError,
    ExcType::IOError,
];

/// Builds the builtins namespace the engine resolves names against.
#[must_use]
pub fn kernel_namespace(interns: &mut Interns) -> AHashMap<StringId, Value> {
    let mut namespace = AHashMap::new();
    for &f in KERNEL_FNS {
        namespace.insert(interns.intern(f.name()), Value::Builtin(Builtins::Fn(f)));
    }
    for &(name, ty) in TYPE_CTORS {
        namespace.insert(interns.intern(name), Value::Builtin(Builtins::TypeCtor(ty)));
    }
    for &exc in EXPORTED_EXC_CLASSES {
        namespace.insert(interns.intern(exc.name()), Value::Builtin(Builtins::ExcClass(exc)));
    }
    namespace.insert(interns.intern("object"), Value::Builtin(Builtins::ObjectClass));
    namespace.insert(interns.intern("None"), Value::None);
    namespace.insert(interns.intern("True"), Value::Bool(true));
    namespace.insert(interns.intern("False"), Value::Bool(false));
    namespace.insert(interns.intern("Ellipsis"), Value::Ellipsis);
    namespace.insert(interns.intern("NotImplemented"), Value::NotImplemented);
    namespace
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'_, T, P, Tr> {
    /// Dispatches any builtin callable.
    pub(crate) fn call_builtin(&mut self, builtin: Builtins, args: ArgValues) -> RunResult<Value> {
        match builtin {
            Builtins::Fn(f) => self.call_kernel_fn(f, args),
            Builtins::Method(m) => self.call_method_fn(m, args),
            Builtins::ExcClass(exc_type) => self.construct_exception(exc_type, args),
            Builtins::TypeCtor(ty) => self.construct_type(ty, args),
            Builtins::ObjectClass => {
                args.check_zero("object", self.heap)?;
                let class_id = self.heap.object_class_id()?;
                let instance = {
                    let HeapData::Class(class) = self.heap.get(class_id) else { unreachable!() };
                    Instance::for_class(class_id, class)
                };
                let id = self.heap.allocate(HeapData::Instance(instance))?;
                Ok(Value::Ref(id))
            }
            Builtins::Native(index) => self.call_native(index, args),
            Builtins::UserMethod { type_id, index } => self.call_user_method(type_id, index, args),
        }
    }

    // ==================================================================
    // Kernel functions
    // ==================================================================

    fn call_kernel_fn(&mut self, f: BuiltinFn, args: ArgValues) -> RunResult<Value> {
        match f {
            BuiltinFn::Print => self.builtin_print(args),
            BuiltinFn::Len => {
                let value = args.get_one("len", self.heap)?;
                let result = self.value_len(&value);
                value.drop_with_heap(self.heap);
                Ok(Value::Int(result?))
            }
            BuiltinFn::Repr => {
                let value = args.get_one("repr", self.heap)?;
                let text = self.value_repr(&value);
                value.drop_with_heap(self.heap);
                self.make_str(text?)
            }
            BuiltinFn::Hash => {
                let value = args.get_one("hash", self.heap)?;
                let hash = self.value_hash(&value);
                value.drop_with_heap(self.heap);
                Ok(Value::Int(i64::from_ne_bytes(hash?.to_ne_bytes())))
            }
            BuiltinFn::Id => {
                let value = args.get_one("id", self.heap)?;
                let id = match &value {
                    Value::Ref(heap_id) => self.heap.object_id(*heap_id),
                    other => {
                        let hash = crate::value::py_hash(other, self.heap, self.interns)
                            .unwrap_or_default();
                        i64::from_ne_bytes(hash.to_ne_bytes())
                    }
                };
                value.drop_with_heap(self.heap);
                Ok(Value::Int(id))
            }
            BuiltinFn::Iter => {
                let value = args.get_one("iter", self.heap)?;
                self.get_iter_value(value)
            }
            BuiltinFn::Next => {
                let (iterator, default) = args.get_one_or_two("next", self.heap)?;
                self.builtin_next(iterator, default)
            }
            BuiltinFn::Isinstance => {
                let (value, class) = args.get_two("isinstance", self.heap)?;
                let result = self.isinstance_check(&value, &class);
                value.drop_with_heap(self.heap);
                class.drop_with_heap(self.heap);
                Ok(Value::Bool(result?))
            }
            BuiltinFn::Issubclass => {
                let (sub, class) = args.get_two("issubclass", self.heap)?;
                let result = self.issubclass_check(&sub, &class);
                sub.drop_with_heap(self.heap);
                class.drop_with_heap(self.heap);
                Ok(Value::Bool(result?))
            }
            BuiltinFn::Getattr => {
                let (obj, name, default) = args.get_up_to_three("getattr", self.heap)?;
                let Some(name) = name else {
                    obj.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("getattr", 2, 1));
                };
                let name_id = self.attr_name_id(&name)?;
                name.drop_with_heap(self.heap);
                let result = self.getattr_value(&obj, name_id);
                obj.drop_with_heap(self.heap);
                match result {
                    Ok(value) => {
                        if let Some(default) = default {
                            default.drop_with_heap(self.heap);
                        }
                        Ok(value)
                    }
                    Err(err) if err.is_exception_type(ExcType::AttributeError) && default.is_some() => {
                        Ok(default.expect("checked above"))
                    }
                    Err(err) => {
                        if let Some(default) = default {
                            default.drop_with_heap(self.heap);
                        }
                        Err(err)
                    }
                }
            }
            BuiltinFn::Setattr => {
                let (obj, name, value) = args.get_up_to_three("setattr", self.heap)?;
                let (Some(name), Some(value)) = (name, value) else {
                    obj.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("setattr", 3, 1));
                };
                let name_id = self.attr_name_id(&name)?;
                name.drop_with_heap(self.heap);
                let result = self.setattr_value(&obj, name_id, value);
                obj.drop_with_heap(self.heap);
                result.map(|()| Value::None)
            }
            BuiltinFn::Hasattr => {
                let (obj, name) = args.get_two("hasattr", self.heap)?;
                let name_id = self.attr_name_id(&name)?;
                name.drop_with_heap(self.heap);
                let result = self.getattr_value(&obj, name_id);
                obj.drop_with_heap(self.heap);
                match result {
                    Ok(value) => {
                        value.drop_with_heap(self.heap);
                        Ok(Value::Bool(true))
                    }
                    Err(err) if err.is_exception_type(ExcType::AttributeError) => Ok(Value::Bool(false)),
                    Err(err) => Err(err),
                }
            }
            BuiltinFn::Delattr => {
                let (obj, name) = args.get_two("delattr", self.heap)?;
                let name_id = self.attr_name_id(&name)?;
                name.drop_with_heap(self.heap);
                let result = self.delattr_via(&obj, name_id);
                obj.drop_with_heap(self.heap);
                result.map(|()| Value::None)
            }
            BuiltinFn::Abs => {
                let value = args.get_one("abs", self.heap)?;
                match &value {
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Int(i) => i
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| ExcType::overflow_error("integer absolute value overflows 64 bits")),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    Value::Ref(id) => {
                        if let HeapData::Complex(c) = self.heap.get(*id) {
                            let magnitude = c.real.hypot(c.imag);
                            value.drop_with_heap(self.heap);
                            return Ok(Value::Float(magnitude));
                        }
                        let message = ExcType::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            value.type_name(self.heap, self.interns)
                        ));
                        value.drop_with_heap(self.heap);
                        Err(message)
                    }
                    _ => {
                        let message = ExcType::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            value.type_name(self.heap, self.interns)
                        ));
                        value.drop_with_heap(self.heap);
                        Err(message)
                    }
                }
            }
            BuiltinFn::Min => self.builtin_min_max(args, true),
            BuiltinFn::Max => self.builtin_min_max(args, false),
            BuiltinFn::Sum => {
                let (iterable, start) = args.get_one_or_two("sum", self.heap)?;
                let items = self.collect_iterable(iterable)?;
                let mut total = start.unwrap_or(Value::Int(0));
                for item in items {
                    total = self.binary_values(total, item, crate::bytecode::vm::BinOp::Add, false)?;
                }
                Ok(total)
            }
            BuiltinFn::Sorted => {
                let iterable = args.get_one("sorted", self.heap)?;
                let mut items = self.collect_iterable(iterable)?;
                self.sort_values(&mut items)?;
                let id = self.heap.allocate(HeapData::List(List::from(items)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Reversed => {
                let iterable = args.get_one("reversed", self.heap)?;
                let mut items = self.collect_iterable(iterable)?;
                items.reverse();
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(items)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Enumerate => {
                let (iterable, start) = args.get_one_or_two("enumerate", self.heap)?;
                let start = match start {
                    Some(value) => value
                        .as_int()
                        .ok_or_else(|| ExcType::type_error("enumerate() start must be an int"))?,
                    None => 0,
                };
                let items = self.collect_iterable(iterable)?;
                let mut pairs = Vec::with_capacity(items.len());
                for (offset, item) in items.into_iter().enumerate() {
                    let pair_id = self
                        .heap
                        .allocate(HeapData::Tuple(Tuple::from(vec![Value::Int(start + offset as i64), item])))?;
                    pairs.push(Value::Ref(pair_id));
                }
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(pairs)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Zip => {
                let (positional, kwargs) = args.into_parts();
                for (_, value) in kwargs {
                    value.drop_with_heap(self.heap);
                }
                let mut columns = Vec::with_capacity(positional.len());
                for iterable in positional {
                    columns.push(self.collect_iterable(iterable)?);
                }
                let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut rows = Vec::with_capacity(shortest);
                for row_index in 0..shortest {
                    let mut row = Vec::with_capacity(columns.len());
                    for column in &columns {
                        row.push(column[row_index].clone_with_heap(self.heap));
                    }
                    let row_id = self.heap.allocate(HeapData::Tuple(Tuple::from(row)))?;
                    rows.push(Value::Ref(row_id));
                }
                for column in columns {
                    for value in column {
                        value.drop_with_heap(self.heap);
                    }
                }
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(rows)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Map => {
                let (func, iterable) = args.get_two("map", self.heap)?;
                let items = self.collect_iterable(iterable)?;
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    let callee = func.clone_with_heap(self.heap);
                    mapped.push(self.call_to_completion(callee, ArgValues::One(item))?);
                }
                func.drop_with_heap(self.heap);
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(mapped)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Filter => {
                let (func, iterable) = args.get_two("filter", self.heap)?;
                let items = self.collect_iterable(iterable)?;
                let mut kept = Vec::new();
                for item in items {
                    let keep = if matches!(func, Value::None) {
                        self.value_truth(&item)?
                    } else {
                        let callee = func.clone_with_heap(self.heap);
                        let probe = item.clone_with_heap(self.heap);
                        let verdict = self.call_to_completion(callee, ArgValues::One(probe))?;
                        let keep = self.value_truth(&verdict)?;
                        verdict.drop_with_heap(self.heap);
                        keep
                    };
                    if keep {
                        kept.push(item);
                    } else {
                        item.drop_with_heap(self.heap);
                    }
                }
                func.drop_with_heap(self.heap);
                let id = self.heap.allocate(HeapData::Iter(Iter::from_items(kept)))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Any | BuiltinFn::All => {
                let want_any = f == BuiltinFn::Any;
                let iterable = args.get_one(if want_any { "any" } else { "all" }, self.heap)?;
                let items = self.collect_iterable(iterable)?;
                let mut verdict = !want_any;
                for item in items {
                    let truth = self.value_truth(&item)?;
                    item.drop_with_heap(self.heap);
                    if truth == want_any {
                        verdict = want_any;
                        // Remaining items still need releasing, so no break
                        // shortcut here; the list is already materialized.
                    }
                }
                Ok(Value::Bool(verdict))
            }
            BuiltinFn::Ord => {
                let value = args.get_one("ord", self.heap)?;
                let result = match value.as_str(self.heap, self.interns) {
                    Some(s) => {
                        let mut chars = s.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => Ok(Value::Int(i64::from(c as u32))),
                            _ => Err(ExcType::type_error("ord() expected a character")),
                        }
                    }
                    None => Err(ExcType::type_error("ord() expected string of length 1")),
                };
                value.drop_with_heap(self.heap);
                result
            }
            BuiltinFn::Chr => {
                let value = args.get_one("chr", self.heap)?;
                let n = value
                    .as_int()
                    .ok_or_else(|| ExcType::type_error("an integer is required"))?;
                value.drop_with_heap(self.heap);
                let c = u32::try_from(n)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ExcType::value_error("chr() arg not in range(0x110000)"))?;
                self.make_str(c.to_string())
            }
            BuiltinFn::Divmod => {
                let (a, b) = args.get_two("divmod", self.heap)?;
                let quotient = self.binary_values(
                    a.clone_with_heap(self.heap),
                    b.clone_with_heap(self.heap),
                    crate::bytecode::vm::BinOp::FloorDiv,
                    false,
                )?;
                let remainder = self.binary_values(a, b, crate::bytecode::vm::BinOp::Mod, false)?;
                let id = self
                    .heap
                    .allocate(HeapData::Tuple(Tuple::from(vec![quotient, remainder])))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Pow => {
                let (base, exp, modulus) = args.get_up_to_three("pow", self.heap)?;
                let Some(exp) = exp else {
                    base.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("pow", 2, 1));
                };
                match modulus {
                    None => self.binary_values(base, exp, crate::bytecode::vm::BinOp::Pow, false),
                    Some(modulus) => {
                        let (Some(b), Some(e), Some(m)) = (base.as_int(), exp.as_int(), modulus.as_int()) else {
                            base.drop_with_heap(self.heap);
                            exp.drop_with_heap(self.heap);
                            modulus.drop_with_heap(self.heap);
                            return Err(ExcType::type_error("pow() 3rd argument requires integers"));
                        };
                        if m == 0 {
                            return Err(ExcType::value_error("pow() 3rd argument cannot be 0"));
                        }
                        if e < 0 {
                            return Err(ExcType::value_error(
                                "pow() 2nd argument cannot be negative when 3rd argument specified",
                            ));
                        }
                        Ok(Value::Int(mod_pow(b, e, m)))
                    }
                }
            }
            BuiltinFn::Round => {
                let (value, digits) = args.get_one_or_two("round", self.heap)?;
                let digits = match digits {
                    Some(d) => Some(d.as_int().ok_or_else(|| ExcType::type_error("round() digits must be an int"))?),
                    None => None,
                };
                match &value {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Float(v) => match digits {
                        None => {
                            // Banker's rounding to the nearest integer.
                            let rounded = round_half_even(*v);
                            Ok(Value::Int(rounded as i64))
                        }
                        Some(digits) => {
                            let factor = 10f64.powi(digits.clamp(-300, 300) as i32);
                            Ok(Value::Float(round_half_even(v * factor) / factor))
                        }
                    },
                    _ => {
                        let message = ExcType::type_error(format!(
                            "type {} doesn't define __round__ method",
                            value.type_name(self.heap, self.interns)
                        ));
                        value.drop_with_heap(self.heap);
                        Err(message)
                    }
                }
            }
            BuiltinFn::Callable => {
                let value = args.get_one("callable", self.heap)?;
                let callable = match &value {
                    Value::Builtin(_) => true,
                    Value::Ref(id) => matches!(
                        self.heap.get(*id),
                        HeapData::Function(_) | HeapData::BoundMethod(_) | HeapData::Class(_)
                    ) || matches!(self.heap.get(*id), HeapData::Instance(_))
                        && self
                            .class_of_instance(*id)
                            .is_some_and(|cid| self.class_has_member(cid, StaticStrings::DunderCall.into())),
                    _ => false,
                };
                value.drop_with_heap(self.heap);
                Ok(Value::Bool(callable))
            }
            BuiltinFn::Super => self.builtin_super(args),
            BuiltinFn::Property => {
                let (getter, setter, deleter) = match args {
                    ArgValues::Empty => (None, None, None),
                    other => {
                        let (g, s, d) = other.get_up_to_three("property", self.heap)?;
                        (Some(g), s, d)
                    }
                };
                let property = Property {
                    getter,
                    setter,
                    deleter,
                    doc: None,
                };
                let id = self.heap.allocate(HeapData::Property(property))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Classmethod => {
                let func = args.get_one("classmethod", self.heap)?;
                let id = self.heap.allocate(HeapData::ClassMethod(func))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Staticmethod => {
                let func = args.get_one("staticmethod", self.heap)?;
                let id = self.heap.allocate(HeapData::StaticMethod(func))?;
                Ok(Value::Ref(id))
            }
            BuiltinFn::Vars => {
                let value = args.get_one("vars", self.heap)?;
                let entries: Vec<(StringId, Value)> = match &value {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Instance(instance) => instance
                            .attrs
                            .as_ref()
                            .map(|attrs| {
                                attrs
                                    .iter()
                                    .map(|(k, v)| (*k, v.clone_with_heap(self.heap)))
                                    .collect()
                            })
                            .unwrap_or_default(),
                        HeapData::Module(module) => module
                            .namespace
                            .iter()
                            .map(|(k, v)| (*k, v.clone_with_heap(self.heap)))
                            .collect(),
                        _ => {
                            let message = ExcType::type_error("vars() argument must have __dict__ attribute");
                            value.drop_with_heap(self.heap);
                            return Err(message);
                        }
                    },
                    _ => {
                        let message = ExcType::type_error("vars() argument must have __dict__ attribute");
                        value.drop_with_heap(self.heap);
                        return Err(message);
                    }
                };
                value.drop_with_heap(self.heap);
                self.namespace_to_dict(entries)
            }
            BuiltinFn::Globals => {
                args.check_zero("globals", self.heap)?;
                let globals_id = self.frame().globals;
                let entries: Vec<(StringId, Value)> = {
                    let HeapData::Module(module) = self.heap.get(globals_id) else {
                        return Err(RunError::internal("frame globals is not a module"));
                    };
                    module
                        .namespace
                        .iter()
                        .map(|(k, v)| (*k, v.clone_with_heap(self.heap)))
                        .collect()
                };
                self.namespace_to_dict(entries)
            }
            BuiltinFn::Type => {
                let value = args.get_one("type", self.heap)?;
                let result = match &value {
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Instance(instance) => {
                            let class_id = instance.class_id;
                            self.heap.inc_ref(class_id);
                            Value::Ref(class_id)
                        }
                        other => Value::Builtin(Builtins::TypeCtor(other.py_type())),
                    },
                    other => Value::Builtin(Builtins::TypeCtor(other.py_type(self.heap))),
                };
                value.drop_with_heap(self.heap);
                Ok(result)
            }
            BuiltinFn::BuildClass => self.builtin_build_class(args),
        }
    }

    fn namespace_to_dict(&mut self, entries: Vec<(StringId, Value)>) -> RunResult<Value> {
        let mut dict = Dict::with_capacity(entries.len());
        for (name, value) in entries {
            self.dict_raw_insert(&mut dict, Value::InternString(name), value)?;
        }
        let id = self.heap.allocate(HeapData::Dict(dict))?;
        Ok(Value::Ref(id))
    }

    fn attr_name_id(&mut self, name: &Value) -> RunResult<StringId> {
        match name {
            Value::InternString(id) => Ok(*id),
            Value::Ref(id) => {
                if let HeapData::Str(s) = self.heap.get(*id) {
                    let text = s.as_str().to_owned();
                    return Ok(self.interns.intern(&text));
                }
                Err(ExcType::type_error("attribute name must be string"))
            }
            _ => Err(ExcType::type_error("attribute name must be string")),
        }
    }

    fn delattr_via(&mut self, obj: &Value, name: StringId) -> RunResult<()> {
        // delattr() routes through the same machinery as the DeleteAttr
        // opcode; stage the operands on the stack for symmetry.
        self.push(obj.clone_with_heap(self.heap));
        self.op_delete_attr(name)
    }

    fn builtin_print(&mut self, args: ArgValues) -> RunResult<Value> {
        let (positional, kwargs) = args.into_parts();
        let mut sep = Cow::Borrowed(" ");
        let mut end = Cow::Borrowed("\n");
        for (name, value) in kwargs {
            let key = self.interns.get_str(name).to_owned();
            match key.as_str() {
                "sep" => {
                    if let Some(s) = value.as_str(self.heap, self.interns) {
                        sep = Cow::Owned(s.to_owned());
                    }
                    value.drop_with_heap(self.heap);
                }
                "end" => {
                    if let Some(s) = value.as_str(self.heap, self.interns) {
                        end = Cow::Owned(s.to_owned());
                    }
                    value.drop_with_heap(self.heap);
                }
                _ => {
                    value.drop_with_heap(self.heap);
                    return Err(ExcType::type_error(format!(
                        "'{key}' is an invalid keyword argument for print()"
                    )));
                }
            }
        }
        for (index, value) in positional.iter().enumerate() {
            if index > 0 {
                for c in sep.chars() {
                    self.print_writer.stdout_push(c);
                }
            }
            let text = self.value_str(value)?;
            self.print_writer.stdout_write(Cow::Owned(text));
        }
        for value in positional {
            value.drop_with_heap(self.heap);
        }
        for c in end.chars() {
            self.print_writer.stdout_push(c);
        }
        Ok(Value::None)
    }

    fn builtin_next(&mut self, iterator: Value, default: Option<Value>) -> RunResult<Value> {
        let Value::Ref(iter_id) = &iterator else {
            let message = ExcType::type_error(format!(
                "'{}' object is not an iterator",
                iterator.type_name(self.heap, self.interns)
            ));
            iterator.drop_with_heap(self.heap);
            if let Some(default) = default {
                default.drop_with_heap(self.heap);
            }
            return Err(message);
        };
        let iter_id = *iter_id;

        let outcome = match self.heap.get(iter_id) {
            HeapData::Generator(generator) => {
                if generator.state == GenState::Closed {
                    Ok(None)
                } else {
                    match self.resume_generator(iter_id, crate::bytecode::vm::ResumeWith::Send(Value::None)) {
                        Ok(crate::bytecode::vm::GenOutcome::Yielded(value)) => Ok(Some(value)),
                        Ok(crate::bytecode::vm::GenOutcome::Returned(value)) => {
                            if default.is_none() {
                                let err = self.stop_iteration_with_value(value);
                                iterator.drop_with_heap(self.heap);
                                return Err(err);
                            }
                            value.drop_with_heap(self.heap);
                            Ok(None)
                        }
                        Err(err) => Err(err),
                    }
                }
            }
            HeapData::Iter(_) => self.iter_next_by_id(iter_id),
            _ => {
                let message = ExcType::type_error(format!(
                    "'{}' object is not an iterator",
                    iterator.type_name(self.heap, self.interns)
                ));
                iterator.drop_with_heap(self.heap);
                if let Some(default) = default {
                    default.drop_with_heap(self.heap);
                }
                return Err(message);
            }
        };
        iterator.drop_with_heap(self.heap);
        match outcome {
            Ok(Some(value)) => {
                if let Some(default) = default {
                    default.drop_with_heap(self.heap);
                }
                Ok(value)
            }
            Ok(None) => match default {
                Some(default) => Ok(default),
                None => Err(ExcType::stop_iteration()),
            },
            Err(err) => {
                if let Some(default) = default {
                    default.drop_with_heap(self.heap);
                }
                Err(err)
            }
        }
    }

    fn builtin_min_max(&mut self, args: ArgValues, want_min: bool) -> RunResult<Value> {
        let name = if want_min { "min" } else { "max" };
        let (positional, kwargs) = args.into_parts();
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
        let items = match positional.len() {
            0 => return Err(ExcType::arg_count_error(name, 1, 0)),
            1 => {
                let mut iter = positional.into_iter();
                self.collect_iterable(iter.next().expect("len checked"))?
            }
            _ => positional,
        };
        if items.is_empty() {
            return Err(ExcType::value_error(format!("{name}() arg is an empty sequence")));
        }
        let mut best: Option<Value> = None;
        for item in items {
            match &best {
                None => best = Some(item),
                Some(current) => {
                    let ordering = crate::value::py_cmp(&item, current, self.heap, self.interns);
                    match ordering {
                        Ok(ordering) => {
                            let take = if want_min {
                                ordering == std::cmp::Ordering::Less
                            } else {
                                ordering == std::cmp::Ordering::Greater
                            };
                            if take {
                                let old = best.replace(item);
                                if let Some(old) = old {
                                    old.drop_with_heap(self.heap);
                                }
                            } else {
                                item.drop_with_heap(self.heap);
                            }
                        }
                        Err(err) => {
                            item.drop_with_heap(self.heap);
                            if let Some(best) = best {
                                best.drop_with_heap(self.heap);
                            }
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(best.expect("non-empty checked"))
    }

    /// Insertion sort driven by the runtime comparator, so comparison
    /// errors surface instead of panicking inside `sort_by`.
    pub(crate) fn sort_values(&mut self, items: &mut [Value]) -> RunResult<()> {
        for i in 1..items.len() {
            let mut j = i;
            while j > 0 {
                let ordering = crate::value::py_cmp(&items[j], &items[j - 1], self.heap, self.interns)?;
                if ordering == std::cmp::Ordering::Less {
                    items.swap(j, j - 1);
                    j -= 1;
                } else {
                    break;
                }
            }
        }
        Ok(())
    }

    fn builtin_super(&mut self, args: ArgValues) -> RunResult<Value> {
        let (start_class_value, receiver) = match args {
            ArgValues::Empty => {
                // Zero-argument form: the compiler injects a `__class__`
                // cell; the receiver is the first local.
                let class_cell = {
                    let frame = self.frame();
                    frame
                        .code
                        .cell_slot(StaticStrings::DunderClass.into())
                        .and_then(|slot| frame.cells.get(slot).copied())
                };
                let Some(cell_id) = class_cell else {
                    return Err(ExcType::type_error("super(): no __class__ cell found"));
                };
                let class_value = {
                    let HeapData::Cell(value) = self.heap.get(cell_id) else {
                        return Err(RunError::internal("cell slot does not hold a cell"));
                    };
                    value.clone_with_heap(self.heap)
                };
                let receiver = {
                    let frame = self.frame();
                    match frame.locals.first() {
                        Some(value) if !matches!(value, Value::Undefined) => value.clone_with_heap(self.heap),
                        _ => return Err(ExcType::type_error("super(): no arguments and no receiver")),
                    }
                };
                (class_value, receiver)
            }
            other => {
                let (class_value, receiver) = other.get_two("super", self.heap)?;
                (class_value, receiver)
            }
        };

        let Value::Ref(start_class_id) = &start_class_value else {
            start_class_value.drop_with_heap(self.heap);
            receiver.drop_with_heap(self.heap);
            return Err(ExcType::type_error("super(): argument 1 must be a class"));
        };
        let start_class_id = *start_class_id;

        // The scan runs over the receiver's own class MRO, starting just
        // past the class whose method called super().
        let receiver_class_id = match &receiver {
            Value::Ref(id) => self.class_of_instance(*id).or(Some(*id)),
            _ => None,
        };
        let Some(receiver_class_id) = receiver_class_id else {
            start_class_value.drop_with_heap(self.heap);
            receiver.drop_with_heap(self.heap);
            return Err(ExcType::type_error(
                "super(type, obj): obj must be an instance or subtype of type",
            ));
        };
        let mro_index = {
            let HeapData::Class(receiver_class) = self.heap.get(receiver_class_id) else {
                start_class_value.drop_with_heap(self.heap);
                receiver.drop_with_heap(self.heap);
                return Err(ExcType::type_error(
                    "super(type, obj): obj must be an instance or subtype of type",
                ));
            };
            let Some(position) = receiver_class.mro.iter().position(|&id| id == start_class_id) else {
                start_class_value.drop_with_heap(self.heap);
                receiver.drop_with_heap(self.heap);
                return Err(ExcType::type_error(
                    "super(type, obj): obj must be an instance or subtype of type",
                ));
            };
            position + 1
        };
        start_class_value.drop_with_heap(self.heap);

        self.heap.inc_ref(receiver_class_id);
        let proxy = SuperProxy {
            start_class: receiver_class_id,
            receiver,
            mro_index,
        };
        let id = self.heap.allocate(HeapData::Super(proxy))?;
        Ok(Value::Ref(id))
    }

    // ==================================================================
    // Class construction
    // ==================================================================

    /// `__build_class__(body, name, *bases)`.
    fn builtin_build_class(&mut self, args: ArgValues) -> RunResult<Value> {
        let (mut positional, kwargs) = args.into_parts();
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
        if positional.len() < 2 {
            for value in positional {
                value.drop_with_heap(self.heap);
            }
            return Err(ExcType::type_error("__build_class__: not enough arguments"));
        }
        let base_values: Vec<Value> = positional.split_off(2);
        let name_value = positional.pop().expect("len checked");
        let body = positional.pop().expect("len checked");

        let Some(class_name) = name_value.as_str(self.heap, self.interns).map(str::to_owned) else {
            name_value.drop_with_heap(self.heap);
            body.drop_with_heap(self.heap);
            for value in base_values {
                value.drop_with_heap(self.heap);
            }
            return Err(ExcType::type_error("__build_class__: name is not a string"));
        };
        name_value.drop_with_heap(self.heap);
        let name_id = self.interns.intern(&class_name);

        // Resolve bases to class objects. Each entry in `bases` owns one
        // counted reference, transferred from the argument or taken from
        // the lazily-built class for a builtin base.
        let mut bases = Vec::with_capacity(base_values.len());
        for base in base_values {
            let base_id = match base {
                Value::Ref(id) if matches!(self.heap.get(id), HeapData::Class(_)) => id,
                Value::Builtin(Builtins::ExcClass(exc_type)) => self.heap.exc_class_id(exc_type, self.interns)?,
                Value::Builtin(Builtins::ObjectClass) => self.heap.object_class_id()?,
                other => {
                    let message = ExcType::type_error(format!(
                        "class base must be a class, not '{}'",
                        other.type_name(self.heap, self.interns)
                    ));
                    other.drop_with_heap(self.heap);
                    body.drop_with_heap(self.heap);
                    for id in bases {
                        self.heap.dec_ref(id);
                    }
                    return Err(message);
                }
            };
            bases.push(base_id);
        }

        // Run the class body, collecting its namespace.
        let (members, class_cell) = self.run_class_body(body)?;

        // __slots__ declared in the body selects fixed-layout instances.
        // A bare string names a single slot; sequences name several.
        let raw_slots = members.get(&StringId::from(StaticStrings::DunderSlots)).map(|slots_value| {
            let mut names = Vec::new();
            let mut texts: Vec<String> = Vec::new();
            match slots_value {
                Value::InternString(name) => names.push(*name),
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Str(s) => texts.push(s.as_str().to_owned()),
                    HeapData::Tuple(tuple) => collect_slot_names(tuple.items(), self.heap, &mut names, &mut texts),
                    HeapData::List(list) => collect_slot_names(list.items(), self.heap, &mut names, &mut texts),
                    _ => {}
                },
                _ => {}
            }
            (names, texts)
        });
        let slots = raw_slots.map(|(mut names, texts)| {
            for text in texts {
                names.push(self.interns.intern(&text));
            }
            names
        });

        // Builtin exception ancestry propagates through the bases.
        let exc_base = bases.iter().find_map(|&base_id| match self.heap.get(base_id) {
            HeapData::Class(class) => class.exc_base,
            _ => None,
        });

        let class = ClassObject {
            name: name_id,
            bases: bases.clone(),
            mro: Vec::new(),
            members,
            slots,
            exc_base,
        };
        let class_id = self.heap.allocate(HeapData::Class(class))?;
        let mro = match compute_c3_mro(class_id, &bases, self.heap, self.interns) {
            Ok(mro) => mro,
            Err(err) => {
                self.heap.dec_ref(class_id);
                if let Some(cell_id) = class_cell {
                    self.heap.dec_ref(cell_id);
                }
                return Err(err);
            }
        };
        // Ancestors named only via the MRO are pinned by it.
        for &ancestor in &mro {
            if ancestor != class_id && !bases.contains(&ancestor) {
                self.heap.inc_ref(ancestor);
            }
        }
        let HeapData::Class(class) = self.heap.get_mut(class_id) else { unreachable!() };
        class.mro = mro;

        // Fill the zero-arg-super cell now that the class exists.
        if let Some(cell_id) = class_cell {
            self.heap.inc_ref(class_id);
            let HeapData::Cell(cell_value) = self.heap.get_mut(cell_id) else {
                return Err(RunError::internal("cell slot does not hold a cell"));
            };
            let old = std::mem::replace(cell_value, Value::Ref(class_id));
            old.drop_with_heap(self.heap);
            self.heap.dec_ref(cell_id);
        }

        Ok(Value::Ref(class_id))
    }

    /// Executes a class body function, returning its namespace and the
    /// `__class__` cell (if the body declares one).
    fn run_class_body(&mut self, body: Value) -> RunResult<(IndexMap<StringId, Value>, Option<HeapId>)> {
        let Value::Ref(func_id) = &body else {
            body.drop_with_heap(self.heap);
            return Err(ExcType::type_error("__build_class__: body is not a function"));
        };
        let func_id = *func_id;
        let (code, globals, name, closure) = {
            let HeapData::Function(function) = self.heap.get(func_id) else {
                body.drop_with_heap(self.heap);
                return Err(ExcType::type_error("__build_class__: body is not a function"));
            };
            (
                std::rc::Rc::clone(&function.code),
                function.globals,
                function.name,
                function.closure.clone(),
            )
        };

        self.heap.inc_ref(globals);
        let mut frame = crate::bytecode::vm::Frame::new(std::rc::Rc::clone(&code), self.stack.len(), globals, name);
        frame.cells = self.make_cells(&code)?;
        for &cell_id in &closure {
            self.heap.inc_ref(cell_id);
            frame.cells.push(cell_id);
        }
        frame.class_ns = Some(IndexMap::new());

        // Keep a handle on the __class__ cell across frame cleanup.
        let class_cell = code
            .cell_slot(StaticStrings::DunderClass.into())
            .and_then(|slot| frame.cells.get(slot).copied());
        if let Some(cell_id) = class_cell {
            self.heap.inc_ref(cell_id);
        }

        let floor = self.frames.len();
        self.push_frame(frame)?;
        let run_result = self.run_until(floor);
        body.drop_with_heap(self.heap);
        match run_result {
            Ok(crate::bytecode::vm::Finished::Returned(value)) => {
                value.drop_with_heap(self.heap);
                let ns = self
                    .take_captured_class_ns()
                    .ok_or_else(|| RunError::internal("class body left no namespace"))?;
                Ok((ns, class_cell))
            }
            Ok(crate::bytecode::vm::Finished::Yielded(_)) => {
                Err(RunError::internal("class body yielded"))
            }
            Err(err) => {
                if let Some(cell_id) = class_cell {
                    self.heap.dec_ref(cell_id);
                }
                if let Some(ns) = self.take_captured_class_ns() {
                    for (_, value) in ns {
                        value.drop_with_heap(self.heap);
                    }
                }
                Err(err)
            }
        }
    }

    // ==================================================================
    // Exception and type construction
    // ==================================================================

    fn construct_exception(&mut self, exc_type: ExcType, args: ArgValues) -> RunResult<Value> {
        let (positional, kwargs) = args.into_parts();
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
        if exc_type == ExcType::ExceptionGroup {
            return self.construct_exception_group(positional);
        }
        let mut payloads = Vec::with_capacity(positional.len());
        for value in positional {
            payloads.push(self.value_to_payload(&value));
            value.drop_with_heap(self.heap);
        }
        let mut exc = ExcInstance::new(exc_type);
        exc.message = match payloads.as_slice() {
            [] => None,
            [single] => Some(single.to_string()),
            many => Some(format!(
                "({})",
                many.iter().map(ExcPayload::to_string).collect::<Vec<_>>().join(", ")
            )),
        };
        exc.args = payloads;
        let id = self.heap.allocate(HeapData::Exception(exc))?;
        Ok(Value::Ref(id))
    }

    fn construct_exception_group(&mut self, mut positional: Vec<Value>) -> RunResult<Value> {
        if positional.len() != 2 {
            let count = positional.len();
            for value in positional {
                value.drop_with_heap(self.heap);
            }
            return Err(ExcType::arg_count_error("ExceptionGroup", 2, count));
        }
        let members_value = positional.pop().expect("len checked");
        let message_value = positional.pop().expect("len checked");
        let Some(message) = message_value.as_str(self.heap, self.interns).map(str::to_owned) else {
            message_value.drop_with_heap(self.heap);
            members_value.drop_with_heap(self.heap);
            return Err(ExcType::type_error("ExceptionGroup() argument 1 must be str"));
        };
        message_value.drop_with_heap(self.heap);

        let members = self.collect_iterable(members_value)?;
        let mut group = Vec::with_capacity(members.len());
        for member in members {
            match &member {
                Value::Ref(id) => {
                    if let HeapData::Exception(exc) = self.heap.get(*id) {
                        group.push(exc.clone());
                        member.drop_with_heap(self.heap);
                    } else {
                        member.drop_with_heap(self.heap);
                        return Err(ExcType::type_error("exceptions must derive from BaseException"));
                    }
                }
                _ => {
                    member.drop_with_heap(self.heap);
                    return Err(ExcType::type_error("exceptions must derive from BaseException"));
                }
            }
        }
        if group.is_empty() {
            return Err(ExcType::value_error("exception group must contain at least one exception"));
        }
        let exc = ExcInstance::group(message, group);
        let id = self.heap.allocate(HeapData::Exception(exc))?;
        Ok(Value::Ref(id))
    }

    pub(crate) fn value_to_payload(&self, value: &Value) -> ExcPayload {
        match value {
            Value::None => ExcPayload::None,
            Value::Bool(b) => ExcPayload::Bool(*b),
            Value::Int(i) => ExcPayload::Int(*i),
            Value::Float(f) => ExcPayload::Float(*f),
            other => ExcPayload::Str(crate::value::py_str(other, self.heap, self.interns)),
        }
    }

    fn construct_type(&mut self, ty: Type, args: ArgValues) -> RunResult<Value> {
        match ty {
            Type::Int => {
                let (value, base) = match args {
                    ArgValues::Empty => return Ok(Value::Int(0)),
                    other => other.get_one_or_two("int", self.heap)?,
                };
                if let Some(base) = base {
                    let Some(base) = base.as_int() else {
                        base.drop_with_heap(self.heap);
                        value.drop_with_heap(self.heap);
                        return Err(ExcType::type_error("int() base must be an integer"));
                    };
                    let Some(text) = value.as_str(self.heap, self.interns).map(str::to_owned) else {
                        value.drop_with_heap(self.heap);
                        return Err(ExcType::type_error("int() can't convert non-string with explicit base"));
                    };
                    value.drop_with_heap(self.heap);
                    let base = u32::try_from(base)
                        .ok()
                        .filter(|b| (2..=36).contains(b))
                        .ok_or_else(|| ExcType::value_error("int() base must be >= 2 and <= 36"))?;
                    return i64::from_str_radix(text.trim(), base)
                        .map(Value::Int)
                        .map_err(|_| ExcType::value_error(format!("invalid literal for int() with base {base}: '{text}'")));
                }
                match &value {
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Int(i) => Ok(Value::Int(*i)),
                    Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                    _ => {
                        if let Some(text) = value.as_str(self.heap, self.interns) {
                            let trimmed = text.trim().to_owned();
                            value.drop_with_heap(self.heap);
                            return trimmed
                                .parse::<i64>()
                                .map(Value::Int)
                                .map_err(|_| ExcType::value_error(format!("invalid literal for int() with base 10: '{trimmed}'")));
                        }
                        let message = ExcType::type_error(format!(
                            "int() argument must be a string or a real number, not '{}'",
                            value.type_name(self.heap, self.interns)
                        ));
                        value.drop_with_heap(self.heap);
                        Err(message)
                    }
                }
            }
            Type::Float => {
                let value = match args {
                    ArgValues::Empty => return Ok(Value::Float(0.0)),
                    other => other.get_one("float", self.heap)?,
                };
                match &value {
                    Value::Bool(b) => Ok(Value::Float(f64::from(u8::from(*b)))),
                    Value::Int(i) => Ok(Value::Float(*i as f64)),
                    Value::Float(f) => Ok(Value::Float(*f)),
                    _ => {
                        if let Some(text) = value.as_str(self.heap, self.interns) {
                            let trimmed = text.trim().to_owned();
                            value.drop_with_heap(self.heap);
                            let parsed = match trimmed.as_str() {
                                "inf" | "Infinity" | "+inf" => Ok(f64::INFINITY),
                                "-inf" | "-Infinity" => Ok(f64::NEG_INFINITY),
                                "nan" | "+nan" | "-nan" => Ok(f64::NAN),
                                other => other.parse::<f64>().map_err(|_| ()),
                            };
                            return parsed
                                .map(Value::Float)
                                .map_err(|()| ExcType::value_error(format!("could not convert string to float: '{trimmed}'")));
                        }
                        let message = ExcType::type_error(format!(
                            "float() argument must be a string or a real number, not '{}'",
                            value.type_name(self.heap, self.interns)
                        ));
                        value.drop_with_heap(self.heap);
                        Err(message)
                    }
                }
            }
            Type::Bool => {
                let value = match args {
                    ArgValues::Empty => return Ok(Value::Bool(false)),
                    other => other.get_one("bool", self.heap)?,
                };
                let truth = self.value_truth(&value);
                value.drop_with_heap(self.heap);
                Ok(Value::Bool(truth?))
            }
            Type::Complex => {
                let (real, imag) = match args {
                    ArgValues::Empty => (Value::Int(0), None),
                    other => other.get_one_or_two("complex", self.heap)?,
                };
                let real_part = real
                    .as_float(self.heap)
                    .ok_or_else(|| ExcType::type_error("complex() argument must be a number"))?;
                let imag_part = match imag {
                    Some(value) => {
                        let f = value
                            .as_float(self.heap)
                            .ok_or_else(|| ExcType::type_error("complex() argument must be a number"))?;
                        value.drop_with_heap(self.heap);
                        f
                    }
                    None => 0.0,
                };
                real.drop_with_heap(self.heap);
                let id = self
                    .heap
                    .allocate(HeapData::Complex(crate::types::Complex::new(real_part, imag_part)))?;
                Ok(Value::Ref(id))
            }
            Type::Str => {
                let value = match args {
                    ArgValues::Empty => return self.make_str(String::new()),
                    other => other.get_one("str", self.heap)?,
                };
                let text = self.value_str(&value);
                value.drop_with_heap(self.heap);
                self.make_str(text?)
            }
            Type::Bytes => {
                let value = match args {
                    ArgValues::Empty => {
                        let id = self.heap.allocate(HeapData::Bytes(crate::types::Bytes::default()))?;
                        return Ok(Value::Ref(id));
                    }
                    other => other.get_one("bytes", self.heap)?,
                };
                let items = self.collect_iterable(value)?;
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    let Some(b) = item.as_int() else {
                        item.drop_with_heap(self.heap);
                        return Err(ExcType::type_error("bytes() argument must be an iterable of ints"));
                    };
                    item.drop_with_heap(self.heap);
                    let b = u8::try_from(b).map_err(|_| ExcType::value_error("bytes must be in range(0, 256)"))?;
                    bytes.push(b);
                }
                let id = self.heap.allocate(HeapData::Bytes(crate::types::Bytes::from(bytes)))?;
                Ok(Value::Ref(id))
            }
            Type::List => {
                let items = match args {
                    ArgValues::Empty => Vec::new(),
                    other => {
                        let iterable = other.get_one("list", self.heap)?;
                        self.collect_iterable(iterable)?
                    }
                };
                let id = self.heap.allocate(HeapData::List(List::from(items)))?;
                Ok(Value::Ref(id))
            }
            Type::Tuple => {
                let items = match args {
                    ArgValues::Empty => Vec::new(),
                    other => {
                        let iterable = other.get_one("tuple", self.heap)?;
                        self.collect_iterable(iterable)?
                    }
                };
                let id = if items.is_empty() {
                    self.heap.empty_tuple()?
                } else {
                    self.heap.allocate(HeapData::Tuple(Tuple::from(items)))?
                };
                Ok(Value::Ref(id))
            }
            Type::Dict => {
                let source = match args {
                    ArgValues::Empty => None,
                    other => Some(other.get_one("dict", self.heap)?),
                };
                let dict_id = self.heap.allocate(HeapData::Dict(Dict::new()))?;
                if let Some(source) = source {
                    let Value::Ref(source_id) = &source else {
                        source.drop_with_heap(self.heap);
                        self.heap.dec_ref(dict_id);
                        return Err(ExcType::type_error("dict() argument must be a mapping"));
                    };
                    let source_id = *source_id;
                    if matches!(self.heap.get(source_id), HeapData::Dict(_)) {
                        self.dict_update_from(dict_id, source_id, false)?;
                        source.drop_with_heap(self.heap);
                    } else {
                        // An iterable of key/value pairs.
                        let pairs = self.collect_iterable(source)?;
                        for pair in pairs {
                            let unpacked = self.collect_iterable(pair)?;
                            if unpacked.len() != 2 {
                                for value in unpacked {
                                    value.drop_with_heap(self.heap);
                                }
                                self.heap.dec_ref(dict_id);
                                return Err(ExcType::value_error("dictionary update sequence element is not a pair"));
                            }
                            let mut iter = unpacked.into_iter();
                            let key = iter.next().expect("len checked");
                            let value = iter.next().expect("len checked");
                            self.dict_insert_value(dict_id, key, value)?;
                        }
                    }
                }
                Ok(Value::Ref(dict_id))
            }
            Type::Set | Type::FrozenSet => {
                let items = match args {
                    ArgValues::Empty => Vec::new(),
                    other => {
                        let iterable = other.get_one(if ty == Type::Set { "set" } else { "frozenset" }, self.heap)?;
                        self.collect_iterable(iterable)?
                    }
                };
                let mut storage = SetStorage::new();
                for item in items {
                    let hash = self.value_hash(&item)?;
                    self.storage_add(&mut storage, item, hash);
                }
                let data = if ty == Type::Set {
                    HeapData::Set(Set(storage))
                } else {
                    HeapData::FrozenSet(storage)
                };
                let id = self.heap.allocate(data)?;
                Ok(Value::Ref(id))
            }
            Type::Range => {
                let (a, b, c) = args.get_up_to_three("range", self.heap)?;
                let first = a
                    .as_int()
                    .ok_or_else(|| ExcType::type_error("range() arguments must be integers"))?;
                let range = match (b, c) {
                    (None, None) => Range::new(0, first, 1)?,
                    (Some(b_value), None) => {
                        let stop = b_value
                            .as_int()
                            .ok_or_else(|| ExcType::type_error("range() arguments must be integers"))?;
                        Range::new(first, stop, 1)?
                    }
                    (Some(b_value), Some(c_value)) => {
                        let stop = b_value
                            .as_int()
                            .ok_or_else(|| ExcType::type_error("range() arguments must be integers"))?;
                        let step = c_value
                            .as_int()
                            .ok_or_else(|| ExcType::type_error("range() arguments must be integers"))?;
                        Range::new(first, stop, step)?
                    }
                    (None, Some(_)) => unreachable!("third argument without second"),
                };
                let id = self.heap.allocate(HeapData::Range(range))?;
                Ok(Value::Ref(id))
            }
            Type::Slice => {
                let (a, b, c) = args.get_up_to_three("slice", self.heap)?;
                let slice = match (b, c) {
                    (None, None) => Slice {
                        start: Value::None,
                        stop: a,
                        step: Value::None,
                    },
                    (Some(stop), None) => Slice {
                        start: a,
                        stop,
                        step: Value::None,
                    },
                    (Some(stop), Some(step)) => Slice { start: a, stop, step },
                    (None, Some(_)) => unreachable!("third argument without second"),
                };
                let id = self.heap.allocate(HeapData::Slice(slice))?;
                Ok(Value::Ref(id))
            }
            _ => {
                args.drop_with_heap(self.heap);
                Err(ExcType::type_error(format!("cannot create instances of type '{ty}'")))
            }
        }
    }

    // ==================================================================
    // isinstance / issubclass
    // ==================================================================

    pub(crate) fn isinstance_check(&mut self, value: &Value, class: &Value) -> RunResult<bool> {
        // Tuples of classes mean "any of".
        if let Value::Ref(id) = class
            && let HeapData::Tuple(tuple) = self.heap.get(*id)
        {
            let candidates: Vec<Value> = tuple.items().iter().map(|v| v.clone_with_heap(self.heap)).collect();
            for candidate in &candidates {
                if self.isinstance_check(value, candidate)? {
                    for c in candidates {
                        c.drop_with_heap(self.heap);
                    }
                    return Ok(true);
                }
            }
            for c in candidates {
                c.drop_with_heap(self.heap);
            }
            return Ok(false);
        }

        match class {
            Value::Builtin(Builtins::TypeCtor(ty)) => {
                let shape = value.py_type(self.heap);
                Ok(shape == *ty || (*ty == Type::Int && shape == Type::Bool))
            }
            Value::Builtin(Builtins::ObjectClass) => Ok(true),
            Value::Builtin(Builtins::ExcClass(exc_type)) => {
                if let Value::Ref(id) = value
                    && let HeapData::Exception(exc) = self.heap.get(*id)
                {
                    return Ok(exc.matches_builtin(*exc_type));
                }
                // Instances of user exception subclasses.
                if let Value::Ref(id) = value
                    && let Some(class_id) = self.class_of_instance(*id)
                    && let HeapData::Class(class) = self.heap.get(class_id)
                {
                    return Ok(class.exc_base.is_some_and(|base| base.is_subclass_of(*exc_type)));
                }
                Ok(false)
            }
            Value::Ref(class_id) if matches!(self.heap.get(*class_id), HeapData::Class(_)) => {
                let Value::Ref(value_id) = value else { return Ok(false) };
                let Some(instance_class) = self.class_of_instance(*value_id) else {
                    return Ok(false);
                };
                let HeapData::Class(class) = self.heap.get(instance_class) else {
                    return Ok(false);
                };
                Ok(class.mro.contains(class_id))
            }
            _ => Err(ExcType::type_error(
                "isinstance() arg 2 must be a type or tuple of types",
            )),
        }
    }

    fn issubclass_check(&mut self, sub: &Value, class: &Value) -> RunResult<bool> {
        match (sub, class) {
            (Value::Builtin(Builtins::ExcClass(sub_exc)), Value::Builtin(Builtins::ExcClass(super_exc))) => {
                Ok(sub_exc.is_subclass_of(*super_exc))
            }
            (Value::Builtin(Builtins::TypeCtor(a)), Value::Builtin(Builtins::TypeCtor(b))) => {
                Ok(a == b || (*a == Type::Bool && *b == Type::Int))
            }
            (_, Value::Builtin(Builtins::ObjectClass)) => Ok(true),
            (Value::Ref(sub_id), Value::Ref(class_id)) => {
                let HeapData::Class(sub_class) = self.heap.get(*sub_id) else {
                    return Err(ExcType::type_error("issubclass() arg 1 must be a class"));
                };
                Ok(sub_class.mro.contains(class_id))
            }
            (Value::Ref(sub_id), Value::Builtin(Builtins::ExcClass(super_exc))) => {
                let HeapData::Class(sub_class) = self.heap.get(*sub_id) else {
                    return Err(ExcType::type_error("issubclass() arg 1 must be a class"));
                };
                Ok(sub_class.exc_base.is_some_and(|base| base.is_subclass_of(*super_exc)))
            }
            _ => Err(ExcType::type_error("issubclass() arguments must be classes")),
        }
    }

    // ==================================================================
    // Builtin methods
    // ==================================================================

    fn call_method_fn(&mut self, method: MethodFn, args: ArgValues) -> RunResult<Value> {
        match method {
            MethodFn::GenSend => {
                let (receiver, value) = args.get_two("send", self.heap)?;
                let Value::Ref(gen_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    return Err(RunError::internal("send on non-generator"));
                };
                let gen_id = *gen_id;
                let outcome = self.resume_generator(gen_id, crate::bytecode::vm::ResumeWith::Send(value));
                receiver.drop_with_heap(self.heap);
                match outcome? {
                    crate::bytecode::vm::GenOutcome::Yielded(yielded) => Ok(yielded),
                    crate::bytecode::vm::GenOutcome::Returned(returned) => Err(self.stop_iteration_with_value(returned)),
                }
            }
            MethodFn::GenThrow => {
                let (positional, kwargs) = args.into_parts();
                for (_, value) in kwargs {
                    value.drop_with_heap(self.heap);
                }
                let mut iter = positional.into_iter();
                let Some(receiver) = iter.next() else {
                    return Err(ExcType::arg_count_error("throw", 2, 0));
                };
                let Some(exc_value) = iter.next() else {
                    receiver.drop_with_heap(self.heap);
                    return Err(ExcType::arg_count_error("throw", 2, 1));
                };
                for extra in iter {
                    extra.drop_with_heap(self.heap);
                }
                let Value::Ref(gen_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    exc_value.drop_with_heap(self.heap);
                    return Err(RunError::internal("throw on non-generator"));
                };
                let gen_id = *gen_id;
                let exc = self.coerce_exc_instance(exc_value)?;
                let outcome = self.resume_generator(gen_id, crate::bytecode::vm::ResumeWith::Throw(exc));
                receiver.drop_with_heap(self.heap);
                match outcome? {
                    crate::bytecode::vm::GenOutcome::Yielded(yielded) => Ok(yielded),
                    crate::bytecode::vm::GenOutcome::Returned(returned) => Err(self.stop_iteration_with_value(returned)),
                }
            }
            MethodFn::GenClose => {
                let receiver = args.get_one("close", self.heap)?;
                let Value::Ref(gen_id) = &receiver else {
                    receiver.drop_with_heap(self.heap);
                    return Err(RunError::internal("close on non-generator"));
                };
                let gen_id = *gen_id;
                let result = self.close_generator(gen_id);
                receiver.drop_with_heap(self.heap);
                result.map(|()| Value::None)
            }
            MethodFn::GenNext => {
                let receiver = args.get_one("__next__", self.heap)?;
                self.builtin_next(receiver, None)
            }
            MethodFn::ExcAddNote => {
                let (receiver, note) = args.get_two("add_note", self.heap)?;
                let Some(text) = note.as_str(self.heap, self.interns).map(str::to_owned) else {
                    let message = ExcType::type_error("note must be a str");
                    note.drop_with_heap(self.heap);
                    receiver.drop_with_heap(self.heap);
                    return Err(message);
                };
                note.drop_with_heap(self.heap);
                if let Value::Ref(id) = &receiver
                    && let HeapData::Exception(exc) = self.heap.get_mut(*id)
                {
                    exc.notes.push(text);
                }
                receiver.drop_with_heap(self.heap);
                Ok(Value::None)
            }
            _ => self.call_container_method(method, args),
        }
    }

    fn call_native(&mut self, index: u32, args: ArgValues) -> RunResult<Value> {
        let Some(native) = self.natives.get(index as usize).cloned() else {
            args.drop_with_heap(self.heap);
            return Err(RunError::internal("native function index out of range"));
        };
        let (positional, kwargs) = args.into_parts();
        let mut objects = Vec::with_capacity(positional.len());
        for value in &positional {
            objects.push(crate::object::value_to_object(value, self.heap, self.interns));
        }
        let mut kw_objects = Vec::with_capacity(kwargs.len());
        for (name, value) in &kwargs {
            kw_objects.push((
                self.interns.get_str(*name).to_owned(),
                crate::object::value_to_object(value, self.heap, self.interns),
            ));
        }
        for value in positional {
            value.drop_with_heap(self.heap);
        }
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
        // Foreign errors classify by message prefix.
        match native(&objects, &kw_objects) {
            Ok(result) => crate::object::object_to_value(&result, self.heap, self.interns),
            Err(message) => Err(RunError::from(crate::except::wrap_foreign(&message))),
        }
    }

    fn call_user_method(&mut self, type_id: MetaTypeId, index: u16, args: ArgValues) -> RunResult<Value> {
        let Some(table) = userdata::metatable(type_id) else {
            args.drop_with_heap(self.heap);
            return Err(RunError::internal("userdata metatable missing from index"));
        };
        let Some(method) = table.method_at(index).cloned() else {
            args.drop_with_heap(self.heap);
            return Err(RunError::internal("userdata method index out of range"));
        };
        let (mut positional, kwargs) = args.into_parts();
        for (_, value) in kwargs {
            value.drop_with_heap(self.heap);
        }
        if positional.is_empty() {
            return Err(RunError::internal("userdata method call without receiver"));
        }
        let receiver = positional.remove(0);
        let Value::Ref(data_id) = &receiver else {
            receiver.drop_with_heap(self.heap);
            for value in positional {
                value.drop_with_heap(self.heap);
            }
            return Err(RunError::internal("userdata method receiver is not userdata"));
        };
        let data_id = *data_id;
        let mut objects = Vec::with_capacity(positional.len());
        for value in &positional {
            objects.push(crate::object::value_to_object(value, self.heap, self.interns));
        }
        for value in positional {
            value.drop_with_heap(self.heap);
        }
        let result = {
            let HeapData::UserData(data) = self.heap.get_mut(data_id) else {
                receiver.drop_with_heap(self.heap);
                return Err(RunError::internal("userdata method receiver is not userdata"));
            };
            method(data.data.as_mut(), &objects)
        };
        receiver.drop_with_heap(self.heap);
        match result {
            Ok(object) => crate::object::object_to_value(&object, self.heap, self.interns),
            Err(message) => Err(RunError::from(crate::except::wrap_foreign(&message))),
        }
    }
}

/// Gathers slot names from a `__slots__` sequence.
fn collect_slot_names<T: ResourceTracker>(
    items: &[Value],
    heap: &crate::heap::Heap<T>,
    names: &mut Vec<StringId>,
    texts: &mut Vec<String>,
) {
    for item in items {
        match item {
            Value::InternString(name) => names.push(*name),
            Value::Ref(id) => {
                if let HeapData::Str(s) = heap.get(*id) {
                    texts.push(s.as_str().to_owned());
                }
            }
            _ => {}
        }
    }
}

/// Modular exponentiation for three-argument `pow`.
fn mod_pow(base: i64, exp: i64, modulus: i64) -> i64 {
    let modulus = i128::from(modulus);
    let mut result: i128 = 1;
    let mut base = i128::from(base) % modulus;
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exp >>= 1;
    }
    // Python's modulo takes the divisor's sign.
    let mut result = result % modulus;
    if result != 0 && (result < 0) != (modulus < 0) {
        result += modulus;
    }
    result as i64
}

/// Round-half-to-even, matching `round()`.
fn round_half_even(value: f64) -> f64 {
    let floor = value.floor();
    let diff = value - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if floor % 2.0 == 0.0 {
        floor
    } else {
        floor + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_namespace_exposes_expected_names() {
        let mut interns = Interns::new();
        let namespace = kernel_namespace(&mut interns);
        for name in ["print", "len", "isinstance", "range", "ValueError", "object", "super"] {
            let id = interns.intern(name);
            assert!(namespace.contains_key(&id), "missing builtin {name}");
        }
    }

    #[test]
    fn mod_pow_matches_python() {
        assert_eq!(mod_pow(2, 10, 1000), 24);
        assert_eq!(mod_pow(3, 0, 7), 1);
        assert_eq!(mod_pow(2, 10, -7), -4); // 1024 % -7 == -4 in Python
    }

    #[test]
    fn round_half_even_behavior() {
        assert_eq!(round_half_even(0.5), 0.0);
        assert_eq!(round_half_even(1.5), 2.0);
        assert_eq!(round_half_even(2.5), 2.0);
        assert_eq!(round_half_even(-0.4), 0.0);
    }
}
