//! Runtime object shapes stored on the heap.

pub(crate) mod bytes;
pub(crate) mod class;
pub(crate) mod complex;
pub(crate) mod dict;
pub(crate) mod function;
pub(crate) mod generator;
pub(crate) mod iter;
pub(crate) mod list;
pub(crate) mod module;
pub(crate) mod range;
pub(crate) mod set;
pub(crate) mod slice;
pub(crate) mod str;
pub(crate) mod strfmt;
pub(crate) mod tuple;
pub(crate) mod userdata;

pub(crate) use bytes::Bytes;
pub(crate) use class::{ClassObject, Instance, SuperProxy, compute_c3_mro};
pub(crate) use complex::Complex;
pub(crate) use dict::Dict;
pub(crate) use function::{BoundMethod, Function, Property};
pub(crate) use generator::{GenKind, GenState, Generator};
pub(crate) use iter::Iter;
pub(crate) use list::List;
pub(crate) use module::Module;
pub(crate) use range::Range;
pub(crate) use set::{Set, SetStorage};
pub(crate) use slice::Slice;
pub(crate) use str::Str;
pub(crate) use tuple::Tuple;
pub(crate) use userdata::{MetaTable, MetaTypeId, UserData};

use std::fmt;

/// Value-shape discriminator.
///
/// Dispatch on value shape is a single branch on this enum; the
/// type-specialized opcodes rely on that. `Display` renders the Python
/// type name as it appears in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    NoneType,
    Ellipsis,
    NotImplementedType,
    Bool,
    Int,
    Float,
    Complex,
    Str,
    Bytes,
    Tuple,
    List,
    Dict,
    Set,
    FrozenSet,
    Range,
    Iterator,
    Slice,
    /// A class object (user-defined or builtin).
    Class,
    /// An instance of a user-defined class.
    Instance,
    Function,
    Method,
    BuiltinFunction,
    Property,
    ClassMethod,
    StaticMethod,
    Super,
    Cell,
    Generator,
    Coroutine,
    Exception,
    Module,
    UserData,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoneType => "NoneType",
            Self::Ellipsis => "ellipsis",
            Self::NotImplementedType => "NotImplementedType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Complex => "complex",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::Tuple => "tuple",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::FrozenSet => "frozenset",
            Self::Range => "range",
            Self::Iterator => "iterator",
            Self::Slice => "slice",
            Self::Class => "type",
            Self::Instance => "object",
            Self::Function => "function",
            Self::Method => "method",
            Self::BuiltinFunction => "builtin_function_or_method",
            Self::Property => "property",
            Self::ClassMethod => "classmethod",
            Self::StaticMethod => "staticmethod",
            Self::Super => "super",
            Self::Cell => "cell",
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::Exception => "exception",
            Self::Module => "module",
            Self::UserData => "userdata",
        };
        f.write_str(name)
    }
}
