//! The exception taxonomy and the engine-internal error types.
//!
//! Three kinds of failure flow through the engine:
//! - [`RunError::Exc`] — a user exception, catchable by `except`, carrying
//!   cause/context chains and a traceback.
//! - [`RunError::UncatchableExc`] — execution-control signals (timeout,
//!   cancellation, memory/recursion ceilings). They format like ordinary
//!   exceptions but bypass user handlers.
//! - [`RunError::Internal`] — an interpreter invariant violation (stack
//!   underflow, bad cell index, missing opcode). These abort execution;
//!   the engine makes no attempt to recover.

use std::{borrow::Cow, fmt, str::FromStr};

use smallvec::{SmallVec, smallvec};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{intern::StringId, resource::ResourceError};

/// Result alias for operations that can raise.
pub type RunResult<T> = Result<T, RunError>;

/// Built-in exception classes.
///
/// The strum derives give `Display`/`FromStr`/`Into<&'static str>` matching
/// the class names exactly. Subclass relationships derive from
/// [`ExcType::parent`], so the MRO of every variant is the walk to
/// `BaseException`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ExcType {
    BaseException,
    Exception,
    /// Grouped exceptions raised and handled via `except*` semantics.
    ExceptionGroup,
    KeyboardInterrupt,
    SystemExit,
    /// Raised into a generator by `close()`. Inherits from BaseException.
    GeneratorExit,
    /// Embedder cancellation signal; surfaced as uncatchable.
    CancelledError,

    ArithmeticError,
    ZeroDivisionError,
    OverflowError,

    LookupError,
    IndexError,
    KeyError,

    RuntimeError,
    NotImplementedError,
    RecursionError,

    AttributeError,
    NameError,
    UnboundLocalError,

    ValueError,
    TypeError,
    AssertionError,
    MemoryError,
    StopIteration,
    StopAsyncIteration,
    TimeoutError,

    ImportError,
    ModuleNotFoundError,

    OSError,
    FileNotFoundError,
    FileExistsError,
    PermissionError,
    #[strum(serialize = "IOError")]
    IOError,
}

impl ExcType {
    /// The direct base class, or `None` for the root.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception
            | Self::KeyboardInterrupt
            | Self::SystemExit
            | Self::GeneratorExit
            | Self::CancelledError => Some(Self::BaseException),
            Self::ZeroDivisionError | Self::OverflowError => Some(Self::ArithmeticError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::ModuleNotFoundError => Some(Self::ImportError),
            Self::FileNotFoundError | Self::FileExistsError | Self::PermissionError | Self::IOError => {
                Some(Self::OSError)
            }
            _ => Some(Self::Exception),
        }
    }

    /// The linearized ancestry, `self` first, `BaseException` last.
    ///
    /// The deepest chains (the OSError family) are five classes, so the
    /// result stays inline.
    #[must_use]
    pub fn mro(self) -> SmallVec<[Self; 6]> {
        let mut chain: SmallVec<[Self; 6]> = smallvec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Whether `except handler_type:` catches an instance of `self`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == handler_type {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    /// The class name as a static string.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    // ------------------------------------------------------------------
    // Constructors for the errors the engine raises itself.
    // ------------------------------------------------------------------

    #[must_use]
    pub(crate) fn type_error(msg: impl fmt::Display) -> RunError {
        ExcInstance::with_message(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn value_error(msg: impl fmt::Display) -> RunError {
        ExcInstance::with_message(Self::ValueError, msg).into()
    }

    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        ExcInstance::with_message(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    #[must_use]
    pub(crate) fn unbound_local_error(name: &str) -> RunError {
        ExcInstance::with_message(
            Self::UnboundLocalError,
            format!("cannot access local variable '{name}' where it is not associated with a value"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn attribute_error(type_name: impl fmt::Display, attr: &str) -> RunError {
        ExcInstance::with_message(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn index_error(kind: &str) -> RunError {
        ExcInstance::with_message(Self::IndexError, format!("{kind} index out of range")).into()
    }

    #[must_use]
    pub(crate) fn key_error(key_repr: impl fmt::Display) -> RunError {
        ExcInstance::with_message(Self::KeyError, key_repr).into()
    }

    #[must_use]
    pub(crate) fn zero_division(msg: &str) -> RunError {
        ExcInstance::with_message(Self::ZeroDivisionError, msg).into()
    }

    #[must_use]
    pub(crate) fn overflow_error(msg: impl fmt::Display) -> RunError {
        ExcInstance::with_message(Self::OverflowError, msg).into()
    }

    #[must_use]
    pub(crate) fn stop_iteration() -> RunError {
        ExcInstance::new(Self::StopIteration).into()
    }

    #[must_use]
    pub(crate) fn not_iterable(type_name: impl fmt::Display) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    #[must_use]
    pub(crate) fn not_callable(type_name: impl fmt::Display) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    #[must_use]
    pub(crate) fn unhashable(type_name: impl fmt::Display) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    #[must_use]
    pub(crate) fn arg_count_error(name: &str, expected: usize, got: usize) -> RunError {
        Self::type_error(format!("{name}() takes {expected} positional arguments but {got} were given"))
    }

    #[must_use]
    pub(crate) fn import_error(module: &str, msg: impl fmt::Display) -> RunError {
        let mut exc = ExcInstance::with_message(Self::ImportError, msg);
        exc.module_name = Some(module.to_owned());
        exc.into()
    }

    #[must_use]
    pub(crate) fn module_not_found(module: &str) -> RunError {
        let mut exc = ExcInstance::with_message(Self::ModuleNotFoundError, format!("No module named '{module}'"));
        exc.module_name = Some(module.to_owned());
        exc.into()
    }

    #[must_use]
    pub(crate) fn memory_cap(what: &str) -> RunError {
        RunError::UncatchableExc(Box::new(
            ExcInstance::with_message(Self::MemoryError, format!("{what} exceeds the size cap")).into(),
        ))
    }
}

/// A scalar payload carried in an exception's `args` tuple.
///
/// Exception arguments survive frame unwinding and cloning without a heap,
/// so they are restricted to self-contained scalars; richer values degrade
/// to their repr text at construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum ExcPayload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ExcPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{}", crate::types::str::format_float(*v)),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// One frame of traceback information, innermost last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub file: StringId,
    pub line: u32,
    pub name: StringId,
}

/// A materialized exception.
///
/// This is both the engine-internal raise payload and the heap
/// representation of a caught exception object (`except E as e` binds a
/// heap value wrapping one of these).
#[derive(Debug, Clone, PartialEq)]
pub struct ExcInstance {
    pub exc_type: ExcType,
    /// Formatted message (`str(e)` when args has a single string).
    pub message: Option<String>,
    /// The `args` tuple, scalars only.
    pub args: Vec<ExcPayload>,
    /// Class name when raised from a user-defined subclass.
    pub custom_class_name: Option<String>,
    /// MRO class names of a user-defined subclass, class first; used for
    /// `except UserError` matching after the instance left its frame.
    pub custom_mro_names: Vec<String>,
    /// Explicit chaining set by `raise X from Y`.
    pub cause: Option<Box<ExcInstance>>,
    /// Implicit chaining set when raising during exception handling.
    pub context: Option<Box<ExcInstance>>,
    /// Whether implicit context is suppressed in rendering.
    pub suppress_context: bool,
    /// Notes attached via `add_note`.
    pub notes: Vec<String>,
    /// Member exceptions when `exc_type` is `ExceptionGroup`.
    pub group: Vec<ExcInstance>,
    /// Module name for ImportError/ModuleNotFoundError.
    pub module_name: Option<String>,
    /// Traceback frames, innermost first (raise site at index 0).
    pub trace: Vec<FrameInfo>,
}

impl ExcInstance {
    #[must_use]
    pub fn new(exc_type: ExcType) -> Self {
        Self {
            exc_type,
            message: None,
            args: Vec::new(),
            custom_class_name: None,
            custom_mro_names: Vec::new(),
            cause: None,
            context: None,
            suppress_context: false,
            notes: Vec::new(),
            group: Vec::new(),
            module_name: None,
            trace: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_message(exc_type: ExcType, msg: impl fmt::Display) -> Self {
        let text = msg.to_string();
        let mut exc = Self::new(exc_type);
        exc.args = vec![ExcPayload::Str(text.clone())];
        exc.message = Some(text);
        exc
    }

    #[must_use]
    pub fn with_payload(exc_type: ExcType, payload: ExcPayload) -> Self {
        let mut exc = Self::new(exc_type);
        exc.message = Some(payload.to_string());
        exc.args = vec![payload];
        exc
    }

    /// Builds an `ExceptionGroup(message, members)`.
    #[must_use]
    pub fn group(message: impl Into<String>, members: Vec<ExcInstance>) -> Self {
        let text = message.into();
        let mut exc = Self::new(ExcType::ExceptionGroup);
        exc.args = vec![ExcPayload::Str(text.clone())];
        exc.message = Some(text);
        exc.group = members;
        exc
    }

    /// Display name: the user subclass name when present, else the builtin.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.custom_class_name.as_deref().unwrap_or_else(|| self.exc_type.name())
    }

    /// Whether `except` against the named class catches this exception.
    ///
    /// Builtin handlers match via the [`ExcType`] hierarchy; user-defined
    /// classes match against the recorded MRO names.
    #[must_use]
    pub fn matches_builtin(&self, handler: ExcType) -> bool {
        self.exc_type.is_subclass_of(handler)
    }

    #[must_use]
    pub fn matches_class_name(&self, name: &str) -> bool {
        self.custom_mro_names.iter().any(|n| n == name)
    }

    pub fn set_cause(&mut self, cause: Option<ExcInstance>) {
        self.cause = cause.map(Box::new);
        self.suppress_context = true;
    }

    pub fn set_context(&mut self, context: ExcInstance) {
        // Re-raising the handled exception must not chain it to itself.
        if self.context.is_none() && !self.same_exception(&context) {
            self.context = Some(Box::new(context));
        }
    }

    fn same_exception(&self, other: &ExcInstance) -> bool {
        self.exc_type == other.exc_type && self.message == other.message && self.trace == other.trace
    }

    /// Splits a group into (matching, remainder) against a builtin handler.
    ///
    /// Non-group exceptions split as a whole. Used by `except*` arms.
    #[must_use]
    pub fn split_group(self, handler: ExcType) -> (Option<ExcInstance>, Option<ExcInstance>) {
        if self.exc_type != ExcType::ExceptionGroup {
            return if self.matches_builtin(handler) {
                (Some(self), None)
            } else {
                (None, Some(self))
            };
        }
        let message = self.message.clone().unwrap_or_default();
        let mut matched = Vec::new();
        let mut rest = Vec::new();
        for member in self.group {
            let (m, r) = member.split_group(handler);
            if let Some(m) = m {
                matched.push(m);
            }
            if let Some(r) = r {
                rest.push(r);
            }
        }
        let matched = if matched.is_empty() {
            None
        } else {
            Some(ExcInstance::group(message.clone(), matched))
        };
        let rest = if rest.is_empty() {
            None
        } else {
            Some(ExcInstance::group(message, rest))
        };
        (matched, rest)
    }

    /// Appends a caller's frame as the exception propagates outward.
    pub fn push_frame(&mut self, frame: FrameInfo) {
        self.trace.push(frame);
    }
}

/// Runtime error carried through dispatch.
#[derive(Debug)]
pub enum RunError {
    /// Interpreter bug: aborts execution with a description.
    Internal(Cow<'static, str>),
    /// Catchable user exception.
    Exc(Box<ExcInstance>),
    /// Execution-control signal; formats like an exception but cannot be
    /// caught by user handlers.
    UncatchableExc(Box<ExcInstance>),
}

impl From<ExcInstance> for RunError {
    fn from(exc: ExcInstance) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        let exc = match err {
            ResourceError::Cancelled => ExcInstance::with_message(ExcType::CancelledError, "execution cancelled"),
            ResourceError::Timeout { overshoot } => ExcInstance::with_message(
                ExcType::TimeoutError,
                format!("execution deadline exceeded by {overshoot:?}"),
            ),
            ResourceError::Memory { allocated, limit } => ExcInstance::with_message(
                ExcType::MemoryError,
                format!("memory limit exceeded: {allocated} bytes allocated, limit {limit}"),
            ),
            ResourceError::Recursion { .. } => {
                ExcInstance::with_message(ExcType::RecursionError, "maximum recursion depth exceeded")
            }
        };
        Self::UncatchableExc(Box::new(exc))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for a catchable StopIteration.
    #[must_use]
    pub fn is_stop_iteration(&self) -> bool {
        self.is_exception_type(ExcType::StopIteration)
    }

    #[must_use]
    pub fn is_exception_type(&self, exc_type: ExcType) -> bool {
        matches!(self, Self::Exc(exc) if exc.exc_type == exc_type)
    }

    /// Appends a traceback frame if this is an exception error.
    pub fn push_frame(&mut self, frame: FrameInfo) {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => exc.push_frame(frame),
            Self::Internal(_) => {}
        }
    }
}

/// Classifies a foreign error message into the taxonomy.
///
/// Errors crossing the boundary from native built-ins arrive as plain
/// text. If the text starts with a known class name followed by `:` or
/// end-of-string, it is classified as that class (longest name wins when
/// several match); anything else wraps as `RuntimeError`.
#[must_use]
pub fn wrap_foreign(message: &str) -> ExcInstance {
    let head = message.split(':').next().unwrap_or("").trim();
    if let Ok(exc_type) = ExcType::from_str(head) {
        let rest = message[head.len()..].trim_start_matches(':').trim_start();
        let body = if rest.is_empty() { head } else { rest };
        return ExcInstance::with_message(exc_type, body);
    }
    ExcInstance::with_message(ExcType::RuntimeError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_class_descends_from_base_exception() {
        for exc in [
            ExcType::Exception,
            ExcType::ValueError,
            ExcType::KeyError,
            ExcType::ModuleNotFoundError,
            ExcType::FileNotFoundError,
            ExcType::GeneratorExit,
            ExcType::RecursionError,
        ] {
            assert!(exc.mro().contains(&ExcType::BaseException), "{exc} misses the root");
        }
    }

    #[test]
    fn lookup_error_catches_key_and_index() {
        assert!(ExcType::KeyError.is_subclass_of(ExcType::LookupError));
        assert!(ExcType::IndexError.is_subclass_of(ExcType::LookupError));
        assert!(!ExcType::ValueError.is_subclass_of(ExcType::LookupError));
    }

    #[test]
    fn exception_does_not_catch_generator_exit() {
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(ExcType::GeneratorExit.is_subclass_of(ExcType::BaseException));
    }

    #[test]
    fn foreign_wrapping_classifies_by_prefix() {
        let exc = wrap_foreign("ValueError: bad input");
        assert_eq!(exc.exc_type, ExcType::ValueError);
        assert_eq!(exc.message.as_deref(), Some("bad input"));

        let exc = wrap_foreign("something went wrong");
        assert_eq!(exc.exc_type, ExcType::RuntimeError);
    }

    #[test]
    fn group_split_partitions_members() {
        let group = ExcInstance::group(
            "several",
            vec![
                ExcInstance::with_message(ExcType::ValueError, "v"),
                ExcInstance::with_message(ExcType::KeyError, "k"),
            ],
        );
        let (matched, rest) = group.split_group(ExcType::ValueError);
        let matched = matched.expect("one member matches");
        assert_eq!(matched.group.len(), 1);
        assert_eq!(matched.group[0].exc_type, ExcType::ValueError);
        let rest = rest.expect("one member remains");
        assert_eq!(rest.group[0].exc_type, ExcType::KeyError);
    }

    #[test]
    fn cause_suppresses_context_even_when_none() {
        let mut exc = ExcInstance::with_message(ExcType::ValueError, "x");
        exc.set_cause(None);
        assert!(exc.suppress_context);
        assert!(exc.cause.is_none());
    }
}
