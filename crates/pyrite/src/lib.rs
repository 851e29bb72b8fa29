//! A stack-based bytecode interpreter for a Python-like scripting
//! language: a closed tagged value universe, a frame-based dispatch loop
//! with type-specialized opcodes, descriptor-aware attribute lookup over
//! C3 linearization, generators and coroutines as suspendable frames, a
//! chained exception model, and a process-wide import registry.
//!
//! The compiler is an external collaborator: embedders hand the engine
//! [`Code`] objects (assembled with [`CodeBuilder`] or produced by their
//! own front end) and receive boundary [`Object`] values or a structured
//! [`Exception`] back.

#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the call sites")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts mirror the language's numeric rules")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the reference semantics")]
#![expect(clippy::needless_pass_by_value, reason = "call paths take owned values consistently")]

mod args;
mod builtins;
mod bytecode;
mod except;
mod exception_public;
mod heap;
mod import;
mod intern;
mod io;
mod object;
mod py_hash;
mod resource;
mod run;
mod tracer;
mod types;
mod value;

pub use crate::{
    builtins::NativeFn,
    bytecode::{Code, CodeBuilder, CodeFlags, Const, Label, LineEntry, Opcode},
    except::ExcType,
    exception_public::{Exception, StackFrame},
    import::{CompileFn, ImportRegistry, ModuleLoader},
    intern::{Interns, StringId},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    resource::{
        CancelHandle, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker,
        ResourceError, ResourceLimits, ResourceTracker,
    },
    run::Interp,
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    types::userdata::{
        MetaTable, MetaTypeId, UserData, UserGetter, UserMethod, UserProperty, UserSetter, UserValue,
        metatable, register_metatable,
    },
};
