//! The exception type exposed to embedders.
//!
//! A raised exception escaping the interpreter is resolved (string ids →
//! text) into [`Exception`]: type name, message, args, cause/context chain,
//! suppress flag, and traceback frames. Its `Display` renders the
//! single-line form `<Type>: <message> (<file>:<line> in <function>)`,
//! choosing the innermost frame; chains render recursively.

use std::fmt;

use crate::{
    except::{ExcInstance, ExcPayload, RunError},
    intern::{Interns, StaticStrings, StringId},
};

/// One resolved traceback frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    /// Function name, or `<module>` for module-level code.
    pub name: String,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.name)
    }
}

/// A structured error at the embedder boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    /// Class name, e.g. `ValueError` or a user subclass name.
    pub type_name: String,
    pub message: Option<String>,
    /// The exception's `args` tuple rendered as text.
    pub args: Vec<String>,
    /// Traceback frames, innermost first.
    pub frames: Vec<StackFrame>,
    pub cause: Option<Box<Exception>>,
    pub context: Option<Box<Exception>>,
    pub suppress_context: bool,
    pub notes: Vec<String>,
}

impl Exception {
    /// Builds a boundary exception without a traceback.
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            type_name: type_name.into(),
            message: Some(message.clone()),
            args: vec![message],
            frames: Vec::new(),
            cause: None,
            context: None,
            suppress_context: false,
            notes: Vec::new(),
        }
    }

    /// Resolves an engine exception against the interner.
    #[must_use]
    pub(crate) fn from_instance(exc: &ExcInstance, interns: &Interns) -> Self {
        let frames = exc
            .trace
            .iter()
            .map(|frame| StackFrame {
                file: interns.get_str(frame.file).to_owned(),
                line: frame.line,
                name: resolve_name(frame.name, interns),
            })
            .collect();
        Self {
            type_name: exc.class_name().to_owned(),
            message: exc.message.clone(),
            args: exc.args.iter().map(ExcPayload::to_string).collect(),
            frames,
            cause: exc.cause.as_deref().map(|c| Box::new(Self::from_instance(c, interns))),
            context: exc
                .context
                .as_deref()
                .map(|c| Box::new(Self::from_instance(c, interns))),
            suppress_context: exc.suppress_context,
            notes: exc.notes.clone(),
        }
    }

    /// Resolves any engine error for the boundary.
    #[must_use]
    pub(crate) fn from_run_error(err: &RunError, interns: &Interns) -> Self {
        match err {
            RunError::Exc(exc) | RunError::UncatchableExc(exc) => Self::from_instance(exc, interns),
            RunError::Internal(msg) => Self::new("RuntimeError", format!("internal interpreter error: {msg}")),
        }
    }

    /// The innermost frame, used for the one-line summary.
    #[must_use]
    pub fn location(&self) -> Option<&StackFrame> {
        self.frames.first()
    }
}

fn resolve_name(id: StringId, interns: &Interns) -> String {
    let name = interns.get_str(id);
    if name.is_empty() {
        StaticStrings::Module.as_str().to_owned()
    } else {
        name.to_owned()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cause) = &self.cause {
            writeln!(f, "{cause}")?;
            writeln!(f, "The above exception was the direct cause of the following exception:")?;
        } else if let Some(context) = &self.context
            && !self.suppress_context
        {
            writeln!(f, "{context}")?;
            writeln!(f, "During handling of the above exception, another exception occurred:")?;
        }
        write!(f, "{}", self.type_name)?;
        if let Some(message) = &self.message
            && !message.is_empty()
        {
            write!(f, ": {message}")?;
        }
        if let Some(frame) = self.location() {
            write!(f, " ({frame})")?;
        }
        for note in &self.notes {
            write!(f, "\n  {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::except::{ExcType, FrameInfo};

    #[test]
    fn display_includes_location() {
        let mut interns = Interns::new();
        let file = interns.intern("main.py");
        let func = interns.intern("work");
        let mut exc = ExcInstance::with_message(ExcType::ValueError, "bad");
        exc.push_frame(FrameInfo { file, line: 3, name: func });
        let public = Exception::from_instance(&exc, &interns);
        assert_eq!(public.to_string(), "ValueError: bad (main.py:3 in work)");
    }

    #[test]
    fn cause_renders_before_exception() {
        let interns = Interns::new();
        let mut exc = ExcInstance::with_message(ExcType::ValueError, "outer");
        exc.set_cause(Some(ExcInstance::with_message(ExcType::ZeroDivisionError, "division by zero")));
        let public = Exception::from_instance(&exc, &interns);
        let text = public.to_string();
        assert!(text.starts_with("ZeroDivisionError: division by zero"));
        assert!(text.contains("direct cause"));
        assert!(text.ends_with("ValueError: outer"));
    }
}
