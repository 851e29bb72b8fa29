//! Exception semantics: catch, finally, chaining, groups, signals.

use std::time::Duration;

use pyrite::{CancelHandle, CodeBuilder, Interp, Object, Opcode};

/// Emits `try: <body> except <class>: <handler>` with both arms leaving a
/// value in `out`.
fn emit_try_except(
    b: &mut CodeBuilder<'_>,
    body: impl FnOnce(&mut CodeBuilder<'_>),
    class_name: &str,
    handler: impl FnOnce(&mut CodeBuilder<'_>),
) {
    let handler_label = b.label();
    let end = b.label();
    b.jump(Opcode::SetupExcept, handler_label);
    body(b);
    b.op(Opcode::PopBlock);
    b.jump(Opcode::Jump, end);
    b.bind(handler_label);
    b.load_global(class_name);
    b.op(Opcode::ExceptionMatch);
    let reraise = b.label();
    b.jump(Opcode::PopJumpIfFalse, reraise);
    handler(b);
    b.op(Opcode::PopExcept);
    b.jump(Opcode::Jump, end);
    b.bind(reraise);
    b.op_u8(Opcode::RaiseVarargs, 0);
    b.bind(end);
}

#[test]
fn except_catches_matching_class() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_try_except(
            &mut b,
            |b| {
                b.load_int(1);
                b.load_int(0);
                b.op(Opcode::BinaryDiv);
                b.op(Opcode::Pop);
            },
            "ZeroDivisionError",
            |b| {
                // `as e` binding: the exception value is at TOS.
                b.store_local("e");
                b.load_int(42);
                b.store_local("out");
            },
        );
        b.load_local("out");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(42));
}

#[test]
fn lookup_error_catches_key_and_index_errors() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_try_except(
            &mut b,
            |b| {
                // {}["missing"]
                b.op(Opcode::BuildEmptyDict);
                b.load_str("missing");
                b.op(Opcode::BinarySubscr);
                b.op(Opcode::Pop);
            },
            "LookupError",
            |b| {
                b.op(Opcode::Pop);
                b.load_int(1);
                b.store_local("out");
            },
        );
        b.load_local("out");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(1));
}

#[test]
fn mismatched_class_keeps_unwinding() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_try_except(
            &mut b,
            |b| {
                b.load_int(1);
                b.load_int(0);
                b.op(Opcode::BinaryDiv);
                b.op(Opcode::Pop);
            },
            "KeyError",
            |b| {
                b.op(Opcode::Pop);
            },
        );
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
}

#[test]
fn finally_runs_on_both_paths() {
    let mut interp = Interp::new();
    // The finally body stores a witness; the exception still escapes.
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        let finally = b.label();
        b.load_int(0);
        b.store_global("witness");
        b.jump(Opcode::SetupFinally, finally);
        b.load_int(1);
        b.load_int(0);
        b.op(Opcode::BinaryDiv);
        b.op(Opcode::Pop);
        b.op(Opcode::PopBlock);
        b.op(Opcode::LoadNone);
        b.bind(finally);
        // finally body (stack-neutral around the marker at TOS)
        b.load_int(7);
        b.store_global("witness");
        b.op(Opcode::EndFinally);
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");

    // The finally body ran before the exception escaped.
    let check = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("witness");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&check).unwrap(), Object::Int(7));
}

#[test]
fn finally_intercepts_and_resumes_return() {
    let mut interp = Interp::new();
    // def f():
    //     try:
    //         return 5
    //     finally:
    //         record witness
    let f = {
        let mut f = interp.builder("f", "test.py");
        let finally = f.label();
        f.jump(Opcode::SetupFinally, finally);
        f.load_int(5);
        f.ret();
        f.bind(finally);
        f.load_int(1);
        f.store_global("ran");
        f.op(Opcode::EndFinally);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(f, 0);
        b.call(0);
        b.load_global("ran");
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(5), Object::Int(1)])
    );
}

#[test]
fn explicit_cause_chains_and_suppresses_context() {
    let mut interp = Interp::new();
    // try: 1/0
    // except ZeroDivisionError as e: raise ValueError("x") from e
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        let handler = b.label();
        let end = b.label();
        b.jump(Opcode::SetupExcept, handler);
        b.load_int(1);
        b.load_int(0);
        b.op(Opcode::BinaryDiv);
        b.op(Opcode::Pop);
        b.op(Opcode::PopBlock);
        b.jump(Opcode::Jump, end);
        b.bind(handler);
        b.load_global("ZeroDivisionError");
        b.op(Opcode::ExceptionMatch);
        let reraise = b.label();
        b.jump(Opcode::PopJumpIfFalse, reraise);
        b.store_local("e");
        b.load_global("ValueError");
        b.load_str("x");
        b.call(1);
        b.load_local("e");
        b.op_u8(Opcode::RaiseVarargs, 2);
        b.bind(reraise);
        b.op_u8(Opcode::RaiseVarargs, 0);
        b.bind(end);
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ValueError");
    assert_eq!(err.message.as_deref(), Some("x"));
    assert!(err.suppress_context);
    let cause = err.cause.expect("cause attached");
    assert_eq!(cause.type_name, "ZeroDivisionError");
}

#[test]
fn implicit_context_attaches_inside_handlers() {
    let mut interp = Interp::new();
    // except ZeroDivisionError: raise ValueError("y")   (no `from`)
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_try_except(
            &mut b,
            |b| {
                b.load_int(1);
                b.load_int(0);
                b.op(Opcode::BinaryDiv);
                b.op(Opcode::Pop);
            },
            "ZeroDivisionError",
            |b| {
                b.op(Opcode::Pop);
                b.load_global("ValueError");
                b.load_str("y");
                b.call(1);
                b.op_u8(Opcode::RaiseVarargs, 1);
            },
        );
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ValueError");
    assert!(!err.suppress_context);
    let context = err.context.expect("context attached");
    assert_eq!(context.type_name, "ZeroDivisionError");
}

#[test]
fn raising_a_non_exception_is_a_type_error() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(5);
        b.op_u8(Opcode::RaiseVarargs, 1);
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert!(err.message.unwrap().contains("derive from BaseException"));
}

#[test]
fn user_exception_subclasses_match_their_bases() {
    let mut interp = Interp::new();
    // class AppError(ValueError): pass
    // try: raise AppError("boom")
    // except ValueError: out = 1
    let body = {
        let mut f = interp.builder("AppError", "test.py");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.op(Opcode::LoadBuildClass);
        b.make_function(body, 0);
        b.load_str("AppError");
        b.load_global("ValueError");
        b.call(3);
        b.store_global("AppError");
        emit_try_except(
            &mut b,
            |b| {
                b.load_global("AppError");
                b.op_u8(Opcode::RaiseVarargs, 1);
            },
            "ValueError",
            |b| {
                b.op(Opcode::Pop);
                b.load_int(1);
                b.store_local("out");
            },
        );
        b.load_local("out");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(1));
}

#[test]
fn except_group_splits_and_rethrows_the_remainder() {
    let mut interp = Interp::new();
    // try: raise ExceptionGroup("several", [ValueError("v"), KeyError("k")])
    // except* ValueError: handled = 1
    // -> the KeyError member survives as a group
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        let arms = b.label();
        b.jump(Opcode::SetupExceptGroup, arms);
        b.load_global("ExceptionGroup");
        b.load_str("several");
        b.load_global("ValueError");
        b.load_str("v");
        b.call(1);
        b.load_global("KeyError");
        b.load_str("k");
        b.call(1);
        b.op_u16(Opcode::BuildList, 2);
        b.call(2);
        b.op_u8(Opcode::RaiseVarargs, 1);
        b.op(Opcode::PopBlock);

        b.bind(arms);
        // Stack: [group]; filter the ValueError arm.
        b.load_global("ValueError");
        b.op(Opcode::CheckExcGroupMatch);
        // Stack: [remainder, matched]
        let no_match = b.label();
        let rethrow = b.label();
        b.op(Opcode::Dup);
        b.op(Opcode::LoadNone);
        b.op(Opcode::CompareIsNot);
        b.jump(Opcode::PopJumpIfFalse, no_match);
        // Arm body: record the handled subgroup.
        b.store_local("handled");
        b.load_int(1);
        b.store_global("saw_value_error");
        b.jump(Opcode::Jump, rethrow);
        b.bind(no_match);
        b.op(Opcode::Pop);
        b.bind(rethrow);
        b.op(Opcode::RethrowGroupRemainder);
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ExceptionGroup");

    let check = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("saw_value_error");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&check).unwrap(), Object::Int(1));
}

#[test]
fn cancellation_bypasses_user_handlers() {
    let mut interp = Interp::new();
    interp.set_check_interval(10);
    let handle = CancelHandle::new();
    handle.cancel();

    // try: while True: pass
    // except: unreachable
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_try_except(
            &mut b,
            |b| {
                let top = b.label();
                b.bind(top);
                b.jump(Opcode::Jump, top);
            },
            "BaseException",
            |b| {
                b.op(Opcode::Pop);
            },
        );
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute_with_cancel(&code, handle).unwrap_err();
    assert_eq!(err.type_name, "CancelledError");
}

#[test]
fn deadlines_surface_as_timeouts() {
    let mut interp = Interp::new();
    interp.set_check_interval(10);
    let handle = CancelHandle::with_timeout(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));

    let code = {
        let mut b = interp.builder("<module>", "test.py");
        let top = b.label();
        b.bind(top);
        b.jump(Opcode::Jump, top);
        b.finish()
    };
    let err = interp.execute_with_cancel(&code, handle).unwrap_err();
    assert_eq!(err.type_name, "TimeoutError");
    assert!(err.message.unwrap().contains("deadline exceeded"));
}

#[test]
fn traceback_frames_name_the_raise_site() {
    let mut interp = Interp::new();
    let inner = {
        let mut f = interp.builder("explode", "deep.py");
        f.set_line(3);
        f.load_int(1);
        f.load_int(0);
        f.op(Opcode::BinaryDiv);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "deep.py");
        b.set_line(10);
        b.make_function(inner, 0);
        b.call(0);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
    let innermost = err.frames.first().expect("raise site recorded");
    assert_eq!(innermost.name, "explode");
    assert_eq!(innermost.file, "deep.py");
    assert_eq!(innermost.line, 3);
    assert!(err.to_string().contains("deep.py:3 in explode"));
}
