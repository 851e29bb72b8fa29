//! Generator protocol: send/throw/close, yield-from, exhaustion.

use std::rc::Rc;

use pyrite::{Code, CodeFlags, Interp, Object, Opcode};

/// ```text
/// def g():
///     x = yield 1
///     y = yield x + 10
///     return y * 2
/// ```
fn send_return_gen(interp: &mut Interp) -> Rc<Code> {
    let mut f = interp.builder("g", "test.py");
    f.set_flags(CodeFlags::GENERATOR);
    f.load_int(1);
    f.op(Opcode::YieldValue);
    f.store_local("x");
    f.load_local("x");
    f.load_int(10);
    f.op(Opcode::BinaryAdd);
    f.op(Opcode::YieldValue);
    f.store_local("y");
    f.load_local("y");
    f.load_int(2);
    f.op(Opcode::BinaryMul);
    f.ret();
    f.finish()
}

#[test]
fn send_values_flow_through_yields() {
    let mut interp = Interp::new();
    let g = send_return_gen(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        b.store_local("it");
        // next(it) -> 1
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        // it.send(5) -> 15
        b.load_local("it");
        b.load_method("send");
        b.load_int(5);
        b.op_u8(Opcode::CallMethod, 1);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(15)])
    );
}

#[test]
fn returning_generator_raises_stop_iteration_with_value() {
    let mut interp = Interp::new();
    let g = send_return_gen(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        b.store_local("it");
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        b.op(Opcode::Pop);
        b.load_local("it");
        b.load_method("send");
        b.load_int(5);
        b.op_u8(Opcode::CallMethod, 1);
        b.op(Opcode::Pop);
        // Third resume finishes with return y * 2 = 14.
        b.load_local("it");
        b.load_method("send");
        b.load_int(7);
        b.op_u8(Opcode::CallMethod, 1);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "StopIteration");
    assert_eq!(err.args, vec!["14".to_owned()]);
}

#[test]
fn sending_into_a_fresh_generator_requires_none() {
    let mut interp = Interp::new();
    let g = send_return_gen(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        b.load_method("send");
        b.load_int(9);
        b.op_u8(Opcode::CallMethod, 1);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert!(err.message.unwrap().contains("just-started generator"));
}

#[test]
fn close_makes_the_next_resume_stop() {
    let mut interp = Interp::new();
    let g = send_return_gen(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        b.store_local("it");
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        b.op(Opcode::Pop);
        b.load_local("it");
        b.load_method("close");
        b.op_u8(Opcode::CallMethod, 0);
        b.op(Opcode::Pop);
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "StopIteration");
}

#[test]
fn throw_into_a_handler_is_caught() {
    let mut interp = Interp::new();
    // def g():
    //     try:
    //         yield 1
    //     except ValueError:
    //         yield 99
    let g = {
        let mut f = interp.builder("g", "test.py");
        f.set_flags(CodeFlags::GENERATOR);
        let handler = f.label();
        let end = f.label();
        f.jump(Opcode::SetupExcept, handler);
        f.load_int(1);
        f.op(Opcode::YieldValue);
        f.op(Opcode::Pop);
        f.op(Opcode::PopBlock);
        f.jump(Opcode::Jump, end);
        f.bind(handler);
        // Exception value on stack; match against ValueError.
        f.load_global("ValueError");
        f.op(Opcode::ExceptionMatch);
        let reraise = f.label();
        f.jump(Opcode::PopJumpIfFalse, reraise);
        f.op(Opcode::Pop);
        f.load_int(99);
        f.op(Opcode::YieldValue);
        f.op(Opcode::Pop);
        f.op(Opcode::PopExcept);
        f.jump(Opcode::Jump, end);
        f.bind(reraise);
        f.op_u8(Opcode::RaiseVarargs, 0);
        f.bind(end);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        b.store_local("it");
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        b.op(Opcode::Pop);
        // it.throw(ValueError) is answered by the handler's yield.
        b.load_local("it");
        b.load_method("throw");
        b.load_global("ValueError");
        b.op_u8(Opcode::CallMethod, 1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(99));
}

#[test]
fn yield_from_delegates_values_sends_and_return() {
    let mut interp = Interp::new();
    // def inner():
    //     x = yield 1
    //     return x + 100
    let inner = {
        let mut f = interp.builder("inner", "test.py");
        f.set_flags(CodeFlags::GENERATOR);
        f.load_int(1);
        f.op(Opcode::YieldValue);
        f.load_int(100);
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    // def outer():
    //     result = yield from inner()
    //     yield result
    let outer = {
        let mut f = interp.builder("outer", "test.py");
        f.set_flags(CodeFlags::GENERATOR);
        f.load_global("inner");
        f.call(0);
        f.op(Opcode::LoadNone);
        f.op(Opcode::YieldFrom);
        f.op(Opcode::YieldValue);
        f.op(Opcode::Pop);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(inner, 0);
        b.store_global("inner");
        b.make_function(outer, 0);
        b.call(0);
        b.store_local("it");
        // next(it) -> 1 (from inner)
        b.load_global("next");
        b.load_local("it");
        b.call(1);
        // it.send(5): inner returns 105, outer yields it
        b.load_local("it");
        b.load_method("send");
        b.load_int(5);
        b.op_u8(Opcode::CallMethod, 1);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(105)])
    );
}

#[test]
fn generators_iterate_in_for_loops() {
    let mut interp = Interp::new();
    // def countdown(n):
    //     while n > 0:
    //         yield n
    //         n = n - 1
    let g = {
        let mut f = interp.builder("countdown", "test.py");
        f.params(&["n"]);
        f.set_flags(CodeFlags::GENERATOR);
        let top = f.label();
        let done = f.label();
        f.bind(top);
        f.load_local("n");
        f.load_int(0);
        f.jump(Opcode::GtIntJumpIfFalse, done);
        f.load_local("n");
        f.op(Opcode::YieldValue);
        f.op(Opcode::Pop);
        f.op_u8(Opcode::DecrementFast, 0);
        f.jump(Opcode::Jump, top);
        f.bind(done);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.store_global("countdown");
        b.load_int(0);
        b.store_local("total");
        b.load_global("countdown");
        b.load_int(4);
        b.call(1);
        b.op(Opcode::GetIter);
        let top = b.label();
        let end = b.label();
        b.bind(top);
        b.jump(Opcode::ForIter, end);
        b.store_local("x");
        b.load_local("total");
        b.load_local("x");
        b.op(Opcode::BinaryAdd);
        b.store_local("total");
        b.jump(Opcode::Jump, top);
        b.bind(end);
        b.load_local("total");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(10));
}
