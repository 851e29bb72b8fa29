//! Dispatcher semantics: arithmetic policy, specialized-arm equivalence,
//! control flow, and iteration.

use std::rc::Rc;

use pyrite::{Code, Interp, Object, Opcode};

fn eval_binary(op: Opcode, lhs: i64, rhs: i64) -> Result<Object, pyrite::Exception> {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_const(pyrite::Const::Int(lhs));
        b.load_const(pyrite::Const::Int(rhs));
        b.op(op);
        b.ret();
        b.finish()
    };
    interp.execute(&code)
}

#[test]
fn floor_division_rounds_toward_negative_infinity() {
    assert_eq!(eval_binary(Opcode::BinaryFloorDiv, -7, 2).unwrap(), Object::Int(-4));
    assert_eq!(eval_binary(Opcode::BinaryFloorDiv, 7, -2).unwrap(), Object::Int(-4));
    assert_eq!(eval_binary(Opcode::BinaryFloorDiv, 7, 2).unwrap(), Object::Int(3));
    assert_eq!(eval_binary(Opcode::BinaryFloorDiv, -7, -2).unwrap(), Object::Int(3));
}

#[test]
fn modulo_takes_the_divisor_sign() {
    assert_eq!(eval_binary(Opcode::BinaryMod, -7, 2).unwrap(), Object::Int(1));
    assert_eq!(eval_binary(Opcode::BinaryMod, 7, -2).unwrap(), Object::Int(-1));
    assert_eq!(eval_binary(Opcode::BinaryMod, 7, 2).unwrap(), Object::Int(1));
}

#[test]
fn division_yields_floats_and_rejects_zero() {
    assert_eq!(eval_binary(Opcode::BinaryDiv, 7, 2).unwrap(), Object::Float(3.5));
    let err = eval_binary(Opcode::BinaryDiv, 1, 0).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
    let err = eval_binary(Opcode::BinaryFloorDiv, 1, 0).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
    let err = eval_binary(Opcode::BinaryMod, 1, 0).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
}

#[test]
fn shifts_collapse_past_the_word() {
    assert_eq!(eval_binary(Opcode::BinaryLShift, 1, 64).unwrap(), Object::Int(0));
    assert_eq!(eval_binary(Opcode::BinaryLShift, 1, 100).unwrap(), Object::Int(0));
    assert_eq!(eval_binary(Opcode::BinaryRShift, 5, 64).unwrap(), Object::Int(0));
    assert_eq!(eval_binary(Opcode::BinaryRShift, -5, 64).unwrap(), Object::Int(-1));
    assert_eq!(eval_binary(Opcode::BinaryRShift, -8, 1).unwrap(), Object::Int(-4));
    let err = eval_binary(Opcode::BinaryLShift, 1, -1).unwrap_err();
    assert_eq!(err.type_name, "ValueError");
}

#[test]
fn negative_exponent_promotes_to_float() {
    assert_eq!(eval_binary(Opcode::BinaryPow, 2, -1).unwrap(), Object::Float(0.5));
    assert_eq!(eval_binary(Opcode::BinaryPow, 2, 10).unwrap(), Object::Int(1024));
    let err = eval_binary(Opcode::BinaryPow, i64::MAX, 2).unwrap_err();
    assert_eq!(err.type_name, "OverflowError");
}

#[test]
fn specialized_int_arms_match_generic_results() {
    for (fast, generic) in [
        (Opcode::AddIntFast, Opcode::BinaryAdd),
        (Opcode::SubIntFast, Opcode::BinarySub),
        (Opcode::MulIntFast, Opcode::BinaryMul),
        (Opcode::DivIntFast, Opcode::BinaryDiv),
    ] {
        for (a, b) in [(3, 4), (-7, 2), (0, 9), (100, -3)] {
            assert_eq!(
                eval_binary(fast, a, b).unwrap(),
                eval_binary(generic, a, b).unwrap(),
                "{fast:?} diverged from {generic:?} on ({a}, {b})"
            );
        }
    }
}

#[test]
fn specialized_arms_fall_back_on_type_mismatch() {
    // Float operands through the int-specialized arm.
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_const(pyrite::Const::Float(1.5));
        b.load_const(pyrite::Const::Float(2.5));
        b.op(Opcode::AddIntFast);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Float(4.0));

    // String operands through the float-specialized arm.
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("ab");
        b.load_str("cd");
        b.op(Opcode::AddFloatFast);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Str("abcd".to_owned()));
}

#[test]
fn fused_compare_jump_matches_separate_ops() {
    // while-style loop counting down with the fused arm.
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(10);
        b.store_local("n");
        b.load_int(0);
        b.store_local("steps");
        let top = b.label();
        let done = b.label();
        b.bind(top);
        b.load_local("n");
        b.load_int(0);
        b.jump(Opcode::GtIntJumpIfFalse, done);
        b.op_u8(Opcode::DecrementFast, 0);
        b.op_u8(Opcode::IncrementFast, 1);
        b.jump(Opcode::Jump, top);
        b.bind(done);
        b.load_local("steps");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(10));
}

#[test]
fn short_circuit_keeps_value_only_when_jumping() {
    // `0 or 5` evaluates to 5; `3 or 5` evaluates to 3.
    let mut interp = Interp::new();
    let build = |interp: &mut Interp, first: i64| -> Rc<Code> {
        let mut b = interp.builder("<module>", "test.py");
        let end = b.label();
        b.load_int(first);
        b.jump(Opcode::JumpIfTrueOrPop, end);
        b.load_int(5);
        b.bind(end);
        b.ret();
        b.finish()
    };
    let code = build(&mut interp, 0);
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(5));
    let code = build(&mut interp, 3);
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(3));
}

#[test]
fn for_iter_collects_a_range() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.op(Opcode::BuildEmptyList);
        b.store_local("out");
        b.load_global("range");
        b.load_int(5);
        b.call(1);
        b.op(Opcode::GetIter);
        let top = b.label();
        let end = b.label();
        b.bind(top);
        b.jump(Opcode::ForIter, end);
        // Append the yielded item to `out`.
        b.store_local("x");
        b.load_local("out");
        b.load_method("append");
        b.load_local("x");
        b.op_u8(Opcode::CallMethod, 1);
        b.op(Opcode::Pop);
        b.jump(Opcode::Jump, top);
        b.bind(end);
        b.load_local("out");
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::List(vec![
            Object::Int(0),
            Object::Int(1),
            Object::Int(2),
            Object::Int(3),
            Object::Int(4)
        ])
    );
}

#[test]
fn string_repetition_past_the_cap_fails() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str(&"x".repeat(1024));
        b.load_const(pyrite::Const::Int(1_000_000));
        b.op(Opcode::BinaryMul);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "MemoryError");
}

#[test]
fn membership_on_strings_and_containers() {
    let mut interp = Interp::new();
    // "ell" in "hello"
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("ell");
        b.load_str("hello");
        b.op(Opcode::CompareIn);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));

    // 3 in [1, 2, 3]
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(3);
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.op_u16(Opcode::BuildList, 3);
        b.op(Opcode::CompareIn);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));

    // 4 not in {1, 2, 3}
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(4);
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.op_u16(Opcode::BuildSet, 3);
        b.op(Opcode::CompareNotIn);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
}

#[test]
fn small_int_identity_scenario() {
    let mut interp = Interp::new();
    let build = |interp: &mut Interp, value: i64| -> Rc<Code> {
        let mut b = interp.builder("<module>", "test.py");
        b.load_const(pyrite::Const::Int(value));
        b.store_local("a");
        b.load_const(pyrite::Const::Int(value));
        b.store_local("b");
        b.load_local("a");
        b.load_local("b");
        b.op(Opcode::CompareIs);
        b.ret();
        b.finish()
    };
    let code = build(&mut interp, 5);
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
    let code = build(&mut interp, 1000);
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(false));

    // a == b still holds for the large pair.
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_const(pyrite::Const::Int(1000));
        b.load_const(pyrite::Const::Int(1000));
        b.op(Opcode::CompareEq);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
}

#[test]
fn percent_formatting() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("%s scored %05.1f%% on %d tries");
        b.load_str("ada");
        b.load_const(pyrite::Const::Float(87.25));
        b.load_int(3);
        b.op_u16(Opcode::BuildTuple, 3);
        b.op(Opcode::BinaryMod);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Str("ada scored 087.2% on 3 tries".to_owned())
    );
}

#[test]
fn unpack_sequence_and_star() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        // first, *middle, last = [1, 2, 3, 4]
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.load_int(4);
        b.op_u16(Opcode::BuildList, 4);
        b.op_packed(Opcode::UnpackEx, 1, 1);
        b.store_local("first");
        b.store_local("middle");
        b.store_local("last");
        b.load_local("first");
        b.load_local("middle");
        b.load_local("last");
        b.op_u16(Opcode::BuildTuple, 3);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            Object::List(vec![Object::Int(2), Object::Int(3)]),
            Object::Int(4)
        ])
    );
}
