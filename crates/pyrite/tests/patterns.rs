//! Structural pattern matching opcodes.

use pyrite::{Interp, Object, Opcode};

#[test]
fn sequence_pattern_with_star_capture() {
    // match [1, 2, 3, 4]:
    //     case [first, *middle, last]: (first, middle, last)
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        let no_match = b.label();
        let end = b.label();
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.load_int(4);
        b.op_u16(Opcode::BuildList, 4);
        b.op(Opcode::MatchSequence);
        b.jump(Opcode::PopJumpIfFalse, no_match);
        b.op_u16(Opcode::MatchStar, 2);
        b.jump(Opcode::PopJumpIfFalse, no_match);
        b.op_packed(Opcode::ExtractStar, 1, 1);
        b.store_local("first");
        b.store_local("middle");
        b.store_local("last");
        b.load_local("first");
        b.load_local("middle");
        b.load_local("last");
        b.op_u16(Opcode::BuildTuple, 3);
        b.ret();
        b.bind(no_match);
        b.op(Opcode::Pop);
        b.op(Opcode::LoadNone);
        b.ret();
        b.bind(end);
        b.op(Opcode::Nop);
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

#[test]
fn sequence_pattern_rejects_non_sequences() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("not-a-sequence");
        b.op(Opcode::MatchSequence);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(false));
}

#[test]
fn mapping_pattern_collects_keys_atomically() {
    let mut interp = Interp::new();
    // match {"x": 1, "y": 2}:
    //     case {"x": a}: found keys
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("x");
        b.load_int(1);
        b.load_str("y");
        b.load_int(2);
        b.op_u16(Opcode::BuildMap, 2);
        b.op(Opcode::MatchMapping);
        let fail = b.label();
        b.jump(Opcode::PopJumpIfFalse, fail);
        b.load_str("x");
        b.op_u16(Opcode::BuildTuple, 1);
        b.op_u16(Opcode::MatchKeys, 1);
        // Stack: [subject, values_or_none]
        b.ret();
        b.bind(fail);
        b.op(Opcode::Pop);
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Tuple(vec![Object::Int(1)]));

    // A missing key yields None (atomic failure).
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("x");
        b.load_int(1);
        b.op_u16(Opcode::BuildMap, 1);
        b.load_str("x");
        b.load_str("missing");
        b.op_u16(Opcode::BuildTuple, 2);
        b.op_u16(Opcode::MatchKeys, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::None);
}

#[test]
fn copy_dict_without_matched_keys() {
    let mut interp = Interp::new();
    // case {"x": _, **rest} on {"x": 1, "y": 2} -> rest == {"y": 2}
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("x");
        b.load_int(1);
        b.load_str("y");
        b.load_int(2);
        b.op_u16(Opcode::BuildMap, 2);
        b.load_str("x");
        b.op_u16(Opcode::BuildTuple, 1);
        b.op_u16(Opcode::CopyDictWithoutKeys, 1);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Dict(vec![(Object::Str("y".to_owned()), Object::Int(2))])
    );
}

#[test]
fn class_pattern_extracts_match_args() {
    let mut interp = Interp::new();
    // class Point:
    //     __match_args__ = ("x", "y")
    //     def __init__(self, x, y): ...
    // match Point(3, 4):
    //     case Point(a, b): (a, b)
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self", "x", "y"]);
        f.load_local("x");
        f.load_local("self");
        f.store_attr("x");
        f.load_local("y");
        f.load_local("self");
        f.store_attr("y");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Point", "test.py");
        f.load_str("x");
        f.load_str("y");
        f.op_u16(Opcode::BuildTuple, 2);
        f.store_name("__match_args__");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.op(Opcode::LoadBuildClass);
        b.make_function(body, 0);
        b.load_str("Point");
        b.call(2);
        b.store_global("Point");
        b.load_global("Point");
        b.load_int(3);
        b.load_int(4);
        b.call(2);
        // subject on stack; match against Point with 2 positional slots
        b.load_global("Point");
        b.op_u8(Opcode::MatchClass, 2);
        // Stack: [subject, extracted_or_none]
        b.op(Opcode::Rot2);
        b.op(Opcode::Pop);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(3), Object::Int(4)])
    );
}

#[test]
fn class_pattern_fails_on_wrong_type() {
    let mut interp = Interp::new();
    let body = {
        let mut f = interp.builder("Point", "test.py");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.op(Opcode::LoadBuildClass);
        b.make_function(body, 0);
        b.load_str("Point");
        b.call(2);
        b.store_global("Point");
        b.load_int(5);
        b.load_global("Point");
        b.op_u8(Opcode::MatchClass, 0);
        b.op(Opcode::Rot2);
        b.op(Opcode::Pop);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::None);
}

#[test]
fn get_len_peeks_without_popping() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(1);
        b.load_int(2);
        b.op_u16(Opcode::BuildList, 2);
        b.op(Opcode::GetLen);
        // Stack: [list, 2] — keep both to prove the subject survived.
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![
            Object::List(vec![Object::Int(1), Object::Int(2)]),
            Object::Int(2)
        ])
    );
}
