//! Classes: construction, C3 linearization, descriptors, super, slots.

use std::rc::Rc;

use pyrite::{Code, CodeBuilder, Interp, Object, Opcode};

/// Emits `class <name>(<bases...>)` from a prepared body, leaving the
/// class on the stack.
fn emit_class(b: &mut CodeBuilder<'_>, body: Rc<Code>, name: &str, bases: &[&str]) {
    b.op(Opcode::LoadBuildClass);
    b.make_function(body, 0);
    b.load_str(name);
    for base in bases {
        b.load_name(base);
    }
    b.call(2 + u8::try_from(bases.len()).expect("few bases"));
}

/// A class body that just returns None (no members).
fn empty_body(interp: &mut Interp, name: &str) -> Rc<Code> {
    let mut f = interp.builder(name, "test.py");
    f.op(Opcode::LoadNone);
    f.ret();
    f.finish()
}

fn mro_names(interp: &mut Interp, program: Rc<Code>) -> Vec<String> {
    let result = interp.execute(&program).unwrap();
    let Object::Tuple(items) = result else {
        panic!("expected tuple, got {result:?}");
    };
    items
        .into_iter()
        .map(|item| match item {
            Object::Repr(text) => text,
            other => panic!("expected class repr, got {other:?}"),
        })
        .collect()
}

#[test]
fn c3_diamond_linearization() {
    let mut interp = Interp::new();
    let body_a = empty_body(&mut interp, "A");
    let body_b = empty_body(&mut interp, "B");
    let body_c = empty_body(&mut interp, "C");
    let body_d = empty_body(&mut interp, "D");
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body_a, "A", &[]);
        b.store_global("A");
        emit_class(&mut b, body_b, "B", &["A"]);
        b.store_global("B");
        emit_class(&mut b, body_c, "C", &["A"]);
        b.store_global("C");
        emit_class(&mut b, body_d, "D", &["B", "C"]);
        b.store_global("D");
        b.load_global("D");
        b.load_attr("__mro__");
        b.ret();
        b.finish()
    };
    let names = mro_names(&mut interp, code);
    assert_eq!(
        names,
        vec![
            "<class 'D'>",
            "<class 'B'>",
            "<class 'C'>",
            "<class 'A'>",
            "<class 'object'>"
        ]
    );
}

#[test]
fn inconsistent_hierarchy_fails_to_construct() {
    let mut interp = Interp::new();
    let body_a = empty_body(&mut interp, "A");
    let body_b = empty_body(&mut interp, "B");
    let body_c = empty_body(&mut interp, "C");
    let body_d = empty_body(&mut interp, "D");
    let body_e = empty_body(&mut interp, "E");
    let body_f = empty_body(&mut interp, "F");
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body_a, "A", &[]);
        b.store_global("A");
        emit_class(&mut b, body_b, "B", &["A"]);
        b.store_global("B");
        emit_class(&mut b, body_c, "C", &["A"]);
        b.store_global("C");
        emit_class(&mut b, body_d, "D", &["B", "C"]);
        b.store_global("D");
        emit_class(&mut b, body_e, "E", &["C", "B"]);
        b.store_global("E");
        emit_class(&mut b, body_f, "F", &["D", "E"]);
        b.store_global("F");
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert!(err.message.unwrap().contains("consistent method resolution order"));
}

#[test]
fn init_binds_instance_state() {
    let mut interp = Interp::new();
    // class Point:
    //     def __init__(self, x, y):
    //         self.x = x
    //         self.y = y
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
        f.make_function(init, 0);
        f.store_name("__init__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Point", &[]);
        b.store_global("Point");
        b.load_global("Point");
        b.load_int(3);
        b.load_int(4);
        b.call(2);
        b.store_local("p");
        b.load_local("p");
        b.load_attr("x");
        b.load_local("p");
        b.load_attr("y");
        b.op(Opcode::BinaryAdd);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(7));
}

#[test]
fn methods_bind_their_receiver() {
    let mut interp = Interp::new();
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self", "base"]);
        f.load_local("base");
        f.load_local("self");
        f.store_attr("base");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let bump = {
        let mut f = interp.builder("bump", "test.py");
        f.params(&["self", "amount"]);
        f.load_local("self");
        f.load_attr("base");
        f.load_local("amount");
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Counter", "test.py");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.make_function(bump, 0);
        f.store_name("bump");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Counter", &[]);
        b.store_global("Counter");
        b.load_global("Counter");
        b.load_int(10);
        b.call(1);
        b.store_local("c");
        b.load_local("c");
        b.load_method("bump");
        b.load_int(5);
        b.op_u8(Opcode::CallMethod, 1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(15));
}

#[test]
fn property_is_a_data_descriptor() {
    let mut interp = Interp::new();
    // class Box:
    //     def __init__(self, w): self._w = w
    //     def width(self): return self._w * 2
    //     width = property(width)
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self", "w"]);
        f.load_local("w");
        f.load_local("self");
        f.store_attr("_w");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let getter = {
        let mut f = interp.builder("width", "test.py");
        f.params(&["self"]);
        f.load_local("self");
        f.load_attr("_w");
        b_mul_two(&mut f);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Box", "test.py");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.load_name("property");
        f.make_function(getter, 0);
        f.call(1);
        f.store_name("width");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Box", &[]);
        b.store_global("Box");
        b.load_global("Box");
        b.load_int(6);
        b.call(1);
        b.load_attr("width");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(12));
}

fn b_mul_two(f: &mut CodeBuilder<'_>) {
    f.load_int(2);
    f.op(Opcode::BinaryMul);
}

#[test]
fn zero_arg_super_dispatches_up_the_mro() {
    let mut interp = Interp::new();
    // class A:
    //     def greet(self): return 1
    // class B(A):
    //     def greet(self): return super().greet() + 10
    let greet_a = {
        let mut f = interp.builder("greet", "test.py");
        f.params(&["self"]);
        f.load_int(1);
        f.ret();
        f.finish()
    };
    let body_a = {
        let mut f = interp.builder("A", "test.py");
        f.make_function(greet_a, 0);
        f.store_name("greet");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let greet_b = {
        let mut f = interp.builder("greet", "test.py");
        f.params(&["self"]);
        let class_slot = f.free_var("__class__");
        // Reference the cell so the closure layout includes it.
        f.op_u16(Opcode::LoadDeref, class_slot);
        f.op(Opcode::Pop);
        f.load_name("super");
        f.call(0);
        f.load_method("greet");
        f.op_u8(Opcode::CallMethod, 0);
        f.load_int(10);
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    let body_b = {
        let mut f = interp.builder("B", "test.py");
        let class_cell = f.cell_var("__class__");
        f.op_u16(Opcode::LoadClosure, class_cell);
        f.op_u16(Opcode::BuildTuple, 1);
        f.make_function(greet_b, 4);
        f.store_name("greet");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body_a, "A", &[]);
        b.store_global("A");
        emit_class(&mut b, body_b, "B", &["A"]);
        b.store_global("B");
        b.load_global("B");
        b.call(0);
        b.load_method("greet");
        b.op_u8(Opcode::CallMethod, 0);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(11));
}

#[test]
fn slots_reject_undeclared_attributes() {
    let mut interp = Interp::new();
    // class Thin:
    //     __slots__ = ("x",)
    let body = {
        let mut f = interp.builder("Thin", "test.py");
        f.load_str("x");
        f.op_u16(Opcode::BuildTuple, 1);
        f.store_name("__slots__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let make_program = |interp: &mut Interp, attr: &str, body: Rc<Code>| {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Thin", &[]);
        b.store_global("Thin");
        b.load_global("Thin");
        b.call(0);
        b.store_local("t");
        b.load_int(5);
        b.load_local("t");
        b.store_attr(attr);
        b.load_local("t");
        b.load_attr(attr);
        b.ret();
        b.finish()
    };
    let ok = make_program(&mut interp, "x", Rc::clone(&body));
    assert_eq!(interp.execute(&ok).unwrap(), Object::Int(5));

    let bad = make_program(&mut interp, "y", body);
    let err = interp.execute(&bad).unwrap_err();
    assert_eq!(err.type_name, "AttributeError");
}

#[test]
fn isinstance_follows_the_mro() {
    let mut interp = Interp::new();
    let body_a = empty_body(&mut interp, "A");
    let body_b = empty_body(&mut interp, "B");
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body_a, "A", &[]);
        b.store_global("A");
        emit_class(&mut b, body_b, "B", &["A"]);
        b.store_global("B");
        b.load_global("B");
        b.call(0);
        b.store_local("obj");
        b.load_global("isinstance");
        b.load_local("obj");
        b.load_global("A");
        b.call(2);
        b.load_global("isinstance");
        b.load_int(3);
        b.load_global("A");
        b.call(2);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Bool(true), Object::Bool(false)])
    );
}
