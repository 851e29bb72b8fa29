//! Dunder protocols: operators, truth, context managers, user iterators.

use std::rc::Rc;

use pyrite::{Code, CodeBuilder, Interp, Object, Opcode};

fn emit_class(b: &mut CodeBuilder<'_>, body: Rc<Code>, name: &str) {
    b.op(Opcode::LoadBuildClass);
    b.make_function(body, 0);
    b.load_str(name);
    b.call(2);
}

#[test]
fn add_dunder_with_reflected_fallback() {
    let mut interp = Interp::new();
    // class Unit:
    //     def __init__(self, n): self.n = n
    //     def __add__(self, other): return self.n + other
    //     def __radd__(self, other): return other + self.n + 100
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self", "n"]);
        f.load_local("n");
        f.load_local("self");
        f.store_attr("n");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let add = {
        let mut f = interp.builder("__add__", "test.py");
        f.params(&["self", "other"]);
        f.load_local("self");
        f.load_attr("n");
        f.load_local("other");
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    let radd = {
        let mut f = interp.builder("__radd__", "test.py");
        f.params(&["self", "other"]);
        f.load_local("other");
        f.load_local("self");
        f.load_attr("n");
        f.op(Opcode::BinaryAdd);
        f.load_const(pyrite::Const::Int(100));
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Unit", "test.py");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.make_function(add, 0);
        f.store_name("__add__");
        f.make_function(radd, 0);
        f.store_name("__radd__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Unit");
        b.store_global("Unit");
        // Unit(5) + 2 -> __add__ -> 7
        b.load_global("Unit");
        b.load_int(5);
        b.call(1);
        b.load_int(2);
        b.op(Opcode::BinaryAdd);
        // 2 + Unit(5) -> __radd__ -> 107
        b.load_int(2);
        b.load_global("Unit");
        b.load_int(5);
        b.call(1);
        b.op(Opcode::BinaryAdd);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(7), Object::Int(107)])
    );
}

#[test]
fn eq_dunder_overrides_identity() {
    let mut interp = Interp::new();
    // class Tag:
    //     def __init__(self, v): self.v = v
    //     def __eq__(self, other): return self.v == other.v
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self", "v"]);
        f.load_local("v");
        f.load_local("self");
        f.store_attr("v");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let eq = {
        let mut f = interp.builder("__eq__", "test.py");
        f.params(&["self", "other"]);
        f.load_local("self");
        f.load_attr("v");
        f.load_local("other");
        f.load_attr("v");
        f.op(Opcode::CompareEq);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Tag", "test.py");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.make_function(eq, 0);
        f.store_name("__eq__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Tag");
        b.store_global("Tag");
        b.load_global("Tag");
        b.load_int(3);
        b.call(1);
        b.load_global("Tag");
        b.load_int(3);
        b.call(1);
        b.op(Opcode::CompareEq);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
}

#[test]
fn with_blocks_enter_and_exit() {
    let mut interp = Interp::new();
    // class Ctx:
    //     def __enter__(self): return 42
    //     def __exit__(self, t, v, tb): return False
    let enter = {
        let mut f = interp.builder("__enter__", "test.py");
        f.params(&["self"]);
        f.load_int(42);
        f.ret();
        f.finish()
    };
    let exit = {
        let mut f = interp.builder("__exit__", "test.py");
        f.params(&["self", "t", "v", "tb"]);
        f.load_int(1);
        f.store_global("exited");
        f.op(Opcode::LoadFalse);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Ctx", "test.py");
        f.make_function(enter, 0);
        f.store_name("__enter__");
        f.make_function(exit, 0);
        f.store_name("__exit__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    // with Ctx() as x: out = x
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Ctx");
        b.store_global("Ctx");
        b.load_global("Ctx");
        b.call(0);
        let cleanup = b.label();
        b.jump(Opcode::SetupWith, cleanup);
        b.store_local("x");
        b.load_local("x");
        b.store_local("out");
        b.op(Opcode::PopBlock);
        b.op(Opcode::WithCleanup);
        b.bind(cleanup);
        b.load_local("out");
        b.load_global("exited");
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(42), Object::Int(1)])
    );
}

#[test]
fn exit_returning_true_suppresses_the_exception() {
    let mut interp = Interp::new();
    let enter = {
        let mut f = interp.builder("__enter__", "test.py");
        f.params(&["self"]);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let exit = {
        let mut f = interp.builder("__exit__", "test.py");
        f.params(&["self", "t", "v", "tb"]);
        f.op(Opcode::LoadTrue);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Muffle", "test.py");
        f.make_function(enter, 0);
        f.store_name("__enter__");
        f.make_function(exit, 0);
        f.store_name("__exit__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    // with Muffle(): 1/0
    // execution continues after the block
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Muffle");
        b.store_global("Muffle");
        b.load_global("Muffle");
        b.call(0);
        let after = b.label();
        b.jump(Opcode::SetupWith, after);
        b.op(Opcode::Pop);
        b.load_int(1);
        b.load_int(0);
        b.op(Opcode::BinaryDiv);
        b.op(Opcode::Pop);
        b.op(Opcode::PopBlock);
        b.op(Opcode::WithCleanup);
        b.bind(after);
        b.load_str("survived");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Str("survived".to_owned()));
}

#[test]
fn user_iterators_drive_for_loops() {
    let mut interp = Interp::new();
    // class Count:
    //     def __init__(self): self.n = 0
    //     def __iter__(self): return self
    //     def __next__(self):
    //         if self.n >= 3: raise StopIteration
    //         self.n = self.n + 1
    //         return self.n
    let init = {
        let mut f = interp.builder("__init__", "test.py");
        f.params(&["self"]);
        f.load_int(0);
        f.load_local("self");
        f.store_attr("n");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let iter_m = {
        let mut f = interp.builder("__iter__", "test.py");
        f.params(&["self"]);
        f.load_local("self");
        f.ret();
        f.finish()
    };
    let next_m = {
        let mut f = interp.builder("__next__", "test.py");
        f.params(&["self"]);
        let stop = f.label();
        f.load_local("self");
        f.load_attr("n");
        f.load_int(3);
        f.jump(Opcode::LtIntJumpIfFalse, stop);
        f.load_local("self");
        f.load_attr("n");
        f.load_int(1);
        f.op(Opcode::BinaryAdd);
        f.load_local("self");
        f.store_attr("n");
        f.load_local("self");
        f.load_attr("n");
        f.ret();
        f.bind(stop);
        f.load_global("StopIteration");
        f.op_u8(Opcode::RaiseVarargs, 1);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Count", "test.py");
        f.make_function(init, 0);
        f.store_name("__init__");
        f.make_function(iter_m, 0);
        f.store_name("__iter__");
        f.make_function(next_m, 0);
        f.store_name("__next__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Count");
        b.store_global("Count");
        b.load_int(0);
        b.store_local("total");
        b.load_global("Count");
        b.call(0);
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
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(6));
}

#[test]
fn callable_instances_dispatch_through_call() {
    let mut interp = Interp::new();
    let call = {
        let mut f = interp.builder("__call__", "test.py");
        f.params(&["self", "x"]);
        f.load_local("x");
        f.load_local("x");
        f.op(Opcode::BinaryMul);
        f.ret();
        f.finish()
    };
    let body = {
        let mut f = interp.builder("Square", "test.py");
        f.make_function(call, 0);
        f.store_name("__call__");
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_class(&mut b, body, "Square");
        b.store_global("Square");
        b.load_global("Square");
        b.call(0);
        b.load_int(7);
        b.call(1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(49));
}
