//! Calling convention: binding, defaults, keywords, star-args, closures.

use std::rc::Rc;

use pyrite::{Code, CodeFlags, Interp, Object, Opcode};

/// `def add(a, b): return a + b`
fn add_function(interp: &mut Interp) -> Rc<Code> {
    let mut f = interp.builder("add", "test.py");
    f.params(&["a", "b"]);
    f.load_local("a");
    f.load_local("b");
    f.op(Opcode::BinaryAdd);
    f.ret();
    f.finish()
}

#[test]
fn positional_call() {
    let mut interp = Interp::new();
    let add = add_function(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(add, 0);
        b.store_local("add");
        b.load_local("add");
        b.load_int(2);
        b.load_int(3);
        b.call(2);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(5));
}

#[test]
fn keyword_call_binds_by_name() {
    let mut interp = Interp::new();
    let sub = {
        let mut f = interp.builder("sub", "test.py");
        f.params(&["a", "b"]);
        f.load_local("a");
        f.load_local("b");
        f.op(Opcode::BinarySub);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(sub, 0);
        b.store_local("sub");
        b.load_local("sub");
        // sub(b=3, a=10) -> 7
        b.load_int(3);
        b.load_int(10);
        b.load_str("b");
        b.load_str("a");
        b.op_u16(Opcode::BuildTuple, 2);
        b.op_u8(Opcode::CallKw, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(7));
}

#[test]
fn defaults_fill_missing_trailing_arguments() {
    let mut interp = Interp::new();
    let f = {
        let mut f = interp.builder("scale", "test.py");
        f.params(&["x", "factor"]);
        f.load_local("x");
        f.load_local("factor");
        f.op(Opcode::BinaryMul);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        // defaults tuple (10,) then MakeFunction with flag bit 1
        b.load_int(10);
        b.op_u16(Opcode::BuildTuple, 1);
        b.make_function(f, 1);
        b.store_local("scale");
        b.load_local("scale");
        b.load_int(4);
        b.call(1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(40));
}

#[test]
fn varargs_and_varkeywords_collect_extras() {
    let mut interp = Interp::new();
    let f = {
        let mut f = interp.builder("gather", "test.py");
        f.params(&["first"]);
        f.varargs("rest");
        f.varkeywords("extras");
        // return (first, rest, len(extras))
        f.load_local("first");
        f.load_local("rest");
        f.load_global("len");
        f.load_local("extras");
        f.call(1);
        f.op_u16(Opcode::BuildTuple, 3);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(f, 0);
        b.store_local("gather");
        b.load_local("gather");
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.load_int(9);
        b.load_str("k");
        b.op_u16(Opcode::BuildTuple, 1);
        b.op_u8(Opcode::CallKw, 4);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            Object::Tuple(vec![Object::Int(2), Object::Int(3)]),
            Object::Int(1)
        ])
    );
}

#[test]
fn arity_errors_are_type_errors() {
    let mut interp = Interp::new();
    let add = add_function(&mut interp);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(add, 0);
        b.store_local("add");
        b.load_local("add");
        b.load_int(1);
        b.call(1);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert!(err.message.unwrap().contains("missing required argument"));
}

#[test]
fn closures_share_cells() {
    let mut interp = Interp::new();

    // def counter():
    //     count = 0
    //     def bump():
    //         nonlocal count
    //         count = count + 1
    //         return count
    //     return bump
    let bump = {
        let mut f = interp.builder("bump", "test.py");
        let slot = f.free_var("count");
        f.op_u16(Opcode::LoadDeref, slot);
        f.load_int(1);
        f.op(Opcode::BinaryAdd);
        f.op_u16(Opcode::StoreDeref, slot);
        f.op_u16(Opcode::LoadDeref, slot);
        f.ret();
        f.finish()
    };
    let counter = {
        let mut f = interp.builder("counter", "test.py");
        let cell = f.cell_var("count");
        f.load_int(0);
        f.op_u16(Opcode::StoreDeref, cell);
        f.op_u16(Opcode::LoadClosure, cell);
        f.op_u16(Opcode::BuildTuple, 1);
        f.make_function(bump, 4);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(counter, 0);
        b.store_local("counter");
        b.load_local("counter");
        b.call(0);
        b.store_local("bump");
        b.load_local("bump");
        b.call(0);
        b.op(Opcode::Pop);
        b.load_local("bump");
        b.call(0);
        b.op(Opcode::Pop);
        b.load_local("bump");
        b.call(0);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(3));
}

#[test]
fn recursion_works_through_globals() {
    let mut interp = Interp::new();
    // def fact(n): return 1 if n <= 1 else n * fact(n - 1)
    let fact = {
        let mut f = interp.builder("fact", "test.py");
        f.params(&["n"]);
        let recurse = f.label();
        f.load_local("n");
        f.load_int(1);
        f.jump(Opcode::GtIntJumpIfFalse, recurse);
        // n > 1: n * fact(n - 1)
        f.load_local("n");
        f.load_global("fact");
        f.load_local("n");
        f.load_int(1);
        f.op(Opcode::BinarySub);
        f.call(1);
        f.op(Opcode::BinaryMul);
        f.ret();
        f.bind(recurse);
        f.load_int(1);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(fact, 0);
        b.store_global("fact");
        b.load_global("fact");
        b.load_int(10);
        b.call(1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(3_628_800));
}

#[test]
fn call_ex_spreads_args_and_kwargs() {
    let mut interp = Interp::new();
    let f = {
        let mut f = interp.builder("combine", "test.py");
        f.params(&["a", "b", "c"]);
        f.load_local("a");
        f.load_local("b");
        f.op(Opcode::BinaryAdd);
        f.load_local("c");
        f.op(Opcode::BinaryAdd);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(f, 0);
        b.store_local("combine");
        b.load_local("combine");
        // *(1, 2)
        b.load_int(1);
        b.load_int(2);
        b.op_u16(Opcode::BuildTuple, 2);
        // **{"c": 30}
        b.load_str("c");
        b.load_int(30);
        b.op_u16(Opcode::BuildMap, 1);
        b.op_u8(Opcode::CallEx, 1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(33));
}

#[test]
fn generator_flag_makes_calls_return_generators() {
    let mut interp = Interp::new();
    let g = {
        let mut f = interp.builder("gen", "test.py");
        f.set_flags(CodeFlags::GENERATOR);
        f.load_int(1);
        f.op(Opcode::YieldValue);
        f.op(Opcode::Pop);
        f.op(Opcode::LoadNone);
        f.ret();
        f.finish()
    };
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.make_function(g, 0);
        b.call(0);
        // next(g) pulls the first yield.
        b.store_local("g");
        b.load_global("next");
        b.load_local("g");
        b.call(1);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(1));
}
