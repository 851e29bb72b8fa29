//! Demo programs assembled against the engine's builder.
//!
//! Each corresponds to a small source program; the equivalent source is
//! quoted above each builder.

use std::rc::Rc;

use pyrite::{Code, CodeFlags, Const, Interp, Opcode};

pub const DEMO_NAMES: &[&str] = &["fib", "countdown"];

/// ```text
/// a = 0
/// b = 1
/// n = 0
/// while n < 25:
///     a, b = b, a + b
///     n = n + 1
/// print(a)
/// a
/// ```
pub fn fib(interp: &mut Interp) -> Rc<Code> {
    let mut b = interp.builder("<module>", "fib.py");
    b.set_line(1);
    b.load_int(0);
    b.store_local("a");
    b.load_int(1);
    b.store_local("b");
    b.load_int(0);
    b.store_local("n");

    b.set_line(4);
    let top = b.label();
    let done = b.label();
    b.bind(top);
    b.load_local("n");
    b.op_i8(Opcode::LoadSmallInt, 25);
    b.jump(Opcode::LtIntJumpIfFalse, done);

    b.set_line(5);
    b.load_local("b");
    b.load_local("a");
    b.load_local("b");
    b.op(Opcode::AddIntFast);
    b.store_local("b");
    b.store_local("a");

    b.set_line(6);
    b.op_u8(Opcode::IncrementFast, 2);
    b.jump(Opcode::Jump, top);

    b.set_line(7);
    b.bind(done);
    b.load_global("print");
    b.load_local("a");
    b.call(1);
    b.op(Opcode::Pop);
    b.load_local("a");
    b.ret();
    b.finish()
}

/// ```text
/// def countdown(n):
///     while n > 0:
///         yield n
///         n = n - 1
///
/// total = 0
/// for value in countdown(5):
///     total = total + value
/// print(total)
/// total
/// ```
pub fn countdown(interp: &mut Interp) -> Rc<Code> {
    let gen_code = {
        let mut g = interp.builder("countdown", "countdown.py");
        g.params(&["n"]);
        g.set_flags(CodeFlags::GENERATOR);
        g.set_line(2);
        let top = g.label();
        let done = g.label();
        g.bind(top);
        g.load_local("n");
        g.load_int(0);
        g.jump(Opcode::GtIntJumpIfFalse, done);
        g.set_line(3);
        g.load_local("n");
        g.op(Opcode::YieldValue);
        g.op(Opcode::Pop);
        g.set_line(4);
        g.op_u8(Opcode::DecrementFast, 0);
        g.jump(Opcode::Jump, top);
        g.bind(done);
        g.op(Opcode::LoadNone);
        g.ret();
        g.finish()
    };

    let mut b = interp.builder("<module>", "countdown.py");
    b.set_line(6);
    b.make_function(gen_code, 0);
    b.store_local("countdown");
    b.load_int(0);
    b.store_local("total");

    b.set_line(7);
    b.load_local("countdown");
    b.op_i8(Opcode::LoadSmallInt, 5);
    b.call(1);
    b.op(Opcode::GetIter);
    let loop_top = b.label();
    let loop_end = b.label();
    b.bind(loop_top);
    b.jump(Opcode::ForIter, loop_end);
    b.store_local("value");
    b.set_line(8);
    b.load_local("total");
    b.load_local("value");
    b.op(Opcode::AddIntFast);
    b.store_local("total");
    b.jump(Opcode::Jump, loop_top);
    b.bind(loop_end);

    b.set_line(9);
    b.load_global("print");
    b.load_local("total");
    b.call(1);
    b.op(Opcode::Pop);
    b.load_local("total");
    b.ret();
    b.finish()
}
