//! Value-model properties: hashing, equality, slicing, conversions,
//! native builtins, and userdata metatables.

use std::sync::Arc;

use pyrite::{Interp, MetaTable, Object, Opcode, UserProperty, UserValue, register_metatable};

#[test]
fn hash_agrees_across_numeric_widenings() {
    let mut interp = Interp::new();
    // (hash(True) == hash(1), hash(1) == hash(1.0))
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("hash");
        b.op(Opcode::LoadTrue);
        b.call(1);
        b.load_global("hash");
        b.load_int(1);
        b.call(1);
        b.op(Opcode::CompareEq);
        b.load_global("hash");
        b.load_int(1);
        b.call(1);
        b.load_global("hash");
        b.load_const(pyrite::Const::Float(1.0));
        b.call(1);
        b.op(Opcode::CompareEq);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Bool(true), Object::Bool(true)])
    );
}

#[test]
fn equal_keys_collapse_in_dicts() {
    let mut interp = Interp::new();
    // d = {}; d[1] = "a"; d[True] = "b"; d[1.0] = "c"; (len(d), d[1])
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.op(Opcode::BuildEmptyDict);
        b.store_local("d");
        for (key, text) in [("int", "a"), ("bool", "b"), ("float", "c")] {
            b.load_str(text);
            b.load_local("d");
            match key {
                "int" => {
                    b.load_int(1);
                }
                "bool" => {
                    b.op(Opcode::LoadTrue);
                }
                _ => {
                    b.load_const(pyrite::Const::Float(1.0));
                }
            }
            b.op(Opcode::StoreSubscr);
        }
        b.load_global("len");
        b.load_local("d");
        b.call(1);
        b.load_local("d");
        b.load_int(1);
        b.op(Opcode::BinarySubscr);
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Str("c".to_owned())])
    );
}

#[test]
fn unhashable_keys_are_rejected() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        // hash([]) raises TypeError
        b.load_global("hash");
        b.op(Opcode::BuildEmptyList);
        b.call(1);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert!(err.message.unwrap().contains("unhashable"));
}

#[test]
fn slicing_round_trips() {
    let mut interp = Interp::new();
    // s = "abcdef"; (s[::-1][::-1] == s, s[1:4], s[-2:])
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("abcdef");
        b.store_local("s");

        b.load_local("s");
        b.op(Opcode::LoadNone);
        b.op(Opcode::LoadNone);
        b.load_const(pyrite::Const::Int(-1));
        b.op_u8(Opcode::BuildSlice, 3);
        b.op(Opcode::BinarySubscr);
        b.op(Opcode::LoadNone);
        b.op(Opcode::LoadNone);
        b.load_const(pyrite::Const::Int(-1));
        b.op_u8(Opcode::BuildSlice, 3);
        b.op(Opcode::BinarySubscr);
        b.load_local("s");
        b.op(Opcode::CompareEq);

        b.load_local("s");
        b.load_int(1);
        b.load_int(4);
        b.op_u8(Opcode::BuildSlice, 2);
        b.op(Opcode::BinarySubscr);

        b.load_local("s");
        b.load_const(pyrite::Const::Int(-2));
        b.op(Opcode::LoadNone);
        b.op_u8(Opcode::BuildSlice, 2);
        b.op(Opcode::BinarySubscr);

        b.op_u16(Opcode::BuildTuple, 3);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![
            Object::Bool(true),
            Object::Str("bcd".to_owned()),
            Object::Str("ef".to_owned())
        ])
    );
}

#[test]
fn string_indexing_counts_code_points() {
    let mut interp = Interp::new();
    // s = "héllo"; (len(s), s[1], s[-1])
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_str("héllo");
        b.store_local("s");
        b.load_global("len");
        b.load_local("s");
        b.call(1);
        b.load_local("s");
        b.load_int(1);
        b.op(Opcode::BinarySubscr);
        b.load_local("s");
        b.load_const(pyrite::Const::Int(-1));
        b.op(Opcode::BinarySubscr);
        b.op_u16(Opcode::BuildTuple, 3);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![
            Object::Int(5),
            Object::Str("é".to_owned()),
            Object::Str("o".to_owned())
        ])
    );
}

#[test]
fn int_str_round_trip() {
    let mut interp = Interp::new();
    for n in [0_i64, 42, -7, i64::MAX, i64::MIN + 1] {
        let code = {
            let mut b = interp.builder("<module>", "test.py");
            b.load_global("int");
            b.load_global("str");
            b.load_const(pyrite::Const::Int(n));
            b.call(1);
            b.call(1);
            b.ret();
            b.finish()
        };
        assert_eq!(interp.execute(&code).unwrap(), Object::Int(n), "round-trip of {n}");
    }
}

#[test]
fn tuple_of_list_round_trip() {
    let mut interp = Interp::new();
    // tuple(list((1, 2, 3))) == (1, 2, 3)
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("tuple");
        b.load_global("list");
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.op_u16(Opcode::BuildTuple, 3);
        b.call(1);
        b.call(1);
        b.load_int(1);
        b.load_int(2);
        b.load_int(3);
        b.op_u16(Opcode::BuildTuple, 3);
        b.op(Opcode::CompareEq);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
}

#[test]
fn native_builtins_round_trip_and_classify_errors() {
    let mut interp = Interp::new();
    interp.register_builtin(
        "add_ints",
        Arc::new(|args, _kwargs| {
            let (Some(Object::Int(a)), Some(Object::Int(b))) = (args.first(), args.get(1)) else {
                return Err("TypeError: add_ints expects two ints".to_owned());
            };
            Ok(Object::Int(a + b))
        }),
    );
    let ok = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("add_ints");
        b.load_int(20);
        b.load_int(22);
        b.call(2);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&ok).unwrap(), Object::Int(42));

    // Foreign errors classify by message prefix.
    let bad = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("add_ints");
        b.load_str("x");
        b.load_int(1);
        b.call(2);
        b.ret();
        b.finish()
    };
    let err = interp.execute(&bad).unwrap_err();
    assert_eq!(err.type_name, "TypeError");
    assert_eq!(err.message.as_deref(), Some("add_ints expects two ints"));
}

#[derive(Debug)]
struct Gauge {
    level: i64,
}

impl UserValue for Gauge {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn type_name(&self) -> &str {
        "Gauge"
    }
}

#[test]
fn userdata_metatables_expose_methods_and_properties() {
    let table = MetaTable::new("Gauge")
        .method("bump", |data, args| {
            let gauge = data.as_any_mut().downcast_mut::<Gauge>().expect("gauge receiver");
            let amount = match args.first() {
                Some(Object::Int(n)) => *n,
                _ => 1,
            };
            gauge.level += amount;
            Ok(Object::Int(gauge.level))
        })
        .property(
            "level",
            UserProperty {
                get: Arc::new(|data| {
                    let gauge = data.as_any().downcast_ref::<Gauge>().expect("gauge receiver");
                    Ok(Object::Int(gauge.level))
                }),
                set: None,
            },
        );
    let type_id = register_metatable(table);

    let mut interp = Interp::new();
    interp
        .install_userdata("gauge", type_id, Box::new(Gauge { level: 10 }))
        .unwrap();

    // (gauge.bump(5), gauge.level)
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("gauge");
        b.load_method("bump");
        b.load_int(5);
        b.op_u8(Opcode::CallMethod, 1);
        b.load_global("gauge");
        b.load_attr("level");
        b.op_u16(Opcode::BuildTuple, 2);
        b.ret();
        b.finish()
    };
    assert_eq!(
        interp.execute(&code).unwrap(),
        Object::Tuple(vec![Object::Int(15), Object::Int(15)])
    );
}
