//! The import system: loaders, filesystem search, circular imports,
//! and the cross-interpreter load barrier.

use std::{path::Path, rc::Rc};

use pyrite::{Code, Exception, Interp, Interns, Object, Opcode};

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("pyrite-imports-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Emits `import <name>` (plain form, module bound to the stack).
fn emit_import(b: &mut pyrite::CodeBuilder<'_>, name: &str) {
    b.load_int(0);
    b.op(Opcode::LoadNone);
    let idx = b.name_idx(name);
    b.op_u16(Opcode::ImportName, idx);
}

/// Emits `from <module> import <attr>`, leaving the attribute on TOS.
fn emit_import_from(b: &mut pyrite::CodeBuilder<'_>, module: &str, attr: &str) {
    b.load_int(0);
    b.load_str(attr);
    b.op_u16(Opcode::BuildTuple, 1);
    let idx = b.name_idx(module);
    b.op_u16(Opcode::ImportName, idx);
    let attr_idx = b.name_idx(attr);
    b.op_u16(Opcode::ImportFrom, attr_idx);
    b.op(Opcode::Rot2);
    b.op(Opcode::Pop);
}

#[test]
fn registered_loaders_materialize_modules() {
    let mut interp = Interp::new();
    interp.register_module(
        "config",
        vec![
            ("answer".to_owned(), Object::Int(42)),
            ("name".to_owned(), Object::Str("pyrite".to_owned())),
        ],
    );
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "config");
        b.load_attr("answer");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(42));
}

#[test]
fn importing_twice_returns_the_same_module() {
    let mut interp = Interp::new();
    interp.register_module("single", vec![("x".to_owned(), Object::Int(1))]);
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "single");
        emit_import(&mut b, "single");
        b.op(Opcode::CompareIs);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Bool(true));
}

#[test]
fn missing_modules_raise_module_not_found() {
    let mut interp = Interp::new();
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "does_not_exist");
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ModuleNotFoundError");
    assert!(err.message.unwrap().contains("does_not_exist"));
}

/// Compile callback assembling the circular-import pair:
///
/// ```text
/// # a.py                      # b.py
/// def g(): return 2           from a import g
/// from b import f             def f(): return 1
/// ```
fn circular_compile(path: &Path, interns: &mut Interns) -> Result<Rc<Code>, Exception> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match stem {
        "a" => {
            let g = {
                let mut f = pyrite::CodeBuilder::new(interns, "g", "a.py");
                f.load_int(2);
                f.ret();
                f.finish()
            };
            let mut b = pyrite::CodeBuilder::new(interns, "<module>", "a.py");
            b.make_function(g, 0);
            b.store_global("g");
            emit_import_from(&mut b, "b", "f");
            b.store_global("f");
            b.op(Opcode::LoadNone);
            b.ret();
            Ok(b.finish())
        }
        "b" => {
            let f_code = {
                let mut f = pyrite::CodeBuilder::new(interns, "f", "b.py");
                f.load_int(1);
                f.ret();
                f.finish()
            };
            let mut b = pyrite::CodeBuilder::new(interns, "<module>", "b.py");
            emit_import_from(&mut b, "a", "g");
            b.store_global("g");
            b.make_function(f_code, 0);
            b.store_global("f");
            b.op(Opcode::LoadNone);
            b.ret();
            Ok(b.finish())
        }
        other => Err(Exception::new("ImportError", format!("unknown module {other}"))),
    }
}

#[test]
fn circular_imports_complete_with_partial_views() {
    let dir = temp_dir("circular");
    std::fs::write(dir.join("a.py"), "# assembled by the compile callback\n").unwrap();
    std::fs::write(dir.join("b.py"), "# assembled by the compile callback\n").unwrap();

    let mut interp = Interp::new();
    interp.add_search_path(&dir);
    interp.set_compile_callback(Box::new(circular_compile));

    // import a; a.f() + a.g()
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "a");
        b.store_local("a");
        b.load_local("a");
        b.load_method("f");
        b.op_u8(Opcode::CallMethod, 0);
        b.load_local("a");
        b.load_method("g");
        b.op_u8(Opcode::CallMethod, 0);
        b.op(Opcode::BinaryAdd);
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(3));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn failed_module_bodies_leave_no_cache_entry() {
    let dir = temp_dir("failing");
    std::fs::write(dir.join("broken.py"), "# assembled\n").unwrap();

    let mut interp = Interp::new();
    interp.add_search_path(&dir);
    interp.set_compile_callback(Box::new(|path, interns| {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        assert_eq!(stem, "broken");
        let mut b = pyrite::CodeBuilder::new(interns, "<module>", "broken.py");
        b.load_int(1);
        b.load_int(0);
        b.op(Opcode::BinaryDiv);
        b.ret();
        Ok(b.finish())
    }));

    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "broken");
        b.ret();
        b.finish()
    };
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");

    // The failed module is not cached; importing again re-executes.
    let err = interp.execute(&code).unwrap_err();
    assert_eq!(err.type_name, "ZeroDivisionError");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn import_star_copies_public_names() {
    let mut interp = Interp::new();
    interp.register_module(
        "exports",
        vec![
            ("visible".to_owned(), Object::Int(5)),
            ("_hidden".to_owned(), Object::Int(9)),
        ],
    );
    let code = {
        let mut b = interp.builder("<module>", "test.py");
        emit_import(&mut b, "exports");
        b.op(Opcode::ImportStar);
        b.load_global("visible");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute(&code).unwrap(), Object::Int(5));

    let hidden = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("_hidden");
        b.ret();
        b.finish()
    };
    let err = interp.execute(&hidden).unwrap_err();
    assert_eq!(err.type_name, "NameError");
}

#[test]
fn concurrent_interpreters_serialize_same_name_loads() {
    let dir = temp_dir("concurrent");
    std::fs::write(dir.join("shared.py"), "# assembled\n").unwrap();

    let make_interp = |dir: std::path::PathBuf| {
        std::thread::spawn(move || {
            let mut interp = Interp::new();
            interp.add_search_path(&dir);
            interp.set_compile_callback(Box::new(|_, interns| {
                let mut b = pyrite::CodeBuilder::new(interns, "<module>", "shared.py");
                b.load_int(11);
                b.store_global("value");
                b.op(Opcode::LoadNone);
                b.ret();
                Ok(b.finish())
            }));
            let code = {
                let mut b = interp.builder("<module>", "test.py");
                emit_import(&mut b, "shared");
                b.load_attr("value");
                b.ret();
                b.finish()
            };
            interp.execute(&code).unwrap()
        })
    };

    let first = make_interp(dir.clone());
    let second = make_interp(dir.clone());
    assert_eq!(first.join().unwrap(), Object::Int(11));
    assert_eq!(second.join().unwrap(), Object::Int(11));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn execute_in_module_targets_a_named_namespace() {
    let mut interp = Interp::new();
    let store = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_int(123);
        b.store_global("marker");
        b.op(Opcode::LoadNone);
        b.ret();
        b.finish()
    };
    interp.execute_in_module(&store, "scratch").unwrap();

    // The main module does not see it...
    let probe = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("marker");
        b.ret();
        b.finish()
    };
    assert!(interp.execute(&probe).is_err());

    // ...but the named module does.
    let read = {
        let mut b = interp.builder("<module>", "test.py");
        b.load_global("marker");
        b.ret();
        b.finish()
    };
    assert_eq!(interp.execute_in_module(&read, "scratch").unwrap(), Object::Int(123));
}
