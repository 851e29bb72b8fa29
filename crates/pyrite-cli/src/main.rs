//! Development harness for the pyrite engine.
//!
//! Without a front-end compiler in tree, the harness ships a couple of
//! demo programs assembled directly against the engine's builder:
//!
//! ```text
//! pyrite run [demo]     execute a demo program (default: fib)
//! pyrite dis [demo]     dump a demo program's bytecode
//! pyrite list           list available demos
//! ```
//!
//! Exit code 0 on success, 1 on an uncaught exception.

use std::{env, process::ExitCode, rc::Rc, time::Instant};

use pyrite::{Code, Interp};

mod demos;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");
    let demo = args.get(2).map(String::as_str).unwrap_or("fib");

    match command {
        "list" => {
            for name in demos::DEMO_NAMES {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        "run" => {
            let mut interp = Interp::new();
            let Some(code) = build_demo(&mut interp, demo) else {
                eprintln!("unknown demo: {demo}");
                return ExitCode::FAILURE;
            };
            let start = Instant::now();
            match interp.execute(&code) {
                Ok(value) => {
                    let elapsed = start.elapsed();
                    eprintln!("success after {elapsed:?}");
                    println!("{value}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    let elapsed = start.elapsed();
                    eprintln!("error after {elapsed:?}\n{err}");
                    ExitCode::FAILURE
                }
            }
        }
        "dis" => {
            let mut interp = Interp::new();
            let Some(code) = build_demo(&mut interp, demo) else {
                eprintln!("unknown demo: {demo}");
                return ExitCode::FAILURE;
            };
            print!("{}", code.disassemble(interp.interns_mut()));
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("usage: pyrite [run|dis|list] [demo]\nunknown command: {other}");
            ExitCode::FAILURE
        }
    }
}

fn build_demo(interp: &mut Interp, name: &str) -> Option<Rc<Code>> {
    match name {
        "fib" => Some(demos::fib(interp)),
        "countdown" => Some(demos::countdown(interp)),
        _ => None,
    }
}
