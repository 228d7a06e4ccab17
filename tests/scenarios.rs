// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end scenarios: complete modules linked and executed through the
//! public `Program` surface.

use std::sync::{Arc, Mutex};

use weft::{Error, FunctionType, Program, TrapKind, Value, types::ValType};

fn expect_trap(result: Result<Option<Value>, Error>, kind: &TrapKind) {
    match result {
        Err(Error::Trap(trap)) => assert_eq!(trap.kind(), kind),
        other => panic!("expected {kind:?} trap, got {other:?}"),
    }
}

#[test]
fn fibonacci() {
    let mut program = Program::builder()
        .with_module_text(
            "fib",
            r#"(module
                (func $fib (export "fib") (param i32) (result i32)
                  local.get 0
                  i32.const 2
                  i32.lt_s
                  if (result i32)
                    local.get 0
                  else
                    local.get 0
                    i32.const 1
                    i32.sub
                    call $fib
                    local.get 0
                    i32.const 2
                    i32.sub
                    call $fib
                    i32.add
                  end))"#,
        )
        .build()
        .unwrap();

    let result = program.invoke("fib", "fib", &[Value::from_i32(10)]).unwrap();
    assert_eq!(result, Some(Value::from_i32(55)));
}

#[test]
fn memory_store_and_load() {
    let mut program = Program::builder()
        .with_module_text(
            "mem",
            r#"(module
                (memory 1)
                (func (export "store") (param i32 i32)
                  local.get 0
                  local.get 1
                  i32.store)
                (func (export "load") (param i32) (result i32)
                  local.get 0
                  i32.load))"#,
        )
        .build()
        .unwrap();

    program
        .invoke(
            "mem",
            "store",
            &[Value::from_i32(0), Value::from_i32(0x1234_5678)],
        )
        .unwrap();
    let loaded = program
        .invoke("mem", "load", &[Value::from_i32(0)])
        .unwrap();
    assert_eq!(loaded, Some(Value::from_i32(0x1234_5678)));

    // A 4-byte access at size-4 succeeds; at size-3 it traps.
    program
        .invoke("mem", "load", &[Value::from_i32(65532)])
        .unwrap();
    expect_trap(
        program.invoke("mem", "load", &[Value::from_i32(65533)]),
        &TrapKind::OutOfBoundsMemoryAccess,
    );
}

#[test]
fn indirect_calls() {
    let mut program = Program::builder()
        .with_module_text(
            "tbl",
            r#"(module
                (type $binary (func (param i32 i32) (result i32)))
                (func $add (type $binary)
                  local.get 0
                  local.get 1
                  i32.add)
                (func $negate (param i32) (result i32)
                  i32.const 0
                  local.get 0
                  i32.sub)
                (table 3 funcref)
                (elem (i32.const 0) $add $negate)
                (func (export "apply") (param i32) (result i32)
                  i32.const 30
                  i32.const 12
                  local.get 0
                  call_indirect (type $binary)))"#,
        )
        .build()
        .unwrap();

    // Index 0 holds a matching function.
    let result = program
        .invoke("tbl", "apply", &[Value::from_i32(0)])
        .unwrap();
    assert_eq!(result, Some(Value::from_i32(42)));

    // Index 1 holds a function of a different type.
    expect_trap(
        program.invoke("tbl", "apply", &[Value::from_i32(1)]),
        &TrapKind::IndirectCallTypeMismatch,
    );

    // Index 2 is within the table but was never initialized.
    expect_trap(
        program.invoke("tbl", "apply", &[Value::from_i32(2)]),
        &TrapKind::UninitializedElement,
    );

    // Index 3 is outside the table.
    expect_trap(
        program.invoke("tbl", "apply", &[Value::from_i32(3)]),
        &TrapKind::UndefinedElement,
    );
}

#[test]
fn divide_trap() {
    let mut program = Program::builder()
        .with_module_text(
            "div",
            r#"(module
                (func (export "crash") (result i32)
                  i32.const 10
                  i32.const 0
                  i32.div_s))"#,
        )
        .build()
        .unwrap();
    expect_trap(
        program.invoke("div", "crash", &[]),
        &TrapKind::IntegerDivideByZero,
    );

    // The program stays usable after the trap.
    expect_trap(
        program.invoke("div", "crash", &[]),
        &TrapKind::IntegerDivideByZero,
    );
}

#[test]
fn global_mutation_across_invocations() {
    let mut program = Program::builder()
        .with_module_text(
            "counter",
            r#"(module
                (global $g (export "g") (mut i32) (i32.const 0))
                (func (export "inc")
                  global.get $g
                  i32.const 1
                  i32.add
                  global.set $g))"#,
        )
        .build()
        .unwrap();

    for _ in 0..3 {
        program.invoke("counter", "inc", &[]).unwrap();
    }
    assert_eq!(
        program.get_global("counter", "g").unwrap(),
        Value::from_i32(3)
    );
}

#[test]
fn host_function_receives_arguments() {
    let record: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = record.clone();

    let mut program = Program::builder()
        .with_host_function(
            "host",
            "print",
            FunctionType::new(vec![ValType::I32], vec![]),
            move |args| {
                let value = args[0].as_i32().expect("declared i32 parameter");
                sink.lock().unwrap().push(value);
                Ok(None)
            },
        )
        .with_module_text(
            "app",
            r#"(module
                (func $print (import "host" "print") (param i32))
                (func (export "run")
                  i32.const 42
                  call $print))"#,
        )
        .build()
        .unwrap();

    program.invoke("app", "run", &[]).unwrap();
    assert_eq!(*record.lock().unwrap(), vec![42]);
}

#[test]
fn host_trap_surfaces_with_message() {
    let mut program = Program::builder()
        .with_host_function(
            "host",
            "refuse",
            FunctionType::new(vec![], vec![]),
            |_| Err(weft::Trap::host("the host refuses")),
        )
        .with_module_text(
            "app",
            r#"(module
                (func $refuse (import "host" "refuse"))
                (func (export "run") call $refuse))"#,
        )
        .build()
        .unwrap();

    match program.invoke("app", "run", &[]) {
        Err(Error::Trap(trap)) => {
            assert_eq!(trap.to_string(), "the host refuses");
        }
        other => panic!("expected host trap, got {other:?}"),
    }
}

#[test]
fn memory_grow_and_its_limit() {
    let mut program = Program::builder()
        .with_module_text(
            "mem",
            r#"(module
                (memory 1 2)
                (func (export "grow") (param i32) (result i32)
                  local.get 0
                  memory.grow)
                (func (export "size") (result i32)
                  memory.size))"#,
        )
        .build()
        .unwrap();

    assert_eq!(
        program.invoke("mem", "size", &[]).unwrap(),
        Some(Value::from_i32(1))
    );
    // Growing by 1 returns the previous size.
    assert_eq!(
        program.invoke("mem", "grow", &[Value::from_i32(1)]).unwrap(),
        Some(Value::from_i32(1))
    );
    // Growing past the declared max returns -1 and changes nothing.
    assert_eq!(
        program.invoke("mem", "grow", &[Value::from_i32(1)]).unwrap(),
        Some(Value::from_i32(-1))
    );
    assert_eq!(
        program.invoke("mem", "size", &[]).unwrap(),
        Some(Value::from_i32(2))
    );
}

#[test]
fn committed_writes_survive_a_trap() {
    let mut program = Program::builder()
        .with_module_text(
            "mem",
            r#"(module
                (memory 1)
                (func (export "poke-then-crash")
                  i32.const 0
                  i32.const 7
                  i32.store
                  unreachable)
                (func (export "peek") (result i32)
                  i32.const 0
                  i32.load))"#,
        )
        .build()
        .unwrap();

    expect_trap(
        program.invoke("mem", "poke-then-crash", &[]),
        &TrapKind::Unreachable,
    );
    // The store committed before the trap remains visible.
    assert_eq!(
        program.invoke("mem", "peek", &[]).unwrap(),
        Some(Value::from_i32(7))
    );
}

#[test]
fn binary_and_text_frontends_agree() {
    // (module (func (export "answer") (result i32) i32.const 42))
    let binary: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type section
        0x03, 0x02, 0x01, 0x00, // function section
        0x07, 0x0a, 0x01, 0x06, 0x61, 0x6e, 0x73, 0x77, 0x65, 0x72, 0x00, 0x00, // exports
        0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b, // code
    ];
    let text = r#"(module (func (export "answer") (result i32) i32.const 42))"#;

    let from_binary = weft::Module::from_binary(binary).unwrap();
    let from_text = weft::Module::from_text(text).unwrap();
    assert_eq!(from_binary, from_text);

    let mut program = Program::builder()
        .with_module_binary("bin", binary)
        .with_module_text("txt", text)
        .build()
        .unwrap();
    assert_eq!(
        program.invoke("bin", "answer", &[]).unwrap(),
        program.invoke("txt", "answer", &[]).unwrap()
    );
}

#[test]
fn start_function_runs_at_instantiation() {
    let program = Program::builder()
        .with_module_text(
            "init",
            r#"(module
                (global $ready (export "ready") (mut i32) (i32.const 0))
                (func $setup
                  i32.const 1
                  global.set $ready)
                (start $setup))"#,
        )
        .build()
        .unwrap();
    assert_eq!(
        program.get_global("init", "ready").unwrap(),
        Value::from_i32(1)
    );
}

#[test]
fn register_style_linking_chain() {
    // Mirrors the harness's `register` flow: a module's exports become
    // importable by every later module under the program-level name.
    let mut program = Program::builder()
        .with_module_text(
            "arith",
            r#"(module
                (func (export "double") (param i32) (result i32)
                  local.get 0
                  i32.const 2
                  i32.mul))"#,
        )
        .with_module_text(
            "middle",
            r#"(module
                (func $double (import "arith" "double") (param i32) (result i32))
                (func (export "quadruple") (param i32) (result i32)
                  local.get 0
                  call $double
                  call $double))"#,
        )
        .with_module_text(
            "top",
            r#"(module
                (func $quadruple (import "middle" "quadruple") (param i32) (result i32))
                (func (export "times8") (param i32) (result i32)
                  local.get 0
                  call $quadruple
                  i32.const 2
                  i32.mul))"#,
        )
        .build()
        .unwrap();
    assert_eq!(
        program.invoke("top", "times8", &[Value::from_i32(5)]).unwrap(),
        Some(Value::from_i32(40))
    );
}
