//! Host-function dispatch: staging, results, memory access from
//! callbacks, and error propagation.

use std::cell::RefCell;
use std::rc::Rc;

use rune_vm::asm::ModuleBuilder;
use rune_vm::test_harness::*;
use rune_vm::{Config, Error, Opcode, Value, ValueType, Vm};

/// Module from the original host-call scenario: stage each argument into
/// slot 0, call `test::sink` twice, then add the two arguments.
fn call_twice_module() -> rune_vm::Module {
    let mut b = ModuleBuilder::new();
    let t_sink = b.push_type(&[ValueType::I32], None);
    let t_fn = b.push_type(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
    let sink = b.import("test", "sink", t_sink);

    let f = b.func(t_fn, 4, 0);
    b.export_func(f, "call_twice");
    b.begin_code(f);
    b.emit(Opcode::Arg, 0, 0, 0);
    b.emit_imm(Opcode::CallHost, 2, 0, 0, sink);
    b.emit(Opcode::Arg, 0, 1, 0);
    b.emit_imm(Opcode::CallHost, 2, 0, 0, sink);
    b.emit(Opcode::Add32, 0, 0, 1);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();
    load(b)
}

#[test]
fn call_twice_with_noop_sink() {
    let module = call_twice_module();
    let mut vm = Vm::new(&module, Config::default());
    vm.register("test", "sink", |_, _| Ok(Value::Void)).unwrap();
    vm.init().unwrap();

    assert_eq!(
        vm.call("call_twice", &[i32v(3), i32v(7)]).unwrap(),
        i32v(10)
    );
}

#[test]
fn host_sees_staged_arguments_in_order() {
    let module = call_twice_module();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink_log = Rc::clone(&seen);

    let mut vm = Vm::new(&module, Config::default());
    vm.register("test", "sink", move |_, args| {
        sink_log.borrow_mut().push(args.to_vec());
        Ok(Value::Void)
    })
    .unwrap();
    vm.init().unwrap();
    vm.call("call_twice", &[i32v(3), i32v(7)]).unwrap();

    let calls = seen.borrow();
    assert_eq!(calls.as_slice(), &[vec![i32v(3)], vec![i32v(7)]]);
}

#[test]
fn host_error_propagates_unchanged() {
    let module = call_twice_module();
    let mut vm = Vm::new(&module, Config::default());
    vm.register("test", "sink", |_, args| {
        if args.first().map_or(0, |v| v.as_i32()) == 7 {
            return Err(Error::Host("sink refused".into()));
        }
        Ok(Value::Void)
    })
    .unwrap();
    vm.init().unwrap();

    let err = vm.call("call_twice", &[i32v(3), i32v(7)]).unwrap_err();
    assert!(matches!(err, Error::Host(ref msg) if msg == "sink refused"));
    assert!(vm.last_error().contains("sink refused"));
}

#[test]
fn host_return_value_lands_in_destination_register() {
    let mut b = ModuleBuilder::new();
    let t_get = b.push_type(&[], Some(ValueType::I64));
    let get = b.import("env", "get_time", t_get);

    let f = b.func(t_get, 2, 0);
    b.export_func(f, "timestamp");
    b.begin_code(f);
    b.emit_imm(Opcode::CallHost, 0, 0, 0, get);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.register("env", "get_time", |_, _| Ok(Value::I64(1_708_560_000)))
        .unwrap();
    vm.init().unwrap();

    assert_eq!(
        vm.call("timestamp", &[]).unwrap(),
        Value::I64(1_708_560_000)
    );
}

#[test]
fn host_reads_and_writes_guest_memory() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 1);
    b.data(0, b"ping\0");
    let t_echo = b.push_type(&[ValueType::Ptr], Some(ValueType::I32));
    let echo = b.import("env", "echo", t_echo);

    let f = b.func(t_echo, 4, 0);
    b.export_func(f, "poke");
    b.begin_code(f);
    b.emit(Opcode::Arg, 0, 0, 0);
    b.emit_imm(Opcode::CallHost, 0, 0, 0, echo);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.register("env", "echo", |ctx, args| {
        let ptr = args[0].as_i32() as u32;
        let text = ctx.mem_read_str(ptr, 32)?;
        assert_eq!(text, "ping");
        // Write a reply the guest (or embedder) can observe.
        ctx.mem_write(64, b"pong")?;
        Ok(Value::I32(text.len() as i32))
    })
    .unwrap();
    vm.init().unwrap();

    assert_eq!(vm.call("poke", &[Value::Ptr(0)]).unwrap(), i32v(4));
    assert_eq!(vm.mem_read(64, 4).unwrap(), b"pong");
}

#[test]
fn host_memory_access_is_bounds_checked() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 1);
    let t = b.push_type(&[], None);
    let wild = b.import("env", "wild", t);

    let f = b.func(t, 2, 0);
    b.export_func(f, "go");
    b.begin_code(f);
    b.emit_imm(Opcode::CallHost, 0, 0, 0, wild);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.register("env", "wild", |ctx, _| {
        ctx.mem_write(65_536, &[1])?;
        Ok(Value::Void)
    })
    .unwrap();
    vm.init().unwrap();

    assert!(matches!(
        vm.call("go", &[]).unwrap_err(),
        Error::Bounds { .. }
    ));
}

#[test]
fn import_called_through_plain_call_dispatches_to_host() {
    // `call` on an import index tail-dispatches to the host registry.
    let mut b = ModuleBuilder::new();
    let t_one = b.push_type(&[], Some(ValueType::I32));
    let one = b.import("env", "one", t_one);

    let f = b.func(t_one, 2, 0);
    b.export_func(f, "via_call");
    b.begin_code(f);
    b.emit_imm(Opcode::Call, 0, 0, 0, one);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.register("env", "one", |_, _| Ok(Value::I32(1))).unwrap();
    vm.init().unwrap();

    assert_eq!(vm.call("via_call", &[]).unwrap(), i32v(1));
}

#[test]
fn call_host_with_bad_import_index_is_noimport() {
    let mut b = ModuleBuilder::new();
    let t = b.push_type(&[], None);
    let f = b.func(t, 2, 0);
    b.export_func(f, "go");
    b.begin_code(f);
    b.emit_imm(Opcode::CallHost, 0, 0, 0, 9);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = boot(&module, Config::default()).unwrap();

    let called = vm.call("go", &[]);
    assert!(matches!(called.unwrap_err(), Error::NoImport(_)));
}

#[test]
fn exported_import_is_callable_by_name() {
    let mut b = ModuleBuilder::new();
    let t = b.push_type(&[ValueType::I32], Some(ValueType::I32));
    let double = b.import("env", "double", t);
    b.export_func(double, "double");

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.register("env", "double", |_, args| {
        Ok(Value::I32(args[0].as_i32() * 2))
    })
    .unwrap();
    vm.init().unwrap();

    assert_eq!(vm.call("double", &[i32v(21)]).unwrap(), i32v(42));
}
