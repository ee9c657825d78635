//! Loader and lifecycle tests: header gates, section grammar, CRC, init
//! semantics.

use rune_vm::asm::ModuleBuilder;
use rune_vm::bytecode::{HEADER_SIZE, crc32};
use rune_vm::test_harness::*;
use rune_vm::{Config, Error, ExportKind, Module, Opcode, Value, ValueType, Vm};

fn reseal(bytes: &mut [u8]) {
    let crc = crc32(&bytes[HEADER_SIZE..]);
    bytes[8..12].copy_from_slice(&crc.to_le_bytes());
}

fn demo_builder() -> ModuleBuilder {
    let mut b = ModuleBuilder::new();
    let t_sink = b.push_type(&[ValueType::I32], None);
    let t_add = b.push_type(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
    b.import("test", "sink", t_sink);
    b.declare_memory(1, 2);
    b.global(ValueType::I64, true, Value::I64(-5));
    b.data(16, b"seed");
    let f = b.func(t_add, 4, 0);
    b.export_func(f, "add");
    b.begin_code(f);
    b.emit(Opcode::Add32, 0, 0, 1);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();
    b
}

#[test]
fn round_trip_preserves_tables() {
    let module = load(demo_builder());

    assert_eq!(module.types().len(), 2);
    assert_eq!(module.types()[1].params.len(), 2);
    assert_eq!(module.types()[1].ret, Some(ValueType::I32));

    assert_eq!(module.import_count(), 1);
    assert_eq!(module.import_module(0), Some("test"));
    assert_eq!(module.import_name(0), Some("sink"));

    assert_eq!(module.func_count(), 2);
    assert_eq!(module.export_count(), 1);
    assert_eq!(module.export_name(0), Some("add"));
    assert!(module.find_export("add", ExportKind::Func).is_some());
    assert!(module.find_export("add", ExportKind::Memory).is_none());

    let memory = module.memory().expect("declared memory");
    assert_eq!(memory.initial_pages, 1);
    assert_eq!(memory.effective_max(), 2);

    assert_eq!(module.globals().len(), 1);
    assert_eq!(module.globals()[0].value, Value::I64(-5));
    assert!(module.globals()[0].mutable);

    assert_eq!(module.data_segments().len(), 1);
    assert_eq!(module.data_segments()[0].offset, 16);
    assert_eq!(module.segment_bytes(&module.data_segments()[0]), b"seed");

    assert_eq!(module.init_func(), None);
}

#[test]
fn max_pages_zero_means_initial() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(3, 0);
    let module = load(b);
    assert_eq!(module.memory().unwrap().effective_max(), 3);
}

#[test]
fn crc_gate_catches_any_body_corruption() {
    let bytes = demo_builder().finish();

    // Flip one bit in every byte after the header, one at a time.
    for pos in HEADER_SIZE..bytes.len() {
        let mut corrupt = bytes.clone();
        corrupt[pos] ^= 0x01;
        let err = Module::load(&corrupt).unwrap_err();
        assert!(
            matches!(err, Error::BadModule(ref msg) if msg.contains("CRC")),
            "byte {pos}: expected CRC failure, got {err}"
        );
    }
}

#[test]
fn header_gates() {
    assert!(matches!(
        Module::load(&[]).unwrap_err(),
        Error::BadModule(_)
    ));
    assert!(matches!(
        Module::load(&[0u8; 12]).unwrap_err(),
        Error::BadModule(_)
    ));

    let mut bytes = demo_builder().finish();
    bytes[0] = b'W';
    assert!(matches!(Module::load(&bytes).unwrap_err(), Error::BadMagic));

    let mut bytes = demo_builder().finish();
    bytes[4..6].copy_from_slice(&9u16.to_le_bytes());
    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::VersionMismatch { got: 9, expected: 1 }
    ));
}

#[test]
fn truncated_section_is_rejected() {
    let bytes = demo_builder().finish();
    // Drop the last byte and reseal: the final section's declared length
    // now overruns the file.
    let mut short = bytes[..bytes.len() - 1].to_vec();
    reseal(&mut short);
    assert!(matches!(
        Module::load(&short).unwrap_err(),
        Error::BadModule(_)
    ));
}

#[test]
fn unknown_sections_are_skipped() {
    let mut bytes = demo_builder().finish();
    // Append an unknown section id 0x77 with a 3-byte payload.
    bytes.extend([0x77, 3, 0, 0, 0, 0xAA, 0xBB, 0xCC]);
    reseal(&mut bytes);
    let module = Module::load(&bytes).expect("unknown sections skip");
    assert_eq!(module.export_name(0), Some("add"));
}

#[test]
fn duplicate_section_is_rejected() {
    let mut bytes = demo_builder().finish();
    // Append a second MEMORY section (id 4, 4-byte payload).
    bytes.extend([4, 4, 0, 0, 0, 1, 0, 1, 0]);
    reseal(&mut bytes);
    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::BadModule(ref msg) if msg.contains("duplicate")
    ));
}

#[test]
fn type_index_out_of_range_is_rejected() {
    let mut b = ModuleBuilder::new();
    // Import references type 3; no types are declared.
    b.import("env", "f", 3);
    let bytes = b.finish();
    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::BadModule(ref msg) if msg.contains("type index")
    ));
}

#[test]
fn misaligned_code_is_rejected() {
    // Hand-built module whose single code body claims 3 bytes.
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(b"RUNE");
    bytes[4..6].copy_from_slice(&1u16.to_le_bytes());
    // TYPE: one nullary type.
    bytes.extend([1, 6, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0, 0, 0]);
    // FUNC: one body, type 0, 2 registers.
    bytes.extend([3, 8, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0, 0, 0, 2, 0]);
    // CODE: count=1, body_size=3, 3 bytes of "code".
    bytes.extend([7, 11, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0]);
    bytes.extend(3u32.to_le_bytes());
    bytes.extend([0, 0, 0]);
    reseal(&mut bytes);

    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::BadModule(ref msg) if msg.contains("multiple of 4")
    ));
}

#[test]
fn func_without_code_section_is_rejected() {
    // Hand-build: TYPE with one nullary type, FUNC declaring one body, no
    // CODE section at all.
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(b"RUNE");
    bytes[4..6].copy_from_slice(&1u16.to_le_bytes());
    // TYPE section: count=1, {param_count=0, return_count=0}
    bytes.extend([1, 6, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0, 0, 0]);
    // FUNC section: count=1, {type=0, regs=2, locals=0}
    bytes.extend([3, 8, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0, 0, 0, 2, 0]);
    reseal(&mut bytes);

    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::BadModule(ref msg) if msg.contains("CODE")
    ));
}

#[test]
fn export_strings_reject_invalid_utf8() {
    let mut bytes = vec![0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(b"RUNE");
    bytes[4..6].copy_from_slice(&1u16.to_le_bytes());
    // EXPORT section: count=1, kind=0, index=0, name = 1 invalid byte.
    bytes.extend([6, 11, 0, 0, 0]);
    bytes.extend([1, 0, 0, 0]);
    bytes.extend([0]);
    bytes.extend([0, 0, 0, 0]);
    bytes.extend([1, 0xFF]);
    reseal(&mut bytes);

    assert!(matches!(
        Module::load(&bytes).unwrap_err(),
        Error::BadModule(ref msg) if msg.contains("UTF-8")
    ));
}

#[test]
fn init_runs_the_init_export() {
    let mut b = ModuleBuilder::new();
    let counter = b.global(ValueType::I32, true, Value::I32(0));
    let nullary_i32 = b.push_type(&[], Some(ValueType::I32));
    let nullary = b.push_type(&[], None);

    // _init sets the counter to 7.
    let init = b.func(nullary, 4, 0);
    b.export_func(init, "_init");
    b.begin_code(init);
    b.ldi32(0, 7);
    b.emit_imm(Opcode::StGlobal, 0, 0, 0, counter);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let read = b.func(nullary_i32, 2, 0);
    b.export_func(read, "read");
    b.begin_code(read);
    b.emit_imm(Opcode::LdGlobal, 0, 0, 0, counter);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    assert_eq!(module.init_func(), Some(0));

    let mut vm = boot(&module, Config::default()).unwrap();
    assert_eq!(vm.call("read", &[]).unwrap(), i32v(7));
}

#[test]
fn failing_init_export_propagates() {
    let mut b = ModuleBuilder::new();
    let nullary = b.push_type(&[], None);
    let init = b.func(nullary, 2, 0);
    b.export_func(init, "_init");
    b.begin_code(init);
    b.emit(Opcode::Trap, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    assert!(matches!(vm.init().unwrap_err(), Error::Trap { .. }));
}

#[test]
fn init_is_idempotent_and_gates_register() {
    let module = add_module();
    let mut vm = Vm::new(&module, Config::default());

    vm.init().unwrap();
    assert!(matches!(vm.init().unwrap_err(), Error::BadModule(_)));
    assert!(matches!(
        vm.register("env", "late", |_, _| Ok(Value::Void))
            .unwrap_err(),
        Error::BadModule(_)
    ));
}

#[test]
fn call_before_init_is_rejected() {
    let module = add_module();
    let mut vm = Vm::new(&module, Config::default());
    assert!(matches!(
        vm.call("add", &[i32v(1), i32v(2)]).unwrap_err(),
        Error::BadModule(_)
    ));
}

#[test]
fn unresolved_import_fails_init() {
    let module = load(demo_builder());
    let mut vm = Vm::new(&module, Config::default());
    let err = vm.init().unwrap_err();
    assert!(matches!(err, Error::NoImport(ref name) if name == "test::sink"));
    assert!(vm.last_error().contains("test::sink"));

    // Satisfying the import lets init succeed.
    let mut vm = Vm::new(&module, Config::default());
    vm.register("test", "sink", |_, _| Ok(Value::Void)).unwrap();
    vm.init().unwrap();
}

#[test]
fn missing_export_is_noexport() {
    let module = add_module();
    let mut vm = boot(&module, Config::default()).unwrap();
    let err = vm.call("nope", &[]).unwrap_err();
    assert!(matches!(err, Error::NoExport(ref name) if name == "nope"));
}

#[test]
fn memory_over_limit_is_oom() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 1024); // 64 MiB declared max
    let module = load(b);

    let mut vm = Vm::new(
        &module,
        Config {
            memory_limit: 1024 * 1024, // 1 MiB cap
            ..Config::default()
        },
    );
    assert!(matches!(vm.init().unwrap_err(), Error::Oom(_)));
}

#[test]
fn data_segment_outside_initial_pages_is_bounds() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 2);
    // Offset lands in page 2, which is declared but not initially
    // committed.
    b.data(70_000, b"late");
    let module = load(b);

    let mut vm = Vm::new(&module, Config::default());
    assert!(matches!(vm.init().unwrap_err(), Error::Bounds { .. }));
}

#[test]
fn data_segments_land_in_memory() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 1);
    b.data(32, b"payload");
    let module = load(b);

    let mut vm = Vm::new(&module, Config::default());
    vm.init().unwrap();
    assert_eq!(vm.mem_read(32, 7).unwrap(), b"payload");
    assert_eq!(vm.mem_read_str(32, 64).unwrap(), "payload");
}

#[test]
fn public_memory_api_bounds() {
    let mut b = ModuleBuilder::new();
    b.declare_memory(1, 1);
    let module = load(b);
    let mut vm = Vm::new(&module, Config::default());
    vm.init().unwrap();

    assert_eq!(vm.memory_size(), 65_536);
    assert!(vm.mem_write(65_532, &[1, 2, 3, 4]).is_ok());
    assert!(vm.mem_write(65_533, &[1, 2, 3, 4]).is_err());
    assert!(vm.mem_read(65_536, 1).is_err());
    // One page declared: no room to grow.
    assert!(matches!(vm.mem_grow(1).unwrap_err(), Error::Oom(_)));

    // Without memory everything is out of bounds.
    let bare = add_module();
    let mut vm = boot(&bare, Config::default()).unwrap();
    assert_eq!(vm.memory_size(), 0);
    assert!(vm.memory().is_none());
    assert!(vm.mem_read(0, 1).is_err());
}

#[test]
fn duplicate_export_names_resolve_to_first() {
    let mut b = ModuleBuilder::new();
    let ty = b.push_type(&[], Some(ValueType::I32));

    let first = b.func(ty, 2, 0);
    b.export_func(first, "pick");
    b.begin_code(first);
    b.ldi32(0, 1);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let second = b.func(ty, 2, 0);
    b.export_func(second, "pick");
    b.begin_code(second);
    b.ldi32(0, 2);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let module = load(b);
    let mut vm = boot(&module, Config::default()).unwrap();
    assert_eq!(vm.call("pick", &[]).unwrap(), i32v(1));
}

#[test]
fn export_with_bad_function_index_traps_at_call() {
    let mut b = ModuleBuilder::new();
    b.export_func(42, "ghost");
    let module = load(b);
    let mut vm = boot(&module, Config::default()).unwrap();
    assert!(matches!(
        vm.call("ghost", &[]).unwrap_err(),
        Error::BadModule(_)
    ));
}
