//! Shared builders for unit and integration tests.
//!
//! Only available under `cfg(test)` or the `test-harness` feature. The
//! helpers assemble small modules through [`ModuleBuilder`], load them,
//! and boot a VM, so each test states only what is special about it.

use crate::asm::ModuleBuilder;
use crate::module::Module;
use crate::value::{Value, ValueType};
use crate::vm::{Config, Vm};
use crate::{Opcode, Result};

/// Assemble and load, panicking on loader rejection (the builders here
/// produce valid modules by construction).
#[must_use]
pub fn load(builder: ModuleBuilder) -> Module {
    Module::load(&builder.finish()).expect("harness module should load")
}

/// Load, create a VM with `config`, and run `init`.
///
/// # Errors
///
/// Propagates `init` failures so tests can assert on them.
pub fn boot(module: &Module, config: Config) -> Result<Vm<'_>> {
    let mut vm = Vm::new(module, config);
    vm.init()?;
    Ok(vm)
}

/// A module exporting one `(i32, i32) -> i32` function whose body is the
/// given code emitter.
#[must_use]
pub fn binary_i32_module(name: &str, emit: impl FnOnce(&mut ModuleBuilder)) -> Module {
    let mut b = ModuleBuilder::new();
    let ty = b.push_type(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
    let f = b.func(ty, 8, 0);
    b.export_func(f, name);
    b.begin_code(f);
    emit(&mut b);
    b.end_code();
    load(b)
}

/// `add(a, b) = a + b` over i32.
#[must_use]
pub fn add_module() -> Module {
    binary_i32_module("add", |b| {
        b.emit(Opcode::Add32, 0, 0, 1);
        b.emit(Opcode::Ret, 0, 0, 0);
    })
}

/// Shorthand for `Value::I32`.
#[must_use]
pub fn i32v(v: i32) -> Value {
    Value::I32(v)
}
