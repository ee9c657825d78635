//! The built-in demo plugin, assembled in-process.
//!
//! Equivalent source:
//!
//! ```text
//! import env::print_i32(i32)
//! import env::print_str(ptr, i32)
//! import env::get_time() -> i64
//!
//! memory 1 page (max 4)
//! data[0] = "Hello from Rune!"
//!
//! export fn compute(a: i32, b: i32) -> i32 { let s = a + b; print_i32(s); s }
//! export fn greet()                        { print_str(0, 16) }
//! export fn timestamp() -> i64             { get_time() }
//! ```

use rune_vm::asm::ModuleBuilder;
use rune_vm::{Opcode, ValueType};

pub const GREETING: &[u8] = b"Hello from Rune!";

pub fn build() -> Vec<u8> {
    let mut b = ModuleBuilder::new();

    let t_i32_void = b.push_type(&[ValueType::I32], None);
    let t_ptr_i32_void = b.push_type(&[ValueType::Ptr, ValueType::I32], None);
    let t_void_i64 = b.push_type(&[], Some(ValueType::I64));
    let t_2i32_i32 = b.push_type(&[ValueType::I32, ValueType::I32], Some(ValueType::I32));
    let t_void_void = b.push_type(&[], None);

    let print_i32 = b.import("env", "print_i32", t_i32_void);
    let print_str = b.import("env", "print_str", t_ptr_i32_void);
    let get_time = b.import("env", "get_time", t_void_i64);

    b.declare_memory(1, 4);
    b.export_memory("memory");
    b.data(0, GREETING);

    // compute(a, b): report the sum through the host, then return it.
    let compute = b.func(t_2i32_i32, 4, 0);
    b.export_func(compute, "compute");
    b.begin_code(compute);
    b.emit(Opcode::Add32, 2, 0, 1);
    b.emit(Opcode::Arg, 0, 2, 0);
    b.emit_imm(Opcode::CallHost, 3, 0, 0, print_i32);
    b.emit(Opcode::Mov, 0, 2, 0);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    // greet(): print the greeting placed at offset 0 by the data segment.
    let greet = b.func(t_void_void, 4, 0);
    b.export_func(greet, "greet");
    b.begin_code(greet);
    b.ldi32(1, 0);
    b.ldi32(2, GREETING.len() as i32);
    b.emit(Opcode::Arg, 0, 1, 0);
    b.emit(Opcode::Arg, 1, 2, 0);
    b.emit_imm(Opcode::CallHost, 3, 0, 0, print_str);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    let timestamp = b.func(t_void_i64, 2, 0);
    b.export_func(timestamp, "timestamp");
    b.begin_code(timestamp);
    b.emit_imm(Opcode::CallHost, 0, 0, 0, get_time);
    b.emit(Opcode::Ret, 0, 0, 0);
    b.end_code();

    b.finish()
}
