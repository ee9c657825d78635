// Interpreter and codec paths use explicit `as` casts for register-width
// reinterpretation and byte packing. Truncation and wrap are the semantics.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

pub mod asm;
pub mod bytecode;
pub mod error;
pub mod module;
pub mod value;
pub mod vm;

/// Test harness module with shared module builders.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use bytecode::{ExportKind, Opcode};
pub use error::{Error, Result};
pub use module::Module;
pub use value::{Value, ValueType};
pub use vm::{Config, HostContext, Vm};
