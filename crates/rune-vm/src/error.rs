/// Errors surfaced by the loader, the VM lifecycle, and the interpreter.
///
/// Trap variants raised mid-execution carry the faulting function index and
/// program counter (in 4-byte words) so the rendered message names the site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("bad module: {0}")]
    BadModule(String),

    #[error("bad magic")]
    BadMagic,

    #[error("version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u16, expected: u16 },

    #[error("out of memory: {0}")]
    Oom(String),

    #[error("memory access out of bounds at 0x{offset:x} (len {len})")]
    Bounds { offset: u32, len: u32 },

    #[error("division by zero in function {func} at pc {pc}")]
    DivZero { func: u32, pc: u32 },

    #[error("type mismatch: {0}")]
    Type(String),

    #[error("export not found: {0}")]
    NoExport(String),

    #[error("unresolved import: {0}")]
    NoImport(String),

    #[error("call stack overflow at depth {depth}")]
    StackOverflow { depth: u32 },

    #[error("explicit trap in function {func} at pc {pc}")]
    Trap { func: u32, pc: u32 },

    #[error("fuel limit exceeded after {used} instructions")]
    Fuel { used: u64 },

    #[error("unknown opcode 0x{opcode:02x} in function {func} at pc {pc}")]
    BadOpcode { opcode: u8, func: u32, pc: u32 },

    #[error("host error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, Error>;
