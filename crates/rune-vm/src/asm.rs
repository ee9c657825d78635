//! Programmatic module assembly.
//!
//! [`ModuleBuilder`] is the producer side of the binary format: declare
//! types, imports, functions, memory, globals, exports and data segments,
//! emit code words, then [`finish`](ModuleBuilder::finish) into a byte
//! vector the loader accepts. Misuse (emitting with no open function,
//! patching outside the open function's code) is a programmer error and
//! panics; the builder is a tool for trusted producers, not an input
//! surface.

use crate::bytecode::{self, ExportKind, HEADER_SIZE, MAGIC, Opcode, SectionId, VERSION};
use crate::value::{Value, ValueType};

struct AsmFunc {
    type_index: u16,
    reg_count: u8,
    local_count: u8,
    import_index: Option<u32>,
    code: Vec<u8>,
}

#[derive(Default)]
pub struct ModuleBuilder {
    types: Vec<(Vec<ValueType>, Option<ValueType>)>,
    imports: Vec<(String, String, u16)>,
    funcs: Vec<AsmFunc>,
    globals: Vec<(ValueType, bool, Value)>,
    exports: Vec<(ExportKind, u32, String)>,
    data: Vec<(u32, Vec<u8>)>,
    memory: Option<(u16, u16)>,
    current: Option<usize>,
}

impl ModuleBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function type; returns its type index.
    pub fn push_type(&mut self, params: &[ValueType], ret: Option<ValueType>) -> u16 {
        assert!(params.len() <= bytecode::MAX_PARAMS, "too many parameters");
        let index = self.types.len() as u16;
        self.types.push((params.to_vec(), ret));
        index
    }

    /// Declare an import; returns its index in the function index space.
    pub fn import(&mut self, module: &str, name: &str, type_index: u16) -> u32 {
        assert!(
            self.funcs.iter().all(|f| f.import_index.is_some()),
            "imports must be declared before local functions"
        );
        let import_index = self.imports.len() as u32;
        let func_index = self.funcs.len() as u32;
        self.imports
            .push((module.to_owned(), name.to_owned(), type_index));
        self.funcs.push(AsmFunc {
            type_index,
            reg_count: 0,
            local_count: 0,
            import_index: Some(import_index),
            code: Vec::new(),
        });
        func_index
    }

    /// Declare linear memory. A max of 0 means "equal to initial".
    pub fn declare_memory(&mut self, initial_pages: u16, max_pages: u16) {
        self.memory = Some((initial_pages, max_pages));
    }

    /// Declare a local function; returns its index in the function space.
    pub fn func(&mut self, type_index: u16, reg_count: u8, local_count: u8) -> u32 {
        let index = self.funcs.len() as u32;
        self.funcs.push(AsmFunc {
            type_index,
            reg_count,
            local_count,
            import_index: None,
            code: Vec::new(),
        });
        index
    }

    pub fn global(&mut self, ty: ValueType, mutable: bool, init: Value) -> u32 {
        let index = self.globals.len() as u32;
        self.globals.push((ty, mutable, init));
        index
    }

    pub fn data(&mut self, offset: u32, bytes: &[u8]) {
        self.data.push((offset, bytes.to_vec()));
    }

    pub fn export_func(&mut self, func_index: u32, name: &str) {
        self.exports
            .push((ExportKind::Func, func_index, name.to_owned()));
    }

    pub fn export_memory(&mut self, name: &str) {
        self.exports.push((ExportKind::Memory, 0, name.to_owned()));
    }

    // ── Code emission ──

    pub fn begin_code(&mut self, func_index: u32) {
        assert!(self.current.is_none(), "a function body is already open");
        let func = &mut self.funcs[func_index as usize];
        assert!(func.import_index.is_none(), "imports have no body");
        func.code.clear();
        self.current = Some(func_index as usize);
    }

    pub fn end_code(&mut self) {
        assert!(self.current.is_some(), "no function body is open");
        self.current = None;
    }

    pub fn emit(&mut self, op: Opcode, dst: u8, s1: u8, s2: u8) {
        let word = bytecode::pack_instr(op, dst, s1, s2);
        self.code().extend_from_slice(&word.to_le_bytes());
    }

    pub fn emit_imm(&mut self, op: Opcode, dst: u8, s1: u8, s2: u8, imm: u32) {
        self.emit(op, dst, s1, s2);
        self.code().extend_from_slice(&imm.to_le_bytes());
    }

    pub fn emit_imm64(&mut self, op: Opcode, dst: u8, imm: u64) {
        self.emit(op, dst, 0, 0);
        self.code().extend_from_slice(&imm.to_le_bytes());
    }

    /// Load an i32 constant into a register.
    pub fn ldi32(&mut self, reg: u8, value: i32) {
        self.emit_imm(Opcode::Ldi32, reg, 0, 0, value as u32);
    }

    /// Load an i64 constant into a register.
    pub fn ldi64(&mut self, reg: u8, value: i64) {
        self.emit_imm64(Opcode::Ldi64, reg, value as u64);
    }

    /// Current word offset in the open function's code.
    #[must_use]
    pub fn label(&mut self) -> u32 {
        (self.code().len() / 4) as u32
    }

    /// Patch the 32-bit immediate of the branch at `patch_word` to jump to
    /// `target_word`. The offset counts words and is measured from the word
    /// after the immediate: `rel = target − (patch + 2)`.
    pub fn patch_jump(&mut self, patch_word: u32, target_word: u32) {
        let rel = target_word.wrapping_sub(patch_word + 2) as i32;
        let imm_pos = (patch_word as usize + 1) * 4;
        let code = self.code();
        assert!(imm_pos + 4 <= code.len(), "patch position out of range");
        code[imm_pos..imm_pos + 4].copy_from_slice(&(rel as u32).to_le_bytes());
    }

    fn code(&mut self) -> &mut Vec<u8> {
        let current = self.current.expect("no function body is open");
        &mut self.funcs[current].code
    }

    // ── Finalization ──

    /// Serialize into a module binary: header, non-empty sections, CRC.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        assert!(self.current.is_none(), "a function body is still open");

        let mut out = vec![0u8; HEADER_SIZE];

        if !self.types.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, self.types.len() as u32);
            for (params, ret) in &self.types {
                sec.push(params.len() as u8);
                sec.push(u8::from(ret.is_some()));
                sec.extend(params.iter().map(|&t| t as u8));
                if let Some(ret) = ret {
                    sec.push(*ret as u8);
                }
            }
            push_section(&mut out, SectionId::Type, &sec);
        }

        if !self.imports.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, self.imports.len() as u32);
            for (module, name, type_index) in &self.imports {
                push_str8(&mut sec, module);
                push_str8(&mut sec, name);
                sec.extend(type_index.to_le_bytes());
            }
            push_section(&mut out, SectionId::Import, &sec);
        }

        let locals: Vec<&AsmFunc> = self
            .funcs
            .iter()
            .filter(|f| f.import_index.is_none())
            .collect();

        if !locals.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, locals.len() as u32);
            for func in &locals {
                sec.extend(func.type_index.to_le_bytes());
                sec.push(func.reg_count);
                sec.push(func.local_count);
            }
            push_section(&mut out, SectionId::Func, &sec);
        }

        if let Some((initial, max)) = self.memory {
            let mut sec = Vec::new();
            sec.extend(initial.to_le_bytes());
            sec.extend(max.to_le_bytes());
            push_section(&mut out, SectionId::Memory, &sec);
        }

        if !self.globals.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, self.globals.len() as u32);
            for (ty, mutable, init) in &self.globals {
                sec.push(*ty as u8);
                sec.push(u8::from(*mutable));
                sec.extend(global_raw(*init).to_le_bytes());
            }
            push_section(&mut out, SectionId::Global, &sec);
        }

        if !self.exports.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, self.exports.len() as u32);
            for (kind, index, name) in &self.exports {
                sec.push(*kind as u8);
                push_u32(&mut sec, *index);
                push_str8(&mut sec, name);
            }
            push_section(&mut out, SectionId::Export, &sec);
        }

        if !locals.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, locals.len() as u32);
            for func in &locals {
                push_u32(&mut sec, func.code.len() as u32);
                sec.extend_from_slice(&func.code);
            }
            push_section(&mut out, SectionId::Code, &sec);
        }

        if !self.data.is_empty() {
            let mut sec = Vec::new();
            push_u32(&mut sec, self.data.len() as u32);
            for (offset, bytes) in &self.data {
                sec.push(0); // memory index
                push_u32(&mut sec, *offset);
                push_u32(&mut sec, bytes.len() as u32);
                sec.extend_from_slice(bytes);
            }
            push_section(&mut out, SectionId::Data, &sec);
        }

        let crc = bytecode::crc32(&out[HEADER_SIZE..]);
        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&0u16.to_le_bytes()); // flags
        out[8..12].copy_from_slice(&crc.to_le_bytes());
        out[12..16].copy_from_slice(&0u32.to_le_bytes()); // reserved
        out
    }
}

fn global_raw(value: Value) -> u64 {
    match value {
        Value::I32(v) => u64::from(v as u32),
        Value::I64(v) => v as u64,
        Value::F32(v) => u64::from(v.to_bits()),
        Value::F64(v) => v.to_bits(),
        other => panic!("global initializer must be numeric, got {other:?}"),
    }
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend(value.to_le_bytes());
}

fn push_str8(buf: &mut Vec<u8>, s: &str) {
    assert!(s.len() <= usize::from(u8::MAX), "string too long for u8 prefix");
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

fn push_section(out: &mut Vec<u8>, id: SectionId, body: &[u8]) {
    out.push(id as u8);
    push_u32(out, body.len() as u32);
    out.extend_from_slice(body);
}
