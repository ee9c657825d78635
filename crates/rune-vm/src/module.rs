//! Module loading: parse and validate a `.rune` binary into an in-memory
//! [`Module`] that owns its bytes and answers export/import queries.

use std::ops::Range;

use crate::bytecode::{
    self, ExportKind, HEADER_SIZE, MAGIC, MAX_DATA_SEGMENTS, MAX_EXPORTS, MAX_FUNCS, MAX_GLOBALS,
    MAX_PARAMS, Reader, SectionId, VERSION,
};
use crate::value::{Value, ValueType};
use crate::{Error, Result};

/// A function signature: ordered parameters, at most one return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValueType>,
    pub ret: Option<ValueType>,
}

/// One import declaration, resolved against the host registry at init.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub type_index: u16,
}

/// A function in the combined index space (imports first, then locals).
#[derive(Debug, Clone)]
pub struct Func {
    pub type_index: u16,
    pub body: FuncBody,
}

#[derive(Debug, Clone)]
pub enum FuncBody {
    Import { import_index: u32 },
    Local(LocalFunc),
}

/// Header and code region of a function defined in this module. The code
/// range points into the module's owned byte copy.
#[derive(Debug, Clone)]
pub struct LocalFunc {
    pub reg_count: u8,
    pub local_count: u8,
    code: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub ty: ValueType,
    pub mutable: bool,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub kind: ExportKind,
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    bytes: Range<usize>,
}

/// Linear-memory declaration in 64 KiB pages.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub initial_pages: u16,
    pub max_pages: u16,
}

impl MemoryLimits {
    /// A declared max of 0 means "equal to initial".
    #[must_use]
    pub fn effective_max(self) -> u16 {
        if self.max_pages == 0 {
            self.initial_pages
        } else {
            self.max_pages
        }
    }
}

/// A loaded, validated module. Owns a copy of the raw bytes; code regions
/// are ranges into that copy, so the module must outlive any VM built on
/// it (the VM borrows it, which the compiler enforces).
#[derive(Debug)]
pub struct Module {
    bytes: Vec<u8>,
    types: Vec<FuncType>,
    imports: Vec<Import>,
    funcs: Vec<Func>,
    globals: Vec<Global>,
    exports: Vec<Export>,
    data_segments: Vec<DataSegment>,
    memory: Option<MemoryLimits>,
    init_func: Option<u32>,
}

impl Module {
    /// Parse and validate a module binary.
    ///
    /// # Errors
    ///
    /// `BadMagic` / `VersionMismatch` on header checks; `BadModule` on a
    /// CRC mismatch or any structural violation (truncated or duplicate
    /// section, count caps, index ranges, misaligned code).
    pub fn load(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::BadModule("shorter than the file header".into()));
        }
        if raw[0..4] != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != VERSION {
            return Err(Error::VersionMismatch {
                got: version,
                expected: VERSION,
            });
        }
        let stored_crc = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let computed = bytecode::crc32(&raw[HEADER_SIZE..]);
        if stored_crc != computed {
            return Err(Error::BadModule(format!(
                "CRC mismatch: stored {stored_crc:08x}, computed {computed:08x}"
            )));
        }

        // The module owns its bytes; code regions index into this copy.
        let bytes = raw.to_vec();
        let sections = collect_sections(&bytes)?;

        let mut module = Self {
            bytes: Vec::new(),
            types: Vec::new(),
            imports: Vec::new(),
            funcs: Vec::new(),
            globals: Vec::new(),
            exports: Vec::new(),
            data_segments: Vec::new(),
            memory: None,
            init_func: None,
        };

        // Sections may appear in any order in the file; parsing happens in
        // dependency order so each parser sees the tables it refers to.
        for id in [
            SectionId::Type,
            SectionId::Import,
            SectionId::Func,
            SectionId::Memory,
            SectionId::Global,
            SectionId::Export,
            SectionId::Code,
            SectionId::Data,
        ] {
            if let Some(range) = section_range(&sections, id) {
                module.parse_section(id, range, &bytes)?;
            }
        }
        module.bytes = bytes;

        let has_code = section_range(&sections, SectionId::Code).is_some();
        if !has_code && module.local_count() > 0 {
            return Err(Error::BadModule(format!(
                "FUNC declares {} bodies but there is no CODE section",
                module.local_count()
            )));
        }

        module.init_func = module
            .find_export("_init", ExportKind::Func)
            .map(|e| e.index);

        tracing::debug!(
            types = module.types.len(),
            imports = module.imports.len(),
            funcs = module.funcs.len(),
            globals = module.globals.len(),
            exports = module.exports.len(),
            has_memory = module.memory.is_some(),
            "module loaded"
        );
        Ok(module)
    }

    fn parse_section(&mut self, id: SectionId, range: Range<usize>, bytes: &[u8]) -> Result<()> {
        let base = range.start;
        let payload = &bytes[range];
        let mut r = Reader::new(payload);
        match id {
            SectionId::Type => self.parse_types(&mut r),
            SectionId::Import => self.parse_imports(&mut r),
            SectionId::Func => self.parse_funcs(&mut r),
            SectionId::Memory => {
                let initial_pages = r.read_u16()?;
                let max_pages = r.read_u16()?;
                self.memory = Some(MemoryLimits {
                    initial_pages,
                    max_pages,
                });
                Ok(())
            }
            SectionId::Global => self.parse_globals(&mut r),
            SectionId::Export => self.parse_exports(&mut r),
            SectionId::Code => {
                // Code ranges must be absolute into the owned byte copy.
                let count = r.read_u32()?;
                let mut code_ranges = Vec::new();
                for _ in 0..count {
                    let len = r.read_u32()?;
                    if len % 4 != 0 {
                        return Err(Error::BadModule(format!(
                            "code size {len} is not a multiple of 4"
                        )));
                    }
                    let start = base + r.pos();
                    r.skip(len as usize)?;
                    code_ranges.push(start..start + len as usize);
                }
                self.attach_code(code_ranges)
            }
            SectionId::Data => self.parse_data(&mut r, base),
        }
    }

    fn parse_types(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.read_u32()?;
        if count > MAX_FUNCS {
            return Err(Error::BadModule(format!("too many types: {count}")));
        }
        self.types.reserve(count as usize);
        for _ in 0..count {
            let param_count = r.read_u8()?;
            let return_count = r.read_u8()?;
            if usize::from(param_count) > MAX_PARAMS {
                return Err(Error::BadModule(format!(
                    "type has {param_count} parameters (max {MAX_PARAMS})"
                )));
            }
            if return_count > 1 {
                return Err(Error::BadModule(format!(
                    "type has {return_count} returns (max 1)"
                )));
            }
            let mut params = Vec::with_capacity(usize::from(param_count));
            for _ in 0..param_count {
                params.push(read_type_tag(r)?);
            }
            let ret = if return_count == 1 {
                Some(read_type_tag(r)?)
            } else {
                None
            };
            self.types.push(FuncType { params, ret });
        }
        Ok(())
    }

    fn parse_imports(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.read_u32()?;
        if count > MAX_FUNCS {
            return Err(Error::BadModule(format!("too many imports: {count}")));
        }
        for _ in 0..count {
            let module = r.read_str8()?;
            let name = r.read_str8()?;
            let type_index = r.read_u16()?;
            self.check_type_index(type_index)?;
            let import_index = self.imports.len() as u32;
            self.imports.push(Import {
                module,
                name,
                type_index,
            });
            // Imports occupy the front of the function index space.
            self.funcs.push(Func {
                type_index,
                body: FuncBody::Import { import_index },
            });
        }
        Ok(())
    }

    fn parse_funcs(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.read_u32()?;
        let total = count as u64 + self.imports.len() as u64;
        if total > u64::from(MAX_FUNCS) {
            return Err(Error::BadModule(format!("too many functions: {total}")));
        }
        for _ in 0..count {
            let type_index = r.read_u16()?;
            self.check_type_index(type_index)?;
            let reg_count = r.read_u8()?;
            let local_count = r.read_u8()?;
            self.funcs.push(Func {
                type_index,
                body: FuncBody::Local(LocalFunc {
                    reg_count,
                    local_count,
                    code: 0..0,
                }),
            });
        }
        Ok(())
    }

    fn parse_globals(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.read_u32()?;
        if count > MAX_GLOBALS {
            return Err(Error::BadModule(format!("too many globals: {count}")));
        }
        for _ in 0..count {
            let tag = r.read_u8()?;
            let mutable = r.read_u8()? != 0;
            let raw = r.read_u64()?;
            // The initial value is always 8 raw bytes, padded for the
            // 4-byte types.
            let (ty, value) = match ValueType::from_u8(tag) {
                Some(ValueType::I32) => (ValueType::I32, Value::I32(raw as u32 as i32)),
                Some(ValueType::I64) => (ValueType::I64, Value::I64(raw as i64)),
                Some(ValueType::F32) => (ValueType::F32, Value::F32(f32::from_bits(raw as u32))),
                Some(ValueType::F64) => (ValueType::F64, Value::F64(f64::from_bits(raw))),
                _ => {
                    return Err(Error::BadModule(format!(
                        "global type tag 0x{tag:02x} is not a numeric scalar"
                    )));
                }
            };
            self.globals.push(Global { ty, mutable, value });
        }
        Ok(())
    }

    fn parse_exports(&mut self, r: &mut Reader<'_>) -> Result<()> {
        let count = r.read_u32()?;
        if count > MAX_EXPORTS {
            return Err(Error::BadModule(format!("too many exports: {count}")));
        }
        for _ in 0..count {
            let kind = r.read_u8()?;
            let kind = ExportKind::from_u8(kind)
                .ok_or_else(|| Error::BadModule(format!("unknown export kind {kind}")))?;
            let index = r.read_u32()?;
            let name = r.read_str8()?;
            self.exports.push(Export { kind, index, name });
        }
        Ok(())
    }

    fn parse_data(&mut self, r: &mut Reader<'_>, base: usize) -> Result<()> {
        let count = r.read_u32()?;
        if count > MAX_DATA_SEGMENTS {
            return Err(Error::BadModule(format!("too many data segments: {count}")));
        }
        for _ in 0..count {
            let _memory_index = r.read_u8()?;
            let offset = r.read_u32()?;
            let size = r.read_u32()?;
            let start = base + r.pos();
            r.skip(size as usize)?;
            self.data_segments.push(DataSegment {
                offset,
                bytes: start..start + size as usize,
            });
        }
        Ok(())
    }

    fn attach_code(&mut self, code_ranges: Vec<Range<usize>>) -> Result<()> {
        let mut ranges = code_ranges.into_iter();
        for func in &mut self.funcs {
            if let FuncBody::Local(local) = &mut func.body {
                local.code = ranges.next().ok_or_else(|| {
                    Error::BadModule("CODE carries fewer bodies than FUNC declares".into())
                })?;
            }
        }
        if ranges.next().is_some() {
            return Err(Error::BadModule(
                "CODE carries more bodies than FUNC declares".into(),
            ));
        }
        Ok(())
    }

    fn check_type_index(&self, index: u16) -> Result<()> {
        if usize::from(index) >= self.types.len() {
            return Err(Error::BadModule(format!("type index {index} out of range")));
        }
        Ok(())
    }

    fn local_count(&self) -> usize {
        self.funcs.len() - self.imports.len()
    }

    // ── Queries ──

    #[must_use]
    pub fn func(&self, index: u32) -> Option<&Func> {
        self.funcs.get(index as usize)
    }

    #[must_use]
    pub fn func_count(&self) -> u32 {
        self.funcs.len() as u32
    }

    #[must_use]
    pub fn func_type(&self, func: &Func) -> Option<&FuncType> {
        self.types.get(usize::from(func.type_index))
    }

    #[must_use]
    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    #[must_use]
    pub fn import_count(&self) -> u32 {
        self.imports.len() as u32
    }

    #[must_use]
    pub fn import_module(&self, index: u32) -> Option<&str> {
        self.imports.get(index as usize).map(|i| i.module.as_str())
    }

    #[must_use]
    pub fn import_name(&self, index: u32) -> Option<&str> {
        self.imports.get(index as usize).map(|i| i.name.as_str())
    }

    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    #[must_use]
    pub fn export_count(&self) -> u32 {
        self.exports.len() as u32
    }

    #[must_use]
    pub fn export_name(&self, index: u32) -> Option<&str> {
        self.exports.get(index as usize).map(|e| e.name.as_str())
    }

    /// First export matching `name` and `kind`, if any. Duplicate names
    /// resolve to the first record, matching the linear-scan contract.
    #[must_use]
    pub fn find_export(&self, name: &str, kind: ExportKind) -> Option<&Export> {
        self.exports
            .iter()
            .find(|e| e.kind == kind && e.name == name)
    }

    #[must_use]
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    #[must_use]
    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data_segments
    }

    #[must_use]
    pub fn segment_bytes(&self, segment: &DataSegment) -> &[u8] {
        &self.bytes[segment.bytes.clone()]
    }

    #[must_use]
    pub fn memory(&self) -> Option<MemoryLimits> {
        self.memory
    }

    /// Function index of the `_init` export, if the module has one.
    #[must_use]
    pub fn init_func(&self) -> Option<u32> {
        self.init_func
    }

    /// The code region of a local function, as little-endian 32-bit words.
    #[must_use]
    pub fn code(&self, local: &LocalFunc) -> &[u8] {
        &self.bytes[local.code.clone()]
    }
}

fn read_type_tag(r: &mut Reader<'_>) -> Result<ValueType> {
    let tag = r.read_u8()?;
    ValueType::from_u8(tag)
        .ok_or_else(|| Error::BadModule(format!("unknown type tag 0x{tag:02x}")))
}

/// First pass over the TLV body: record each known section's payload range
/// (absolute into the byte copy), reject duplicates, skip unknown ids.
fn collect_sections(bytes: &[u8]) -> Result<Vec<(SectionId, Range<usize>)>> {
    let body = &bytes[HEADER_SIZE..];
    let mut r = Reader::new(body);
    let mut sections: Vec<(SectionId, Range<usize>)> = Vec::new();
    while !r.is_empty() {
        let id = r.read_u8()?;
        let len = r.read_u32()? as usize;
        let start = HEADER_SIZE + r.pos();
        r.skip(len)
            .map_err(|_| Error::BadModule(format!("section {id} overruns the file")))?;
        match SectionId::from_u8(id) {
            Some(section) => {
                if sections.iter().any(|(seen, _)| *seen == section) {
                    return Err(Error::BadModule(format!("duplicate section {section:?}")));
                }
                sections.push((section, start..start + len));
            }
            None => {
                tracing::warn!(id, len, "skipping unknown section");
            }
        }
    }
    Ok(sections)
}

fn section_range(sections: &[(SectionId, Range<usize>)], id: SectionId) -> Option<Range<usize>> {
    sections
        .iter()
        .find(|(seen, _)| *seen == id)
        .map(|(_, range)| range.clone())
}
