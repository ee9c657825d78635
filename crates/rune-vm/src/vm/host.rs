//! Host-function registration and the context handed to callbacks.

use crate::value::Value;
use crate::vm::memory::LinearMemory;
use crate::Result;

/// A native callback the guest reaches through `call_host`.
///
/// Receives a [`HostContext`] for linear-memory access, the staged
/// argument values, and returns the call result (or `Value::Void`).
/// Captured state plays the role the opaque `user_data` pointer plays in
/// C-style embeddings. A returned error propagates to the guest's
/// top-level caller as a trap, unchanged.
pub type HostFn = Box<dyn FnMut(&mut HostContext<'_>, &[Value]) -> Result<Value>>;

pub struct HostEntry {
    pub module: String,
    pub name: String,
    pub func: HostFn,
}

/// Append-only table of host functions, resolved by `(module, name)` with
/// a linear scan; the first matching entry wins.
#[derive(Default)]
pub struct HostRegistry {
    entries: Vec<HostEntry>,
}

impl HostRegistry {
    pub fn register(&mut self, module: &str, name: &str, func: HostFn) {
        self.entries.push(HostEntry {
            module: module.to_owned(),
            name: name.to_owned(),
            func,
        });
    }

    #[must_use]
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.module == module && e.name == name)
    }

    pub fn resolve(&mut self, module: &str, name: &str) -> Option<&mut HostEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.module == module && e.name == name)
    }
}

/// What a host callback may touch while the interpreter is live: the
/// public memory API and nothing else. Re-entering the VM is therefore
/// unrepresentable rather than merely rejected.
pub struct HostContext<'a> {
    memory: Option<&'a mut LinearMemory>,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(memory: Option<&'a mut LinearMemory>) -> Self {
        Self { memory }
    }

    /// Committed memory size in bytes; 0 when the module declares none.
    #[must_use]
    pub fn memory_size(&self) -> u32 {
        self.memory.as_ref().map_or(0, |m| m.size())
    }

    /// Bounds-checked read from linear memory.
    ///
    /// # Errors
    ///
    /// `Bounds` if the range leaves committed memory or none is declared.
    pub fn mem_read(&self, offset: u32, len: u32) -> Result<&[u8]> {
        match &self.memory {
            Some(mem) => mem.read(offset, len),
            None => Err(crate::Error::Bounds { offset, len }),
        }
    }

    /// Bounds-checked write into linear memory.
    ///
    /// # Errors
    ///
    /// `Bounds` if the range leaves committed memory or none is declared.
    pub fn mem_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        match &mut self.memory {
            Some(mem) => mem.write(offset, data),
            None => Err(crate::Error::Bounds {
                offset,
                len: data.len() as u32,
            }),
        }
    }

    /// Read a NUL-terminated guest string, up to `max_len` bytes.
    ///
    /// # Errors
    ///
    /// `Bounds` if `offset` is outside committed memory.
    pub fn mem_read_str(&self, offset: u32, max_len: usize) -> Result<String> {
        match &self.memory {
            Some(mem) => mem.read_str(offset, max_len),
            None => Err(crate::Error::Bounds { offset, len: 1 }),
        }
    }

    /// Commit `delta_pages` more pages; returns the previous page count.
    ///
    /// # Errors
    ///
    /// `Oom` when no memory is declared or the request exceeds the
    /// maximum.
    pub fn mem_grow(&mut self, delta_pages: u32) -> Result<u32> {
        self.memory
            .as_mut()
            .and_then(|mem| mem.grow(delta_pages))
            .ok_or_else(|| {
                crate::Error::Oom(format!("cannot grow memory by {delta_pages} pages"))
            })
    }
}
