//! The VM instance: lifecycle, host registration, public memory API,
//! fuel accounting and diagnostics. Execution itself lives in `interp`.

mod host;
mod interp;
mod memory;
mod stack;

pub use host::{HostContext, HostFn};

use crate::bytecode::{ExportKind, MAX_PARAMS, PAGE_SIZE};
use crate::module::Module;
use crate::value::Value;
use crate::{Error, Result};
use host::HostRegistry;
use memory::LinearMemory;
use stack::CallStack;

/// Execution limits for one VM instance.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum call depth.
    pub stack_size: u32,
    /// Cap on linear memory, in bytes.
    pub memory_limit: u64,
    /// Cap on instructions per top-level call; 0 means unlimited.
    pub fuel_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 64,
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: 0,
        }
    }
}

/// A single-threaded VM instance over a loaded [`Module`].
///
/// The module must outlive the VM (it is borrowed, so the compiler holds
/// you to it). Code regions are read straight out of the module's byte
/// copy; nothing is re-parsed at call time.
pub struct Vm<'m> {
    module: &'m Module,
    config: Config,
    host: HostRegistry,
    memory: Option<LinearMemory>,
    globals: Vec<Value>,
    stack: CallStack,
    arg_buf: [Value; MAX_PARAMS],
    arg_count: usize,
    fuel_used: u64,
    error_buf: String,
    initialized: bool,
}

impl<'m> Vm<'m> {
    #[must_use]
    pub fn new(module: &'m Module, config: Config) -> Self {
        Self {
            module,
            config,
            host: HostRegistry::default(),
            memory: None,
            globals: Vec::new(),
            stack: CallStack::new(config.stack_size),
            arg_buf: [Value::Void; MAX_PARAMS],
            arg_count: 0,
            fuel_used: 0,
            error_buf: String::new(),
            initialized: false,
        }
    }

    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// Register a host function for `(module, name)`. Captured state plays
    /// the role of the embedder's user data.
    ///
    /// # Errors
    ///
    /// `BadModule` once the VM is initialized; the import set is fixed at
    /// init time.
    pub fn register<F>(&mut self, module: &str, name: &str, func: F) -> Result<()>
    where
        F: FnMut(&mut HostContext<'_>, &[Value]) -> Result<Value> + 'static,
    {
        if self.initialized {
            return Err(Error::BadModule(
                "host functions must be registered before init".into(),
            ));
        }
        self.host.register(module, name, Box::new(func));
        Ok(())
    }

    /// Initialize the instance: resolve imports, set up linear memory and
    /// data segments, copy globals, then run the module's `_init` export
    /// if it has one. Succeeds at most once.
    ///
    /// # Errors
    ///
    /// `NoImport` for the first unsatisfied import, `Oom` when the
    /// declared memory exceeds the configured limit, `Bounds` for a data
    /// segment outside initial memory, plus anything `_init` itself traps
    /// with. `BadModule` on a second init.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::BadModule("already initialized".into()));
        }
        self.error_buf.clear();
        let result = self.init_inner();
        self.seal(result)
    }

    fn init_inner(&mut self) -> Result<()> {
        for import in self.module.imports() {
            if !self.host.contains(&import.module, &import.name) {
                return Err(Error::NoImport(format!(
                    "{}::{}",
                    import.module, import.name
                )));
            }
        }

        if let Some(limits) = self.module.memory() {
            let max_pages = u32::from(limits.effective_max());
            let bytes = u64::from(max_pages) * u64::from(PAGE_SIZE);
            if bytes > self.config.memory_limit {
                return Err(Error::Oom(format!(
                    "module declares {bytes} bytes of memory, limit is {}",
                    self.config.memory_limit
                )));
            }
            let mut memory = LinearMemory::new(u32::from(limits.initial_pages), max_pages);
            for segment in self.module.data_segments() {
                memory.write(segment.offset, self.module.segment_bytes(segment))?;
            }
            self.memory = Some(memory);
        }

        self.globals = self.module.globals().iter().map(|g| g.value).collect();
        self.initialized = true;

        if let Some(init_func) = self.module.init_func() {
            tracing::debug!(func = init_func, "running _init");
            self.exec(init_func, &[])?;
        }

        tracing::debug!(
            memory_pages = self.memory.as_ref().map_or(0, LinearMemory::pages),
            globals = self.globals.len(),
            "vm initialized"
        );
        Ok(())
    }

    /// Call an exported function by name.
    ///
    /// # Errors
    ///
    /// `NoExport` when no function export matches; otherwise whatever the
    /// execution traps with. The rendered diagnostic stays available via
    /// [`last_error`](Self::last_error).
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        if !self.initialized {
            self.error_buf = "VM not initialized, call init first".into();
            return Err(Error::BadModule("VM not initialized".into()));
        }
        self.error_buf.clear();
        self.arg_buf = [Value::Void; MAX_PARAMS];
        self.arg_count = 0;

        let Some(export) = self.module.find_export(name, ExportKind::Func) else {
            self.error_buf = format!("export not found: {name}");
            return Err(Error::NoExport(name.to_owned()));
        };
        let index = export.index;
        tracing::trace!(export = name, index, argc = args.len(), "call");
        let result = self.exec(index, args);
        self.seal(result)
    }

    // ── Public memory API (same bounds rule as the interpreter) ──

    /// The committed bytes of linear memory, if the module declares any.
    #[must_use]
    pub fn memory(&self) -> Option<&[u8]> {
        self.memory.as_ref().map(LinearMemory::bytes)
    }

    /// Committed memory size in bytes (0 without a memory declaration).
    #[must_use]
    pub fn memory_size(&self) -> u32 {
        self.memory.as_ref().map_or(0, LinearMemory::size)
    }

    /// # Errors
    ///
    /// `Bounds` when the range leaves committed memory.
    pub fn mem_read(&self, offset: u32, len: u32) -> Result<&[u8]> {
        match &self.memory {
            Some(mem) => mem.read(offset, len),
            None => Err(Error::Bounds { offset, len }),
        }
    }

    /// # Errors
    ///
    /// `Bounds` when the range leaves committed memory.
    pub fn mem_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        match &mut self.memory {
            Some(mem) => mem.write(offset, data),
            None => Err(Error::Bounds {
                offset,
                len: data.len() as u32,
            }),
        }
    }

    /// Read a NUL-terminated guest string of at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// `Bounds` when `offset` is outside committed memory.
    pub fn mem_read_str(&self, offset: u32, max_len: usize) -> Result<String> {
        match &self.memory {
            Some(mem) => mem.read_str(offset, max_len),
            None => Err(Error::Bounds { offset, len: 1 }),
        }
    }

    /// Commit `delta_pages` more pages of linear memory; returns the
    /// previous page count.
    ///
    /// # Errors
    ///
    /// `Oom` when the module declares no memory or the request exceeds
    /// its maximum.
    pub fn mem_grow(&mut self, delta_pages: u32) -> Result<u32> {
        self.memory
            .as_mut()
            .and_then(|mem| mem.grow(delta_pages))
            .ok_or_else(|| Error::Oom(format!("cannot grow memory by {delta_pages} pages")))
    }

    // ── Fuel and diagnostics ──

    /// Reset the fuel counter and set a new limit (0 = unlimited).
    pub fn refuel(&mut self, fuel_limit: u64) {
        self.fuel_used = 0;
        self.config.fuel_limit = fuel_limit;
    }

    /// Instructions dispatched since creation or the last refuel.
    #[must_use]
    pub fn fuel_used(&self) -> u64 {
        self.fuel_used
    }

    /// Human-readable description of the most recent failure, empty after
    /// a successful call.
    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.error_buf
    }

    /// Record a site-specific diagnostic; the first one set wins.
    pub(crate) fn diag(&mut self, message: String) {
        if self.error_buf.is_empty() {
            self.error_buf = message;
        }
    }

    fn seal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if self.error_buf.is_empty() {
                self.error_buf = err.to_string();
            }
            tracing::debug!(error = %err, "vm call failed");
        }
        result
    }
}
