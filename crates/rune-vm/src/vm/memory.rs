use crate::bytecode::PAGE_SIZE;
use crate::{Error, Result};

/// Linear memory: one contiguous buffer allocated to the maximum page
/// count up front, with a logically committed watermark in `pages`.
/// Growth only moves the watermark (and zeroes the fresh range); the
/// buffer never reallocates, so the base address handed to embedders
/// stays stable.
pub struct LinearMemory {
    buf: Vec<u8>,
    pages: u32,
    max_pages: u32,
}

impl LinearMemory {
    #[must_use]
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        Self {
            buf: vec![0; max_pages as usize * PAGE_SIZE as usize],
            pages: initial_pages,
            max_pages,
        }
    }

    /// Committed size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.pages * PAGE_SIZE
    }

    #[must_use]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// The committed prefix of the buffer.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.size() as usize]
    }

    fn check(&self, offset: u32, len: u32) -> Result<usize> {
        let end = u64::from(offset) + u64::from(len);
        if end > u64::from(self.size()) {
            return Err(Error::Bounds { offset, len });
        }
        Ok(offset as usize)
    }

    pub fn read(&self, offset: u32, len: u32) -> Result<&[u8]> {
        let start = self.check(offset, len)?;
        Ok(&self.buf[start..start + len as usize])
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Bounds { offset, len: u32::MAX })?;
        let start = self.check(offset, len)?;
        self.buf[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Fixed-width accessors used by the load/store opcodes.
    pub fn load<const N: usize>(&self, offset: u32) -> Result<[u8; N]> {
        let start = self.check(offset, N as u32)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[start..start + N]);
        Ok(out)
    }

    pub fn store<const N: usize>(&mut self, offset: u32, data: [u8; N]) -> Result<()> {
        let start = self.check(offset, N as u32)?;
        self.buf[start..start + N].copy_from_slice(&data);
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes. The NUL is
    /// not included; a string running to the limit or to the end of
    /// committed memory is returned as-is.
    pub fn read_str(&self, offset: u32, max_len: usize) -> Result<String> {
        if offset >= self.size() {
            return Err(Error::Bounds { offset, len: 1 });
        }
        let avail = (self.size() - offset) as usize;
        let limit = avail.min(max_len);
        let start = offset as usize;
        let window = &self.buf[start..start + limit];
        let bytes = match window.iter().position(|&b| b == 0) {
            Some(nul) => &window[..nul],
            None => window,
        };
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Commit `delta` more pages and zero the fresh range. Returns the
    /// previous page count, or `None` when the request exceeds the
    /// maximum.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let new_pages = self.pages.checked_add(delta)?;
        if new_pages > self.max_pages {
            return None;
        }
        let start = self.size() as usize;
        let end = new_pages as usize * PAGE_SIZE as usize;
        self.buf[start..end].fill(0);
        let previous = self.pages;
        self.pages = new_pages;
        Some(previous)
    }

    /// `memmove` semantics: overlapping ranges are well-defined.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<()> {
        self.check(dst, len)?;
        let src_start = self.check(src, len)?;
        self.buf
            .copy_within(src_start..src_start + len as usize, dst as usize);
        Ok(())
    }

    pub fn fill(&mut self, dst: u32, byte: u8, len: u32) -> Result<()> {
        let start = self.check(dst, len)?;
        self.buf[start..start + len as usize].fill(byte);
        Ok(())
    }
}
