use crate::{Error, Result};

/// Bounded little-endian decoder over a byte slice.
///
/// Every read is fallible; running past the end of the slice yields
/// `Error::BadModule` naming what was being read. The loader leans on this
/// so no section parser can index out of bounds.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [b] = *self.read_array::<1>("u8")?;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(*self.read_array::<2>("u16")?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(*self.read_array::<4>("u32")?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(*self.read_array::<8>("u64")?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| truncated("bytes"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a u8-length-prefixed string. Invalid UTF-8 is rejected.
    pub fn read_str8(&mut self) -> Result<String> {
        let len = u32::from(self.read_u8()?);
        if len > super::MAX_STRING {
            return Err(Error::BadModule(format!("string length {len} too large")));
        }
        let bytes = self.read_bytes(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::BadModule("string is not valid UTF-8".into()))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self, what: &str) -> Result<&'a [u8; N]> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| truncated(what))?;
        let bytes = self.data[self.pos..end]
            .try_into()
            .map_err(|_| truncated(what))?;
        self.pos = end;
        Ok(bytes)
    }
}

fn truncated(what: &str) -> Error {
    Error::BadModule(format!("truncated while reading {what}"))
}
