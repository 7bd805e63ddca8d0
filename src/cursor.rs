use crate::error::ParseError;

/// Big-endian reader over a borrowed buffer. Every read checks the remaining
/// length first and reports `Truncated` instead of running off the end.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::Truncated { field });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, ParseError> {
        Ok(self.read_bytes(1, field)?[0])
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, ParseError> {
        let b = self.read_bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self, field: &'static str) -> Result<u32, ParseError> {
        let b = self.read_bytes(3, field)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, field)?);
        Ok(out)
    }

    /// Reads a `u8` length prefix followed by that many bytes.
    pub fn read_vec_u8(&mut self, field: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.read_u8(field)? as usize;
        self.read_bytes(len, field)
    }

    /// Reads a `u16` length prefix followed by that many bytes.
    pub fn read_vec_u16(&mut self, field: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.read_u16(field)? as usize;
        self.read_bytes(len, field)
    }

    /// Splits off the next `len` bytes as an independent cursor.
    pub fn sub(&mut self, len: usize, field: &'static str) -> Result<Cursor<'a>, ParseError> {
        Ok(Cursor::new(self.read_bytes(len, field)?))
    }
}
