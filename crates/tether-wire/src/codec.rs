use crate::types::{AgentError, Result};

/// Byte order negotiated during the handshake.
///
/// Every multi-byte field written or read after the handshake uses the same
/// order for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Decode the handshake endianness flag (`0` big-endian, `1` little-endian).
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::BigEndian),
            1 => Some(Self::LittleEndian),
            _ => None,
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            Self::BigEndian => 0,
            Self::LittleEndian => 1,
        }
    }

    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Self::BigEndian => v.to_be_bytes(),
            Self::LittleEndian => v.to_le_bytes(),
        }
    }

    pub fn u32_from(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::BigEndian => u32::from_be_bytes(bytes),
            Self::LittleEndian => u32::from_le_bytes(bytes),
        }
    }

    fn u64_bytes(self, v: u64) -> [u8; 8] {
        match self {
            Self::BigEndian => v.to_be_bytes(),
            Self::LittleEndian => v.to_le_bytes(),
        }
    }

    fn u64_from(self, bytes: [u8; 8]) -> u64 {
        match self {
            Self::BigEndian => u64::from_be_bytes(bytes),
            Self::LittleEndian => u64::from_le_bytes(bytes),
        }
    }
}

pub struct WireWriter {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl WireWriter {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&self.order.u32_bytes(v));
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_u32(v.to_bits());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&self.order.u64_bytes(v.to_bits()));
    }

    /// Counted string: `u32` byte length followed by UTF-8 bytes.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrite a previously written `u32` in place (used to patch the
    /// length prefix once the payload is known).
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&self.order.u32_bytes(v));
    }
}

/// Cursor over a received buffer.
///
/// Reads are sequential, but [`WireReader::at`] and [`WireReader::slice`]
/// produce independent views at arbitrary offsets that inherit the same byte
/// order.
#[derive(Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// A reader positioned at `offset` within the same buffer.
    pub fn at(&self, offset: usize) -> Result<Self> {
        if offset > self.buf.len() {
            return Err(underflow(0, offset, self.buf.len()));
        }
        Ok(Self {
            buf: self.buf,
            pos: offset,
            order: self.order,
        })
    }

    /// A sub-view covering `start..end` of the underlying buffer.
    pub fn slice(&self, start: usize, end: usize) -> Result<WireReader<'a>> {
        if start > end || end > self.buf.len() {
            return Err(AgentError::Protocol(format!(
                "invalid slice {start}..{end} of {} byte buffer",
                self.buf.len()
            )));
        }
        Ok(WireReader {
            buf: &self.buf[start..end],
            pos: 0,
            order: self.order,
        })
    }

    fn require(&self, n: usize) -> Result<()> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| underflow(n, self.pos, self.buf.len()))?;
        if end > self.buf.len() {
            return Err(underflow(n, self.pos, self.buf.len()));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(self.order.u32_from(bytes))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.require(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(f64::from_bits(self.order.u64_from(bytes)))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| {
            AgentError::Protocol(format!("unable to allocate string buffer ({len} bytes)"))
        })?;
        out.extend_from_slice(bytes);
        String::from_utf8(out).map_err(|e| AgentError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

fn underflow(need: usize, at: usize, have: usize) -> AgentError {
    AgentError::Protocol(format!(
        "buffer underflow: need {need} bytes at {at}, have {have}"
    ))
}
