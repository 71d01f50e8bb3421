//! Byte-level encoding for persisted policy objects.
//!
//! The encoded form is a flat big-endian byte string; decoding reuses
//! [`ByteStream`](crate::byte_stream::ByteStream).

use crate::DecodeError;
use crate::byte_stream::ByteStream;

/// Append-only big-endian byte sink.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a u16 element count followed by the elements.
    pub fn write_u16_slice(&mut self, values: &[u16]) {
        self.write_u16(values.len() as u16);
        for &value in values {
            self.write_u16(value);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reads a u16-length-prefixed vector of u16 values.
pub fn read_u16_slice(stream: &mut ByteStream<'_>) -> Result<Vec<u16>, DecodeError> {
    let count = stream.u16()?;
    let mut values = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        values.push(stream.u16()?);
    }
    Ok(values)
}
