//! Big-endian cursor over a borrowed byte buffer.

use nom::bytes::complete::take;
use nom::number::complete::{be_u8, be_u16, be_u32, be_u64};

use crate::DecodeError;

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// A cursor over `&[u8]` with big-endian reads.
///
/// All reads advance the cursor; running off the end of the buffer yields
/// [`DecodeError::Truncated`]. Extracted fields borrow from the underlying
/// buffer, so they stay valid after the cursor moves on.
#[derive(Debug, Clone)]
pub struct ByteStream<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// The not-yet-consumed tail of the buffer, without advancing.
    pub fn slice(&self) -> &'a [u8] {
        self.data
    }

    fn truncated(&self, needed: usize) -> DecodeError {
        DecodeError::Truncated {
            needed,
            available: self.data.len(),
        }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let (rest, value) =
            be_u8::<_, NomError<'a>>(self.data).map_err(|_| self.truncated(1))?;
        self.data = rest;
        self.offset += 1;
        Ok(value)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let (rest, value) =
            be_u16::<_, NomError<'a>>(self.data).map_err(|_| self.truncated(2))?;
        self.data = rest;
        self.offset += 2;
        Ok(value)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let (rest, value) =
            be_u32::<_, NomError<'a>>(self.data).map_err(|_| self.truncated(4))?;
        self.data = rest;
        self.offset += 4;
        Ok(value)
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let (rest, value) =
            be_u64::<_, NomError<'a>>(self.data).map_err(|_| self.truncated(8))?;
        self.data = rest;
        self.offset += 8;
        Ok(value)
    }

    /// Extracts the next `len` bytes as a borrowed slice.
    pub fn field(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let (rest, value) =
            take::<_, _, NomError<'a>>(len)(self.data).map_err(|_| self.truncated(len))?;
        self.data = rest;
        self.offset += len;
        Ok(value)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.field(len).map(|_| ())
    }
}
