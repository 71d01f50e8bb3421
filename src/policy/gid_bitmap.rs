//! ACL-GID bitmap windows.
//!
//! Layout (MSB to LSB):
//!
//! ```text
//!  63..62      61..55         54..48        47..24       23..0
//! +--------+--------------+--------------+------------+------------+
//! |  TYPE  | SrcMapOffset | DstMapOffset | SrcMapBits | DstMapBits |
//! +--------+--------------+--------------+------------+------------+
//! ```
//!
//! Offsets are stored divided by the 24-bit window width; each map bit
//! marks one resource group inside the window.

use std::fmt;

use serde::Serialize;

use crate::DecodeError;
use crate::byte_stream::ByteStream;
use crate::codec::Encoder;

pub const GROUP_TYPE_SRC: u8 = 0x0;
pub const GROUP_TYPE_DST: u8 = 0x1;
pub const GROUP_TYPE_ALL: u8 = 0x2;

/// Groups covered by one bitmap window.
pub const MAP_BITS_PER_ENTRY: u32 = 24;

const GROUP_TYPE_SHIFT: u32 = 62;
const GROUP_TYPE_MASK: u64 = 0x3;
const SRC_MAP_OFFSET_SHIFT: u32 = 55;
const DST_MAP_OFFSET_SHIFT: u32 = 48;
const SRC_MAP_BITS_SHIFT: u32 = 24;
const MAP_OFFSET_MASK: u64 = 0x7f;
const MAP_BITS_MASK: u64 = 0xff_ffff;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AclGidBitmap(u64);

impl AclGidBitmap {
    pub fn from_bits(bits: u64) -> Self {
        AclGidBitmap(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn set_src_and_dst_flag(self) -> Self {
        AclGidBitmap(self.0 | u64::from(GROUP_TYPE_ALL) << GROUP_TYPE_SHIFT)
    }

    pub fn group_type(self) -> u8 {
        (self.0 >> GROUP_TYPE_SHIFT & GROUP_TYPE_MASK) as u8
    }

    pub fn set_src_map_offset(self, offset: u32) -> Self {
        let stored = u64::from(offset / MAP_BITS_PER_ENTRY);
        AclGidBitmap(
            self.0 & !(MAP_OFFSET_MASK << SRC_MAP_OFFSET_SHIFT)
                | (stored & MAP_OFFSET_MASK) << SRC_MAP_OFFSET_SHIFT,
        )
    }

    pub fn set_dst_map_offset(self, offset: u32) -> Self {
        let stored = u64::from(offset / MAP_BITS_PER_ENTRY);
        AclGidBitmap(
            self.0 & !(MAP_OFFSET_MASK << DST_MAP_OFFSET_SHIFT)
                | (stored & MAP_OFFSET_MASK) << DST_MAP_OFFSET_SHIFT,
        )
    }

    /// Marks the group at `offset` within the source window.
    pub fn set_src_map_bits(self, offset: u32) -> Self {
        AclGidBitmap(self.0 | 1 << (offset % MAP_BITS_PER_ENTRY + SRC_MAP_BITS_SHIFT))
    }

    /// Marks the group at `offset` within the destination window.
    pub fn set_dst_map_bits(self, offset: u32) -> Self {
        AclGidBitmap(self.0 | 1 << (offset % MAP_BITS_PER_ENTRY))
    }

    pub fn src_map_offset(self) -> u32 {
        (self.0 >> SRC_MAP_OFFSET_SHIFT & MAP_OFFSET_MASK) as u32 * MAP_BITS_PER_ENTRY
    }

    pub fn dst_map_offset(self) -> u32 {
        (self.0 >> DST_MAP_OFFSET_SHIFT & MAP_OFFSET_MASK) as u32 * MAP_BITS_PER_ENTRY
    }

    pub fn src_map_bits(self) -> u32 {
        (self.0 >> SRC_MAP_BITS_SHIFT & MAP_BITS_MASK) as u32
    }

    pub fn dst_map_bits(self) -> u32 {
        (self.0 & MAP_BITS_MASK) as u32
    }

    /// Swaps the source and destination windows in place.
    pub fn reverse(&mut self) {
        let mut reversed = AclGidBitmap::default()
            .set_src_and_dst_flag()
            .set_src_map_offset(self.dst_map_offset())
            .set_dst_map_offset(self.src_map_offset());
        reversed.0 |= u64::from(self.src_map_bits());
        reversed.0 |= u64::from(self.dst_map_bits()) << SRC_MAP_BITS_SHIFT;
        *self = reversed;
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64(self.0);
    }

    pub fn decode(stream: &mut ByteStream<'_>) -> Result<Self, DecodeError> {
        Ok(AclGidBitmap(stream.u64()?))
    }
}

impl fmt::Display for AclGidBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type: {} src offset: {} src bits: {:#x} dst offset: {} dst bits: {:#x} raw: {:#x}}}",
            self.group_type(),
            self.src_map_offset(),
            self.src_map_bits(),
            self.dst_map_offset(),
            self.dst_map_bits(),
            self.0
        )
    }
}
