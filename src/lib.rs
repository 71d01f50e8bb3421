#![doc = include_str!("../README.md")]

pub mod byte_stream;
pub mod codec;
pub mod decoder;
pub mod meta_packet;
pub mod policy;
pub mod protocol;
pub mod tunnel_table;

use serde::Serialize;

pub use byte_stream::ByteStream;
pub use codec::Encoder;
pub use decoder::{FrameInfo, MetaPacketIterator, SequentialDecoder};
pub use meta_packet::{
    HeaderType, MacAddr, MetaPacket, PacketFlag, TcpData, TunnelInfo, TunnelType,
};
pub use policy::{
    AclAction, AclGidBitmap, ActionFlag, Direction, INVALID_POLICY_DATA, LookupKey, NpbAction,
    NpbActions, PolicyData, TagTemplate, TapType, acquire_policy_data, clone_policy_data,
    release_policy_data,
};
pub use protocol::{EthType, IpProtocol};
pub use tunnel_table::{TunnelIpTable, tunnel_ip, tunnel_ip_id, update_tunnel_maps};

/// Error raised while decoding a compressed metadata frame.
///
/// Any of these is fatal for the frame at hand: the caller drops the frame
/// whole and resumes with the next one on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeError {
    /// The frame header claims a total size that cannot hold the header itself.
    FrameTooShort {
        /// Total frame size announced on the wire
        frame_size: u16,
    },
    /// The frame was produced by an incompatible agent version.
    VersionMismatch {
        /// Version byte found in the header
        version: u8,
    },
    /// The dispatcher index is outside the agent's queue range.
    InvalidDispatcherIndex {
        /// Index byte found in the header
        index: u8,
    },
    /// The buffer ended before the current field could be read.
    Truncated {
        /// Bytes the read needed
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },
    /// A record tried to read past the byte count announced by the frame header.
    FrameOverrun {
        /// Bytes the read needed
        needed: usize,
        /// Bytes left in the logical frame
        remaining: usize,
    },
    /// Layer overheads exceed the recorded packet length.
    PayloadUnderflow {
        /// Recorded total packet length
        packet_len: u16,
        /// L2 + L3 + L4 overhead implied by the headers
        overhead: u16,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::FrameTooShort { frame_size } => {
                write!(f, "frame size {} cannot hold a frame header", frame_size)
            }
            DecodeError::VersionMismatch { version } => {
                write!(f, "unsupported frame version {}", version)
            }
            DecodeError::InvalidDispatcherIndex { index } => {
                write!(f, "dispatcher index {} out of range", index)
            }
            DecodeError::Truncated { needed, available } => {
                write!(
                    f,
                    "buffer exhausted: needed {} bytes, {} available",
                    needed, available
                )
            }
            DecodeError::FrameOverrun { needed, remaining } => {
                write!(
                    f,
                    "record overruns frame: needed {} bytes, {} left in frame",
                    needed, remaining
                )
            }
            DecodeError::PayloadUnderflow {
                packet_len,
                overhead,
            } => {
                write!(
                    f,
                    "header overhead {} exceeds packet length {}",
                    overhead, packet_len
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}
