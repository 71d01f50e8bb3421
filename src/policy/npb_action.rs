//! Bit-packed network-packet-broker (mirror) actions.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::DecodeError;
use crate::byte_stream::ByteStream;
use crate::codec::{Encoder, read_u16_slice};
use crate::meta_packet::TunnelType;
use crate::tunnel_table;

pub const TAPSIDE_SRC: u8 = 0x1;
pub const TAPSIDE_DST: u8 = 0x2;
pub const TAPSIDE_MASK: u8 = TAPSIDE_SRC | TAPSIDE_DST;
pub const TAPSIDE_ALL: u8 = TAPSIDE_SRC | TAPSIDE_DST;

pub const RESOURCE_GROUP_TYPE_DEV: u8 = 0x1;
pub const RESOURCE_GROUP_TYPE_IP: u8 = 0x2;
pub const RESOURCE_GROUP_TYPE_MASK: u8 = RESOURCE_GROUP_TYPE_DEV | RESOURCE_GROUP_TYPE_IP;

/// Bit-packed NPB action.
///
/// Layout (MSB to LSB): 16b tunnel GID | 16b payload slice | 2b tunnel
/// type | 2b resource-group type | 2b TAP side | 2b reserved | 24b tunnel
/// id. The layout is a wire contract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NpbAction(u64);

impl NpbAction {
    pub fn new(
        acl_gid: u16,
        tunnel_id: u32,
        tunnel_type: TunnelType,
        resource_group_type: u8,
        tap_side: u8,
        payload_slice: u16,
    ) -> Self {
        NpbAction(
            u64::from(acl_gid) << 48
                | u64::from(payload_slice) << 32
                | u64::from(tunnel_type as u8 & 0x3) << 30
                | u64::from(resource_group_type & RESOURCE_GROUP_TYPE_MASK) << 28
                | u64::from(tap_side & TAPSIDE_MASK) << 26
                | u64::from(tunnel_id & 0xff_ffff),
        )
    }

    pub fn from_bits(bits: u64) -> Self {
        NpbAction(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn tap_side(self) -> u8 {
        (self.0 >> 26) as u8 & TAPSIDE_MASK
    }

    pub fn tap_side_matches(self, side: u8) -> bool {
        self.tap_side() & side == side
    }

    pub fn set_tap_side(&mut self, side: u8) {
        self.0 &= !(u64::from(TAPSIDE_MASK) << 26);
        self.0 |= u64::from(side & TAPSIDE_MASK) << 26;
    }

    pub fn add_tap_side(&mut self, side: u8) {
        self.0 |= u64::from(side & TAPSIDE_MASK) << 26;
    }

    /// SRC and DST swap; an action already matching both sides is returned
    /// unchanged.
    pub fn reverse_tap_side(self) -> Self {
        if self.tap_side() == TAPSIDE_ALL {
            return self;
        }
        NpbAction(self.0 ^ u64::from(TAPSIDE_MASK) << 26)
    }

    pub fn resource_group_type(self) -> u8 {
        (self.0 >> 28) as u8 & RESOURCE_GROUP_TYPE_MASK
    }

    pub fn resource_group_type_matches(self, group_type: u8) -> bool {
        self.resource_group_type() & group_type == group_type
    }

    pub fn add_resource_group_type(&mut self, group_type: u8) {
        self.0 |= u64::from(group_type & RESOURCE_GROUP_TYPE_MASK) << 28;
    }

    pub fn tunnel_gid(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn tunnel_type(self) -> TunnelType {
        TunnelType::from((self.0 >> 30) as u8 & 0x3)
    }

    /// Mirror-destination IP resolved through the process-wide tunnel
    /// table; PCAP actions have no destination.
    pub fn tunnel_ip(self) -> Option<IpAddr> {
        if self.tunnel_type() == TunnelType::Pcap {
            return None;
        }
        tunnel_table::tunnel_ip(self.tunnel_gid())
    }

    /// Mirror-destination IP id from the tunnel table; 0 for PCAP actions.
    pub fn tunnel_ip_id(self) -> u16 {
        if self.tunnel_type() == TunnelType::Pcap {
            return 0;
        }
        tunnel_table::tunnel_ip_id(self.tunnel_gid())
    }

    pub fn tunnel_id(self) -> u32 {
        (self.0 & 0xff_ffff) as u32
    }

    pub fn set_tunnel_id(&mut self, id: u32) {
        self.0 &= !0xff_ffff;
        self.0 |= u64::from(id & 0xff_ffff);
    }

    /// Bytes of payload to mirror; 0 means the whole payload.
    pub fn payload_slice(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn set_payload_slice(&mut self, payload_slice: u16) {
        self.0 &= !(0xffff << 32);
        self.0 |= u64::from(payload_slice) << 32;
    }
}

impl fmt::Display for NpbAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tunnel_type() == TunnelType::Pcap {
            write!(
                f,
                "{{gid: {} type: {:?} slice: {} side: {} group: {}}}",
                self.tunnel_gid(),
                self.tunnel_type(),
                self.payload_slice(),
                self.tap_side(),
                self.resource_group_type()
            )
        } else {
            write!(
                f,
                "{{{}@{:?} gid: {} type: {:?} slice: {} side: {} group: {}}}",
                self.tunnel_id(),
                self.tunnel_ip(),
                self.tunnel_gid(),
                self.tunnel_type(),
                self.payload_slice(),
                self.tap_side(),
                self.resource_group_type()
            )
        }
    }
}

/// An [`NpbAction`] plus the ACL GIDs it is attributed to.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NpbActions {
    pub action: NpbAction,
    acl_gids: Vec<u16>,
}

impl NpbActions {
    pub fn new(
        acl_gid: u16,
        tunnel_id: u32,
        tunnel_type: TunnelType,
        resource_group_type: u8,
        tap_side: u8,
        payload_slice: u16,
    ) -> Self {
        NpbActions {
            action: NpbAction::new(
                acl_gid,
                tunnel_id,
                tunnel_type,
                resource_group_type,
                tap_side,
                payload_slice,
            ),
            acl_gids: vec![acl_gid],
        }
    }

    pub fn acl_gids(&self) -> &[u16] {
        &self.acl_gids
    }

    /// Adds GIDs not already attributed.
    pub fn add_acl_gid(&mut self, acl_gids: &[u16]) {
        for &gid in acl_gids {
            if !self.acl_gids.contains(&gid) {
                self.acl_gids.push(gid);
            }
        }
    }

    pub fn reverse_tap_side(&self) -> Self {
        NpbActions {
            action: self.action.reverse_tap_side(),
            acl_gids: self.acl_gids.clone(),
        }
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64(self.action.bits());
        encoder.write_u16_slice(&self.acl_gids);
    }

    pub fn decode(stream: &mut ByteStream<'_>) -> Result<Self, DecodeError> {
        let action = NpbAction::from_bits(stream.u64()?);
        let acl_gids = read_u16_slice(stream)?;
        Ok(NpbActions { action, acl_gids })
    }
}

impl fmt::Display for NpbActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} gids: {:?}}}", self.action, self.acl_gids)
    }
}
