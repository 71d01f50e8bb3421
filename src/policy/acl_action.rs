//! Bit-packed ACL match actions.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::Serialize;

use crate::DecodeError;
use crate::byte_stream::ByteStream;
use crate::codec::Encoder;

/// What a matched ACL asks the pipeline to do, one bit per behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionFlag(u16);

impl ActionFlag {
    pub const NONE: ActionFlag = ActionFlag(0);
    pub const PACKET_COUNTING: ActionFlag = ActionFlag(1 << 0);
    pub const FLOW_COUNTING: ActionFlag = ActionFlag(1 << 1);
    pub const FLOW_STORING: ActionFlag = ActionFlag(1 << 2);
    pub const TCP_FLOW_PERF_COUNTING: ActionFlag = ActionFlag(1 << 3);
    pub const PACKET_CAPTURING: ActionFlag = ActionFlag(1 << 4);
    pub const FLOW_MISC_COUNTING: ActionFlag = ActionFlag(1 << 5);
    pub const PACKET_BROKERING: ActionFlag = ActionFlag(1 << 6);
    pub const GEO_POSITIONING: ActionFlag = ActionFlag(1 << 10);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ActionFlag) -> bool {
        self.0 & other.0 == other.0
    }
}

impl From<u16> for ActionFlag {
    fn from(value: u16) -> Self {
        ActionFlag(value)
    }
}

impl BitOr for ActionFlag {
    type Output = ActionFlag;

    fn bitor(self, rhs: ActionFlag) -> ActionFlag {
        ActionFlag(self.0 | rhs.0)
    }
}

impl BitOrAssign for ActionFlag {
    fn bitor_assign(&mut self, rhs: ActionFlag) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ActionFlag {
    type Output = ActionFlag;

    fn bitand(self, rhs: ActionFlag) -> ActionFlag {
        ActionFlag(self.0 & rhs.0)
    }
}

impl fmt::Display for ActionFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (ActionFlag::PACKET_COUNTING, "PC"),
            (ActionFlag::FLOW_COUNTING, "FC"),
            (ActionFlag::FLOW_STORING, "FS"),
            (ActionFlag::TCP_FLOW_PERF_COUNTING, "TFPC"),
            (ActionFlag::PACKET_CAPTURING, "PC2"),
            (ActionFlag::FLOW_MISC_COUNTING, "FMC"),
            (ActionFlag::PACKET_BROKERING, "PB"),
            (ActionFlag::GEO_POSITIONING, "GP"),
        ];
        write!(f, "|")?;
        for (flag, name) in names {
            if self.contains(flag) {
                write!(f, "{}|", name)?;
            }
        }
        Ok(())
    }
}

/// Match direction, stored as a 2-bit mask so both directions can be set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Direction(u8);

impl Direction {
    pub const NONE: Direction = Direction(0);
    pub const FORWARD: Direction = Direction(1);
    pub const BACKWARD: Direction = Direction(2);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn reversed(self) -> Direction {
        match self {
            Direction::FORWARD => Direction::BACKWARD,
            Direction::BACKWARD => Direction::FORWARD,
            other => other,
        }
    }
}

impl From<u8> for Direction {
    fn from(value: u8) -> Self {
        Direction(value & 0x3)
    }
}

impl BitOr for Direction {
    type Output = Direction;

    fn bitor(self, rhs: Direction) -> Direction {
        Direction(self.0 | rhs.0)
    }
}

/// Aggregation templates a matched ACL tags its flows with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagTemplate(u16);

impl TagTemplate {
    pub const NONE: TagTemplate = TagTemplate(0);
    pub const NODE: TagTemplate = TagTemplate(1 << 0);
    pub const NODE_PORT: TagTemplate = TagTemplate(1 << 1);
    pub const EDGE: TagTemplate = TagTemplate(1 << 2);
    pub const EDGE_PORT: TagTemplate = TagTemplate(1 << 3);
    pub const PORT: TagTemplate = TagTemplate(1 << 4);
    pub const ACL_NODE: TagTemplate = TagTemplate(1 << 5);
    pub const ACL_NODE_PORT: TagTemplate = TagTemplate(1 << 6);
    pub const ACL_EDGE: TagTemplate = TagTemplate(1 << 7);
    pub const ACL_EDGE_PORT: TagTemplate = TagTemplate(1 << 8);
    pub const ACL_PORT: TagTemplate = TagTemplate(1 << 9);
    pub const ACL_EDGE_PORT_ALL: TagTemplate = TagTemplate(1 << 10);
    pub const EDGE_PORT_ALL: TagTemplate = TagTemplate(1 << 11);

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl From<u16> for TagTemplate {
    fn from(value: u16) -> Self {
        TagTemplate(value & 0xfff)
    }
}

impl BitOr for TagTemplate {
    type Output = TagTemplate;

    fn bitor(self, rhs: TagTemplate) -> TagTemplate {
        TagTemplate(self.0 | rhs.0)
    }
}

impl fmt::Display for TagTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TagTemplate::NODE, "N"),
            (TagTemplate::NODE_PORT, "NP"),
            (TagTemplate::EDGE, "E"),
            (TagTemplate::EDGE_PORT, "EP"),
            (TagTemplate::PORT, "P"),
            (TagTemplate::ACL_NODE, "AN"),
            (TagTemplate::ACL_NODE_PORT, "ANP"),
            (TagTemplate::ACL_EDGE, "AE"),
            (TagTemplate::ACL_EDGE_PORT, "AEP"),
            (TagTemplate::ACL_PORT, "AP"),
            (TagTemplate::ACL_EDGE_PORT_ALL, "AEP+"),
            (TagTemplate::EDGE_PORT_ALL, "EP+"),
        ];
        write!(f, "|")?;
        for (template, name) in names {
            if self.0 & template.0 != 0 {
                write!(f, "{}|", name)?;
            }
        }
        Ok(())
    }
}

/// Bit-packed ACL action.
///
/// Layout (MSB to LSB): 16b ACL GID | 16b action flags | 14b GID-bitmap
/// offset | 4b GID-bitmap count | 2b directions | 12b tag templates.
/// The layout is a wire contract; setters clear-then-set, adders OR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AclAction(u64);

impl AclAction {
    pub fn from_bits(bits: u64) -> Self {
        AclAction(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn set_acl_gid(self, acl_gid: u16) -> Self {
        AclAction(self.0 & !(0xffff << 48) | u64::from(acl_gid) << 48)
    }

    pub fn acl_gid(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn set_action_flags(self, flags: ActionFlag) -> Self {
        AclAction(self.0 & !(0xffff << 32) | u64::from(flags.bits()) << 32)
    }

    pub fn add_action_flags(self, flags: ActionFlag) -> Self {
        AclAction(self.0 | u64::from(flags.bits()) << 32)
    }

    pub fn action_flags(self) -> ActionFlag {
        ActionFlag::from((self.0 >> 32) as u16)
    }

    pub fn set_acl_gid_bitmap_offset(self, offset: u16) -> Self {
        AclAction(self.0 & !(0x3fff << 18) | u64::from(offset & 0x3fff) << 18)
    }

    pub fn acl_gid_bitmap_offset(self) -> u16 {
        (self.0 >> 18) as u16 & 0x3fff
    }

    pub fn set_acl_gid_bitmap_count(self, count: u8) -> Self {
        AclAction(self.0 & !(0xf << 14) | u64::from(count & 0xf) << 14)
    }

    pub fn acl_gid_bitmap_count(self) -> u8 {
        (self.0 >> 14) as u8 & 0xf
    }

    pub fn set_directions(self, directions: Direction) -> Self {
        AclAction(self.0 & !(0x3 << 12) | u64::from(directions.bits() & 0x3) << 12)
    }

    pub fn add_directions(self, directions: Direction) -> Self {
        AclAction(self.0 | u64::from(directions.bits() & 0x3) << 12)
    }

    pub fn directions(self) -> Direction {
        Direction::from((self.0 >> 12) as u8 & 0x3)
    }

    /// FORWARD and BACKWARD swap; NONE and both-set stay as they are.
    pub fn reverse_direction(self) -> Self {
        match self.directions() {
            Direction::FORWARD => self.set_directions(Direction::BACKWARD),
            Direction::BACKWARD => self.set_directions(Direction::FORWARD),
            _ => self,
        }
    }

    pub fn set_tag_templates(self, templates: TagTemplate) -> Self {
        AclAction(self.0 & !0xfff | u64::from(templates.bits() & 0xfff))
    }

    pub fn add_tag_templates(self, templates: TagTemplate) -> Self {
        AclAction(self.0 | u64::from(templates.bits() & 0xfff))
    }

    pub fn tag_templates(self) -> TagTemplate {
        TagTemplate::from(self.0 as u16 & 0xfff)
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64(self.0);
    }

    pub fn decode(stream: &mut ByteStream<'_>) -> Result<Self, DecodeError> {
        Ok(AclAction(stream.u64()?))
    }
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{gid: {} flags: {} directions: {} templates: {} map offset: {} map count: {}}}",
            self.acl_gid(),
            self.action_flags(),
            self.directions().bits(),
            self.tag_templates(),
            self.acl_gid_bitmap_offset(),
            self.acl_gid_bitmap_count()
        )
    }
}
