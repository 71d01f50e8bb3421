//! Policy data matched against decoded packets.
//!
//! A policy engine produces `PolicyData` values holding the bit-packed
//! [`AclAction`]s and [`NpbAction`]s of every matched ACL. This module
//! covers their deduplicating merges, direction reversal, TAP-side
//! validation and the object pool policies are recycled through.

mod acl_action;
mod gid_bitmap;
mod npb_action;

use std::borrow::Cow;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

pub use acl_action::{AclAction, ActionFlag, Direction, TagTemplate};
pub use gid_bitmap::{
    AclGidBitmap, GROUP_TYPE_ALL, GROUP_TYPE_DST, GROUP_TYPE_SRC, MAP_BITS_PER_ENTRY,
};
pub use npb_action::{
    NpbAction, NpbActions, RESOURCE_GROUP_TYPE_DEV, RESOURCE_GROUP_TYPE_IP,
    RESOURCE_GROUP_TYPE_MASK, TAPSIDE_ALL, TAPSIDE_DST, TAPSIDE_MASK, TAPSIDE_SRC,
};

use crate::DecodeError;
use crate::byte_stream::ByteStream;
use crate::codec::Encoder;
use crate::meta_packet::TunnelType;

/// Where on the network a packet was captured.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TapType {
    #[default]
    Any = 0,
    Isp = 1,
    Spine = 2,
    Tor = 3,
}

impl From<u32> for TapType {
    fn from(value: u32) -> Self {
        match value {
            1 => TapType::Isp,
            2 => TapType::Spine,
            3 => TapType::Tor,
            _ => TapType::Any,
        }
    }
}

/// The packet facts TAP-side validation looks at.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LookupKey {
    pub tap: TapType,
    pub l2_end_0: bool,
    pub l2_end_1: bool,
    pub l3_end_0: bool,
    pub l3_end_1: bool,
}

/// Returned instead of a null policy when validation leaves nothing
/// applicable; `valid()` is false.
pub static INVALID_POLICY_DATA: PolicyData = PolicyData {
    acl_actions: Vec::new(),
    npb_actions: Vec::new(),
    acl_id: 0,
    action_flags: ActionFlag::NONE,
};

/// Aggregated actions of every ACL a packet matched.
///
/// Invariants kept by the merge operations: no two `AclAction`s share
/// `(acl_gid, tag_templates)`; no two `NpbActions` share identical
/// bit-packing; `action_flags` is the OR of all member ACL action flags.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyData {
    pub acl_actions: Vec<AclAction>,
    pub npb_actions: Vec<NpbActions>,
    /// First matched ACL
    pub acl_id: u32,
    pub action_flags: ActionFlag,
}

impl PolicyData {
    pub fn valid(&self) -> bool {
        self.acl_id != 0
    }

    /// Merges ACL actions, combining entries that share GID and tag
    /// templates by OR-ing their directions and action flags. `direction`
    /// overrides every incoming action's direction when given.
    pub fn merge_acl_action(
        &mut self,
        actions: &[AclAction],
        acl_id: u32,
        direction: Option<Direction>,
    ) {
        if self.acl_id == 0 {
            self.acl_id = acl_id;
        }
        for &incoming in actions {
            let incoming = match direction {
                Some(d) => incoming.set_directions(d),
                None => incoming,
            };
            if let Some(existing) = self.acl_actions.iter_mut().find(|existing| {
                existing.acl_gid() == incoming.acl_gid()
                    && existing.tag_templates() == incoming.tag_templates()
            }) {
                *existing = existing
                    .add_directions(incoming.directions())
                    .add_action_flags(incoming.action_flags());
                self.action_flags |= incoming.action_flags();
                continue;
            }
            self.acl_actions.push(incoming);
            self.action_flags |= incoming.action_flags();
        }
    }

    /// Merges NPB actions. An exact bit-for-bit duplicate only unions the
    /// attributed GIDs; actions sharing `(tunnel_ip_id, tunnel_id,
    /// tunnel_type)` combine payload slice (0 means unlimited), resource
    /// group types and TAP sides; everything else is appended.
    pub fn merge_npb_action(
        &mut self,
        actions: &[NpbActions],
        acl_id: u32,
        direction: Option<Direction>,
    ) {
        if self.acl_id == 0 {
            self.acl_id = acl_id;
        }
        for incoming in actions {
            let mut merged = false;
            for existing in self.npb_actions.iter_mut() {
                if existing.action == incoming.action {
                    existing.add_acl_gid(incoming.acl_gids());
                    merged = true;
                    break;
                }
                if existing.action.tunnel_ip_id() != incoming.action.tunnel_ip_id()
                    || existing.action.tunnel_id() != incoming.action.tunnel_id()
                    || existing.action.tunnel_type() != incoming.action.tunnel_type()
                {
                    continue;
                }
                if incoming.action.payload_slice() == 0
                    || incoming.action.payload_slice() > existing.action.payload_slice()
                {
                    existing.action.set_payload_slice(incoming.action.payload_slice());
                }
                existing
                    .action
                    .add_resource_group_type(incoming.action.resource_group_type());
                match direction {
                    Some(d) => existing.action.set_tap_side(d.bits()),
                    None => existing.action.add_tap_side(incoming.action.tap_side()),
                }
                existing.add_acl_gid(incoming.acl_gids());
                merged = true;
                break;
            }
            if !merged {
                let mut action = incoming.clone();
                if let Some(d) = direction {
                    action.action.set_tap_side(d.bits());
                }
                self.npb_actions.push(action);
            }
        }
    }

    pub fn merge(
        &mut self,
        acl_actions: &[AclAction],
        npb_actions: &[NpbActions],
        acl_id: u32,
        direction: Option<Direction>,
    ) {
        self.merge_acl_action(acl_actions, acl_id, direction);
        self.merge_npb_action(npb_actions, acl_id, direction);
    }

    pub fn merge_acl_and_swap_direction(&mut self, actions: &[AclAction], acl_id: u32) {
        let reversed: Vec<AclAction> =
            actions.iter().map(|action| action.reverse_direction()).collect();
        self.merge_acl_action(&reversed, acl_id, None);
    }

    pub fn merge_npb_and_swap_direction(&mut self, actions: &[NpbActions], acl_id: u32) {
        let reversed: Vec<NpbActions> =
            actions.iter().map(NpbActions::reverse_tap_side).collect();
        self.merge_npb_action(&reversed, acl_id, None);
    }

    pub fn merge_and_swap_direction(
        &mut self,
        acl_actions: &[AclAction],
        npb_actions: &[NpbActions],
        acl_id: u32,
    ) {
        self.merge_acl_and_swap_direction(acl_actions, acl_id);
        self.merge_npb_and_swap_direction(npb_actions, acl_id);
    }

    /// Collapses both-sides NPB actions to the SRC side so a policy that
    /// matched in both directions mirrors each packet once. PCAP actions
    /// keep both sides.
    pub fn format_npb_action(&mut self) {
        for npb in self.npb_actions.iter_mut() {
            if npb.action.tap_side() == TAPSIDE_ALL
                && npb.action.tunnel_type() != TunnelType::Pcap
            {
                npb.action.set_tap_side(TAPSIDE_SRC);
            }
        }
    }

    /// Filters NPB actions against the packet's endpoint facts. Outside
    /// top-of-rack captures every action applies unchanged. At the TOR an
    /// action must have a TAP side whose L2 end is on that side; non-DEV
    /// resource groups additionally need the same side's L3 end.
    pub fn check_npb_action(&self, key: &LookupKey) -> Vec<NpbActions> {
        if self.npb_actions.is_empty() || key.tap != TapType::Tor {
            return self.npb_actions.clone();
        }
        self.npb_actions
            .iter()
            .filter(|npb| {
                let l2_hit = (npb.action.tap_side_matches(TAPSIDE_SRC) && key.l2_end_0)
                    || (npb.action.tap_side_matches(TAPSIDE_DST) && key.l2_end_1);
                if !l2_hit {
                    return false;
                }
                if npb.action.resource_group_type_matches(RESOURCE_GROUP_TYPE_DEV) {
                    return true;
                }
                (npb.action.tap_side_matches(TAPSIDE_SRC) && key.l3_end_0)
                    || (npb.action.tap_side_matches(TAPSIDE_DST) && key.l3_end_1)
            })
            .cloned()
            .collect()
    }

    /// Applies [`check_npb_action`](Self::check_npb_action) and wraps the
    /// outcome: the borrowed policy when nothing changes, the shared
    /// [`INVALID_POLICY_DATA`] sentinel when nothing applies and no other
    /// action flags are set, or a new policy holding the filtered set.
    pub fn check_npb_policy<'a>(&'a self, key: &LookupKey) -> Cow<'a, PolicyData> {
        if key.tap != TapType::Tor {
            return Cow::Borrowed(self);
        }
        if self.npb_actions.is_empty() {
            if self.action_flags == ActionFlag::NONE {
                return Cow::Borrowed(&INVALID_POLICY_DATA);
            }
            return Cow::Borrowed(self);
        }
        let valid_actions = self.check_npb_action(key);
        if valid_actions.is_empty() && self.action_flags == ActionFlag::NONE {
            return Cow::Borrowed(&INVALID_POLICY_DATA);
        }
        Cow::Owned(PolicyData {
            acl_actions: Vec::new(),
            npb_actions: valid_actions,
            acl_id: self.acl_id,
            action_flags: self.action_flags,
        })
    }

    /// A pooled replica with every ACL action direction reversed.
    pub fn reverse_data(&self) -> PolicyData {
        let mut reversed = clone_policy_data(self);
        for action in reversed.acl_actions.iter_mut() {
            *action = action.reverse_direction();
        }
        reversed
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32(self.acl_actions.len() as u32);
        for action in &self.acl_actions {
            action.encode(encoder);
        }
        encoder.write_u32(self.npb_actions.len() as u32);
        for action in &self.npb_actions {
            action.encode(encoder);
        }
        encoder.write_u32(self.acl_id);
        encoder.write_u16(self.action_flags.bits());
    }

    pub fn decode(stream: &mut ByteStream<'_>) -> Result<Self, DecodeError> {
        let mut data = PolicyData::default();
        for _ in 0..stream.u32()? {
            data.acl_actions.push(AclAction::decode(stream)?);
        }
        for _ in 0..stream.u32()? {
            data.npb_actions.push(NpbActions::decode(stream)?);
        }
        data.acl_id = stream.u32()?;
        data.action_flags = ActionFlag::from(stream.u16()?);
        Ok(data)
    }
}

impl fmt::Display for PolicyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{acl id: {} flags: {} acl actions: [", self.acl_id, self.action_flags)?;
        for action in &self.acl_actions {
            write!(f, "{} ", action)?;
        }
        write!(f, "] npb actions: [")?;
        for action in &self.npb_actions {
            write!(f, "{} ", action)?;
        }
        write!(f, "]}}")
    }
}

const POLICY_DATA_POOL_CAP: usize = 4096;

static POLICY_DATA_POOL: Mutex<Vec<PolicyData>> = Mutex::new(Vec::new());

/// Takes a zeroed `PolicyData` from the pool; its action vectors keep the
/// capacity they had before release.
pub fn acquire_policy_data() -> PolicyData {
    POLICY_DATA_POOL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop()
        .unwrap_or_default()
}

/// Returns a `PolicyData` to the pool, truncating both action vectors but
/// keeping their backing storage.
pub fn release_policy_data(mut data: PolicyData) {
    data.acl_actions.clear();
    data.npb_actions.clear();
    data.acl_id = 0;
    data.action_flags = ActionFlag::NONE;
    let mut pool = POLICY_DATA_POOL
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if pool.len() < POLICY_DATA_POOL_CAP {
        pool.push(data);
    }
}

/// Deep-copies `data` into a pooled object.
pub fn clone_policy_data(data: &PolicyData) -> PolicyData {
    let mut duplicate = acquire_policy_data();
    duplicate.acl_actions.extend_from_slice(&data.acl_actions);
    duplicate.npb_actions.extend_from_slice(&data.npb_actions);
    duplicate.acl_id = data.acl_id;
    duplicate.action_flags = data.action_flags;
    duplicate
}
