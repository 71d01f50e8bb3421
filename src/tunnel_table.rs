//! Process-wide tunnel-IP lookup table.
//!
//! NPB actions reference their mirror destination by a 16-bit tunnel GID;
//! this table resolves the GID to the destination IP and its numeric id.
//! A single config thread applies batched updates; decoder threads read
//! lock-free from the current snapshot. A reader racing an update may see
//! the previous snapshot, and entries superseded by an update linger until
//! overwritten.

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use log::debug;

/// One slot per possible ACL GID.
pub const TUNNEL_TABLE_SIZE: usize = 1 << 16;

#[derive(Debug, Default, Clone, Copy)]
struct TunnelEntry {
    ip: Option<IpAddr>,
    ip_id: u16,
}

/// GID-indexed map of mirror-tunnel destinations.
pub struct TunnelIpTable {
    entries: ArcSwap<Vec<TunnelEntry>>,
}

impl TunnelIpTable {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(vec![TunnelEntry::default(); TUNNEL_TABLE_SIZE]),
        }
    }

    /// Applies an element-wise batch of `(gid, ip_id, ip)` triples,
    /// last writer wins. Extra elements beyond the shortest slice are
    /// ignored.
    pub fn update_batch(&self, acl_gids: &[u16], ip_ids: &[u16], ips: &[IpAddr]) {
        let mut next = self.entries.load_full().as_ref().clone();
        let mut written = 0usize;
        for ((&gid, &ip_id), &ip) in acl_gids.iter().zip(ip_ids).zip(ips) {
            next[usize::from(gid)] = TunnelEntry {
                ip: Some(ip),
                ip_id,
            };
            written += 1;
        }
        self.entries.store(Arc::new(next));
        debug!("tunnel table updated with {} entries", written);
    }

    /// The tunnel IP registered for `acl_gid`, if any.
    pub fn ip(&self, acl_gid: u16) -> Option<IpAddr> {
        self.entries.load()[usize::from(acl_gid)].ip
    }

    /// The tunnel IP id registered for `acl_gid`; 0 when unset.
    pub fn ip_id(&self, acl_gid: u16) -> u16 {
        self.entries.load()[usize::from(acl_gid)].ip_id
    }
}

static TUNNEL_IP_TABLE: LazyLock<TunnelIpTable> = LazyLock::new(TunnelIpTable::new);

/// The process-wide table consulted by `NpbAction` lookups.
pub fn tunnel_ip_table() -> &'static TunnelIpTable {
    &TUNNEL_IP_TABLE
}

pub fn update_tunnel_maps(acl_gids: &[u16], ip_ids: &[u16], ips: &[IpAddr]) {
    TUNNEL_IP_TABLE.update_batch(acl_gids, ip_ids, ips);
}

pub fn tunnel_ip(acl_gid: u16) -> Option<IpAddr> {
    TUNNEL_IP_TABLE.ip(acl_gid)
}

pub fn tunnel_ip_id(acl_gid: u16) -> u16 {
    TUNNEL_IP_TABLE.ip_id(acl_gid)
}
