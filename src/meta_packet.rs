//! Decoded per-packet metadata records.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::Serialize;

use crate::protocol::{EthType, IpProtocol};

pub const MAC_ADDR_LEN: usize = 6;

/// A 48-bit MAC address held in the low bits of a `u64`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MacAddr(u64);

impl MacAddr {
    /// Builds an address from the first six bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let value = bytes
            .iter()
            .take(MAC_ADDR_LEN)
            .fold(0u64, |acc, &b| acc << 8 | u64::from(b));
        MacAddr(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for MacAddr {
    fn from(value: u64) -> Self {
        MacAddr(value & 0xffff_ffff_ffff)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            (self.0 >> 40) as u8,
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8
        )
    }
}

/// Layout tag steering the per-packet decode.
///
/// Sticky per direction: when the compression flag for the header type is
/// set, the previous packet's tag in the same direction applies.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HeaderType {
    #[default]
    Invalid = 0,
    Eth = 1,
    Arp = 2,
    Ipv4 = 3,
    Ipv4Icmp = 4,
    Ipv4Udp = 5,
    Ipv4Tcp = 6,
    Ipv6 = 7,
    Ipv6Udp = 8,
    Ipv6Tcp = 9,
}

impl HeaderType {
    pub fn is_ipv6(self) -> bool {
        matches!(self, HeaderType::Ipv6 | HeaderType::Ipv6Udp | HeaderType::Ipv6Tcp)
    }
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value {
            1 => HeaderType::Eth,
            2 => HeaderType::Arp,
            3 => HeaderType::Ipv4,
            4 => HeaderType::Ipv4Icmp,
            5 => HeaderType::Ipv4Udp,
            6 => HeaderType::Ipv4Tcp,
            7 => HeaderType::Ipv6,
            8 => HeaderType::Ipv6Udp,
            9 => HeaderType::Ipv6Tcp,
            _ => HeaderType::Invalid,
        }
    }
}

/// The 16-bit per-record flag word.
///
/// `CFLAG_*` bits mark fields omitted from the wire and replayed from the
/// per-direction cache; `PFLAG_*` bits carry endpoint-ness, direction and
/// tunnel presence. The bit assignment is a wire contract shared with the
/// capture agents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacketFlag(u16);

impl PacketFlag {
    pub const CFLAG_MAC0: PacketFlag = PacketFlag(1 << 0);
    pub const CFLAG_MAC1: PacketFlag = PacketFlag(1 << 1);
    pub const CFLAG_VLANTAG: PacketFlag = PacketFlag(1 << 2);
    pub const CFLAG_HEADER_TYPE: PacketFlag = PacketFlag(1 << 3);
    pub const CFLAG_DATAOFF_IHL: PacketFlag = PacketFlag(1 << 4);
    pub const CFLAG_FLAGS_FRAG_OFFSET: PacketFlag = PacketFlag(1 << 5);
    pub const CFLAG_TTL: PacketFlag = PacketFlag(1 << 6);
    pub const CFLAG_IP0: PacketFlag = PacketFlag(1 << 7);
    pub const CFLAG_IP1: PacketFlag = PacketFlag(1 << 8);
    pub const CFLAG_PORT0: PacketFlag = PacketFlag(1 << 9);
    pub const CFLAG_PORT1: PacketFlag = PacketFlag(1 << 10);
    /// Every compression flag at once.
    pub const CFLAG_FULL: PacketFlag = PacketFlag(0x07ff);

    pub const PFLAG_DST_ENDPOINT: PacketFlag = PacketFlag(1 << 11);
    pub const PFLAG_SRC_ENDPOINT: PacketFlag = PacketFlag(1 << 12);
    pub const PFLAG_SRC_L3ENDPOINT: PacketFlag = PacketFlag(1 << 13);
    pub const PFLAG_DST_L3ENDPOINT: PacketFlag = PacketFlag(1 << 14);
    pub const PFLAG_TUNNEL: PacketFlag = PacketFlag(1 << 15);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_set(self, flag: PacketFlag) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl From<u16> for PacketFlag {
    fn from(value: u16) -> Self {
        PacketFlag(value)
    }
}

impl std::ops::BitOr for PacketFlag {
    type Output = PacketFlag;

    fn bitor(self, rhs: PacketFlag) -> PacketFlag {
        PacketFlag(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PacketFlag {
    fn bitor_assign(&mut self, rhs: PacketFlag) {
        self.0 |= rhs.0;
    }
}

/// Encapsulation kind of a tunnel descriptor or an NPB mirror action.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelType {
    #[default]
    Vxlan = 0,
    GreErspan = 1,
    Pcap = 2,
    Unknown = 3,
}

impl From<u8> for TunnelType {
    fn from(value: u8) -> Self {
        match value {
            0 => TunnelType::Vxlan,
            1 => TunnelType::GreErspan,
            2 => TunnelType::Pcap,
            _ => TunnelType::Unknown,
        }
    }
}

/// Outer-tunnel descriptor attached to a packet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub tunnel_type: TunnelType,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// 24-bit tunnel id (VNI / ERSPAN session)
    pub id: u32,
}

impl fmt::Display for TunnelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} -> {} id {}",
            self.tunnel_type, self.src, self.dst, self.id
        )
    }
}

/// TCP header fields and the option subset the agents export.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TcpData {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub win_size: u16,
    /// Data offset in 32-bit words, taken from the IP-layer combined byte
    pub data_offset: u8,
    pub win_scale: Option<u8>,
    pub mss: Option<u16>,
    pub sack_permitted: bool,
    pub sack: Vec<u8>,
}

/// One decoded packet-metadata record.
///
/// Direction-dependent fields (`mac_src`, `ip_src`, `port_src`, ...) are
/// already oriented: for a reverse-direction record the cached endpoint 0/1
/// values land swapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaPacket {
    /// Microsecond timestamp: frame base plus accumulated per-record deltas
    pub timestamp: Duration,
    pub packet_len: u16,
    pub vlan: u16,
    pub l2_end_0: bool,
    pub l2_end_1: bool,
    pub l3_end_0: bool,
    pub l3_end_1: bool,
    pub mac_src: MacAddr,
    pub mac_dst: MacAddr,
    pub eth_type: EthType,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub ip6_src: Ipv6Addr,
    pub ip6_dst: Ipv6Addr,
    pub protocol: IpProtocol,
    /// IPv6 only
    pub next_header: IpProtocol,
    /// IPv6 extension-header bytes, when present
    pub options: Vec<u8>,
    pub ttl: u8,
    pub ihl: u8,
    /// IPv4 only; always on the wire
    pub ip_id: u16,
    /// IPv4: 3-bit flags plus 13-bit fragment offset; IPv6: raw 16 bits
    pub ip_flags: u16,
    pub port_src: u16,
    pub port_dst: u16,
    pub payload_len: u16,
    /// Verbatim header bytes for ARP and ICMP records
    pub raw_header: Vec<u8>,
    pub tcp_data: Option<TcpData>,
    pub tunnel: Option<TunnelInfo>,
}

impl Default for MetaPacket {
    fn default() -> Self {
        Self {
            timestamp: Duration::ZERO,
            packet_len: 0,
            vlan: 0,
            l2_end_0: false,
            l2_end_1: false,
            l3_end_0: false,
            l3_end_1: false,
            mac_src: MacAddr::default(),
            mac_dst: MacAddr::default(),
            eth_type: EthType::default(),
            ip_src: Ipv4Addr::UNSPECIFIED,
            ip_dst: Ipv4Addr::UNSPECIFIED,
            ip6_src: Ipv6Addr::UNSPECIFIED,
            ip6_dst: Ipv6Addr::UNSPECIFIED,
            protocol: IpProtocol::default(),
            next_header: IpProtocol::default(),
            options: Vec::new(),
            ttl: 0,
            ihl: 0,
            ip_id: 0,
            ip_flags: 0,
            port_src: 0,
            port_dst: 0,
            payload_len: 0,
            raw_header: Vec::new(),
            tcp_data: None,
            tunnel: None,
        }
    }
}

impl MetaPacket {
    /// Clears the record for reuse, keeping blob capacity.
    pub fn reset(&mut self) {
        let mut options = std::mem::take(&mut self.options);
        let mut raw_header = std::mem::take(&mut self.raw_header);
        options.clear();
        raw_header.clear();
        *self = MetaPacket {
            options,
            raw_header,
            ..MetaPacket::default()
        };
    }
}
