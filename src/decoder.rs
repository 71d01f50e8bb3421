//! Sequential decoder for compressed packet-metadata frames.
//!
//! A frame is a fixed 26-byte header followed by per-packet records packed
//! back-to-back. Records are delta-coded: each carries a flag word whose
//! compression bits mark header fields that were unchanged since the
//! previous packet in the same direction and are therefore absent from the
//! wire. The decoder keeps one cache of sticky fields per direction and
//! replays cached values for every compressed field.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use log::warn;
use nom_derive::{Nom, Parse};

use crate::DecodeError;
use crate::byte_stream::ByteStream;
use crate::meta_packet::{
    HeaderType, MAC_ADDR_LEN, MacAddr, MetaPacket, PacketFlag, TcpData, TunnelInfo, TunnelType,
};
use crate::policy::TapType;
use crate::protocol::{EthType, IpProtocol};

/// Fixed frame-header size, including the leading size field itself.
/// The layout is size(2) + reserved(1) + version(1) + vtap(2) + seq(8) +
/// index-and-timestamp(8) + in-port(4).
pub const COMPRESS_HEADER_SIZE: u16 = 26;
const VERSION: u8 = 5;
/// Dispatcher queues per agent; the header index must stay below this.
const MAX_DISPATCHER_COUNT: u8 = 16;

const IPV6_ADDR_LEN: usize = 16;
const ARP_HEADER_SIZE: usize = 28;
const ICMP_ID_SEQ: usize = 4;
const ICMP_REST: usize = 28;

const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
const ICMP_TYPE_SOURCE_QUENCH: u8 = 4;
const ICMP_TYPE_REDIRECT: u8 = 5;
const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;
const ICMP_TYPE_PARAMETER_PROBLEM: u8 = 12;

// Frames relayed by an agent running on the analyzer itself carry a marker
// in the upper bytes of in_port.
const ANALYZER_AGENT: u32 = 0xffff_ff00;
const ANALYZER_AGENT_MASK: u32 = 0xff;
const AGENT_MASK: u32 = 0xffff;
pub const PACKET_SOURCE_ISP: u32 = 0x1_0000;
pub const PACKET_SOURCE_TOR: u32 = 0x3_0000;

/// TCP option presence bits; the low nibble is the SACK byte count.
pub const TCP_OPT_FLAG_WIN_SCALE: u8 = 0x80;
pub const TCP_OPT_FLAG_MSS: u8 = 0x40;
pub const TCP_OPT_FLAG_SACK_PERMIT: u8 = 0x20;
pub const TCP_OPT_FLAG_SACK: u8 = 0x0f;

/// Sticky header fields for one direction, replayed when compressed away.
#[derive(Debug, Default, Clone)]
struct Decoded {
    header_type: HeaderType,

    // l2
    mac0: MacAddr,
    mac1: MacAddr,
    vlan: u16,

    // l3
    ip0: u32,
    ip1: u32,
    ihl: u8,
    ttl: u8,
    flags: u8,
    ip_id: u16,
    frag_offset: u16,

    // l3 ipv6
    ip6_src: [u8; IPV6_ADDR_LEN],
    ip6_dst: [u8; IPV6_ADDR_LEN],

    // l4
    port0: u16,
    port1: u16,
    data_offset: u8,
}

#[derive(Nom)]
struct FrameHeader {
    frame_size: u16,
    #[allow(dead_code)]
    reserved: u8,
    version: u8,
    vtap_id: u16,
    seq: u64,
    index_and_timestamp: u64,
    in_port: u32,
}

/// Frame-level facts returned by [`SequentialDecoder::decode_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Total frame size in bytes, including the fixed header
    pub frame_size: u16,
    pub vtap_id: u16,
}

/// Stateful decoder over one buffer.
///
/// Single-threaded per instance: the two direction caches carry state
/// across packets within a frame. Concurrent callers use distinct
/// instances.
pub struct SequentialDecoder<'a> {
    stream: ByteStream<'a>,
    timestamp: Duration,
    seq: u64,
    pflags: PacketFlag,
    forward: bool,
    rx: Decoded,
    tx: Decoded,

    in_port: u32,
    frame_size: u16,
    dispatcher_index: u8,
}

impl<'a> SequentialDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            stream: ByteStream::new(data),
            timestamp: Duration::ZERO,
            seq: 0,
            pflags: PacketFlag::default(),
            forward: true,
            rx: Decoded::default(),
            tx: Decoded::default(),
            in_port: 0,
            frame_size: 0,
            dispatcher_index: 0,
        }
    }

    /// Rewinds the decoder onto a new buffer, dropping all frame state.
    pub fn reset(&mut self, data: &'a [u8]) {
        *self = SequentialDecoder::new(data);
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn in_port(&self) -> u32 {
        self.in_port
    }

    pub fn dispatcher_index(&self) -> u8 {
        self.dispatcher_index
    }

    fn debit(&mut self, len: usize) -> Result<(), DecodeError> {
        let remaining = usize::from(self.frame_size);
        if len > remaining {
            return Err(DecodeError::FrameOverrun {
                needed: len,
                remaining,
            });
        }
        self.frame_size -= len as u16;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.debit(1)?;
        self.stream.u8()
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.debit(2)?;
        self.stream.u16()
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.debit(4)?;
        self.stream.u32()
    }

    fn field(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.debit(len)?;
        self.stream.field(len)
    }

    fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.debit(len)?;
        self.stream.skip(len)
    }

    fn cache(&self) -> &Decoded {
        if self.forward { &self.tx } else { &self.rx }
    }

    fn cache_mut(&mut self) -> &mut Decoded {
        if self.forward { &mut self.tx } else { &mut self.rx }
    }

    /// Parses and validates the fixed frame header.
    ///
    /// On success the per-direction caches are re-initialized: each frame
    /// is a fresh decoding session. On error the frame is unusable and the
    /// caller drops it whole.
    pub fn decode_header(&mut self) -> Result<FrameInfo, DecodeError> {
        let (_, header) =
            FrameHeader::parse(self.stream.slice()).map_err(|_| DecodeError::Truncated {
                needed: usize::from(COMPRESS_HEADER_SIZE),
                available: self.stream.remaining(),
            })?;
        if header.frame_size <= COMPRESS_HEADER_SIZE {
            warn!("rejecting frame with size {}", header.frame_size);
            return Err(DecodeError::FrameTooShort {
                frame_size: header.frame_size,
            });
        }
        if header.version != VERSION {
            warn!("rejecting frame with version {}", header.version);
            return Err(DecodeError::VersionMismatch {
                version: header.version,
            });
        }
        let index = (header.index_and_timestamp >> 56) as u8;
        if index >= MAX_DISPATCHER_COUNT {
            warn!("rejecting frame with dispatcher index {}", index);
            return Err(DecodeError::InvalidDispatcherIndex { index });
        }

        self.stream.skip(usize::from(COMPRESS_HEADER_SIZE))?;
        self.frame_size = header.frame_size - COMPRESS_HEADER_SIZE;
        self.seq = header.seq;
        self.timestamp =
            Duration::from_micros(header.index_and_timestamp & 0x00ff_ffff_ffff_ffff);
        self.dispatcher_index = index;
        self.in_port = rewrite_in_port(header.in_port);
        self.tx = Decoded::default();
        self.rx = Decoded::default();
        Ok(FrameInfo {
            frame_size: header.frame_size,
            vtap_id: header.vtap_id,
        })
    }

    /// Decodes the next record of the frame into `meta`.
    ///
    /// Returns `Ok(true)` once the frame is exhausted. Any error discards
    /// the rest of the frame.
    pub fn next_packet(&mut self, meta: &mut MetaPacket) -> Result<bool, DecodeError> {
        if self.frame_size == 0 {
            return Ok(true);
        }
        meta.reset();

        let delta = self.u16()?;
        let total_size = self.u16()?;
        self.pflags = PacketFlag::from(self.u16()?);
        self.forward = !self.pflags.is_set(PacketFlag::PFLAG_DST_ENDPOINT);
        if !self.pflags.is_set(PacketFlag::CFLAG_HEADER_TYPE) {
            let header_type = HeaderType::from(self.u8()?);
            self.cache_mut().header_type = header_type;
        }
        self.timestamp += Duration::from_micros(u64::from(delta));
        if self.pflags.is_set(PacketFlag::PFLAG_TUNNEL) {
            meta.tunnel = Some(self.decode_tunnel()?);
        }
        meta.packet_len = total_size;
        meta.timestamp = self.timestamp;
        self.decode_ethernet(meta)?;
        Ok(false)
    }

    /// Iterates the remaining records, allocating one `MetaPacket` each.
    ///
    /// The iterator fuses after the first error; a frame that errors
    /// produces no further packets.
    pub fn packets<'d>(&'d mut self) -> MetaPacketIterator<'a, 'd> {
        MetaPacketIterator {
            decoder: self,
            errored: false,
        }
    }

    fn decode_tunnel(&mut self) -> Result<TunnelInfo, DecodeError> {
        let src = Ipv4Addr::from(self.u32()?);
        let dst = Ipv4Addr::from(self.u32()?);
        let tunnel_type = TunnelType::from(self.u8()?);
        let id = u32::from(self.u8()?) << 16 | u32::from(self.u16()?);
        Ok(TunnelInfo {
            tunnel_type,
            src,
            dst,
            id,
        })
    }

    fn decode_arp(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        meta.raw_header.resize(ARP_HEADER_SIZE, 0);
        let available = self.stream.slice().len().min(ARP_HEADER_SIZE);
        meta.raw_header[..available].copy_from_slice(&self.stream.slice()[..available]);

        self.skip(8 + MAC_ADDR_LEN)?;
        meta.ip_src = Ipv4Addr::from(self.u32()?);
        self.skip(MAC_ADDR_LEN)?;
        meta.ip_dst = Ipv4Addr::from(self.u32()?);
        Ok(())
    }

    fn decode_ethernet(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        if !self.pflags.is_set(PacketFlag::CFLAG_MAC0) {
            let mac = MacAddr::from_bytes(self.field(MAC_ADDR_LEN)?);
            self.cache_mut().mac0 = mac;
        }
        if !self.pflags.is_set(PacketFlag::CFLAG_MAC1) {
            let mac = MacAddr::from_bytes(self.field(MAC_ADDR_LEN)?);
            self.cache_mut().mac1 = mac;
        }
        if !self.pflags.is_set(PacketFlag::CFLAG_VLANTAG) {
            let vlan = self.u16()? & 0xfff;
            self.cache_mut().vlan = vlan;
        }

        meta.l2_end_0 = self.pflags.is_set(PacketFlag::PFLAG_SRC_ENDPOINT);
        meta.l2_end_1 = self.pflags.is_set(PacketFlag::PFLAG_DST_ENDPOINT);
        meta.l3_end_0 = self.pflags.is_set(PacketFlag::PFLAG_SRC_L3ENDPOINT);
        meta.l3_end_1 = self.pflags.is_set(PacketFlag::PFLAG_DST_L3ENDPOINT);

        let cache = self.cache();
        meta.vlan = cache.vlan;
        if self.forward {
            meta.mac_src = cache.mac0;
            meta.mac_dst = cache.mac1;
        } else {
            meta.mac_src = cache.mac1;
            meta.mac_dst = cache.mac0;
        }
        let header_type = cache.header_type;

        if header_type == HeaderType::Arp {
            meta.eth_type = EthType::Arp;
            self.decode_arp(meta)
        } else if header_type < HeaderType::Ipv4 {
            meta.eth_type = EthType::from(self.u16()?);
            Ok(())
        } else if header_type.is_ipv6() {
            meta.eth_type = EthType::Ipv6;
            self.decode_ipv6(meta)
        } else {
            meta.eth_type = EthType::Ipv4;
            self.decode_ipv4(meta)
        }
    }

    fn decode_ipv4(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        if !self.pflags.is_set(PacketFlag::CFLAG_DATAOFF_IHL) {
            let b = self.u8()?;
            let cache = self.cache_mut();
            cache.ihl = b & 0xf;
            cache.data_offset = b >> 4; // meaningful for TCP only
        }
        meta.ihl = self.cache().ihl;

        let ip_id = self.u16()?;
        self.cache_mut().ip_id = ip_id;
        meta.ip_id = ip_id;

        if !self.pflags.is_set(PacketFlag::CFLAG_FLAGS_FRAG_OFFSET) {
            let value = self.u16()?;
            let cache = self.cache_mut();
            cache.flags = (value >> 13) as u8;
            cache.frag_offset = value & 0x1fff;
        }
        {
            let cache = self.cache();
            meta.ip_flags = u16::from(cache.flags & 0x7) << 13 | cache.frag_offset;
        }

        if !self.pflags.is_set(PacketFlag::CFLAG_TTL) {
            let ttl = self.u8()?;
            self.cache_mut().ttl = ttl;
        }
        meta.ttl = self.cache().ttl;

        if !self.pflags.is_set(PacketFlag::CFLAG_IP0) {
            let ip = self.u32()?;
            self.cache_mut().ip0 = ip;
        }
        if !self.pflags.is_set(PacketFlag::CFLAG_IP1) {
            let ip = self.u32()?;
            self.cache_mut().ip1 = ip;
        }
        let cache = self.cache();
        if self.forward {
            meta.ip_src = Ipv4Addr::from(cache.ip0);
            meta.ip_dst = Ipv4Addr::from(cache.ip1);
        } else {
            meta.ip_src = Ipv4Addr::from(cache.ip1);
            meta.ip_dst = Ipv4Addr::from(cache.ip0);
        }

        match cache.header_type {
            HeaderType::Ipv4Icmp => {
                meta.protocol = IpProtocol::Icmpv4;
                self.decode_icmp(meta)
            }
            HeaderType::Ipv4 => {
                meta.protocol = IpProtocol::from(self.u8()?);
                Ok(())
            }
            _ => self.decode_l4(meta),
        }
    }

    fn decode_ipv6(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        if !self.pflags.is_set(PacketFlag::CFLAG_DATAOFF_IHL) {
            let b = self.u8()?;
            let cache = self.cache_mut();
            cache.data_offset = b >> 4; // meaningful for TCP only
            cache.ihl = b & 0xf;
        }
        meta.ihl = self.cache().ihl;

        if !self.pflags.is_set(PacketFlag::CFLAG_FLAGS_FRAG_OFFSET) {
            let value = self.u16()?;
            self.cache_mut().frag_offset = value;
        }
        meta.ip_flags = self.cache().frag_offset;

        if !self.pflags.is_set(PacketFlag::CFLAG_TTL) {
            let ttl = self.u8()?;
            self.cache_mut().ttl = ttl;
        }
        meta.ttl = self.cache().ttl;

        if !self.pflags.is_set(PacketFlag::CFLAG_IP0) {
            let bytes = self.field(IPV6_ADDR_LEN)?;
            self.cache_mut().ip6_src.copy_from_slice(bytes);
        }
        if !self.pflags.is_set(PacketFlag::CFLAG_IP1) {
            let bytes = self.field(IPV6_ADDR_LEN)?;
            self.cache_mut().ip6_dst.copy_from_slice(bytes);
        }
        let cache = self.cache();
        if self.forward {
            meta.ip6_src = Ipv6Addr::from(cache.ip6_src);
            meta.ip6_dst = Ipv6Addr::from(cache.ip6_dst);
        } else {
            meta.ip6_src = Ipv6Addr::from(cache.ip6_dst);
            meta.ip6_dst = Ipv6Addr::from(cache.ip6_src);
        }

        meta.next_header = IpProtocol::from(self.u8()?);
        let options_len = self.u8()?;
        if options_len > 0 {
            let options = self.field(usize::from(options_len))?;
            meta.options.extend_from_slice(options);
        }
        if self.cache().header_type == HeaderType::Ipv6 {
            meta.protocol = meta.next_header;
            return Ok(());
        }
        self.decode_l4(meta)
    }

    fn decode_icmp(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        let icmp_type = self.u8()?;
        let icmp_code = self.u8()?;
        meta.raw_header.resize(4, 0);
        meta.raw_header[0] = icmp_type;
        meta.raw_header[1] = icmp_code;
        let data_len = match icmp_type {
            // These carry (part of) the offending datagram; take what the
            // frame still holds, up to the fixed cap.
            ICMP_TYPE_DEST_UNREACHABLE
            | ICMP_TYPE_SOURCE_QUENCH
            | ICMP_TYPE_REDIRECT
            | ICMP_TYPE_TIME_EXCEEDED
            | ICMP_TYPE_PARAMETER_PROBLEM => (ICMP_ID_SEQ + ICMP_REST)
                .min(self.stream.remaining())
                .min(usize::from(self.frame_size)),
            _ => ICMP_ID_SEQ,
        };
        let data = self.field(data_len)?;
        meta.raw_header.extend_from_slice(data);
        Ok(())
    }

    fn decode_l4(&mut self, meta: &mut MetaPacket) -> Result<(), DecodeError> {
        if !self.pflags.is_set(PacketFlag::CFLAG_PORT0) {
            let port = self.u16()?;
            self.cache_mut().port0 = port;
        }
        if !self.pflags.is_set(PacketFlag::CFLAG_PORT1) {
            let port = self.u16()?;
            self.cache_mut().port1 = port;
        }
        let cache = self.cache();
        if self.forward {
            meta.port_src = cache.port0;
            meta.port_dst = cache.port1;
        } else {
            meta.port_src = cache.port1;
            meta.port_dst = cache.port0;
        }

        let l3_len = if cache.header_type.is_ipv6() {
            40 + meta.options.len()
        } else {
            usize::from(cache.ihl) * 4
        };
        let mut overhead = 14 + l3_len;
        if cache.vlan != 0 {
            overhead += 4;
        }
        let header_type = cache.header_type;
        let data_offset = cache.data_offset;

        if header_type == HeaderType::Ipv4Udp || header_type == HeaderType::Ipv6Udp {
            meta.protocol = IpProtocol::Udp;
            meta.payload_len = payload_len(meta.packet_len, overhead + 8)?;
            return Ok(());
        }

        meta.protocol = IpProtocol::Tcp;
        meta.payload_len = payload_len(meta.packet_len, overhead + usize::from(data_offset) * 4)?;
        let mut tcp = TcpData {
            seq: self.u32()?,
            ack: self.u32()?,
            flags: self.u8()?,
            win_size: self.u16()?,
            data_offset,
            ..TcpData::default()
        };
        if data_offset > 5 {
            let option_flag = self.u8()?;
            if option_flag & TCP_OPT_FLAG_WIN_SCALE != 0 {
                tcp.win_scale = Some(self.u8()?);
            }
            if option_flag & TCP_OPT_FLAG_MSS != 0 {
                tcp.mss = Some(self.u16()?);
            }
            tcp.sack_permitted = option_flag & TCP_OPT_FLAG_SACK_PERMIT != 0;
            let sack_len = usize::from(option_flag & TCP_OPT_FLAG_SACK);
            if sack_len > 0 {
                let sack = self.field(sack_len)?;
                tcp.sack.extend_from_slice(sack);
            }
        }
        meta.tcp_data = Some(tcp);
        Ok(())
    }
}

fn payload_len(packet_len: u16, overhead: usize) -> Result<u16, DecodeError> {
    let overhead = overhead as u16;
    packet_len
        .checked_sub(overhead)
        .ok_or(DecodeError::PayloadUnderflow {
            packet_len,
            overhead,
        })
}

fn rewrite_in_port(in_port: u32) -> u32 {
    if in_port & ANALYZER_AGENT == ANALYZER_AGENT {
        let stripped = in_port & ANALYZER_AGENT_MASK;
        if TapType::from(stripped) == TapType::Tor {
            PACKET_SOURCE_TOR
        } else {
            PACKET_SOURCE_ISP | stripped
        }
    } else {
        in_port & AGENT_MASK | PACKET_SOURCE_TOR
    }
}

/// Iterator over the remaining records of a frame.
pub struct MetaPacketIterator<'a, 'd> {
    decoder: &'d mut SequentialDecoder<'a>,
    errored: bool,
}

impl Iterator for MetaPacketIterator<'_, '_> {
    type Item = Result<MetaPacket, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        let mut meta = MetaPacket::default();
        match self.decoder.next_packet(&mut meta) {
            Ok(true) => None,
            Ok(false) => Some(Ok(meta)),
            Err(error) => {
                self.errored = true;
                Some(Err(error))
            }
        }
    }
}
