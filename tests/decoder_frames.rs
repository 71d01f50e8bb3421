use std::net::Ipv4Addr;

use metapacket_parser::{
    DecodeError, HeaderType, IpProtocol, MetaPacket, PacketFlag, SequentialDecoder,
};

struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    fn new() -> Self {
        let mut buf = vec![0, 0]; // frame size, backfilled by build()
        buf.push(0); // reserved
        buf.push(5); // version
        buf.extend_from_slice(&7u16.to_be_bytes()); // vtap id
        buf.extend_from_slice(&1u64.to_be_bytes()); // sequence
        buf.extend_from_slice(&500_000u64.to_be_bytes()); // dispatcher 0 + base timestamp
        buf.extend_from_slice(&0u32.to_be_bytes()); // in port
        FrameBuilder { buf }
    }

    fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    fn u16(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn build(mut self) -> Vec<u8> {
        let size = self.buf.len() as u16;
        self.buf[..2].copy_from_slice(&size.to_be_bytes());
        self.buf
    }
}

/// A frame holding an uncompressed IPv4 TCP record, a compressed follow-up
/// and an uncompressed reverse-direction UDP record.
fn mixed_frame() -> Vec<u8> {
    FrameBuilder::new()
        // TCP record, all fields on the wire.
        .u16(100) // delta
        .u16(120) // packet length
        .u16(0) // pflags
        .u8(HeaderType::Ipv4Tcp as u8)
        .bytes(&[0x02, 0, 0, 0, 0, 0x01])
        .bytes(&[0x02, 0, 0, 0, 0, 0x02])
        .u16(0) // vlan
        .u8(0x55) // data offset 5, IHL 5
        .u16(1) // ip id
        .u16(0) // flags + frag offset
        .u8(64) // ttl
        .u32(u32::from(Ipv4Addr::new(192, 168, 1, 1)))
        .u32(u32::from(Ipv4Addr::new(192, 168, 1, 2)))
        .u16(443)
        .u16(51000)
        .u32(1000) // seq
        .u32(2000) // ack
        .u8(0x10) // flags
        .u16(512) // window
        // Compressed follow-up in the same direction.
        .u16(10)
        .u16(120)
        .u16(PacketFlag::CFLAG_FULL.bits())
        .u16(2) // ip id
        .u32(1001)
        .u32(2000)
        .u8(0x10)
        .u16(512)
        // Reverse-direction UDP record.
        .u16(10)
        .u16(80)
        .u16(PacketFlag::PFLAG_DST_ENDPOINT.bits())
        .u8(HeaderType::Ipv4Udp as u8)
        .bytes(&[0x02, 0, 0, 0, 0, 0x02])
        .bytes(&[0x02, 0, 0, 0, 0, 0x01])
        .u16(0)
        .u8(0x55)
        .u16(3)
        .u16(0)
        .u8(60)
        .u32(u32::from(Ipv4Addr::new(192, 168, 1, 2)))
        .u32(u32::from(Ipv4Addr::new(192, 168, 1, 1)))
        .u16(51000)
        .u16(443)
        .build()
}

#[test]
fn frames_decode_to_the_exact_boundary() {
    let frame = mixed_frame();
    let mut decoder = SequentialDecoder::new(&frame);
    let info = decoder.decode_header().unwrap();
    assert_eq!(usize::from(info.frame_size), frame.len());
    assert_eq!(info.vtap_id, 7);

    let mut packets = Vec::new();
    let mut meta = MetaPacket::default();
    while !decoder.next_packet(&mut meta).unwrap() {
        packets.push(meta.clone());
    }
    assert_eq!(packets.len(), 3);

    assert_eq!(packets[0].protocol, IpProtocol::Tcp);
    // 120 - 14 (eth) - 20 (ip) - 20 (tcp)
    assert_eq!(packets[0].payload_len, 66);
    assert_eq!(packets[0].port_src, 443);

    // The compressed record replays every sticky field.
    assert_eq!(packets[1].ip_src, packets[0].ip_src);
    assert_eq!(packets[1].port_src, packets[0].port_src);
    assert_eq!(packets[1].mac_dst, packets[0].mac_dst);
    let tcp = packets[1].tcp_data.as_ref().unwrap();
    assert_eq!(tcp.seq, 1001);

    // The reverse record swaps endpoint 0/1 into src/dst.
    assert_eq!(packets[2].protocol, IpProtocol::Udp);
    assert_eq!(packets[2].ip_src, Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(packets[2].port_src, 443);
    assert!(packets[2].l2_end_1);

    // Timestamps accumulate record deltas over the frame base.
    assert_eq!(packets[0].timestamp.as_micros(), 500_100);
    assert_eq!(packets[1].timestamp.as_micros(), 500_110);
    assert_eq!(packets[2].timestamp.as_micros(), 500_120);
}

#[test]
fn decoded_packets_serialize_to_json() {
    let frame = mixed_frame();
    let mut decoder = SequentialDecoder::new(&frame);
    decoder.decode_header().unwrap();
    let mut meta = MetaPacket::default();
    assert!(!decoder.next_packet(&mut meta).unwrap());

    let json = serde_json::to_value(&meta).unwrap();
    assert_eq!(json["packet_len"], 120);
    assert_eq!(json["ip_src"], "192.168.1.1");
}

#[test]
fn header_rejections_drop_the_frame() {
    // Version 4 header.
    let frame = hex::decode(concat!(
        "001b", // frame size (27)
        "00", "04", // reserved, version
        "002a", // vtap id
        "0000000000000001", // sequence
        "0000000000000000", // dispatcher index + timestamp
        "00000000", // in port
        "00" // one record byte
    ))
    .unwrap();
    let mut decoder = SequentialDecoder::new(&frame);
    assert_eq!(
        decoder.decode_header(),
        Err(DecodeError::VersionMismatch { version: 4 })
    );

    // Dispatcher index 16.
    let frame = hex::decode(concat!(
        "001b",
        "00", "05",
        "002a",
        "0000000000000001",
        "1000000000000000",
        "00000000",
        "00"
    ))
    .unwrap();
    let mut decoder = SequentialDecoder::new(&frame);
    assert_eq!(
        decoder.decode_header(),
        Err(DecodeError::InvalidDispatcherIndex { index: 16 })
    );

    // Frame size that cannot hold the header.
    let frame = hex::decode(concat!(
        "0014",
        "00", "05",
        "002a",
        "0000000000000001",
        "0000000000000000",
        "00000000",
        "00"
    ))
    .unwrap();
    let mut decoder = SequentialDecoder::new(&frame);
    assert_eq!(
        decoder.decode_header(),
        Err(DecodeError::FrameTooShort { frame_size: 20 })
    );
}

#[test]
fn a_record_past_the_frame_boundary_kills_the_frame() {
    let mut frame = mixed_frame();
    // Shrink the claimed size so the last record runs over the boundary.
    let truncated = (frame.len() - 4) as u16;
    frame[..2].copy_from_slice(&truncated.to_be_bytes());

    let mut decoder = SequentialDecoder::new(&frame);
    decoder.decode_header().unwrap();
    let mut meta = MetaPacket::default();
    assert!(!decoder.next_packet(&mut meta).unwrap());
    assert!(!decoder.next_packet(&mut meta).unwrap());
    assert!(matches!(
        decoder.next_packet(&mut meta),
        Err(DecodeError::FrameOverrun { .. })
    ));

    // The iterator surfaces the error once, then fuses.
    let mut decoder = SequentialDecoder::new(&frame);
    decoder.decode_header().unwrap();
    let results: Vec<_> = decoder.packets().collect();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(results[2].is_err());
}
