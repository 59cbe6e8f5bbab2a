//! Feeding the cache from real Ethernet frames, the way a capture layer
//! would: frames built and sliced with etherparse, then mapped onto the
//! cache's packet value.

use std::net::IpAddr;
use std::time::Duration;

use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};
use flowprobe::packet::{IPPROTO_TCP, IPPROTO_UDP, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
use flowprobe::{FlowCache, Packet, TerminationReason};

/// Maps one sliced Ethernet frame onto the cache input value.
fn decode<'a>(frame: &'a [u8], ts: Duration) -> Option<Packet<'a>> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;

    let (src_addr, dst_addr) = match sliced.net.as_ref()? {
        NetSlice::Ipv4(v4) => (
            IpAddr::from(v4.header().source_addr()),
            IpAddr::from(v4.header().destination_addr()),
        ),
        NetSlice::Ipv6(v6) => (
            IpAddr::from(v6.header().source_addr()),
            IpAddr::from(v6.header().destination_addr()),
        ),
        _ => return None,
    };

    match sliced.transport.as_ref()? {
        TransportSlice::Udp(udp) => Some(Packet {
            timestamp: ts,
            src_addr,
            dst_addr,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            proto: IPPROTO_UDP,
            vlan_id: 0,
            tcp_flags: 0,
            len: (udp.payload().len() + 28) as u16,
            payload: udp.payload(),
        }),
        TransportSlice::Tcp(tcp) => {
            let mut flags = 0u8;
            if tcp.fin() {
                flags |= TCP_FIN;
            }
            if tcp.syn() {
                flags |= TCP_SYN;
            }
            if tcp.rst() {
                flags |= TCP_RST;
            }
            if tcp.ack() {
                flags |= TCP_ACK;
            }
            Some(Packet {
                timestamp: ts,
                src_addr,
                dst_addr,
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                proto: IPPROTO_TCP,
                vlan_id: 0,
                tcp_flags: flags,
                len: (tcp.payload().len() + 40) as u16,
                payload: tcp.payload(),
            })
        }
        _ => None,
    }
}

#[test]
fn test_udp_frame_flows_through_cache() {
    let payload = b"ping";
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(40000, 7);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).expect("frame builds");

    let pkt = decode(&frame, Duration::from_secs(0)).expect("decodes");
    assert_eq!(pkt.src_port, 40000);
    assert_eq!(pkt.dst_port, 7);
    assert_eq!(pkt.payload, b"ping");

    let mut cache = FlowCache::builder()
        .with_size_exponent(6)
        .with_line_exponent(2)
        .with_hash_seed(13)
        .build()
        .expect("valid configuration");
    cache.put_packet(&pkt).expect("accepts");
    assert_eq!(cache.metrics_snapshot().flows_alive, 1);
}

#[test]
fn test_tcp_fin_frame_terminates_flow() {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(50000, 80, 1000, 4096)
        .fin()
        .ack(1);
    let mut frame = Vec::new();
    builder.write(&mut frame, &[]).expect("frame builds");

    let pkt = decode(&frame, Duration::from_secs(0)).expect("decodes");
    assert_ne!(pkt.tcp_flags & TCP_FIN, 0);

    let mut cache = FlowCache::builder()
        .with_size_exponent(6)
        .with_line_exponent(2)
        .with_hash_seed(13)
        .build()
        .expect("valid configuration");
    cache.put_packet(&pkt).expect("accepts");

    let flow = cache.pop_exported().expect("FIN export");
    assert_eq!(flow.termination(), Some(TerminationReason::EndOfFlow));
}
