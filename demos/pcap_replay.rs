//! Replays a legacy pcap file through the flow cache and prints every
//! exported flow as a JSON line.
//!
//! Usage: `cargo run --example pcap_replay -- capture.pcap`

use std::net::IpAddr;
use std::time::Duration;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_parser::LegacyPcapReader;
use pcap_parser::PcapError;
use pcap_parser::traits::PcapReaderIterator;

use flowprobe::packet::{IPPROTO_TCP, IPPROTO_UDP, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
use flowprobe::{DnsPlugin, FlowCache, HttpPlugin, Packet};

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

fn drain(cache: &mut FlowCache) {
    while let Some(flow) = cache.pop_exported() {
        match serde_json::to_string(&*flow) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("serialize error: {err}"),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: pcap_replay <capture.pcap>");
            std::process::exit(2);
        }
    };
    let file = std::fs::File::open(&path).expect("failed to open pcap file");
    let mut reader = LegacyPcapReader::new(65536, file).expect("LegacyPcapReader");

    let mut cache = FlowCache::builder()
        .register_parser(Box::new(HttpPlugin::new()))
        .register_parser(Box::new(DnsPlugin::new()))
        .build()
        .expect("valid configuration");

    let mut last_ts = Duration::ZERO;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    pcap_parser::PcapBlockOwned::LegacyHeader(_header) => (),
                    pcap_parser::PcapBlockOwned::Legacy(pcap_block) => {
                        let ts = Duration::from_secs(u64::from(pcap_block.ts_sec))
                            + Duration::from_micros(u64::from(pcap_block.ts_usec));
                        last_ts = ts;
                        if let Some(pkt) = decode(pcap_block.data, ts) {
                            if let Err(err) = cache.put_packet(&pkt) {
                                eprintln!("cache refused packet: {err}");
                            }
                        }
                        drain(&mut cache);
                    }
                    pcap_parser::PcapBlockOwned::NG(_) => {
                        eprintln!("Warning: PCAPNG block in a legacy PCAP file.");
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => {
                break;
            }
            Err(PcapError::Incomplete(_)) => {
                reader.refill().expect("Failed to refill buffer");
            }
            Err(e) => {
                eprintln!("Error while reading PCAP: {:?}", e);
                break;
            }
        }
    }

    cache.shutdown(last_ts);
    drain(&mut cache);

    let snap = cache.metrics_snapshot();
    eprintln!(
        "done: {} lookups, {} exported biflows, {} evictions, {} overflow drops",
        snap.total_lookups(),
        snap.exported_biflows,
        snap.evictions,
        snap.queue_overflow,
    );
}
