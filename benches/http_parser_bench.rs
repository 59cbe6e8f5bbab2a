use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::net::IpAddr;
use std::time::Duration;

use flowprobe::packet::IPPROTO_TCP;
use flowprobe::{FlowCache, HttpPlugin, Packet};

const REQUEST: &[u8] = b"GET /assets/app.js HTTP/1.1\r\nHost: www.example.com\r\nUser-Agent: Mozilla/5.0 (X11; Linux x86_64)\r\nAccept: */*\r\nReferer: https://www.example.com/\r\n\r\n";
const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/javascript\r\nContent-Length: 1024\r\n\r\n";

fn packet<'a>(ts: u64, payload: &'a [u8], reverse: bool) -> Packet<'a> {
    let (src, sport, dst, dport) = if reverse {
        ([10u8, 0, 0, 2], 80u16, [10u8, 0, 0, 1], 52000u16)
    } else {
        ([10u8, 0, 0, 1], 52000u16, [10u8, 0, 0, 2], 80u16)
    };
    Packet {
        timestamp: Duration::from_micros(ts),
        src_addr: IpAddr::from(src),
        dst_addr: IpAddr::from(dst),
        src_port: sport,
        dst_port: dport,
        proto: IPPROTO_TCP,
        vlan_id: 0,
        tcp_flags: 0,
        len: 40 + payload.len() as u16,
        payload,
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("http request/response pair", |b| {
        let mut cache = FlowCache::builder()
            .with_size_exponent(10)
            .with_line_exponent(2)
            .with_hash_seed(0xbeef)
            .register_parser(Box::new(HttpPlugin::new()))
            .build()
            .expect("valid configuration");

        let mut ts = 0u64;
        b.iter(|| {
            ts += 2;
            let _ = cache.put_packet(black_box(&packet(ts, REQUEST, false)));
            let _ = cache.put_packet(black_box(&packet(ts + 1, RESPONSE, true)));
            while cache.pop_exported().is_some() {}
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
