use std::net::IpAddr;
use std::time::Duration;

use flowprobe::packet::IPPROTO_TCP;
use flowprobe::{FlowCache, HttpExtension, HttpPlugin, Packet, TerminationReason, http_extension_id};

fn tcp<'a>(ts: u64, payload: &'a [u8], reverse: bool) -> Packet<'a> {
    let (src, sport, dst, dport) = if reverse {
        ("10.4.0.2", 80u16, "10.4.0.1", 51000u16)
    } else {
        ("10.4.0.1", 51000u16, "10.4.0.2", 80u16)
    };
    Packet {
        timestamp: Duration::from_secs(ts),
        src_addr: src.parse::<IpAddr>().unwrap(),
        dst_addr: dst.parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: dport,
        proto: IPPROTO_TCP,
        vlan_id: 0,
        tcp_flags: 0,
        len: 40 + payload.len() as u16,
        payload,
    }
}

fn cache() -> FlowCache {
    FlowCache::builder()
        .with_size_exponent(6)
        .with_line_exponent(2)
        .with_hash_seed(17)
        .register_parser(Box::new(HttpPlugin::new()))
        .build()
        .expect("valid configuration")
}

#[test]
fn test_request_fields_attach_to_flow() {
    let mut cache = cache();

    let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8\r\n\r\n";
    cache.put_packet(&tcp(0, request, false)).expect("accepts");
    cache.shutdown(Duration::from_secs(1));

    let flow = cache.pop_exported().expect("flow drained");
    let ext = flow
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert_eq!(ext.method, "GET");
    assert_eq!(ext.uri, "/index.html");
    assert_eq!(ext.host, "example.com");
    assert_eq!(ext.user_agent, "curl/8");
    assert!(ext.request_seen);
}

#[test]
fn test_request_and_response_share_one_extension() {
    let mut cache = cache();

    cache
        .put_packet(&tcp(0, b"GET /a HTTP/1.1\r\nHost: a.example\r\n\r\n", false))
        .expect("accepts");
    cache
        .put_packet(&tcp(
            1,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n",
            true,
        ))
        .expect("accepts");
    cache.shutdown(Duration::from_secs(2));

    let flow = cache.pop_exported().expect("flow drained");
    assert_eq!(flow.total_packets(), 2);
    let ext = flow
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert_eq!(ext.uri, "/a");
    assert_eq!(ext.status_code, 200);
    assert_eq!(ext.content_type, "text/plain");
}

#[test]
fn test_pipelined_request_flushes_previous_transaction() {
    let mut cache = cache();

    cache
        .put_packet(&tcp(0, b"GET /first HTTP/1.1\r\nHost: a.example\r\n\r\n", false))
        .expect("accepts");
    cache
        .put_packet(&tcp(1, b"GET /second HTTP/1.1\r\nHost: a.example\r\n\r\n", false))
        .expect("accepts");

    let first = cache.pop_exported().expect("first transaction flushed");
    assert_eq!(first.termination(), Some(TerminationReason::ForcedEnd));
    let ext = first
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert_eq!(ext.uri, "/first");

    assert_eq!(cache.metrics_snapshot().reinsertions, 1);

    cache.shutdown(Duration::from_secs(2));
    let second = cache.pop_exported().expect("second transaction live");
    let ext = second
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert_eq!(ext.uri, "/second");
}

#[test]
fn test_http2_confirmed_only_with_frame_header() {
    let mut cache = cache();

    // Preface alone arms detection but does not confirm.
    let preface = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
    cache.put_packet(&tcp(0, preface, false)).expect("accepts");

    // A SETTINGS frame header on the next packet confirms.
    let settings = [0u8, 0, 0, 0x4, 0, 0, 0, 0, 0];
    cache.put_packet(&tcp(1, &settings, false)).expect("accepts");

    cache.shutdown(Duration::from_secs(2));
    let flow = cache.pop_exported().expect("flow drained");
    let ext = flow
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert!(ext.http2_preface_seen);
    assert!(ext.http2);
}

#[test]
fn test_preface_lookalike_is_not_confirmed() {
    let mut cache = cache();

    // The preface followed by garbage that is not a valid frame header.
    let mut payload = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
    payload.extend_from_slice(b"this is not a frame");
    // Frame type 0x74 ('t') is unknown, so detection stays armed only.
    cache.put_packet(&tcp(0, &payload, false)).expect("accepts");

    cache.shutdown(Duration::from_secs(1));
    let flow = cache.pop_exported().expect("flow drained");
    let ext = flow
        .extension::<HttpExtension>(http_extension_id())
        .expect("http extension attached");
    assert!(ext.http2_preface_seen);
    assert!(!ext.http2);
}
