use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use flowprobe::packet::{IPPROTO_TCP, TCP_ACK, TCP_FIN};
use flowprobe::stats::{self, InputStats, StatsProvider, StatsServer};
use flowprobe::{FlowCache, Packet};

/// Stand-in for the capture layer's per-queue counters.
struct FixedInput(InputStats);

impl StatsProvider for FixedInput {
    fn input_stats(&self) -> Vec<InputStats> {
        vec![self.0]
    }
}

fn fin<'a>(ts: u64, sport: u16) -> Packet<'a> {
    Packet {
        timestamp: Duration::from_secs(ts),
        src_addr: "10.6.0.1".parse::<IpAddr>().unwrap(),
        dst_addr: "10.6.0.2".parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: 8080,
        proto: IPPROTO_TCP,
        vlan_id: 0,
        tcp_flags: TCP_FIN | TCP_ACK,
        len: 60,
        payload: &[],
    }
}

fn unique_socket(tag: &str) -> std::path::PathBuf {
    stats::socket_path(&std::env::temp_dir(), std::process::id()).with_file_name(format!(
        "flowprobe_test_{}_{}.sock",
        tag,
        std::process::id()
    ))
}

#[test]
fn test_server_round_trip() {
    let mut cache = FlowCache::builder()
        .with_size_exponent(6)
        .with_line_exponent(2)
        .with_hash_seed(31)
        .build()
        .expect("valid configuration");

    // Two one-packet flows terminated by FIN.
    cache.put_packet(&fin(0, 9001)).expect("accepts");
    cache.put_packet(&fin(1, 9002)).expect("accepts");

    let input = InputStats {
        packets: 2,
        parsed: 2,
        bytes: 120,
        dropped: 0,
        qtime: 17,
    };

    let path = unique_socket("roundtrip");
    let providers: Vec<Arc<dyn StatsProvider>> =
        vec![Arc::new(FixedInput(input)), cache.metrics()];
    let server = StatsServer::spawn(path.clone(), providers).expect("server binds");

    let reply = stats::query(&path).expect("query succeeds");
    assert_eq!(reply.inputs, vec![input]);
    assert_eq!(reply.outputs.len(), 1);
    assert_eq!(reply.outputs[0].biflows, 2);
    assert_eq!(reply.outputs[0].packets, 2);
    assert_eq!(reply.outputs[0].bytes, 120);
    assert_eq!(reply.outputs[0].dropped, 0);

    server.shutdown();
    assert!(!path.exists());
}

#[test]
fn test_snapshots_track_live_counters() {
    let mut cache = FlowCache::builder()
        .with_size_exponent(6)
        .with_line_exponent(2)
        .with_hash_seed(31)
        .build()
        .expect("valid configuration");

    let path = unique_socket("live");
    let providers: Vec<Arc<dyn StatsProvider>> = vec![cache.metrics()];
    let server = StatsServer::spawn(path.clone(), providers).expect("server binds");

    let before = stats::query(&path).expect("query succeeds");
    assert_eq!(before.outputs[0].biflows, 0);

    cache.put_packet(&fin(0, 9001)).expect("accepts");

    let after = stats::query(&path).expect("query succeeds");
    assert_eq!(after.outputs[0].biflows, 1);

    server.shutdown();
}

#[test]
fn test_bad_magic_is_rejected() {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let path = unique_socket("badmagic");
    let server = StatsServer::spawn(path.clone(), Vec::new()).expect("server binds");

    let mut conn = UnixStream::connect(&path).expect("connects");
    conn.write_all(&0xdead_beefu32.to_le_bytes()).expect("writes");

    // The server closes the connection without a reply.
    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).expect("read returns"), 0);

    server.shutdown();
}

#[test]
fn test_socket_path_encodes_pid() {
    let path = stats::socket_path(std::path::Path::new("/var/run"), 1234);
    assert_eq!(
        path,
        std::path::PathBuf::from("/var/run/flowprobe_1234.sock")
    );
}
