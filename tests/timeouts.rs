use std::net::IpAddr;
use std::time::Duration;

use flowprobe::packet::IPPROTO_UDP;
use flowprobe::{FlowCache, Packet, TerminationReason};

fn udp<'a>(ts: u64, sport: u16) -> Packet<'a> {
    Packet {
        timestamp: Duration::from_secs(ts),
        src_addr: "192.168.0.5".parse::<IpAddr>().unwrap(),
        dst_addr: "192.168.0.9".parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: 4000,
        proto: IPPROTO_UDP,
        vlan_id: 0,
        tcp_flags: 0,
        len: 80,
        payload: &[],
    }
}

fn cache(active: u32, inactive: u32) -> FlowCache {
    FlowCache::builder()
        .with_size_exponent(4)
        .with_line_exponent(2)
        .with_active_timeout(active)
        .with_inactive_timeout(inactive)
        // Twice the capacity: termination steps hold the cursor in place, so
        // a full pass needs slack beyond the 16 slots.
        .with_sweep_step(32)
        .with_hash_seed(99)
        .build()
        .expect("valid configuration")
}

#[test]
fn test_active_timeout_splits_long_flow() {
    let mut cache = cache(10, 30);

    for ts in 0..=15u64 {
        cache.put_packet(&udp(ts, 5000)).expect("accepts");
    }

    // The packet at t=10 crossed the active boundary: the first flow left
    // with packets t=0..9 and the packet opened a successor flow.
    assert_eq!(cache.exported_len(), 1);
    let first = cache.pop_exported().expect("active timeout export");
    assert_eq!(first.termination(), Some(TerminationReason::ActiveTimeout));
    assert_eq!(first.total_packets(), 10);
    assert_eq!(first.first_seen, Duration::from_secs(0));
    assert_eq!(first.last_seen, Duration::from_secs(9));

    let terminated_at = first.terminated_at().expect("termination time");
    assert!(terminated_at - first.first_seen >= Duration::from_secs(10));

    // The live successor carries t=10..15.
    let snap = cache.metrics_snapshot();
    assert_eq!(snap.flows_alive, 1);
    assert_eq!(snap.timeouts_active, 1);

    cache.shutdown(Duration::from_secs(16));
    let second = cache.pop_exported().expect("successor flow");
    assert_eq!(second.total_packets(), 6);
    assert_eq!(second.first_seen, Duration::from_secs(10));
    assert_eq!(second.last_seen, Duration::from_secs(15));
}

#[test]
fn test_active_timeout_fires_from_sweep_under_drought() {
    let mut cache = cache(10, 3600);

    cache.put_packet(&udp(0, 5000)).expect("accepts");
    cache.tick(Duration::from_secs(9));
    assert_eq!(cache.exported_len(), 0);

    cache.tick(Duration::from_secs(10));
    let flow = cache.pop_exported().expect("active timeout export");
    assert_eq!(flow.termination(), Some(TerminationReason::ActiveTimeout));
    assert_eq!(cache.metrics_snapshot().timeouts_active, 1);
}

#[test]
fn test_inactive_timeout_boundary() {
    let mut cache = cache(3600, 30);

    cache.put_packet(&udp(0, 5000)).expect("accepts");

    cache.tick(Duration::from_secs(29));
    assert_eq!(cache.exported_len(), 0);

    cache.tick(Duration::from_secs(30));
    let flow = cache.pop_exported().expect("inactive timeout export");
    assert_eq!(flow.termination(), Some(TerminationReason::InactiveTimeout));

    let terminated_at = flow.terminated_at().expect("termination time");
    assert!(terminated_at - flow.last_seen >= Duration::from_secs(30));
}

#[test]
fn test_packets_keep_a_flow_alive() {
    let mut cache = cache(3600, 30);

    // A packet every 20 seconds never lets the inactive timeout fire.
    for i in 0..10u64 {
        cache.put_packet(&udp(i * 20, 5000)).expect("accepts");
    }
    assert_eq!(cache.exported_len(), 0);
    assert_eq!(cache.metrics_snapshot().flows_alive, 1);
}

#[test]
fn test_sweep_terminates_multiple_expired_flows() {
    let mut cache = cache(3600, 30);

    for sport in [5000u16, 5001, 5002, 5003] {
        cache.put_packet(&udp(0, sport)).expect("accepts");
    }

    cache.tick(Duration::from_secs(40));
    assert_eq!(cache.exported_len(), 4);

    let mut reasons = Vec::new();
    while let Some(rec) = cache.pop_exported() {
        reasons.push(rec.termination());
    }
    assert!(reasons
        .iter()
        .all(|r| *r == Some(TerminationReason::InactiveTimeout)));
    assert_eq!(cache.metrics_snapshot().timeouts_inactive, 4);
    assert_eq!(cache.metrics_snapshot().flows_alive, 0);
}
