//! Synthetic traffic through the cache with an async exporter consumer and
//! the live stats socket.
//!
//! The cache lives on a blocking thread (one owner, no locks); terminated
//! flows cross to an async task over a channel, the way a real exporter
//! drains the hand-off queue. Query the stats socket while it runs:
//! the path is printed at startup.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use flowprobe::packet::IPPROTO_UDP;
use flowprobe::stats::{self, StatsProvider, StatsServer};
use flowprobe::{FlowCache, FlowRecord, Packet};

fn synthetic_packet<'a>(ts: Duration, sport: u16) -> Packet<'a> {
    Packet {
        timestamp: ts,
        src_addr: "10.9.0.1".parse::<IpAddr>().unwrap(),
        dst_addr: "10.9.0.2".parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: 9000,
        proto: IPPROTO_UDP,
        vlan_id: 0,
        tcp_flags: 0,
        len: 120,
        payload: &[],
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut cache = FlowCache::builder()
        .with_size_exponent(10)
        .with_line_exponent(2)
        .with_inactive_timeout(2)
        .with_sweep_step(64)
        .build()
        .expect("valid configuration");

    let socket = stats::socket_path(&std::env::temp_dir(), std::process::id());
    let providers: Vec<Arc<dyn StatsProvider>> = vec![cache.metrics()];
    let server = StatsServer::spawn(socket.clone(), providers).expect("stats server binds");
    println!("stats socket: {}", socket.display());

    let metrics = cache.metrics();
    let (tx, mut rx) = mpsc::channel::<Box<FlowRecord>>(256);

    // The cache owner: synthesize a minute of traffic, tick the sweep, and
    // forward every exported flow to the async consumer.
    let producer = tokio::task::spawn_blocking(move || {
        for second in 0..60u64 {
            let now = Duration::from_secs(second);
            for sport in 0..32u16 {
                let pkt = synthetic_packet(now, 20000 + (sport % 8) * 13 + (second as u16 % 3));
                if cache.put_packet(&pkt).is_err() {
                    return;
                }
            }
            cache.tick(now);
            while let Some(flow) = cache.pop_exported() {
                if tx.blocking_send(flow).is_err() {
                    return;
                }
            }
        }
        cache.shutdown(Duration::from_secs(60));
        while let Some(flow) = cache.pop_exported() {
            if tx.blocking_send(flow).is_err() {
                return;
            }
        }
    });

    // Periodic counter report, alongside the per-flow output.
    let reporter_metrics = Arc::clone(&metrics);
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let snap = reporter_metrics.snapshot();
            eprintln!(
                "[metrics] alive={} exported={} hits={} misses={}",
                snap.flows_alive, snap.exported_biflows, snap.hits, snap.misses
            );
        }
    });

    while let Some(flow) = rx.recv().await {
        match serde_json::to_string(&*flow) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("serialize error: {err}"),
        }
    }

    producer.await.expect("producer thread");
    server.shutdown();
}
