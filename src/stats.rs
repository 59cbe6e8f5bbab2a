//! Live-stats protocol over a UNIX domain socket.
//!
//! A client writes the 4-byte [`MSG_MAGIC`] request; the server replies with
//! a [`MsgHeader`] followed by `inputs ×` [`InputStats`] and `outputs ×`
//! [`OutputStats`], all integers little-endian. The socket path encodes the
//! producing process id so several exporters can coexist in one directory.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use nom::multi::count;
use nom_derive::{Nom, Parse};
use tracing::{debug, warn};

use crate::cache::metrics::CacheMetrics;

/// Request and reply magic, `"fprb"` in little-endian byte order.
pub const MSG_MAGIC: u32 = u32::from_le_bytes(*b"fprb");

/// Wire size of one [`InputStats`] entry.
pub const INPUT_STATS_SIZE: usize = 40;
/// Wire size of one [`OutputStats`] entry.
pub const OUTPUT_STATS_SIZE: usize = 32;
/// Wire size of the reply header.
pub const MSG_HEADER_SIZE: usize = 12;

/// Reply header preceding the stats arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct MsgHeader {
    /// Must equal [`MSG_MAGIC`].
    pub magic: u32,
    /// Byte length of the stats payload following this header.
    pub size: u32,
    /// Number of [`InputStats`] entries.
    pub inputs: u16,
    /// Number of [`OutputStats`] entries.
    pub outputs: u16,
}

/// Per-capture-queue statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Nom, serde::Serialize)]
#[nom(LittleEndian)]
pub struct InputStats {
    /// Packets received from the capture source.
    pub packets: u64,
    /// Packets successfully decoded.
    pub parsed: u64,
    /// Bytes received.
    pub bytes: u64,
    /// Packets dropped before the cache.
    pub dropped: u64,
    /// Cumulative queueing time in microseconds.
    pub qtime: u64,
}

/// Per-exporter statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Nom, serde::Serialize)]
#[nom(LittleEndian)]
pub struct OutputStats {
    /// Biflows handed to the exporter.
    pub biflows: u64,
    /// Packets aggregated into those biflows.
    pub packets: u64,
    /// Bytes aggregated into those biflows.
    pub bytes: u64,
    /// Records dropped by queue overflow.
    pub dropped: u64,
}

impl MsgHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.inputs.to_le_bytes());
        buf.extend_from_slice(&self.outputs.to_le_bytes());
    }
}

impl InputStats {
    fn write_to(&self, buf: &mut Vec<u8>) {
        for v in [self.packets, self.parsed, self.bytes, self.dropped, self.qtime] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

impl OutputStats {
    fn write_to(&self, buf: &mut Vec<u8>) {
        for v in [self.biflows, self.packets, self.bytes, self.dropped] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Socket path for the exporter running as `pid`, inside `dir`.
pub fn socket_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("flowprobe_{pid}.sock"))
}

/// A source of live statistics served over the socket.
///
/// The capture layer contributes [`InputStats`]; the cache contributes
/// [`OutputStats`] through its shared [`CacheMetrics`] handle.
pub trait StatsProvider: Send + Sync {
    /// Input-side entries contributed by this provider.
    fn input_stats(&self) -> Vec<InputStats> {
        Vec::new()
    }

    /// Output-side entries contributed by this provider.
    fn output_stats(&self) -> Vec<OutputStats> {
        Vec::new()
    }
}

impl StatsProvider for CacheMetrics {
    fn output_stats(&self) -> Vec<OutputStats> {
        let snap = self.snapshot();
        vec![OutputStats {
            biflows: snap.exported_biflows,
            packets: snap.exported_packets,
            bytes: snap.exported_bytes,
            dropped: snap.queue_overflow,
        }]
    }
}

/// Everything one reply carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReply {
    pub inputs: Vec<InputStats>,
    pub outputs: Vec<OutputStats>,
}

/// Blocking accept-loop server publishing provider snapshots.
///
/// Connections are served sequentially; each client may request repeatedly
/// on one connection. The server thread exits on [`StatsServer::shutdown`]
/// or drop.
pub struct StatsServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatsServer {
    /// Binds `path` (replacing a stale socket file) and spawns the server
    /// thread.
    pub fn spawn(
        path: impl Into<PathBuf>,
        providers: Vec<Arc<dyn StatsProvider>>,
    ) -> io::Result<StatsServer> {
        let path = path.into();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_path = path.clone();
        let handle = std::thread::Builder::new()
            .name("flowprobe-stats".into())
            .spawn(move || {
                debug!(path = %thread_path.display(), "stats server listening");
                for conn in listener.incoming() {
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            if let Err(err) = serve_client(stream, &providers) {
                                debug!(%err, "stats client error");
                            }
                        }
                        Err(err) => {
                            warn!(%err, "stats accept failed");
                            break;
                        }
                    }
                }
            })?;

        Ok(StatsServer {
            path,
            stop,
            handle: Some(handle),
        })
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the server thread and removes the socket file.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Unblock the accept loop with a throwaway connection.
        let _ = UnixStream::connect(&self.path);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_thread();
        }
    }
}

fn serve_client(
    mut stream: UnixStream,
    providers: &[Arc<dyn StatsProvider>],
) -> io::Result<()> {
    loop {
        let mut request = [0u8; 4];
        match stream.read_exact(&mut request) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        if u32::from_le_bytes(request) != MSG_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad stats request magic",
            ));
        }

        let inputs: Vec<InputStats> = providers.iter().flat_map(|p| p.input_stats()).collect();
        let outputs: Vec<OutputStats> = providers.iter().flat_map(|p| p.output_stats()).collect();

        let size = inputs.len() * INPUT_STATS_SIZE + outputs.len() * OUTPUT_STATS_SIZE;
        let mut reply = Vec::with_capacity(MSG_HEADER_SIZE + size);
        MsgHeader {
            magic: MSG_MAGIC,
            size: size as u32,
            inputs: inputs.len() as u16,
            outputs: outputs.len() as u16,
        }
        .write_to(&mut reply);
        for entry in &inputs {
            entry.write_to(&mut reply);
        }
        for entry in &outputs {
            entry.write_to(&mut reply);
        }
        stream.write_all(&reply)?;
    }
}

/// Connects to an exporter's stats socket and performs one request/reply
/// exchange.
pub fn query(path: &Path) -> io::Result<StatsReply> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&MSG_MAGIC.to_le_bytes())?;

    let mut header_bytes = [0u8; MSG_HEADER_SIZE];
    stream.read_exact(&mut header_bytes)?;
    let (_, header) = MsgHeader::parse(&header_bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad stats reply header"))?;
    if header.magic != MSG_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad stats reply magic",
        ));
    }

    let mut payload = vec![0u8; header.size as usize];
    stream.read_exact(&mut payload)?;
    parse_reply(&payload, header.inputs as usize, header.outputs as usize)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "truncated stats payload"))
}

fn parse_reply(
    payload: &[u8],
    inputs: usize,
    outputs: usize,
) -> Result<StatsReply, nom::Err<nom::error::Error<&[u8]>>> {
    let (rest, inputs) = count(InputStats::parse_le, inputs)(payload)?;
    let (_, outputs) = count(OutputStats::parse_le, outputs)(rest)?;
    Ok(StatsReply { inputs, outputs })
}
