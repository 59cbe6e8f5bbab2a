//! Capture-side input value handed to the flow cache.
//!
//! The capture and decode layers are external; they produce one [`Packet`]
//! per decoded frame. The cache never retains a `Packet` — everything it
//! needs is copied into the owning [`FlowRecord`](crate::FlowRecord) during
//! routing, so the payload can borrow from the capture buffer.

use std::net::IpAddr;
use std::time::Duration;

/// TCP FIN flag bit.
pub const TCP_FIN: u8 = 0x01;
/// TCP SYN flag bit.
pub const TCP_SYN: u8 = 0x02;
/// TCP RST flag bit.
pub const TCP_RST: u8 = 0x04;
/// TCP PSH flag bit.
pub const TCP_PSH: u8 = 0x08;
/// TCP ACK flag bit.
pub const TCP_ACK: u8 = 0x10;

/// IANA protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// A single decoded packet as produced by the capture layer.
///
/// `len` is the L3 length accounted into flow byte counters; `payload` is the
/// (possibly truncated) L4 payload slice that process plugins inspect.
/// `timestamp` is the arrival time as an offset from the capture epoch, with
/// microsecond resolution.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    /// Arrival timestamp relative to the capture epoch.
    pub timestamp: Duration,
    /// L3 source address.
    pub src_addr: IpAddr,
    /// L3 destination address.
    pub dst_addr: IpAddr,
    /// L4 source port (0 for portless protocols).
    pub src_port: u16,
    /// L4 destination port (0 for portless protocols).
    pub dst_port: u16,
    /// IANA L4 protocol number.
    pub proto: u8,
    /// 802.1Q VLAN id, 0 when untagged.
    pub vlan_id: u16,
    /// TCP flag byte; 0 for non-TCP packets.
    pub tcp_flags: u8,
    /// L3 packet length in bytes, accounted into the owning flow.
    pub len: u16,
    /// L4 payload, possibly truncated by the capture snap length.
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// True when the packet is TCP and carries FIN or RST.
    #[inline]
    pub fn ends_flow(&self) -> bool {
        self.proto == IPPROTO_TCP && self.tcp_flags & (TCP_FIN | TCP_RST) != 0
    }
}
