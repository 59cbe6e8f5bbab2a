//! Canonical biflow key and the keyed hash that maps it onto a cache line.
//!
//! Two directional keys are derivable from any packet; they differ only in
//! src/dst ordering. The canonical ("forward") key is the one whose
//! `(src_addr, src_port)` pair orders lexicographically at or below
//! `(dst_addr, dst_port)`, so both directions of a conversation resolve to
//! the same [`FlowKey`]. Split mode skips the normalisation and keeps each
//! direction as its own flow.

use std::net::IpAddr;

use serde::Serialize;

use crate::packet::Packet;

/// Serialised width of a [`FlowKey`] in bytes.
pub const KEY_BYTES: usize = 40;

/// Address family of a flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddrFamily {
    /// IPv4; only the first 4 address bytes are significant.
    V4,
    /// IPv6.
    V6,
}

/// Which directional key of the biflow a packet matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Packet travels src → dst of the canonical key.
    Forward,
    /// Packet travels dst → src of the canonical key.
    Reverse,
}

impl Direction {
    /// Index into per-direction counter arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }
}

/// Canonicalised directional 5-tuple (plus VLAN and family) identifying a
/// biflow. Keys are compared by value; the hash is never used for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    /// Source address bytes; IPv4 occupies the first 4, remainder zero.
    pub src_addr: [u8; 16],
    /// Destination address bytes, same layout as `src_addr`.
    pub dst_addr: [u8; 16],
    /// L4 source port.
    pub src_port: u16,
    /// L4 destination port.
    pub dst_port: u16,
    /// IANA L4 protocol number.
    pub proto: u8,
    /// 802.1Q VLAN id, 0 when untagged.
    pub vlan_id: u16,
    /// Address family of both endpoints.
    pub family: AddrFamily,
}

fn addr_bytes(addr: IpAddr) -> ([u8; 16], AddrFamily) {
    match addr {
        IpAddr::V4(v4) => {
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&v4.octets());
            (bytes, AddrFamily::V4)
        }
        IpAddr::V6(v6) => (v6.octets(), AddrFamily::V6),
    }
}

impl FlowKey {
    /// Derives the canonical key and the packet's direction relative to it.
    ///
    /// With `split` set the key is taken verbatim from the packet and the
    /// direction is always [`Direction::Forward`]; each direction of a
    /// conversation then lives in its own flow.
    pub fn from_packet(pkt: &Packet<'_>, split: bool) -> (FlowKey, Direction) {
        let (src, family) = addr_bytes(pkt.src_addr);
        let (dst, _) = addr_bytes(pkt.dst_addr);

        let forward = split || (src, pkt.src_port) <= (dst, pkt.dst_port);
        if forward {
            (
                FlowKey {
                    src_addr: src,
                    dst_addr: dst,
                    src_port: pkt.src_port,
                    dst_port: pkt.dst_port,
                    proto: pkt.proto,
                    vlan_id: pkt.vlan_id,
                    family,
                },
                Direction::Forward,
            )
        } else {
            (
                FlowKey {
                    src_addr: dst,
                    dst_addr: src,
                    src_port: pkt.dst_port,
                    dst_port: pkt.src_port,
                    proto: pkt.proto,
                    vlan_id: pkt.vlan_id,
                    family,
                },
                Direction::Reverse,
            )
        }
    }

    /// Canonical source address as an [`IpAddr`].
    pub fn src_ip(&self) -> IpAddr {
        ip_from_bytes(&self.src_addr, self.family)
    }

    /// Canonical destination address as an [`IpAddr`].
    pub fn dst_ip(&self) -> IpAddr {
        ip_from_bytes(&self.dst_addr, self.family)
    }

    /// Fixed-width byte serialisation fed to [`KeyHasher`].
    pub fn as_bytes(&self) -> [u8; KEY_BYTES] {
        let mut out = [0u8; KEY_BYTES];
        out[..16].copy_from_slice(&self.src_addr);
        out[16..32].copy_from_slice(&self.dst_addr);
        out[32..34].copy_from_slice(&self.src_port.to_le_bytes());
        out[34..36].copy_from_slice(&self.dst_port.to_le_bytes());
        out[36] = self.proto;
        out[37..39].copy_from_slice(&self.vlan_id.to_le_bytes());
        out[39] = match self.family {
            AddrFamily::V4 => 4,
            AddrFamily::V6 => 6,
        };
        out
    }
}

fn ip_from_bytes(bytes: &[u8; 16], family: AddrFamily) -> IpAddr {
    match family {
        AddrFamily::V4 => IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]]),
        AddrFamily::V6 => IpAddr::from(*bytes),
    }
}

/// Keyed non-cryptographic 64-bit hash over the canonical key bytes.
///
/// The seed is randomised once at process start (see
/// [`KeyHasher::random`]) to harden the line index against adversarial
/// collisions; tests pin it for reproducibility.
#[derive(Debug, Clone, Copy)]
pub struct KeyHasher {
    seed: u64,
}

const MIX_MUL: u64 = 0xff51_afd7_ed55_8ccd;
const SEED_MUL: u64 = 0x9e37_79b9_7f4a_7c15;

impl KeyHasher {
    /// Hasher with an explicit seed.
    pub fn new(seed: u64) -> Self {
        KeyHasher { seed }
    }

    /// Hasher with a seed drawn from the thread RNG.
    pub fn random() -> Self {
        KeyHasher {
            seed: rand::random::<u64>(),
        }
    }

    /// The seed in use; exposed so a deployment can log and replay it.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// 64-bit hash of the canonical key bytes.
    pub fn hash(&self, key: &FlowKey) -> u64 {
        let bytes = key.as_bytes();
        let mut h = self.seed ^ (KEY_BYTES as u64).wrapping_mul(SEED_MUL);
        let mut i = 0;
        while i < KEY_BYTES {
            let v = u64::from_le_bytes([
                bytes[i],
                bytes[i + 1],
                bytes[i + 2],
                bytes[i + 3],
                bytes[i + 4],
                bytes[i + 5],
                bytes[i + 6],
                bytes[i + 7],
            ]);
            h = (h ^ v).wrapping_mul(MIX_MUL).rotate_left(31);
            i += 8;
        }
        // splitmix64 finaliser
        h ^= h >> 30;
        h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h ^= h >> 27;
        h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
        h ^ (h >> 31)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IPPROTO_UDP;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Packet<'static> {
        Packet {
            timestamp: Duration::ZERO,
            src_addr: IpAddr::V4(Ipv4Addr::from(src)),
            dst_addr: IpAddr::V4(Ipv4Addr::from(dst)),
            src_port: sport,
            dst_port: dport,
            proto: IPPROTO_UDP,
            vlan_id: 0,
            tcp_flags: 0,
            len: 64,
            payload: &[],
        }
    }

    #[test]
    fn both_directions_share_the_canonical_key() {
        let fwd = udp([10, 0, 0, 1], 12345, [10, 0, 0, 2], 53);
        let rev = udp([10, 0, 0, 2], 53, [10, 0, 0, 1], 12345);

        let (k1, d1) = FlowKey::from_packet(&fwd, false);
        let (k2, d2) = FlowKey::from_packet(&rev, false);

        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let pkt = udp([192, 168, 1, 9], 443, [10, 0, 0, 1], 55555);
        let (key, _) = FlowKey::from_packet(&pkt, false);

        // Re-deriving from the canonical orientation must not swap again.
        let canonical = udp(
            [key.src_addr[0], key.src_addr[1], key.src_addr[2], key.src_addr[3]],
            key.src_port,
            [key.dst_addr[0], key.dst_addr[1], key.dst_addr[2], key.dst_addr[3]],
            key.dst_port,
        );
        let (again, dir) = FlowKey::from_packet(&canonical, false);
        assert_eq!(key, again);
        assert_eq!(dir, Direction::Forward);
    }

    #[test]
    fn split_mode_keeps_directions_apart() {
        let fwd = udp([10, 0, 0, 1], 12345, [10, 0, 0, 2], 53);
        let rev = udp([10, 0, 0, 2], 53, [10, 0, 0, 1], 12345);

        let (k1, d1) = FlowKey::from_packet(&fwd, true);
        let (k2, d2) = FlowKey::from_packet(&rev, true);

        assert_ne!(k1, k2);
        assert_eq!(d1, Direction::Forward);
        assert_eq!(d2, Direction::Forward);
    }

    #[test]
    fn equal_endpoints_stay_forward() {
        let pkt = udp([127, 0, 0, 1], 9000, [127, 0, 0, 1], 9000);
        let (_, dir) = FlowKey::from_packet(&pkt, false);
        assert_eq!(dir, Direction::Forward);
    }

    #[test]
    fn hash_is_seed_dependent_and_stable() {
        let pkt = udp([10, 0, 0, 1], 12345, [10, 0, 0, 2], 53);
        let (key, _) = FlowKey::from_packet(&pkt, false);

        let a = KeyHasher::new(1).hash(&key);
        let b = KeyHasher::new(1).hash(&key);
        let c = KeyHasher::new(2).hash(&key);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn round_trips_addresses() {
        let pkt = udp([10, 0, 0, 1], 12345, [10, 0, 0, 2], 53);
        let (key, _) = FlowKey::from_packet(&pkt, false);
        assert_eq!(key.src_ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(key.dst_ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
