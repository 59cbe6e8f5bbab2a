//! Per-biflow statistics record and its parser-owned extension chain.

use std::time::Duration;

use serde::Serialize;

use crate::cache::key::{Direction, FlowKey};
use crate::packet::Packet;
use crate::process::{Extension, ExtensionId};

/// Why a flow left the cache. Carried on the exported record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    /// TCP FIN or RST observed.
    EndOfFlow,
    /// Flow exceeded the active timeout since its first packet.
    ActiveTimeout,
    /// No packet within the inactive timeout.
    InactiveTimeout,
    /// Displaced by a newcomer in a full cache line.
    Evicted,
    /// A process plugin requested export or flush.
    ForcedEnd,
    /// Cache shutdown.
    Shutdown,
    /// Record could not be allocated.
    NoResource,
}

/// Attaching an extension id that is already present on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateExtension {
    /// The id that was already attached.
    pub id: ExtensionId,
}

impl std::fmt::Display for DuplicateExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "extension id {} already attached to flow", self.id.0)
    }
}

impl std::error::Error for DuplicateExtension {}

/// Aggregated state of one (bi)flow while it sits in the cache and after it
/// is handed to the export queue.
///
/// Mutated only by the cache; process plugins reach it through the hook
/// arguments. The extension list is ordered by attachment and holds at most
/// one entry per registered [`ExtensionId`].
#[derive(Debug, Serialize)]
pub struct FlowRecord {
    key: FlowKey,
    /// Timestamp of the first packet.
    pub first_seen: Duration,
    /// Timestamp of the most recent packet.
    pub last_seen: Duration,
    packets: [u64; 2],
    bytes: [u64; 2],
    tcp_flags: [u8; 2],
    last_direction: Direction,
    termination: Option<TerminationReason>,
    terminated_at: Option<Duration>,
    #[serde(skip)]
    extensions: Vec<Box<dyn Extension>>,
}

impl FlowRecord {
    /// Fresh record seeded from the flow's first packet.
    pub fn new(key: FlowKey, pkt: &Packet<'_>, direction: Direction) -> Self {
        let mut packets = [0u64; 2];
        let mut bytes = [0u64; 2];
        let mut tcp_flags = [0u8; 2];
        packets[direction.index()] = 1;
        bytes[direction.index()] = u64::from(pkt.len);
        tcp_flags[direction.index()] = pkt.tcp_flags;

        FlowRecord {
            key,
            first_seen: pkt.timestamp,
            last_seen: pkt.timestamp,
            packets,
            bytes,
            tcp_flags,
            last_direction: direction,
            termination: None,
            terminated_at: None,
            extensions: Vec::new(),
        }
    }

    /// Accumulates a subsequent packet into the given direction.
    pub fn update(&mut self, pkt: &Packet<'_>, direction: Direction) {
        let i = direction.index();
        self.packets[i] += 1;
        self.bytes[i] += u64::from(pkt.len);
        self.tcp_flags[i] |= pkt.tcp_flags;
        self.last_direction = direction;
        if pkt.timestamp > self.last_seen {
            self.last_seen = pkt.timestamp;
        }
    }

    /// Tags the record with its termination reason and time. Called once by
    /// the cache immediately before the record moves to the export queue.
    pub(crate) fn terminate(&mut self, reason: TerminationReason, now: Duration) {
        self.termination = Some(reason);
        self.terminated_at = Some(now.max(self.last_seen));
    }

    /// The canonical key.
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Packets seen in the forward direction.
    pub fn packets_fwd(&self) -> u64 {
        self.packets[0]
    }

    /// Packets seen in the reverse direction.
    pub fn packets_rev(&self) -> u64 {
        self.packets[1]
    }

    /// Bytes seen in the forward direction.
    pub fn bytes_fwd(&self) -> u64 {
        self.bytes[0]
    }

    /// Bytes seen in the reverse direction.
    pub fn bytes_rev(&self) -> u64 {
        self.bytes[1]
    }

    /// Union of TCP flags seen forward.
    pub fn tcp_flags_fwd(&self) -> u8 {
        self.tcp_flags[0]
    }

    /// Union of TCP flags seen reverse.
    pub fn tcp_flags_rev(&self) -> u8 {
        self.tcp_flags[1]
    }

    /// Direction of the most recent packet.
    pub fn last_direction(&self) -> Direction {
        self.last_direction
    }

    /// Total packets, both directions.
    pub fn total_packets(&self) -> u64 {
        self.packets[0] + self.packets[1]
    }

    /// Total bytes, both directions.
    pub fn total_bytes(&self) -> u64 {
        self.bytes[0] + self.bytes[1]
    }

    /// Termination reason, set once the record left the cache.
    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Time of termination, set together with the reason.
    pub fn terminated_at(&self) -> Option<Duration> {
        self.terminated_at
    }

    /// Attaches an extension. At most one extension per id may exist on a
    /// record; a duplicate is rejected.
    pub fn add_extension(
        &mut self,
        ext: Box<dyn Extension>,
    ) -> Result<(), DuplicateExtension> {
        let id = ext.id();
        if self.extensions.iter().any(|e| e.id() == id) {
            return Err(DuplicateExtension { id });
        }
        self.extensions.push(ext);
        Ok(())
    }

    /// Looks up an extension by id. Linear scan; the list is short.
    pub fn get_extension(&self, id: ExtensionId) -> Option<&dyn Extension> {
        self.extensions
            .iter()
            .find(|e| e.id() == id)
            .map(|e| e.as_ref())
    }

    /// Mutable lookup by id.
    pub fn get_extension_mut(&mut self, id: ExtensionId) -> Option<&mut dyn Extension> {
        self.extensions
            .iter_mut()
            .find(|e| e.id() == id)
            .map(|e| e.as_mut())
    }

    /// Typed lookup, downcasting the extension to its concrete type.
    pub fn extension<T: 'static>(&self, id: ExtensionId) -> Option<&T> {
        self.get_extension(id).and_then(|e| e.as_any().downcast_ref())
    }

    /// Typed mutable lookup.
    pub fn extension_mut<T: 'static>(&mut self, id: ExtensionId) -> Option<&mut T> {
        self.extensions
            .iter_mut()
            .find(|e| e.id() == id)
            .and_then(|e| e.as_any_mut().downcast_mut())
    }

    /// Ids of all attached extensions, in attachment order.
    pub fn extension_ids(&self) -> impl Iterator<Item = ExtensionId> + '_ {
        self.extensions.iter().map(|e| e.id())
    }
}
