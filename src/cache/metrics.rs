//! Flow-cache counters and their externally readable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters maintained by the cache on the packet path.
///
/// All counters use atomic operations so an external reader (the stats
/// socket server) can snapshot them while the owning thread keeps routing
/// packets. Snapshots are not globally atomic; each counter is read
/// atomically on its own.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that matched an existing flow.
    pub hits: AtomicU64,
    /// Lookups that created a flow (counted after `pre_create` consent).
    pub misses: AtomicU64,
    /// Miss-path lookups that found a free slot in the target line.
    pub empty_lookups: AtomicU64,
    /// Miss-path lookups that required an eviction.
    pub non_empty_lookups: AtomicU64,
    /// Flows displaced by a newcomer in a full line.
    pub evictions: AtomicU64,
    /// Flows terminated by the active timeout.
    pub timeouts_active: AtomicU64,
    /// Flows terminated by the inactive timeout.
    pub timeouts_inactive: AtomicU64,
    /// Flows terminated because a plugin returned `Export`.
    pub forced_exports: AtomicU64,
    /// Flows terminated because a plugin returned `Flush` (either form).
    pub flushes: AtomicU64,
    /// Oldest queued records dropped by a full export queue.
    pub queue_overflow: AtomicU64,
    /// Packets re-routed after `FlushWithReinsert`.
    pub reinsertions: AtomicU64,
    /// Packets dropped because the record budget was exhausted.
    pub no_resource: AtomicU64,
    /// Gauge: flows currently occupying cache slots.
    pub flows_alive: AtomicU64,
    /// Cumulative flows handed to the export queue.
    pub exported_biflows: AtomicU64,
    /// Cumulative packet count over all exported flows.
    pub exported_packets: AtomicU64,
    /// Cumulative byte count over all exported flows.
    pub exported_bytes: AtomicU64,
}

impl CacheMetrics {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_empty_lookup(&self) {
        self.empty_lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_non_empty_lookup(&self) {
        self.non_empty_lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_active_timeout(&self) {
        self.timeouts_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_inactive_timeout(&self) {
        self.timeouts_inactive.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_forced_export(&self) {
        self.forced_exports.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_queue_overflow(&self) {
        self.queue_overflow.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reinsertion(&self) {
        self.reinsertions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_no_resource(&self) {
        self.no_resource.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn flow_created(&self) {
        self.flows_alive.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn flow_removed(&self) {
        self.flows_alive.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_export(&self, packets: u64, bytes: u64) {
        self.exported_biflows.fetch_add(1, Ordering::Relaxed);
        self.exported_packets.fetch_add(packets, Ordering::Relaxed);
        self.exported_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            empty_lookups: self.empty_lookups.load(Ordering::Relaxed),
            non_empty_lookups: self.non_empty_lookups.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            timeouts_active: self.timeouts_active.load(Ordering::Relaxed),
            timeouts_inactive: self.timeouts_inactive.load(Ordering::Relaxed),
            forced_exports: self.forced_exports.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            queue_overflow: self.queue_overflow.load(Ordering::Relaxed),
            reinsertions: self.reinsertions.load(Ordering::Relaxed),
            no_resource: self.no_resource.load(Ordering::Relaxed),
            flows_alive: self.flows_alive.load(Ordering::Relaxed),
            exported_biflows: self.exported_biflows.load(Ordering::Relaxed),
            exported_packets: self.exported_packets.load(Ordering::Relaxed),
            exported_bytes: self.exported_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`CacheMetrics`] at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub empty_lookups: u64,
    pub non_empty_lookups: u64,
    pub evictions: u64,
    pub timeouts_active: u64,
    pub timeouts_inactive: u64,
    pub forced_exports: u64,
    pub flushes: u64,
    pub queue_overflow: u64,
    pub reinsertions: u64,
    pub no_resource: u64,
    pub flows_alive: u64,
    pub exported_biflows: u64,
    pub exported_packets: u64,
    pub exported_bytes: u64,
}

impl CacheMetricsSnapshot {
    /// Cache hit rate (0.0 to 1.0), `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }

    /// Total lookups that matched or created a flow.
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}
