//! The flow cache: a bounded, line-associative hash table of in-progress
//! flows.
//!
//! Packets are routed to their owning flow by a canonical 5-tuple key
//! ([`key::FlowKey`]); a miss creates a flow, collisions in a full line evict
//! the line-local LRU victim, and two timeout policies (active and inactive)
//! retire idle or long-lived flows through an amortised sweep cursor.
//! Terminated flows are tagged with a [`record::TerminationReason`] and
//! pushed to the bounded [`ExportQueue`](crate::export::ExportQueue), whose
//! overflow policy drops the oldest queued record.
//!
//! One thread owns a `FlowCache` and feeds it packets sequentially;
//! parallelism is achieved by sharding capture across independent caches.
//! Nothing in the packet path blocks or allocates unboundedly.

pub mod key;
mod line;
pub mod metrics;
pub mod record;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::export::ExportQueue;
use crate::packet::Packet;
use crate::process::{ParserAction, ParserPipeline, ProcessPlugin};
use crate::stats::OutputStats;
use key::{FlowKey, KeyHasher};
use line::CacheLine;
use metrics::{CacheMetrics, CacheMetricsSnapshot};
use record::{FlowRecord, TerminationReason};

/// Default total-capacity exponent: 2^17 = 131072 slots.
pub const DEFAULT_SIZE_EXPONENT: u32 = 17;
/// Default line-size exponent: 2^4 = 16 slots per line.
pub const DEFAULT_LINE_EXPONENT: u32 = 4;
/// Default active timeout in seconds.
pub const DEFAULT_ACTIVE_TIMEOUT: u32 = 300;
/// Default inactive timeout in seconds.
pub const DEFAULT_INACTIVE_TIMEOUT: u32 = 30;
/// Default export-queue capacity in records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default number of slots visited per routed packet or tick.
///
/// Sized so that the whole cache is swept within one inactive timeout at
/// modest packet rates: 16 slots × 1 kpps covers the default 2^17 slots well
/// inside the default 30 s inactive window. Raise it for larger caches or
/// slower links.
pub const DEFAULT_SWEEP_STEP: usize = 16;

/// Cache construction parameters. Validated by [`FlowCacheBuilder::build`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total capacity exponent `e`: `N = 2^e` slots, `4 ≤ e ≤ 30`.
    pub size_exponent: u32,
    /// Line-size exponent `l`: `L = 2^l` slots per line, `l ≤ e`.
    pub line_exponent: u32,
    /// Active timeout in seconds, at least 1.
    pub active_secs: u32,
    /// Inactive timeout in seconds, at least 1.
    pub inactive_secs: u32,
    /// Keep each direction as its own flow instead of merging biflows.
    pub split_directions: bool,
    /// Export-queue capacity in records, at least 1.
    pub queue_capacity: usize,
    /// Slots visited per routed packet or explicit tick, at least 1.
    pub sweep_step: usize,
    /// Cap on records in flight (live + queued). Defaults to `N + queue
    /// capacity`, which is structurally unreachable.
    pub max_in_flight: Option<usize>,
    /// Pinned hash seed; defaults to a random per-process seed.
    pub hash_seed: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size_exponent: DEFAULT_SIZE_EXPONENT,
            line_exponent: DEFAULT_LINE_EXPONENT,
            active_secs: DEFAULT_ACTIVE_TIMEOUT,
            inactive_secs: DEFAULT_INACTIVE_TIMEOUT,
            split_directions: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sweep_step: DEFAULT_SWEEP_STEP,
            max_in_flight: None,
            hash_seed: None,
        }
    }
}

/// Rejected cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `size` exponent outside `4..=30`.
    SizeExponentOutOfRange(u32),
    /// `line` exponent exceeds the `size` exponent.
    LineExponentTooLarge { line: u32, size: u32 },
    /// Active timeout below one second.
    ActiveTimeoutTooShort(u32),
    /// Inactive timeout below one second.
    InactiveTimeoutTooShort(u32),
    /// Export queue must hold at least one record.
    ZeroQueueCapacity,
    /// Sweep must advance at least one slot.
    ZeroSweepStep,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::SizeExponentOutOfRange(e) => {
                write!(f, "cache size exponent {} must be between 4 and 30", e)
            }
            ConfigError::LineExponentTooLarge { line, size } => {
                write!(
                    f,
                    "line exponent {} must not exceed size exponent {}",
                    line, size
                )
            }
            ConfigError::ActiveTimeoutTooShort(s) => {
                write!(f, "active timeout {} s must be at least 1 s", s)
            }
            ConfigError::InactiveTimeoutTooShort(s) => {
                write!(f, "inactive timeout {} s must be at least 1 s", s)
            }
            ConfigError::ZeroQueueCapacity => write!(f, "export queue capacity must be at least 1"),
            ConfigError::ZeroSweepStep => write!(f, "sweep step must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime refusal from the packet path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The cache has been shut down and refuses new packets.
    ShutDown,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::ShutDown => write!(f, "flow cache is shut down"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Builder for configuring and constructing a [`FlowCache`].
///
/// # Examples
///
/// ```rust
/// use flowprobe::FlowCache;
///
/// let cache = FlowCache::builder()
///     .with_size_exponent(10)
///     .with_line_exponent(2)
///     .with_active_timeout(300)
///     .with_inactive_timeout(30)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(cache.capacity(), 1024);
/// ```
#[derive(Default)]
pub struct FlowCacheBuilder {
    config: CacheConfig,
    pipeline: ParserPipeline,
}

impl std::fmt::Debug for FlowCacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowCacheBuilder")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl FlowCacheBuilder {
    /// Sets the total-capacity exponent (`N = 2^e`, `4 ≤ e ≤ 30`).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_size_exponent(mut self, exponent: u32) -> Self {
        self.config.size_exponent = exponent;
        self
    }

    /// Sets the line-size exponent (`L = 2^l`, `l ≤ e`).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_line_exponent(mut self, exponent: u32) -> Self {
        self.config.line_exponent = exponent;
        self
    }

    /// Sets the active timeout in seconds (≥ 1).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_active_timeout(mut self, seconds: u32) -> Self {
        self.config.active_secs = seconds;
        self
    }

    /// Sets the inactive timeout in seconds (≥ 1).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_inactive_timeout(mut self, seconds: u32) -> Self {
        self.config.inactive_secs = seconds;
        self
    }

    /// Keeps each direction in its own flow instead of merging biflows.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_split_directions(mut self, split: bool) -> Self {
        self.config.split_directions = split;
        self
    }

    /// Sets the export-queue capacity in records (≥ 1).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets how many slots each routed packet or tick sweeps (≥ 1).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_sweep_step(mut self, step: usize) -> Self {
        self.config.sweep_step = step;
        self
    }

    /// Caps records in flight (live + queued); packets needing a record
    /// beyond the cap are dropped and counted, never evicted for.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_max_in_flight(mut self, cap: usize) -> Self {
        self.config.max_in_flight = Some(cap);
        self
    }

    /// Pins the hash seed; by default a random per-process seed is drawn.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.config.hash_seed = Some(seed);
        self
    }

    /// Registers a process plugin; hooks run in registration order.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn register_parser(mut self, plugin: Box<dyn ProcessPlugin>) -> Self {
        self.pipeline.register(plugin);
        self
    }

    /// Validates the configuration and builds the cache.
    pub fn build(self) -> Result<FlowCache, ConfigError> {
        let cfg = &self.config;
        if !(4..=30).contains(&cfg.size_exponent) {
            return Err(ConfigError::SizeExponentOutOfRange(cfg.size_exponent));
        }
        if cfg.line_exponent > cfg.size_exponent {
            return Err(ConfigError::LineExponentTooLarge {
                line: cfg.line_exponent,
                size: cfg.size_exponent,
            });
        }
        if cfg.active_secs < 1 {
            return Err(ConfigError::ActiveTimeoutTooShort(cfg.active_secs));
        }
        if cfg.inactive_secs < 1 {
            return Err(ConfigError::InactiveTimeoutTooShort(cfg.inactive_secs));
        }
        if cfg.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if cfg.sweep_step == 0 {
            return Err(ConfigError::ZeroSweepStep);
        }

        let capacity = 1usize << cfg.size_exponent;
        let line_width = 1usize << cfg.line_exponent;
        let num_lines = capacity / line_width;
        let mut lines = Vec::with_capacity(num_lines);
        lines.resize_with(num_lines, || CacheLine::new(line_width));

        let hasher = match cfg.hash_seed {
            Some(seed) => KeyHasher::new(seed),
            None => KeyHasher::random(),
        };

        Ok(FlowCache {
            lines,
            line_width,
            line_shift: cfg.line_exponent,
            line_mask: (num_lines as u64) - 1,
            hasher,
            pipeline: self.pipeline,
            queue: ExportQueue::new(cfg.queue_capacity),
            metrics: Arc::new(CacheMetrics::new()),
            active: Duration::from_secs(u64::from(cfg.active_secs)),
            inactive: Duration::from_secs(u64::from(cfg.inactive_secs)),
            split: cfg.split_directions,
            sweep_step: cfg.sweep_step,
            sweep_cursor: 0,
            max_in_flight: cfg
                .max_in_flight
                .unwrap_or(capacity + cfg.queue_capacity),
            in_flight: 0,
            shut_down: false,
        })
    }
}

/// The flow cache. See the [module docs](self) for the overall model.
pub struct FlowCache {
    lines: Vec<CacheLine>,
    line_width: usize,
    line_shift: u32,
    line_mask: u64,
    hasher: KeyHasher,
    pipeline: ParserPipeline,
    queue: ExportQueue,
    metrics: Arc<CacheMetrics>,
    active: Duration,
    inactive: Duration,
    split: bool,
    sweep_step: usize,
    sweep_cursor: usize,
    max_in_flight: usize,
    in_flight: usize,
    shut_down: bool,
}

impl std::fmt::Debug for FlowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowCache")
            .field("capacity", &(self.lines.len() * self.line_width))
            .field("line_width", &self.line_width)
            .field("active", &self.active)
            .field("inactive", &self.inactive)
            .field("split", &self.split)
            .field("queued", &self.queue.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl FlowCache {
    /// Creates a new builder for configuring a [`FlowCache`].
    pub fn builder() -> FlowCacheBuilder {
        FlowCacheBuilder::default()
    }

    /// Routes one packet: updates its owning flow, creating one on miss,
    /// and advances the timeout sweep by the configured step.
    ///
    /// Refuses packets after [`shutdown`](Self::shutdown).
    pub fn put_packet(&mut self, pkt: &Packet<'_>) -> Result<(), CacheError> {
        if self.shut_down {
            return Err(CacheError::ShutDown);
        }
        self.route(pkt);
        self.advance_sweep(pkt.timestamp, self.sweep_step);
        Ok(())
    }

    /// Drives the timeout sweep under packet drought. Call from a periodic
    /// tick when the capture source is idle.
    pub fn tick(&mut self, now: Duration) {
        self.advance_sweep(now, self.sweep_step);
    }

    /// Cooperative shutdown: refuse new packets, terminate every live flow
    /// (timeouts that already elapsed keep their timeout reason, the rest
    /// are tagged [`TerminationReason::Shutdown`]) and leave the export
    /// queue for the consumer to drain.
    pub fn shutdown(&mut self, now: Duration) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let mut terminated = 0u64;
        for li in 0..self.lines.len() {
            while let Some(rec) = self.lines[li].take(0) {
                let reason = if now.saturating_sub(rec.first_seen) >= self.active {
                    self.metrics.record_active_timeout();
                    TerminationReason::ActiveTimeout
                } else if now.saturating_sub(rec.last_seen) >= self.inactive {
                    self.metrics.record_inactive_timeout();
                    TerminationReason::InactiveTimeout
                } else {
                    TerminationReason::Shutdown
                };
                self.finish_record(rec, reason, now);
                terminated += 1;
            }
        }
        info!(terminated, queued = self.queue.len(), "flow cache shut down");
    }

    /// Dequeues the oldest terminated flow, FIFO. The exporter consumer side
    /// of the hand-off ring.
    pub fn pop_exported(&mut self) -> Option<Box<FlowRecord>> {
        let rec = self.queue.pop();
        if rec.is_some() {
            self.in_flight -= 1;
        }
        rec
    }

    /// Terminated flows currently waiting in the export queue.
    pub fn exported_len(&self) -> usize {
        self.queue.len()
    }

    /// Total slot capacity `N`.
    pub fn capacity(&self) -> usize {
        self.lines.len() * self.line_width
    }

    /// Slots per line `L`.
    pub fn line_width(&self) -> usize {
        self.line_width
    }

    /// Number of lines `N / L`.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// The line a key resolves to; introspection for tests and diagnostics.
    pub fn line_index_of(&self, key: &FlowKey) -> usize {
        self.line_for(self.hasher.hash(key))
    }

    /// The keyed hasher in use.
    pub fn hasher(&self) -> &KeyHasher {
        &self.hasher
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Shared handle to the cache counters, for the stats server.
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Point-in-time counter snapshot.
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Exporter-side statistics for the stats socket.
    pub fn output_stats(&self) -> OutputStats {
        let snap = self.metrics.snapshot();
        OutputStats {
            biflows: snap.exported_biflows,
            packets: snap.exported_packets,
            bytes: snap.exported_bytes,
            dropped: snap.queue_overflow,
        }
    }

    #[inline]
    fn line_for(&self, hash: u64) -> usize {
        ((hash >> self.line_shift) & self.line_mask) as usize
    }

    fn route(&mut self, pkt: &Packet<'_>) {
        let now = pkt.timestamp;
        let (key, direction) = FlowKey::from_packet(pkt, self.split);
        let li = self.line_for(self.hasher.hash(&key));

        // One reinsertion per packet; a second FlushWithReinsert degrades to
        // Flush. Implemented iteratively, never by recursing into routing.
        let mut reinsert_budget = 1u8;

        loop {
            let Some(pos) = self.lines[li].find(&key) else {
                self.create_flow(pkt, key, direction, li, now);
                return;
            };

            // Active timeout is checked inline so the packet that crosses
            // the boundary opens the successor flow.
            let expired = self.lines[li]
                .peek(pos)
                .map(|rec| now.saturating_sub(rec.first_seen) >= self.active)
                .unwrap_or(false);
            if expired {
                if let Some(rec) = self.lines[li].take(pos) {
                    self.metrics.record_active_timeout();
                    self.finish_record(rec, TerminationReason::ActiveTimeout, now);
                }
                continue;
            }

            self.metrics.record_hit();
            self.lines[li].promote(pos);

            let Some(rec) = self.lines[li].peek_mut(0) else {
                unreachable!("promoted slot must be occupied");
            };
            let pre = self.pipeline.pre_update(rec, pkt);

            match pre {
                ParserAction::FlushWithReinsert if reinsert_budget > 0 => {
                    reinsert_budget -= 1;
                    self.metrics.record_reinsertion();
                    self.metrics.record_flush();
                    if let Some(rec) = self.lines[li].take(0) {
                        self.finish_record(rec, TerminationReason::ForcedEnd, now);
                    }
                    continue;
                }
                ParserAction::FlushWithReinsert | ParserAction::Flush => {
                    self.metrics.record_flush();
                    if let Some(rec) = self.lines[li].take(0) {
                        self.finish_record(rec, TerminationReason::ForcedEnd, now);
                    }
                    return;
                }
                pre => {
                    let Some(rec) = self.lines[li].peek_mut(0) else {
                        unreachable!("promoted slot must be occupied");
                    };
                    rec.update(pkt, direction);
                    let post = self.pipeline.post_update(rec, pkt);

                    if pre == ParserAction::Export || post == ParserAction::Export {
                        self.metrics.record_forced_export();
                        if let Some(rec) = self.lines[li].take(0) {
                            self.finish_record(rec, TerminationReason::ForcedEnd, now);
                        }
                    } else if pkt.ends_flow() {
                        if let Some(rec) = self.lines[li].take(0) {
                            self.finish_record(rec, TerminationReason::EndOfFlow, now);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn create_flow(
        &mut self,
        pkt: &Packet<'_>,
        key: FlowKey,
        direction: key::Direction,
        li: usize,
        now: Duration,
    ) {
        if self.pipeline.pre_create(pkt) == ParserAction::Decline {
            return;
        }
        self.metrics.record_miss();

        if self.in_flight >= self.max_in_flight {
            self.metrics.record_no_resource();
            debug!(in_flight = self.in_flight, "record budget exhausted, packet dropped");
            return;
        }

        if self.lines[li].is_full() {
            self.metrics.record_non_empty_lookup();
            if let Some(victim) = self.lines[li].evict_lru() {
                self.metrics.record_eviction();
                trace!(line = li, "evicting LRU victim");
                self.finish_record(victim, TerminationReason::Evicted, now);
            }
        } else {
            self.metrics.record_empty_lookup();
        }

        let rec = Box::new(FlowRecord::new(key, pkt, direction));
        self.in_flight += 1;
        self.metrics.flow_created();
        self.lines[li].insert_front(rec);

        let Some(rec) = self.lines[li].peek_mut(0) else {
            unreachable!("freshly inserted slot must be occupied");
        };
        let post = self.pipeline.post_create(rec, pkt);

        if post == ParserAction::Export {
            self.metrics.record_forced_export();
            if let Some(rec) = self.lines[li].take(0) {
                self.finish_record(rec, TerminationReason::ForcedEnd, now);
            }
        } else if pkt.ends_flow() {
            if let Some(rec) = self.lines[li].take(0) {
                self.finish_record(rec, TerminationReason::EndOfFlow, now);
            }
        }
    }

    /// Runs finish hooks, tags the record and hands it to the export queue,
    /// applying the drop-oldest overflow policy.
    fn finish_record(&mut self, mut rec: Box<FlowRecord>, reason: TerminationReason, now: Duration) {
        self.pipeline.on_finish(&mut rec, reason);
        rec.terminate(reason, now);
        self.metrics.flow_removed();
        self.metrics
            .record_export(rec.total_packets(), rec.total_bytes());
        if let Some(dropped) = self.queue.push(rec) {
            self.metrics.record_queue_overflow();
            self.in_flight -= 1;
            trace!(key = ?dropped.key(), "export queue overflow, oldest record dropped");
        }
    }

    fn advance_sweep(&mut self, now: Duration, steps: usize) {
        let total = self.lines.len() * self.line_width;
        let mut remaining = steps;
        while remaining > 0 {
            let li = self.sweep_cursor / self.line_width;
            let si = self.sweep_cursor % self.line_width;

            let verdict = self.lines[li].peek(si).and_then(|rec| {
                if now.saturating_sub(rec.first_seen) >= self.active {
                    Some(TerminationReason::ActiveTimeout)
                } else if now.saturating_sub(rec.last_seen) >= self.inactive {
                    Some(TerminationReason::InactiveTimeout)
                } else {
                    None
                }
            });

            match verdict {
                Some(reason) => {
                    if let Some(rec) = self.lines[li].take(si) {
                        match reason {
                            TerminationReason::ActiveTimeout => {
                                self.metrics.record_active_timeout()
                            }
                            _ => self.metrics.record_inactive_timeout(),
                        }
                        self.finish_record(rec, reason, now);
                    }
                    // The line compacted; the same index now holds the next
                    // record, so the cursor stays put for this step.
                }
                None => {
                    self.sweep_cursor = (self.sweep_cursor + 1) % total;
                }
            }
            remaining -= 1;
        }
    }
}
