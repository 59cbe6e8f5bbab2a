#![doc = include_str!("../README.md")]

pub mod cache;
pub mod export;
pub mod packet;
pub mod process;
pub mod stats;

// Re-export the cache surface for convenience
pub use cache::key::{AddrFamily, Direction, FlowKey, KeyHasher};
pub use cache::metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use cache::record::{DuplicateExtension, FlowRecord, TerminationReason};
pub use cache::{CacheConfig, CacheError, ConfigError, FlowCache, FlowCacheBuilder};

// Re-export the plugin contract and the built-in process plugins
pub use process::dns::{DnsExtension, DnsPlugin, DnsRecord, DnsRecordType, dns_extension_id};
pub use process::http::{HttpExtension, HttpPlugin, http_extension_id};
pub use process::{
    Extension, ExtensionId, ParserAction, ParserPipeline, ProcessPlugin, register_extension,
};

pub use export::ExportQueue;
pub use packet::Packet;
pub use stats::{InputStats, MsgHeader, OutputStats, StatsProvider, StatsServer};
