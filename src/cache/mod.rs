//! Decode Cache
//!
//! Keeps materialized payloads warm across queries, keyed by segment id.
//! Each entry holds ordered, disjoint decoded pieces of its segment; a
//! request decodes only the sub-ranges not yet cached and merges them in.
//!
//! ```text
//! uncached ──load──► partial ──load──► complete
//!     ▲                 │                  │
//!     └──── evicted / invalidated ◄────────┘
//! ```
//!
//! Memory is bounded by a byte budget with LRU eviction over segments.

mod decode_cache;

pub use decode_cache::DecodeCache;

use crate::format::DecodeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cache budget: 256 MiB
pub const DEFAULT_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Why a cache load produced no payload
#[derive(Error, Debug)]
pub enum LoadError {
    /// The caller cancelled; nothing was inserted
    #[error("Load cancelled")]
    Cancelled,

    /// The adapter failed to decode the requested range
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The file was invalidated while the load ran; its result was discarded
    #[error("File changed while loading")]
    Superseded,

    /// The blocking decode task panicked
    #[error("Decode task failed: {0}")]
    Task(String),
}

/// How much of a segment is cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Uncached,
    Partial,
    Complete,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Requests served without decoding
    pub hits: u64,
    /// Requests that needed at least one decode
    pub misses: u64,
    /// Adapter decode calls
    pub decodes: u64,
    pub evictions: u64,
    /// Entries dropped because their file changed
    pub invalidations: u64,
    /// Loads discarded because their file changed mid-flight
    pub superseded: u64,
    pub entries: usize,
    pub bytes: usize,
    pub budget_bytes: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Entries: {}, Bytes: {}/{}, Hits: {}, Misses: {}, Decodes: {}, Evictions: {}",
            self.entries,
            self.bytes,
            self.budget_bytes,
            self.hits,
            self.misses,
            self.decodes,
            self.evictions
        )
    }
}
