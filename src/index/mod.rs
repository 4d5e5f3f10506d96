//! Persistent Index
//!
//! SQLite-backed store of sources, file records and channel segments.
//!
//! # Time lookups
//!
//! Every segment is filed under a duration scale `kscale = ceil(log2(duration))`.
//! A segment with scale `k` that overlaps `[start, end)` must begin after
//! `start - 2^k`, so a window query becomes one bounded B-tree range per scale:
//!
//! ```text
//! Query: GE.*..BHZ in [t0, t1)
//!        ↓
//! channels: GLOB per code → [ch 3, ch 7]           (small table)
//!        ↓
//! segments: for ch, for k in kscale_mask(ch):
//!           channel_id = ch AND kscale = k AND tmin ∈ (t0 - 2^k, t1) AND tmax > t0
//!        ↓
//! Only overlapping rows are touched → sublinear in archive size
//! ```

mod segment_index;

pub use segment_index::{IndexConfig, SegmentIndex};

use crate::storage::{ChannelIdentity, Segment, Tick, TimeSpan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Duration scale of a segment: smallest `k` with `duration <= 2^k`
pub fn kscale(duration: Tick) -> u32 {
    if duration <= 1 {
        0
    } else {
        64 - ((duration - 1) as u64).leading_zeros()
    }
}

/// Lower bound (exclusive) on `tmin` for segments of scale `k` overlapping a window starting at `start`
pub fn kscale_lower_bound(start: Tick, k: u32) -> Tick {
    if k >= 63 {
        Tick::MIN
    } else {
        start.saturating_sub(1i64 << k)
    }
}

/// Segments of one channel identity, ordered by start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSegments {
    pub identity: ChannelIdentity,
    pub segments: Vec<Segment>,
    /// Spans once covered by files that have since been deleted, by start
    pub removed: Vec<RemovedSpan>,
}

/// Interval a deleted file used to cover for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedSpan {
    pub path: PathBuf,
    pub span: TimeSpan,
}

/// Statistics about the index contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub sources: u64,
    pub unavailable_sources: u64,
    pub files: u64,
    pub unreadable_files: u64,
    pub channels: u64,
    pub segments: u64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sources: {} ({} unavailable), Files: {} ({} unreadable), Channels: {}, Segments: {}",
            self.sources,
            self.unavailable_sources,
            self.files,
            self.unreadable_files,
            self.channels,
            self.segments
        )
    }
}
