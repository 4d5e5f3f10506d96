//! Shared records and errors
//!
//! - **types**: Time spans, channel identities, patterns and index records
//! - **error**: The crate-wide error type

pub mod error;
pub mod types;

pub use error::{ArchiveError, ArchiveResult};
pub use types::{
    now_tick, ChannelId, ChannelIdentity, ChannelPattern, DataKind, FileId, FileRecord,
    Fingerprint, OffsetHints, Segment, SegmentId, Source, SourceId, SourceSpec, Tick, TimeSpan,
    TICKS_PER_SECOND, UNREADABLE_FORMAT,
};
