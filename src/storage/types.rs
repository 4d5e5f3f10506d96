//! Core data types for the seisindex archive index
//!
//! This module defines the fundamental types shared by every layer:
//! - `TimeSpan`: A half-open `[start, end)` interval in ticks
//! - `ChannelId` / `DataKind` / `ChannelIdentity`: Logical channel naming
//! - `ChannelPattern`: Glob selection over channel identities
//! - `Fingerprint`, `OffsetHints`: Change detection and extraction hints
//! - `SourceSpec`, `Source`, `FileRecord`, `Segment`: Index records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Time unit used throughout the index: nanoseconds since the Unix epoch
pub type Tick = i64;

/// Number of ticks in one second
pub const TICKS_PER_SECOND: Tick = 1_000_000_000;

/// Row id of a source in the index
pub type SourceId = i64;

/// Row id of a file record in the index
pub type FileId = i64;

/// Row id of a channel segment. Ids are never reused.
pub type SegmentId = i64;

/// Current wall-clock time in ticks
pub fn now_tick() -> Tick {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// A half-open time interval `[start, end)`
///
/// Instant records (events, picks) are represented as `[t, t + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSpan {
    /// Start tick (inclusive)
    pub start: Tick,
    /// End tick (exclusive)
    pub end: Tick,
}

impl TimeSpan {
    /// Create a new time span
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: Tick, end: Tick) -> Self {
        assert!(start < end, "TimeSpan: start must be less than end");
        Self { start, end }
    }

    /// Create a time span, returning None if invalid
    pub fn try_new(start: Tick, end: Tick) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Span of a single instant: `[t, t + 1)`
    pub fn instant(t: Tick) -> Self {
        Self {
            start: t,
            end: t.saturating_add(1),
        }
    }

    /// Build a span from floating point seconds
    pub fn from_seconds(start: f64, end: f64) -> Option<Self> {
        let to_tick = |s: f64| (s * TICKS_PER_SECOND as f64).round() as Tick;
        Self::try_new(to_tick(start), to_tick(end))
    }

    /// Check whether a tick falls inside the span
    pub fn contains(&self, t: Tick) -> bool {
        t >= self.start && t < self.end
    }

    /// Check whether `other` lies entirely inside this span
    pub fn contains_span(&self, other: &TimeSpan) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if two spans overlap. Touching spans do not overlap.
    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get intersection with another span, if any
    pub fn intersect(&self, other: &TimeSpan) -> Option<TimeSpan> {
        Self::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Length of the span in ticks
    pub fn duration(&self) -> Tick {
        self.end.saturating_sub(self.start)
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = DateTime::<Utc>::from_timestamp_nanos(self.start);
        let end = DateTime::<Utc>::from_timestamp_nanos(self.end);
        write!(
            f,
            "[{}, {})",
            start.format("%Y-%m-%dT%H:%M:%S%.9f"),
            end.format("%Y-%m-%dT%H:%M:%S%.9f")
        )
    }
}

/// What kind of content a segment carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Sampled waveform data
    Waveform,
    /// Discrete events (origins, picks)
    Event,
    /// Station epochs
    Station,
    /// Channel epochs
    Channel,
    /// Instrument response epochs
    Response,
}

impl DataKind {
    /// Get all kinds for iteration
    pub fn all() -> &'static [DataKind] {
        &[
            DataKind::Waveform,
            DataKind::Event,
            DataKind::Station,
            DataKind::Channel,
            DataKind::Response,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Waveform => "waveform",
            DataKind::Event => "event",
            DataKind::Station => "station",
            DataKind::Channel => "channel",
            DataKind::Response => "response",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waveform" => Ok(DataKind::Waveform),
            "event" => Ok(DataKind::Event),
            "station" => Ok(DataKind::Station),
            "channel" => Ok(DataKind::Channel),
            "response" => Ok(DataKind::Response),
            _ => Err(format!("Unknown data kind: {}", s)),
        }
    }
}

/// Network/station/location/channel codes of one logical stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl ChannelId {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }

    /// Parse `NET.STA.LOC.CHA`. The location code may be empty (`NET.STA..HHZ`).
    pub fn parse(codes: &str) -> Option<Self> {
        let parts: Vec<&str> = codes.split('.').collect();
        match parts.as_slice() {
            [net, sta, loc, cha] => Some(Self::new(*net, *sta, *loc, *cha)),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// Full logical identity of a stream: its kind plus its codes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub kind: DataKind,
    pub codes: ChannelId,
}

impl ChannelIdentity {
    pub fn new(kind: DataKind, codes: ChannelId) -> Self {
        Self { kind, codes }
    }

    /// Shorthand for a waveform identity
    pub fn waveform(codes: ChannelId) -> Self {
        Self::new(DataKind::Waveform, codes)
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.codes)
    }
}

/// Glob selection over channel identities
///
/// Each code component accepts `*`, `?` and `[...]` wildcards. Parsed from
/// `NET.STA.LOC.CHA`; missing trailing components match anything, and an
/// optional `kind:` prefix restricts the data kind.
///
/// ```
/// use seisindex::storage::{ChannelPattern, DataKind};
///
/// let pattern = ChannelPattern::parse("event:GE.*").unwrap();
/// assert_eq!(pattern.kind, Some(DataKind::Event));
/// assert_eq!(pattern.station, "*");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPattern {
    pub kind: Option<DataKind>,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl ChannelPattern {
    /// Pattern matching every identity
    pub fn all() -> Self {
        Self {
            kind: None,
            network: "*".to_string(),
            station: "*".to_string(),
            location: "*".to_string(),
            channel: "*".to_string(),
        }
    }

    /// Pattern matching exactly one identity
    pub fn exact(identity: &ChannelIdentity) -> Self {
        Self {
            kind: Some(identity.kind),
            network: escape_glob(&identity.codes.network),
            station: escape_glob(&identity.codes.station),
            location: escape_glob(&identity.codes.location),
            channel: escape_glob(&identity.codes.channel),
        }
    }

    /// Parse a pattern string such as `GE.*..BH?` or `waveform:GE.STA`
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let (kind, codes) = match input.split_once(':') {
            Some((kind, rest)) => (Some(kind.parse::<DataKind>()?), rest),
            None => (None, input),
        };

        let parts: Vec<&str> = if codes.is_empty() {
            Vec::new()
        } else {
            codes.split('.').collect()
        };
        if parts.len() > 4 {
            return Err(format!(
                "Channel pattern has {} components, at most 4 allowed: {}",
                parts.len(),
                input
            ));
        }

        let component = |i: usize| parts.get(i).map(|s| s.to_string()).unwrap_or_else(|| "*".to_string());

        Ok(Self {
            kind,
            network: component(0),
            station: component(1),
            location: component(2),
            channel: component(3),
        })
    }

    /// Builder method: restrict to one kind
    pub fn kind(mut self, kind: DataKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Glob for the kind column
    pub fn kind_glob(&self) -> &str {
        self.kind.map(|k| k.as_str()).unwrap_or("*")
    }
}

impl FromStr for ChannelPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = self.kind {
            write!(f, "{}:", kind)?;
        }
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

/// Escape glob metacharacters so a literal code matches only itself
fn escape_glob(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for c in code.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Cheap proxy for file content used to detect change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes
    pub size: u64,
    /// Modification time in ticks
    pub mtime: Tick,
    /// CRC32 of the content, when content hashing is enabled
    pub hash: Option<u32>,
}

/// Where a segment's data lives inside its file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetHints {
    /// Byte offset of the block holding the segment
    pub byte_offset: u64,
    /// Length of the block in bytes
    pub byte_len: u64,
    /// Index of the first sample of the segment within the block
    pub sample_offset: u64,
}

impl OffsetHints {
    pub fn new(byte_offset: u64, byte_len: u64) -> Self {
        Self {
            byte_offset,
            byte_len,
            sample_offset: 0,
        }
    }
}

/// Configuration of one scanned root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Directory (or single file) to scan
    pub root: PathBuf,
    /// Only paths matching this regex are indexed
    pub include: Option<String>,
    /// Paths matching this regex are skipped
    pub exclude: Option<String>,
    /// Higher priority wins where sources overlap
    pub priority: i32,
    /// Format kind to use instead of probing
    pub format: Option<String>,
}

impl SourceSpec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            include: None,
            exclude: None,
            priority: 0,
            format: None,
        }
    }

    /// Builder method: set priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method: set include filter
    pub fn include(mut self, regex: impl Into<String>) -> Self {
        self.include = Some(regex.into());
        self
    }

    /// Builder method: set exclude filter
    pub fn exclude(mut self, regex: impl Into<String>) -> Self {
        self.exclude = Some(regex.into());
        self
    }

    /// Builder method: set format hint
    pub fn format(mut self, kind: impl Into<String>) -> Self {
        self.format = Some(kind.into());
        self
    }
}

/// A source as stored in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub spec: SourceSpec,
    /// False while the root is missing; its segments are hidden from queries
    pub available: bool,
}

impl Source {
    pub fn root(&self) -> &Path {
        &self.spec.root
    }
}

/// Format kind recorded for files that failed to decode
pub const UNREADABLE_FORMAT: &str = "unreadable";

/// One physical file under a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub source_id: SourceId,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Format kind, or `unreadable`
    pub format: String,
    pub scanned_at: Tick,
}

impl FileRecord {
    pub fn is_unreadable(&self) -> bool {
        self.format == UNREADABLE_FORMAT
    }
}

/// The atomic metadata unit: one contiguous span of one channel in one file
///
/// Carries the owning file's path, fingerprint and precedence attributes so
/// the resolver and the cache never need to look them up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub file_id: FileId,
    pub path: PathBuf,
    pub format: String,
    pub identity: ChannelIdentity,
    pub span: TimeSpan,
    /// Sample spacing in ticks, None for event-like data
    pub sample_period: Option<Tick>,
    pub hints: OffsetHints,
    pub fingerprint: Fingerprint,
    /// Priority of the owning source
    pub priority: i32,
    /// When the owning file was last decoded
    pub scanned_at: Tick,
}
