//! # seisindex
//!
//! Persistent index over a heterogeneous archive of seismic data files.
//! Files are scanned once into a SQLite catalogue of time segments; queries
//! are answered from the catalogue and only the requested sub-ranges are
//! decoded, then kept in a bounded in-memory cache.
//!
//! ## Modules
//!
//! - [`format`]: Format adapters and their registry
//! - [`scan`]: Incremental content scanner
//! - [`index`]: Persistent segment index
//! - [`query`]: Coverage resolution and query planning
//! - [`cache`]: Decode cache with partial-range reuse
//! - [`archive`]: The `Archive` handle tying everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use seisindex::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ArchiveConfig::new("/var/lib/seisindex")
//!         .source(SourceSpec::new("/data/archive_old").priority(1))
//!         .source(SourceSpec::new("/data/archive_new").priority(2));
//!     let archive = Archive::open(config, AdapterRegistry::with_builtin()).await?;
//!
//!     let report = archive.rescan(ScanTarget::All, &CancellationToken::new()).await?;
//!     println!("Scan: {}", report);
//!
//!     let pattern = ChannelPattern::parse("GE.APE..BH?")?;
//!     let window = TimeSpan::from_seconds(0.0, 3600.0).ok_or("empty window")?;
//!     for result in archive.fetch(&pattern, window, &CancellationToken::new()).await? {
//!         println!("{}: {} pieces, {} gaps", result.identity(), result.pieces.len(), result.gaps().count());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cache;
pub mod config;
pub mod format;
pub mod index;
pub mod query;
pub mod scan;
pub mod storage;

// Re-export top-level types for convenience
pub use archive::{Archive, ArchiveConfig, ArchiveStats, FetchResult, ScanTarget, StalenessPolicy};

pub use cache::{CacheStats, CacheStatus, DecodeCache, LoadError};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig, SourceConfig};

pub use format::{
    AdapterRegistry, DecodeError, FormatAdapter, HeaderEntry, Payload, PayloadData, Record,
    TextTraceAdapter,
};

pub use index::{ChannelSegments, IndexConfig, IndexStats, RemovedSpan, SegmentIndex};

pub use query::{
    AmbiguousCoverage, CoverageEntry, CoveragePlan, CoverageSummary, Criterion, GapCause,
    PrecedencePolicy, QueryPlanner,
};

pub use scan::{FingerprintMode, ScanIssue, ScanOptions, ScanReport, Scanner};

pub use storage::{
    ArchiveError, ArchiveResult, ChannelId, ChannelIdentity, ChannelPattern, DataKind, Segment,
    Source, SourceSpec, Tick, TimeSpan,
};
