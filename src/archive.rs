//! Archive - the accessor facade
//!
//! One explicit handle owns the index, the adapter registry and the decode
//! cache:
//! - Write path: rescan → Scanner → Index (cache invalidated per file)
//! - Read path: query → Planner → Index + Resolver; fetch → Decode Cache → Adapter
//!
//! Blocking work (SQLite, file walks, decoding) runs on tokio's blocking pool.

use crate::cache::{CacheStats, DecodeCache, LoadError, DEFAULT_BUDGET_BYTES};
use crate::format::{AdapterRegistry, DecodeError, Payload};
use crate::index::{IndexConfig, IndexStats, SegmentIndex};
use crate::query::{
    push_gap, AmbiguousCoverage, CoverageEntry, CoveragePlan, GapCause, PrecedencePolicy,
    QueryPlanner,
};
use crate::scan::{
    is_unchanged, FingerprintMode, ScanOptions, ScanReport, Scanner, SourceFilter,
    LAST_FULL_SCAN_KEY,
};
use crate::storage::{
    now_tick, ArchiveError, ArchiveResult, ChannelIdentity, ChannelPattern, Segment, Source,
    SourceSpec, Tick, TimeSpan, TICKS_PER_SECOND,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// When opening an archive triggers a full rescan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StalenessPolicy {
    /// Only explicit rescans
    #[default]
    Never,
    /// Rescan on every open
    Always,
    /// Rescan when the last full scan is older than this many seconds
    AfterSecs(u64),
}

impl StalenessPolicy {
    /// Decide from the tick of the last completed full scan
    pub fn is_stale(&self, last_full_scan: Option<Tick>, now: Tick) -> bool {
        match self {
            StalenessPolicy::Never => false,
            StalenessPolicy::Always => true,
            StalenessPolicy::AfterSecs(secs) => match last_full_scan {
                None => true,
                Some(last) => {
                    let max_age = (*secs as i128) * (TICKS_PER_SECOND as i128);
                    (now as i128 - last as i128) >= max_age
                }
            },
        }
    }
}

impl FromStr for StalenessPolicy {
    type Err = String;

    /// `never`, `always`, or an age such as `3600` / `3600s`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(StalenessPolicy::Never),
            "always" => Ok(StalenessPolicy::Always),
            other => other
                .trim_end_matches('s')
                .parse::<u64>()
                .map(StalenessPolicy::AfterSecs)
                .map_err(|_| format!("Invalid staleness policy: {}", s)),
        }
    }
}

/// Configuration for an archive handle
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding `index.sqlite`
    pub data_dir: PathBuf,
    pub cache_budget_bytes: usize,
    pub fingerprint: FingerprintMode,
    pub follow_links: bool,
    pub staleness: StalenessPolicy,
    pub precedence: PrecedencePolicy,
    pub reader_pool_size: usize,
    /// Sources registered (or updated) on open
    pub sources: Vec<SourceSpec>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("seisindex_data"),
            cache_budget_bytes: DEFAULT_BUDGET_BYTES,
            fingerprint: FingerprintMode::default(),
            follow_links: false,
            staleness: StalenessPolicy::default(),
            precedence: PrecedencePolicy::default(),
            reader_pool_size: IndexConfig::default().reader_pool_size,
            sources: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Builder method: add a source registered on open
    pub fn source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(spec);
        self
    }

    /// Builder method: set the cache budget
    pub fn cache_budget(mut self, bytes: usize) -> Self {
        self.cache_budget_bytes = bytes;
        self
    }

    /// Builder method: set the staleness policy
    pub fn staleness(mut self, policy: StalenessPolicy) -> Self {
        self.staleness = policy;
        self
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            fingerprint: self.fingerprint,
            follow_links: self.follow_links,
        }
    }
}

/// What a rescan covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    All,
    /// The source registered under this root
    Source(PathBuf),
}

/// Materialized coverage of one identity
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Final plan; data that failed to load shows up as gaps
    pub plan: CoveragePlan,
    /// One payload per data entry of `plan`, in order
    pub pieces: Vec<Payload>,
}

impl FetchResult {
    pub fn identity(&self) -> &ChannelIdentity {
        &self.plan.identity
    }

    pub fn gaps(&self) -> impl Iterator<Item = (TimeSpan, &GapCause)> {
        self.plan.gaps()
    }

    pub fn ambiguities(&self) -> &[AmbiguousCoverage] {
        &self.plan.ambiguities
    }

    pub fn is_complete(&self) -> bool {
        self.plan.is_complete()
    }
}

/// Combined statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub index: IndexStats,
    pub cache: CacheStats,
    pub last_full_scan: Option<Tick>,
}

impl std::fmt::Display for ArchiveStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}; Cache: {}", self.index, self.cache)
    }
}

/// Handle to an indexed archive
pub struct Archive {
    config: ArchiveConfig,
    index: Arc<SegmentIndex>,
    registry: Arc<AdapterRegistry>,
    cache: Arc<DecodeCache>,
    planner: QueryPlanner,
    /// One scan at a time per handle
    scan_lock: tokio::sync::Mutex<()>,
}

impl Archive {
    /// Open (or create) the archive index in `config.data_dir`
    ///
    /// Registers the configured sources, then applies the staleness policy.
    pub async fn open(config: ArchiveConfig, registry: AdapterRegistry) -> ArchiveResult<Self> {
        let index_config = IndexConfig {
            reader_pool_size: config.reader_pool_size,
            ..Default::default()
        };
        let data_dir = config.data_dir.clone();
        let index = tokio::task::spawn_blocking(move || {
            SegmentIndex::open_with_config(&data_dir, index_config)
        })
        .await??;
        let index = Arc::new(index);

        let archive = Self {
            planner: QueryPlanner::new(Arc::clone(&index), config.precedence.clone()),
            cache: Arc::new(DecodeCache::new(config.cache_budget_bytes)),
            registry: Arc::new(registry),
            index,
            scan_lock: tokio::sync::Mutex::new(()),
            config,
        };

        for spec in archive.config.sources.clone() {
            archive.add_source(spec).await?;
        }

        let stats = archive.stats().await?;
        info!("Opened archive at {:?}: {}", archive.config.data_dir, stats.index);

        if stats.index.sources > 0
            && archive
                .config
                .staleness
                .is_stale(stats.last_full_scan, now_tick())
        {
            info!("Index is stale, rescanning all sources");
            archive
                .rescan(ScanTarget::All, &CancellationToken::new())
                .await?;
        }

        Ok(archive)
    }

    async fn blocking<T, F>(&self, f: F) -> ArchiveResult<T>
    where
        F: FnOnce(&SegmentIndex) -> ArchiveResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || f(&index)).await?
    }

    // ==================== Sources ====================

    /// Register a source, or update the settings of an existing root
    pub async fn add_source(&self, spec: SourceSpec) -> ArchiveResult<Source> {
        if spec.root.as_os_str().is_empty() {
            return Err(ArchiveError::Config("Source root must not be empty".to_string()));
        }
        SourceFilter::new(&spec)?;
        if let Some(kind) = &spec.format {
            if self.registry.get(kind).is_none() {
                return Err(ArchiveError::Config(format!(
                    "Unknown format '{}' for source {:?}; registered: {:?}",
                    kind,
                    spec.root,
                    self.registry.kinds()
                )));
            }
        }

        let root = spec.root.clone();
        let source = self
            .blocking(move |index| {
                index.add_source(&spec)?;
                index
                    .source(&spec.root)?
                    .ok_or(ArchiveError::SourceNotFound(spec.root))
            })
            .await?;

        info!("Registered source {:?} (priority {})", root, source.spec.priority);
        Ok(source)
    }

    /// Remove a source with all its files and segments
    ///
    /// Returns the paths of the removed files.
    pub async fn remove_source(&self, root: &Path) -> ArchiveResult<Vec<PathBuf>> {
        let _scan = self.scan_lock.lock().await;

        let root = root.to_path_buf();
        let removed = self
            .blocking({
                let root = root.clone();
                move |index| index.remove_source(&root)
            })
            .await?
            .ok_or_else(|| ArchiveError::SourceNotFound(root.clone()))?;

        for path in &removed {
            self.cache.invalidate_file(path);
        }

        info!("Removed source {:?} ({} files)", root, removed.len());
        Ok(removed)
    }

    pub async fn sources(&self) -> ArchiveResult<Vec<Source>> {
        self.blocking(|index| index.sources()).await
    }

    // ==================== Scanning ====================

    /// Bring the index up to date with the files on disk
    ///
    /// Cancellation stops the scan between files; everything committed so
    /// far stays committed and the report has `cancelled` set.
    pub async fn rescan(&self, target: ScanTarget, cancel: &CancellationToken) -> ArchiveResult<ScanReport> {
        let _scan = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(ScanReport {
                    cancelled: true,
                    ..Default::default()
                })
            }
            guard = self.scan_lock.lock() => guard,
        };

        let index = Arc::clone(&self.index);
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let options = self.config.scan_options();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let scanner = Scanner::new(&index, &registry, options).with_cache(&cache);
            match target {
                ScanTarget::All => scanner.scan_all(&cancel),
                ScanTarget::Source(root) => {
                    let source = index
                        .source(&root)?
                        .ok_or(ArchiveError::SourceNotFound(root))?;
                    scanner.scan_source(&source, &cancel)
                }
            }
        })
        .await?
    }

    // ==================== Queries ====================

    /// Coverage plans, one per identity matching `pattern`
    pub async fn query(&self, pattern: &ChannelPattern, window: TimeSpan) -> ArchiveResult<Vec<CoveragePlan>> {
        if window.start >= window.end {
            return Err(ArchiveError::InvalidTimeSpan);
        }
        self.planner.plan(pattern, window).await
    }

    /// Plan and materialize the data of every matched identity
    ///
    /// Per-interval failures (vanished or changed files, decode errors)
    /// become gaps; only cancellation and internal failures abort.
    pub async fn fetch(
        &self,
        pattern: &ChannelPattern,
        window: TimeSpan,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<FetchResult>> {
        let plans = self.query(pattern, window).await?;
        let fetches = plans.into_iter().map(|plan| self.materialize(plan, cancel));
        futures_util::future::try_join_all(fetches).await
    }

    async fn materialize(&self, plan: CoveragePlan, cancel: &CancellationToken) -> ArchiveResult<FetchResult> {
        let mut entries = Vec::with_capacity(plan.entries.len());
        let mut pieces = Vec::new();

        for entry in plan.entries {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            match entry {
                CoverageEntry::Gap { span, cause } => push_gap(&mut entries, span, cause),
                CoverageEntry::Data { segment, span } => {
                    let load = payload_loader(Arc::clone(&self.registry), segment.clone());
                    match self.cache.get_or_load(&segment, span, cancel, load).await {
                        Ok(payload) => {
                            pieces.push(payload);
                            entries.push(CoverageEntry::Data { segment, span });
                        }
                        Err(LoadError::Cancelled) => return Err(ArchiveError::Cancelled),
                        Err(LoadError::Task(e)) => {
                            error!("Decode task for {} failed: {}", segment.path.display(), e);
                            return Err(ArchiveError::Task(e));
                        }
                        Err(e) => {
                            warn!(
                                "Cannot read {} for {}: {}",
                                segment.path.display(),
                                plan.identity,
                                e
                            );
                            push_gap(
                                &mut entries,
                                span,
                                GapCause::Unavailable {
                                    path: segment.path.clone(),
                                    reason: e.to_string(),
                                },
                            );
                        }
                    }
                }
            }
        }

        Ok(FetchResult {
            plan: CoveragePlan { entries, ..plan },
            pieces,
        })
    }

    /// Identities matching a pattern
    pub async fn channels(&self, pattern: &ChannelPattern) -> ArchiveResult<Vec<ChannelIdentity>> {
        let pattern = pattern.clone();
        self.blocking(move |index| index.channels(&pattern)).await
    }

    /// Overall time span of the data matching a pattern
    pub async fn time_span(&self, pattern: &ChannelPattern) -> ArchiveResult<Option<TimeSpan>> {
        let pattern = pattern.clone();
        self.blocking(move |index| index.time_span(&pattern)).await
    }

    /// Files whose last decode failed
    pub async fn unreadable_files(&self) -> ArchiveResult<Vec<PathBuf>> {
        self.blocking(|index| index.unreadable_files()).await
    }

    pub async fn stats(&self) -> ArchiveResult<ArchiveStats> {
        let (index, last_full_scan) = self
            .blocking(|index| Ok((index.stats()?, index.get_meta::<Tick>(LAST_FULL_SCAN_KEY)?)))
            .await?;

        Ok(ArchiveStats {
            index,
            cache: self.cache.stats(),
            last_full_scan,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }
}

/// Decoder for one segment, run by the cache on the blocking pool
fn payload_loader(
    registry: Arc<AdapterRegistry>,
    segment: Segment,
) -> impl Fn(TimeSpan) -> Result<Payload, DecodeError> + Clone + Send + 'static {
    move |span| {
        if !is_unchanged(&segment.path, &segment.fingerprint)? {
            return Err(DecodeError::Changed);
        }
        let adapter = registry
            .get(&segment.format)
            .ok_or_else(|| DecodeError::Unsupported(segment.format.clone()))?;
        adapter.read_payload(&segment.path, &segment.hints, span)
    }
}
