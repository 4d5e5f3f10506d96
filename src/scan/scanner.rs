use super::{fingerprint, FingerprintMode, ScanIssue, ScanReport, LAST_FULL_SCAN_KEY};
use crate::cache::DecodeCache;
use crate::format::AdapterRegistry;
use crate::index::SegmentIndex;
use crate::storage::{
    now_tick, ArchiveError, ArchiveResult, FileRecord, Source, SourceSpec,
    UNREADABLE_FORMAT,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scanner settings
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub fingerprint: FingerprintMode,
    pub follow_links: bool,
}

/// Compiled include/exclude filters of a source
#[derive(Debug, Clone)]
pub struct SourceFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl SourceFilter {
    pub fn new(spec: &SourceSpec) -> ArchiveResult<Self> {
        let compile = |pattern: &Option<String>| -> ArchiveResult<Option<Regex>> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        ArchiveError::Config(format!("Invalid filter '{}' for {:?}: {}", p, spec.root, e))
                    })
                })
                .transpose()
        };

        Ok(Self {
            include: compile(&spec.include)?,
            exclude: compile(&spec.exclude)?,
        })
    }

    /// Check a path against the filters
    pub fn accepts(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        if let Some(include) = &self.include {
            if !include.is_match(&path) {
                return false;
            }
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(&path),
            None => true,
        }
    }
}

/// Synchronous scanner over the sources of one index
///
/// Runs on a blocking thread; all index writes go through the index's
/// writer connection.
pub struct Scanner<'a> {
    index: &'a SegmentIndex,
    registry: &'a AdapterRegistry,
    cache: Option<&'a DecodeCache>,
    options: ScanOptions,
}

impl<'a> Scanner<'a> {
    pub fn new(index: &'a SegmentIndex, registry: &'a AdapterRegistry, options: ScanOptions) -> Self {
        Self {
            index,
            registry,
            cache: None,
            options,
        }
    }

    /// Builder method: invalidate this cache around every file change
    pub fn with_cache(mut self, cache: &'a DecodeCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Scan every registered source
    ///
    /// Records the completion tick unless the scan was cancelled.
    pub fn scan_all(&self, cancel: &CancellationToken) -> ArchiveResult<ScanReport> {
        let mut report = ScanReport::default();

        for source in self.index.sources()? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.merge(self.scan_source(&source, cancel)?);
        }

        if !report.cancelled {
            self.index.set_meta(LAST_FULL_SCAN_KEY, &now_tick())?;
        }

        info!("Full scan finished: {}", report);
        Ok(report)
    }

    /// Scan one source
    pub fn scan_source(&self, source: &Source, cancel: &CancellationToken) -> ArchiveResult<ScanReport> {
        let root = source.root();
        let filter = SourceFilter::new(&source.spec)?;
        let mut report = ScanReport::default();

        if let Err(e) = std::fs::metadata(root) {
            warn!("Source {} unavailable: {}", root.display(), e);
            if source.available {
                self.index.set_source_available(source.id, false)?;
            }
            report.errored.push(ScanIssue::SourceUnavailable {
                root: root.to_path_buf(),
                reason: e.to_string(),
            });
            return Ok(report);
        }

        if !source.available {
            info!("Source {} is available again", root.display());
            self.index.set_source_available(source.id, true)?;
        }

        let claims: Vec<(Source, SourceFilter)> = self
            .index
            .sources()?
            .into_iter()
            .filter_map(|s| SourceFilter::new(&s.spec).ok().map(|f| (s, f)))
            .collect();
        let known = self.index.files_for_source(source.id)?;
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut unlisted: Vec<PathBuf> = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_links)
            .sort_by_file_name();

        for entry in walker {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf);
                    warn!("Walk error under {}: {}", root.display(), e);
                    if let Some(path) = &path {
                        unlisted.push(path.clone());
                    }
                    report.errored.push(ScanIssue::WalkError {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if !filter.accepts(path) {
                continue;
            }

            seen.insert(path.to_path_buf());

            // Under nested roots the owning source's own walk indexes the file
            let owner = owning_source(path, &claims).unwrap_or(source);
            if owner.id != source.id && !known.contains_key(path) {
                continue;
            }
            self.scan_file(owner, path, &mut report)?;
        }

        // A cancelled walk has not seen every file, so nothing may be removed
        if !report.cancelled {
            for path in known.keys() {
                if seen.contains(path) || unlisted.iter().any(|dir| path.starts_with(dir)) {
                    continue;
                }
                self.remove_file(path)?;
                debug!("Removed {}", path.display());
                report.removed.push(path.clone());
            }
        }

        info!("Scanned {}: {}", root.display(), report);
        Ok(report)
    }

    /// Bring the index entry of one file up to date, recording it under `owner`
    fn scan_file(&self, owner: &Source, path: &Path, report: &mut ScanReport) -> ArchiveResult<()> {
        let stored = self.index.get_file(path)?.map(|(_, record)| record);

        // Taken before decoding, so a write racing the decode shows up on the next scan
        let fp = match fingerprint(path, self.options.fingerprint) {
            Ok(fp) => fp,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between listing and fingerprinting
                if stored.is_some() {
                    self.remove_file(path)?;
                    debug!("Removed {}", path.display());
                    report.removed.push(path.to_path_buf());
                }
                return Ok(());
            }
            Err(e) => {
                warn!("Cannot fingerprint {}: {}", path.display(), e);
                report.errored.push(ScanIssue::UnreadableFile {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        if let Some(record) = stored.as_ref().filter(|r| r.fingerprint == fp) {
            if record.source_id == owner.id {
                report.unchanged += 1;
            } else {
                // Same content, claimed by another source: keep the segments
                self.index.upsert_file(&FileRecord {
                    source_id: owner.id,
                    ..record.clone()
                })?;
                debug!("Moved {} to source {}", path.display(), owner.root().display());
                report.updated.push(path.to_path_buf());
            }
            return Ok(());
        }
        let known = stored.is_some();

        let Some(adapter) = self.registry.detect(path, owner.spec.format.as_deref()) else {
            debug!("No adapter for {}", path.display());
            report.ignored += 1;
            if known {
                self.remove_file(path)?;
                report.removed.push(path.to_path_buf());
            }
            return Ok(());
        };

        let (format, entries, failure) = match adapter.read_headers(path) {
            Ok(entries) => (adapter.kind().to_string(), entries, None),
            Err(e) => (UNREADABLE_FORMAT.to_string(), Vec::new(), Some(e.to_string())),
        };

        let record = FileRecord {
            source_id: owner.id,
            path: path.to_path_buf(),
            fingerprint: fp,
            format,
            scanned_at: now_tick(),
        };

        self.invalidate(path);
        self.index.replace_file(&record, &entries)?;
        self.invalidate(path);

        match failure {
            Some(reason) => {
                warn!("Unreadable file {}: {}", path.display(), reason);
                report.errored.push(ScanIssue::UnreadableFile {
                    path: path.to_path_buf(),
                    reason,
                });
            }
            None => {
                debug!("Indexed {} ({} segments)", path.display(), entries.len());
                if known {
                    report.updated.push(path.to_path_buf());
                } else {
                    report.added.push(path.to_path_buf());
                }
            }
        }

        Ok(())
    }

    fn remove_file(&self, path: &Path) -> ArchiveResult<()> {
        self.invalidate(path);
        self.index.delete_file(path)?;
        self.invalidate(path);
        Ok(())
    }

    fn invalidate(&self, path: &Path) {
        if let Some(cache) = self.cache {
            cache.invalidate_file(path);
        }
    }
}

/// The source a file belongs to when several roots contain it
///
/// Highest priority wins, then the deepest root, then the oldest source.
fn owning_source<'s>(path: &Path, claims: &'s [(Source, SourceFilter)]) -> Option<&'s Source> {
    claims
        .iter()
        .filter(|(source, filter)| path.starts_with(source.root()) && filter.accepts(path))
        .map(|(source, _)| source)
        .max_by(|a, b| {
            a.spec
                .priority
                .cmp(&b.spec.priority)
                .then_with(|| a.root().components().count().cmp(&b.root().components().count()))
                .then_with(|| b.id.cmp(&a.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::render_waveform;
    use crate::storage::{ChannelId, ChannelPattern, SourceSpec, TimeSpan};
    use tempfile::tempdir;

    fn write_trace(dir: &Path, name: &str, codes: &str, start: i64, n: usize) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let codes = ChannelId::parse(codes).unwrap();
        let values: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let text = format!("%TRACE\n{}", render_waveform(&codes, start, 1, &values));
        std::fs::write(&path, text).unwrap();
        path
    }

    struct Fixture {
        index: SegmentIndex,
        registry: AdapterRegistry,
        archive: tempfile::TempDir,
        _data: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let data = tempdir().unwrap();
            Self {
                index: SegmentIndex::open(data.path()).unwrap(),
                registry: AdapterRegistry::with_builtin(),
                archive: tempdir().unwrap(),
                _data: data,
            }
        }

        fn add_source(&self, spec: SourceSpec) -> Source {
            self.index.add_source(&spec).unwrap();
            self.index.source(&spec.root).unwrap().unwrap()
        }

        fn scan(&self, source: &Source) -> ScanReport {
            self.scan_with(source, ScanOptions::default())
        }

        fn scan_with(&self, source: &Source, options: ScanOptions) -> ScanReport {
            let source = self.index.source(source.root()).unwrap().unwrap();
            Scanner::new(&self.index, &self.registry, options)
                .scan_source(&source, &CancellationToken::new())
                .unwrap()
        }

        fn scan_all(&self) -> ScanReport {
            Scanner::new(&self.index, &self.registry, ScanOptions::default())
                .scan_all(&CancellationToken::new())
                .unwrap()
        }
    }

    #[test]
    fn test_idempotent_rescan() {
        let fx = Fixture::new();
        write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        write_trace(fx.archive.path(), "sub/b.trace", "GE.APE..BHN", 0, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));

        let first = fx.scan(&source);
        assert_eq!(first.added.len(), 2);
        let stats = fx.index.stats().unwrap();

        let second = fx.scan(&source);
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert!(second.errored.is_empty());
        assert_eq!(fx.index.stats().unwrap(), stats);
    }

    #[test]
    fn test_changed_file_replaced() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));
        fx.scan(&source);

        // Different length, so the size part of the fingerprint changes
        write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 20);
        let report = fx.scan(&source);
        assert_eq!(report.updated, vec![path.clone()]);

        let segments = fx.index.segments_for_file(&path).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].span, TimeSpan::new(0, 20));
    }

    #[test]
    fn test_deleted_file_removed() {
        let fx = Fixture::new();
        let a = write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        write_trace(fx.archive.path(), "b.trace", "GE.APE..BHZ", 10, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));
        fx.scan(&source);

        std::fs::remove_file(&a).unwrap();
        let report = fx.scan(&source);
        assert_eq!(report.removed, vec![a]);

        let segments = fx
            .index
            .query_segments(&ChannelPattern::all(), TimeSpan::new(0, 20))
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].span, TimeSpan::new(10, 20));
    }

    #[test]
    fn test_unreadable_file_recorded_once() {
        let fx = Fixture::new();
        write_trace(fx.archive.path(), "good.trace", "GE.APE..BHZ", 0, 10);
        let bad = fx.archive.path().join("bad.trace");
        std::fs::write(&bad, "%TRACE\n@ GE.APE..BHZ start=0 period=1\nnot-a-number\n").unwrap();
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));

        let first = fx.scan(&source);
        assert_eq!(first.added.len(), 1);
        assert_eq!(first.unreadable_files().collect::<Vec<_>>(), vec![bad.as_path()]);
        assert_eq!(fx.index.unreadable_files().unwrap(), vec![bad.clone()]);

        // Not decoded again until it changes
        let second = fx.scan(&source);
        assert!(second.errored.is_empty());
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn test_unrecognized_files_ignored() {
        let fx = Fixture::new();
        write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        std::fs::write(fx.archive.path().join("README"), "not a trace").unwrap();
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));

        let report = fx.scan(&source);
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(fx.index.stats().unwrap().files, 1);
    }

    #[test]
    fn test_include_exclude_filters() {
        let fx = Fixture::new();
        write_trace(fx.archive.path(), "keep/a.trace", "GE.APE..BHZ", 0, 10);
        write_trace(fx.archive.path(), "keep/a.trace.bak", "GE.APE..BHZ", 0, 10);
        write_trace(fx.archive.path(), "skip/b.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(
            SourceSpec::new(fx.archive.path())
                .include(r"/keep/")
                .exclude(r"\.bak$"),
        );

        let report = fx.scan(&source);
        assert_eq!(report.added.len(), 1);
        assert!(report.added[0].ends_with("keep/a.trace"));
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let spec = SourceSpec::new("/archive").include("([");
        assert!(matches!(SourceFilter::new(&spec), Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_missing_root_marks_source_unavailable() {
        let fx = Fixture::new();
        let root = fx.archive.path().join("mount");
        write_trace(&root, "a.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(SourceSpec::new(&root));
        fx.scan(&source);

        let hidden = root.with_file_name("unmounted");
        std::fs::rename(&root, &hidden).unwrap();

        let report = fx.scan(&source);
        assert_eq!(report.unavailable_sources().count(), 1);
        assert!(report.removed.is_empty());
        assert!(!fx.index.source(&root).unwrap().unwrap().available);
        assert!(fx
            .index
            .query_segments(&ChannelPattern::all(), TimeSpan::new(0, 10))
            .unwrap()
            .is_empty());

        // Coming back does not force a re-decode
        std::fs::rename(&hidden, &root).unwrap();
        let report = fx.scan(&source);
        assert!(report.is_noop());
        assert_eq!(report.unchanged, 1);
        assert!(fx.index.source(&root).unwrap().unwrap().available);
    }

    #[test]
    fn test_cancelled_scan_keeps_index() {
        let fx = Fixture::new();
        let a = write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));
        fx.scan(&source);
        std::fs::remove_file(&a).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = fx.index.source(source.root()).unwrap().unwrap();
        let report = Scanner::new(&fx.index, &fx.registry, ScanOptions::default())
            .scan_source(&source, &cancel)
            .unwrap();

        assert!(report.cancelled);
        assert!(report.removed.is_empty());
        assert_eq!(fx.index.stats().unwrap().files, 1);
    }

    #[test]
    fn test_scan_all_records_completion() {
        let fx = Fixture::new();
        write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        fx.add_source(SourceSpec::new(fx.archive.path()));

        let report = Scanner::new(&fx.index, &fx.registry, ScanOptions::default())
            .scan_all(&CancellationToken::new())
            .unwrap();
        assert_eq!(report.added.len(), 1);
        assert!(fx.index.get_meta::<i64>(LAST_FULL_SCAN_KEY).unwrap().is_some());
    }

    #[test]
    fn test_nested_roots_index_file_once() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "sub/a.trace", "GE.APE..BHZ", 0, 10);
        let outer = fx.add_source(SourceSpec::new(fx.archive.path()).priority(1));
        let inner = fx.add_source(SourceSpec::new(fx.archive.path().join("sub")).priority(2));

        let first = fx.scan_all();
        assert_eq!(first.added, vec![path.clone()]);
        let stats = fx.index.stats().unwrap();

        for _ in 0..2 {
            let again = fx.scan_all();
            assert!(again.is_noop());
            assert_eq!(again.unchanged, 1);
            assert_eq!(fx.index.stats().unwrap(), stats);
        }

        assert!(fx.index.files_for_source(outer.id).unwrap().is_empty());
        assert!(fx.index.files_for_source(inner.id).unwrap().contains_key(&path));
        let segments = fx
            .index
            .query_segments(&ChannelPattern::all(), TimeSpan::new(0, 10))
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].priority, 2);
    }

    #[test]
    fn test_higher_priority_outer_root_owns_nested_file() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "sub/a.trace", "GE.APE..BHZ", 0, 10);
        let outer = fx.add_source(SourceSpec::new(fx.archive.path()).priority(3));
        fx.add_source(SourceSpec::new(fx.archive.path().join("sub")));

        assert_eq!(fx.scan_all().added, vec![path.clone()]);
        assert!(fx.scan_all().is_noop());
        assert!(fx.index.files_for_source(outer.id).unwrap().contains_key(&path));
    }

    #[test]
    fn test_file_moves_to_new_nested_source_without_decode() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "sub/a.trace", "GE.APE..BHZ", 0, 10);
        let outer = fx.add_source(SourceSpec::new(fx.archive.path()));
        fx.scan(&outer);
        let segment_ids: Vec<_> = fx
            .index
            .segments_for_file(&path)
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();

        // Same priority: the deeper root takes over
        let inner = fx.add_source(SourceSpec::new(fx.archive.path().join("sub")));
        let report = fx.scan_all();
        assert_eq!(report.updated, vec![path.clone()]);
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());

        assert!(fx.index.files_for_source(outer.id).unwrap().is_empty());
        assert!(fx.index.files_for_source(inner.id).unwrap().contains_key(&path));
        let moved: Vec<_> = fx
            .index
            .segments_for_file(&path)
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(moved, segment_ids);

        assert!(fx.scan_all().is_noop());
    }

    #[test]
    fn test_crc_mode_detects_rewrite_with_same_size_and_mtime() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));
        let crc = ScanOptions {
            fingerprint: FingerprintMode::SizeMtimeCrc32,
            ..ScanOptions::default()
        };
        assert_eq!(fx.scan_with(&source, crc).added, vec![path.clone()]);

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let cheap = fingerprint(&path, FingerprintMode::SizeMtime).unwrap();

        // Same samples in reverse order: identical length, different bytes
        let codes = ChannelId::parse("GE.APE..BHZ").unwrap();
        let values: Vec<f64> = (0..10).rev().map(|i| i as f64).collect();
        std::fs::write(&path, format!("%TRACE\n{}", render_waveform(&codes, 0, 1, &values))).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        assert_eq!(fingerprint(&path, FingerprintMode::SizeMtime).unwrap(), cheap);

        let report = fx.scan_with(&source, crc);
        assert_eq!(report.updated, vec![path.clone()]);
        assert_eq!(report.unchanged, 0);

        assert!(fx.scan_with(&source, crc).is_noop());
    }

    #[test]
    fn test_file_vanishing_before_fingerprint_is_removed() {
        let fx = Fixture::new();
        let path = write_trace(fx.archive.path(), "a.trace", "GE.APE..BHZ", 0, 10);
        let source = fx.add_source(SourceSpec::new(fx.archive.path()));
        fx.scan(&source);

        // Listed by the walk, gone by the time it is fingerprinted
        std::fs::remove_file(&path).unwrap();
        let mut report = ScanReport::default();
        Scanner::new(&fx.index, &fx.registry, ScanOptions::default())
            .scan_file(&source, &path, &mut report)
            .unwrap();

        assert_eq!(report.removed, vec![path.clone()]);
        assert!(report.errored.is_empty());
        assert!(fx.index.get_file(&path).unwrap().is_none());
        assert!(fx.index.segments_for_file(&path).unwrap().is_empty());
    }
}
