//! Query Planner
//!
//! Turns `(pattern, window)` into one coverage plan per matched identity:
//! pattern expansion and segment lookup run in a single index snapshot,
//! then every identity is resolved on its own.

use super::plan::CoveragePlan;
use super::resolver::{mark_removed, resolve, PrecedencePolicy};
use crate::index::{ChannelSegments, SegmentIndex};
use crate::storage::{ArchiveResult, ChannelPattern, TimeSpan};
use std::sync::Arc;
use tracing::{debug, warn};

/// Plans coverage over a shared segment index
#[derive(Clone)]
pub struct QueryPlanner {
    index: Arc<SegmentIndex>,
    policy: PrecedencePolicy,
}

impl QueryPlanner {
    pub fn new(index: Arc<SegmentIndex>, policy: PrecedencePolicy) -> Self {
        Self { index, policy }
    }

    pub fn policy(&self) -> &PrecedencePolicy {
        &self.policy
    }

    /// Plan coverage, off the async runtime
    pub async fn plan(&self, pattern: &ChannelPattern, window: TimeSpan) -> ArchiveResult<Vec<CoveragePlan>> {
        let planner = self.clone();
        let pattern = pattern.clone();
        tokio::task::spawn_blocking(move || planner.plan_blocking(&pattern, window)).await?
    }

    /// Plan coverage on the current thread
    pub fn plan_blocking(&self, pattern: &ChannelPattern, window: TimeSpan) -> ArchiveResult<Vec<CoveragePlan>> {
        let channels = self.index.query_channel_segments(pattern, window)?;
        debug!(
            "Planning {} over {}: {} identities",
            pattern,
            window,
            channels.len()
        );
        Ok(plan_channels(channels, window, &self.policy))
    }
}

/// Resolve already fetched candidates into plans, keeping identity order
pub fn plan_channels(
    channels: Vec<ChannelSegments>,
    window: TimeSpan,
    policy: &PrecedencePolicy,
) -> Vec<CoveragePlan> {
    channels
        .into_iter()
        .map(|channel| {
            let resolution = resolve(&channel.segments, window, policy);
            for ambiguity in &resolution.ambiguities {
                warn!(identity = %channel.identity, "Ambiguous coverage: {}", ambiguity);
            }
            CoveragePlan {
                identity: channel.identity,
                window,
                entries: mark_removed(resolution.entries, &channel.removed),
                ambiguities: resolution.ambiguities,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HeaderEntry;
    use crate::query::{CoverageEntry, GapCause};
    use crate::storage::{
        now_tick, ChannelId, ChannelIdentity, FileRecord, Fingerprint, OffsetHints, SourceId,
        SourceSpec,
    };
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn entry(codes: &str, start: i64, end: i64) -> HeaderEntry {
        HeaderEntry {
            identity: ChannelIdentity::waveform(ChannelId::parse(codes).unwrap()),
            span: TimeSpan::new(start, end),
            sample_period: Some(1),
            hints: OffsetHints::default(),
        }
    }

    fn add_file(index: &SegmentIndex, source: SourceId, path: &str, entries: &[HeaderEntry]) {
        let record = FileRecord {
            source_id: source,
            path: PathBuf::from(path),
            fingerprint: Fingerprint {
                size: 1,
                mtime: 1,
                hash: None,
            },
            format: "text_trace".to_string(),
            scanned_at: now_tick(),
        };
        index.replace_file(&record, entries).unwrap();
    }

    fn planner() -> (QueryPlanner, Arc<SegmentIndex>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let index = Arc::new(SegmentIndex::open(dir.path()).unwrap());
        (
            QueryPlanner::new(Arc::clone(&index), PrecedencePolicy::default()),
            index,
            dir,
        )
    }

    #[tokio::test]
    async fn test_plan_picks_higher_priority_source() {
        let (planner, index, _dir) = planner();
        let old = index.add_source(&SourceSpec::new("/archive_old").priority(1)).unwrap();
        let new = index.add_source(&SourceSpec::new("/archive_new").priority(2)).unwrap();
        add_file(&index, old, "/archive_old/a", &[entry("NET.STA..HHZ", 0, 100)]);
        add_file(&index, new, "/archive_new/a", &[entry("NET.STA..HHZ", 0, 100)]);

        let plans = planner
            .plan(&ChannelPattern::parse("NET.STA..HHZ").unwrap(), TimeSpan::new(0, 100))
            .await
            .unwrap();

        assert_eq!(plans.len(), 1);
        let data: Vec<_> = plans[0].data().collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].0.path, PathBuf::from("/archive_new/a"));
        assert_eq!(data[0].1, TimeSpan::new(0, 100));
        assert!(plans[0].is_complete());
    }

    #[tokio::test]
    async fn test_plan_one_per_identity_in_order() {
        let (planner, index, _dir) = planner();
        let source = index.add_source(&SourceSpec::new("/archive")).unwrap();
        add_file(
            &index,
            source,
            "/archive/a",
            &[
                entry("GE.BBB..BHZ", 0, 100),
                entry("GE.AAA..BHZ", 50, 150),
                entry("XX.AAA..BHZ", 0, 100),
            ],
        );

        let plans = planner
            .plan(&ChannelPattern::parse("GE").unwrap(), TimeSpan::new(0, 100))
            .await
            .unwrap();

        let names: Vec<_> = plans.iter().map(|p| p.identity.codes.station.clone()).collect();
        assert_eq!(names, vec!["AAA", "BBB"]);

        let summary = plans[0].summary();
        assert_eq!(summary.covered_ticks, 50);
        assert_eq!(summary.gap_count, 1);
        assert!((summary.coverage_ratio() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_plan_edge_touching_segment_excluded() {
        let (planner, index, _dir) = planner();
        let source = index.add_source(&SourceSpec::new("/archive")).unwrap();
        add_file(&index, source, "/archive/a", &[entry("GE.APE..BHZ", 0, 50)]);

        let plans = planner
            .plan(&ChannelPattern::all(), TimeSpan::new(50, 100))
            .await
            .unwrap();

        assert_eq!(plans.len(), 1);
        assert!(matches!(
            plans[0].entries.as_slice(),
            [CoverageEntry::Gap { span, .. }] if *span == TimeSpan::new(50, 100)
        ));
    }

    #[tokio::test]
    async fn test_deleted_file_leaves_gap() {
        let (planner, index, _dir) = planner();
        let source = index.add_source(&SourceSpec::new("/archive")).unwrap();
        add_file(&index, source, "/archive/a", &[entry("GE.APE..BHZ", 0, 50)]);
        add_file(&index, source, "/archive/b", &[entry("GE.APE..BHZ", 50, 100)]);

        index.delete_file(std::path::Path::new("/archive/a")).unwrap();

        let plans = planner
            .plan(&ChannelPattern::all(), TimeSpan::new(0, 100))
            .await
            .unwrap();
        let gaps: Vec<_> = plans[0].gaps().collect();
        let data: Vec<_> = plans[0].data().map(|(_, span)| span).collect();
        assert_eq!(
            gaps,
            vec![(
                TimeSpan::new(0, 50),
                &GapCause::Removed {
                    path: "/archive/a".into()
                }
            )]
        );
        assert_eq!(data, vec![TimeSpan::new(50, 100)]);
    }

    #[tokio::test]
    async fn test_deleted_only_file_gap_split_from_never_covered_part() {
        let (planner, index, _dir) = planner();
        let source = index.add_source(&SourceSpec::new("/archive")).unwrap();
        add_file(&index, source, "/archive/a", &[entry("GE.APE..BHZ", 0, 50)]);
        index.delete_file(std::path::Path::new("/archive/a")).unwrap();

        let plans = planner
            .plan(&ChannelPattern::all(), TimeSpan::new(0, 100))
            .await
            .unwrap();
        assert_eq!(
            plans[0].entries,
            vec![
                CoverageEntry::Gap {
                    span: TimeSpan::new(0, 50),
                    cause: GapCause::Removed {
                        path: "/archive/a".into()
                    },
                },
                CoverageEntry::Gap {
                    span: TimeSpan::new(50, 100),
                    cause: GapCause::NoData,
                },
            ]
        );
    }
}
