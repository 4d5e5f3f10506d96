//! Coverage plan types

use crate::storage::{ChannelIdentity, Segment, SegmentId, Tick, TimeSpan};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Why a sub-interval has no data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapCause {
    /// No indexed segment covers the interval
    NoData,
    /// Only a file that has since been deleted covered the interval
    Removed { path: PathBuf },
    /// A segment covers it, but its data could not be materialized
    Unavailable { path: PathBuf, reason: String },
}

impl fmt::Display for GapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapCause::NoData => write!(f, "no data"),
            GapCause::Removed { path } => write!(f, "{} removed", path.display()),
            GapCause::Unavailable { path, reason } => {
                write!(f, "{} unavailable: {}", path.display(), reason)
            }
        }
    }
}

/// One piece of a coverage plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverageEntry {
    /// Read `span` from `segment`
    Data { segment: Segment, span: TimeSpan },
    Gap { span: TimeSpan, cause: GapCause },
}

impl CoverageEntry {
    pub fn span(&self) -> TimeSpan {
        match self {
            CoverageEntry::Data { span, .. } | CoverageEntry::Gap { span, .. } => *span,
        }
    }

    pub fn segment(&self) -> Option<&Segment> {
        match self {
            CoverageEntry::Data { segment, .. } => Some(segment),
            CoverageEntry::Gap { .. } => None,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, CoverageEntry::Gap { .. })
    }
}

/// Two overlapping segments that the precedence policy could only separate
/// by path or segment id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousCoverage {
    /// Segment chosen by the tie-break
    pub winner: SegmentId,
    pub other: SegmentId,
    /// Overlap inside the query window
    pub span: TimeSpan,
}

impl fmt::Display for AmbiguousCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segments {} and {} tie over {}, {} chosen",
            self.winner, self.other, self.span, self.winner
        )
    }
}

/// Resolved coverage of one channel identity over a window
///
/// Entries are ordered, never overlap, and their union is exactly `window`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveragePlan {
    pub identity: ChannelIdentity,
    pub window: TimeSpan,
    pub entries: Vec<CoverageEntry>,
    pub ambiguities: Vec<AmbiguousCoverage>,
}

impl CoveragePlan {
    /// Data entries as (segment, span)
    pub fn data(&self) -> impl Iterator<Item = (&Segment, TimeSpan)> {
        self.entries.iter().filter_map(|e| match e {
            CoverageEntry::Data { segment, span } => Some((segment, *span)),
            CoverageEntry::Gap { .. } => None,
        })
    }

    /// Gap entries as (span, cause)
    pub fn gaps(&self) -> impl Iterator<Item = (TimeSpan, &GapCause)> {
        self.entries.iter().filter_map(|e| match e {
            CoverageEntry::Gap { span, cause } => Some((*span, cause)),
            CoverageEntry::Data { .. } => None,
        })
    }

    /// True when the whole window is covered by data
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| !e.is_gap())
    }

    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for entry in &self.entries {
            match entry {
                CoverageEntry::Data { span, .. } => {
                    summary.covered_ticks = summary.covered_ticks.saturating_add(span.duration());
                    summary.data_entries += 1;
                }
                CoverageEntry::Gap { span, .. } => {
                    summary.gap_ticks = summary.gap_ticks.saturating_add(span.duration());
                    summary.gap_count += 1;
                }
            }
        }
        summary.ambiguities = self.ambiguities.len();
        summary
    }
}

/// Aggregate numbers of a coverage plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub covered_ticks: Tick,
    pub gap_ticks: Tick,
    pub data_entries: usize,
    pub gap_count: usize,
    pub ambiguities: usize,
}

impl CoverageSummary {
    /// Covered fraction of the window, 0.0 to 1.0
    pub fn coverage_ratio(&self) -> f64 {
        let total = self.covered_ticks.saturating_add(self.gap_ticks);
        if total == 0 {
            0.0
        } else {
            self.covered_ticks as f64 / total as f64
        }
    }
}
