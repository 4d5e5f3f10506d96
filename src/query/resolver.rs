//! Coverage Resolver
//!
//! Selects, for every instant of a window, the single segment that takes
//! precedence among the candidates of one channel identity.
//!
//! ```text
//! candidates ──clip to window──► boundaries b0 < b1 < ... < bn
//!                                 │
//! sweep [b_i, b_i+1):  push segments starting at b_i (max-heap by rank)
//!                      pop expired tops (end <= b_i)
//!                      top → Data, empty → Gap
//!                                 │
//! merge adjacent pieces of the same segment / adjacent gaps
//! ```
//!
//! O(n log n) in the number of candidates.

use super::plan::{AmbiguousCoverage, CoverageEntry, GapCause};
use crate::index::RemovedSpan;
use crate::storage::{Segment, Tick, TimeSpan};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::str::FromStr;

/// One precedence criterion. For each, the greater value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Source priority
    Priority,
    /// Time the owning file was last decoded
    Recency,
    /// Lexicographic file path
    Path,
}

impl Criterion {
    /// Criteria that describe the file rather than the data owner
    fn is_file_level(&self) -> bool {
        matches!(self, Criterion::Recency | Criterion::Path)
    }
}

impl FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "priority" => Ok(Criterion::Priority),
            "recency" | "scanned_at" => Ok(Criterion::Recency),
            "path" => Ok(Criterion::Path),
            _ => Err(format!("Unknown precedence criterion: {}", s)),
        }
    }
}

/// Total order over segments used to pick a winner
///
/// Criteria are applied in order; the greater segment id breaks any
/// remaining tie, so the order is total for distinct segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedencePolicy {
    order: Vec<Criterion>,
}

impl Default for PrecedencePolicy {
    fn default() -> Self {
        Self {
            order: vec![Criterion::Priority, Criterion::Recency, Criterion::Path],
        }
    }
}

impl PrecedencePolicy {
    /// Policy with a custom criterion order. Repeated criteria are ignored.
    pub fn new(order: impl IntoIterator<Item = Criterion>) -> Self {
        let mut deduped: Vec<Criterion> = Vec::new();
        for c in order {
            if !deduped.contains(&c) {
                deduped.push(c);
            }
        }
        Self { order: deduped }
    }

    pub fn order(&self) -> &[Criterion] {
        &self.order
    }

    /// `Ordering::Greater` when `a` takes precedence over `b`
    pub fn compare(&self, a: &Segment, b: &Segment) -> Ordering {
        for criterion in &self.order {
            let ord = match criterion {
                Criterion::Priority => a.priority.cmp(&b.priority),
                Criterion::Recency => a.scanned_at.cmp(&b.scanned_at),
                Criterion::Path => a.path.cmp(&b.path),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Values of the criteria ahead of the first file-level one.
    /// Overlapping segments with equal keys are ambiguous.
    fn tie_key(&self, segment: &Segment) -> Vec<i64> {
        self.order
            .iter()
            .take_while(|c| !c.is_file_level())
            .map(|c| match c {
                Criterion::Priority => segment.priority as i64,
                Criterion::Recency => segment.scanned_at,
                Criterion::Path => 0,
            })
            .collect()
    }
}

/// Resolver output for one identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub entries: Vec<CoverageEntry>,
    pub ambiguities: Vec<AmbiguousCoverage>,
}

/// Resolve the candidates of one identity over `window`
///
/// Entries are ordered, non-overlapping and cover `window` exactly.
pub fn resolve(candidates: &[Segment], window: TimeSpan, policy: &PrecedencePolicy) -> Resolution {
    let clipped: Vec<(&Segment, TimeSpan)> = candidates
        .iter()
        .filter_map(|s| s.span.intersect(&window).map(|span| (s, span)))
        .collect();

    // Dense ranks, higher wins
    let mut by_precedence: Vec<usize> = (0..clipped.len()).collect();
    by_precedence.sort_by(|&a, &b| policy.compare(clipped[a].0, clipped[b].0));
    let mut rank = vec![0usize; clipped.len()];
    for (r, &c) in by_precedence.iter().enumerate() {
        rank[c] = r;
    }

    let mut by_start: Vec<usize> = (0..clipped.len()).collect();
    by_start.sort_by_key(|&c| clipped[c].1.start);

    let mut bounds: Vec<Tick> = Vec::with_capacity(clipped.len() * 2 + 2);
    bounds.push(window.start);
    bounds.push(window.end);
    for (_, span) in &clipped {
        bounds.push(span.start);
        bounds.push(span.end);
    }
    bounds.sort_unstable();
    bounds.dedup();

    let mut heap: BinaryHeap<(usize, usize)> = BinaryHeap::new();
    let mut next = 0;
    let mut entries: Vec<CoverageEntry> = Vec::new();

    for pair in bounds.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);

        while next < by_start.len() && clipped[by_start[next]].1.start <= lo {
            let c = by_start[next];
            heap.push((rank[c], c));
            next += 1;
        }

        // Lazy deletion: expired candidates are dropped once they surface
        while let Some(&(_, c)) = heap.peek() {
            if clipped[c].1.end <= lo {
                heap.pop();
            } else {
                break;
            }
        }

        let span = TimeSpan { start: lo, end: hi };
        match heap.peek() {
            Some(&(_, c)) => push_data(&mut entries, clipped[c].0, span),
            None => push_gap(&mut entries, span, GapCause::NoData),
        }
    }

    Resolution {
        entries,
        ambiguities: find_ambiguities(&clipped, policy),
    }
}

/// Append a data piece, merging with the previous piece of the same segment
fn push_data(entries: &mut Vec<CoverageEntry>, segment: &Segment, span: TimeSpan) {
    if let Some(CoverageEntry::Data {
        segment: last,
        span: last_span,
    }) = entries.last_mut()
    {
        if last.id == segment.id && last_span.end == span.start {
            last_span.end = span.end;
            return;
        }
    }
    entries.push(CoverageEntry::Data {
        segment: segment.clone(),
        span,
    });
}

/// Append a gap, merging with an adjacent gap of the same cause
pub(crate) fn push_gap(entries: &mut Vec<CoverageEntry>, span: TimeSpan, cause: GapCause) {
    if let Some(CoverageEntry::Gap {
        span: last_span,
        cause: last_cause,
    }) = entries.last_mut()
    {
        if *last_cause == cause && last_span.end == span.start {
            last_span.end = span.end;
            return;
        }
    }
    entries.push(CoverageEntry::Gap { span, cause });
}

/// Attribute the parts of `NoData` gaps that a deleted file used to cover
///
/// `removed` must be ordered by start. Where removed spans overlap, the
/// earlier one keeps the overlap.
pub fn mark_removed(entries: Vec<CoverageEntry>, removed: &[RemovedSpan]) -> Vec<CoverageEntry> {
    if removed.is_empty() {
        return entries;
    }

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let span = match entry {
            CoverageEntry::Gap {
                span,
                cause: GapCause::NoData,
            } => span,
            other => {
                out.push(other);
                continue;
            }
        };

        let mut cursor = span.start;
        for r in removed {
            if cursor >= span.end {
                break;
            }
            let Some(overlap) = r.span.intersect(&span) else {
                continue;
            };
            if overlap.end <= cursor {
                continue;
            }
            let start = overlap.start.max(cursor);
            if start > cursor {
                push_gap(&mut out, TimeSpan { start: cursor, end: start }, GapCause::NoData);
            }
            push_gap(
                &mut out,
                TimeSpan {
                    start,
                    end: overlap.end,
                },
                GapCause::Removed { path: r.path.clone() },
            );
            cursor = overlap.end;
        }
        if cursor < span.end {
            push_gap(&mut out, TimeSpan { start: cursor, end: span.end }, GapCause::NoData);
        }
    }

    out
}

fn find_ambiguities(clipped: &[(&Segment, TimeSpan)], policy: &PrecedencePolicy) -> Vec<AmbiguousCoverage> {
    let mut groups: BTreeMap<Vec<i64>, Vec<usize>> = BTreeMap::new();
    for (c, (segment, _)) in clipped.iter().enumerate() {
        groups.entry(policy.tie_key(segment)).or_default().push(c);
    }

    let mut found = Vec::new();
    for mut members in groups.into_values().filter(|g| g.len() > 1) {
        members.sort_by_key(|&c| clipped[c].1.start);

        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if clipped[b].1.start >= clipped[a].1.end {
                    break;
                }
                let Some(span) = clipped[a].1.intersect(&clipped[b].1) else {
                    continue;
                };
                let (sa, sb) = (clipped[a].0, clipped[b].0);
                let (winner, other) = if policy.compare(sa, sb) == Ordering::Greater {
                    (sa.id, sb.id)
                } else {
                    (sb.id, sa.id)
                };
                found.push(AmbiguousCoverage {
                    winner,
                    other,
                    span,
                });
            }
        }
    }

    found.sort_by_key(|a| (a.span.start, a.winner, a.other));
    found
}
