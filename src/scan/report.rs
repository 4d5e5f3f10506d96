//! Scan results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A problem found while scanning that did not abort the scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanIssue {
    /// The file could not be fingerprinted or decoded
    UnreadableFile { path: PathBuf, reason: String },
    /// The source root is missing or unreachable
    SourceUnavailable { root: PathBuf, reason: String },
    /// A directory below the root could not be listed
    WalkError { path: Option<PathBuf>, reason: String },
}

impl ScanIssue {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ScanIssue::UnreadableFile { path, .. } => Some(path),
            ScanIssue::SourceUnavailable { root, .. } => Some(root),
            ScanIssue::WalkError { path, .. } => path.as_deref(),
        }
    }
}

impl fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanIssue::UnreadableFile { path, reason } => {
                write!(f, "unreadable file {}: {}", path.display(), reason)
            }
            ScanIssue::SourceUnavailable { root, reason } => {
                write!(f, "source unavailable {}: {}", root.display(), reason)
            }
            ScanIssue::WalkError { path: Some(path), reason } => {
                write!(f, "cannot list {}: {}", path.display(), reason)
            }
            ScanIssue::WalkError { path: None, reason } => write!(f, "walk error: {}", reason),
        }
    }
}

/// Outcome of scanning one or more sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Files indexed for the first time
    pub added: Vec<PathBuf>,
    /// Files whose segments were replaced
    pub updated: Vec<PathBuf>,
    /// Files dropped from the index
    pub removed: Vec<PathBuf>,
    pub errored: Vec<ScanIssue>,
    /// Files skipped because their fingerprint did not change
    pub unchanged: usize,
    /// Files no adapter recognized
    pub ignored: usize,
    /// The scan stopped early on request
    pub cancelled: bool,
}

impl ScanReport {
    /// True when the scan did not change the index
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Roots reported as unavailable
    pub fn unavailable_sources(&self) -> impl Iterator<Item = &Path> {
        self.errored.iter().filter_map(|issue| match issue {
            ScanIssue::SourceUnavailable { root, .. } => Some(root.as_path()),
            _ => None,
        })
    }

    /// Files reported as unreadable
    pub fn unreadable_files(&self) -> impl Iterator<Item = &Path> {
        self.errored.iter().filter_map(|issue| match issue {
            ScanIssue::UnreadableFile { path, .. } => Some(path.as_path()),
            _ => None,
        })
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: ScanReport) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
        self.errored.extend(other.errored);
        self.unchanged += other.unchanged;
        self.ignored += other.ignored;
        self.cancelled |= other.cancelled;
    }
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added {}, updated {}, removed {}, unchanged {}, ignored {}, errors {}{}",
            self.added.len(),
            self.updated.len(),
            self.removed.len(),
            self.unchanged,
            self.ignored,
            self.errored.len(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}
