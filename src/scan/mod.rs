//! Content Scanner
//!
//! Walks source roots, fingerprints every file and decodes only what changed:
//!
//! ```text
//! walk(root) → filter(include/exclude) → fingerprint
//!     unchanged → skip (no decode)
//!     new/changed → detect adapter → read_headers → replace_file (one transaction)
//! known but not seen → delete_file
//! ```
//!
//! Per-file problems never abort a scan; they are collected in the `ScanReport`.

mod fingerprint;
mod report;
mod scanner;

pub use fingerprint::{fingerprint, is_unchanged, FingerprintMode};
pub use report::{ScanIssue, ScanReport};
pub use scanner::{ScanOptions, Scanner, SourceFilter};

/// Meta key holding the tick of the last completed full scan
pub const LAST_FULL_SCAN_KEY: &str = "last_full_scan";
