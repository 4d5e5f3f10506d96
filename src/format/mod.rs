//! Format Adapter Registry
//!
//! The index never looks at file bytes itself. Every supported file type is
//! handled by a `FormatAdapter`, registered under its kind name:
//!
//! ```text
//! recognizes(path)      → does this adapter understand the file?
//! read_headers(path)    → [(identity, span, sample period, offset hints)]
//! read_payload(path, hints, span) → decoded samples / records
//! ```
//!
//! New formats are added by registering another implementation.

mod payload;
mod text;

pub use payload::{coalesce, Payload, PayloadData, Record};
pub use text::{render_waveform, TextTraceAdapter, TEXT_TRACE_KIND};

use crate::storage::{ChannelIdentity, OffsetHints, Tick, TimeSpan};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a format adapter
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Reading the file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The content does not follow the format
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// The requested span is outside the block the hints point to
    #[error("Requested span {0} is outside the segment")]
    OutOfRange(TimeSpan),

    /// The file changed since it was indexed
    #[error("File changed since it was indexed")]
    Changed,

    /// No adapter is registered for the recorded format
    #[error("Unsupported format: {0}")]
    Unsupported(String),
}

/// Metadata of one segment found in a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub identity: ChannelIdentity,
    pub span: TimeSpan,
    /// Sample spacing in ticks, None for event-like data
    pub sample_period: Option<Tick>,
    pub hints: OffsetHints,
}

/// Decoder capability for one file format
pub trait FormatAdapter: Send + Sync {
    /// Kind name recorded in the index for files this adapter decodes
    fn kind(&self) -> &str;

    /// Check whether the file is in this format
    fn recognizes(&self, path: &Path) -> bool;

    /// Extract the segments contained in the file
    fn read_headers(&self, path: &Path) -> Result<Vec<HeaderEntry>, DecodeError>;

    /// Materialize `span` of the segment located by `hints`
    fn read_payload(
        &self,
        path: &Path,
        hints: &OffsetHints,
        span: TimeSpan,
    ) -> Result<Payload, DecodeError>;
}

/// Capability table keyed by format kind
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn FormatAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextTraceAdapter::new()));
        registry
    }

    /// Register an adapter, replacing any previous one of the same kind
    pub fn register(&mut self, adapter: Arc<dyn FormatAdapter>) {
        let kind = adapter.kind().to_string();
        if self.adapters.insert(kind.clone(), adapter).is_some() {
            tracing::debug!("Replaced format adapter {}", kind);
        }
    }

    /// Get the adapter for a kind
    pub fn get(&self, kind: &str) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.get(kind).cloned()
    }

    /// Pick the adapter for a file
    ///
    /// With a hint, only the hinted adapter is considered and no file is
    /// opened. Otherwise adapters are asked in kind order.
    pub fn detect(&self, path: &Path, hint: Option<&str>) -> Option<Arc<dyn FormatAdapter>> {
        if let Some(kind) = hint {
            return self.get(kind);
        }

        self.adapters
            .values()
            .find(|adapter| adapter.recognizes(path))
            .cloned()
    }

    /// Registered kind names
    pub fn kinds(&self) -> Vec<&str> {
        self.adapters.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
