//! Core types used throughout the analysis pipeline
//!
//! This module contains the fundamental types that all other modules depend on:
//! the resolved target, the probe outcome, the bounded byte buffer and the
//! archive envelope, plus the error taxonomy and diagnostics record.

pub mod diagnostics;
pub mod error;
pub mod http;

pub use diagnostics::{AnalysisDiagnostics, Diagnostics, FetchDiagnostics, FirstByteStrategy};
pub use error::{AnalyzeError, ErrorCode, ErrorSeverity, RequestPhase, Result};
pub use http::HttpClient;

use serde::Serialize;

/// A resolved, validated origin URL
///
/// Immutable once produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    /// Absolute http(s) URL that will be requested
    pub url: url::Url,
    /// True when the URL was rewritten from a known share-link form
    pub is_share_link: bool,
}

impl FetchTarget {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Last non-empty path segment of the URL, percent-decoded
    pub fn filename_from_path(&self) -> Option<String> {
        let segment = self
            .url
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .last()?;

        let decoded = percent_encoding::percent_decode_str(segment)
            .decode_utf8_lossy()
            .into_owned();

        if decoded.is_empty() { None } else { Some(decoded) }
    }
}

/// HTTP method that produced the probe response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeMethod {
    #[serde(rename = "HEAD")]
    Head,
    /// Ranged GET for a single byte, used when HEAD is rejected with 405
    #[serde(rename = "GET")]
    RangedGet,
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMethod::Head => write!(f, "HEAD"),
            ProbeMethod::RangedGet => write!(f, "GET"),
        }
    }
}

/// Everything learned about the resource before committing to a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Declared total size; `None` when the origin did not say
    pub size: Option<u64>,
    pub content_type: Option<String>,
    /// From Content-Disposition, else the last URL path segment
    pub filename: Option<String>,
    pub method: ProbeMethod,
    pub status: u16,
}

impl ProbeResult {
    /// Inclusive end offset of the bounded range request
    pub fn range_end(&self, chunk_size: u64) -> u64 {
        let ceiling = chunk_size.saturating_sub(1);
        match self.size {
            Some(size) => ceiling.min(size.saturating_sub(1)),
            None => ceiling,
        }
    }
}

/// Fixed-capacity byte buffer filled by the collector
///
/// The backing storage is allocated once at the configured ceiling and never
/// grows; `len()` can never exceed `capacity()`.
pub struct FetchedChunk {
    buf: Box<[u8]>,
    offset: usize,
}

impl FetchedChunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_full(&self) -> bool {
        self.offset == self.buf.len()
    }

    /// Copy as much of `bytes` as fits and return how many bytes were taken
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.buf[self.offset..self.offset + take].copy_from_slice(&bytes[..take]);
        self.offset += take;
        take
    }

    /// Read-only view of the collected bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.offset]
    }
}

impl std::fmt::Debug for FetchedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedChunk")
            .field("len", &self.offset)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// A single-entry DEFLATE ZIP detected at the start of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEnvelope {
    /// Name of the wrapped entry, when usable as a display name
    pub inner_name: Option<String>,
    /// Offset of the compressed payload within the first chunk
    pub payload_offset: usize,
}

/// Per-request pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Probing,
    Fetching,
    Decompressing,
    Analyzing,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Probing => "probing",
            Stage::Fetching => "fetching",
            Stage::Decompressing => "decompressing",
            Stage::Analyzing => "analyzing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}
