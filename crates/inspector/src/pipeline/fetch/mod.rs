//! Range-aware fetcher
//!
//! Probes the origin, then pulls a bounded prefix of the resource into a
//! [`FetchedChunk`]. The first body chunk of every byte request is read under
//! a deadline; a stalled attempt is dropped, which cancels it, and the next
//! strategy is tried: the ranged GET up to `1 + max_first_byte_retries` times,
//! then a single GET without `Range`.

pub mod archive;
pub mod collector;
pub mod headers;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::pipeline::config::AnalyzerConfig;
use crate::pipeline::core::diagnostics::elapsed_ms;
use crate::pipeline::core::http::check_status;
use crate::pipeline::core::{
    AnalyzeError, ArchiveEnvelope, Diagnostics, FetchTarget, FetchedChunk, FirstByteStrategy,
    HttpClient, ProbeMethod, ProbeResult, RequestPhase, Result, Stage,
};

use archive::ZipPeek;

/// Response body as a stream of I/O results
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A byte request whose first chunk has arrived
struct OpenedBody {
    status: u16,
    first: Option<Bytes>,
    rest: ByteStream,
}

/// The bounded prefix plus everything learned while fetching it
#[derive(Debug)]
pub struct FetchedMedia {
    pub probe: ProbeResult,
    pub chunk: FetchedChunk,
    pub envelope: Option<ArchiveEnvelope>,
}

impl FetchedMedia {
    /// Inner archive entry name when present, else the probed filename
    pub fn display_name(&self) -> Option<&str> {
        self.envelope
            .as_ref()
            .and_then(|envelope| envelope.inner_name.as_deref())
            .or(self.probe.filename.as_deref())
    }

    /// Name the origin gave the resource itself
    pub fn outer_name(&self) -> Option<&str> {
        self.probe.filename.as_deref()
    }

    /// Size reported to the analysis engine
    ///
    /// A decompressed prefix may be larger than the archive's declared size,
    /// so the larger of the two wins.
    pub fn effective_size(&self) -> u64 {
        let collected = self.chunk.len() as u64;
        match (self.probe.size, &self.envelope) {
            (Some(size), Some(_)) => size.max(collected),
            (Some(size), None) => size,
            (None, _) => collected,
        }
    }
}

/// Fingerprint of the collected bytes: xxHash64 (seed 0), little-endian, base64
pub fn prefix_fingerprint(bytes: &[u8]) -> String {
    let hash = xxhash_rust::xxh64::xxh64(bytes, 0);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hash.to_le_bytes())
}

pub struct Fetcher<'a> {
    http: &'a HttpClient,
    config: &'a AnalyzerConfig,
}

impl<'a> Fetcher<'a> {
    pub fn new(http: &'a HttpClient, config: &'a AnalyzerConfig) -> Self {
        Self { http, config }
    }

    /// Probe the target and collect its bounded prefix
    pub async fn fetch(&self, target: &FetchTarget, diagnostics: &mut Diagnostics) -> Result<FetchedMedia> {
        let started = Instant::now();
        diagnostics.fetch.is_share_link = target.is_share_link;

        let result = self.fetch_inner(target, diagnostics).await;

        diagnostics.fetch.total_duration_ms = elapsed_ms(started);
        result
    }

    async fn fetch_inner(&self, target: &FetchTarget, diagnostics: &mut Diagnostics) -> Result<FetchedMedia> {
        diagnostics.enter(Stage::Probing);
        let probe = self.probe(target, diagnostics).await?;

        diagnostics.enter(Stage::Fetching);
        let opened = self.open_body(target, &probe, diagnostics).await?;

        self.collect_prefix(target, probe, opened, diagnostics).await
    }

    /// Metadata-only probe: HEAD, or a one-byte ranged GET when HEAD is refused
    pub async fn probe(&self, target: &FetchTarget, diagnostics: &mut Diagnostics) -> Result<ProbeResult> {
        let url = target.as_str();
        let started = Instant::now();

        let mut method = ProbeMethod::Head;
        let mut response = self.http.head(url).await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!("HEAD rejected with 405, probing with ranged GET");
            method = ProbeMethod::RangedGet;
            response = self.http.get_range(url, 0, 0).await?;
        }

        diagnostics.fetch.head_request_duration_ms = elapsed_ms(started);
        diagnostics.fetch.probe_method = Some(method);

        let response_headers = response.headers();
        let content_type = headers::content_type(response_headers);
        if headers::is_html(content_type.as_deref()) {
            return Err(AnalyzeError::UpstreamIsNotMedia {
                url: url.to_string(),
                share_link: target.is_share_link,
            });
        }

        check_status(response.status(), url, RequestPhase::Probe)?;

        let size = headers::declared_size(response_headers);
        // Share links resolve to a generic download endpoint, so the path
        // carries no useful name
        let filename = headers::content_disposition_filename(response_headers).or_else(|| {
            if target.is_share_link { None } else { target.filename_from_path() }
        });

        diagnostics.fetch.declared_size = size;
        diagnostics.fetch.resolved_filename = filename.clone();

        debug!(
            "Probe {} via {}: status={}, size={:?}, type={:?}, filename={:?}",
            url,
            method,
            response.status(),
            size,
            content_type,
            filename
        );

        Ok(ProbeResult {
            size,
            content_type,
            filename,
            method,
            status: response.status().as_u16(),
        })
    }

    /// Run the first-byte strategies until one delivers a first chunk
    async fn open_body(
        &self,
        target: &FetchTarget,
        probe: &ProbeResult,
        diagnostics: &mut Diagnostics,
    ) -> Result<OpenedBody> {
        let url = target.as_str();
        let range_end = probe.range_end(self.config.chunk_size as u64);
        let started = Instant::now();
        diagnostics.fetch.first_byte_read_timeout_ms = duration_ms(self.config.first_byte_timeout);

        let mut timed_out = 0usize;
        let mut opened = None;
        for attempt in 0..=self.config.max_first_byte_retries {
            diagnostics.fetch.first_byte_read_retries = attempt;
            match self.open_with_deadline(target, Some(range_end), self.config.first_byte_timeout).await? {
                Some(body) => {
                    opened = Some((body, FirstByteStrategy::Range));
                    break;
                }
                None => {
                    timed_out += 1;
                    warn!(
                        "Ranged read of {} stalled for {:?} (attempt {})",
                        url,
                        self.config.first_byte_timeout,
                        attempt + 1
                    );
                }
            }
        }

        if opened.is_none() {
            info!("Falling back to a GET without Range for {}", url);
            match self.open_with_deadline(target, None, self.config.no_range_fallback_timeout).await? {
                Some(body) => opened = Some((body, FirstByteStrategy::NoRangeFallback)),
                None => {
                    return Err(AnalyzeError::StreamTimedOut {
                        url: url.to_string(),
                        range_attempts: timed_out,
                        strategies_attempted: timed_out + 1,
                    });
                }
            }
        }

        let Some((body, strategy)) = opened else {
            return Err(AnalyzeError::Internal {
                message: "Failed to retrieve response body stream".to_string(),
            });
        };

        diagnostics.fetch.fetch_request_duration_ms = elapsed_ms(started);
        diagnostics.fetch.first_byte_read_strategy = Some(strategy);
        diagnostics.fetch.response_status = Some(body.status);

        Ok(body)
    }

    /// Issue one byte request and wait for its first chunk
    ///
    /// Returns `Ok(None)` when the deadline passes first; the in-flight
    /// request is dropped at that point.
    async fn open_with_deadline(
        &self,
        target: &FetchTarget,
        range_end: Option<u64>,
        deadline: Duration,
    ) -> Result<Option<OpenedBody>> {
        let url = target.as_str();
        let attempt = async {
            let response = match range_end {
                Some(end) => self.http.get_range(url, 0, end).await?,
                None => self.http.get(url).await?,
            };
            check_status(response.status(), url, RequestPhase::Fetch)?;

            let content_type = headers::content_type(response.headers());
            if headers::is_html(content_type.as_deref()) {
                return Err(AnalyzeError::UpstreamIsNotMedia {
                    url: url.to_string(),
                    share_link: target.is_share_link,
                });
            }

            let status = response.status().as_u16();
            let mut rest: ByteStream = response.bytes_stream().map_err(io::Error::other).boxed();
            let first = rest
                .next()
                .await
                .transpose()
                .map_err(|e| AnalyzeError::StreamFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                    source: Some(e),
                })?;

            Ok::<_, AnalyzeError>(OpenedBody { status, first, rest })
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Peek for an archive envelope and fill the bounded buffer
    async fn collect_prefix(
        &self,
        target: &FetchTarget,
        probe: ProbeResult,
        opened: OpenedBody,
        diagnostics: &mut Diagnostics,
    ) -> Result<FetchedMedia> {
        let url = target.as_str();
        let OpenedBody { first, rest, .. } = opened;

        let raw_read = Arc::new(AtomicU64::new(first.as_ref().map_or(0, |b| b.len() as u64)));
        let counter = raw_read.clone();
        let rest: ByteStream = rest
            .inspect_ok(move |bytes| {
                counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            })
            .boxed();

        let peek = match &first {
            Some(first) if archive::should_peek(probe.filename.as_deref(), target.is_share_link) => {
                archive::peek_zip(first)
            }
            _ => ZipPeek::NotArchive,
        };

        let mut chunk = FetchedChunk::with_capacity(self.config.chunk_size);
        let (outcome, envelope) = match (peek, first) {
            (ZipPeek::Deflate(envelope), Some(first)) => {
                diagnostics.enter(Stage::Decompressing);
                diagnostics.fetch.decompressed = true;
                diagnostics.fetch.inner_filename = envelope.inner_name.clone();
                info!(
                    "Detected DEFLATE zip entry {:?}, decompressing on the fly",
                    envelope.inner_name
                );

                let payload = first.slice(envelope.payload_offset..);
                let inflated = archive::inflate_stream(payload, rest).boxed();
                (collector::collect(&mut chunk, None, inflated).await, Some(envelope))
            }
            (ZipPeek::Stored, first) => {
                debug!("Stored zip entry, passing bytes through");
                (collector::collect(&mut chunk, first, rest).await, None)
            }
            (_, first) => (collector::collect(&mut chunk, first, rest).await, None),
        };

        diagnostics.fetch.raw_bytes_read = raw_read.load(Ordering::Relaxed);
        diagnostics.fetch.bytes_collected = chunk.len();
        diagnostics.fetch.truncated = outcome.truncated;

        if let Some(error) = outcome.stream_error {
            diagnostics.fetch.stream_close_error = Some(error.to_string());

            // A bounded prefix of a DEFLATE payload always ends mid-stream
            let partial_ok = envelope.is_some() && !chunk.is_empty() && error.kind() == io::ErrorKind::UnexpectedEof;
            if partial_ok {
                debug!("Accepting {} decompressed bytes from a truncated payload", chunk.len());
            } else {
                return Err(AnalyzeError::StreamFailed {
                    url: url.to_string(),
                    reason: error.to_string(),
                    source: Some(error),
                });
            }
        }

        diagnostics.fetch.prefix_hash = Some(prefix_fingerprint(chunk.as_slice()));

        debug!(
            "Collected {} bytes from {} ({} raw, truncated={})",
            chunk.len(),
            url,
            diagnostics.fetch.raw_bytes_read,
            outcome.truncated
        );

        Ok(FetchedMedia { probe, chunk, envelope })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
