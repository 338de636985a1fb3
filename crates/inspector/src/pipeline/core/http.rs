//! HTTP utilities
//!
//! Centralized HTTP client for talking to media origins. Every request carries
//! the same browser-like header set. The client is built without any body
//! decompression feature so byte ranges address the stored representation,
//! and every redirect hop is checked against the target guard.

use once_cell::sync::Lazy;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode};
use std::error::Error as _;
use tracing::{debug, warn};

use super::error::{AnalyzeError, RequestPhase, Result};
use crate::pipeline::config::AnalyzerConfig;
use crate::pipeline::resolver::guard_target;

/// Redirect hops followed before the redirect response itself is returned
pub const MAX_REDIRECTS: usize = 10;

static EMULATION_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("video/*,audio/*,application/octet-stream;q=0.9,*/*;q=0.8"),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers
});

/// A redirect hop refused by the target guard
#[derive(Debug, thiserror::Error)]
#[error("Redirect to '{url}' rejected: {reason}")]
struct RedirectRejected {
    url: String,
    reason: String,
}

fn redirect_policy(allow_private_targets: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.stop();
        }
        match guard_target(attempt.url(), allow_private_targets) {
            Ok(()) => attempt.follow(),
            Err(AnalyzeError::InvalidTarget { url, reason }) => {
                warn!("Refusing redirect to {}: {}", url, reason);
                attempt.error(RedirectRejected { url, reason })
            }
            Err(other) => attempt.error(other.to_string()),
        }
    })
}

/// Map a transport failure, surfacing a refused redirect as an invalid target
fn request_error(url: &str, error: reqwest::Error) -> AnalyzeError {
    if error.is_redirect() {
        let mut source = error.source();
        while let Some(cause) = source {
            if let Some(rejected) = cause.downcast_ref::<RedirectRejected>() {
                return AnalyzeError::InvalidTarget {
                    url: rejected.url.clone(),
                    reason: rejected.reason.clone(),
                };
            }
            source = cause.source();
        }
    }

    AnalyzeError::HttpRequest {
        url: url.to_string(),
        source: error,
    }
}

/// HTTP client used for probing and fetching
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client from analyzer configuration
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .default_headers(EMULATION_HEADERS.clone())
            .cookie_store(true)
            .redirect(redirect_policy(config.allow_private_targets))
            .build()
            .map_err(|e| AnalyzeError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    /// Metadata-only HEAD request
    pub async fn head(&self, url: &str) -> Result<Response> {
        debug!("HEAD {}", url);
        self.client
            .head(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))
    }

    /// GET for the inclusive byte range `[start, end]`
    pub async fn get_range(&self, url: &str, start: u64, end: u64) -> Result<Response> {
        let range = format!("bytes={}-{}", start, end);
        debug!("GET {} (Range: {})", url, range);
        self.client
            .get(url)
            .header(header::RANGE, range)
            .send()
            .await
            .map_err(|e| request_error(url, e))
    }

    /// Plain GET without a Range header
    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {} (no range)", url);
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))
    }
}

/// Map an origin status to the user-facing failure for the given phase
///
/// Probes accept any 2xx; byte fetches accept only 200 and 206.
pub fn check_status(status: StatusCode, url: &str, phase: RequestPhase) -> Result<()> {
    let accepted = match phase {
        RequestPhase::Probe => status.is_success(),
        RequestPhase::Fetch => status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT,
    };
    if accepted {
        return Ok(());
    }

    let url = url.to_string();
    Err(match status {
        StatusCode::NOT_FOUND => AnalyzeError::UpstreamNotFound { url },
        StatusCode::FORBIDDEN => AnalyzeError::UpstreamAccessDenied { url, phase },
        _ => AnalyzeError::UpstreamUnavailable {
            url,
            status: status.as_u16(),
            phase,
        },
    })
}
