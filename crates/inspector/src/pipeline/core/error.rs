//! Error taxonomy for the analysis pipeline with codes, retry hints and suggestions

use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;

/// Closed set of error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    AuthInvalid,
    ValidationFailed,
    UpstreamFetchFailed,
    CpuBudgetExceeded,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::UpstreamFetchFailed => "UPSTREAM_FETCH_FAILED",
            ErrorCode::CpuBudgetExceeded => "CPU_BUDGET_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which origin exchange produced an HTTP status failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// The metadata-only probe (HEAD or 1-byte GET)
    Probe,
    /// The bounded byte fetch
    Fetch,
}

impl RequestPhase {
    fn access_denied_message(&self) -> &'static str {
        match self {
            RequestPhase::Probe => {
                "Access denied. The link may have expired or requires authentication."
            }
            RequestPhase::Fetch => {
                "Access denied while fetching media bytes. The link may have expired or blocked server-side fetches."
            }
        }
    }

    fn unavailable_prefix(&self) -> &'static str {
        match self {
            RequestPhase::Probe => "Unable to access file",
            RequestPhase::Fetch => "Unable to retrieve media bytes",
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestPhase::Probe => write!(f, "probe"),
            RequestPhase::Fetch => write!(f, "fetch"),
        }
    }
}

fn not_media_message(share_link: bool) -> &'static str {
    if share_link {
        "Shared file is rate-limited by its host. Try again in 24 hours."
    } else {
        "URL links to a webpage, not a media file. Provide a direct link."
    }
}

/// Every failure the pipeline can report
///
/// Resolve/probe/fetch failures are fatal to the request. Engine failures are
/// scoped to one output format and normally recovered by the orchestrator.
#[derive(Error, Debug)]
pub enum AnalyzeError {
    /// The submitted URL was rejected before any network traffic
    #[error("Invalid URL '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Media file not found. Check the URL.")]
    UpstreamNotFound { url: String },

    #[error("{}", phase.access_denied_message())]
    UpstreamAccessDenied { url: String, phase: RequestPhase },

    /// The origin answered with an HTML document instead of media bytes
    #[error("{}", not_media_message(*share_link))]
    UpstreamIsNotMedia { url: String, share_link: bool },

    #[error("{} (HTTP {status}).", phase.unavailable_prefix())]
    UpstreamUnavailable {
        url: String,
        status: u16,
        phase: RequestPhase,
    },

    /// Every first-byte read strategy stalled
    #[error("Fetch stream read timed out after {range_attempts} range attempt(s) and no-range fallback ({strategies_attempted} strategies attempted)")]
    StreamTimedOut {
        url: String,
        range_attempts: usize,
        strategies_attempted: usize,
    },

    #[error("Stream reading failed: {reason}")]
    StreamFailed {
        url: String,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("HTTP request to '{url}' failed")]
    HttpRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Analysis exceeded the configured CPU budget. Retry with a smaller or simpler source.")]
    CpuBudgetExceeded { budget_ms: u64, elapsed_ms: u64 },

    /// Failure generating a single output format
    #[error("Engine failed to generate {format} output: {reason}")]
    AnalysisEngineFailure { format: String, reason: String },

    #[error("{message}")]
    ValidationFailed { field: String, message: String },

    #[error("Missing analyzer API key.")]
    AuthRequired,

    #[error("Invalid analyzer API key.")]
    AuthInvalid,

    #[error("Too many analysis requests. Please retry shortly.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, AnalyzeError>;

impl AnalyzeError {
    /// Map to the closed code set exposed to callers
    pub fn code(&self) -> ErrorCode {
        match self {
            AnalyzeError::InvalidTarget { .. } => ErrorCode::ValidationFailed,
            AnalyzeError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            AnalyzeError::UpstreamNotFound { .. }
            | AnalyzeError::UpstreamAccessDenied { .. }
            | AnalyzeError::UpstreamIsNotMedia { .. }
            | AnalyzeError::UpstreamUnavailable { .. }
            | AnalyzeError::StreamTimedOut { .. }
            | AnalyzeError::StreamFailed { .. }
            | AnalyzeError::HttpRequest { .. } => ErrorCode::UpstreamFetchFailed,
            AnalyzeError::CpuBudgetExceeded { .. } => ErrorCode::CpuBudgetExceeded,
            AnalyzeError::AuthRequired => ErrorCode::AuthRequired,
            AnalyzeError::AuthInvalid => ErrorCode::AuthInvalid,
            AnalyzeError::RateLimited { .. } => ErrorCode::RateLimited,
            AnalyzeError::AnalysisEngineFailure { .. } | AnalyzeError::Internal { .. } => {
                ErrorCode::InternalError
            }
        }
    }

    /// Whether the caller may re-attempt the same request automatically
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalyzeError::InvalidTarget { .. } => false,
            AnalyzeError::UpstreamNotFound { .. } => false,
            AnalyzeError::UpstreamAccessDenied { .. } => false,
            AnalyzeError::UpstreamIsNotMedia { share_link, .. } => *share_link,
            AnalyzeError::UpstreamUnavailable { .. } => true,
            AnalyzeError::StreamTimedOut { .. } => true,
            AnalyzeError::StreamFailed { .. } => true,
            AnalyzeError::HttpRequest { source, .. } => {
                // Client errors (4xx) will not change on retry
                source.status().map_or(true, |status| status.is_server_error() || status == 429)
            }
            AnalyzeError::CpuBudgetExceeded { .. } => true,
            AnalyzeError::AnalysisEngineFailure { .. } => false,
            AnalyzeError::ValidationFailed { .. } => false,
            AnalyzeError::AuthRequired => false,
            AnalyzeError::AuthInvalid => false,
            AnalyzeError::RateLimited { .. } => true,
            AnalyzeError::Internal { .. } => true,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AnalyzeError::InvalidTarget { .. } => "invalid_target",
            AnalyzeError::UpstreamNotFound { .. } => "upstream_not_found",
            AnalyzeError::UpstreamAccessDenied { .. } => "upstream_access_denied",
            AnalyzeError::UpstreamIsNotMedia { .. } => "upstream_is_not_media",
            AnalyzeError::UpstreamUnavailable { .. } => "upstream_unavailable",
            AnalyzeError::StreamTimedOut { .. } => "stream_timed_out",
            AnalyzeError::StreamFailed { .. } => "stream_failed",
            AnalyzeError::HttpRequest { .. } => "http_request",
            AnalyzeError::CpuBudgetExceeded { .. } => "cpu_budget_exceeded",
            AnalyzeError::AnalysisEngineFailure { .. } => "analysis_engine_failure",
            AnalyzeError::ValidationFailed { .. } => "validation_failed",
            AnalyzeError::AuthRequired => "auth_required",
            AnalyzeError::AuthInvalid => "auth_invalid",
            AnalyzeError::RateLimited { .. } => "rate_limited",
            AnalyzeError::Internal { .. } => "internal",
        }
    }

    /// Get severity level for log prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AnalyzeError::InvalidTarget { .. } => ErrorSeverity::Low,
            AnalyzeError::ValidationFailed { .. } => ErrorSeverity::Low,
            AnalyzeError::AuthRequired | AnalyzeError::AuthInvalid => ErrorSeverity::Low,
            AnalyzeError::RateLimited { .. } => ErrorSeverity::Low,
            AnalyzeError::UpstreamNotFound { .. } => ErrorSeverity::Medium,
            AnalyzeError::UpstreamAccessDenied { .. } => ErrorSeverity::Medium,
            AnalyzeError::UpstreamIsNotMedia { .. } => ErrorSeverity::Medium,
            AnalyzeError::UpstreamUnavailable { .. } => ErrorSeverity::Medium,
            AnalyzeError::HttpRequest { .. } => ErrorSeverity::Medium,
            AnalyzeError::StreamTimedOut { .. } => ErrorSeverity::High,
            AnalyzeError::StreamFailed { .. } => ErrorSeverity::High,
            AnalyzeError::CpuBudgetExceeded { .. } => ErrorSeverity::High,
            AnalyzeError::AnalysisEngineFailure { .. } => ErrorSeverity::Medium,
            AnalyzeError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// HTTP status a front end should answer with for this failure
    pub fn http_status(&self) -> u16 {
        match self.code() {
            ErrorCode::AuthRequired => 401,
            ErrorCode::AuthInvalid => 403,
            ErrorCode::ValidationFailed => 422,
            ErrorCode::RateLimited => 429,
            ErrorCode::UpstreamFetchFailed => 502,
            ErrorCode::CpuBudgetExceeded => 503,
            ErrorCode::InternalError => 500,
        }
    }

    /// Get user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            AnalyzeError::InvalidTarget { .. } => {
                Some("Provide a public http(s) URL that points directly at the file")
            }
            AnalyzeError::UpstreamNotFound { .. } => Some("Check the URL"),
            AnalyzeError::UpstreamAccessDenied { .. } => {
                Some("The link may require authentication or may have expired")
            }
            AnalyzeError::UpstreamIsNotMedia { share_link: true, .. } => {
                Some("Wait for the host's download quota to reset, then retry")
            }
            AnalyzeError::UpstreamIsNotMedia { share_link: false, .. } => {
                Some("Use a direct download link rather than a page URL")
            }
            AnalyzeError::StreamTimedOut { .. } => {
                Some("The origin is stalling; retry later or use a different mirror")
            }
            AnalyzeError::CpuBudgetExceeded { .. } => {
                Some("Request fewer output formats or a smaller source")
            }
            AnalyzeError::RateLimited { .. } => Some("Wait for the rate-limit window to reset"),
            _ => None,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Code: {}\n", self.code()));
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Retryable: {}\n", self.is_retryable()));

        if let Some(suggestion) = self.suggestion() {
            report.push_str(&format!("Suggestion: {}\n", suggestion));
        }

        if let Some(source) = self.source() {
            report.push_str(&format!("Root cause: {}\n", source));
        }

        report
    }
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<reqwest::Error> for AnalyzeError {
    fn from(error: reqwest::Error) -> Self {
        let url = error
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        AnalyzeError::HttpRequest { url, source: error }
    }
}

impl From<url::ParseError> for AnalyzeError {
    fn from(error: url::ParseError) -> Self {
        let reason = match error {
            url::ParseError::EmptyHost => "URL must have a valid hostname",
            url::ParseError::InvalidPort => "Port number must be between 1 and 65535",
            url::ParseError::InvalidIpv4Address => "Invalid IPv4 address format",
            url::ParseError::InvalidIpv6Address => "Invalid IPv6 address format",
            url::ParseError::RelativeUrlWithoutBase => {
                "URL must be absolute (include http:// or https://)"
            }
            _ => "Check URL format and try again",
        }
        .to_string();

        AnalyzeError::InvalidTarget {
            url: "<unparseable>".to_string(),
            reason,
        }
    }
}
