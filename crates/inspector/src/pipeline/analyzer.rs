//! Main entry point for remote media analysis
//!
//! The call chain for one request:
//!
//! Caller
//! ↓
//! Analyzer (this file): key gate, rate limit, diagnostics
//! ↓
//! resolver::resolve
//! ↓
//! Fetcher (fetch/mod.rs): probe, first-byte strategies, bounded collect
//! ↓
//! run_analysis (analysis/mod.rs), on a blocking thread
//! ↓
//! AnalyzeResponse

use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use crate::pipeline::analysis::engine::EngineFactory;
use crate::pipeline::analysis::postprocess::DisplayNames;
use crate::pipeline::analysis::{AnalysisRequest, AnalysisResult, OutputFormat, run_analysis};
use crate::pipeline::config::AnalyzerConfig;
use crate::pipeline::core::{
    AnalysisDiagnostics, AnalyzeError, Diagnostics, ErrorCode, FetchDiagnostics, HttpClient, Result, Stage,
};
use crate::pipeline::fetch::Fetcher;
use crate::pipeline::rate_limit::{InMemoryRateLimiter, RateLimiter};
use crate::pipeline::resolver;

/// Diagnostics returned to the caller alongside a successful result
#[derive(Debug, Clone, Serialize)]
pub struct ResponseDiagnostics {
    pub fetch: FetchDiagnostics,
    pub analysis: AnalysisDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeSuccess {
    pub success: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub results: AnalysisResult,
    pub diagnostics: ResponseDiagnostics,
    /// Full record as logged
    #[serde(skip)]
    pub record: Diagnostics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeFailure {
    pub success: bool,
    pub request_id: String,
    pub error: ErrorBody,
    #[serde(skip)]
    pub http_status: u16,
    #[serde(skip)]
    pub record: Diagnostics,
}

/// Outcome of one `analyze` call, serialisable as the response envelope
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AnalyzeResponse {
    Success(AnalyzeSuccess),
    Failure(AnalyzeFailure),
}

impl AnalyzeResponse {
    fn success(record: Diagnostics, file_size: u64, results: AnalysisResult) -> Self {
        AnalyzeResponse::Success(AnalyzeSuccess {
            success: true,
            request_id: record.request_id.clone(),
            file_size: (file_size > 0).then_some(file_size),
            results,
            diagnostics: ResponseDiagnostics {
                fetch: record.fetch.clone(),
                analysis: record.analysis.clone().unwrap_or_default(),
            },
            record,
        })
    }

    fn failure(record: Diagnostics, error: &AnalyzeError) -> Self {
        let retry_after_secs = match error {
            AnalyzeError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        AnalyzeResponse::Failure(AnalyzeFailure {
            success: false,
            request_id: record.request_id.clone(),
            error: ErrorBody {
                code: error.code(),
                message: error.to_string(),
                retryable: error.is_retryable(),
                retry_after_secs,
            },
            http_status: error.http_status(),
            record,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AnalyzeResponse::Success(_))
    }

    pub fn request_id(&self) -> &str {
        match self {
            AnalyzeResponse::Success(success) => &success.request_id,
            AnalyzeResponse::Failure(failure) => &failure.request_id,
        }
    }

    /// HTTP status a front end should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            AnalyzeResponse::Success(_) => 200,
            AnalyzeResponse::Failure(failure) => failure.http_status,
        }
    }

    /// The diagnostics record that was logged for this request
    pub fn record(&self) -> &Diagnostics {
        match self {
            AnalyzeResponse::Success(success) => &success.record,
            AnalyzeResponse::Failure(failure) => &failure.record,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            AnalyzeResponse::Success(_) => None,
            AnalyzeResponse::Failure(failure) => Some(failure.error.code),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Analyzer key presented by a caller: `x-api-key`, else `Authorization: Bearer`
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key);
        }
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Remote media analyzer
///
/// Holds the shared HTTP client, engine factory and rate limiter. Requests
/// share nothing else, so one `Analyzer` can serve many concurrent calls.
pub struct Analyzer {
    config: AnalyzerConfig,
    http: HttpClient,
    engine_factory: Arc<dyn EngineFactory>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl Analyzer {
    /// Create an analyzer with the in-memory rate limiter
    pub fn new(config: AnalyzerConfig, engine_factory: Arc<dyn EngineFactory>) -> Result<Self> {
        config.validate()?;
        let http = HttpClient::from_config(&config)?;
        let rate_limiter = Arc::new(InMemoryRateLimiter::new(config.rate_limit_per_minute));

        Ok(Self {
            config,
            http,
            engine_factory,
            rate_limiter,
        })
    }

    /// Replace the rate limiter, e.g. with one backed by a shared store
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze `url` in the requested formats; an empty list means all
    pub async fn analyze(&self, url: &str, formats: &[OutputFormat]) -> AnalyzeResponse {
        self.analyze_with_id(Uuid::new_v4().to_string(), url, formats).await
    }

    /// Same as [`Analyzer::analyze`] with a caller-supplied request id
    pub async fn analyze_with_id(&self, request_id: String, url: &str, formats: &[OutputFormat]) -> AnalyzeResponse {
        let mut formats = if formats.is_empty() {
            OutputFormat::ALL.to_vec()
        } else {
            formats.to_vec()
        };
        formats.sort();
        formats.dedup();

        let mut diagnostics = Diagnostics::new(request_id.clone());
        let outcome = self
            .run(url, formats, &mut diagnostics)
            .instrument(info_span!("analyze", request_id = %request_id, url = %url))
            .await;

        finish(diagnostics, outcome)
    }

    /// Gate the request on the analyzer key and the client's rate limit, then analyze
    pub async fn analyze_for_client(
        &self,
        client_key: &str,
        api_key: Option<&str>,
        url: &str,
        formats: &[OutputFormat],
    ) -> AnalyzeResponse {
        let request_id = Uuid::new_v4().to_string();

        if let Err(e) = self.admit(client_key, api_key).await {
            let mut diagnostics = Diagnostics::new(request_id);
            return finish_failed(&mut diagnostics, e);
        }

        self.analyze_with_id(request_id, url, formats).await
    }

    async fn admit(&self, client_key: &str, api_key: Option<&str>) -> Result<()> {
        if let Some(expected) = &self.config.api_key {
            match api_key.map(str::trim).filter(|key| !key.is_empty()) {
                None => return Err(AnalyzeError::AuthRequired),
                Some(key) if key != expected => return Err(AnalyzeError::AuthInvalid),
                Some(_) => {}
            }
        }

        let decision = self.rate_limiter.check_and_increment(client_key).await;
        if !decision.allowed {
            return Err(AnalyzeError::RateLimited {
                retry_after_secs: decision.retry_after.as_secs().max(1),
            });
        }
        Ok(())
    }

    async fn run(
        &self,
        url: &str,
        formats: Vec<OutputFormat>,
        diagnostics: &mut Diagnostics,
    ) -> Result<(u64, AnalysisResult)> {
        let target = resolver::resolve(url, self.config.allow_private_targets)?;
        diagnostics.target_url = Some(target.as_str().to_string());

        let media = Fetcher::new(&self.http, &self.config).fetch(&target, diagnostics).await?;

        diagnostics.enter(Stage::Analyzing);
        let request = AnalysisRequest {
            formats,
            total_size: media.effective_size(),
            cpu_budget: self.config.cpu_budget,
            engine_chunk_size: self.config.engine_chunk_size,
            names: DisplayNames {
                display: media.display_name().map(str::to_string),
                outer: media.outer_name().map(str::to_string),
                from_archive: media.envelope.as_ref().is_some_and(|e| e.inner_name.is_some()),
            },
        };
        let file_size = request.total_size;
        debug!(
            "Analyzing {} bytes as {:?} ({:?})",
            media.chunk.len(),
            request.names.display,
            request.formats
        );

        let factory = self.engine_factory.clone();
        let (result, analysis) = tokio::task::spawn_blocking(move || {
            let mut analysis = AnalysisDiagnostics::default();
            let result = run_analysis(&*factory, &request, media.chunk.as_slice(), &mut analysis);
            (result, analysis)
        })
        .await
        .map_err(|e| AnalyzeError::Internal {
            message: format!("Analysis task failed: {}", e),
        })?;

        diagnostics.analysis = Some(analysis);
        Ok((file_size, result?))
    }
}

fn finish(mut diagnostics: Diagnostics, outcome: Result<(u64, AnalysisResult)>) -> AnalyzeResponse {
    match outcome {
        Ok((file_size, results)) => {
            diagnostics.complete();
            diagnostics.emit();
            AnalyzeResponse::success(diagnostics, file_size, results)
        }
        Err(e) => finish_failed(&mut diagnostics, e),
    }
}

fn finish_failed(diagnostics: &mut Diagnostics, error: AnalyzeError) -> AnalyzeResponse {
    diagnostics.fail(&error);
    diagnostics.emit();
    AnalyzeResponse::failure(diagnostics.clone(), &error)
}
