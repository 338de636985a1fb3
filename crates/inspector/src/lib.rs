//! Inspector Library
//!
//! Remote media inspection without downloading the whole file. The analyzer
//! probes an HTTP(S) resource, pulls a bounded prefix of its bytes (unwrapping
//! a single-entry ZIP on the fly), and drives a metadata engine over that
//! prefix in one or more output formats under a CPU budget.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use inspector::{Analyzer, AnalyzerConfig, OutputFormat, SniffEngineFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> inspector::Result<()> {
//! let config = AnalyzerConfig::from_env();
//! let analyzer = Analyzer::new(config, Arc::new(SniffEngineFactory))?;
//!
//! let response = analyzer
//!     .analyze("https://cdn.example.com/movie.mkv", &[OutputFormat::Json, OutputFormat::Text])
//!     .await;
//!
//! if response.is_success() {
//!     println!("{}", response.to_json().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Bounded fetch**: a ranged GET capped at the configured chunk size, with
//!   a first-byte deadline, one ranged retry and a no-range fallback
//! - **Archive peeking**: single-entry DEFLATE ZIPs are inflated while streaming
//! - **Pluggable engine**: any [`EngineFactory`] can back the analysis stage
//! - **Diagnostics**: one structured record per request, logged via `tracing`
//! - **Closed error codes**: every failure maps to an [`ErrorCode`] with a
//!   retryable flag

pub mod pipeline;

pub use pipeline::{
    AnalysisDiagnostics, AnalysisEngine, AnalysisRequest, AnalysisResult, AnalyzeError, AnalyzeResponse, Analyzer,
    AnalyzerConfig, AnalyzerConfigBuilder, ChunkReader, Diagnostics, EngineFactory, EngineOptions, EngineOutput,
    ErrorCode, ErrorSeverity, FetchDiagnostics, FirstByteStrategy, InMemoryRateLimiter, OutputFormat, RateDecision,
    RateLimiter, Result, SniffEngine, SniffEngineFactory, Stage, api_key_from_headers, parse_formats, select_formats,
};
