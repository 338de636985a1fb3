//! Analysis pipeline
//!
//! This module contains the whole request path: target resolution, the
//! range-aware fetcher and bounded collector, archive unwrapping, and the
//! analysis orchestrator, plus the configuration and error types they share.

pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod core;
pub mod fetch;
pub mod rate_limit;
pub mod resolver;

// Re-export main types for convenience
pub use analysis::engine::{AnalysisEngine, ChunkReader, EngineFactory, EngineOptions, EngineOutput};
pub use analysis::sniff::{SniffEngine, SniffEngineFactory};
pub use analysis::{AnalysisRequest, AnalysisResult, OutputFormat, parse_formats, select_formats};
pub use analyzer::{AnalyzeResponse, Analyzer, api_key_from_headers};
pub use config::{AnalyzerConfig, AnalyzerConfigBuilder};
pub use self::core::{
    AnalysisDiagnostics, AnalyzeError, Diagnostics, ErrorCode, ErrorSeverity, FetchDiagnostics, FirstByteStrategy,
    Result, Stage,
};
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimiter};

#[cfg(test)]
mod tests;
