//! Per-request diagnostics record
//!
//! The record is filled in stage by stage and logged once, as a single
//! structured event, when the request reaches `Done` or `Failed`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info, warn};

use super::error::{AnalyzeError, ErrorCode, ErrorSeverity};
use super::{ProbeMethod, Stage};

/// Which read strategy delivered the first chunk of the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstByteStrategy {
    Range,
    NoRangeFallback,
}

/// Timings and outcomes of the probe and fetch stages
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchDiagnostics {
    pub head_request_duration_ms: u64,
    pub fetch_request_duration_ms: u64,
    pub total_duration_ms: u64,
    pub is_share_link: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_method: Option<ProbeMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
    pub first_byte_read_timeout_ms: u64,
    pub first_byte_read_retries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte_read_strategy: Option<FirstByteStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_close_error: Option<String>,
    pub bytes_collected: usize,
    pub raw_bytes_read: u64,
    pub truncated: bool,
    pub decompressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_hash: Option<String>,
}

/// Timings and per-format outcomes of the analysis stage
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDiagnostics {
    pub engine_create_time_ms: u64,
    pub format_generation_times: BTreeMap<String, u64>,
    pub format_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_process_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_load_error: Option<String>,
    pub total_analysis_time_ms: u64,
    pub cpu_budget_ms: u64,
    pub cpu_budget_remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub code: ErrorCode,
    pub category: &'static str,
    pub message: String,
}

/// The single structured record emitted for each request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    pub fetch: FetchDiagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub total_duration_ms: u64,
    #[serde(skip)]
    started: Option<Instant>,
    #[serde(skip)]
    severity: Option<ErrorSeverity>,
}

impl Diagnostics {
    pub fn new<S: Into<String>>(request_id: S) -> Self {
        Self {
            request_id: request_id.into(),
            target_url: None,
            stage: Stage::Resolving,
            failed_stage: None,
            fetch: FetchDiagnostics::default(),
            analysis: None,
            error: None,
            total_duration_ms: 0,
            started: Some(Instant::now()),
            severity: None,
        }
    }

    /// Advance the state machine
    ///
    /// A stage at or before the current one is ignored, so a finished or
    /// failed record stays terminal.
    pub fn enter(&mut self, stage: Stage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// Mark the request as finished successfully
    pub fn complete(&mut self) {
        self.stage = Stage::Done;
        self.stamp_total();
    }

    /// Mark the request as failed at the current stage
    pub fn fail(&mut self, error: &AnalyzeError) {
        self.failed_stage = Some(self.stage);
        self.stage = Stage::Failed;
        self.severity = Some(error.severity());
        self.error = Some(ErrorSummary {
            code: error.code(),
            category: error.category(),
            message: error.to_string(),
        });
        self.stamp_total();
    }

    fn stamp_total(&mut self) {
        if let Some(started) = self.started {
            self.total_duration_ms = elapsed_ms(started);
        }
    }

    /// Serialize the record as one JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"serializationError\":\"{}\"}}", e))
    }

    /// Log the record as a single structured event
    pub fn emit(&self) {
        let record = self.to_json();
        match self.severity {
            None => info!(
                target: "inspector::diagnostics",
                request_id = %self.request_id,
                stage = %self.stage,
                record = %record,
                "Analyzer request"
            ),
            Some(ErrorSeverity::Low) => warn!(
                target: "inspector::diagnostics",
                request_id = %self.request_id,
                stage = %self.stage,
                record = %record,
                "Analyzer request rejected"
            ),
            Some(_) => error!(
                target: "inspector::diagnostics",
                request_id = %self.request_id,
                stage = %self.stage,
                record = %record,
                "Analyzer request failed"
            ),
        }
    }
}

/// Milliseconds elapsed since `start`, saturating
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
