//! Analysis orchestration
//!
//! One engine instance is created per request and reused for every requested
//! format. Formats run strictly one after another; each pass is preceded by
//! `configure` and `reset`, and the engine is disposed on every exit path.
//! A format that fails gets a placeholder result; an exhausted CPU budget
//! fails the whole request.

pub mod engine;
pub mod postprocess;
pub mod sniff;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::pipeline::core::diagnostics::elapsed_ms;
use crate::pipeline::core::{AnalysisDiagnostics, AnalyzeError, Result};

use engine::{AnalysisEngine, BudgetedReader, EngineFactory, EngineGuard, EngineOptions, EngineOutput};
use postprocess::{DisplayNames, inject_complete_name, normalize_object};

/// Output formats the engine can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
    Xml,
    Html,
}

impl OutputFormat {
    /// Every supported format, in generation order
    pub const ALL: [OutputFormat; 4] = [OutputFormat::Json, OutputFormat::Text, OutputFormat::Xml, OutputFormat::Html];

    /// Key used in the result map
    pub fn key(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
            OutputFormat::Xml => "xml",
            OutputFormat::Html => "html",
        }
    }

    /// Name of the engine output mode, also used in placeholder messages
    pub fn engine_label(&self) -> &'static str {
        match self {
            OutputFormat::Json => "object",
            OutputFormat::Text => "Text",
            OutputFormat::Xml => "XML",
            OutputFormat::Html => "HTML",
        }
    }

    /// Whether the engine should include every field
    pub fn full_detail(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Text)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "json" | "object" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            "xml" => Some(OutputFormat::Xml),
            "html" => Some(OutputFormat::Html),
            _ => None,
        }
    }

    /// Result text for a format whose generation failed
    pub fn placeholder(&self) -> String {
        format!("Error generating {} view.", self.engine_label())
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Parse a comma-separated, case-insensitive format list
pub fn parse_formats(input: &str) -> Vec<OutputFormat> {
    let keys: Vec<&str> = input.split(',').map(str::trim).filter(|k| !k.is_empty()).collect();
    select_formats(&keys)
}

/// Resolve requested keys into the formats to generate
///
/// `all` or an empty list selects everything; unknown keys are dropped, and
/// a list with no known key falls back to `json`.
pub fn select_formats<S: AsRef<str>>(keys: &[S]) -> Vec<OutputFormat> {
    if keys.is_empty() || keys.iter().any(|k| k.as_ref().trim().eq_ignore_ascii_case("all")) {
        return OutputFormat::ALL.to_vec();
    }

    let mut formats: Vec<OutputFormat> = keys.iter().filter_map(|k| OutputFormat::from_key(k.as_ref())).collect();
    if formats.is_empty() {
        return vec![OutputFormat::Json];
    }
    formats.sort();
    formats.dedup();
    formats
}

/// Everything the orchestrator needs besides the bytes themselves
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub formats: Vec<OutputFormat>,
    /// Declared or inferred total size reported to the engine
    pub total_size: u64,
    pub cpu_budget: Duration,
    pub engine_chunk_size: usize,
    pub names: DisplayNames,
}

/// Generated output keyed by format key
pub type AnalysisResult = BTreeMap<String, String>;

/// Drive the engine across every requested format
pub fn run_analysis(
    factory: &dyn EngineFactory,
    request: &AnalysisRequest,
    data: &[u8],
    diagnostics: &mut AnalysisDiagnostics,
) -> Result<AnalysisResult> {
    let started = Instant::now();
    diagnostics.cpu_budget_ms = duration_ms(request.cpu_budget);

    let options = EngineOptions {
        chunk_size: request.engine_chunk_size,
        cover_data: false,
    };
    let engine = match factory.create(&options) {
        Ok(engine) => engine,
        Err(e) => {
            diagnostics.engine_load_error = Some(e.to_string());
            stamp_totals(diagnostics, started, request.cpu_budget);
            return Err(match e {
                AnalyzeError::AnalysisEngineFailure { .. } => e,
                other => AnalyzeError::AnalysisEngineFailure {
                    format: "engine".to_string(),
                    reason: other.to_string(),
                },
            });
        }
    };
    diagnostics.engine_create_time_ms = elapsed_ms(started);

    let mut guard = EngineGuard::new(engine);
    let reader = BudgetedReader::new(data, request.total_size, request.engine_chunk_size, started, request.cpu_budget);
    let mut results = AnalysisResult::new();

    for format in &request.formats {
        let key = format.key();
        let format_started = Instant::now();

        let outcome = reader
            .check_budget()
            .and_then(|_| generate(guard.engine(), *format, &reader, &request.names, diagnostics));

        if reader.budget_exceeded() || matches!(outcome, Err(AnalyzeError::CpuBudgetExceeded { .. })) {
            stamp_totals(diagnostics, started, request.cpu_budget);
            warn!(
                "CPU budget of {:?} exhausted while generating {}, abandoning remaining formats",
                request.cpu_budget, key
            );
            return Err(AnalyzeError::CpuBudgetExceeded {
                budget_ms: diagnostics.cpu_budget_ms,
                elapsed_ms: diagnostics.total_analysis_time_ms,
            });
        }

        match outcome {
            Ok(text) => {
                let took = elapsed_ms(format_started);
                debug!("Generated {} output ({} bytes) in {}ms", key, text.len(), took);
                diagnostics.format_generation_times.insert(key.to_string(), took);
                results.insert(key.to_string(), text);
            }
            Err(e) => {
                warn!("Failed to generate {} output: {}", key, e);
                diagnostics.format_errors.insert(key.to_string(), e.to_string());
                results.insert(key.to_string(), format.placeholder());
            }
        }
    }

    stamp_totals(diagnostics, started, request.cpu_budget);
    Ok(results)
}

/// One format pass: configure, reset, analyze, then render or post-process
fn generate(
    engine: &mut dyn AnalysisEngine,
    format: OutputFormat,
    reader: &BudgetedReader<'_>,
    names: &DisplayNames,
    diagnostics: &mut AnalysisDiagnostics,
) -> Result<String> {
    engine.configure(format, format.full_detail())?;
    engine.reset()?;
    let output = engine.analyze(reader)?;

    match format {
        OutputFormat::Json => Ok(match process_object(output, names) {
            Ok(json) => json,
            Err(reason) => {
                warn!("Structured output post-processing failed: {}", reason);
                diagnostics.object_process_error = Some(reason);
                "{}".to_string()
            }
        }),
        OutputFormat::Text => {
            let text = engine.render_text()?;
            Ok(match &names.display {
                Some(display) => inject_complete_name(&text, display),
                None => text,
            })
        }
        OutputFormat::Xml | OutputFormat::Html => engine.render_text(),
    }
}

fn process_object(output: EngineOutput, names: &DisplayNames) -> std::result::Result<String, String> {
    let value = match output {
        EngineOutput::Structured(value) => value,
        EngineOutput::Text(text) => serde_json::from_str(&text).map_err(|e| e.to_string())?,
    };
    serde_json::to_string(&normalize_object(value, names)).map_err(|e| e.to_string())
}

fn stamp_totals(diagnostics: &mut AnalysisDiagnostics, started: Instant, budget: Duration) {
    diagnostics.total_analysis_time_ms = elapsed_ms(started);
    diagnostics.cpu_budget_remaining_ms = duration_ms(budget).saturating_sub(diagnostics.total_analysis_time_ms);
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
