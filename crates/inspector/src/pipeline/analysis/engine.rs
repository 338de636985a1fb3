//! Capability interface for the binary metadata-analysis engine
//!
//! The engine pulls bytes itself through a [`ChunkReader`]; the reader is
//! where the CPU budget is enforced, so an engine that reads often is
//! stopped promptly.

use serde_json::Value;
use std::cell::Cell;
use std::time::{Duration, Instant};

use super::OutputFormat;
use crate::pipeline::core::{AnalyzeError, Result};

/// Options applied once when an engine instance is created
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Largest read the engine should request per callback
    pub chunk_size: usize,
    /// Whether embedded cover art should be extracted
    pub cover_data: bool,
}

/// Raw result of one analysis pass
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Structured(Value),
    Text(String),
}

/// Byte source handed to the engine for one analysis pass
pub trait ChunkReader {
    /// Known or assumed total size of the resource
    fn total_size(&self) -> u64;

    /// Up to `len` bytes starting at `offset`; empty past the end
    fn read_chunk(&self, offset: u64, len: usize) -> Result<&[u8]>;
}

/// A reusable analysis engine instance
///
/// The orchestrator calls `configure` then `reset` before every format pass
/// and `dispose` exactly once when the request is done.
pub trait AnalysisEngine: Send {
    fn configure(&mut self, format: OutputFormat, full: bool) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn analyze(&mut self, reader: &dyn ChunkReader) -> Result<EngineOutput>;

    /// Render the last analysis in the configured output format
    fn render_text(&mut self) -> Result<String>;

    fn dispose(&mut self);
}

/// Creates one engine instance per request
pub trait EngineFactory: Send + Sync {
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn AnalysisEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineOptions) -> Result<Box<dyn AnalysisEngine>> + Send + Sync,
{
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn AnalysisEngine>> {
        self(options)
    }
}

/// Owns an engine and disposes it on every exit path
pub struct EngineGuard {
    engine: Box<dyn AnalysisEngine>,
}

impl EngineGuard {
    pub fn new(engine: Box<dyn AnalysisEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&mut self) -> &mut dyn AnalysisEngine {
        self.engine.as_mut()
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.engine.dispose();
    }
}

/// Chunk reader over the collected buffer with a wall-clock budget check
pub struct BudgetedReader<'a> {
    data: &'a [u8],
    total_size: u64,
    max_read: usize,
    started: Instant,
    budget: Duration,
    exceeded: Cell<bool>,
}

impl<'a> BudgetedReader<'a> {
    pub fn new(data: &'a [u8], total_size: u64, max_read: usize, started: Instant, budget: Duration) -> Self {
        Self {
            data,
            total_size,
            max_read,
            started,
            budget,
            exceeded: Cell::new(false),
        }
    }

    /// Fail once the budget measured from `started` is spent
    pub fn check_budget(&self) -> Result<()> {
        let elapsed = self.started.elapsed();
        if elapsed > self.budget {
            self.exceeded.set(true);
            return Err(AnalyzeError::CpuBudgetExceeded {
                budget_ms: u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX),
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(())
    }

    /// Whether any check has tripped, even if the engine swallowed the error
    pub fn budget_exceeded(&self) -> bool {
        self.exceeded.get()
    }
}

impl ChunkReader for BudgetedReader<'_> {
    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn read_chunk(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_budget()?;

        let Ok(start) = usize::try_from(offset) else {
            return Ok(&[]);
        };
        if start >= self.data.len() {
            return Ok(&[]);
        }
        let end = start.saturating_add(len.min(self.max_read)).min(self.data.len());
        Ok(&self.data[start..end])
    }
}
