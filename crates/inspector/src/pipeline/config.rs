//! Configuration types for the analysis pipeline

use std::time::Duration;

use crate::pipeline::core::{AnalyzeError, Result};

/// Lower bound applied to any configured CPU budget
pub const MIN_CPU_BUDGET: Duration = Duration::from_millis(5_000);
/// Upper bound applied to any configured CPU budget
pub const MAX_CPU_BUDGET: Duration = Duration::from_millis(29_000);

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Configuration for analysis requests
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Byte-range ceiling; also the capacity of the collector buffer
    pub chunk_size: usize,
    /// Wall-clock budget for the analysis stage, always within
    /// `[MIN_CPU_BUDGET, MAX_CPU_BUDGET]`
    pub cpu_budget: Duration,
    /// Bounded wait for the first body chunk of a ranged GET
    pub first_byte_timeout: Duration,
    /// Bounded wait for the first body chunk of the no-range fallback
    pub no_range_fallback_timeout: Duration,
    /// Extra ranged attempts after the first one stalls
    pub max_first_byte_retries: usize,
    /// Ceiling for a whole HTTP exchange
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Largest read the analysis engine is handed per callback
    pub engine_chunk_size: usize,
    /// When set, inbound requests must present this key
    pub api_key: Option<String>,
    pub rate_limit_per_minute: u32,
    /// Skip the loopback/private host checks; only for local testing
    pub allow_private_targets: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            cpu_budget: Duration::from_millis(25_000),
            first_byte_timeout: Duration::from_secs(15),
            no_range_fallback_timeout: Duration::from_secs(25),
            max_first_byte_retries: 1,
            request_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            engine_chunk_size: 5 * 1024 * 1024,
            api_key: None,
            rate_limit_per_minute: 30,
            allow_private_targets: false,
        }
    }
}

impl AnalyzerConfig {
    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    ///
    /// Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |name: &str| lookup(name).and_then(|value| value.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(ms) = parse("ANALYZE_CPU_BUDGET_MS") {
            config.cpu_budget = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse("ANALYZE_CHUNK_SIZE_BYTES").filter(|b| *b > 0) {
            config.chunk_size = bytes as usize;
        }
        if let Some(ms) = parse("ANALYZE_FIRST_BYTE_TIMEOUT_MS").filter(|ms| *ms > 0) {
            config.first_byte_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse("ANALYZE_MAX_FIRST_BYTE_RETRIES") {
            config.max_first_byte_retries = retries as usize;
        }
        if let Some(limit) = parse("ANALYZE_RATE_LIMIT_PER_MINUTE").filter(|l| *l > 0) {
            config.rate_limit_per_minute = u32::try_from(limit).unwrap_or(u32::MAX);
        }
        config.api_key = lookup("ANALYZE_API_KEY")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        config.cpu_budget = clamp_cpu_budget(config.cpu_budget);
        config
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| AnalyzeError::Internal {
            message: format!("Invalid analyzer configuration: {} must be greater than zero", field),
        };

        if self.chunk_size == 0 {
            return Err(invalid("chunk_size"));
        }
        if self.engine_chunk_size == 0 {
            return Err(invalid("engine_chunk_size"));
        }
        if self.first_byte_timeout.is_zero() {
            return Err(invalid("first_byte_timeout"));
        }
        if self.no_range_fallback_timeout.is_zero() {
            return Err(invalid("no_range_fallback_timeout"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout"));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(invalid("rate_limit_per_minute"));
        }
        Ok(())
    }
}

/// Clamp a requested budget into the supported window
pub fn clamp_cpu_budget(budget: Duration) -> Duration {
    budget.clamp(MIN_CPU_BUDGET, MAX_CPU_BUDGET)
}

/// Builder for creating analyzer configurations
#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfigBuilder {
    config: AnalyzerConfig,
}

impl AnalyzerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smaller buffers for memory-constrained hosts
    pub fn low_memory(mut self) -> Self {
        self.config.chunk_size = 2 * 1024 * 1024;
        self.config.engine_chunk_size = 1024 * 1024;
        self
    }

    /// Longer waits and one more ranged attempt for slow origins
    pub fn patient(mut self) -> Self {
        self.config.first_byte_timeout = Duration::from_secs(30);
        self.config.no_range_fallback_timeout = Duration::from_secs(45);
        self.config.max_first_byte_retries = 2;
        self.config.request_timeout = Duration::from_secs(120);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn cpu_budget(mut self, budget: Duration) -> Self {
        self.config.cpu_budget = budget;
        self
    }

    pub fn first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.config.first_byte_timeout = timeout;
        self
    }

    pub fn no_range_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.config.no_range_fallback_timeout = timeout;
        self
    }

    pub fn max_first_byte_retries(mut self, retries: usize) -> Self {
        self.config.max_first_byte_retries = retries;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn engine_chunk_size(mut self, bytes: usize) -> Self {
        self.config.engine_chunk_size = bytes;
        self
    }

    pub fn api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn rate_limit_per_minute(mut self, limit: u32) -> Self {
        self.config.rate_limit_per_minute = limit;
        self
    }

    pub fn allow_private_targets(mut self, allow: bool) -> Self {
        self.config.allow_private_targets = allow;
        self
    }

    pub fn build(mut self) -> AnalyzerConfig {
        self.config.cpu_budget = clamp_cpu_budget(self.config.cpu_budget);
        self.config
    }
}
