//! Pipeline configuration, loaded from TOML.
//!
//! Every tuning number (budgets, retry delays, timeouts) lives here rather
//! than in code. All sections are optional; missing keys take the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{ContextWindowBuilder, DEFAULT_OPENING_LINE};
use crate::error::ConfigError;
use crate::gateway::{ModelBackend, ModelGateway, ParamBounds};
use crate::retry::RetryPolicy;
use crate::types::GenerationParams;

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I'm having trouble responding right now. Please try again in a moment.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub context: ContextConfig,
    pub retry: RetryConfig,
    pub gateway: GatewayConfig,
    pub params: GenerationParams,
    pub worker: WorkerConfig,
    /// Written once when a task fails for good.
    pub fallback_message: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            retry: RetryConfig::default(),
            gateway: GatewayConfig::default(),
            params: GenerationParams::default(),
            worker: WorkerConfig::default(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Model context limit in tokens.
    pub budget_tokens: u32,
    /// Tokens kept free for the answer.
    pub reserved_output_tokens: u32,
    /// How many stored turns to fetch before windowing.
    pub history_limit: usize,
    /// Smallest useful slice of a truncated latest turn.
    pub min_turn_tokens: u32,
    pub opening_line: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 4096,
            reserved_output_tokens: 512,
            history_limit: 50,
            min_turn_tokens: 8,
            opening_line: DEFAULT_OPENING_LINE.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![5, 15, 30],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub health_timeout_ms: u64,
    pub generate_timeout_secs: u64,
    /// Cleaned responses shorter than this are degenerate.
    pub min_response_chars: usize,
    pub bounds: ParamBounds,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_timeout_ms: 2_000,
            generate_timeout_secs: 120,
            min_response_chars: 2,
            bounds: ParamBounds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease_ttl_secs: u64,
    pub idle_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_ttl_secs: 300,
            idle_poll_ms: 500,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ctx = &self.context;
        if ctx.reserved_output_tokens >= ctx.budget_tokens {
            return Err(ConfigError::Validation(format!(
                "context.reserved_output_tokens ({}) must be below context.budget_tokens ({})",
                ctx.reserved_output_tokens, ctx.budget_tokens
            )));
        }
        if self.params.max_output_tokens > ctx.reserved_output_tokens {
            return Err(ConfigError::Validation(format!(
                "params.max_output_tokens ({}) exceeds context.reserved_output_tokens ({})",
                self.params.max_output_tokens, ctx.reserved_output_tokens
            )));
        }
        if ctx.history_limit == 0 {
            return Err(ConfigError::Validation(
                "context.history_limit must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_secs.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Validation(format!(
                "retry.backoff_secs must not decrease, got {:?}",
                self.retry.backoff_secs
            )));
        }
        let gw = &self.gateway;
        if gw.health_timeout_ms == 0 || gw.generate_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "gateway timeouts must be non-zero".to_string(),
            ));
        }
        if Duration::from_millis(gw.health_timeout_ms) >= Duration::from_secs(gw.generate_timeout_secs) {
            return Err(ConfigError::Validation(
                "gateway.health_timeout_ms must be shorter than gateway.generate_timeout_secs"
                    .to_string(),
            ));
        }
        let (lo, hi) = gw.bounds.max_output_tokens;
        if lo > hi {
            return Err(ConfigError::Validation(format!(
                "gateway.bounds.max_output_tokens is inverted: ({lo}, {hi})"
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Validation(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if Duration::from_secs(self.worker.lease_ttl_secs) <= Duration::from_secs(gw.generate_timeout_secs) {
            return Err(ConfigError::Validation(
                "worker.lease_ttl_secs must outlast gateway.generate_timeout_secs".to_string(),
            ));
        }
        if self.fallback_message.trim().is_empty() {
            return Err(ConfigError::Validation(
                "fallback_message must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn context_builder(&self) -> ContextWindowBuilder {
        ContextWindowBuilder::new(self.context.budget_tokens, self.context.reserved_output_tokens)
            .with_min_turn_tokens(self.context.min_turn_tokens)
            .with_opening_line(self.context.opening_line.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn gateway(&self, backend: impl ModelBackend + 'static) -> ModelGateway {
        ModelGateway::new(backend)
            .with_health_timeout(Duration::from_millis(self.gateway.health_timeout_ms))
            .with_generate_timeout(Duration::from_secs(self.gateway.generate_timeout_secs))
            .with_bounds(self.gateway.bounds.clone())
            .with_min_response_chars(self.gateway.min_response_chars)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.worker.lease_ttl_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.worker.idle_poll_ms)
    }
}
