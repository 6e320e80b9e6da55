pub mod http;
pub mod ollama;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::Prompt;
use crate::error::{GatewayError, GenerationError};
use crate::types::{GenerationOutcome, GenerationParams, HealthStatus, SessionHandle, Usage};

pub use http::HttpBackend;
pub use ollama::OllamaBackend;

/// Chat-template artifacts some models leak into their output.
pub const CONTROL_TOKENS: &[&str] = &[
    "<|im_end|>",
    "<|im_start|>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end|>",
    "</s>",
    "<s>",
];

/// Fully-formed backend call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: Prompt,
    pub params: GenerationParams,
    pub session: Option<SessionHandle>,
}

/// What came back from the backend, before quality checks.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    /// Handle the backend wants used next time. `None` leaves the sent one in place.
    pub session: Option<SessionHandle>,
    pub usage: Usage,
}

/// Read a token count from a backend's JSON usage block. Missing or
/// non-numeric reads as zero; values past `u32::MAX` saturate.
fn token_count(value: &serde_json::Value) -> u32 {
    u32::try_from(value.as_u64().unwrap_or(0)).unwrap_or(u32::MAX)
}

/// Raw model transport. No retries, no clamping, no classification:
/// request in, response out.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn health(&self) -> Result<HealthStatus, GatewayError>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError>;
}

#[async_trait]
impl ModelBackend for Box<dyn ModelBackend> {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        (**self).health().await
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        (**self).complete(request).await
    }
}

#[async_trait]
impl<T: ModelBackend + ?Sized> ModelBackend for Arc<T> {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        (**self).health().await
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        (**self).complete(request).await
    }
}

// ---------------------------------------------------------------------------
// Parameter bounds
// ---------------------------------------------------------------------------

/// Accepted ranges for sampling parameters. Out-of-range values are clamped,
/// never rejected.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ParamBounds {
    pub temperature: (f32, f32),
    pub top_p: (f32, f32),
    pub repetition_penalty: (f32, f32),
    pub max_output_tokens: (u32, u32),
}

impl Default for ParamBounds {
    fn default() -> Self {
        Self {
            temperature: (0.0, 2.0),
            top_p: (0.05, 1.0),
            repetition_penalty: (1.0, 2.0),
            max_output_tokens: (16, 2048),
        }
    }
}

impl ParamBounds {
    /// Clamp into range, returning the names of the fields that moved.
    pub fn clamp(&self, params: &GenerationParams) -> (GenerationParams, Vec<&'static str>) {
        let mut out = params.clone();
        let mut changed = Vec::new();

        let clamp_f = |v: f32, (lo, hi): (f32, f32)| if v.is_nan() { lo } else { v.clamp(lo, hi) };

        out.temperature = clamp_f(params.temperature, self.temperature);
        if out.temperature != params.temperature {
            changed.push("temperature");
        }
        out.top_p = clamp_f(params.top_p, self.top_p);
        if out.top_p != params.top_p {
            changed.push("top_p");
        }
        out.repetition_penalty = clamp_f(params.repetition_penalty, self.repetition_penalty);
        if out.repetition_penalty != params.repetition_penalty {
            changed.push("repetition_penalty");
        }
        let (lo, hi) = self.max_output_tokens;
        out.max_output_tokens = params.max_output_tokens.clamp(lo, hi);
        if out.max_output_tokens != params.max_output_tokens {
            changed.push("max_output_tokens");
        }

        (out, changed)
    }
}

/// Remove control tokens and surrounding whitespace.
pub fn strip_control_tokens(text: &str) -> String {
    let mut out = text.to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// ModelGateway
// ---------------------------------------------------------------------------

/// Result of [`ModelGateway::generate`].
#[derive(Debug, Clone)]
pub struct Generation {
    pub outcome: GenerationOutcome,
    /// The handle callers must persist after this call. Authoritative: it may
    /// differ from the one passed in, or be `None` if the old one was rejected.
    pub session: Option<SessionHandle>,
    pub usage: Usage,
}

/// Send a prompt, get classified text back.
///
/// Constructed once at process start and shared. Owns the timeouts,
/// parameter clamping, session re-establishment and output quality checks
/// that every backend needs.
pub struct ModelGateway {
    backend: Box<dyn ModelBackend>,
    health_timeout: Duration,
    generate_timeout: Duration,
    bounds: ParamBounds,
    min_response_chars: usize,
}

impl ModelGateway {
    pub fn new(backend: impl ModelBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            health_timeout: Duration::from_secs(2),
            generate_timeout: Duration::from_secs(120),
            bounds: ParamBounds::default(),
            min_response_chars: 2,
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout = timeout;
        self
    }

    pub fn with_bounds(mut self, bounds: ParamBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_min_response_chars(mut self, chars: usize) -> Self {
        self.min_response_chars = chars;
        self
    }

    /// Liveness probe bounded by the short health timeout. Never errors:
    /// anything other than an answer in time reads as `Unavailable`.
    pub async fn health(&self) -> HealthStatus {
        match tokio::time::timeout(self.health_timeout, self.backend.health()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                HealthStatus::Unavailable
            }
            Err(_) => {
                debug!(timeout = ?self.health_timeout, "health probe timed out");
                HealthStatus::Unavailable
            }
        }
    }

    pub async fn generate(
        &self,
        session: Option<SessionHandle>,
        prompt: Prompt,
        params: GenerationParams,
    ) -> Generation {
        let (params, clamped) = self.bounds.clamp(&params);
        if !clamped.is_empty() {
            warn!(fields = ?clamped, "generation parameters clamped to bounds");
        }

        let mut request = CompletionRequest {
            prompt,
            params,
            session,
        };

        let mut result = self.call(request.clone()).await;
        let rejected = match &result {
            Err(GatewayError::SessionUnknown(reason)) if request.session.is_some() => {
                info!(reason = %reason, "backend rejected session handle, opening a new one");
                true
            }
            _ => false,
        };
        if rejected {
            request.session = None;
            result = self.call(request.clone()).await;
        }

        match result {
            Ok(resp) => {
                let session = resp.session.or(request.session);
                let text = strip_control_tokens(&resp.text);
                let outcome = if text.chars().count() < self.min_response_chars {
                    GenerationOutcome::Retryable(GenerationError::Quality(format!(
                        "response of {} chars is below the {} char minimum",
                        text.chars().count(),
                        self.min_response_chars
                    )))
                } else {
                    GenerationOutcome::Success(text)
                };
                Generation {
                    outcome,
                    session,
                    usage: resp.usage,
                }
            }
            Err(e) => {
                let outcome = if e.is_transient() {
                    GenerationOutcome::Retryable(GenerationError::from(e))
                } else {
                    GenerationOutcome::Fatal(GenerationError::from(e))
                };
                Generation {
                    outcome,
                    session: request.session,
                    usage: Usage::default(),
                }
            }
        }
    }

    async fn call(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        match tokio::time::timeout(self.generate_timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.generate_timeout)),
        }
    }
}
