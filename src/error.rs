#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Raw backend failure, before classification.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("session unknown or expired: {0}")]
    SessionUnknown(String),
}

impl GatewayError {
    /// Transport errors, timeouts, throttling and 5xx are worth another try.
    /// Everything else means the request itself is wrong.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Request(_)
            | GatewayError::Parse(_)
            | GatewayError::Timeout(_)
            | GatewayError::SessionUnknown(_) => true,
            GatewayError::ApiError { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Request(e.to_string())
    }
}

/// Why a generation attempt did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("transient backend error: {0}")]
    TransientBackend(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("degenerate output: {0}")]
    Quality(String),
    #[error("conversation cancelled")]
    Cancelled,
    #[error("ai disabled for conversation")]
    Disabled,
}

impl From<GatewayError> for GenerationError {
    fn from(e: GatewayError) -> Self {
        if e.is_transient() {
            GenerationError::TransientBackend(e.to_string())
        } else {
            GenerationError::InvalidRequest(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("budget exhausted: {available} tokens left for the latest turn, need at least {required}")]
    BudgetExhausted { available: u32, required: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}
