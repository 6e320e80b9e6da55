use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one generation task across redeliveries. Used as the dedupe key
/// when the assistant turn is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned, monotonically increasing within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(pub u64);

/// Who wrote a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Assistant,
    /// Human admin intervention. Never rendered to the model.
    Operator,
}

/// One immutable message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub origin: Origin,
    pub text: String,
    /// For assistant turns: the user turn this answers.
    pub reply_to: Option<TurnId>,
    /// For assistant turns written by the pipeline: the task that wrote it.
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

/// Opaque token naming a warm generation context on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Sampling parameters, passed through to the backend after bounds clamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            repetition_penalty: 1.1,
            max_output_tokens: 512,
        }
    }
}

/// Built fresh for every attempt; never persisted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub user_text: String,
    pub token_budget: u32,
    pub params: GenerationParams,
}

/// Classified result of one gateway call. Drives the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Success(String),
    Retryable(GenerationError),
    Fatal(GenerationError),
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
    Unavailable,
}

/// Token usage reported by the backend for a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
