use std::time::Duration;

use crate::types::{ConversationId, TaskId};

/// Events emitted as tasks move through the pipeline, for dashboards and UIs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Queued { task: TaskId, conversation: ConversationId },
    Started { task: TaskId, attempt: u32 },
    Retrying { task: TaskId, attempt: u32, delay: Duration, reason: String },
    Succeeded { task: TaskId, attempt: u32 },
    Failed { task: TaskId, reason: String },
    Discarded { task: TaskId, reason: String },
}
