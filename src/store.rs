use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{ConversationId, Origin, SessionHandle, TaskId, Turn, TurnId};

/// An append request. `task_id` makes assistant writes idempotent: a second
/// append with the same task id returns the turn that already exists.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub origin: Origin,
    pub text: String,
    pub reply_to: Option<TurnId>,
    pub task_id: Option<TaskId>,
}

impl NewTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            origin: Origin::User,
            text: text.into(),
            reply_to: None,
            task_id: None,
        }
    }

    pub fn operator(text: impl Into<String>) -> Self {
        Self {
            origin: Origin::Operator,
            ..Self::user(text)
        }
    }

    pub fn assistant(text: impl Into<String>, reply_to: TurnId, task_id: TaskId) -> Self {
        Self {
            origin: Origin::Assistant,
            text: text.into(),
            reply_to: Some(reply_to),
            task_id: Some(task_id),
        }
    }
}

/// The relational store the pipeline reads from and writes to. Users,
/// accounts and the rest of the CRUD surface live behind it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_turn(
        &self,
        conversation: &ConversationId,
        turn: NewTurn,
    ) -> Result<Turn, StoreError>;

    /// The newest `limit` turns, oldest first.
    async fn get_recent_turns(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError>;

    async fn get_session_handle(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<SessionHandle>, StoreError>;

    async fn set_session_handle(
        &self,
        conversation: &ConversationId,
        handle: Option<SessionHandle>,
    ) -> Result<(), StoreError>;

    async fn is_ai_enabled(&self, conversation: &ConversationId) -> Result<bool, StoreError>;

    async fn is_cancelled(&self, conversation: &ConversationId) -> Result<bool, StoreError>;

    /// System prompt generated from the persona intake form.
    async fn persona_prompt(&self, conversation: &ConversationId) -> Result<String, StoreError>;

    /// The assistant turn already written for `task`, if any.
    async fn find_by_task(&self, task: &TaskId) -> Result<Option<Turn>, StoreError>;
}

// --- MemoryStore ---

#[derive(Debug, Default)]
struct ConversationRecord {
    persona: String,
    turns: Vec<Turn>,
    session: Option<SessionHandle>,
    ai_disabled: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    by_task: HashMap<TaskId, (ConversationId, TurnId)>,
    next_turn: u64,
}

/// In-process store. Backs tests and the demo; a production deployment puts
/// its database behind [`ConversationStore`] instead.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation with its persona prompt.
    pub async fn create_conversation(&self, id: ConversationId, persona: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.conversations.entry(id).or_default().persona = persona.into();
    }

    pub async fn set_ai_enabled(&self, id: &ConversationId, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        record_mut(&mut state, id)?.ai_disabled = !enabled;
        Ok(())
    }

    pub async fn set_cancelled(&self, id: &ConversationId, cancelled: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        record_mut(&mut state, id)?.cancelled = cancelled;
        Ok(())
    }

    /// All turns, oldest first.
    pub async fn turns(&self, id: &ConversationId) -> Vec<Turn> {
        let state = self.state.lock().await;
        state
            .conversations
            .get(id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    pub async fn count_origin(&self, id: &ConversationId, origin: Origin) -> usize {
        self.turns(id)
            .await
            .iter()
            .filter(|t| t.origin == origin)
            .count()
    }
}

fn record_mut<'a>(
    state: &'a mut MemoryState,
    id: &ConversationId,
) -> Result<&'a mut ConversationRecord, StoreError> {
    state
        .conversations
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn record<'a>(
    state: &'a MemoryState,
    id: &ConversationId,
) -> Result<&'a ConversationRecord, StoreError> {
    state
        .conversations
        .get(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn turn_for_task(state: &MemoryState, task: &TaskId) -> Result<Option<Turn>, StoreError> {
    let Some((conv, turn_id)) = state.by_task.get(task) else {
        return Ok(None);
    };
    record(state, conv)?
        .turns
        .iter()
        .find(|t| t.id == *turn_id)
        .cloned()
        .map(Some)
        .ok_or_else(|| StoreError::Backend(format!("dangling turn for {task}")))
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn append_turn(
        &self,
        conversation: &ConversationId,
        turn: NewTurn,
    ) -> Result<Turn, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(task_id) = &turn.task_id {
            if let Some(existing) = turn_for_task(&state, task_id)? {
                return Ok(existing);
            }
        }

        state.next_turn += 1;
        let id = TurnId(state.next_turn);
        let stored = Turn {
            id,
            origin: turn.origin,
            text: turn.text,
            reply_to: turn.reply_to,
            task_id: turn.task_id.clone(),
            created_at: Utc::now(),
        };
        record_mut(&mut state, conversation)?.turns.push(stored.clone());
        if let Some(task_id) = turn.task_id {
            state.by_task.insert(task_id, (conversation.clone(), id));
        }
        Ok(stored)
    }

    async fn get_recent_turns(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let state = self.state.lock().await;
        let turns = &record(&state, conversation)?.turns;
        let skip = turns.len().saturating_sub(limit);
        Ok(turns[skip..].to_vec())
    }

    async fn get_session_handle(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<SessionHandle>, StoreError> {
        let state = self.state.lock().await;
        Ok(record(&state, conversation)?.session.clone())
    }

    async fn set_session_handle(
        &self,
        conversation: &ConversationId,
        handle: Option<SessionHandle>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        record_mut(&mut state, conversation)?.session = handle;
        Ok(())
    }

    async fn is_ai_enabled(&self, conversation: &ConversationId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(!record(&state, conversation)?.ai_disabled)
    }

    async fn is_cancelled(&self, conversation: &ConversationId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(record(&state, conversation)?.cancelled)
    }

    async fn persona_prompt(&self, conversation: &ConversationId) -> Result<String, StoreError> {
        let state = self.state.lock().await;
        Ok(record(&state, conversation)?.persona.clone())
    }

    async fn find_by_task(&self, task: &TaskId) -> Result<Option<Turn>, StoreError> {
        let state = self.state.lock().await;
        turn_for_task(&state, task)
    }
}
