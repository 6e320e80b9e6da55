use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::context::{thread_history, ContextWindowBuilder};
use crate::error::{GenerationError, PipelineError};
use crate::gate::{AdminGate, GateDecision};
use crate::gateway::ModelGateway;
use crate::queue::TaskRecord;
use crate::retry::RetryPolicy;
use crate::store::{ConversationStore, NewTurn};
use crate::types::{
    ConversationId, GenerationOutcome, GenerationParams, GenerationRequest, HealthStatus, Origin,
    Turn,
};

/// Quality failures tolerated before degenerate output counts as fatal.
const MAX_QUALITY_STRIKES: u32 = 1;

/// Where one attempt left the task.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Reply written.
    Succeeded { turn: Turn },
    /// Nothing written; run again after `delay`.
    Retry {
        delay: Duration,
        error: GenerationError,
        quality_strikes: u32,
    },
    /// Gave up. The fallback turn, if the conversation could still take one.
    Failed {
        error: GenerationError,
        fallback: Option<Turn>,
    },
    /// Skipped on purpose. Nothing written.
    Discarded { reason: GenerationError },
}

/// Executes one delivery of a generation task.
pub struct TaskRunner {
    store: Arc<dyn ConversationStore>,
    gateway: Arc<ModelGateway>,
    builder: ContextWindowBuilder,
    retry: RetryPolicy,
    params: GenerationParams,
    history_limit: usize,
    fallback_message: String,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        gateway: Arc<ModelGateway>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            builder: config.context_builder(),
            retry: config.retry_policy(),
            params: config.params.clone(),
            history_limit: config.context.history_limit,
            fallback_message: config.fallback_message.clone(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one attempt. Store failures are retried like backend hiccups.
    pub async fn run(&self, task: &TaskRecord) -> Transition {
        match self.attempt(task).await {
            Ok(transition) => transition,
            Err(e) => {
                warn!(task = %task.id, error = %e, "store failure during generation");
                self.on_failure(
                    task,
                    GenerationError::TransientBackend(e.to_string()),
                    task.quality_strikes,
                )
                .await
            }
        }
    }

    async fn attempt(&self, task: &TaskRecord) -> Result<Transition, PipelineError> {
        let conv = &task.conversation_id;

        if let Some(reason) = self.skip_reason(conv).await? {
            info!(task = %task.id, conversation = %conv, %reason, "task discarded before running");
            return Ok(Transition::Discarded { reason });
        }

        // A redelivered task whose reply already landed settles without a
        // second model call.
        if let Some(turn) = self.store.find_by_task(&task.id).await? {
            info!(task = %task.id, conversation = %conv, turn = turn.id.0, "reply already written, settling");
            return Ok(if turn.text == self.fallback_message {
                Transition::Failed {
                    error: GenerationError::TransientBackend("fallback written by an earlier delivery".into()),
                    fallback: Some(turn),
                }
            } else {
                Transition::Succeeded { turn }
            });
        }

        if task.attempts <= 1 && self.gateway.health().await == HealthStatus::Unavailable {
            warn!(task = %task.id, "model backend reports unavailable, attempting anyway");
        }

        let request = GenerationRequest {
            conversation_id: conv.clone(),
            user_text: task.user_text.clone(),
            token_budget: self.builder.budget().context_window,
            params: self.params.clone(),
        };

        let persona = self.store.persona_prompt(conv).await?;
        let stored = self.store.get_recent_turns(conv, self.history_limit).await?;
        let history = thread_history(&stored, task.user_turn);
        let window = match self.builder.build(&persona, &history) {
            Ok(window) => window,
            Err(e) => {
                return self
                    .on_fatal(task, GenerationError::InvalidRequest(e.to_string()))
                    .await
            }
        };

        debug!(
            task = %task.id,
            attempt = task.attempts,
            budget = request.token_budget,
            tokens = window.stats.tokens_used,
            turns = window.stats.turns_included,
            "prompt ready"
        );

        let mut params = request.params;
        if window.stats.reserve_borrowed > 0 {
            let allowance = window.stats.output_allowance;
            warn!(
                task = %task.id,
                borrowed = window.stats.reserve_borrowed,
                max_output_tokens = params.max_output_tokens.min(allowance),
                "prompt took part of the output reserve"
            );
            params.max_output_tokens = params.max_output_tokens.min(allowance);
        }

        let session = self.store.get_session_handle(conv).await?;
        let generation = self
            .gateway
            .generate(session.clone(), window.prompt, params)
            .await;

        // A cancelled or muted conversation gets nothing written, not even
        // the refreshed session.
        if let Some(reason) = self.skip_reason(conv).await? {
            info!(task = %task.id, conversation = %conv, %reason, "result discarded before commit");
            return Ok(Transition::Discarded { reason });
        }

        if generation.session != session {
            self.store
                .set_session_handle(conv, generation.session.clone())
                .await?;
        }

        match generation.outcome {
            GenerationOutcome::Success(text) => {
                debug!(
                    task = %task.id,
                    input_tokens = generation.usage.input_tokens,
                    output_tokens = generation.usage.output_tokens,
                    "generation succeeded"
                );
                let turn = self
                    .store
                    .append_turn(conv, NewTurn::assistant(text, task.user_turn, task.id.clone()))
                    .await?;
                Ok(Transition::Succeeded { turn })
            }
            GenerationOutcome::Retryable(error) => {
                let strikes = match error {
                    GenerationError::Quality(_) => task.quality_strikes + 1,
                    _ => task.quality_strikes,
                };
                if strikes > MAX_QUALITY_STRIKES {
                    return self.on_fatal(task, error).await;
                }
                Ok(self.on_failure(task, error, strikes).await)
            }
            GenerationOutcome::Fatal(error) => self.on_fatal(task, error).await,
        }
    }

    /// Why this conversation must not get an assistant turn right now.
    async fn skip_reason(&self, conv: &ConversationId) -> Result<Option<GenerationError>, PipelineError> {
        if self.store.is_cancelled(conv).await? {
            return Ok(Some(GenerationError::Cancelled));
        }
        let ai_enabled = self.store.is_ai_enabled(conv).await?;
        Ok(match AdminGate::evaluate(ai_enabled, Origin::User) {
            GateDecision::Proceed => None,
            GateDecision::Skip(reason) => Some(reason),
        })
    }

    /// Retry if attempts remain, otherwise fail for good.
    async fn on_failure(&self, task: &TaskRecord, error: GenerationError, quality_strikes: u32) -> Transition {
        match self.retry.delay_after(task.attempts) {
            Some(delay) => Transition::Retry {
                delay,
                error,
                quality_strikes,
            },
            None => self.give_up(task, error).await,
        }
    }

    /// Fail the task for good, writing the fallback turn when the store
    /// allows it.
    pub async fn give_up(&self, task: &TaskRecord, error: GenerationError) -> Transition {
        match self.on_fatal(task, error.clone()).await {
            Ok(t) => t,
            Err(e) => {
                warn!(task = %task.id, error = %e, "could not write fallback turn");
                Transition::Failed {
                    error,
                    fallback: None,
                }
            }
        }
    }

    /// Write the fallback turn exactly once (deduped by task id).
    async fn on_fatal(&self, task: &TaskRecord, error: GenerationError) -> Result<Transition, PipelineError> {
        let conv = &task.conversation_id;
        if let Some(reason) = self.skip_reason(conv).await? {
            return Ok(Transition::Discarded { reason });
        }
        warn!(task = %task.id, conversation = %conv, attempts = task.attempts, %error, "generation failed, writing fallback");
        let turn = self
            .store
            .append_turn(
                conv,
                NewTurn::assistant(self.fallback_message.clone(), task.user_turn, task.id.clone()),
            )
            .await?;
        Ok(Transition::Failed {
            error,
            fallback: Some(turn),
        })
    }
}
