use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{GenerationError, PipelineError};
use crate::events::PipelineEvent;
use crate::gate::{AdminGate, GateDecision};
use crate::gateway::ModelGateway;
use crate::journal::{NoJournal, QueueJournal};
use crate::queue::{Claim, TaskQueue, TaskRecord, TaskState, TaskStatus};
use crate::store::{ConversationStore, NewTurn};
use crate::task::{TaskRunner, Transition};
use crate::types::{ConversationId, Origin, TaskId};

/// Accepts user messages, queues their generation tasks and runs them on a
/// pool of workers.
///
/// Tasks of one conversation run strictly one after another in arrival order;
/// different conversations run in parallel up to the worker count.
pub struct Scheduler {
    runner: Arc<TaskRunner>,
    queue: TaskQueue,
    store: Arc<dyn ConversationStore>,
    journal: Mutex<Box<dyn QueueJournal>>,
    events: Option<mpsc::Sender<PipelineEvent>>,
    concurrency: usize,
    idle_poll: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        gateway: ModelGateway,
        config: &PipelineConfig,
    ) -> Self {
        let runner = TaskRunner::new(Arc::clone(&store), Arc::new(gateway), config);
        Self {
            runner: Arc::new(runner),
            queue: TaskQueue::new(config.lease_ttl()),
            store,
            journal: Mutex::new(Box::new(NoJournal)),
            events: None,
            concurrency: config.worker.concurrency.max(1),
            idle_poll: config.idle_poll(),
        }
    }

    pub fn with_journal(mut self, journal: impl QueueJournal + 'static) -> Self {
        self.journal = Mutex::new(Box::new(journal));
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Re-queue whatever the journal holds from a previous process. Call once
    /// before [`run`](Self::run). Replies that were already written are
    /// deduplicated by task id when the task runs again.
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let tasks = self.journal.lock().await.load().await?;
        let count = tasks.len();
        for task in tasks {
            debug!(task = %task.id, conversation = %task.conversation_id, attempts = task.attempts, "recovered task");
            self.queue.push(task).await;
        }
        if count > 0 {
            info!(count, "recovered queued tasks from journal");
        }
        Ok(count)
    }

    /// Save the user's message and schedule a reply to it.
    ///
    /// The user turn is always stored. If the conversation has AI disabled or
    /// is cancelled, the task is recorded as discarded and never runs.
    pub async fn enqueue_generation(
        &self,
        conversation: &ConversationId,
        user_text: &str,
    ) -> Result<TaskId, PipelineError> {
        let turn = self
            .store
            .append_turn(conversation, NewTurn::user(user_text))
            .await?;
        let record = TaskRecord::new(conversation.clone(), turn.id, user_text.to_string());
        let id = record.id.clone();

        let decision = if self.store.is_cancelled(conversation).await? {
            GateDecision::Skip(GenerationError::Cancelled)
        } else {
            AdminGate::evaluate(self.store.is_ai_enabled(conversation).await?, Origin::User)
        };

        match decision {
            GateDecision::Proceed => {
                self.queue.push(record).await;
                info!(task = %id, conversation = %conversation, "generation queued");
                self.emit(PipelineEvent::Queued {
                    task: id.clone(),
                    conversation: conversation.clone(),
                })
                .await;
                self.persist().await;
            }
            GateDecision::Skip(reason) => {
                self.queue.record_terminal(id.clone(), TaskState::Discarded).await;
                info!(task = %id, conversation = %conversation, %reason, "generation skipped");
                self.emit(PipelineEvent::Discarded {
                    task: id.clone(),
                    reason: reason.to_string(),
                })
                .await;
            }
        }
        Ok(id)
    }

    pub async fn get_task_status(&self, id: &TaskId) -> Result<TaskStatus, PipelineError> {
        self.task_state(id).await.map(TaskState::status)
    }

    /// Fine-grained state, including running and retrying.
    pub async fn task_state(&self, id: &TaskId) -> Result<TaskState, PipelineError> {
        self.queue
            .state_of(id)
            .await
            .ok_or_else(|| PipelineError::UnknownTask(id.to_string()))
    }

    pub async fn pending(&self) -> usize {
        self.queue.pending().await
    }

    /// Claim and run one deliverable task. Returns false if none was ready.
    pub async fn process_next(&self) -> bool {
        match self.queue.claim().await {
            Some(claim) => {
                self.execute(claim).await;
                true
            }
            None => false,
        }
    }

    /// Run until the queue is empty, sleeping through backoff delays.
    /// Single worker, so ordering is easy to observe in tests.
    pub async fn drain(&self) {
        loop {
            while self.process_next().await {}
            match self.queue.next_wakeup().await {
                Some(at) => tokio::time::sleep_until(at).await,
                None => break,
            }
        }
    }

    /// Run the worker pool until `shutdown` fires. In-flight attempts finish
    /// before their worker exits.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(workers = self.concurrency, "scheduler started");
        let mut workers = Vec::with_capacity(self.concurrency);
        for worker in 0..self.concurrency {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                this.worker_loop(worker, shutdown).await;
            }));
        }
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        self.persist().await;
        info!("scheduler stopped");
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "worker started");
        while !shutdown.is_cancelled() {
            if self.process_next().await {
                continue;
            }
            let wait = match self.queue.next_wakeup().await {
                Some(at) => at
                    .saturating_duration_since(Instant::now())
                    .min(self.idle_poll),
                None => self.idle_poll,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn execute(&self, claim: Claim) {
        let attempt = claim.task.attempts;
        info!(
            task = %claim.task.id,
            conversation = %claim.task.conversation_id,
            attempt,
            "generation attempt started"
        );
        self.emit(PipelineEvent::Started {
            task: claim.task.id.clone(),
            attempt,
        })
        .await;

        // Own task so a panic in a backend or store cannot take the worker down.
        let runner = Arc::clone(&self.runner);
        let task = claim.task.clone();
        let transition = match tokio::spawn(async move { runner.run(&task).await }).await {
            Ok(transition) => transition,
            Err(e) => {
                error!(task = %claim.task.id, error = %e, "generation attempt panicked");
                let error = GenerationError::TransientBackend(format!("attempt aborted: {e}"));
                match self.runner.retry_policy().delay_after(attempt) {
                    Some(delay) => Transition::Retry {
                        delay,
                        error,
                        quality_strikes: claim.task.quality_strikes,
                    },
                    None => self.runner.give_up(&claim.task, error).await,
                }
            }
        };

        self.apply(&claim, transition).await;
        self.persist().await;
    }

    async fn apply(&self, claim: &Claim, transition: Transition) {
        let id = claim.task.id.clone();
        let attempt = claim.task.attempts;
        match transition {
            Transition::Succeeded { turn } => {
                self.queue.complete(claim, TaskState::Succeeded).await;
                info!(task = %id, attempt, turn = turn.id.0, status = "succeeded", "generation finished");
                self.emit(PipelineEvent::Succeeded { task: id, attempt }).await;
            }
            Transition::Retry {
                delay,
                error,
                quality_strikes,
            } => {
                self.queue.retry(claim, delay, quality_strikes).await;
                warn!(task = %id, attempt, ?delay, %error, status = "retrying", "generation attempt failed");
                self.emit(PipelineEvent::Retrying {
                    task: id,
                    attempt,
                    delay,
                    reason: error.to_string(),
                })
                .await;
            }
            Transition::Failed { error, fallback } => {
                self.queue.complete(claim, TaskState::Failed).await;
                error!(
                    task = %id,
                    attempt,
                    %error,
                    fallback_written = fallback.is_some(),
                    status = "failed",
                    "generation gave up"
                );
                self.emit(PipelineEvent::Failed {
                    task: id,
                    reason: error.to_string(),
                })
                .await;
            }
            Transition::Discarded { reason } => {
                self.queue.complete(claim, TaskState::Discarded).await;
                info!(task = %id, attempt, %reason, status = "discarded", "generation discarded");
                self.emit(PipelineEvent::Discarded {
                    task: id,
                    reason: reason.to_string(),
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Snapshot the queue to the journal. Failures are logged, not fatal.
    async fn persist(&self) {
        let journal = self.journal.lock().await;
        let tasks = self.queue.snapshot().await;
        if let Err(e) = journal.save(&tasks).await {
            warn!(error = %e, pending = tasks.len(), "failed to save queue journal");
        }
    }
}
