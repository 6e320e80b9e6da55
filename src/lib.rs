pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gate;
pub mod gateway;
pub mod journal;
pub mod lease;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod types;

pub use budget::{estimate_str_tokens, truncate_to_tokens, ByteHeuristic, TokenEstimator};
pub use config::PipelineConfig;
pub use context::{
    thread_history, ContextWindow, ContextWindowBuilder, Prompt, PromptMessage, PromptStats, Role,
    TokenBudget,
};
pub use error::{
    ConfigError, ContextError, GatewayError, GenerationError, PipelineError, StoreError,
};
pub use events::PipelineEvent;
pub use gate::{AdminGate, GateDecision};
pub use gateway::{
    CompletionRequest, CompletionResponse, Generation, HttpBackend, ModelBackend, ModelGateway,
    OllamaBackend, ParamBounds,
};
pub use journal::{FileJournal, NoJournal, QueueJournal};
pub use queue::{TaskRecord, TaskState, TaskStatus};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use store::{ConversationStore, MemoryStore, NewTurn};
pub use task::{TaskRunner, Transition};
pub use types::{
    ConversationId, GenerationOutcome, GenerationParams, GenerationRequest, HealthStatus, Origin,
    SessionHandle, TaskId, Turn, TurnId, Usage,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    // --- Mock Backend ---

    #[derive(Clone, Copy)]
    enum WhenEmpty {
        /// Reply "re: <latest user text>".
        Echo,
        /// Fail every call with a 503.
        Overloaded,
    }

    struct MockBackend {
        replies: Mutex<VecDeque<Result<CompletionResponse, GatewayError>>>,
        when_empty: WhenEmpty,
        seen: Mutex<Vec<CompletionRequest>>,
        health: HealthStatus,
        health_probes: AtomicUsize,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockBackend {
        fn scripted(replies: Vec<Result<CompletionResponse, GatewayError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                when_empty: WhenEmpty::Echo,
                seen: Mutex::new(Vec::new()),
                health: HealthStatus::Ready,
                health_probes: AtomicUsize::new(0),
                delay: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn echo() -> Self {
            Self::scripted(vec![])
        }

        fn overloaded() -> Self {
            Self {
                when_empty: WhenEmpty::Overloaded,
                ..Self::scripted(vec![])
            }
        }

        fn with_health(mut self, health: HealthStatus) -> Self {
            self.health = health;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        async fn calls(&self) -> usize {
            self.seen.lock().await.len()
        }
    }

    #[async_trait]
    impl ModelBackend for MockBackend {
        async fn health(&self) -> Result<HealthStatus, GatewayError> {
            self.health_probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.health)
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, GatewayError> {
            self.seen.lock().await.push(request.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = self.replies.lock().await.pop_front();
            match (scripted, self.when_empty) {
                (Some(reply), _) => reply,
                (None, WhenEmpty::Echo) => Ok(CompletionResponse {
                    text: format!("re: {}", request.prompt.latest_user().unwrap_or_default()),
                    session: None,
                    usage: Usage::default(),
                }),
                (None, WhenEmpty::Overloaded) => Err(GatewayError::ApiError {
                    status: 503,
                    body: "overloaded".into(),
                }),
            }
        }
    }

    // --- Cancelling Backend ---

    /// Blocks the conversation while the model is "thinking".
    struct CancellingBackend {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl ModelBackend for CancellingBackend {
        async fn health(&self) -> Result<HealthStatus, GatewayError> {
            Ok(HealthStatus::Ready)
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, GatewayError> {
            self.store
                .set_cancelled(&conv(), true)
                .await
                .map_err(|e| GatewayError::Request(e.to_string()))?;
            Ok(CompletionResponse {
                text: "You won't see this.".into(),
                session: Some(SessionHandle::new("late")),
                usage: Usage::default(),
            })
        }
    }

    // --- Panicking Backend ---

    /// Panics inside every completion, as a buggy backend might.
    struct PanickingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelBackend for PanickingBackend {
        async fn health(&self) -> Result<HealthStatus, GatewayError> {
            Ok(HealthStatus::Ready)
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("backend bug");
        }
    }

    // --- Helpers ---

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn reply(text: &str, session: Option<&str>) -> Result<CompletionResponse, GatewayError> {
        Ok(CompletionResponse {
            text: text.into(),
            session: session.map(SessionHandle::new),
            usage: Usage {
                input_tokens: 40,
                output_tokens: 8,
            },
        })
    }

    fn overloaded() -> Result<CompletionResponse, GatewayError> {
        Err(GatewayError::ApiError {
            status: 503,
            body: "overloaded".into(),
        })
    }

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_conversation(conv(), "You are Mira, a cheerful baker.")
            .await;
        store
    }

    fn scheduler(
        store: &Arc<MemoryStore>,
        backend: impl ModelBackend + 'static,
        config: &PipelineConfig,
    ) -> Scheduler {
        let dyn_store: Arc<dyn ConversationStore> = store.clone();
        Scheduler::new(dyn_store, config.gateway(backend), config)
    }

    fn assistant_texts(turns: &[Turn]) -> Vec<String> {
        turns
            .iter()
            .filter(|t| t.origin == Origin::Assistant)
            .map(|t| t.text.clone())
            .collect()
    }

    // --- Tests ---

    #[tokio::test]
    async fn reply_is_written_against_the_user_turn() {
        let backend = Arc::new(MockBackend::scripted(vec![reply("Fresh bread today!", Some("s1"))]));
        let store = store().await;
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "What's new?").await.unwrap();
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Pending);
        sched.drain().await;

        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Succeeded);
        let turns = store.turns(&conv()).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "Fresh bread today!");
        assert_eq!(turns[1].reply_to, Some(turns[0].id));
        assert_eq!(turns[1].task_id.as_ref(), Some(&id));
        assert_eq!(
            store.get_session_handle(&conv()).await.unwrap(),
            Some(SessionHandle::new("s1"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_backend_gets_exactly_max_attempts_then_one_fallback() {
        let backend = Arc::new(MockBackend::overloaded());
        let store = store().await;
        let config = PipelineConfig::default();
        let sched = scheduler(&store, backend.clone(), &config);

        let started = tokio::time::Instant::now();
        let id = sched.enqueue_generation(&conv(), "Hello?").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 3);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec![config.fallback_message.clone()]
        );
        // 5s after the first failure, 15s after the second.
        assert!(started.elapsed() >= Duration::from_secs(20));
        // Health is probed on the first attempt only.
        assert_eq!(backend.health_probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success() {
        let backend = Arc::new(MockBackend::scripted(vec![
            overloaded(),
            reply("Sorry for the wait!", None),
        ]));
        let store = store().await;
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 2);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Succeeded);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec!["Sorry for the wait!".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_request_fails_without_retry() {
        let backend = Arc::new(MockBackend::scripted(vec![Err(GatewayError::ApiError {
            status: 400,
            body: "bad parameters".into(),
        })]));
        let store = store().await;
        let config = PipelineConfig::default();
        let sched = scheduler(&store, backend.clone(), &config);

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 1);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec![config.fallback_message]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn degenerate_output_twice_is_fatal() {
        let backend = Arc::new(MockBackend::scripted(vec![
            reply("<|im_end|>", None),
            reply(" ", None),
            reply("never requested", None),
        ]));
        let store = store().await;
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 2);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(store.count_origin(&conv(), Origin::Assistant).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_in_quick_succession_are_answered_in_order() {
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_secs(1)));
        let store = store().await;
        let sched = Arc::new(scheduler(&store, backend.clone(), &PipelineConfig::default()));

        for text in ["M1", "M2", "M3"] {
            sched.enqueue_generation(&conv(), text).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let workers = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));
        while sched.pending().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();
        workers.await.unwrap();

        let turns = store.turns(&conv()).await;
        let users: Vec<TurnId> = turns
            .iter()
            .filter(|t| t.origin == Origin::User)
            .map(|t| t.id)
            .collect();
        let replies: Vec<(String, Option<TurnId>)> = turns
            .iter()
            .filter(|t| t.origin == Origin::Assistant)
            .map(|t| (t.text.clone(), t.reply_to))
            .collect();
        assert_eq!(
            replies,
            vec![
                ("re: M1".to_string(), Some(users[0])),
                ("re: M2".to_string(), Some(users[1])),
                ("re: M3".to_string(), Some(users[2])),
            ]
        );
        // Never two generations in flight for one conversation.
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);

        // M1's prompt must not see M2 or M3, which were already stored.
        let seen = backend.seen.lock().await;
        let first = seen[0].prompt.render();
        assert!(first.contains("M1"));
        assert!(!first.contains("M2") && !first.contains("M3"));
        // M3's prompt sees the earlier exchanges in order.
        let third = seen[2].prompt.render_turns();
        assert!(third.find("re: M1").unwrap() < third.find("M2").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn different_conversations_run_in_parallel() {
        let backend = Arc::new(MockBackend::echo().with_delay(Duration::from_secs(1)));
        let store = store().await;
        store
            .create_conversation(ConversationId::new("c2"), "You are Theo, a grumpy sailor.")
            .await;
        let sched = Arc::new(scheduler(&store, backend.clone(), &PipelineConfig::default()));

        sched.enqueue_generation(&conv(), "Hi Mira").await.unwrap();
        sched
            .enqueue_generation(&ConversationId::new("c2"), "Ahoy Theo")
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let workers = tokio::spawn(Arc::clone(&sched).run(shutdown.clone()));
        while sched.pending().await > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();
        workers.await.unwrap();

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(
            assistant_texts(&store.turns(&ConversationId::new("c2")).await),
            vec!["re: Ahoy Theo".to_string()]
        );
    }

    #[tokio::test]
    async fn disabled_conversation_gets_no_reply_but_keeps_user_turn() {
        let backend = Arc::new(MockBackend::echo());
        let store = store().await;
        store.set_ai_enabled(&conv(), false).await.unwrap();
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Anyone there?").await.unwrap();
        sched.drain().await;

        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Discarded);
        assert_eq!(backend.calls().await, 0);
        assert_eq!(store.count_origin(&conv(), Origin::User).await, 1);
        assert_eq!(store.count_origin(&conv(), Origin::Assistant).await, 0);
    }

    #[tokio::test]
    async fn disabling_after_enqueue_discards_before_running() {
        let backend = Arc::new(MockBackend::echo());
        let store = store().await;
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        store.set_ai_enabled(&conv(), false).await.unwrap();
        sched.drain().await;

        assert_eq!(sched.task_state(&id).await.unwrap(), TaskState::Discarded);
        assert_eq!(backend.calls().await, 0);
    }

    #[tokio::test]
    async fn cancellation_during_generation_discards_result() {
        let store = store().await;
        let backend = CancellingBackend {
            store: store.clone(),
        };
        let sched = scheduler(&store, backend, &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Discarded);
        assert_eq!(store.count_origin(&conv(), Origin::Assistant).await, 0);
        assert_eq!(store.get_session_handle(&conv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn operator_turns_never_reach_the_model() {
        let backend = Arc::new(MockBackend::echo());
        let store = store().await;
        store
            .append_turn(&conv(), NewTurn::operator("OPERATOR: user flagged for review"))
            .await
            .unwrap();
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        let seen = backend.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].prompt.render().contains("OPERATOR"));
        assert_eq!(seen[0].prompt.system, "You are Mira, a cheerful baker.");
    }

    #[tokio::test]
    async fn refreshed_session_is_persisted() {
        let backend = Arc::new(MockBackend::scripted(vec![reply("Welcome back!", Some("s2"))]));
        let store = store().await;
        store
            .set_session_handle(&conv(), Some(SessionHandle::new("s1")))
            .await
            .unwrap();
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        sched.enqueue_generation(&conv(), "I'm back").await.unwrap();
        sched.drain().await;

        assert_eq!(
            backend.seen.lock().await[0].session,
            Some(SessionHandle::new("s1"))
        );
        assert_eq!(
            store.get_session_handle(&conv()).await.unwrap(),
            Some(SessionHandle::new("s2"))
        );
    }

    #[tokio::test]
    async fn unavailable_health_still_attempts() {
        let backend = Arc::new(MockBackend::echo().with_health(HealthStatus::Unavailable));
        let store = store().await;
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default());

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 1);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn oversized_persona_fails_without_calling_the_model() {
        let backend = Arc::new(MockBackend::echo());
        let store = Arc::new(MemoryStore::new());
        store.create_conversation(conv(), "x".repeat(13_000)).await;
        let config = PipelineConfig::default();
        let sched = scheduler(&store, backend.clone(), &config);

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls().await, 0);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec![config.fallback_message]
        );
    }

    #[tokio::test]
    async fn persona_past_the_input_share_borrows_from_output_reserve() {
        let backend = Arc::new(MockBackend::echo());
        let store = Arc::new(MemoryStore::new());
        store.create_conversation(conv(), "x".repeat(11_500)).await;
        let config = PipelineConfig::default();
        let sched = scheduler(&store, backend.clone(), &config);

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Succeeded);
        let seen = backend.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt.latest_user(), Some("Hi"));
        let max_output = seen[0].params.max_output_tokens;
        assert!(max_output < config.params.max_output_tokens);
        assert!(
            estimate_str_tokens(&seen[0].prompt.render()) + max_output
                <= config.context.budget_tokens
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_backend_exhausts_attempts_then_writes_fallback() {
        let backend = Arc::new(PanickingBackend {
            calls: AtomicUsize::new(0),
        });
        let store = store().await;
        let config = PipelineConfig::default();
        let sched = scheduler(&store, backend.clone(), &config);

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sched.get_task_status(&id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec![config.fallback_message]
        );
    }

    #[tokio::test]
    async fn redelivered_task_does_not_duplicate_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = store().await;

        // A previous process wrote the reply but died before acknowledging it.
        let user = store.append_turn(&conv(), NewTurn::user("Hi")).await.unwrap();
        let task = TaskRecord::new(conv(), user.id, "Hi".into());
        store
            .append_turn(&conv(), NewTurn::assistant("Hello!", user.id, task.id.clone()))
            .await
            .unwrap();
        FileJournal::new(&path)
            .save(std::slice::from_ref(&task))
            .await
            .unwrap();

        // Calling the model again would fail the task.
        let backend = Arc::new(MockBackend::scripted(vec![Err(GatewayError::ApiError {
            status: 400,
            body: "bad request".into(),
        })]));
        let sched = scheduler(&store, backend.clone(), &PipelineConfig::default())
            .with_journal(FileJournal::new(&path));
        assert_eq!(sched.recover().await.unwrap(), 1);
        sched.drain().await;

        assert_eq!(backend.calls().await, 0);
        assert_eq!(sched.get_task_status(&task.id).await.unwrap(), TaskStatus::Succeeded);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec!["Hello!".to_string()]
        );
        // Journal is emptied once the task settles.
        assert!(FileJournal::new(&path).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_task_with_fallback_written_stays_failed() {
        let store = store().await;
        let config = PipelineConfig::default();

        let user = store.append_turn(&conv(), NewTurn::user("Hi")).await.unwrap();
        let task = TaskRecord::new(conv(), user.id, "Hi".into());
        store
            .append_turn(
                &conv(),
                NewTurn::assistant(config.fallback_message.clone(), user.id, task.id.clone()),
            )
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        FileJournal::new(&path)
            .save(std::slice::from_ref(&task))
            .await
            .unwrap();

        let backend = Arc::new(MockBackend::echo());
        let sched =
            scheduler(&store, backend.clone(), &config).with_journal(FileJournal::new(&path));
        assert_eq!(sched.recover().await.unwrap(), 1);
        sched.drain().await;

        assert_eq!(backend.calls().await, 0);
        assert_eq!(sched.get_task_status(&task.id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            assistant_texts(&store.turns(&conv()).await),
            vec![config.fallback_message]
        );
    }

    #[tokio::test]
    async fn events_follow_the_task_lifecycle() {
        let backend = Arc::new(MockBackend::echo());
        let store = store().await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        let sched = scheduler(&store, backend, &PipelineConfig::default()).with_events(tx);

        let id = sched.enqueue_generation(&conv(), "Hi").await.unwrap();
        sched.drain().await;
        drop(sched);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                PipelineEvent::Queued {
                    task: id.clone(),
                    conversation: conv(),
                },
                PipelineEvent::Started {
                    task: id.clone(),
                    attempt: 1,
                },
                PipelineEvent::Succeeded { task: id, attempt: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn unknown_task_status_is_an_error() {
        let store = store().await;
        let sched = scheduler(&store, MockBackend::echo(), &PipelineConfig::default());
        let err = sched
            .get_task_status(&TaskId("task_missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownTask(_)));
    }
}
