use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::lease::{Lease, LeaseTable};
use crate::types::{ConversationId, TaskId, TurnId};

/// Durable part of a generation task. Everything else is rebuilt per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub conversation_id: ConversationId,
    /// The user turn this task answers.
    pub user_turn: TurnId,
    pub user_text: String,
    /// Deliveries so far, the current one included once claimed.
    pub attempts: u32,
    /// Attempts that ended in degenerate output.
    pub quality_strikes: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(conversation_id: ConversationId, user_turn: TurnId, user_text: String) -> Self {
        Self {
            id: TaskId::generate(),
            conversation_id,
            user_turn,
            user_text,
            attempts: 0,
            quality_strikes: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    /// Skipped on purpose: AI disabled or conversation cancelled.
    Discarded,
}

/// Coarse status exposed to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Failed,
    Discarded,
}

impl TaskState {
    pub fn status(self) -> TaskStatus {
        match self {
            TaskState::Queued | TaskState::Running | TaskState::Retrying => TaskStatus::Pending,
            TaskState::Succeeded => TaskStatus::Succeeded,
            TaskState::Failed => TaskStatus::Failed,
            TaskState::Discarded => TaskStatus::Discarded,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.status() != TaskStatus::Pending
    }
}

/// A delivered task plus the conversation lock it runs under.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: TaskRecord,
    pub lease: Lease,
}

#[derive(Debug)]
struct Entry {
    record: TaskRecord,
    seq: u64,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    /// One FIFO lane per conversation. Only a lane's head is deliverable.
    lanes: HashMap<ConversationId, VecDeque<Entry>>,
    states: HashMap<TaskId, TaskState>,
    leases: LeaseTable,
    next_seq: u64,
}

/// Work queue with visibility delays and single-flight delivery per
/// conversation.
///
/// A task stays at the head of its conversation's lane from enqueue until a
/// terminal transition, through retries and redeliveries, so later messages
/// of the same conversation wait behind it. Claims take a lease; a lease that
/// lapses makes the head deliverable again (at-least-once).
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lease_ttl: Duration,
}

impl TaskQueue {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lease_ttl,
        }
    }

    pub async fn push(&self, record: TaskRecord) {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let seq = state.next_seq;
        state.states.insert(record.id.clone(), TaskState::Queued);
        state
            .lanes
            .entry(record.conversation_id.clone())
            .or_default()
            .push_back(Entry {
                record,
                seq,
                visible_at: Instant::now(),
            });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Record a task that never entered the queue.
    pub async fn record_terminal(&self, id: TaskId, terminal: TaskState) {
        self.state.lock().await.states.insert(id, terminal);
    }

    /// Deliver the oldest visible lane head whose conversation is unlocked.
    pub async fn claim(&self) -> Option<Claim> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        let mut candidates: Vec<(u64, ConversationId)> = state
            .lanes
            .iter()
            .filter_map(|(conv, lane)| {
                let head = lane.front()?;
                (head.visible_at <= now && !state.leases.is_held(conv, now))
                    .then(|| (head.seq, conv.clone()))
            })
            .collect();
        candidates.sort();

        let (_, conv) = candidates.into_iter().next()?;
        let lease = state.leases.try_acquire(&conv, self.lease_ttl, now)?;
        let head = state.lanes.get_mut(&conv)?.front_mut()?;
        head.record.attempts += 1;
        let task = head.record.clone();
        state.states.insert(task.id.clone(), TaskState::Running);
        Some(Claim { task, lease })
    }

    /// Terminal transition: remove the head and free the conversation.
    pub async fn complete(&self, claim: &Claim, terminal: TaskState) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.leases.release(&claim.lease) {
            warn!(task = %claim.task.id, "lease lapsed before completion; leaving the task to its new holder");
            return;
        }
        let conv = &claim.task.conversation_id;
        if let Some(lane) = state.lanes.get_mut(conv) {
            if lane.front().is_some_and(|e| e.record.id == claim.task.id) {
                lane.pop_front();
            }
            if lane.is_empty() {
                state.lanes.remove(conv);
            }
        }
        state.states.insert(claim.task.id.clone(), terminal);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Park the head until `delay` has passed. The lane stays blocked behind
    /// it but the worker and the lease are released.
    pub async fn retry(&self, claim: &Claim, delay: Duration, quality_strikes: u32) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.leases.release(&claim.lease) {
            warn!(task = %claim.task.id, "lease lapsed before retry was scheduled; leaving the task to its new holder");
            return;
        }
        let head = state
            .lanes
            .get_mut(&claim.task.conversation_id)
            .and_then(|lane| lane.front_mut())
            .filter(|e| e.record.id == claim.task.id);
        if let Some(head) = head {
            head.visible_at = Instant::now() + delay;
            head.record.quality_strikes = quality_strikes;
            state.states.insert(claim.task.id.clone(), TaskState::Retrying);
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    pub async fn state_of(&self, id: &TaskId) -> Option<TaskState> {
        self.state.lock().await.states.get(id).copied()
    }

    /// When the next parked or locked head might become deliverable.
    pub async fn next_wakeup(&self) -> Option<Instant> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .lanes
            .iter()
            .filter_map(|(conv, lane)| {
                let head = lane.front()?;
                Some(match state.leases.expiry(conv, now) {
                    Some(expires_at) => expires_at.max(head.visible_at),
                    None => head.visible_at,
                })
            })
            .min()
    }

    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.lanes.values().map(VecDeque::len).sum()
    }

    /// Every queued task, oldest first, for journaling.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.lanes.values().flatten().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Wait for a push, completion, or retry.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(conv: &str, turn: u64) -> TaskRecord {
        TaskRecord::new(ConversationId::new(conv), TurnId(turn), format!("msg {turn}"))
    }

    fn queue() -> TaskQueue {
        TaskQueue::new(Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn one_claim_per_conversation_at_a_time() {
        let q = queue();
        q.push(record("a", 1)).await;
        q.push(record("a", 2)).await;

        let first = q.claim().await.unwrap();
        assert_eq!(first.task.user_turn, TurnId(1));
        assert!(q.claim().await.is_none());

        q.complete(&first, TaskState::Succeeded).await;
        let second = q.claim().await.unwrap();
        assert_eq!(second.task.user_turn, TurnId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn other_conversations_proceed_in_parallel() {
        let q = queue();
        q.push(record("a", 1)).await;
        q.push(record("a", 2)).await;
        q.push(record("b", 3)).await;

        let a = q.claim().await.unwrap();
        let b = q.claim().await.unwrap();
        assert_eq!(a.task.conversation_id, ConversationId::new("a"));
        assert_eq!(b.task.conversation_id, ConversationId::new("b"));
        assert!(q.claim().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retried_head_blocks_its_lane_until_visible() {
        let q = queue();
        q.push(record("a", 1)).await;
        q.push(record("a", 2)).await;

        let first = q.claim().await.unwrap();
        q.retry(&first, Duration::from_secs(5), 0).await;
        assert_eq!(q.state_of(&first.task.id).await, Some(TaskState::Retrying));
        // Message 2 must not overtake message 1 during the backoff.
        assert!(q.claim().await.is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = q.claim().await.unwrap();
        assert_eq!(again.task.id, first.task.id);
        assert_eq!(again.task.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_redelivers_the_head() {
        let q = TaskQueue::new(Duration::from_secs(10));
        q.push(record("a", 1)).await;
        let crashed = q.claim().await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let redelivered = q.claim().await.unwrap();
        assert_eq!(redelivered.task.id, crashed.task.id);
        assert_eq!(redelivered.task.attempts, 2);

        // A late completion from the lapsed holder changes nothing.
        q.complete(&crashed, TaskState::Failed).await;
        assert_eq!(q.pending().await, 1);
        assert_eq!(q.state_of(&crashed.task.id).await, Some(TaskState::Running));

        q.complete(&redelivered, TaskState::Succeeded).await;
        assert_eq!(q.pending().await, 0);
        assert_eq!(q.state_of(&crashed.task.id).await, Some(TaskState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_holder_cannot_park_the_new_holders_task() {
        let q = TaskQueue::new(Duration::from_secs(10));
        q.push(record("a", 1)).await;
        q.push(record("a", 2)).await;
        let crashed = q.claim().await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let redelivered = q.claim().await.unwrap();

        q.retry(&crashed, Duration::from_secs(30), 1).await;
        assert_eq!(q.state_of(&crashed.task.id).await, Some(TaskState::Running));

        // The live holder still owns the lane and can finish normally.
        q.complete(&redelivered, TaskState::Succeeded).await;
        let next = q.claim().await.unwrap();
        assert_eq!(next.task.user_turn.0, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_collapses_to_api_view() {
        let q = queue();
        let r = record("a", 1);
        let id = r.id.clone();
        q.push(r).await;
        assert_eq!(q.state_of(&id).await.map(TaskState::status), Some(TaskStatus::Pending));
        let claim = q.claim().await.unwrap();
        q.complete(&claim, TaskState::Failed).await;
        assert_eq!(q.state_of(&id).await.map(TaskState::status), Some(TaskStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_in_enqueue_order() {
        let q = queue();
        q.push(record("b", 1)).await;
        q.push(record("a", 2)).await;
        q.push(record("b", 3)).await;
        let turns: Vec<u64> = q.snapshot().await.iter().map(|r| r.user_turn.0).collect();
        assert_eq!(turns, vec![1, 2, 3]);
    }
}
