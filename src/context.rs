use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::budget::{truncate_to_tokens, ByteHeuristic, TokenEstimator};
use crate::error::ContextError;
use crate::types::{Origin, Turn, TurnId};

/// Opening line used when a conversation has nothing renderable yet.
pub const DEFAULT_OPENING_LINE: &str = "Hello.";

const TURN_SEPARATOR: &str = "\n\n";
const OPEN_SLOT: &str = "Assistant:";

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User: ",
            Role::Assistant => "Assistant: ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// What the gateway sends: persona text plus an oldest-first message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    /// Flatten into a single completion-style transcript ending with an open
    /// assistant slot.
    pub fn render(&self) -> String {
        let mut out = self.system.clone();
        out.push_str(TURN_SEPARATOR);
        out.push_str(&self.render_turns());
        out
    }

    /// Transcript of the messages alone, for backends that take the system
    /// text as a separate field.
    pub fn render_turns(&self) -> String {
        let mut out = String::with_capacity(
            self.messages.iter().map(|m| m.content.len() + 16).sum::<usize>(),
        );
        for msg in &self.messages {
            out.push_str(msg.role.label());
            out.push_str(&msg.content);
            out.push_str(TURN_SEPARATOR);
        }
        out.push_str(OPEN_SLOT);
        out
    }

    /// The newest user message, if any.
    pub fn latest_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Observability metadata for one built window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptStats {
    pub turns_included: usize,
    pub turns_dropped: usize,
    /// Everything [`Prompt::render`] produces: system text, labelled turns,
    /// separators and the open assistant slot.
    pub tokens_used: u32,
    pub truncated: bool,
    pub opening_inserted: bool,
    /// Tokens taken from the reserved output allowance to fit the minimum
    /// slice of the latest user turn. Zero in the normal case.
    pub reserve_borrowed: u32,
    /// What is left for the answer: the reserved allowance minus anything
    /// borrowed. Callers cap `max_output_tokens` at this.
    pub output_allowance: u32,
}

#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub prompt: Prompt,
    pub stats: PromptStats,
}

// ---------------------------------------------------------------------------
// Token Budget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    /// Model context limit.
    pub context_window: u32,
    /// Tokens held back for the model's answer.
    pub reserved_output: u32,
}

impl TokenBudget {
    /// Usable space for input (system + turns).
    pub fn effective_window(&self) -> u32 {
        self.context_window.saturating_sub(self.reserved_output)
    }
}

// ---------------------------------------------------------------------------
// History threading
// ---------------------------------------------------------------------------

/// Arrange stored turns into the history a task for `trigger` should see.
///
/// Operator turns are dropped. User turns newer than the trigger, and replies
/// to them, belong to later tasks and are dropped too. Assistant replies are
/// placed right after the user turn they answer, regardless of write order.
pub fn thread_history(turns: &[Turn], trigger: TurnId) -> Vec<Turn> {
    let mut kept: Vec<&Turn> = turns
        .iter()
        .filter(|t| match t.origin {
            Origin::Operator => false,
            Origin::User => t.id <= trigger,
            Origin::Assistant => t.reply_to.unwrap_or(t.id) <= trigger,
        })
        .collect();
    kept.sort_by_key(|t| match (t.origin, t.reply_to) {
        (Origin::Assistant, Some(parent)) => (parent, 1, t.id),
        _ => (t.id, 0, t.id),
    });
    kept.into_iter().cloned().collect()
}

// ---------------------------------------------------------------------------
// ContextWindowBuilder
// ---------------------------------------------------------------------------

/// Prices a message body as it is rendered, label and separator included.
struct Framed<'a> {
    inner: &'a dyn TokenEstimator,
    label: &'static str,
}

impl TokenEstimator for Framed<'_> {
    fn estimate(&self, text: &str) -> u32 {
        self.inner
            .estimate(&format!("{}{text}{TURN_SEPARATOR}", self.label))
    }
}

/// Selects the newest suffix of history that fits the budget and renders it.
pub struct ContextWindowBuilder {
    budget: TokenBudget,
    estimator: Arc<dyn TokenEstimator>,
    min_turn_tokens: u32,
    opening_line: String,
}

impl ContextWindowBuilder {
    pub fn new(context_window: u32, reserved_output: u32) -> Self {
        Self {
            budget: TokenBudget {
                context_window,
                reserved_output,
            },
            estimator: Arc::new(ByteHeuristic::default()),
            min_turn_tokens: 8,
            opening_line: DEFAULT_OPENING_LINE.into(),
        }
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Arc::new(estimator);
        self
    }

    /// Smallest slice of the mandatory turn worth sending after truncation.
    pub fn with_min_turn_tokens(mut self, tokens: u32) -> Self {
        self.min_turn_tokens = tokens;
        self
    }

    pub fn with_opening_line(mut self, line: impl Into<String>) -> Self {
        self.opening_line = line.into();
        self
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Fixed part of every prompt: the system text with its separator plus
    /// the open assistant slot at the end.
    pub fn frame_cost(&self, system: &str) -> u32 {
        self.estimator
            .estimate(&format!("{system}{TURN_SEPARATOR}"))
            .saturating_add(self.estimator.estimate(OPEN_SLOT))
    }

    /// Cost of one message as rendered.
    pub fn message_cost(&self, role: Role, content: &str) -> u32 {
        self.framed(role).estimate(content)
    }

    fn framed(&self, role: Role) -> Framed<'_> {
        Framed {
            inner: self.estimator.as_ref(),
            label: role.label(),
        }
    }

    /// Build a prompt from persona text and oldest-first turns.
    ///
    /// Turns are walked oldest to newest; each is discarded while the
    /// remaining suffix still overflows, and the walk stops at the first turn
    /// from which everything fits. The newest user turn is never discarded:
    /// if it alone overflows it is cut down to what is left. When less than
    /// `min_turn_tokens` is left, the slice is taken out of the reserved
    /// output allowance instead, and the prompt never passes the model's
    /// context limit.
    pub fn build(&self, system: &str, turns: &[Turn]) -> Result<ContextWindow, ContextError> {
        let effective = self.budget.effective_window();
        let limit = self.budget.context_window;
        let system_cost = self.frame_cost(system);

        let mut messages: Vec<PromptMessage> = turns
            .iter()
            .filter_map(|t| {
                let role = match t.origin {
                    Origin::User => Role::User,
                    Origin::Assistant => Role::Assistant,
                    Origin::Operator => return None,
                };
                let text = t.text.trim();
                if text.is_empty() {
                    return None;
                }
                Some(PromptMessage {
                    role,
                    content: text.to_string(),
                })
            })
            .collect();

        let mut stats = PromptStats::default();
        if messages.is_empty() {
            messages.push(PromptMessage {
                role: Role::User,
                content: self.opening_line.clone(),
            });
            stats.opening_inserted = true;
        }

        let costs: Vec<u32> = messages
            .iter()
            .map(|m| self.message_cost(m.role, &m.content))
            .collect();
        let mandatory = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(messages.len() - 1);

        let mut running = system_cost.saturating_add(costs.iter().sum::<u32>());
        let mut start = 0;
        while running > effective && start < mandatory {
            running -= costs[start];
            start += 1;
        }

        let mut kept: Vec<PromptMessage> = messages.drain(start..).collect();
        if running > effective {
            // Only the mandatory turn (and possibly newer assistant turns) is
            // left and it still overflows: keep the mandatory turn alone.
            let idx = mandatory - start;
            let turn = kept.swap_remove(idx);
            let room = effective.saturating_sub(system_cost);
            let hard_room = limit.saturating_sub(system_cost);
            let target = room.max(self.min_turn_tokens);
            if target > hard_room {
                return Err(ContextError::BudgetExhausted {
                    available: hard_room,
                    required: self.min_turn_tokens,
                });
            }
            let content = truncate_to_tokens(&self.framed(turn.role), &turn.content, target);
            let cost = self.message_cost(turn.role, &content);
            if content.is_empty() || system_cost.saturating_add(cost) > limit {
                return Err(ContextError::BudgetExhausted {
                    available: hard_room,
                    required: target,
                });
            }
            stats.truncated = content.len() < turn.content.len();
            running = system_cost + cost;
            kept = vec![PromptMessage {
                role: turn.role,
                content,
            }];
        }

        stats.turns_included = if stats.opening_inserted { 0 } else { kept.len() };
        stats.turns_dropped = costs.len() - kept.len();
        stats.tokens_used = running;
        stats.reserve_borrowed = running.saturating_sub(effective);
        stats.output_allowance = self
            .budget
            .reserved_output
            .saturating_sub(stats.reserve_borrowed);

        debug!(
            included = stats.turns_included,
            dropped = stats.turns_dropped,
            tokens = stats.tokens_used,
            truncated = stats.truncated,
            borrowed = stats.reserve_borrowed,
            "context window built"
        );

        Ok(ContextWindow {
            prompt: Prompt {
                system: system.to_string(),
                messages: kept,
            },
            stats,
        })
    }
}
