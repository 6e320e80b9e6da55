use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::ConversationId;

/// Proof of holding a conversation's lock until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub conversation: ConversationId,
    pub token: u64,
    pub expires_at: Instant,
}

/// Per-conversation locks that lapse on their own. A worker that dies
/// mid-generation cannot orphan a conversation for longer than one TTL.
#[derive(Debug, Default)]
pub struct LeaseTable {
    held: HashMap<ConversationId, Lease>,
    next_token: u64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free or its previous holder's lease has lapsed.
    pub fn try_acquire(
        &mut self,
        conversation: &ConversationId,
        ttl: Duration,
        now: Instant,
    ) -> Option<Lease> {
        if self.is_held(conversation, now) {
            return None;
        }
        self.next_token += 1;
        let lease = Lease {
            conversation: conversation.clone(),
            token: self.next_token,
            expires_at: now + ttl,
        };
        self.held.insert(conversation.clone(), lease.clone());
        Some(lease)
    }

    /// Release only if `lease` is still the current holder. Returns false for
    /// a lease that lapsed and was taken over.
    pub fn release(&mut self, lease: &Lease) -> bool {
        match self.held.get(&lease.conversation) {
            Some(current) if current.token == lease.token => {
                self.held.remove(&lease.conversation);
                true
            }
            _ => false,
        }
    }

    /// Expiry of the live lease on `conversation`, if any.
    pub fn expiry(&self, conversation: &ConversationId, now: Instant) -> Option<Instant> {
        self.held
            .get(conversation)
            .map(|l| l.expires_at)
            .filter(|at| *at > now)
    }

    pub fn is_held(&self, conversation: &ConversationId, now: Instant) -> bool {
        self.held
            .get(conversation)
            .is_some_and(|l| l.expires_at > now)
    }
}
