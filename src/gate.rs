use crate::error::GenerationError;
use crate::types::Origin;

/// Whether a turn may trigger (or continue) a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Skip silently. Not a failure: nothing is retried and nothing is written.
    Skip(GenerationError),
}

/// Pure predicate consulted before enqueue and again right before execution,
/// since an operator may flip the flag in between.
pub struct AdminGate;

impl AdminGate {
    pub fn evaluate(ai_enabled: bool, trigger: Origin) -> GateDecision {
        if trigger != Origin::User {
            return GateDecision::Skip(GenerationError::InvalidRequest(format!(
                "{trigger:?} turns do not trigger generation"
            )));
        }
        if !ai_enabled {
            return GateDecision::Skip(GenerationError::Disabled);
        }
        GateDecision::Proceed
    }
}
