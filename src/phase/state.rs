//! Phase instance lifecycle and attempt identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one phase attempt.
///
/// `Running` ⇄ `AwaitingValidator` while loop-until checks outputs, ending
/// in `Complete` or `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Running,
    AwaitingValidator,
    Complete,
    Failed,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, next),
            (Running, AwaitingValidator)
                | (Running, Complete)
                | (Running, Failed)
                | (AwaitingValidator, Running)
                | (AwaitingValidator, Complete)
                | (AwaitingValidator, Failed)
        )
    }

    /// Move to `next`, logging and ignoring illegal transitions.
    pub fn advance(&mut self, next: PhaseState) {
        if self.can_transition_to(next) {
            *self = next;
        } else {
            tracing::debug!(from = %self, to = %next, "Ignoring illegal phase transition");
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Running => write!(f, "running"),
            PhaseState::AwaitingValidator => write!(f, "awaiting-validator"),
            PhaseState::Complete => write!(f, "complete"),
            PhaseState::Failed => write!(f, "failed"),
        }
    }
}

/// Identity of one attempt within a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptKey {
    /// Ward retry number (0 for the first execution).
    pub retry: u32,
    /// Reforge step (0 for the initial exploration).
    pub step: u32,
    /// Sounding index within the step.
    pub index: u32,
}

impl AttemptKey {
    pub fn new(retry: u32, step: u32, index: u32) -> Self {
        Self { retry, step, index }
    }

    /// Label used in artifact paths, trace records and cache keys.
    pub fn label(&self) -> String {
        format!("r{}.s{}.c{}", self.retry, self.step, self.index)
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_until_cycle_is_legal() {
        let mut state = PhaseState::Running;
        state.advance(PhaseState::AwaitingValidator);
        state.advance(PhaseState::Running);
        state.advance(PhaseState::AwaitingValidator);
        state.advance(PhaseState::Complete);
        assert_eq!(state, PhaseState::Complete);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut state = PhaseState::Failed;
        state.advance(PhaseState::Running);
        assert_eq!(state, PhaseState::Failed);
        assert!(!PhaseState::Complete.can_transition_to(PhaseState::Failed));
    }

    #[test]
    fn test_attempt_label() {
        assert_eq!(AttemptKey::new(1, 2, 3).label(), "r1.s2.c3");
        assert_eq!(AttemptKey::default().to_string(), "r0.s0.c0");
        assert!(AttemptKey::new(0, 0, 1) < AttemptKey::new(0, 1, 0));
    }
}
