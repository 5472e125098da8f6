//! Typed error hierarchy for the windlass engine.
//!
//! Four enums cover the subsystems that need matchable failures:
//! - `CascadeError`: structural problems rejected before execution starts
//! - `PhaseError`: phase-scoped runtime failures
//! - `ProviderError`: model provider transport failures
//! - `ToolError`: capability dispatch failures

use thiserror::Error;

/// Structural errors in a cascade definition. Raised at load time, never mid-run.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Cascade '{cascade}' declares no phases")]
    Empty { cascade: String },

    #[error("Phase name '{name}' is declared more than once")]
    DuplicatePhase { name: String },

    #[error("Phase '{phase}' hands off to unknown phase '{target}'")]
    UnknownHandoff { phase: String, target: String },

    #[error("Phase '{phase}' reads context from unknown phase '{source_phase}'")]
    UnknownContextSource { phase: String, source_phase: String },

    #[error("Routing cycle detected: {}", .path.join(" -> "))]
    RoutingCycle { path: Vec<String> },

    #[error("Phase '{phase}' references unknown validator '{validator}'")]
    UnknownValidator { phase: String, validator: String },

    #[error("Phase '{phase}' references unknown tool '{tool}'")]
    UnknownTool { phase: String, tool: String },

    #[error("Phase '{phase}' is invalid: {message}")]
    InvalidPhase { phase: String, message: String },

    #[error("Failed to read cascade file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse cascade definition: {0}")]
    Parse(String),
}

/// Errors from executing a single phase (bare, soundings or reforge).
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Model call failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Phase '{phase}' exhausted its budget of {turns} turns without converging: {reason}")]
    TurnBudgetExhausted {
        phase: String,
        turns: u32,
        reason: String,
    },

    #[error("Context of ~{estimated} tokens exceeds the ceiling of {ceiling} tokens")]
    TokenBudgetExceeded { estimated: usize, ceiling: usize },

    #[error("Cascade token allowance exhausted: {used} of {limit} tokens used")]
    TokenAllowanceExhausted { used: u64, limit: u64 },

    #[error("All {count} candidates for phase '{phase}' were rejected by validator '{validator}'")]
    AllCandidatesRejected {
        phase: String,
        validator: String,
        count: usize,
    },

    #[error("All {count} candidates for phase '{phase}' failed; last error: {last_error}")]
    AllCandidatesFailed {
        phase: String,
        count: usize,
        last_error: String,
    },

    #[error("Failed to render instructions for phase '{phase}': {message}")]
    Template { phase: String, message: String },

    #[error("Validator '{validator}' could not be evaluated: {message}")]
    Validator { validator: String, message: String },

    #[error("Reforge for phase '{phase}' finished {steps} steps without satisfying '{validator}'")]
    ReforgeThresholdNotMet {
        phase: String,
        steps: u32,
        validator: String,
    },

    #[error("Phase execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    /// True for failures caused by running out of a budget rather than by a fault.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            PhaseError::TurnBudgetExhausted { .. }
                | PhaseError::TokenBudgetExceeded { .. }
                | PhaseError::TokenAllowanceExhausted { .. }
        )
    }
}

/// A failed request to a model provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    /// Transport status code, when the provider reports one.
    pub status: Option<u16>,
    /// Provider-supplied message.
    pub message: String,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
    /// Set when the call hit the per-call timeout.
    pub timed_out: bool,
}

impl ProviderError {
    /// A transient failure worth retrying.
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retryable: true,
            timed_out: false,
        }
    }

    /// A failure that retrying will not fix (bad request, auth).
    pub fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retryable: false,
            timed_out: false,
        }
    }

    /// A call that exceeded its deadline.
    pub fn timeout(secs: u64) -> Self {
        Self {
            status: None,
            message: format!("model call timed out after {}s", secs),
            retryable: true,
            timed_out: true,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider error (status {}): {}", status, self.message),
            None => write!(f, "provider error: {}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors from dispatching a capability by name.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("Invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Capability '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Capability '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_error_routing_cycle_renders_path() {
        let err = CascadeError::RoutingCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Routing cycle detected: a -> b -> a");
    }

    #[test]
    fn cascade_error_read_failed_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/cascades/draft.yaml");
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = CascadeError::ReadFailed {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            CascadeError::ReadFailed { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected ReadFailed"),
        }
    }

    #[test]
    fn phase_error_distinguishes_exhaustion_from_faults() {
        let exhausted = PhaseError::TurnBudgetExhausted {
            phase: "draft".into(),
            turns: 4,
            reason: "validator never accepted".into(),
        };
        assert!(exhausted.is_resource_exhaustion());
        assert!(PhaseError::TokenBudgetExceeded { estimated: 10, ceiling: 5 }.is_resource_exhaustion());

        let transport = PhaseError::Transport {
            attempts: 3,
            source: ProviderError::transient(Some(503), "overloaded"),
        };
        assert!(!transport.is_resource_exhaustion());
        assert!(transport.to_string().contains("3 attempts"));
    }

    #[test]
    fn provider_error_includes_status_and_message() {
        let err = ProviderError::permanent(Some(401), "bad key");
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "provider error (status 401): bad key");

        let timeout = ProviderError::timeout(30);
        assert!(timeout.retryable);
        assert!(timeout.timed_out);
        assert!(timeout.to_string().contains("30s"));
    }

    #[test]
    fn tool_error_variants_are_distinct() {
        let unknown = ToolError::UnknownCapability("search".into());
        let failed = ToolError::Failed {
            tool: "search".into(),
            message: "boom".into(),
        };
        assert!(matches!(unknown, ToolError::UnknownCapability(_)));
        assert!(!matches!(failed, ToolError::UnknownCapability(_)));
        assert_eq!(unknown.to_string(), "Unknown capability 'search'");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CascadeError::Parse("x".into()));
        assert_std_error(&PhaseError::Cancelled);
        assert_std_error(&ProviderError::transient(None, "x"));
        assert_std_error(&ToolError::UnknownCapability("x".into()));
    }
}
