//! Phase runner: the turn loop of one attempt.
//!
//! An attempt ends when the model answers without a tool call (the explicit
//! completion signal), when the loop-until validator accepts that answer, or
//! when `max_turns` runs out. Everything it produces stays in a private
//! [`AttemptResult`] until a controller decides to commit it.

mod routing;
mod state;

pub use routing::{Route, RouteSource, resolve_route};
pub use state::{AttemptKey, PhaseState};

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cascade::{PhaseDef, ToolProtocol, render_instructions};
use crate::context::{ContextAssembler, Retention};
use crate::echo::{ArtifactRef, Echo, ErrorKind, ErrorRecord, Message, MessageKind, PhaseRecord};
use crate::errors::PhaseError;
use crate::provider::Usage;
use crate::scheduler::ExecutionContext;
use crate::tools::describe_tools;
use crate::trace::{TraceKind, Tracer};
use crate::turn::{AttemptState, TurnExecutor, TurnOutcome};

const DEFAULT_KICKOFF: &str = "Begin.";

/// What one attempt should run.
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    pub key: AttemptKey,
    /// Final instruction text (rendered, mutated, feedback appended).
    pub instructions: String,
    pub model: String,
    /// Extra context placed after prior phases, e.g. the output being refined.
    pub seed: Vec<Message>,
}

/// Private outcome of a completed attempt.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub key: AttemptKey,
    pub model: String,
    pub instructions: String,
    pub output: String,
    /// System message followed by the attempt's conversation.
    pub messages: Vec<Message>,
    pub images: Vec<ArtifactRef>,
    pub state: BTreeMap<String, Value>,
    pub route: Option<String>,
    pub usage: Usage,
    pub errors: Vec<ErrorRecord>,
    pub turn_seq: u64,
    pub turns: u32,
}

impl AttemptResult {
    pub fn label(&self) -> String {
        self.key.label()
    }

    /// Merge into the Echo as the phase's result.
    pub fn commit(self, echo: &mut Echo, phase: &str, retention: Retention) {
        echo.extend_errors(self.errors);
        let record = PhaseRecord {
            phase: phase.to_string(),
            attempt: self.key.label(),
            output: self.output,
            messages: self.messages,
            images: self.images,
            state_keys: Vec::new(),
            retention,
        };
        echo.commit_phase(record, self.state, self.turn_seq);
    }
}

/// A failed attempt together with the errors it recorded before failing.
#[derive(Debug)]
pub struct AttemptFailure {
    pub key: AttemptKey,
    pub error: PhaseError,
    pub errors: Vec<ErrorRecord>,
    pub usage: Usage,
}

impl AttemptFailure {
    /// All error records, the terminal failure included.
    pub fn into_records(self, phase: &str) -> Vec<ErrorRecord> {
        let label = self.key.label();
        self.into_phase_failure().into_records(phase, &label)
    }

    /// Keep the attempt's recorded errors; the terminal error stays separate.
    pub fn into_phase_failure(self) -> PhaseFailure {
        PhaseFailure {
            error: self.error,
            errors: self.errors,
        }
    }
}

/// A phase-level failure and the errors recorded on the way to it.
#[derive(Debug)]
pub struct PhaseFailure {
    pub error: PhaseError,
    pub errors: Vec<ErrorRecord>,
}

impl PhaseFailure {
    pub fn with_errors(mut self, errors: impl IntoIterator<Item = ErrorRecord>) -> Self {
        self.errors.extend(errors);
        self
    }

    /// Every error record, ending with the unrecovered terminal one.
    ///
    /// A transport failure already recorded by the turn is not repeated.
    pub fn into_records(self, phase: &str, attempt: &str) -> Vec<ErrorRecord> {
        let mut errors = self.errors;
        let kind = error_kind(&self.error);
        if !errors.iter().any(|e| !e.recovered && e.kind == kind) {
            errors.push(
                ErrorRecord::new(phase, attempt, kind, self.error.to_string()).unrecovered(),
            );
        }
        errors
    }
}

impl From<PhaseError> for PhaseFailure {
    fn from(error: PhaseError) -> Self {
        Self {
            error,
            errors: Vec::new(),
        }
    }
}

/// Error-list category of a phase failure.
pub fn error_kind(error: &PhaseError) -> ErrorKind {
    match error {
        PhaseError::Transport { .. } => ErrorKind::Transport,
        PhaseError::TurnBudgetExhausted { .. }
        | PhaseError::TokenBudgetExceeded { .. }
        | PhaseError::TokenAllowanceExhausted { .. } => ErrorKind::Resource,
        PhaseError::AllCandidatesRejected { .. }
        | PhaseError::Validator { .. }
        | PhaseError::ReforgeThresholdNotMet { .. }
        | PhaseError::Template { .. } => ErrorKind::Validation,
        PhaseError::AllCandidatesFailed { .. } => ErrorKind::Evaluation,
        PhaseError::Cancelled => ErrorKind::Cancelled,
        PhaseError::Other(_) => ErrorKind::Tool,
    }
}

/// Render a phase's instruction template against the Echo.
pub fn base_instructions(phase: &PhaseDef, echo: &Echo) -> Result<String, PhaseError> {
    render_instructions(&phase.name, &phase.instructions, echo)
}

/// Runs attempts of one phase against a fixed Echo snapshot.
pub struct PhaseRunner<'a> {
    ctx: &'a ExecutionContext,
    phase: &'a PhaseDef,
    snapshot: &'a Echo,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(ctx: &'a ExecutionContext, phase: &'a PhaseDef, snapshot: &'a Echo) -> Self {
        Self {
            ctx,
            phase,
            snapshot,
        }
    }

    fn max_turns(&self) -> u32 {
        self.phase
            .rules
            .max_turns
            .unwrap_or(self.ctx.config().engine.default_max_turns)
            .max(1)
    }

    fn system_prompt(&self, instructions: &str, executor: &TurnExecutor<'_>) -> String {
        let mut text = instructions.to_string();
        if self.phase.tool_protocol == ToolProtocol::Prompt && !executor.schemas().is_empty() {
            text.push_str("\n\n");
            text.push_str(&describe_tools(executor.schemas()));
        }
        if let Some(validator) = &self.phase.rules.loop_until
            && !self.phase.rules.loop_until_silent
        {
            let criteria = self
                .phase
                .rules
                .loop_until_prompt
                .as_deref()
                .or_else(|| self.ctx.runtime.validators.criteria(validator))
                .unwrap_or_default();
            if !criteria.trim().is_empty() {
                text.push_str("\n\n## Completion criteria\n");
                text.push_str(criteria.trim());
            }
        }
        text
    }

    fn kickoff(&self) -> Result<String, PhaseError> {
        match &self.phase.rules.turn_prompt {
            Some(prompt) => render_instructions(&self.phase.name, prompt, self.snapshot),
            None => Ok(DEFAULT_KICKOFF.to_string()),
        }
    }

    /// Run one attempt to completion.
    ///
    /// Cancellation of the execution token is observed between and during
    /// turns; a cancelled attempt returns [`PhaseError::Cancelled`].
    pub async fn run(&self, plan: AttemptPlan, tracer: &Tracer) -> Result<AttemptResult, AttemptFailure> {
        let label = plan.key.label();
        let tracer = tracer.for_attempt(&label);
        let mut attempt = AttemptState::new(&label, self.snapshot.turn_seq());

        match self.drive(&plan, &mut attempt, &tracer).await {
            Ok((system, output)) => {
                let mut messages = Vec::with_capacity(attempt.conversation.len() + 1);
                messages.push(system);
                messages.extend(attempt.conversation);
                Ok(AttemptResult {
                    key: plan.key,
                    model: plan.model,
                    instructions: plan.instructions,
                    output,
                    messages,
                    images: attempt.images,
                    state: attempt.state,
                    route: attempt.route,
                    usage: attempt.usage,
                    errors: attempt.errors,
                    turn_seq: attempt.turn_seq,
                    turns: attempt.turns,
                })
            }
            Err(error) => {
                debug!(phase = %self.phase.name, attempt = %label, "Attempt failed: {}", error);
                Err(AttemptFailure {
                    key: plan.key,
                    error,
                    errors: attempt.errors,
                    usage: attempt.usage,
                })
            }
        }
    }

    async fn drive(
        &self,
        plan: &AttemptPlan,
        attempt: &mut AttemptState,
        tracer: &Tracer,
    ) -> Result<(Message, String), PhaseError> {
        let assembler = ContextAssembler::new(&self.ctx.cascade, self.phase, self.snapshot);
        let executor = TurnExecutor::new(
            self.ctx,
            self.phase,
            &plan.model,
            assembler.expiry(),
            tracer.clone(),
        )?;

        let system = Message::system(self.system_prompt(&plan.instructions, &executor)).at(
            &self.phase.name,
            &attempt.label,
            attempt.turn_seq + 1,
        );
        let mut prior = assembler.prior();
        prior.extend(plan.seed.iter().cloned());
        attempt.conversation.push(
            Message::user(MessageKind::Prompt, self.kickoff()?).at(
                &self.phase.name,
                &attempt.label,
                attempt.turn_seq + 1,
            ),
        );

        let max_turns = self.max_turns();
        let mut state = PhaseState::Running;
        let mut last_rejection: Option<String> = None;

        while attempt.turns < max_turns {
            let outcome = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(PhaseError::Cancelled),
                outcome = executor.execute(attempt, &system, &prior) => outcome?,
            };

            let content = match outcome {
                TurnOutcome::TransportError(e) => {
                    state.advance(PhaseState::Failed);
                    return Err(e);
                }
                TurnOutcome::ProtocolError(_) => continue,
                TurnOutcome::Ok { tool_calls, .. } if tool_calls > 0 => continue,
                TurnOutcome::Ok { content, .. } => content,
            };

            let Some(validator) = &self.phase.rules.loop_until else {
                state.advance(PhaseState::Complete);
                return Ok((system, content));
            };

            state.advance(PhaseState::AwaitingValidator);
            let verdict = self.ctx.runtime.validators.check(validator, &content).await?;
            tracer.emit(tracer.record(TraceKind::Ward).detail(json!({
                "stage": "loop_until",
                "validator": validator,
                "valid": verdict.valid,
                "reason": verdict.reason,
                "turn": attempt.turns,
            })));
            if verdict.valid {
                info!(phase = %self.phase.name, attempt = %attempt.label, turns = attempt.turns, "loop_until satisfied");
                state.advance(PhaseState::Complete);
                return Ok((system, content));
            }

            state.advance(PhaseState::Running);
            let feedback = if verdict.reason.is_empty() {
                "The answer did not meet the completion criteria. Revise it and answer again.".to_string()
            } else {
                format!(
                    "The answer did not meet the completion criteria: {}\nRevise it and answer again.",
                    verdict.reason
                )
            };
            attempt.conversation.push(
                Message::user(MessageKind::Feedback, feedback).at(
                    &self.phase.name,
                    &attempt.label,
                    attempt.turn_seq,
                ),
            );
            last_rejection = Some(verdict.reason);
        }

        if let Some(validator) = &self.phase.rules.loop_until {
            state.advance(PhaseState::Failed);
            return Err(PhaseError::TurnBudgetExhausted {
                phase: self.phase.name.clone(),
                turns: max_turns,
                reason: format!(
                    "validator '{}' never accepted the output{}",
                    validator,
                    last_rejection
                        .map(|r| format!(" (last reason: {})", r))
                        .unwrap_or_default()
                ),
            });
        }

        warn!(
            phase = %self.phase.name,
            attempt = %attempt.label,
            max_turns,
            "Turn budget used up without a final answer; keeping the last response"
        );
        state.advance(PhaseState::Complete);
        let output = attempt.last_output().unwrap_or_default().to_string();
        Ok((system, output))
    }
}
