//! Cascade scheduler: the public entry point for executing a cascade.
//!
//! Phases run one at a time in routing order. Each phase goes through its
//! pre-wards, executes (bare, soundings or reforge), passes its post-wards
//! (re-running on retry wards), and is then merged into the Echo before the
//! routing decision picks the next phase.
//!
//! ```ignore
//! let scheduler = CascadeScheduler::new(Runtime::builder(provider).build()?);
//! let outcome = scheduler.run(&cascade, json!({"topic": "tides"})).await?;
//! println!("{}: {:?}", outcome.status, outcome.final_output());
//! ```

mod runtime;

pub use runtime::{ExecutionContext, Runtime, RuntimeBuilder};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cascade::{CascadeDef, PhaseDef, RoutingGraph};
use crate::echo::{Echo, ErrorKind, ErrorRecord};
use crate::errors::CascadeError;
use crate::phase::{
    AttemptFailure, AttemptKey, AttemptPlan, AttemptResult, PhaseFailure, PhaseRunner, Route,
    base_instructions, resolve_route,
};
use crate::reforge::ReforgeController;
use crate::soundings::Orchestrator;
use crate::trace::{TraceKind, Tracer};
use crate::validation::{OnExhausted, WardMode, WardStage, check_wards};

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Completed, but failures were recorded along the way.
    CompletedWithErrors,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of [`CascadeScheduler::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: RunStatus,
    /// Final output per executed phase, in execution order.
    pub outputs: Vec<(String, String)>,
    pub echo: Echo,
    pub failed_phase: Option<String>,
    pub reason: Option<String>,
}

impl RunOutcome {
    pub fn output(&self, phase: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(name, _)| name == phase)
            .map(|(_, output)| output.as_str())
    }

    /// Output of the last phase that completed.
    pub fn final_output(&self) -> Option<&str> {
        self.outputs.last().map(|(_, output)| output.as_str())
    }

    pub fn state(&self) -> &BTreeMap<String, Value> {
        &self.echo.state
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        self.echo.errors()
    }
}

/// Why a phase stopped the cascade.
struct PhaseAbort {
    reason: String,
}

/// Executes cascades against one [`Runtime`].
#[derive(Debug, Clone)]
pub struct CascadeScheduler {
    runtime: Runtime,
    abort: CancellationToken,
}

impl CascadeScheduler {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            abort: CancellationToken::new(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Token that aborts every execution of this scheduler when cancelled.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Structural validation plus name resolution against the runtime.
    pub fn validate(&self, cascade: &CascadeDef) -> Result<RoutingGraph, CascadeError> {
        let graph = RoutingGraph::build(cascade)?;
        RoutingGraph::check_references(
            cascade,
            |v| self.runtime.validators.contains(v),
            |t| self.runtime.tools.contains(t),
        )?;
        Ok(graph)
    }

    /// Execute `cascade` with `input`.
    ///
    /// Structural problems are returned as `Err` before any model call.
    /// Everything that goes wrong at runtime is reported through the
    /// outcome's status and the Echo's error list.
    pub async fn run(&self, cascade: &CascadeDef, input: Value) -> Result<RunOutcome, CascadeError> {
        let graph = self.validate(cascade)?;
        let execution_id = Uuid::new_v4().to_string();
        let ctx = ExecutionContext::new(
            &execution_id,
            Arc::new(cascade.clone()),
            self.runtime.clone(),
            self.abort.child_token(),
        );
        let started = Instant::now();
        let tracer = Tracer::new(self.runtime.trace_sink.clone(), &execution_id).span(
            TraceKind::CascadeStarted,
            json!({
                "cascade_id": cascade.cascade_id,
                "phases": cascade.phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                "input": input,
            }),
        );
        info!(execution_id = %execution_id, cascade = %cascade.cascade_id, "Cascade started");

        let mut echo = Echo::new(&execution_id, input);
        let mut outputs = Vec::new();
        let mut failure: Option<(String, String)> = None;
        let mut current = Some(graph.entry().to_string());

        while let Some(name) = current.take() {
            let Some(phase) = cascade.phase(&name) else {
                break;
            };
            if ctx.cancel.is_cancelled() {
                echo.record_error(
                    ErrorRecord::new(&name, "", ErrorKind::Cancelled, "cascade aborted").unrecovered(),
                );
                failure = Some((name, "cascade aborted".to_string()));
                break;
            }

            match self.run_phase(&ctx, phase, &mut echo, &tracer).await {
                Ok(route) => {
                    outputs.push((name.clone(), echo.output(&name).unwrap_or_default().to_string()));
                    if let Route::Next(next) = route {
                        let scope = tracer.for_phase(&name);
                        scope.emit(
                            scope
                                .record(TraceKind::PhaseTransition)
                                .detail(json!({"from": name, "to": next})),
                        );
                        current = Some(next);
                    }
                }
                Err(abort) => {
                    failure = Some((name, abort.reason));
                    break;
                }
            }
        }

        let status = match (&failure, echo.has_errors()) {
            (Some(_), _) => RunStatus::Failed,
            (None, true) => RunStatus::CompletedWithErrors,
            (None, false) => RunStatus::Completed,
        };
        let ledger = ctx.gateway.ledger().snapshot();
        tracer.emit(
            tracer
                .record(TraceKind::CascadeCompleted)
                .duration(started.elapsed())
                .detail(json!({
                    "status": status,
                    "phases": outputs.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
                    "errors": echo.errors().len(),
                    "ledger": ledger,
                    "failed_phase": failure.as_ref().map(|(p, _)| p),
                    "reason": failure.as_ref().map(|(_, r)| r),
                })),
        );
        match &failure {
            Some((phase, reason)) => {
                warn!(execution_id = %execution_id, phase = %phase, "Cascade failed: {}", reason)
            }
            None => info!(
                execution_id = %execution_id,
                %status,
                tokens = ledger.total_tokens(),
                "Cascade finished"
            ),
        }

        let (failed_phase, reason) = failure.unzip();
        Ok(RunOutcome {
            execution_id,
            status,
            outputs,
            echo,
            failed_phase,
            reason,
        })
    }

    /// Run one phase to a committed result, or explain why the cascade stops.
    async fn run_phase(
        &self,
        ctx: &ExecutionContext,
        phase: &PhaseDef,
        echo: &mut Echo,
        tracer: &Tracer,
    ) -> Result<Route, PhaseAbort> {
        let started = Instant::now();
        let tracer = tracer.for_phase(&phase.name).span(
            TraceKind::PhaseStarted,
            json!({
                "model": ctx.model_for(phase),
                "soundings": phase.soundings.as_ref().map(|s| s.total_factor()),
                "reforge_steps": phase.reforge.as_ref().map(|r| r.steps),
            }),
        );
        info!(phase = %phase.name, "Phase started");

        let wards = phase.wards.clone().unwrap_or_default();
        let validators = &self.runtime.validators;
        let fail = |echo: &mut Echo, kind: ErrorKind, attempt: &str, reason: String| {
            echo.record_error(ErrorRecord::new(&phase.name, attempt, kind, reason.clone()).unrecovered());
            tracer.emit(tracer.record(TraceKind::Error).detail(json!({"reason": reason})));
            PhaseAbort { reason }
        };

        if !wards.pre.is_empty() {
            let input = serde_json::to_string(&echo.input).unwrap_or_default();
            let check = match check_wards(&wards.pre, WardStage::Pre, &input, validators, &tracer).await {
                Ok(check) => check,
                Err(e) => return Err(fail(echo, ErrorKind::Validation, "", e.to_string())),
            };
            if let Some(blocked) = check.blocked() {
                let reason = format!(
                    "pre-ward '{}' rejected the input: {}",
                    blocked.ward.validator, blocked.verdict.reason
                );
                return Err(fail(echo, ErrorKind::Validation, "", reason));
            }
            for advisory in check.advisory_failures() {
                echo.record_error(ErrorRecord::new(
                    &phase.name,
                    "",
                    ErrorKind::Validation,
                    format!("advisory pre-ward '{}': {}", advisory.ward.validator, advisory.verdict.reason),
                ));
            }
        }

        let base = match base_instructions(phase, echo) {
            Ok(base) => base,
            Err(e) => return Err(fail(echo, ErrorKind::Validation, "", e.to_string())),
        };

        let mut feedback: Vec<String> = Vec::new();
        let mut retry = 0u32;
        loop {
            let instructions = with_feedback(&base, &feedback);
            let label = AttemptKey::new(retry, 0, 0).label();
            let (result, side_errors) = match self.execute(ctx, phase, echo, retry, &instructions, &tracer).await {
                Ok(done) => done,
                Err(failure) => {
                    let reason = failure.error.to_string();
                    echo.extend_errors(failure.into_records(&phase.name, &label));
                    tracer.emit(tracer.record(TraceKind::Error).detail(json!({"reason": reason})));
                    warn!(phase = %phase.name, retry, "Phase failed: {}", reason);
                    return Err(PhaseAbort { reason });
                }
            };

            let check = match check_wards(&wards.post, WardStage::Post, &result.output, validators, &tracer).await {
                Ok(check) => check,
                Err(e) => {
                    echo.extend_errors(side_errors);
                    return Err(fail(echo, ErrorKind::Validation, &result.label(), e.to_string()));
                }
            };
            if let Some(blocked) = check.blocked() {
                echo.extend_errors(side_errors);
                let reason = format!(
                    "post-ward '{}' rejected the output: {}",
                    blocked.ward.validator, blocked.verdict.reason
                );
                return Err(fail(echo, ErrorKind::Validation, &result.label(), reason));
            }

            let retry_failures = check.retry_failures();
            let mut degraded = Vec::new();
            if !retry_failures.is_empty() {
                let executions = retry + 1;
                let exhausted: Vec<_> = retry_failures
                    .iter()
                    .filter(|o| executions >= o.ward.max_attempts)
                    .collect();
                if exhausted.is_empty() {
                    feedback.extend(retry_failures.iter().map(|o| {
                        format!("- {}: {}", o.ward.validator, o.verdict.reason)
                    }));
                    echo.extend_errors(side_errors);
                    echo.extend_errors(result.errors);
                    info!(phase = %phase.name, retry, "Retry ward rejected the output; re-running phase");
                    tracer.emit(tracer.record(TraceKind::Ward).detail(json!({
                        "stage": WardStage::Post,
                        "action": "retry",
                        "execution": executions,
                        "rejected_by": retry_failures.iter().map(|o| o.ward.validator.as_str()).collect::<Vec<_>>(),
                    })));
                    retry += 1;
                    continue;
                }
                if let Some(abort) = exhausted.iter().find(|o| o.ward.on_exhausted == OnExhausted::Abort) {
                    echo.extend_errors(side_errors);
                    let reason = format!(
                        "retry ward '{}' still rejected the output after {} executions: {}",
                        abort.ward.validator, executions, abort.verdict.reason
                    );
                    return Err(fail(echo, ErrorKind::Validation, &result.label(), reason));
                }
                degraded.extend(exhausted.iter().map(|o| {
                    ErrorRecord::new(
                        &phase.name,
                        &result.label(),
                        ErrorKind::Validation,
                        format!(
                            "retry ward '{}' exhausted {} executions, keeping last output: {}",
                            o.ward.validator, executions, o.verdict.reason
                        ),
                    )
                    .unrecovered()
                }));
            }
            let advisories: Vec<ErrorRecord> = check
                .advisory_failures()
                .iter()
                .map(|o| {
                    ErrorRecord::new(
                        &phase.name,
                        &result.label(),
                        ErrorKind::Validation,
                        format!("advisory post-ward '{}': {}", o.ward.validator, o.verdict.reason),
                    )
                })
                .collect();

            let retention = phase.retention.unwrap_or(ctx.cascade.retention);
            let (route, source) = resolve_route(&ctx.cascade, &phase.name, result.route.as_deref());
            let winner = result.label();
            let turns = result.turns;
            let usage = result.usage;

            echo.extend_errors(side_errors);
            result.commit(echo, &phase.name, retention);
            echo.extend_errors(advisories);
            echo.extend_errors(degraded);

            tracer.emit(
                tracer
                    .record(TraceKind::PhaseCompleted)
                    .attempt(&winner)
                    .usage(&usage)
                    .duration(started.elapsed())
                    .detail(json!({
                        "executions": retry + 1,
                        "turns": turns,
                        "route": route,
                        "route_source": source,
                    })),
            );
            info!(phase = %phase.name, attempt = %winner, executions = retry + 1, "Phase completed");
            return Ok(route);
        }
    }

    /// One execution of a phase body.
    ///
    /// Returns the result to merge plus errors recorded outside it.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        phase: &PhaseDef,
        snapshot: &Echo,
        retry: u32,
        instructions: &str,
        tracer: &Tracer,
    ) -> Result<(AttemptResult, Vec<ErrorRecord>), PhaseFailure> {
        if !phase.explores() {
            let plan = AttemptPlan {
                key: AttemptKey::new(retry, 0, 0),
                instructions: instructions.to_string(),
                model: ctx.model_for(phase),
                seed: Vec::new(),
            };
            return PhaseRunner::new(ctx, phase, snapshot)
                .run(plan, tracer)
                .await
                .map(|result| (result, Vec::new()))
                .map_err(AttemptFailure::into_phase_failure);
        }

        let orchestrator = Orchestrator::new(ctx, phase, snapshot);
        let first = orchestrator
            .run_step(orchestrator.initial_request(retry, instructions), tracer)
            .await?;
        let outcome = match &phase.reforge {
            Some(spec) => {
                ReforgeController::new(&orchestrator, spec)
                    .refine(first, retry, instructions, tracer)
                    .await?
            }
            None => first,
        };
        Ok((outcome.result, outcome.errors))
    }
}

/// Append accumulated ward rejections to the instructions.
fn with_feedback(base: &str, feedback: &[String]) -> String {
    if feedback.is_empty() {
        return base.to_string();
    }
    format!(
        "{}\n\n## Feedback from previous attempts\nYour earlier output was rejected:\n{}",
        base,
        feedback.join("\n")
    )
}
