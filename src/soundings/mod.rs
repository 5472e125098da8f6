//! Soundings: run N candidate attempts of a phase and keep one.
//!
//! Every candidate starts from the same Echo snapshot and runs on its own
//! task under the shared worker semaphore. Candidates never see each other;
//! only the selected winner (or the aggregate of all survivors) comes back
//! to the caller for merging.
//!
//! ```yaml
//! soundings:
//!   models:
//!     - { model: fast, factor: 2 }
//!     - { model: strong, factor: 1 }
//!   validator: non_empty
//!   evaluator_instructions: "Pick the clearest answer"
//!   pareto: { policy: balanced }
//!   mutate: { mode: approach }
//! ```

mod aggregate;
mod evaluator;
mod pareto;

pub use aggregate::{AggregateMethod, AggregateSpec, concatenate, synthesize};
pub use evaluator::{
    DEFAULT_EVALUATOR_INSTRUCTIONS, Evaluation, Evaluator, EvaluatorChoice, LlmEvaluator,
    parse_evaluation,
};
pub use pareto::{ParetoPolicy, ParetoSpec, Point, RatioFormula, frontier, pick};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cascade::PhaseDef;
use crate::echo::{Echo, ErrorKind, ErrorRecord, Message};
use crate::errors::PhaseError;
use crate::mutation::{GatewayRewriter, MutationMode, MutationSpec, Variant, build_variants, species_hash};
use crate::phase::{
    AttemptFailure, AttemptKey, AttemptPlan, AttemptResult, PhaseFailure, PhaseRunner,
};
use crate::provider::{CallPurpose, RequestMeta, Usage};
use crate::scheduler::ExecutionContext;
use crate::trace::{TraceKind, Tracer};
use crate::util::truncate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundingsMode {
    /// Pick one winner.
    #[default]
    Evaluate,
    /// Combine all survivors.
    Aggregate,
}

/// Candidates assigned to one model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAllocation {
    pub model: String,
    #[serde(default = "default_factor")]
    pub factor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundingsSpec {
    /// Candidate count when `models` is empty.
    #[serde(default = "default_factor")]
    pub factor: usize,
    #[serde(default)]
    pub models: Vec<ModelAllocation>,
    #[serde(default)]
    pub evaluator_instructions: Option<String>,
    /// Pre-evaluation filter.
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub mode: SoundingsMode,
    #[serde(default)]
    pub mutate: Option<MutationSpec>,
    #[serde(default)]
    pub pareto: Option<ParetoSpec>,
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
}

fn default_factor() -> usize {
    1
}

impl Default for SoundingsSpec {
    fn default() -> Self {
        Self::with_factor(default_factor())
    }
}

impl SoundingsSpec {
    pub fn with_factor(factor: usize) -> Self {
        Self {
            factor,
            models: Vec::new(),
            evaluator_instructions: None,
            validator: None,
            mode: SoundingsMode::default(),
            mutate: None,
            pareto: None,
            aggregate: None,
        }
    }

    /// N: the sum of per-model factors, or `factor`.
    pub fn total_factor(&self) -> usize {
        if self.models.is_empty() {
            self.factor
        } else {
            self.models.iter().map(|m| m.factor).sum()
        }
    }

    /// Model of each candidate, in candidate order.
    pub fn allocations(&self, default_model: &str) -> Vec<String> {
        if self.models.is_empty() {
            return vec![default_model.to_string(); self.factor];
        }
        self.models
            .iter()
            .flat_map(|m| std::iter::repeat_n(m.model.clone(), m.factor))
            .collect()
    }
}

/// One exploration step: which candidates to run and from what.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub retry: u32,
    pub step: u32,
    /// Base instructions before mutation.
    pub instructions: String,
    /// Model per candidate; its length is the fan-out.
    pub models: Vec<String>,
    /// Context placed after prior phases in every candidate.
    pub seed: Vec<Message>,
    pub mutate: Option<MutationSpec>,
}

/// What a step hands back for merging.
#[derive(Debug)]
pub struct StepOutcome {
    /// The winner, or the aggregate of all survivors.
    pub result: AttemptResult,
    pub candidates: usize,
    pub survivors: usize,
    /// Errors outside `result`: losers, failed candidates, selection, mutation.
    pub errors: Vec<ErrorRecord>,
    /// Usage of every candidate in the step.
    pub usage: Usage,
}

impl StepOutcome {
    pub fn output(&self) -> &str {
        &self.result.output
    }
}

/// Runs exploration steps for one phase against a fixed snapshot.
pub struct Orchestrator<'a> {
    ctx: &'a ExecutionContext,
    phase: &'a PhaseDef,
    snapshot: &'a Echo,
    spec: SoundingsSpec,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a ExecutionContext, phase: &'a PhaseDef, snapshot: &'a Echo) -> Self {
        Self {
            ctx,
            phase,
            snapshot,
            spec: phase.soundings.clone().unwrap_or_default(),
        }
    }

    pub fn ctx(&self) -> &ExecutionContext {
        self.ctx
    }

    pub fn phase(&self) -> &PhaseDef {
        self.phase
    }

    /// The first step of a phase: the configured soundings.
    pub fn initial_request(&self, retry: u32, instructions: &str) -> StepRequest {
        StepRequest {
            retry,
            step: 0,
            instructions: instructions.to_string(),
            models: self.spec.allocations(&self.ctx.model_for(self.phase)),
            seed: Vec::new(),
            mutate: self.spec.mutate.clone(),
        }
    }

    fn meta(&self, request: &StepRequest, purpose: CallPurpose) -> RequestMeta {
        RequestMeta {
            execution_id: self.ctx.execution_id.clone(),
            phase: self.phase.name.clone(),
            attempt: format!("r{}.s{}", request.retry, request.step),
            purpose,
        }
    }

    fn side_error(&self, request: &StepRequest, kind: ErrorKind, message: String) -> ErrorRecord {
        ErrorRecord::new(
            &self.phase.name,
            &format!("r{}.s{}", request.retry, request.step),
            kind,
            message,
        )
    }

    /// Run one step: mutate, fan out, filter, select.
    pub async fn run_step(
        &self,
        request: StepRequest,
        tracer: &Tracer,
    ) -> Result<StepOutcome, PhaseFailure> {
        let count = request.models.len();
        let mut side_errors = Vec::new();
        info!(
            phase = %self.phase.name,
            retry = request.retry,
            step = request.step,
            candidates = count,
            "Starting exploration step"
        );

        let rewriting = request
            .mutate
            .as_ref()
            .is_some_and(|m| m.mode == MutationMode::Rewrite);
        let species = rewriting.then(|| species_hash(self.phase));
        let exemplars = match (&species, &request.mutate) {
            (Some(species), Some(mutate)) => {
                match self.ctx.runtime.winners.get_recent_winners(species, mutate.lineage_k).await {
                    Ok(winners) => winners,
                    Err(e) => {
                        warn!(phase = %self.phase.name, "Could not read winner lineage: {:#}", e);
                        side_errors.push(self.side_error(
                            &request,
                            ErrorKind::Mutation,
                            format!("winner lineage unavailable: {:#}", e),
                        ));
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        let rewrite_model = request
            .mutate
            .as_ref()
            .and_then(|m| m.rewrite_model.clone())
            .unwrap_or_else(|| self.ctx.model_for(self.phase));
        let rewriter = GatewayRewriter::new(
            self.ctx.gateway.clone(),
            &rewrite_model,
            self.meta(&request, CallPurpose::Mutation),
            tracer.clone(),
        );
        let mutation = build_variants(
            request.mutate.as_ref(),
            &request.instructions,
            count,
            &exemplars,
            &rewriter,
            tracer,
        )
        .await;
        side_errors.extend(
            mutation
                .failures
                .iter()
                .map(|f| self.side_error(&request, ErrorKind::Mutation, f.clone())),
        );
        let variants = mutation.variants;

        let slots = self.fan_out(&request, &variants, tracer).await;
        if self.ctx.cancel.is_cancelled() {
            return Err(PhaseFailure::from(PhaseError::Cancelled).with_errors(side_errors));
        }

        let mut usage = Usage::default();
        let mut survivors = Vec::new();
        let mut failures = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(result)) => {
                    usage.add(&result.usage);
                    survivors.push(result);
                }
                Some(Err(failure)) => {
                    usage.add(&failure.usage);
                    failures.push(failure);
                }
                None => failures.push(AttemptFailure {
                    key: AttemptKey::new(request.retry, request.step, index as u32),
                    error: PhaseError::Other(anyhow::anyhow!("candidate task aborted")),
                    errors: Vec::new(),
                    usage: Usage::default(),
                }),
            }
        }

        // a single candidate behaves exactly like a bare phase
        if count == 1
            && let Some(failure) = failures.pop()
        {
            return Err(failure.into_phase_failure().with_errors(side_errors));
        }

        if survivors.is_empty() {
            let last_error = failures
                .last()
                .map(|f| f.error.to_string())
                .unwrap_or_default();
            let errors: Vec<ErrorRecord> = failures
                .into_iter()
                .flat_map(|f| f.into_records(&self.phase.name))
                .collect();
            return Err(PhaseFailure {
                error: PhaseError::AllCandidatesFailed {
                    phase: self.phase.name.clone(),
                    count,
                    last_error,
                },
                errors,
            }
            .with_errors(side_errors));
        }
        side_errors.extend(
            failures
                .into_iter()
                .flat_map(|f| f.into_records(&self.phase.name)),
        );

        let survivors = match self.filter(&request, survivors, &mut side_errors, tracer).await {
            Ok(survivors) => survivors,
            Err(error) => return Err(PhaseFailure::from(error).with_errors(side_errors)),
        };
        let survivor_count = survivors.len();

        let result = if self.spec.mode == SoundingsMode::Aggregate {
            self.aggregate(&request, survivors, &mut side_errors, tracer).await
        } else {
            let winner = self.select(&request, &survivors, &mut side_errors, tracer).await;
            let mut winner_result = None;
            for (position, candidate) in survivors.into_iter().enumerate() {
                if position == winner {
                    winner_result = Some(candidate);
                } else {
                    side_errors.extend(candidate.errors);
                }
            }
            let Some(result) = winner_result else {
                return Err(PhaseFailure::from(PhaseError::Other(anyhow::anyhow!(
                    "selected candidate is missing"
                )))
                .with_errors(side_errors));
            };
            self.record_lineage(&request, species.as_deref(), &variants, &result, &mut side_errors)
                .await;
            result
        };

        Ok(StepOutcome {
            result,
            candidates: count,
            survivors: survivor_count,
            errors: side_errors,
            usage,
        })
    }

    /// Spawn every candidate and collect results by index.
    async fn fan_out(
        &self,
        request: &StepRequest,
        variants: &[Variant],
        tracer: &Tracer,
    ) -> Vec<Option<Result<AttemptResult, AttemptFailure>>> {
        let cancel = self.ctx.cancel.child_token();
        let _guard = cancel.clone().drop_guard();
        let mut step_ctx = self.ctx.clone();
        step_ctx.cancel = cancel;

        let phase = Arc::new(self.phase.clone());
        let snapshot = Arc::new(self.snapshot.clone());
        let mut set = JoinSet::new();

        for (index, (model, variant)) in request.models.iter().zip(variants).enumerate() {
            let key = AttemptKey::new(request.retry, request.step, index as u32);
            let plan = AttemptPlan {
                key,
                instructions: variant.text.clone(),
                model: model.clone(),
                seed: request.seed.clone(),
            };
            let record = tracer.record(TraceKind::Candidate).attempt(&key.label());
            let candidate_tracer = tracer.child(&record.id);
            let ctx = step_ctx.clone();
            let phase = phase.clone();
            let snapshot = snapshot.clone();
            let model = model.clone();
            let mutated = variant.mode.is_some();

            set.spawn(async move {
                let started = Instant::now();
                let result = match acquire_worker(&ctx).await {
                    Some(_permit) => {
                        PhaseRunner::new(&ctx, &phase, &snapshot)
                            .run(plan, &candidate_tracer)
                            .await
                    }
                    None => Err(AttemptFailure {
                        key,
                        error: PhaseError::Cancelled,
                        errors: Vec::new(),
                        usage: Usage::default(),
                    }),
                };
                let (usage, detail) = match &result {
                    Ok(r) => (
                        r.usage,
                        json!({
                            "index": index,
                            "model": model,
                            "mutated": mutated,
                            "status": "completed",
                            "turns": r.turns,
                            "output": truncate(&r.output, 200),
                        }),
                    ),
                    Err(f) => (
                        f.usage,
                        json!({
                            "index": index,
                            "model": model,
                            "mutated": mutated,
                            "status": if matches!(f.error, PhaseError::Cancelled) { "cancelled" } else { "failed" },
                            "error": f.error.to_string(),
                        }),
                    ),
                };
                candidate_tracer.emit(record.usage(&usage).duration(started.elapsed()).detail(detail));
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<AttemptResult, AttemptFailure>>> =
            (0..request.models.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(phase = %self.phase.name, "Candidate task ended abnormally: {}", e),
            }
        }
        slots
    }

    /// Drop candidates the pre-evaluation validator rejects.
    async fn filter(
        &self,
        request: &StepRequest,
        survivors: Vec<AttemptResult>,
        errors: &mut Vec<ErrorRecord>,
        tracer: &Tracer,
    ) -> Result<Vec<AttemptResult>, PhaseError> {
        let Some(validator) = &self.spec.validator else {
            return Ok(survivors);
        };
        let validators = &self.ctx.runtime.validators;
        let verdicts = join_all(survivors.iter().map(|c| validators.check(validator, &c.output))).await;

        let count = survivors.len();
        let mut kept = Vec::with_capacity(count);
        for (candidate, verdict) in survivors.into_iter().zip(verdicts) {
            let verdict = verdict?;
            tracer.emit(
                tracer
                    .record(TraceKind::Ward)
                    .attempt(&candidate.label())
                    .detail(json!({
                        "stage": "pre_evaluation",
                        "validator": validator,
                        "valid": verdict.valid,
                        "reason": verdict.reason,
                    })),
            );
            if verdict.valid {
                kept.push(candidate);
            } else {
                debug!(phase = %self.phase.name, attempt = %candidate.label(), "Candidate rejected: {}", verdict.reason);
                errors.extend(candidate.errors);
                errors.push(ErrorRecord::new(
                    &self.phase.name,
                    &candidate.key.label(),
                    ErrorKind::Validation,
                    format!("rejected by '{}': {}", validator, verdict.reason),
                ));
            }
        }

        if kept.is_empty() {
            return Err(PhaseError::AllCandidatesRejected {
                phase: self.phase.name.clone(),
                validator: validator.clone(),
                count,
            });
        }
        debug!(
            phase = %self.phase.name,
            step = request.step,
            kept = kept.len(),
            rejected = count - kept.len(),
            "Pre-evaluation filter applied"
        );
        Ok(kept)
    }

    /// Position of the winner among `survivors`.
    ///
    /// Evaluator errors and unusable answers fall back to the lowest attempt
    /// index and are recorded.
    async fn select(
        &self,
        request: &StepRequest,
        survivors: &[AttemptResult],
        errors: &mut Vec<ErrorRecord>,
        tracer: &Tracer,
    ) -> usize {
        if survivors.len() == 1 {
            return 0;
        }

        let outputs: Vec<String> = survivors.iter().map(|c| c.output.clone()).collect();
        let instructions = self
            .spec
            .evaluator_instructions
            .as_deref()
            .unwrap_or(DEFAULT_EVALUATOR_INSTRUCTIONS);
        let started = Instant::now();
        let evaluation = match &self.ctx.runtime.evaluator {
            Some(evaluator) => evaluator.evaluate(&outputs, instructions).await,
            None => {
                LlmEvaluator::new(
                    self.ctx.gateway.clone(),
                    &self.ctx.model_for(self.phase),
                    self.meta(request, CallPurpose::Evaluation),
                    tracer.clone(),
                )
                .evaluate(&outputs, instructions)
                .await
            }
        };

        let (method, decision) = match &evaluation {
            Ok(evaluation) => match &self.spec.pareto {
                Some(pareto) => {
                    let qualities = evaluation.choice.qualities(survivors.len());
                    let points = pareto_points(survivors, &qualities);
                    let position = pick(pareto, &points).ok_or_else(|| "empty frontier".to_string());
                    ("pareto", position)
                }
                None => ("evaluator", evaluation.choice.winner(survivors.len())),
            },
            Err(e) => match &self.spec.pareto {
                // With equal quality only the cheapest candidates are on the frontier.
                Some(pareto) => {
                    warn!(
                        phase = %self.phase.name,
                        step = request.step,
                        "Evaluator failed, selecting on cost only: {:#}",
                        e
                    );
                    errors.push(self.side_error(
                        request,
                        ErrorKind::Evaluation,
                        format!("evaluator failed, selected on cost only: {:#}", e),
                    ));
                    let points = pareto_points(survivors, &vec![0.0; survivors.len()]);
                    let position = pick(pareto, &points).ok_or_else(|| format!("{:#}", e));
                    ("pareto_cost", position)
                }
                None => ("evaluator", Err(format!("{:#}", e))),
            },
        };
        let fallback = decision.is_err() || evaluation.is_err();
        let winner = decision.unwrap_or_else(|reason| {
            warn!(
                phase = %self.phase.name,
                step = request.step,
                "Winner selection failed, taking the lowest attempt index: {}",
                reason
            );
            errors.push(self.side_error(
                request,
                ErrorKind::Evaluation,
                format!("winner selection failed, used lowest attempt index: {}", reason),
            ));
            0
        });

        let (choice, rationale) = match &evaluation {
            Ok(e) => (serde_json::to_value(&e.choice).unwrap_or_default(), e.rationale.clone()),
            Err(_) => (serde_json::Value::Null, String::new()),
        };
        tracer.emit(
            tracer
                .record(TraceKind::Evaluation)
                .duration(started.elapsed())
                .detail(json!({
                    "method": method,
                    "step": request.step,
                    "candidates": survivors.iter().map(|c| c.label()).collect::<Vec<_>>(),
                    "winner": survivors[winner].label(),
                    "choice": choice,
                    "rationale": rationale,
                    "fallback": fallback,
                })),
        );
        info!(phase = %self.phase.name, winner = %survivors[winner].label(), method, "Winner selected");
        winner
    }

    /// Combine all survivors into one result.
    async fn aggregate(
        &self,
        request: &StepRequest,
        survivors: Vec<AttemptResult>,
        errors: &mut Vec<ErrorRecord>,
        tracer: &Tracer,
    ) -> AttemptResult {
        let spec = self.spec.aggregate.clone().unwrap_or_default();
        let outputs: Vec<(u32, &str)> = survivors
            .iter()
            .map(|c| (c.key.index, c.output.as_str()))
            .collect();

        let mut usage = Usage::default();
        let output = match spec.method {
            AggregateMethod::Concatenate => concatenate(&outputs),
            AggregateMethod::Synthesize => {
                let model = spec
                    .model
                    .clone()
                    .unwrap_or_else(|| self.ctx.model_for(self.phase));
                match synthesize(
                    &self.ctx.gateway,
                    &model,
                    spec.instructions.as_deref(),
                    &outputs,
                    self.meta(request, CallPurpose::Aggregate),
                    tracer,
                )
                .await
                {
                    Ok((text, synth_usage)) => {
                        usage.add(&synth_usage);
                        text
                    }
                    Err(e) => {
                        warn!(phase = %self.phase.name, "Synthesis failed, concatenating instead: {}", e);
                        errors.push(self.side_error(
                            request,
                            ErrorKind::Evaluation,
                            format!("aggregate synthesis failed, concatenated outputs: {}", e),
                        ));
                        concatenate(&outputs)
                    }
                }
            }
        };

        tracer.emit(tracer.record(TraceKind::Evaluation).detail(json!({
            "method": "aggregate",
            "aggregate": spec.method,
            "step": request.step,
            "candidates": survivors.iter().map(|c| c.label()).collect::<Vec<_>>(),
        })));

        merge_survivors(&self.phase.name, survivors, output, usage)
    }

    async fn record_lineage(
        &self,
        request: &StepRequest,
        species: Option<&str>,
        variants: &[Variant],
        winner: &AttemptResult,
        errors: &mut Vec<ErrorRecord>,
    ) {
        // Later steps and retries carry honing or feedback text.
        if request.step != 0 || request.retry != 0 {
            return;
        }
        let Some(species) = species else {
            return;
        };
        let Some(variant) = variants.get(winner.key.index as usize) else {
            return;
        };
        if !variant.rewritten {
            return;
        }
        if let Err(e) = self.ctx.runtime.winners.record_winner(species, &variant.text).await {
            warn!(phase = %self.phase.name, "Could not record winning rewrite: {:#}", e);
            errors.push(self.side_error(
                request,
                ErrorKind::Mutation,
                format!("winning rewrite not recorded: {:#}", e),
            ));
        } else {
            debug!(phase = %self.phase.name, species, "Recorded winning rewrite");
        }
    }
}

async fn acquire_worker(ctx: &ExecutionContext) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        permit = ctx.runtime.workers.clone().acquire_owned() => permit.ok(),
    }
}

/// Quality/cost points; cost is dollars when reported, tokens otherwise.
fn pareto_points(candidates: &[AttemptResult], qualities: &[f64]) -> Vec<Point> {
    let priced = candidates.iter().any(|c| c.usage.cost_usd > 0.0);
    candidates
        .iter()
        .zip(qualities)
        .map(|(c, quality)| {
            let cost = if priced {
                c.usage.cost_usd
            } else {
                c.usage.total_tokens() as f64
            };
            Point::new(*quality, cost)
        })
        .collect()
}

/// One result standing for every survivor.
///
/// State merges in candidate order; the route comes from the lowest
/// candidate that chose one.
fn merge_survivors(
    phase: &str,
    survivors: Vec<AttemptResult>,
    output: String,
    extra_usage: Usage,
) -> AttemptResult {
    let mut iter = survivors.into_iter();
    let Some(first) = iter.next() else {
        return AttemptResult {
            key: AttemptKey::default(),
            model: String::new(),
            instructions: String::new(),
            output,
            messages: Vec::new(),
            images: Vec::new(),
            state: BTreeMap::new(),
            route: None,
            usage: extra_usage,
            errors: Vec::new(),
            turn_seq: 0,
            turns: 0,
        };
    };

    let label = first.label();
    let mut merged = AttemptResult {
        messages: first.messages.iter().take(1).cloned().collect(),
        output: String::new(),
        ..first
    };
    merged.usage.add(&extra_usage);
    for other in iter {
        merged.state.extend(other.state);
        if merged.route.is_none() {
            merged.route = other.route;
        }
        merged.images.extend(other.images);
        merged.usage.add(&other.usage);
        merged.errors.extend(other.errors);
        merged.turn_seq = merged.turn_seq.max(other.turn_seq);
        merged.turns += other.turns;
    }
    merged
        .messages
        .push(Message::assistant(output.clone()).at(phase, &label, merged.turn_seq));
    merged.output = output;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        CountingValidator, FixedEvaluator, ScriptedProvider, cascade_of, test_context,
        test_runtime,
    };
    use crate::trace::MemoryTraceSink;
    use crate::validation::{FnValidator, ValidatorRegistry, Verdict};
    use serde_json::Value;

    fn sounding_phase(factor: usize) -> PhaseDef {
        let mut phase = PhaseDef::new("draft", "Write a haiku");
        phase.soundings = Some(SoundingsSpec::with_factor(factor));
        phase
    }

    #[test]
    fn test_allocations_expand_per_model() {
        let spec: SoundingsSpec = serde_yaml::from_str(
            "models:\n  - { model: fast, factor: 2 }\n  - { model: strong }\n",
        )
        .unwrap();
        assert_eq!(spec.total_factor(), 3);
        assert_eq!(spec.allocations("default"), vec!["fast", "fast", "strong"]);
        assert_eq!(SoundingsSpec::with_factor(2).allocations("m"), vec!["m", "m"]);
    }

    #[tokio::test]
    async fn test_evaluator_pick_is_the_merged_result() {
        let provider = ScriptedProvider::by_attempt(|label| format!("output of {}", label));
        let evaluator = Arc::new(FixedEvaluator::winner(1));
        let phase = sounding_phase(3);
        let sink = Arc::new(MemoryTraceSink::new());
        let runtime = test_runtime(provider.clone())
            .with_evaluator(evaluator.clone())
            .build()
            .unwrap();
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);
        let tracer = Tracer::new(sink.clone(), &ctx.execution_id).for_phase("draft");

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "Write a haiku"), &tracer)
            .await
            .unwrap();

        assert_eq!(outcome.output(), "output of r0.s0.c1");
        assert_eq!(outcome.candidates, 3);
        assert_eq!(evaluator.seen(), vec![vec![
            "output of r0.s0.c0".to_string(),
            "output of r0.s0.c1".to_string(),
            "output of r0.s0.c2".to_string(),
        ]]);
        assert_eq!(sink.count(TraceKind::Candidate), 3);
        assert_eq!(sink.count(TraceKind::Evaluation), 1);
        // turns hang under their candidate record
        let candidates = sink.of_kind(TraceKind::Candidate);
        for turn in sink.of_kind(TraceKind::Turn) {
            assert!(candidates.iter().any(|c| Some(&c.id) == turn.parent_id.as_ref()));
        }
    }

    #[tokio::test]
    async fn test_tie_goes_to_lowest_index() {
        let provider = ScriptedProvider::by_attempt(|label| label.to_string());
        let runtime = test_runtime(provider)
            .with_evaluator(Arc::new(FixedEvaluator::new(EvaluatorChoice::Tie(vec![2, 1]))))
            .build()
            .unwrap();
        let phase = sounding_phase(3);
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        for _ in 0..3 {
            let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
            let outcome = orchestrator
                .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
                .await
                .unwrap();
            assert_eq!(outcome.result.key.index, 1);
        }
    }

    #[tokio::test]
    async fn test_evaluator_error_falls_back_to_lowest_index() {
        let provider = ScriptedProvider::by_attempt(|label| label.to_string());
        let runtime = test_runtime(provider)
            .with_evaluator(Arc::new(FixedEvaluator::failing()))
            .build()
            .unwrap();
        let phase = sounding_phase(2);
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(outcome.result.key.index, 0);
        assert!(outcome.errors.iter().any(|e| e.kind == ErrorKind::Evaluation));
    }

    #[tokio::test]
    async fn test_pre_validator_filters_before_evaluation() {
        let provider = ScriptedProvider::by_attempt(|label| {
            if label.ends_with("c1") { "good".into() } else { "bad".into() }
        });
        let evaluator = Arc::new(FixedEvaluator::winner(0));
        let validators = ValidatorRegistry::new().with(
            "is_good",
            "Output must be good",
            Arc::new(FnValidator(|content: &str| {
                if content == "good" { Verdict::accept() } else { Verdict::reject("not good") }
            })),
        );
        let runtime = test_runtime(provider)
            .with_evaluator(evaluator.clone())
            .with_validators(validators)
            .build()
            .unwrap();
        let mut phase = sounding_phase(3);
        if let Some(s) = phase.soundings.as_mut() {
            s.validator = Some("is_good".into());
        }
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(outcome.output(), "good");
        assert_eq!(outcome.survivors, 1);
        // a lone survivor needs no evaluator call
        assert!(evaluator.seen().is_empty());
        assert_eq!(
            outcome
                .errors
                .iter()
                .filter(|e| e.kind == ErrorKind::Validation)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_all_rejected_fails_phase() {
        let provider = ScriptedProvider::replies(&["meh"]);
        let validators = ValidatorRegistry::new().with(
            "strict",
            "",
            Arc::new(CountingValidator::failing_times(u32::MAX)),
        );
        let runtime = test_runtime(provider).with_validators(validators).build().unwrap();
        let mut phase = sounding_phase(2);
        if let Some(s) = phase.soundings.as_mut() {
            s.validator = Some("strict".into());
        }
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let failure = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            PhaseError::AllCandidatesRejected { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_candidates_are_isolated() {
        // every candidate writes the same key; only the winner's value lands
        let provider = ScriptedProvider::by_attempt_turn(|label, turn| {
            if turn == 1 {
                format!(
                    r#"{{"tool": "set_state", "arguments": {{"key": "k", "value": "{}"}}}}"#,
                    label
                )
            } else {
                format!("done {}", label)
            }
        });
        let runtime = test_runtime(provider.clone())
            .with_evaluator(Arc::new(FixedEvaluator::winner(2)))
            .build()
            .unwrap();
        let phase = sounding_phase(3).with_tools(&["set_state"]);
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(outcome.result.state["k"], "r0.s0.c2");
        // no candidate's second turn saw another candidate's tool result
        for request in provider.requests() {
            let own = &request.meta.attempt;
            for message in &request.messages {
                if message.kind == crate::echo::MessageKind::ToolResult {
                    assert_eq!(&message.attempt, own);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_single_candidate_failure_propagates_directly() {
        let provider = ScriptedProvider::failing(503);
        let runtime = test_runtime(provider).build().unwrap();
        let phase = sounding_phase(1);
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let failure = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PhaseError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_aggregate_concatenates_survivors() {
        let provider = ScriptedProvider::by_attempt(|label| format!("part {}", label));
        let runtime = test_runtime(provider).build().unwrap();
        let mut phase = sounding_phase(2);
        if let Some(s) = phase.soundings.as_mut() {
            s.mode = SoundingsMode::Aggregate;
        }
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(
            outcome.output(),
            "## Candidate 0\n\npart r0.s0.c0\n\n## Candidate 1\n\npart r0.s0.c1"
        );
        assert_eq!(outcome.result.messages.last().unwrap().text, outcome.output());
    }

    #[tokio::test]
    async fn test_pareto_prefers_cheap_on_equal_quality() {
        let provider = ScriptedProvider::by_attempt(|label| label.to_string())
            .with_cost(|request| if request.model == "cheap" { 0.01 } else { 0.5 });
        let runtime = test_runtime(provider)
            .with_evaluator(Arc::new(FixedEvaluator::new(EvaluatorChoice::Scores(vec![
                0.8, 0.8,
            ]))))
            .build()
            .unwrap();
        let mut phase = PhaseDef::new("draft", "x");
        phase.soundings = Some(
            serde_yaml::from_str(
                "models:\n  - { model: pricey }\n  - { model: cheap }\npareto: { policy: balanced }\n",
            )
            .unwrap(),
        );
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(outcome.result.model, "cheap");
    }

    #[tokio::test]
    async fn test_pareto_selects_on_cost_when_evaluator_fails() {
        let provider = ScriptedProvider::by_attempt(|label| label.to_string())
            .with_cost(|request| if request.model == "cheap" { 0.01 } else { 0.5 });
        let runtime = test_runtime(provider)
            .with_evaluator(Arc::new(FixedEvaluator::failing()))
            .build()
            .unwrap();
        let mut phase = PhaseDef::new("draft", "x");
        phase.soundings = Some(
            serde_yaml::from_str(
                "models:\n  - { model: pricey }\n  - { model: cheap }\npareto: { policy: prefer_cheap }\n",
            )
            .unwrap(),
        );
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        let outcome = orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        assert_eq!(outcome.result.model, "cheap");
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::Evaluation && e.message.contains("cost only")));
    }

    #[tokio::test]
    async fn test_rewrite_winner_joins_lineage() {
        let provider = ScriptedProvider::new(|request| {
            if request.meta.purpose == CallPurpose::Mutation {
                Ok(crate::provider::CompletionResponse::text("Rewritten task"))
            } else {
                Ok(crate::provider::CompletionResponse::text(format!("out {}", request.meta.attempt)))
            }
        });
        let runtime = test_runtime(provider)
            .with_evaluator(Arc::new(FixedEvaluator::winner(1)))
            .build()
            .unwrap();
        let mut phase = sounding_phase(2);
        if let Some(s) = phase.soundings.as_mut() {
            s.mutate = Some(MutationSpec::new(MutationMode::Rewrite));
        }
        let ctx = test_context(cascade_of(vec![phase.clone()]), runtime);
        let echo = Echo::new(&ctx.execution_id, Value::Null);

        let orchestrator = Orchestrator::new(&ctx, &phase, &echo);
        orchestrator
            .run_step(orchestrator.initial_request(0, "x"), &Tracer::null())
            .await
            .unwrap();
        let winners = ctx
            .runtime
            .winners
            .get_recent_winners(&species_hash(&phase), 5)
            .await
            .unwrap();
        assert_eq!(winners, vec!["Rewritten task".to_string()]);

        // retries carry ward feedback, so their rewrites are not recorded
        orchestrator
            .run_step(orchestrator.initial_request(1, "x"), &Tracer::null())
            .await
            .unwrap();
        let winners = ctx
            .runtime
            .winners
            .get_recent_winners(&species_hash(&phase), 5)
            .await
            .unwrap();
        assert_eq!(winners.len(), 1);
    }
}
