//! Reforge: iterative refinement of a soundings winner.
//!
//! Each step runs a smaller soundings round seeded with the current best
//! output and a honing instruction; the step's winner seeds the next step.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::echo::{ErrorKind, ErrorRecord, Message, MessageKind};
use crate::errors::PhaseError;
use crate::mutation::MutationSpec;
use crate::phase::PhaseFailure;
use crate::soundings::{Orchestrator, StepOutcome, StepRequest};
use crate::trace::{TraceKind, Tracer};

const DEFAULT_HONING_PROMPT: &str = "Improve the current best result shown above. \
     Keep what already works, fix what does not, and return the complete improved result.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Meeting the threshold only ends refinement early.
    #[default]
    Advisory,
    /// Missing it after the last step fails the phase.
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub validator: String,
    #[serde(default)]
    pub mode: ThresholdMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReforgeSpec {
    pub steps: u32,
    #[serde(default)]
    pub honing_prompt: Option<String>,
    #[serde(default = "default_factor_per_step")]
    pub factor_per_step: usize,
    #[serde(default)]
    pub mutate: Option<MutationSpec>,
    #[serde(default)]
    pub threshold: Option<ThresholdSpec>,
}

fn default_factor_per_step() -> usize {
    2
}

impl ReforgeSpec {
    pub fn new(steps: u32) -> Self {
        Self {
            steps,
            honing_prompt: None,
            factor_per_step: default_factor_per_step(),
            mutate: None,
            threshold: None,
        }
    }
}

/// Drives refinement steps through an [`Orchestrator`].
pub struct ReforgeController<'o, 'a> {
    orchestrator: &'o Orchestrator<'a>,
    spec: &'o ReforgeSpec,
}

impl<'o, 'a> ReforgeController<'o, 'a> {
    pub fn new(orchestrator: &'o Orchestrator<'a>, spec: &'o ReforgeSpec) -> Self {
        Self { orchestrator, spec }
    }

    async fn threshold_met(&self, best: &StepOutcome, tracer: &Tracer, step: u32) -> Result<bool, PhaseError> {
        let Some(threshold) = &self.spec.threshold else {
            return Ok(false);
        };
        let verdict = self
            .orchestrator
            .ctx()
            .runtime
            .validators
            .check(&threshold.validator, best.output())
            .await?;
        tracer.emit(tracer.record(TraceKind::Ward).detail(json!({
            "stage": "reforge_threshold",
            "validator": threshold.validator,
            "mode": threshold.mode,
            "step": step,
            "valid": verdict.valid,
            "reason": verdict.reason,
        })));
        Ok(verdict.valid)
    }

    fn request(&self, best: &StepOutcome, retry: u32, step: u32, instructions: &str) -> StepRequest {
        let phase = self.orchestrator.phase();
        let label = best.result.label();
        let honing = self.spec.honing_prompt.as_deref().unwrap_or(DEFAULT_HONING_PROMPT);
        let seed = vec![
            Message::user(
                MessageKind::Prompt,
                format!("Current best result:\n\n{}", best.output()),
            )
            .at(&phase.name, &label, best.result.turn_seq),
        ];
        StepRequest {
            retry,
            step,
            instructions: format!("{}\n\n{}", instructions, honing),
            models: vec![best.result.model.clone(); self.spec.factor_per_step],
            seed,
            mutate: self.spec.mutate.clone(),
        }
    }

    /// Refine `initial` for up to `steps` steps.
    ///
    /// A failed step ends refinement and keeps the best result so far;
    /// cancellation and validator errors propagate.
    pub async fn refine(
        &self,
        initial: StepOutcome,
        retry: u32,
        instructions: &str,
        tracer: &Tracer,
    ) -> Result<StepOutcome, PhaseFailure> {
        let phase = self.orchestrator.phase();
        let mut best = initial;
        let mut carried: Vec<ErrorRecord> = Vec::new();
        let mut step = 0;

        let mut met = match self.threshold_met(&best, tracer, step).await {
            Ok(met) => met,
            Err(e) => return Err(PhaseFailure::from(e).with_errors(best.errors)),
        };
        while !met && step < self.spec.steps {
            step += 1;
            let request = self.request(&best, retry, step, instructions);
            let step_tracer = tracer.span(
                TraceKind::ReforgeStep,
                json!({
                    "step": step,
                    "factor": request.models.len(),
                    "seed": best.result.label(),
                }),
            );
            match self.orchestrator.run_step(request, &step_tracer).await {
                Ok(outcome) => {
                    info!(
                        phase = %phase.name,
                        step,
                        winner = %outcome.result.label(),
                        "Reforge step complete"
                    );
                    let previous = std::mem::replace(&mut best, outcome);
                    carried.extend(previous.errors);
                    carried.extend(previous.result.errors);
                    best.usage.add(&previous.usage);
                }
                Err(failure) if matches!(failure.error, PhaseError::Cancelled) => {
                    return Err(failure.with_errors(carried).with_errors(best.errors));
                }
                Err(failure) => {
                    warn!(phase = %phase.name, step, "Reforge step failed, keeping best result: {}", failure.error);
                    let attempt = format!("r{}.s{}", retry, step);
                    carried.extend(failure.into_records(&phase.name, &attempt).into_iter().map(
                        |mut e| {
                            e.recovered = true;
                            e
                        },
                    ));
                    break;
                }
            }
            met = match self.threshold_met(&best, tracer, step).await {
                Ok(met) => met,
                Err(e) => {
                    return Err(PhaseFailure::from(e).with_errors(carried).with_errors(best.errors));
                }
            };
        }

        if let Some(threshold) = &self.spec.threshold {
            if !met && threshold.mode == ThresholdMode::Blocking {
                return Err(PhaseFailure {
                    error: PhaseError::ReforgeThresholdNotMet {
                        phase: phase.name.clone(),
                        steps: step,
                        validator: threshold.validator.clone(),
                    },
                    errors: carried,
                }
                .with_errors(best.errors));
            }
            if !met {
                carried.push(ErrorRecord::new(
                    &phase.name,
                    &best.result.label(),
                    ErrorKind::Validation,
                    format!(
                        "reforge finished {} steps without satisfying '{}'",
                        step, threshold.validator
                    ),
                ));
            }
        }

        carried.append(&mut best.errors);
        best.errors = carried;
        Ok(best)
    }
}
