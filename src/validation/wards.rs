//! Validation barriers around phase execution.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{ValidatorRegistry, Verdict};
use crate::errors::PhaseError;
use crate::trace::{TraceKind, Tracer};

/// Wards declared on a phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WardsSpec {
    /// Checked against the cascade input before the phase runs.
    #[serde(default)]
    pub pre: Vec<WardDef>,
    /// Checked against the phase output.
    #[serde(default)]
    pub post: Vec<WardDef>,
}

impl WardsSpec {
    pub fn all(&self) -> impl Iterator<Item = &WardDef> {
        self.pre.iter().chain(self.post.iter())
    }
}

/// How a failing verdict is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    /// Abort the cascade.
    Blocking,
    /// Re-run the phase with the rejection reason as feedback.
    Retry,
    /// Record and continue.
    Advisory,
}

impl fmt::Display for WardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WardMode::Blocking => write!(f, "blocking"),
            WardMode::Retry => write!(f, "retry"),
            WardMode::Advisory => write!(f, "advisory"),
        }
    }
}

/// What a retry ward does once `max_attempts` is spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// Keep the last result and record a validation error.
    #[default]
    Degrade,
    /// Fail the cascade.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WardDef {
    pub validator: String,
    pub mode: WardMode,
    /// Total phase executions allowed by a retry ward.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub on_exhausted: OnExhausted,
}

fn default_max_attempts() -> u32 {
    3
}

impl WardDef {
    pub fn new(validator: &str, mode: WardMode) -> Self {
        Self {
            validator: validator.to_string(),
            mode,
            max_attempts: default_max_attempts(),
            on_exhausted: OnExhausted::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_on_exhausted(mut self, on_exhausted: OnExhausted) -> Self {
        self.on_exhausted = on_exhausted;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardStage {
    Pre,
    Post,
}

/// Verdict of one ward.
#[derive(Debug, Clone, PartialEq)]
pub struct WardOutcome {
    pub ward: WardDef,
    pub verdict: Verdict,
}

/// Verdicts of one ward pass, in declaration order.
///
/// Evaluation stops at the first failing blocking ward, so a blocked check
/// may hold fewer outcomes than wards were declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WardCheck {
    pub outcomes: Vec<WardOutcome>,
}

impl WardCheck {
    fn failing(&self, mode: WardMode) -> impl Iterator<Item = &WardOutcome> {
        self.outcomes
            .iter()
            .filter(move |o| o.ward.mode == mode && !o.verdict.valid)
    }

    /// The blocking ward that failed, if any.
    pub fn blocked(&self) -> Option<&WardOutcome> {
        self.failing(WardMode::Blocking).next()
    }

    pub fn retry_failures(&self) -> Vec<&WardOutcome> {
        self.failing(WardMode::Retry).collect()
    }

    pub fn advisory_failures(&self) -> Vec<&WardOutcome> {
        self.failing(WardMode::Advisory).collect()
    }

    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.verdict.valid)
    }
}

/// Run `wards` against `content` in declaration order.
pub async fn check_wards(
    wards: &[WardDef],
    stage: WardStage,
    content: &str,
    validators: &ValidatorRegistry,
    tracer: &Tracer,
) -> Result<WardCheck, PhaseError> {
    let mut check = WardCheck::default();
    for ward in wards {
        let verdict = validators.check(&ward.validator, content).await?;
        tracer.emit(tracer.record(TraceKind::Ward).detail(json!({
            "stage": stage,
            "validator": ward.validator,
            "mode": ward.mode,
            "valid": verdict.valid,
            "reason": verdict.reason,
        })));

        let stop = !verdict.valid && ward.mode == WardMode::Blocking;
        if verdict.valid {
            info!(validator = %ward.validator, ?stage, "Ward passed");
        } else {
            warn!(
                validator = %ward.validator,
                mode = %ward.mode,
                ?stage,
                "Ward rejected: {}",
                verdict.reason
            );
        }
        check.outcomes.push(WardOutcome {
            ward: ward.clone(),
            verdict,
        });
        if stop {
            break;
        }
    }
    Ok(check)
}
