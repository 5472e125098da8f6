//! Winner selection contract and the model-backed evaluator.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::echo::{Message, MessageKind};
use crate::provider::{CallPurpose, CompletionRequest, ModelGateway, RequestMeta};
use crate::trace::Tracer;
use crate::util::extract_json_object;

pub const DEFAULT_EVALUATOR_INSTRUCTIONS: &str =
    "Pick the candidate that best accomplishes the task.";

/// What an evaluator decided. Positions index the candidate list it was given.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorChoice {
    Winner(usize),
    Scores(Vec<f64>),
    Tie(Vec<usize>),
}

impl EvaluatorChoice {
    /// Winning position among `count` candidates.
    ///
    /// Every tie resolves to the lowest position. Answers that do not fit
    /// the candidate list are errors.
    pub fn winner(&self, count: usize) -> Result<usize, String> {
        match self {
            EvaluatorChoice::Winner(position) if *position < count => Ok(*position),
            EvaluatorChoice::Winner(position) => Err(format!(
                "winner {} is out of range for {} candidates",
                position, count
            )),
            EvaluatorChoice::Scores(scores) => {
                if scores.len() != count {
                    return Err(format!(
                        "got {} scores for {} candidates",
                        scores.len(),
                        count
                    ));
                }
                let mut best: Option<(usize, f64)> = None;
                for (position, score) in scores.iter().copied().enumerate() {
                    if score.is_nan() {
                        continue;
                    }
                    if best.is_none_or(|(_, top)| score > top) {
                        best = Some((position, score));
                    }
                }
                best.map(|(position, _)| position)
                    .ok_or_else(|| "no usable scores".to_string())
            }
            EvaluatorChoice::Tie(positions) => positions
                .iter()
                .copied()
                .filter(|p| *p < count)
                .min()
                .ok_or_else(|| "tie names no valid candidate".to_string()),
        }
    }

    /// Per-candidate quality for Pareto selection.
    ///
    /// A single winner scores 1.0 against 0.0 for the rest; tied positions
    /// all score 1.0.
    pub fn qualities(&self, count: usize) -> Vec<f64> {
        match self {
            EvaluatorChoice::Scores(scores) if scores.len() == count => scores
                .iter()
                .map(|s| if s.is_nan() { 0.0 } else { *s })
                .collect(),
            EvaluatorChoice::Scores(_) => vec![0.0; count],
            EvaluatorChoice::Winner(position) => (0..count)
                .map(|p| if p == *position { 1.0 } else { 0.0 })
                .collect(),
            EvaluatorChoice::Tie(positions) => (0..count)
                .map(|p| if positions.contains(&p) { 1.0 } else { 0.0 })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub choice: EvaluatorChoice,
    pub rationale: String,
}

impl Evaluation {
    pub fn winner(position: usize) -> Self {
        Self {
            choice: EvaluatorChoice::Winner(position),
            rationale: String::new(),
        }
    }
}

/// Compares candidate outputs.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, candidates: &[String], instructions: &str) -> Result<Evaluation>;
}

/// Parse an evaluator reply.
///
/// Accepts `{"winner": n}`, `{"scores": [...]}` or `{"tie": [...]}`, with an
/// optional `"rationale"`, anywhere in the text.
pub fn parse_evaluation(text: &str) -> Result<Evaluation> {
    let json = extract_json_object(text).context("Evaluator reply contains no JSON object")?;
    let value: Value = serde_json::from_str(&json).context("Evaluator reply is not valid JSON")?;
    let rationale = value
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let choice = if let Some(winner) = value.get("winner") {
        let position = winner
            .as_u64()
            .context("\"winner\" must be a non-negative integer")?;
        EvaluatorChoice::Winner(position as usize)
    } else if let Some(scores) = value.get("scores").and_then(Value::as_array) {
        let scores = scores
            .iter()
            .map(|s| s.as_f64().context("\"scores\" must contain numbers"))
            .collect::<Result<Vec<_>>>()?;
        EvaluatorChoice::Scores(scores)
    } else if let Some(tie) = value.get("tie").and_then(Value::as_array) {
        let positions = tie
            .iter()
            .map(|p| {
                p.as_u64()
                    .map(|p| p as usize)
                    .context("\"tie\" must contain candidate numbers")
            })
            .collect::<Result<Vec<_>>>()?;
        EvaluatorChoice::Tie(positions)
    } else {
        bail!("Evaluator reply has neither \"winner\", \"scores\" nor \"tie\"");
    };

    Ok(Evaluation { choice, rationale })
}

/// [`Evaluator`] backed by one model call.
pub struct LlmEvaluator {
    gateway: ModelGateway,
    model: String,
    meta: RequestMeta,
    tracer: Tracer,
}

impl LlmEvaluator {
    pub fn new(gateway: ModelGateway, model: &str, meta: RequestMeta, tracer: Tracer) -> Self {
        Self {
            gateway,
            model: model.to_string(),
            meta: RequestMeta {
                purpose: CallPurpose::Evaluation,
                ..meta
            },
            tracer,
        }
    }

    fn prompt(candidates: &[String], instructions: &str) -> String {
        let mut prompt = format!("{}\n\n", instructions.trim());
        for (position, candidate) in candidates.iter().enumerate() {
            prompt.push_str(&format!("## Candidate {}\n{}\n\n", position, candidate.trim()));
        }
        prompt.push_str(
            "Reply with JSON only: {\"winner\": <candidate number>, \"rationale\": \"<why>\"}",
        );
        prompt
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(&self, candidates: &[String], instructions: &str) -> Result<Evaluation> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system("You judge candidate answers to the same task."),
                Message::user(MessageKind::Prompt, Self::prompt(candidates, instructions)),
            ],
            tools: Vec::new(),
            meta: self.meta.clone(),
        };
        let response = self.gateway.complete(request, false, &self.tracer).await?;
        parse_evaluation(&response.content)
    }
}
