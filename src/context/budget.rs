//! Token-budget enforcement over an assembled message list.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::echo::{Message, MessageKind};
use crate::errors::PhaseError;

/// Rough token cost charged per attached image.
pub const IMAGE_TOKEN_ESTIMATE: usize = 256;

/// Default fraction of the ceiling at which a warning is raised.
pub const DEFAULT_WARN_THRESHOLD: f32 = 0.8;

/// Declared context ceiling for a cascade or phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBudgetSpec {
    /// `"24000"` (tokens) or `"80%"` (of the model window).
    pub limit: String,
    #[serde(default)]
    pub strategy: BudgetStrategy,
    #[serde(default)]
    pub warn_threshold: Option<f32>,
    /// Model used by the `summarize` strategy; the phase model otherwise.
    #[serde(default)]
    pub summarize_model: Option<String>,
}

impl TokenBudgetSpec {
    pub fn new(limit: &str, strategy: BudgetStrategy) -> Self {
        Self {
            limit: limit.to_string(),
            strategy,
            warn_threshold: None,
            summarize_model: None,
        }
    }
}

/// What to do when the assembled context is over the ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    #[default]
    PruneOldest,
    SlidingWindow,
    Summarize,
    Fail,
}

/// Parsed budget limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetLimit {
    /// Percentage of the model window (e.g. 80%)
    Percentage(f32),
    /// Absolute token count
    Absolute(usize),
}

impl BudgetLimit {
    /// Effective ceiling in tokens for a model window.
    pub fn effective_limit(&self, model_window_tokens: usize) -> usize {
        match self {
            BudgetLimit::Percentage(pct) => ((model_window_tokens as f32) * (*pct / 100.0)) as usize,
            BudgetLimit::Absolute(tokens) => *tokens,
        }
    }
}

impl std::fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetLimit::Percentage(pct) => write!(f, "{}%", pct),
            BudgetLimit::Absolute(tokens) => write!(f, "{}", tokens),
        }
    }
}

/// Parse a budget limit string.
///
/// Accepts `"80%"` style percentages or absolute token counts like `"24000"`.
pub fn parse_budget_limit(s: &str) -> Result<BudgetLimit> {
    let s = s.trim();

    if s.is_empty() {
        anyhow::bail!("Token budget limit cannot be empty");
    }

    if let Some(num_str) = s.strip_suffix('%') {
        let pct: f32 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid percentage in token budget: {}", s))?;

        if pct <= 0.0 || pct > 100.0 {
            anyhow::bail!("Token budget percentage must be between 0 and 100, got {}", pct);
        }
        Ok(BudgetLimit::Percentage(pct))
    } else {
        let tokens: usize = s
            .parse()
            .with_context(|| format!("Invalid absolute token budget: {}", s))?;

        if tokens == 0 {
            anyhow::bail!("Token budget cannot be zero");
        }
        Ok(BudgetLimit::Absolute(tokens))
    }
}

/// Estimate tokens for one message.
pub fn message_tokens(message: &Message, chars_per_token: usize) -> usize {
    let cpt = chars_per_token.max(1);
    message.text.len().div_ceil(cpt) + message.images.len() * IMAGE_TOKEN_ESTIMATE
}

/// Estimate tokens for a message list.
pub fn estimate_tokens(messages: &[Message], chars_per_token: usize) -> usize {
    messages.iter().map(|m| message_tokens(m, chars_per_token)).sum()
}

/// Action taken by one enforcement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    None,
    Pruned,
    Windowed,
    Summarized,
    /// Summarization failed and the sliding window was used instead.
    SummaryFallback,
}

/// Outcome of one enforcement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub estimated: usize,
    pub ceiling: usize,
    pub warned: bool,
    pub action: BudgetAction,
    pub dropped: usize,
    /// Estimate after enforcement.
    pub final_estimate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_error: Option<String>,
}

/// Condenses a block of messages into one text (the `summarize` strategy).
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Applies a budget strategy to assembled context.
#[derive(Debug, Clone)]
pub struct BudgetEnforcer {
    pub ceiling: usize,
    pub strategy: BudgetStrategy,
    pub warn_threshold: f32,
    pub chars_per_token: usize,
}

impl BudgetEnforcer {
    /// Build an enforcer from a declared spec.
    pub fn from_spec(
        spec: &TokenBudgetSpec,
        model_window_tokens: usize,
        chars_per_token: usize,
        default_warn_threshold: f32,
    ) -> Result<Self> {
        let limit = parse_budget_limit(&spec.limit)?;
        Ok(Self {
            ceiling: limit.effective_limit(model_window_tokens),
            strategy: spec.strategy,
            warn_threshold: spec.warn_threshold.unwrap_or(default_warn_threshold),
            chars_per_token,
        })
    }

    /// Enforce the ceiling.
    ///
    /// The leading system message and the newest message are never dropped.
    pub async fn enforce(
        &self,
        messages: Vec<Message>,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<(Vec<Message>, BudgetReport), PhaseError> {
        let estimated = estimate_tokens(&messages, self.chars_per_token);
        let warned = estimated as f32 >= self.ceiling as f32 * self.warn_threshold;
        let mut report = BudgetReport {
            estimated,
            ceiling: self.ceiling,
            warned,
            action: BudgetAction::None,
            dropped: 0,
            final_estimate: estimated,
            summary_error: None,
        };

        if estimated <= self.ceiling {
            return Ok((messages, report));
        }

        let before = messages.len();
        let result = match self.strategy {
            BudgetStrategy::Fail => {
                return Err(PhaseError::TokenBudgetExceeded {
                    estimated,
                    ceiling: self.ceiling,
                });
            }
            BudgetStrategy::PruneOldest => {
                report.action = BudgetAction::Pruned;
                self.prune_oldest(messages)
            }
            BudgetStrategy::SlidingWindow => {
                report.action = BudgetAction::Windowed;
                self.sliding_window(messages)
            }
            BudgetStrategy::Summarize => match summarizer {
                Some(summarizer) => match self.summarize(&messages, summarizer).await {
                    Ok(summarized) => {
                        report.action = BudgetAction::Summarized;
                        summarized
                    }
                    Err(e) => {
                        report.action = BudgetAction::SummaryFallback;
                        report.summary_error = Some(format!("{:#}", e));
                        self.sliding_window(messages)
                    }
                },
                None => {
                    report.action = BudgetAction::SummaryFallback;
                    report.summary_error = Some("no summarizer available".into());
                    self.sliding_window(messages)
                }
            },
        };

        report.dropped = before.saturating_sub(result.len());
        report.final_estimate = estimate_tokens(&result, self.chars_per_token);
        if report.final_estimate > self.ceiling {
            tracing::warn!(
                final_estimate = report.final_estimate,
                ceiling = self.ceiling,
                "Context still over budget after enforcement; protected messages exceed the ceiling"
            );
        }
        Ok((result, report))
    }

    /// Indices that may never be dropped.
    fn protected(messages: &[Message]) -> (Option<usize>, usize) {
        let system = messages.first().filter(|m| m.is_system()).map(|_| 0);
        (system, messages.len().saturating_sub(1))
    }

    fn prune_oldest(&self, messages: Vec<Message>) -> Vec<Message> {
        let (system, newest) = Self::protected(&messages);
        let cpt = self.chars_per_token;
        let mut total = estimate_tokens(&messages, cpt);
        let mut keep = vec![true; messages.len()];

        // Non-error messages go first, then errors if still over.
        for errors_pass in [false, true] {
            for (i, msg) in messages.iter().enumerate() {
                if total <= self.ceiling {
                    break;
                }
                if Some(i) == system || i == newest || !keep[i] || msg.is_error != errors_pass {
                    continue;
                }
                keep[i] = false;
                total -= message_tokens(msg, cpt);
            }
        }

        messages
            .into_iter()
            .zip(keep)
            .filter_map(|(m, k)| k.then_some(m))
            .collect()
    }

    /// Index where the longest fitting suffix starts.
    fn window_start(&self, messages: &[Message]) -> usize {
        let (system, newest) = Self::protected(messages);
        let cpt = self.chars_per_token;
        let floor = system.map(|s| s + 1).unwrap_or(0);
        let mut total = system.map(|s| message_tokens(&messages[s], cpt)).unwrap_or(0)
            + messages.get(newest).map(|m| message_tokens(m, cpt)).unwrap_or(0);

        let mut start = newest.max(floor);
        while start > floor {
            let cost = message_tokens(&messages[start - 1], cpt);
            if total + cost > self.ceiling {
                break;
            }
            total += cost;
            start -= 1;
        }
        start
    }

    fn sliding_window(&self, messages: Vec<Message>) -> Vec<Message> {
        let start = self.window_start(&messages);
        let has_system = messages.first().map(|m| m.is_system()).unwrap_or(false);
        messages
            .into_iter()
            .enumerate()
            .filter(|(i, _)| (has_system && *i == 0) || *i >= start)
            .map(|(_, m)| m)
            .collect()
    }

    async fn summarize(
        &self,
        messages: &[Message],
        summarizer: &dyn Summarizer,
    ) -> Result<Vec<Message>> {
        let has_system = messages.first().map(|m| m.is_system()).unwrap_or(false);
        let floor = usize::from(has_system);
        let start = self.window_start(messages);
        if start <= floor {
            return Ok(self.sliding_window(messages.to_vec()));
        }

        let block = &messages[floor..start];
        let summary_text = summarizer.summarize(block).await?;
        let newest_seq = block.last().map(|m| m.turn_seq).unwrap_or(0);
        let summary = Message::user(
            MessageKind::Summary,
            format!("Summary of earlier conversation:\n{}", summary_text),
        )
        .at(
            block.last().map(|m| m.phase.as_str()).unwrap_or_default(),
            block.last().map(|m| m.attempt.as_str()).unwrap_or_default(),
            newest_seq,
        );

        let mut result = Vec::with_capacity(messages.len() - block.len() + 1);
        if has_system {
            result.push(messages[0].clone());
        }
        result.push(summary);
        result.extend_from_slice(&messages[start..]);

        // The summary itself may push us over: trim the kept suffix, never the summary.
        let summary_idx = usize::from(has_system);
        while estimate_tokens(&result, self.chars_per_token) > self.ceiling
            && result.len() > summary_idx + 2
        {
            result.remove(summary_idx + 1);
        }
        Ok(result)
    }
}
