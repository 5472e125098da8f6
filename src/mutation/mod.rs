//! Instruction mutation for soundings.
//!
//! Three modes produce candidate-specific instruction variants:
//! - `rewrite`: an auxiliary model call rewords the instructions, seeded
//!   with recent winning rewrites of the same species
//! - `augment`: a fixed prefix is prepended
//! - `approach`: a reasoning-strategy hint is appended; the task text is kept

mod lineage;
mod species;

pub use lineage::{FileWinnerStore, MemoryWinnerStore, WinnerEntry, WinnerStore};
pub use species::species_hash;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::echo::{Message, MessageKind};
use crate::provider::{CallPurpose, CompletionRequest, ModelGateway, RequestMeta};
use crate::trace::{TraceKind, Tracer};

const AUGMENT_PREFIXES: &[&str] = &[
    "Think step by step before answering.",
    "Be concise and precise.",
    "Consider edge cases carefully before committing to an answer.",
    "Write for a reader who is new to the subject.",
];

const APPROACH_HINTS: &[&str] = &[
    "Work backwards from the desired result.",
    "Reason from first principles.",
    "Sketch several options, then commit to the strongest one.",
    "Outline a plan first, then carry it out.",
];

const REWRITE_DIRECTIVES: &[&str] = &[
    "Rephrase the instructions more clearly without changing the task.",
    "Rewrite the instructions to be more specific and structured.",
    "Rewrite the instructions so the most important requirements come first.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    Rewrite,
    Augment,
    Approach,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationSpec {
    pub mode: MutationMode,
    /// Custom prefixes, hints or rewrite directives; built-ins otherwise.
    #[serde(default)]
    pub variants: Vec<String>,
    /// Model for `rewrite`; the phase model otherwise.
    #[serde(default)]
    pub rewrite_model: Option<String>,
    /// Recent winners fed to `rewrite` as examples.
    #[serde(default = "default_lineage_k")]
    pub lineage_k: usize,
    /// Keep attempt 0 unmutated.
    #[serde(default = "default_include_baseline")]
    pub include_baseline: bool,
}

fn default_lineage_k() -> usize {
    5
}

fn default_include_baseline() -> bool {
    true
}

impl MutationSpec {
    pub fn new(mode: MutationMode) -> Self {
        Self {
            mode,
            variants: Vec::new(),
            rewrite_model: None,
            lineage_k: default_lineage_k(),
            include_baseline: default_include_baseline(),
        }
    }

    fn directives(&self) -> Vec<&str> {
        if !self.variants.is_empty() {
            return self.variants.iter().map(String::as_str).collect();
        }
        match self.mode {
            MutationMode::Rewrite => REWRITE_DIRECTIVES.to_vec(),
            MutationMode::Augment => AUGMENT_PREFIXES.to_vec(),
            MutationMode::Approach => APPROACH_HINTS.to_vec(),
        }
    }
}

/// Instructions for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub text: String,
    pub mode: Option<MutationMode>,
    /// Prefix, hint or directive applied.
    pub directive: Option<String>,
    /// True only for a successful model rewrite; such winners join the lineage.
    pub rewritten: bool,
}

impl Variant {
    pub fn baseline(text: &str) -> Self {
        Self {
            text: text.to_string(),
            mode: None,
            directive: None,
            rewritten: false,
        }
    }
}

/// Rewrites instructions for the `rewrite` mode.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, instructions: &str, directive: &str, exemplars: &[String])
    -> Result<String>;
}

/// Variants plus any rewrite failures (which fell back to the baseline text).
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    pub variants: Vec<Variant>,
    pub failures: Vec<String>,
}

pub fn augment(instructions: &str, prefix: &str) -> String {
    format!("{}\n\n{}", prefix, instructions)
}

pub fn approach(instructions: &str, hint: &str) -> String {
    format!("{}\n\nApproach: {}", instructions, hint)
}

/// Build `count` instruction variants.
///
/// Without a spec every candidate gets the base text. Directives cycle by
/// candidate index; with `include_baseline` candidate 0 stays unmutated.
pub async fn build_variants(
    spec: Option<&MutationSpec>,
    base: &str,
    count: usize,
    exemplars: &[String],
    rewriter: &dyn Rewriter,
    tracer: &Tracer,
) -> MutationOutcome {
    let Some(spec) = spec else {
        return MutationOutcome {
            variants: (0..count).map(|_| Variant::baseline(base)).collect(),
            failures: Vec::new(),
        };
    };

    let directives = spec.directives();
    let offset = usize::from(spec.include_baseline);
    let tasks = (0..count).map(|index| {
        let directive = (index >= offset && !directives.is_empty())
            .then(|| directives[(index - offset) % directives.len()]);
        async move {
            let Some(directive) = directive else {
                return (Variant::baseline(base), None);
            };
            let mut variant = Variant {
                text: base.to_string(),
                mode: Some(spec.mode),
                directive: Some(directive.to_string()),
                rewritten: false,
            };
            let mut failure = None;
            match spec.mode {
                MutationMode::Augment => variant.text = augment(base, directive),
                MutationMode::Approach => variant.text = approach(base, directive),
                MutationMode::Rewrite => match rewriter.rewrite(base, directive, exemplars).await {
                    Ok(text) if !text.trim().is_empty() => {
                        variant.text = text.trim().to_string();
                        variant.rewritten = true;
                    }
                    Ok(_) => failure = Some("rewrite returned empty text".to_string()),
                    Err(e) => failure = Some(format!("{:#}", e)),
                },
            }
            tracer.emit(tracer.record(TraceKind::Mutation).detail(json!({
                "index": index,
                "mode": spec.mode,
                "directive": directive,
                "rewritten": variant.rewritten,
                "error": failure,
            })));
            (variant, failure)
        }
    });

    let mut outcome = MutationOutcome::default();
    for (index, (variant, failure)) in join_all(tasks).await.into_iter().enumerate() {
        if let Some(failure) = failure {
            tracing::warn!(index, "Instruction rewrite failed, using original: {}", failure);
            outcome
                .failures
                .push(format!("candidate {}: {}", index, failure));
        }
        outcome.variants.push(variant);
    }
    outcome
}

/// [`Rewriter`] backed by a model call through the gateway.
pub struct GatewayRewriter {
    gateway: ModelGateway,
    model: String,
    meta: RequestMeta,
    tracer: Tracer,
}

impl GatewayRewriter {
    pub fn new(gateway: ModelGateway, model: &str, meta: RequestMeta, tracer: Tracer) -> Self {
        Self {
            gateway,
            model: model.to_string(),
            meta: RequestMeta {
                purpose: CallPurpose::Mutation,
                ..meta
            },
            tracer,
        }
    }
}

#[async_trait]
impl Rewriter for GatewayRewriter {
    async fn rewrite(
        &self,
        instructions: &str,
        directive: &str,
        exemplars: &[String],
    ) -> Result<String> {
        let mut prompt = format!("Directive: {}\n\n", directive);
        if !exemplars.is_empty() {
            prompt.push_str("Rewrites of these instructions that produced winning results before:\n");
            for exemplar in exemplars {
                prompt.push_str("---\n");
                prompt.push_str(exemplar);
                prompt.push('\n');
            }
            prompt.push_str("---\n\n");
        }
        prompt.push_str("Instructions to rewrite:\n");
        prompt.push_str(instructions);

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(
                    "You rewrite task instructions for another model. Keep the task identical; \
                     change only wording and structure. Reply with the rewritten instructions only.",
                ),
                Message::user(MessageKind::Prompt, prompt),
            ],
            tools: Vec::new(),
            meta: self.meta.clone(),
        };
        let response = self.gateway.complete(request, false, &self.tracer).await?;
        Ok(response.content)
    }
}
