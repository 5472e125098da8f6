//! Aggregate mode: combine every surviving output instead of picking one.

use serde::{Deserialize, Serialize};

use crate::echo::{Message, MessageKind};
use crate::errors::PhaseError;
use crate::provider::{CallPurpose, CompletionRequest, ModelGateway, RequestMeta, Usage};
use crate::trace::Tracer;

const DEFAULT_SYNTHESIS_INSTRUCTIONS: &str = "Combine the candidate answers below into one answer. \
     Keep every distinct insight, remove repetition and resolve contradictions.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMethod {
    #[default]
    Concatenate,
    Synthesize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    #[serde(default)]
    pub method: AggregateMethod,
    /// Synthesis instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Synthesis model; the phase model otherwise.
    #[serde(default)]
    pub model: Option<String>,
}

/// Join outputs under per-candidate headings, in candidate order.
pub fn concatenate(outputs: &[(u32, &str)]) -> String {
    outputs
        .iter()
        .map(|(index, text)| format!("## Candidate {}\n\n{}", index, text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Merge outputs with one model call.
pub async fn synthesize(
    gateway: &ModelGateway,
    model: &str,
    instructions: Option<&str>,
    outputs: &[(u32, &str)],
    meta: RequestMeta,
    tracer: &Tracer,
) -> Result<(String, Usage), PhaseError> {
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![
            Message::system(instructions.unwrap_or(DEFAULT_SYNTHESIS_INSTRUCTIONS)),
            Message::user(MessageKind::Prompt, concatenate(outputs)),
        ],
        tools: Vec::new(),
        meta: RequestMeta {
            purpose: CallPurpose::Aggregate,
            ..meta
        },
    };
    let response = gateway.complete(request, false, tracer).await?;
    Ok((response.content, response.usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenate_keeps_order_and_labels() {
        let text = concatenate(&[(0, "alpha\n"), (2, "gamma")]);
        assert_eq!(text, "## Candidate 0\n\nalpha\n\n## Candidate 2\n\ngamma");
    }

    #[test]
    fn test_method_defaults_to_concatenate() {
        let spec: AggregateSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.method, AggregateMethod::Concatenate);
    }
}
