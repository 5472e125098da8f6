//! Turn executor: one model call plus the capability calls it requests.
//!
//! A turn never throws protocol problems at its caller. Malformed tool-call
//! text becomes a diagnostic message for the next turn and an explicit
//! [`TurnOutcome::ProtocolError`]; exhausted transport retries become
//! [`TurnOutcome::TransportError`]. Only failures that end the attempt for
//! other reasons (token budget, allowance, cancellation) are returned as `Err`.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cascade::{PhaseDef, ToolProtocol};
use crate::context::{
    BudgetAction, BudgetEnforcer, ExpirySpec, Summarizer, TokenBudgetSpec, assemble,
};
use crate::echo::{ArtifactRef, ErrorKind, ErrorRecord, Message, MessageKind};
use crate::errors::{PhaseError, ToolError};
use crate::provider::{CallPurpose, CompletionRequest, ModelGateway, RequestMeta, Usage};
use crate::scheduler::ExecutionContext;
use crate::tools::{
    ParsedResponse, ProtocolDiagnostic, ROUTE_TO, SET_STATE, ToolCall, ToolSchema,
    parse_tool_call,
};
use crate::trace::{TraceKind, Tracer};

/// Private, copy-on-start view of one attempt.
///
/// Nothing here is visible to sibling attempts; the owning controller merges
/// it into the Echo only if the attempt wins.
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    pub label: String,
    pub conversation: Vec<Message>,
    /// `set_state` writes, merged on phase completion.
    pub state: BTreeMap<String, Value>,
    /// Routing decision made through `route_to`.
    pub route: Option<String>,
    pub images: Vec<ArtifactRef>,
    pub usage: Usage,
    pub errors: Vec<ErrorRecord>,
    /// Global ordinal of the last executed turn.
    pub turn_seq: u64,
    pub turns: u32,
}

impl AttemptState {
    pub fn new(label: &str, start_seq: u64) -> Self {
        Self {
            label: label.to_string(),
            turn_seq: start_seq,
            ..Default::default()
        }
    }

    /// Text of the newest assistant message.
    pub fn last_output(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.kind == MessageKind::Assistant)
            .map(|m| m.text.as_str())
    }

    fn push(&mut self, message: Message) {
        self.conversation.push(message);
    }
}

/// Result of one turn.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model answered; `tool_calls` capability calls were dispatched.
    Ok { content: String, tool_calls: usize },
    /// The tool-call block could not be parsed; a diagnostic was queued.
    ProtocolError(ProtocolDiagnostic),
    /// Model call failed after every retry.
    TransportError(PhaseError),
}

/// Executes turns for one attempt of one phase.
pub struct TurnExecutor<'a> {
    ctx: &'a ExecutionContext,
    phase: &'a PhaseDef,
    model: String,
    schemas: Vec<ToolSchema>,
    route_targets: Vec<String>,
    expiry: ExpirySpec,
    budget: Option<(BudgetEnforcer, TokenBudgetSpec)>,
    tracer: Tracer,
}

impl<'a> TurnExecutor<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        phase: &'a PhaseDef,
        model: &str,
        expiry: ExpirySpec,
        tracer: Tracer,
    ) -> Result<Self, PhaseError> {
        let route_targets = ctx.cascade.targets_of(&phase.name);
        let schemas = ctx.runtime.tools.schemas(&phase.tools, &route_targets);
        let budget = match phase.token_budget.as_ref().or(ctx.cascade.token_budget.as_ref()) {
            Some(spec) => {
                let cfg = &ctx.config().context;
                let enforcer = BudgetEnforcer::from_spec(
                    spec,
                    cfg.model_window_tokens,
                    cfg.chars_per_token,
                    cfg.warn_threshold,
                )?;
                Some((enforcer, spec.clone()))
            }
            None => None,
        };
        Ok(Self {
            ctx,
            phase,
            model: model.to_string(),
            schemas,
            route_targets,
            expiry,
            budget,
            tracer,
        })
    }

    /// Capability schemas offered to the model (built-ins included).
    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    fn meta(&self, label: &str, purpose: CallPurpose) -> RequestMeta {
        RequestMeta {
            execution_id: self.ctx.execution_id.clone(),
            phase: self.phase.name.clone(),
            attempt: label.to_string(),
            purpose,
        }
    }

    /// Run one turn against `attempt`.
    pub async fn execute(
        &self,
        attempt: &mut AttemptState,
        system: &Message,
        prior: &[Message],
    ) -> Result<TurnOutcome, PhaseError> {
        attempt.turn_seq += 1;
        attempt.turns += 1;
        let seq = attempt.turn_seq;
        let label = attempt.label.clone();
        let started = Instant::now();

        let view = assemble(system, prior, &attempt.conversation, &self.expiry, seq);
        let view = self.enforce_budget(view, attempt).await?;

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: view,
            tools: match self.phase.tool_protocol {
                ToolProtocol::Native => self.schemas.clone(),
                ToolProtocol::Prompt => Vec::new(),
            },
            meta: self.meta(&label, CallPurpose::Turn),
        };

        let response = match self
            .ctx
            .gateway
            .complete(request, self.ctx.cache_enabled(self.phase), &self.tracer)
            .await
        {
            Ok(response) => response,
            Err(e @ PhaseError::Transport { .. }) => {
                attempt.errors.push(
                    ErrorRecord::new(&self.phase.name, &label, ErrorKind::Transport, e.to_string())
                        .unrecovered(),
                );
                return Ok(TurnOutcome::TransportError(e));
            }
            Err(e) => return Err(e),
        };
        attempt.usage.add(&response.usage);

        let calls = match self.phase.tool_protocol {
            ToolProtocol::Native => Ok(response.tool_calls.clone()),
            ToolProtocol::Prompt if self.schemas.is_empty() => Ok(Vec::new()),
            ToolProtocol::Prompt => match parse_tool_call(&response.content) {
                ParsedResponse::Text => Ok(Vec::new()),
                ParsedResponse::Call(call) => Ok(vec![call]),
                ParsedResponse::Malformed(diagnostic) => Err(diagnostic),
            },
        };

        attempt.push(
            Message::assistant(response.content.clone())
                .with_tool_calls(calls.as_ref().ok().cloned().unwrap_or_default())
                .at(&self.phase.name, &label, seq),
        );

        self.tracer.emit(
            self.tracer
                .record(TraceKind::Turn)
                .attempt(&label)
                .usage(&response.usage)
                .duration(started.elapsed())
                .detail(json!({
                    "turn": attempt.turns,
                    "turn_seq": seq,
                    "model": self.model,
                    "tool_calls": calls.as_ref().map(Vec::len).unwrap_or(0),
                    "protocol_error": calls.is_err(),
                })),
        );

        let calls = match calls {
            Ok(calls) => calls,
            Err(diagnostic) => {
                warn!(
                    phase = %self.phase.name,
                    attempt = %label,
                    turn = attempt.turns,
                    "Malformed tool call: {}",
                    diagnostic.error
                );
                attempt.errors.push(ErrorRecord::new(
                    &self.phase.name,
                    &label,
                    ErrorKind::Protocol,
                    diagnostic.error.clone(),
                ));
                attempt.push(
                    Message::user(MessageKind::Diagnostic, diagnostic.render())
                        .flagged_error()
                        .at(&self.phase.name, &label, seq),
                );
                return Ok(TurnOutcome::ProtocolError(diagnostic));
            }
        };

        for call in &calls {
            self.dispatch(call, attempt, seq).await;
        }

        Ok(TurnOutcome::Ok {
            content: response.content,
            tool_calls: calls.len(),
        })
    }

    async fn enforce_budget(
        &self,
        view: Vec<Message>,
        attempt: &mut AttemptState,
    ) -> Result<Vec<Message>, PhaseError> {
        let Some((enforcer, spec)) = &self.budget else {
            return Ok(view);
        };
        let summarizer = GatewaySummarizer::new(
            self.ctx.gateway.clone(),
            spec.summarize_model.as_deref().unwrap_or(&self.model),
            self.meta(&attempt.label, CallPurpose::Summary),
            self.tracer.clone(),
        );
        let (view, report) = match enforcer.enforce(view, Some(&summarizer)).await {
            Ok(result) => result,
            Err(e) => {
                self.tracer.emit(
                    self.tracer
                        .record(TraceKind::ContextBudget)
                        .attempt(&attempt.label)
                        .detail(json!({"strategy": spec.strategy, "error": e.to_string()})),
                );
                return Err(e);
            }
        };

        if report.warned || report.action != BudgetAction::None {
            if report.warned {
                warn!(
                    phase = %self.phase.name,
                    attempt = %attempt.label,
                    estimated = report.estimated,
                    ceiling = report.ceiling,
                    "Context is near its token budget"
                );
            }
            self.tracer.emit(
                self.tracer
                    .record(TraceKind::ContextBudget)
                    .attempt(&attempt.label)
                    .detail(serde_json::to_value(&report).unwrap_or(Value::Null)),
            );
        }
        if let Some(error) = &report.summary_error {
            attempt.errors.push(ErrorRecord::new(
                &self.phase.name,
                &attempt.label,
                ErrorKind::Resource,
                format!("Context summarization failed, used sliding window: {}", error),
            ));
        }
        Ok(view)
    }

    async fn dispatch(&self, call: &ToolCall, attempt: &mut AttemptState, seq: u64) {
        let label = attempt.label.clone();
        let started = Instant::now();
        let result = match call.name.as_str() {
            SET_STATE if self.phase.tools.iter().any(|t| t == SET_STATE) => {
                set_state(call, attempt).map(|text| (text, Vec::new()))
            }
            ROUTE_TO if self.route_targets.len() > 1 => {
                route_to(call, &self.route_targets, attempt).map(|text| (text, Vec::new()))
            }
            name if self.phase.tools.iter().any(|t| t == name) => {
                match self
                    .ctx
                    .runtime
                    .tools
                    .invoke(call, self.ctx.config().tool_timeout())
                    .await
                {
                    Ok(output) => Ok((output.content, output.artifacts)),
                    Err(e) => Err(e),
                }
            }
            name => Err(ToolError::UnknownCapability(name.to_string())),
        };

        let is_error = result.is_err();
        match result {
            Ok((content, artifacts)) => {
                attempt.push(
                    Message::tool_result(content, false)
                        .with_tool_call_id(call.id.clone())
                        .at(&self.phase.name, &label, seq),
                );
                for artifact in &artifacts {
                    match self
                        .ctx
                        .runtime
                        .artifacts
                        .persist(&self.ctx.execution_id, &self.phase.name, &label, seq, artifact)
                        .await
                    {
                        Ok(reference) => {
                            if reference.is_image() {
                                attempt.push(Message::image(reference.clone()).at(
                                    &self.phase.name,
                                    &label,
                                    seq,
                                ));
                            }
                            attempt.images.push(reference);
                        }
                        Err(e) => attempt.errors.push(ErrorRecord::new(
                            &self.phase.name,
                            &label,
                            ErrorKind::Tool,
                            format!("Failed to persist artifact from '{}': {:#}", call.name, e),
                        )),
                    }
                }
            }
            Err(e) => {
                debug!(phase = %self.phase.name, tool = %call.name, "Capability failed: {}", e);
                attempt.errors.push(ErrorRecord::new(
                    &self.phase.name,
                    &label,
                    ErrorKind::Tool,
                    e.to_string(),
                ));
                attempt.push(
                    Message::tool_result(format!("Error: {}", e), true)
                        .with_tool_call_id(call.id.clone())
                        .at(&self.phase.name, &label, seq),
                );
            }
        }

        self.tracer.emit(
            self.tracer
                .record(TraceKind::ToolCall)
                .attempt(&label)
                .duration(started.elapsed())
                .detail(json!({"tool": call.name, "arguments": call.arguments, "error": is_error})),
        );
    }
}

fn set_state(call: &ToolCall, attempt: &mut AttemptState) -> Result<String, ToolError> {
    let invalid = |message: &str| ToolError::InvalidArguments {
        tool: SET_STATE.to_string(),
        message: message.to_string(),
    };
    let key = call
        .arguments
        .get("key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| invalid("\"key\" must be a non-empty string"))?;
    let value = call
        .arguments
        .get("value")
        .cloned()
        .ok_or_else(|| invalid("\"value\" is required"))?;
    attempt.state.insert(key.to_string(), value);
    Ok(format!("State '{}' updated.", key))
}

fn route_to(
    call: &ToolCall,
    targets: &[String],
    attempt: &mut AttemptState,
) -> Result<String, ToolError> {
    let target = call
        .arguments
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: ROUTE_TO.to_string(),
            message: "\"target\" must be a string".into(),
        })?;
    if !targets.iter().any(|t| t == target) {
        return Err(ToolError::InvalidArguments {
            tool: ROUTE_TO.to_string(),
            message: format!("unknown target '{}'; choose one of: {}", target, targets.join(", ")),
        });
    }
    attempt.route = Some(target.to_string());
    Ok(format!("Routing to '{}'.", target))
}

/// [`Summarizer`] backed by an auxiliary model call.
pub struct GatewaySummarizer {
    gateway: ModelGateway,
    model: String,
    meta: RequestMeta,
    tracer: Tracer,
}

impl GatewaySummarizer {
    pub fn new(gateway: ModelGateway, model: &str, meta: RequestMeta, tracer: Tracer) -> Self {
        Self {
            gateway,
            model: model.to_string(),
            meta,
            tracer,
        }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        let transcript: Vec<String> = messages
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.text))
            .collect();
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(
                    "Summarize the conversation below. Keep facts, decisions, open questions \
                     and any tool results that later steps may need. Reply with the summary only.",
                ),
                Message::user(MessageKind::Prompt, transcript.join("\n")),
            ],
            tools: Vec::new(),
            meta: self.meta.clone(),
        };
        let response = self.gateway.complete(request, false, &self.tracer).await?;
        Ok(response.content)
    }
}
