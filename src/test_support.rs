//! Scripted collaborators for tests.
//!
//! Compiled for unit tests and behind the `test-support` feature so
//! integration tests can drive the engine without a model backend.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::cascade::{CachePolicy, CascadeDef, PhaseDef};
use crate::config::EngineConfig;
use crate::context::{ExpirySpec, Retention};
use crate::echo::{ArtifactStore, Role};
use crate::errors::{ProviderError, ToolError};
use crate::provider::{CompletionRequest, CompletionResponse, ModelProvider, Usage};
use crate::scheduler::{ExecutionContext, Runtime, RuntimeBuilder};
use crate::soundings::{Evaluation, Evaluator, EvaluatorChoice};
use crate::tools::{Capability, ToolOutput};
use crate::validation::{Validator, Verdict};

type Script = dyn Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError> + Send + Sync;
type CostFn = dyn Fn(&CompletionRequest) -> f64 + Send + Sync;

/// A [`ModelProvider`] answering from a closure and recording every request.
///
/// Usage is estimated at four characters per token so ledger limits and
/// budget checks behave as they would against a real backend.
pub struct ScriptedProvider {
    script: Box<Script>,
    cost: Mutex<Option<Box<CostFn>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            cost: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Reply with `replies` in order, repeating the last one.
    pub fn replies(replies: &[&str]) -> Arc<Self> {
        let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
        let next = AtomicUsize::new(0);
        Self::new(move |_| {
            let i = next.fetch_add(1, Ordering::SeqCst);
            let reply = replies
                .get(i)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_default();
            Ok(CompletionResponse::text(reply))
        })
    }

    /// Reply as a function of the attempt label (`r0.s1.c2`).
    pub fn by_attempt<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::new(move |request| Ok(CompletionResponse::text(reply(&request.meta.attempt))))
    }

    /// Reply as a function of the attempt label and the 1-based turn number.
    pub fn by_attempt_turn<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&str, u32) -> String + Send + Sync + 'static,
    {
        Self::new(move |request| {
            let turn = turn_of(request);
            Ok(CompletionResponse::text(reply(&request.meta.attempt, turn)))
        })
    }

    /// Reply as a function of the phase name.
    pub fn by_phase<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::new(move |request| Ok(CompletionResponse::text(reply(&request.meta.phase))))
    }

    /// Reply as a function of the phase name and the 1-based turn number.
    pub fn by_phase_turn<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&str, u32) -> String + Send + Sync + 'static,
    {
        Self::new(move |request| {
            let turn = turn_of(request);
            Ok(CompletionResponse::text(reply(&request.meta.phase, turn)))
        })
    }

    /// Fail every call with `status`.
    pub fn failing(status: u16) -> Arc<Self> {
        Self::new(move |_| {
            Err(ProviderError::transient(
                Some(status),
                format!("scripted failure {}", status),
            ))
        })
    }

    /// Price every response.
    pub fn with_cost<F>(self: Arc<Self>, cost: F) -> Arc<Self>
    where
        F: Fn(&CompletionRequest) -> f64 + Send + Sync + 'static,
    {
        *self.cost.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(cost));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Turn number of a request within its own attempt.
fn turn_of(request: &CompletionRequest) -> u32 {
    let own = request
        .messages
        .iter()
        .filter(|m| {
            m.role == Role::Assistant
                && m.phase == request.meta.phase
                && m.attempt == request.meta.attempt
        })
        .count();
    own as u32 + 1
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let mut response = (self.script)(&request)?;
        if response.usage == Usage::default() {
            let input: usize = request.messages.iter().map(|m| m.text.len()).sum();
            response.usage = Usage {
                input_tokens: (input / 4) as u64 + 1,
                output_tokens: (response.content.len() / 4) as u64 + 1,
                cost_usd: 0.0,
            };
        }
        if let Some(cost) = self.cost.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            response.usage.cost_usd = cost(&request);
        }
        Ok(response)
    }
}

/// An [`Evaluator`] with a fixed answer that remembers what it was shown.
pub struct FixedEvaluator {
    choice: Option<EvaluatorChoice>,
    seen: Mutex<Vec<Vec<String>>>,
}

impl FixedEvaluator {
    pub fn new(choice: EvaluatorChoice) -> Self {
        Self {
            choice: Some(choice),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn winner(position: usize) -> Self {
        Self::new(EvaluatorChoice::Winner(position))
    }

    /// Errors on every call.
    pub fn failing() -> Self {
        Self {
            choice: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Candidate lists passed to each call.
    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Evaluator for FixedEvaluator {
    async fn evaluate(&self, candidates: &[String], _instructions: &str) -> Result<Evaluation> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidates.to_vec());
        match &self.choice {
            Some(choice) => Ok(Evaluation {
                choice: choice.clone(),
                rationale: "scripted".into(),
            }),
            None => bail!("scripted evaluator failure"),
        }
    }
}

/// Rejects the first `n` calls, accepts after that.
pub struct CountingValidator {
    reject_first: u32,
    calls: AtomicU32,
}

impl CountingValidator {
    pub fn failing_times(n: u32) -> Self {
        Self {
            reject_first: n,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for CountingValidator {
    async fn validate(&self, _content: &str, _criteria: &str) -> Result<Verdict> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.reject_first {
            Ok(Verdict::reject(format!("rejected on call {}", call)))
        } else {
            Ok(Verdict::accept())
        }
    }
}

/// A capability returning fixed text and recording its arguments.
pub struct RecordingCapability {
    name: String,
    output: String,
    calls: Mutex<Vec<Value>>,
}

impl RecordingCapability {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn arguments(&self) -> Vec<Value> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Capability for RecordingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted capability"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "additionalProperties": true})
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(arguments);
        Ok(ToolOutput::text(self.output.clone()))
    }
}

/// Runtime builder with no retry delays and a throwaway artifact root.
pub fn test_runtime(provider: Arc<dyn ModelProvider>) -> RuntimeBuilder {
    let mut config = EngineConfig::default();
    config.retry.max_retries = 0;
    config.retry.initial_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    let root = std::env::temp_dir().join(format!("windlass-test-{}", uuid::Uuid::new_v4()));
    Runtime::builder(provider)
        .with_config(config)
        .with_artifact_store(ArtifactStore::new(&root))
}

pub fn test_context(cascade: CascadeDef, runtime: Runtime) -> ExecutionContext {
    ExecutionContext::new(
        &format!("test-{}", uuid::Uuid::new_v4()),
        Arc::new(cascade),
        runtime,
        CancellationToken::new(),
    )
}

/// Cascade with default policy around `phases`.
pub fn cascade_of(phases: Vec<PhaseDef>) -> CascadeDef {
    CascadeDef {
        cascade_id: "test".into(),
        description: None,
        model: None,
        phases,
        token_budget: None,
        max_total_tokens: None,
        cache: CachePolicy::default(),
        retention: Retention::default(),
        expiry: ExpirySpec::default(),
    }
}
