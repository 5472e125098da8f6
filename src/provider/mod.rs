//! Model provider contract and the gateway every model call goes through.
//!
//! No transport is bundled. Callers implement [`ModelProvider`] for their
//! backend; the [`ModelGateway`] adds the shared policy on top: token
//! allowance checks, response caching, per-call timeout and bounded retry.

mod cache;
mod ledger;
mod retry;

pub use cache::ResponseCache;
pub use ledger::{LedgerSnapshot, ResourceLedger};
pub use retry::{RetryConfig, RetryOutcome, retry_with_backoff};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::echo::Message;
use crate::errors::{PhaseError, ProviderError};
use crate::tools::{ToolCall, ToolSchema};
use crate::trace::{TraceKind, Tracer};

/// Why a model call is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Turn,
    Evaluation,
    Mutation,
    Summary,
    Aggregate,
}

/// Provenance attached to every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub execution_id: String,
    pub phase: String,
    /// Attempt label, e.g. `r0.s1.c2`.
    pub attempt: String,
    pub purpose: CallPurpose,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Native function-calling schemas; empty under the prompt protocol.
    pub tools: Vec<ToolSchema>,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    /// Pre-parsed calls (native protocol).
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
        }
    }
}

/// A model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Shared call policy wrapped around a provider.
#[derive(Clone)]
pub struct ModelGateway {
    provider: Arc<dyn ModelProvider>,
    retry: RetryConfig,
    call_timeout: Duration,
    cache: Arc<ResponseCache>,
    ledger: Arc<ResourceLedger>,
}

impl ModelGateway {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        retry: RetryConfig,
        call_timeout: Duration,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        Self {
            provider,
            retry,
            call_timeout,
            cache: Arc::new(ResponseCache::new()),
            ledger,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// Issue one model call under the shared policy.
    ///
    /// Transport failures are retried; exhausting retries yields
    /// [`PhaseError::Transport`] carrying the last provider error.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        use_cache: bool,
        tracer: &Tracer,
    ) -> Result<CompletionResponse, PhaseError> {
        self.ledger.check()?;

        let key = use_cache.then(|| ResponseCache::key(&request));
        if let Some(hit) = key.as_deref().and_then(|k| self.cache.get(k)) {
            self.ledger.record_cache_hit();
            tracer.emit(
                tracer
                    .record(TraceKind::CacheHit)
                    .detail(json!({"purpose": request.meta.purpose, "model": request.model})),
            );
            return Ok(hit);
        }

        let started = Instant::now();
        let timeout = self.call_timeout;
        let provider = &self.provider;
        let outcome = retry_with_backoff(
            self.retry,
            || {
                let req = request.clone();
                async move {
                    match tokio::time::timeout(timeout, provider.complete(req)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::timeout(timeout.as_secs())),
                    }
                }
            },
            |attempt, e| {
                warn!(
                    phase = %request.meta.phase,
                    attempt = %request.meta.attempt,
                    try_number = attempt,
                    status = ?e.status,
                    "Model call failed: {}",
                    e.message
                );
                tracer.emit(tracer.record(TraceKind::ModelRetry).detail(json!({
                    "try": attempt,
                    "status": e.status,
                    "message": e.message,
                    "retryable": e.retryable,
                    "timed_out": e.timed_out,
                })));
            },
        )
        .await;

        match outcome.result {
            Ok(response) => {
                self.ledger.record(&response.usage);
                if let Some(key) = key {
                    self.cache.insert(key, response.clone());
                }
                tracing::debug!(
                    phase = %request.meta.phase,
                    attempt = %request.meta.attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    tokens = response.usage.total_tokens(),
                    "Model call completed"
                );
                Ok(response)
            }
            Err(source) => Err(PhaseError::Transport {
                attempts: outcome.attempts,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::MessageKind;
    use crate::trace::{MemoryTraceSink, TraceSink};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelProvider for Flaky {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::transient(Some(529), "overloaded"));
            }
            Ok(CompletionResponse {
                content: format!("call {}", n),
                tool_calls: vec![],
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cost_usd: 0.01,
                },
            })
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![Message::user(MessageKind::Prompt, "hi")],
            tools: vec![],
            meta: RequestMeta {
                execution_id: "exec".into(),
                phase: "p".into(),
                attempt: "r0.s0.c0".into(),
                purpose: CallPurpose::Turn,
            },
        }
    }

    fn gateway(failures: u32, limit: Option<u64>) -> (ModelGateway, Arc<Flaky>) {
        let provider = Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        });
        let retry = RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0);
        let gw = ModelGateway::new(
            provider.clone(),
            retry,
            Duration::from_secs(5),
            Arc::new(ResourceLedger::new(limit)),
        );
        (gw, provider)
    }

    fn tracer() -> (Tracer, Arc<MemoryTraceSink>) {
        let sink = Arc::new(MemoryTraceSink::new());
        (Tracer::new(sink.clone() as Arc<dyn TraceSink>, "exec"), sink)
    }

    #[tokio::test]
    async fn test_retries_are_traced_and_usage_recorded() {
        let (gw, _) = gateway(2, None);
        let (tracer, sink) = tracer();

        let resp = gw.complete(request(), false, &tracer).await.unwrap();
        assert_eq!(resp.content, "call 2");
        assert_eq!(sink.count(TraceKind::ModelRetry), 2);
        assert_eq!(gw.ledger().snapshot().total_tokens(), 15);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_transport_error() {
        let (gw, _) = gateway(10, None);
        let (tracer, _) = tracer();

        match gw.complete(request(), false, &tracer).await {
            Err(PhaseError::Transport { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.status, Some(529));
            }
            other => panic!("Expected Transport, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let (gw, provider) = gateway(0, None);
        let (tracer, sink) = tracer();

        let first = gw.complete(request(), true, &tracer).await.unwrap();
        let second = gw.complete(request(), true, &tracer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(TraceKind::CacheHit), 1);
        assert_eq!(gw.ledger().snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_allowance_checked_before_call() {
        let (gw, provider) = gateway(0, Some(15));
        let (tracer, _) = tracer();

        gw.complete(request(), false, &tracer).await.unwrap();
        let err = gw.complete(request(), false, &tracer).await.unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
