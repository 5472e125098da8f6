//! Collaborators shared by every execution, and the per-execution context.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cascade::{CascadeDef, PhaseDef};
use crate::config::EngineConfig;
use crate::echo::ArtifactStore;
use crate::mutation::{MemoryWinnerStore, WinnerStore};
use crate::provider::{ModelGateway, ModelProvider, ResourceLedger, ResponseCache};
use crate::soundings::Evaluator;
use crate::tools::ToolRegistry;
use crate::trace::{NullTraceSink, TraceSink};
use crate::validation::ValidatorRegistry;

/// Injectable collaborators. Nothing here is process-global: two runtimes
/// never share caches, traces or worker permits.
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<EngineConfig>,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub validators: Arc<ValidatorRegistry>,
    /// Winner selection; an LLM evaluator over the provider when `None`.
    pub evaluator: Option<Arc<dyn Evaluator>>,
    pub winners: Arc<dyn WinnerStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub trace_sink: Arc<dyn TraceSink>,
    pub cache: Arc<ResponseCache>,
    /// Bounded pool for candidate attempts.
    pub workers: Arc<Semaphore>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("tools", &self.tools)
            .field("validators", &self.validators)
            .field("artifacts", &self.artifacts.root())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder(provider: Arc<dyn ModelProvider>) -> RuntimeBuilder {
        RuntimeBuilder::new(provider)
    }
}

pub struct RuntimeBuilder {
    provider: Arc<dyn ModelProvider>,
    config: EngineConfig,
    tools: ToolRegistry,
    validators: ValidatorRegistry,
    evaluator: Option<Arc<dyn Evaluator>>,
    winners: Option<Arc<dyn WinnerStore>>,
    artifacts: Option<Arc<ArtifactStore>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
}

impl RuntimeBuilder {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            config: EngineConfig::default(),
            tools: ToolRegistry::new(),
            validators: ValidatorRegistry::new(),
            evaluator: None,
            winners: None,
            artifacts: None,
            trace_sink: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_winner_store(mut self, winners: Arc<dyn WinnerStore>) -> Self {
        self.winners = Some(winners);
        self
    }

    pub fn with_artifact_store(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(Arc::new(artifacts));
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    /// Finish the runtime. Configuration warnings are logged, not fatal.
    pub fn build(self) -> Result<Runtime> {
        for warning in self.config.validate() {
            tracing::warn!("Config: {}", warning);
        }
        let workers = Arc::new(Semaphore::new(self.config.engine.max_parallel.max(1)));
        let cache = Arc::new(ResponseCache::with_capacity(self.config.engine.cache_capacity));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(ArtifactStore::new(&self.config.artifacts_dir())));
        Ok(Runtime {
            config: Arc::new(self.config),
            provider: self.provider,
            tools: Arc::new(self.tools),
            validators: Arc::new(self.validators),
            evaluator: self.evaluator,
            winners: self
                .winners
                .unwrap_or_else(|| Arc::new(MemoryWinnerStore::new())),
            artifacts,
            trace_sink: self.trace_sink.unwrap_or_else(|| Arc::new(NullTraceSink)),
            cache,
            workers,
        })
    }
}

/// Everything one execution's phases and candidates need.
///
/// Cheap to clone; candidates own a clone so they can run on spawned tasks.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub cascade: Arc<CascadeDef>,
    pub runtime: Runtime,
    /// Gateway carrying this execution's token ledger.
    pub gateway: ModelGateway,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        execution_id: &str,
        cascade: Arc<CascadeDef>,
        runtime: Runtime,
        cancel: CancellationToken,
    ) -> Self {
        let ledger = Arc::new(ResourceLedger::new(cascade.max_total_tokens));
        let gateway = ModelGateway::new(
            runtime.provider.clone(),
            runtime.config.retry_config(),
            runtime.config.model_timeout(),
            ledger,
        )
        .with_cache(runtime.cache.clone());
        Self {
            execution_id: execution_id.to_string(),
            cascade,
            runtime,
            gateway,
            cancel,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    /// Model for a phase: phase override, cascade default, engine default.
    pub fn model_for(&self, phase: &PhaseDef) -> String {
        phase.resolve_model(&self.cascade, &self.runtime.config.engine.default_model)
    }

    /// Whether response caching is on for a phase.
    pub fn cache_enabled(&self, phase: &PhaseDef) -> bool {
        phase.cache.unwrap_or(self.cascade.cache).enabled
    }
}
