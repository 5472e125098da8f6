//! Causal execution trace.
//!
//! Every turn, candidate, evaluation and phase transition becomes a
//! [`TraceRecord`] with a parent link, so the branching tree
//! (cascade -> phase -> candidate -> turn) can be rebuilt afterwards.
//! Sinks must never block the engine: `emit` is synchronous and cheap.

mod writer;

pub use writer::{JsonlTraceSink, TraceSummary, read_trace, summarize};

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::provider::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    CascadeStarted,
    CascadeCompleted,
    PhaseStarted,
    PhaseCompleted,
    PhaseTransition,
    Turn,
    ModelRetry,
    CacheHit,
    ToolCall,
    Candidate,
    Evaluation,
    Mutation,
    ReforgeStep,
    Ward,
    ContextBudget,
    Error,
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde names are the canonical spelling
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub execution_id: String,
    pub kind: TraceKind,
    pub phase: Option<String>,
    pub attempt: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub detail: Value,
}

impl TraceRecord {
    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn usage(mut self, usage: &Usage) -> Self {
        self.tokens = Some(usage.total_tokens());
        self.cost_usd = Some(usage.cost_usd);
        self
    }

    pub fn attempt(mut self, attempt: &str) -> Self {
        self.attempt = Some(attempt.to_string());
        self
    }
}

/// Destination for trace records.
pub trait TraceSink: Send + Sync {
    /// Accept a record without blocking.
    fn emit(&self, record: TraceRecord);
}

/// Scoped handle for emitting records with parent linkage.
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<dyn TraceSink>,
    execution_id: String,
    parent_id: Option<String>,
    phase: Option<String>,
    attempt: Option<String>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("execution_id", &self.execution_id)
            .field("parent_id", &self.parent_id)
            .field("phase", &self.phase)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Tracer {
    pub fn new(sink: Arc<dyn TraceSink>, execution_id: &str) -> Self {
        Self {
            sink,
            execution_id: execution_id.to_string(),
            parent_id: None,
            phase: None,
            attempt: None,
        }
    }

    /// A tracer that drops everything.
    pub fn null() -> Self {
        Self::new(Arc::new(NullTraceSink), "")
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Start a record pre-filled with this scope.
    pub fn record(&self, kind: TraceKind) -> TraceRecord {
        TraceRecord {
            id: Uuid::new_v4().to_string(),
            parent_id: self.parent_id.clone(),
            execution_id: self.execution_id.clone(),
            kind,
            phase: self.phase.clone(),
            attempt: self.attempt.clone(),
            timestamp: Utc::now(),
            duration_ms: None,
            tokens: None,
            cost_usd: None,
            detail: Value::Null,
        }
    }

    pub fn emit(&self, record: TraceRecord) {
        self.sink.emit(record);
    }

    /// Emit a record and return a tracer whose records hang under it.
    pub fn open(&self, record: TraceRecord) -> Tracer {
        let child = self.child(&record.id);
        self.emit(record);
        child
    }

    /// Emit a `kind` record with `detail` and return the nested scope under it.
    pub fn span(&self, kind: TraceKind, detail: Value) -> Tracer {
        self.open(self.record(kind).detail(detail))
    }

    /// Nested scope under the record `parent_id`.
    pub fn child(&self, parent_id: &str) -> Tracer {
        Tracer {
            parent_id: Some(parent_id.to_string()),
            ..self.clone()
        }
    }

    pub fn for_phase(&self, phase: &str) -> Tracer {
        Tracer {
            phase: Some(phase.to_string()),
            attempt: None,
            ..self.clone()
        }
    }

    pub fn for_attempt(&self, attempt: &str) -> Tracer {
        Tracer {
            attempt: Some(attempt.to_string()),
            ..self.clone()
        }
    }
}

/// Keeps records in memory; for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_kind(&self, kind: TraceKind) -> Vec<TraceRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: TraceKind) -> usize {
        self.of_kind(kind).len()
    }

    /// Records of a kind for one phase.
    pub fn for_phase(&self, kind: TraceKind, phase: &str) -> Vec<TraceRecord> {
        self.of_kind(kind)
            .into_iter()
            .filter(|r| r.phase.as_deref() == Some(phase))
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn emit(&self, record: TraceRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&self, _record: TraceRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_scopes_link_to_parent() {
        let sink = Arc::new(MemoryTraceSink::new());
        let root = Tracer::new(sink.clone(), "exec-1");

        let phase = root.for_phase("draft").span(TraceKind::PhaseStarted, Value::Null);
        let candidate = phase
            .for_attempt("r0.s0.c1")
            .span(TraceKind::Candidate, json!({"model": "m"}));
        candidate.emit(candidate.record(TraceKind::Turn).detail(json!({"turn": 1})));

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].parent_id, None);
        assert_eq!(records[1].parent_id.as_deref(), Some(records[0].id.as_str()));
        assert_eq!(records[2].parent_id.as_deref(), Some(records[1].id.as_str()));
        assert_eq!(records[2].phase.as_deref(), Some("draft"));
        assert_eq!(records[2].attempt.as_deref(), Some("r0.s0.c1"));
        assert!(records.iter().all(|r| r.execution_id == "exec-1"));
    }

    #[test]
    fn test_usage_and_duration() {
        let tracer = Tracer::null();
        let rec = tracer
            .record(TraceKind::Turn)
            .usage(&Usage {
                input_tokens: 3,
                output_tokens: 4,
                cost_usd: 0.5,
            })
            .duration(Duration::from_millis(1500));
        assert_eq!(rec.tokens, Some(7));
        assert_eq!(rec.cost_usd, Some(0.5));
        assert_eq!(rec.duration_ms, Some(1500));
    }

    #[test]
    fn test_kind_display_matches_serde() {
        assert_eq!(TraceKind::ContextBudget.to_string(), "context_budget");
        assert_eq!(TraceKind::Candidate.to_string(), "candidate");
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = Arc::new(MemoryTraceSink::new());
        let tracer = Tracer::new(sink.clone(), "e");
        tracer.for_phase("a").emit(tracer.for_phase("a").record(TraceKind::Candidate));
        tracer.for_phase("b").emit(tracer.for_phase("b").record(TraceKind::Candidate));
        assert_eq!(sink.count(TraceKind::Candidate), 2);
        assert_eq!(sink.for_phase(TraceKind::Candidate, "a").len(), 1);
    }
}
