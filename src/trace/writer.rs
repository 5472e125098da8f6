//! JSONL trace sink backed by a background writer task, plus trace reading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use super::{TraceKind, TraceRecord, TraceSink};

enum Command {
    Record(Box<TraceRecord>),
    Flush(oneshot::Sender<()>),
}

/// Appends one JSON object per line to a file.
///
/// `emit` pushes onto an unbounded channel and returns immediately; a task
/// spawned at creation drains it. Call [`JsonlTraceSink::flush`] to wait for
/// everything emitted so far to reach the file.
#[derive(Debug, Clone)]
pub struct JsonlTraceSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl JsonlTraceSink {
    /// Open (append) the file and spawn the writer. Requires a tokio runtime.
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create trace dir {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open trace file {}", path.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(file, rx, path.to_path_buf()));

        Ok(Self {
            path: path.to_path_buf(),
            tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every record emitted before this call is written.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| anyhow::anyhow!("Trace writer for {} has stopped", self.path.display()))?;
        ack_rx
            .await
            .context("Trace writer dropped the flush request")?;
        Ok(())
    }
}

impl TraceSink for JsonlTraceSink {
    fn emit(&self, record: TraceRecord) {
        if self.tx.send(Command::Record(Box::new(record))).is_err() {
            tracing::warn!(path = %self.path.display(), "Trace writer has stopped; record dropped");
        }
    }
}

async fn write_loop(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<Command>,
    path: PathBuf,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize trace record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write trace record");
                }
            }
            Command::Flush(ack) => {
                if let Err(e) = file.flush().await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to flush trace file");
                }
                let _ = ack.send(());
            }
        }
    }
}

/// Read every record of a JSONL trace file.
pub fn read_trace(path: &Path) -> Result<Vec<TraceRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace file {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid trace record on line {}", i + 1))
        })
        .collect()
}

/// Aggregate view of a trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSummary {
    pub records: usize,
    pub executions: usize,
    pub by_kind: BTreeMap<TraceKind, usize>,
    pub by_phase: BTreeMap<String, usize>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Summarise records per kind and per phase.
///
/// Tokens and cost are summed over turn-level records only, so nested
/// candidate and phase totals are not double counted.
pub fn summarize(records: &[TraceRecord]) -> TraceSummary {
    let mut summary = TraceSummary {
        records: records.len(),
        ..Default::default()
    };
    let mut executions = std::collections::BTreeSet::new();
    for record in records {
        executions.insert(record.execution_id.as_str());
        *summary.by_kind.entry(record.kind).or_insert(0) += 1;
        if let Some(phase) = &record.phase {
            *summary.by_phase.entry(phase.clone()).or_insert(0) += 1;
        }
        if record.kind == TraceKind::Turn {
            summary.total_tokens += record.tokens.unwrap_or(0);
            summary.total_cost_usd += record.cost_usd.unwrap_or(0.0);
        }
    }
    summary.executions = executions.len();
    summary
}
