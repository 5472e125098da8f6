//! Trace summary: `windlass trace`.

use std::path::Path;

use anyhow::Result;

use windlass::trace::{read_trace, summarize};

pub fn cmd_trace(path: &Path) -> Result<()> {
    let records = read_trace(path)?;
    let summary = summarize(&records);

    println!();
    println!("Trace {}", path.display());
    println!(
        "  {} records across {} execution(s)",
        summary.records, summary.executions
    );
    println!("  tokens: {}", summary.total_tokens);
    println!("  cost:   ${:.4}", summary.total_cost_usd);

    if !summary.by_kind.is_empty() {
        println!();
        println!("By kind:");
        for (kind, count) in &summary.by_kind {
            println!("  {:<18} {}", kind.to_string(), count);
        }
    }
    if !summary.by_phase.is_empty() {
        println!();
        println!("By phase:");
        for (phase, count) in &summary.by_phase {
            println!("  {:<18} {}", phase, count);
        }
    }
    println!();
    Ok(())
}
