//! Shared token and cost counters for one execution.
//!
//! Candidates complete concurrently, so every update is an atomic add.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::Usage;
use crate::errors::PhaseError;

const MICROS_PER_USD: f64 = 1_000_000.0;

#[derive(Debug, Default)]
pub struct ResourceLedger {
    limit: Option<u64>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_micros: AtomicU64,
    calls: AtomicU64,
    cache_hits: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
    pub cache_hits: u64,
}

impl LedgerSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl ResourceLedger {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.load(Ordering::SeqCst) + self.output_tokens.load(Ordering::SeqCst)
    }

    /// Fail if the allowance is already spent.
    pub fn check(&self) -> Result<(), PhaseError> {
        match self.limit {
            Some(limit) => {
                let used = self.total_tokens();
                if used >= limit {
                    Err(PhaseError::TokenAllowanceExhausted { used, limit })
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn record(&self, usage: &Usage) {
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::SeqCst);
        self.cost_micros.fetch_add(
            (usage.cost_usd.max(0.0) * MICROS_PER_USD).round() as u64,
            Ordering::SeqCst,
        );
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            input_tokens: self.input_tokens.load(Ordering::SeqCst),
            output_tokens: self.output_tokens.load(Ordering::SeqCst),
            cost_usd: self.cost_micros.load(Ordering::SeqCst) as f64 / MICROS_PER_USD,
            calls: self.calls.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn usage(input: u64, output: u64, cost: f64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
        }
    }

    #[test]
    fn test_unlimited_never_fails() {
        let ledger = ResourceLedger::new(None);
        ledger.record(&usage(1_000_000, 1_000_000, 5.0));
        assert!(ledger.check().is_ok());
    }

    #[test]
    fn test_limit_enforced() {
        let ledger = ResourceLedger::new(Some(100));
        ledger.record(&usage(60, 30, 0.0));
        assert!(ledger.check().is_ok());
        ledger.record(&usage(5, 5, 0.0));
        match ledger.check() {
            Err(PhaseError::TokenAllowanceExhausted { used, limit }) => {
                assert_eq!(used, 100);
                assert_eq!(limit, 100);
            }
            other => panic!("Expected TokenAllowanceExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_records_all_counted() {
        let ledger = Arc::new(ResourceLedger::new(None));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger.record(&usage(1, 2, 0.001));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = ledger.snapshot();
        assert_eq!(snap.input_tokens, 1600);
        assert_eq!(snap.output_tokens, 3200);
        assert_eq!(snap.calls, 1600);
        assert!((snap.cost_usd - 1.6).abs() < 1e-9);
    }
}
