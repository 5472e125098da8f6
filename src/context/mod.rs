//! Context assembly: what a model call sees.
//!
//! Three modes decide which prior artifacts are visible:
//! - full accumulation (no `context` key): every completed phase, shaped by retention
//! - selective (`context.from`): only the listed sources and categories
//! - inject (`context.inject` alone): full accumulation plus labelled extra blocks up front
//!
//! After assembly, per-category expiry trims the view and the token budget
//! is enforced with one of four strategies.

mod assembler;
mod budget;
mod spec;

pub use assembler::{ContextAssembler, assemble, is_expired};
pub use budget::{
    BudgetAction, BudgetEnforcer, BudgetLimit, BudgetReport, BudgetStrategy,
    DEFAULT_WARN_THRESHOLD, Summarizer, TokenBudgetSpec, estimate_tokens, parse_budget_limit,
};
pub use spec::{
    ArtifactCategory, ContextMode, ContextSource, ContextSpec, ExpirySpec, ImagesFilter,
    MessagesFilter, Retention, SourceSelector, mode_of,
};
