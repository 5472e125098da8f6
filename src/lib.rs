//! Windlass: a declarative cascade engine for LLM workflows.
//!
//! A cascade is a list of phases. Each phase runs a turn loop against a
//! model, optionally explores several candidates (soundings) and refines the
//! winner (reforge), and is guarded by validators (wards). The
//! [`scheduler::CascadeScheduler`] is the entry point.

pub mod cascade;
pub mod config;
pub mod context;
pub mod echo;
pub mod errors;
pub mod logging;
pub mod mutation;
pub mod phase;
pub mod provider;
pub mod reforge;
pub mod scheduler;
pub mod soundings;
pub mod tools;
pub mod trace;
pub mod turn;
pub mod util;
pub mod validation;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use cascade::{CascadeDef, PhaseDef};
pub use echo::Echo;
pub use scheduler::{CascadeScheduler, RunOutcome, RunStatus, Runtime};
