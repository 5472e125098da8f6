//! Validator contract and registry.
//!
//! Validators are shared by pre-evaluation filtering in soundings, reforge
//! thresholds, loop-until and wards. Each is registered under a name with a
//! human-readable criteria text that is passed to every `validate` call.

mod wards;

pub use wards::{
    OnExhausted, WardCheck, WardDef, WardMode, WardOutcome, WardStage, WardsSpec, check_wards,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;

/// Judgement returned by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default)]
    pub reason: String,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// An externally implemented quality check.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, content: &str, criteria: &str) -> Result<Verdict>;
}

/// Adapts a plain function into a [`Validator`].
pub struct FnValidator<F>(pub F);

#[async_trait]
impl<F> Validator for FnValidator<F>
where
    F: Fn(&str) -> Verdict + Send + Sync,
{
    async fn validate(&self, content: &str, _criteria: &str) -> Result<Verdict> {
        Ok((self.0)(content))
    }
}

#[derive(Clone)]
struct Registered {
    criteria: String,
    validator: Arc<dyn Validator>,
}

/// Name-indexed validator registry.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    entries: BTreeMap<String, Registered>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, criteria: &str, validator: Arc<dyn Validator>) {
        self.entries.insert(
            name.to_string(),
            Registered {
                criteria: criteria.to_string(),
                validator,
            },
        );
    }

    pub fn with(mut self, name: &str, criteria: &str, validator: Arc<dyn Validator>) -> Self {
        self.register(name, criteria, validator);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Criteria text of a registered validator.
    pub fn criteria(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|r| r.criteria.as_str())
    }

    /// Run a validator by name.
    ///
    /// An unknown name or a validator that errors is a
    /// [`PhaseError::Validator`]; a rejection is an ordinary `Ok` verdict.
    pub async fn check(&self, name: &str, content: &str) -> Result<Verdict, PhaseError> {
        let entry = self.entries.get(name).ok_or_else(|| PhaseError::Validator {
            validator: name.to_string(),
            message: "not registered".into(),
        })?;
        entry
            .validator
            .validate(content, &entry.criteria)
            .await
            .map_err(|e| PhaseError::Validator {
                validator: name.to_string(),
                message: format!("{:#}", e),
            })
    }
}
