//! Cascade and phase definitions.
//!
//! A cascade is an ordered list of phases plus cascade-wide resource policy.
//! Definitions are immutable once loaded; the scheduler validates them with
//! [`RoutingGraph::build`] before anything executes.
//!
//! ```yaml
//! cascade_id: blog_post
//! phases:
//!   - name: draft
//!     instructions: "Write a post about {{ input.topic }}"
//!     soundings:
//!       factor: 3
//!       evaluator_instructions: "Pick the most engaging draft"
//!     handoffs: [review]
//!   - name: review
//!     instructions: "Tighten the draft"
//!     wards:
//!       post:
//!         - validator: no_typos
//!           mode: retry
//! ```

mod graph;
mod loader;
mod template;

pub use graph::RoutingGraph;
pub use loader::{load_cascade, parse_cascade};
pub use template::render_instructions;

use serde::{Deserialize, Serialize};

use crate::context::{ContextSpec, ExpirySpec, Retention, TokenBudgetSpec};
use crate::reforge::ReforgeSpec;
use crate::soundings::SoundingsSpec;
use crate::validation::WardsSpec;

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeDef {
    /// Identifier used in traces and artifact paths.
    pub cascade_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Model used by phases that do not name one.
    #[serde(default)]
    pub model: Option<String>,
    pub phases: Vec<PhaseDef>,
    /// Context ceiling applied to every phase unless overridden.
    #[serde(default)]
    pub token_budget: Option<TokenBudgetSpec>,
    /// Total tokens all model calls of one execution may consume.
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
    #[serde(default)]
    pub cache: CachePolicy,
    /// What completed phases carry forward by default.
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub expiry: ExpirySpec,
}

impl CascadeDef {
    /// Get a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Position of a phase in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Resolve the routing targets of a phase.
    ///
    /// A phase without a `handoffs` key falls through to the next declared
    /// phase; an explicit empty list makes it terminal.
    pub fn targets_of(&self, name: &str) -> Vec<String> {
        let Some(index) = self.position(name) else {
            return Vec::new();
        };
        match &self.phases[index].handoffs {
            Some(targets) => targets.clone(),
            None => self
                .phases
                .get(index + 1)
                .map(|next| vec![next.name.clone()])
                .unwrap_or_default(),
        }
    }
}

/// One named execution unit of a cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDef {
    pub name: String,
    /// Instruction template (minijinja syntax).
    pub instructions: String,
    /// Capability names the model may call.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub rules: RuleSpec,
    /// Routing targets. `None` means "next declared phase".
    #[serde(default)]
    pub handoffs: Option<Vec<String>>,
    /// Presence switches the phase from full accumulation to selective/inject mode.
    #[serde(default)]
    pub context: Option<ContextSpec>,
    #[serde(default)]
    pub soundings: Option<SoundingsSpec>,
    #[serde(default)]
    pub reforge: Option<ReforgeSpec>,
    #[serde(default)]
    pub wards: Option<WardsSpec>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tool_protocol: ToolProtocol,
    #[serde(default)]
    pub retention: Option<Retention>,
    #[serde(default)]
    pub expiry: Option<ExpirySpec>,
    #[serde(default)]
    pub token_budget: Option<TokenBudgetSpec>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
}

impl PhaseDef {
    /// Minimal phase with only a name and instructions.
    pub fn new(name: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions.to_string(),
            tools: Vec::new(),
            rules: RuleSpec::default(),
            handoffs: None,
            context: None,
            soundings: None,
            reforge: None,
            wards: None,
            model: None,
            tool_protocol: ToolProtocol::default(),
            retention: None,
            expiry: None,
            token_budget: None,
            cache: None,
        }
    }

    /// Set explicit routing targets.
    pub fn with_handoffs(mut self, targets: &[&str]) -> Self {
        self.handoffs = Some(targets.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Set the capability list.
    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Whether this phase explores candidates instead of running one attempt.
    pub fn explores(&self) -> bool {
        self.soundings.is_some() || self.reforge.is_some()
    }

    /// Model for this phase: phase override, cascade default, then engine default.
    pub fn resolve_model(&self, cascade: &CascadeDef, fallback: &str) -> String {
        self.model
            .clone()
            .or_else(|| cascade.model.clone())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Execution rules of a phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleSpec {
    /// Turn budget; the engine default applies when absent.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Validator that must accept the output before the phase completes.
    #[serde(default)]
    pub loop_until: Option<String>,
    /// Keep the loop-until criterion out of the prompt.
    #[serde(default)]
    pub loop_until_silent: bool,
    /// Custom text injected instead of the validator's criteria.
    #[serde(default)]
    pub loop_until_prompt: Option<String>,
    /// Opening user message template; a neutral kickoff is used otherwise.
    #[serde(default)]
    pub turn_prompt: Option<String>,
}

/// How capability calls travel between the engine and the model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    /// Tool descriptions in the instructions, calls parsed from free text.
    #[default]
    Prompt,
    /// Provider-native structured function calling.
    Native,
}

/// Response cache policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
}
