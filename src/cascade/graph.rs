//! Routing graph construction and structural validation.
//!
//! Every structural problem a cascade can have is caught here, before the
//! scheduler issues a single model call: duplicate names, dangling handoff or
//! context references, invalid exploration settings and routing cycles.

use std::collections::HashMap;

use super::{CascadeDef, PhaseDef};
use crate::context::{ContextSource, SourceSelector, parse_budget_limit};
use crate::errors::CascadeError;
use crate::tools::BUILTIN_CAPABILITIES;
use crate::validation::WardMode;

/// Index into the cascade's phase list.
pub type PhaseIndex = usize;

/// Validated routing structure of a cascade.
#[derive(Debug, Clone)]
pub struct RoutingGraph {
    names: Vec<String>,
    index_map: HashMap<String, PhaseIndex>,
    /// index -> routing targets, implicit fall-through included
    edges: Vec<Vec<PhaseIndex>>,
}

impl RoutingGraph {
    /// Build and validate the routing graph of a cascade.
    pub fn build(cascade: &CascadeDef) -> Result<Self, CascadeError> {
        if cascade.phases.is_empty() {
            return Err(CascadeError::Empty {
                cascade: cascade.cascade_id.clone(),
            });
        }

        if let Some(budget) = &cascade.token_budget {
            parse_budget_limit(&budget.limit)
                .map_err(|e| CascadeError::Parse(format!("token_budget: {:#}", e)))?;
        }

        let mut index_map = HashMap::new();
        for (i, phase) in cascade.phases.iter().enumerate() {
            if index_map.insert(phase.name.clone(), i).is_some() {
                return Err(CascadeError::DuplicatePhase {
                    name: phase.name.clone(),
                });
            }
        }

        let mut edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); cascade.phases.len()];
        for (from_idx, phase) in cascade.phases.iter().enumerate() {
            for target in cascade.targets_of(&phase.name) {
                let to_idx = *index_map.get(&target).ok_or_else(|| {
                    CascadeError::UnknownHandoff {
                        phase: phase.name.clone(),
                        target: target.clone(),
                    }
                })?;
                if !edges[from_idx].contains(&to_idx) {
                    edges[from_idx].push(to_idx);
                }
            }

            validate_context_refs(phase, &index_map)?;
            validate_phase_settings(phase)?;
        }

        let graph = Self {
            names: cascade.phases.iter().map(|p| p.name.clone()).collect(),
            index_map,
            edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Check validator and capability names against what the runtime knows.
    pub fn check_references(
        cascade: &CascadeDef,
        is_validator: impl Fn(&str) -> bool,
        is_tool: impl Fn(&str) -> bool,
    ) -> Result<(), CascadeError> {
        for phase in &cascade.phases {
            for validator in referenced_validators(phase) {
                if !is_validator(validator) {
                    return Err(CascadeError::UnknownValidator {
                        phase: phase.name.clone(),
                        validator: validator.to_string(),
                    });
                }
            }
            for tool in &phase.tools {
                if !BUILTIN_CAPABILITIES.contains(&tool.as_str()) && !is_tool(tool) {
                    return Err(CascadeError::UnknownTool {
                        phase: phase.name.clone(),
                        tool: tool.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of phases.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The phase execution starts at.
    pub fn entry(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    /// Routing targets of a phase, in declaration order.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        self.index_map
            .get(name)
            .map(|&i| {
                self.edges[i]
                    .iter()
                    .map(|&t| self.names[t].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a phase has no routing targets.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.successors(name).is_empty()
    }

    /// All edges as (from, to) name pairs.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.edges
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| {
                targets
                    .iter()
                    .map(move |&to| (self.names[from].as_str(), self.names[to].as_str()))
            })
            .collect()
    }

    /// Validate that routing has no cycles using Kahn's algorithm.
    fn validate_no_cycles(&self) -> Result<(), CascadeError> {
        let mut in_degree = vec![0usize; self.len()];
        for targets in &self.edges {
            for &t in targets {
                in_degree[t] += 1;
            }
        }

        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &next in &self.edges[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if processed == self.len() {
            return Ok(());
        }

        // Every unprocessed node keeps an unprocessed predecessor, so walking
        // predecessors from any of them must revisit a node on a cycle.
        let start = in_degree.iter().position(|&d| d > 0).unwrap_or(0);
        Err(CascadeError::RoutingCycle {
            path: self.find_cycle_from(start, &in_degree),
        })
    }

    fn find_cycle_from(&self, start: PhaseIndex, in_degree: &[usize]) -> Vec<String> {
        let mut path = vec![start];
        let mut current = start;
        while let Some(prev) =
            (0..self.len()).find(|&p| in_degree[p] > 0 && self.edges[p].contains(&current))
        {
            if let Some(pos) = path.iter().position(|&p| p == prev) {
                // path runs against edge direction; flip it into routing order
                let mut cycle = vec![prev];
                cycle.extend(path[pos..].iter().rev());
                return cycle.into_iter().map(|i| self.names[i].clone()).collect();
            }
            path.push(prev);
            current = prev;
        }
        vec![self.names[start].clone()]
    }
}

fn validate_context_refs(
    phase: &PhaseDef,
    index_map: &HashMap<String, PhaseIndex>,
) -> Result<(), CascadeError> {
    let Some(context) = &phase.context else {
        return Ok(());
    };
    if !context.from.is_empty() && !context.inject.is_empty() {
        return Err(CascadeError::InvalidPhase {
            phase: phase.name.clone(),
            message: "context cannot declare both 'from' and 'inject'".into(),
        });
    }
    let sources: Vec<&ContextSource> = context.from.iter().chain(context.inject.iter()).collect();
    for source in sources {
        if let SourceSelector::Named(name) = source.selector() {
            if !index_map.contains_key(name) {
                return Err(CascadeError::UnknownContextSource {
                    phase: phase.name.clone(),
                    source_phase: name.to_string(),
                });
            }
            if name == phase.name {
                return Err(CascadeError::InvalidPhase {
                    phase: phase.name.clone(),
                    message: "context cannot read from the phase itself".into(),
                });
            }
        }
    }
    Ok(())
}

fn validate_phase_settings(phase: &PhaseDef) -> Result<(), CascadeError> {
    let invalid = |message: &str| CascadeError::InvalidPhase {
        phase: phase.name.clone(),
        message: message.to_string(),
    };

    if phase.rules.max_turns == Some(0) {
        return Err(invalid("rules.max_turns must be at least 1"));
    }

    if let Some(budget) = &phase.token_budget {
        parse_budget_limit(&budget.limit).map_err(|e| invalid(&format!("{:#}", e)))?;
    }

    if let Some(soundings) = &phase.soundings {
        if soundings.total_factor() == 0 {
            return Err(invalid("soundings factor must be at least 1"));
        }
        if soundings.models.iter().any(|m| m.factor == 0) {
            return Err(invalid("every soundings model needs a factor of at least 1"));
        }
    }

    if let Some(reforge) = &phase.reforge {
        if reforge.factor_per_step == 0 {
            return Err(invalid("reforge factor_per_step must be at least 1"));
        }
    }

    if let Some(wards) = &phase.wards {
        if wards.pre.iter().any(|w| w.mode == WardMode::Retry) {
            return Err(invalid(
                "pre-wards cannot use retry mode; the phase input does not change between attempts",
            ));
        }
        if wards.all().any(|w| w.max_attempts == 0) {
            return Err(invalid("ward max_attempts must be at least 1"));
        }
    }

    Ok(())
}

fn referenced_validators(phase: &PhaseDef) -> Vec<&str> {
    let mut names = Vec::new();
    if let Some(v) = &phase.rules.loop_until {
        names.push(v.as_str());
    }
    if let Some(v) = phase.soundings.as_ref().and_then(|s| s.validator.as_ref()) {
        names.push(v.as_str());
    }
    if let Some(t) = phase.reforge.as_ref().and_then(|r| r.threshold.as_ref()) {
        names.push(t.validator.as_str());
    }
    if let Some(wards) = &phase.wards {
        names.extend(wards.all().map(|w| w.validator.as_str()));
    }
    names
}
