//! Routing resolution after a phase completes.

use serde::Serialize;

use crate::cascade::CascadeDef;

/// Where the cascade goes after a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "route", content = "target")]
pub enum Route {
    Next(String),
    Terminal,
}

/// How the route was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    /// Exactly one target (or none).
    Direct,
    /// The model called `route_to`.
    Model,
    /// Several targets, no decision: first declared target.
    Default,
}

/// Resolve the successor of `phase` given the model's `route_to` decision.
///
/// Decisions naming a target the phase cannot reach are ignored; the turn
/// executor already rejects them, so this only guards stale state.
pub fn resolve_route(cascade: &CascadeDef, phase: &str, decision: Option<&str>) -> (Route, RouteSource) {
    let targets = cascade.targets_of(phase);
    match targets.as_slice() {
        [] => (Route::Terminal, RouteSource::Direct),
        [only] => (Route::Next(only.clone()), RouteSource::Direct),
        [first, ..] => match decision.filter(|d| targets.iter().any(|t| t == d)) {
            Some(chosen) => (Route::Next(chosen.to_string()), RouteSource::Model),
            None => {
                tracing::info!(
                    phase,
                    target = %first,
                    "No routing decision made; taking the first declared target"
                );
                (Route::Next(first.clone()), RouteSource::Default)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{PhaseDef, parse_cascade};

    fn cascade() -> CascadeDef {
        let mut c = parse_cascade(r#"{"cascade_id": "c", "phases": []}"#).unwrap();
        c.phases = vec![
            PhaseDef::new("triage", "x").with_handoffs(&["bug", "feature"]),
            PhaseDef::new("bug", "x").with_handoffs(&[]),
            PhaseDef::new("feature", "x"),
        ];
        c
    }

    #[test]
    fn test_model_decision_wins() {
        assert_eq!(
            resolve_route(&cascade(), "triage", Some("feature")),
            (Route::Next("feature".into()), RouteSource::Model)
        );
    }

    #[test]
    fn test_missing_or_stale_decision_defaults_to_first() {
        let c = cascade();
        assert_eq!(
            resolve_route(&c, "triage", None),
            (Route::Next("bug".into()), RouteSource::Default)
        );
        assert_eq!(
            resolve_route(&c, "triage", Some("nowhere")).1,
            RouteSource::Default
        );
    }

    #[test]
    fn test_terminal_and_direct() {
        let c = cascade();
        assert_eq!(resolve_route(&c, "bug", Some("feature")).0, Route::Terminal);
        assert_eq!(resolve_route(&c, "feature", None).0, Route::Terminal);
    }
}
