//! Instruction template rendering.

use minijinja::{Environment, Value, context};

use crate::echo::Echo;
use crate::errors::PhaseError;

/// Render a phase template against the execution state.
///
/// Templates see `input` (cascade input), `state` (key/value store),
/// `outputs` (phase name -> final output) and `phase` (the phase name).
/// Undefined variables render empty rather than failing.
pub fn render_instructions(phase: &str, template: &str, echo: &Echo) -> Result<String, PhaseError> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let env = Environment::new();
    let ctx = context! {
        input => Value::from_serialize(&echo.input),
        state => Value::from_serialize(&echo.state),
        outputs => Value::from_serialize(echo.outputs()),
        phase => phase,
    };

    env.render_str(template, ctx).map_err(|e| PhaseError::Template {
        phase: phase.to_string(),
        message: e.to_string(),
    })
}
