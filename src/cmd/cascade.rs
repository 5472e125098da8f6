//! Cascade inspection commands: `windlass validate` and `windlass species`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use windlass::cascade::{RoutingGraph, load_cascade};
use windlass::mutation::species_hash;

pub fn cmd_validate(path: &Path) -> Result<()> {
    let cascade = load_cascade(path)?;
    let graph = RoutingGraph::build(&cascade)
        .with_context(|| format!("Cascade {} is invalid", path.display()))?;

    println!();
    println!("Cascade '{}' is valid", cascade.cascade_id);
    if let Some(description) = &cascade.description {
        println!("  {}", description);
    }
    println!();
    println!("Phases ({}):", graph.len());
    for phase in &cascade.phases {
        let mut traits = Vec::new();
        if let Some(soundings) = &phase.soundings {
            traits.push(format!("soundings x{}", soundings.total_factor()));
        }
        if let Some(reforge) = &phase.reforge {
            traits.push(format!("reforge {} steps", reforge.steps));
        }
        if phase.rules.loop_until.is_some() {
            traits.push("loop_until".to_string());
        }
        if phase.wards.as_ref().is_some_and(|w| w.all().next().is_some()) {
            traits.push("wards".to_string());
        }
        if traits.is_empty() {
            println!("  - {}", phase.name);
        } else {
            println!("  - {} ({})", phase.name, traits.join(", "));
        }
    }
    println!();
    println!("Routing:");
    println!("  entry: {}", graph.entry());
    for phase in &cascade.phases {
        let targets = graph.successors(&phase.name);
        if targets.is_empty() {
            println!("  {} -> (end)", phase.name);
        } else {
            println!("  {} -> {}", phase.name, targets.join(" | "));
        }
    }
    println!();
    Ok(())
}

pub fn cmd_species(path: &Path, only: Option<&str>) -> Result<()> {
    let cascade = load_cascade(path)?;
    let phases: Vec<_> = cascade
        .phases
        .iter()
        .filter(|p| only.is_none_or(|name| p.name == name))
        .collect();
    if phases.is_empty() {
        if let Some(name) = only {
            bail!("Phase '{}' not found in cascade '{}'", name, cascade.cascade_id);
        }
        bail!("Cascade '{}' has no phases", cascade.cascade_id);
    }

    for phase in phases {
        println!("{}  {}", species_hash(phase), phase.name);
    }
    Ok(())
}
