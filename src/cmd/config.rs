//! Configuration view and validation commands: `windlass config`.

use std::path::Path;

use anyhow::Result;

use windlass::config::{CONFIG_FILE_NAME, EngineConfig};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &EngineConfig,
    path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let source = match path {
        Some(path) => path.display().to_string(),
        None if Path::new(CONFIG_FILE_NAME).exists() => CONFIG_FILE_NAME.to_string(),
        None => "(defaults)".to_string(),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Windlass Configuration");
            println!("======================");
            println!();
            println!("Source: {} (with WINDLASS_* overrides)", source);
            println!();
            println!("{}", toml::to_string_pretty(config)?);
            println!("Resolved paths:");
            println!("  artifacts = {}", config.artifacts_dir().display());
            println!("  winners   = {}", config.winners_dir().display());
            println!("  trace     = {}", config.trace_file().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid ({})", source);
            } else {
                println!("Configuration warnings ({}):", source);
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
