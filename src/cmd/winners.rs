//! Winner lineage listing: `windlass winners`.

use anyhow::Result;

use windlass::config::EngineConfig;
use windlass::mutation::FileWinnerStore;

pub fn cmd_winners(config: &EngineConfig, species: &str, k: usize) -> Result<()> {
    let store = FileWinnerStore::new(&config.winners_dir());
    let mut entries = store.entries(species)?;
    entries.reverse();

    if entries.is_empty() {
        println!("No winners recorded for species {}", species);
        println!("  (looked in {})", store.dir().display());
        return Ok(());
    }

    println!();
    println!("Winners for {} (newest first):", species);
    for (i, entry) in entries.iter().take(k).enumerate() {
        println!();
        println!("{}. {}", i + 1, entry.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"));
        for line in entry.text.lines() {
            println!("   {}", line);
        }
    }
    println!();
    Ok(())
}
