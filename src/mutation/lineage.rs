//! Winner lineage storage, keyed by species hash.
//!
//! Lineage must survive restarts and concurrent executions, so the file store
//! appends one JSON line per winner under an exclusive lock.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Persistent record of winning rewritten instructions.
#[async_trait]
pub trait WinnerStore: Send + Sync {
    /// Up to `k` most recent winners, newest first.
    async fn get_recent_winners(&self, species: &str, k: usize) -> Result<Vec<String>>;

    async fn record_winner(&self, species: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerEntry {
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// In-process store; lineage is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryWinnerStore {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryWinnerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WinnerStore for MemoryWinnerStore {
    async fn get_recent_winners(&self, species: &str, k: usize) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(species)
            .map(|list| list.iter().rev().take(k).cloned().collect())
            .unwrap_or_default())
    }

    async fn record_winner(&self, species: &str, text: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(species.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }
}

/// One `<species>.jsonl` file per species under a directory.
#[derive(Debug, Clone)]
pub struct FileWinnerStore {
    dir: PathBuf,
}

impl FileWinnerStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, species: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", species))
    }

    /// Every recorded entry of a species, oldest first.
    pub fn entries(&self, species: &str) -> Result<Vec<WinnerEntry>> {
        read_entries(&self.path_for(species))
    }
}

fn read_entries(path: &Path) -> Result<Vec<WinnerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open winner lineage {}", path.display()))?;
    file.lock_shared()
        .with_context(|| format!("Failed to lock winner lineage {}", path.display()))?;
    let mut entries = Vec::new();
    for (i, line) in BufReader::new(&file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WinnerEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = i + 1,
                error = %e,
                "Skipping corrupt winner lineage entry"
            ),
        }
    }
    FileExt::unlock(&file)
        .with_context(|| format!("Failed to unlock winner lineage {}", path.display()))?;
    Ok(entries)
}

fn append_entry(path: &Path, entry: &WinnerEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create winners dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open winner lineage {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock winner lineage {}", path.display()))?;
    let mut line = serde_json::to_string(entry).context("Failed to serialize winner entry")?;
    line.push('\n');
    let written = file
        .write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()));
    FileExt::unlock(&file)
        .with_context(|| format!("Failed to unlock winner lineage {}", path.display()))?;
    written
}

#[async_trait]
impl WinnerStore for FileWinnerStore {
    async fn get_recent_winners(&self, species: &str, k: usize) -> Result<Vec<String>> {
        let path = self.path_for(species);
        let entries = tokio::task::spawn_blocking(move || read_entries(&path))
            .await
            .context("Winner lineage read task panicked")??;
        Ok(entries.into_iter().rev().take(k).map(|e| e.text).collect())
    }

    async fn record_winner(&self, species: &str, text: &str) -> Result<()> {
        let path = self.path_for(species);
        let entry = WinnerEntry {
            text: text.to_string(),
            recorded_at: Utc::now(),
        };
        tokio::task::spawn_blocking(move || append_entry(&path, &entry))
            .await
            .context("Winner lineage write task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_store_newest_first() {
        let store = MemoryWinnerStore::new();
        for text in ["a", "b", "c"] {
            store.record_winner("s1", text).await.unwrap();
        }
        store.record_winner("s2", "other").await.unwrap();

        assert_eq!(store.get_recent_winners("s1", 2).await.unwrap(), vec!["c", "b"]);
        assert!(store.get_recent_winners("none", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileWinnerStore::new(&dir.path().join("winners"));
            store.record_winner("abc", "first").await.unwrap();
            store.record_winner("abc", "second").await.unwrap();
        }
        let reopened = FileWinnerStore::new(&dir.path().join("winners"));
        assert_eq!(
            reopened.get_recent_winners("abc", 5).await.unwrap(),
            vec!["second", "first"]
        );
        assert_eq!(reopened.entries("abc").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_concurrent_appends() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileWinnerStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_winner("s", &format!("w{}", i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get_recent_winners("s", 100).await.unwrap().len(), 20);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempdir().unwrap();
        let store = FileWinnerStore::new(dir.path());
        let good = serde_json::to_string(&WinnerEntry {
            text: "ok".into(),
            recorded_at: Utc::now(),
        })
        .unwrap();
        std::fs::write(dir.path().join("s.jsonl"), format!("garbage\n{}\n", good)).unwrap();
        let entries = store.entries("s").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "ok");
    }
}
