//! Capability artifact persistence.
//!
//! Byte payloads are written to
//! `<root>/<execution_id>/<phase>/<attempt label>/<n>.<ext>`; reference
//! payloads (URLs, paths owned by the capability) are registered as-is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Broad media category of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Data,
    Text,
    Other,
}

/// Artifact payload as returned by a capability.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Bytes(Vec<u8>),
    Reference(String),
}

/// A side-channel artifact returned by a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub kind: MediaKind,
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    pub payload: ArtifactPayload,
}

impl Artifact {
    pub fn image_png(bytes: Vec<u8>) -> Self {
        Self {
            kind: MediaKind::Image,
            media_type: "image/png".into(),
            payload: ArtifactPayload::Bytes(bytes),
        }
    }

    pub fn reference(kind: MediaKind, media_type: &str, location: &str) -> Self {
        Self {
            kind,
            media_type: media_type.to_string(),
            payload: ArtifactPayload::Reference(location.to_string()),
        }
    }
}

/// A persisted or registered artifact, as the Echo indexes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: MediaKind,
    pub media_type: String,
    /// Filesystem path or external reference.
    pub location: String,
    pub phase: String,
    pub attempt: String,
    pub turn_seq: u64,
}

impl ArtifactRef {
    pub fn is_image(&self) -> bool {
        self.kind == MediaKind::Image
    }
}

/// Writes artifacts under a root directory.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    counters: Mutex<HashMap<PathBuf, usize>>,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one attempt's artifacts.
    pub fn attempt_dir(&self, execution_id: &str, phase: &str, attempt: &str) -> PathBuf {
        self.root.join(execution_id).join(phase).join(attempt)
    }

    /// Persist an artifact and return its reference.
    pub async fn persist(
        &self,
        execution_id: &str,
        phase: &str,
        attempt: &str,
        turn_seq: u64,
        artifact: &Artifact,
    ) -> Result<ArtifactRef> {
        let location = match &artifact.payload {
            ArtifactPayload::Reference(location) => location.clone(),
            ArtifactPayload::Bytes(bytes) => {
                let dir = self.attempt_dir(execution_id, phase, attempt);
                let n = self.next_index(&dir);
                let path = dir.join(format!("{}.{}", n, extension_for(&artifact.media_type)));

                tokio::fs::create_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to create artifact dir {}", dir.display()))?;
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to write artifact {}", path.display()))?;
                path.to_string_lossy().into_owned()
            }
        };

        Ok(ArtifactRef {
            kind: artifact.kind,
            media_type: artifact.media_type.clone(),
            location,
            phase: phase.to_string(),
            attempt: attempt.to_string(),
            turn_seq,
        })
    }

    fn next_index(&self, dir: &Path) -> usize {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(dir.to_path_buf()).or_insert(0);
        let n = *counter;
        *counter += 1;
        n
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "application/json" => "json",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "text/html" => "html",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_persist_bytes_keyed_by_attempt() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let first = store
            .persist("exec", "chart", "r0.s0.c1", 2, &Artifact::image_png(vec![1, 2, 3]))
            .await
            .unwrap();
        let second = store
            .persist("exec", "chart", "r0.s0.c1", 3, &Artifact::image_png(vec![4]))
            .await
            .unwrap();

        let expected_dir = dir.path().join("exec").join("chart").join("r0.s0.c1");
        assert_eq!(PathBuf::from(&first.location), expected_dir.join("0.png"));
        assert_eq!(PathBuf::from(&second.location), expected_dir.join("1.png"));
        assert_eq!(std::fs::read(&first.location).unwrap(), vec![1, 2, 3]);
        assert!(first.is_image());
        assert_eq!(second.turn_seq, 3);
    }

    #[tokio::test]
    async fn test_reference_is_registered_without_copy() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = Artifact::reference(MediaKind::Data, "application/json", "s3://bucket/x.json");

        let r = store.persist("exec", "p", "l", 1, &artifact).await.unwrap();
        assert_eq!(r.location, "s3://bucket/x.json");
        assert!(!dir.path().join("exec").exists());
    }

    #[test]
    fn test_extension_for_unknown_type() {
        assert_eq!(extension_for("application/x-weird"), "bin");
        assert_eq!(extension_for("image/jpeg"), "jpg");
    }
}
