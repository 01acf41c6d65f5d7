//! Backup manifest: the durable list of snapshots and their integrity
//! status, kept as JSON next to the artifacts it describes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::Snapshot;

pub struct Manifest {
    path: PathBuf,
    pub snapshots: Vec<Snapshot>,
}

impl Manifest {
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("manifest.json");
        let snapshots = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Malformed manifest at {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self { path, snapshots })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.snapshots)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn upsert(&mut self, snapshot: Snapshot) {
        match self.snapshots.iter_mut().find(|s| s.id == snapshot.id) {
            Some(existing) => *existing = snapshot,
            None => self.snapshots.push(snapshot),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshots.iter().any(|s| s.id == id)
    }

    pub fn remove(&mut self, id: &str) {
        self.snapshots.retain(|s| s.id != id);
    }
}
