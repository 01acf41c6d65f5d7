//! Verifiable, restorable snapshots taken before anything mutates.
//!
//! The manager only ever reads from its sources; artifacts land under
//! `<state_dir>/backups/` and are listed in the manifest so `verify-backups`
//! and the rollback path can find them after a restart.

pub mod manifest;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::infra::{DatabaseAdmin, MediaStore, ObjectStore};
use manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Database,
    Media,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Database => write!(f, "db"),
            SnapshotKind::Media => write!(f, "media"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
    Untested,
    Verified,
    Corrupt,
}

/// One backup artifact. Immutable once created: verification only moves
/// the integrity field, never the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub kind: SnapshotKind,
    pub local_path: PathBuf,
    pub remote_uri: Option<String>,
    pub size_bytes: u64,
    pub checksum: String,
    pub integrity: Integrity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup source unreachable ({kind}): {source}")]
    SourceUnreachable {
        kind: SnapshotKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Insufficient storage writing snapshot artifact")]
    InsufficientStorage(#[source] std::io::Error),

    #[error("Snapshot '{id}' failed its integrity check")]
    IntegrityCheckFailed { id: String },

    #[error("Snapshot upload failed: {0}")]
    RemoteUpload(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(anyhow::Error),
}

/// Ids are second-resolution timestamps. A second same-kind snapshot within
/// one second gets a numeric suffix instead of clobbering the first entry
/// and orphaning its artifact.
fn unique_snapshot_id(kind: SnapshotKind, manifest: &Manifest) -> String {
    let base = format!("{}-{}", kind, Local::now().format("%Y%m%d-%H%M%S"));
    if !manifest.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let id = format!("{}-{}", base, n);
        if !manifest.contains(&id) {
            return id;
        }
        n += 1;
    }
}

const ENOSPC: i32 = 28;

fn map_write_err(e: std::io::Error) -> BackupError {
    if e.raw_os_error() == Some(ENOSPC) {
        BackupError::InsufficientStorage(e)
    } else {
        BackupError::Io(e)
    }
}

pub struct BackupManager {
    database: Arc<dyn DatabaseAdmin>,
    media: Arc<dyn MediaStore>,
    remote: Option<Arc<dyn ObjectStore>>,
    state_dir: PathBuf,
}

impl BackupManager {
    pub fn new(
        database: Arc<dyn DatabaseAdmin>,
        media: Arc<dyn MediaStore>,
        remote: Option<Arc<dyn ObjectStore>>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            database,
            media,
            remote,
            state_dir,
        }
    }

    fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Dump the source, write the artifact, record it in the manifest.
    /// Never mutates the source.
    pub async fn create_snapshot(&self, kind: SnapshotKind) -> Result<Snapshot, BackupError> {
        let bytes = match kind {
            SnapshotKind::Database => self.database.dump().await,
            SnapshotKind::Media => self.media.archive().await,
        }
        .map_err(|source| BackupError::SourceUnreachable { kind, source })?;

        let mut manifest = Manifest::load(&self.state_dir).map_err(BackupError::Manifest)?;
        let id = unique_snapshot_id(kind, &manifest);
        let ext = match kind {
            SnapshotKind::Database => "dump",
            SnapshotKind::Media => "tar.gz",
        };

        std::fs::create_dir_all(self.backups_dir()).map_err(map_write_err)?;
        let local_path = self.backups_dir().join(format!("{}.{}", id, ext));
        std::fs::write(&local_path, &bytes).map_err(map_write_err)?;

        let checksum = hex::encode(Sha256::digest(&bytes));

        let remote_uri = match &self.remote {
            Some(store) => Some(
                store
                    .upload(&format!("{}.{}", id, ext), &bytes)
                    .await
                    .map_err(BackupError::RemoteUpload)?,
            ),
            None => None,
        };

        let snapshot = Snapshot {
            id: id.clone(),
            kind,
            local_path,
            remote_uri,
            size_bytes: bytes.len() as u64,
            checksum,
            integrity: Integrity::Untested,
            created_at: Utc::now(),
        };

        manifest.upsert(snapshot.clone());
        manifest.save().map_err(BackupError::Manifest)?;

        info!("Snapshot {} created ({} bytes)", id, snapshot.size_bytes);
        Ok(snapshot)
    }

    /// Structural integrity check: checksum against the artifact on disk,
    /// plus a restorability smoke test for database dumps. Updates the
    /// snapshot's integrity status in the manifest and returns it.
    pub async fn verify_snapshot(&self, snapshot: &mut Snapshot) -> Result<bool, BackupError> {
        let ok = self.check_artifact(snapshot).await?;
        snapshot.integrity = if ok {
            Integrity::Verified
        } else {
            Integrity::Corrupt
        };

        let mut manifest = Manifest::load(&self.state_dir).map_err(BackupError::Manifest)?;
        manifest.upsert(snapshot.clone());
        manifest.save().map_err(BackupError::Manifest)?;

        Ok(ok)
    }

    async fn check_artifact(&self, snapshot: &Snapshot) -> Result<bool, BackupError> {
        let bytes = match std::fs::read(&snapshot.local_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Snapshot {} unreadable: {}", snapshot.id, e);
                return Ok(false);
            }
        };

        if hex::encode(Sha256::digest(&bytes)) != snapshot.checksum {
            return Ok(false);
        }

        if snapshot.kind == SnapshotKind::Database {
            let restorable = self
                .database
                .verify_dump(&bytes)
                .await
                .map_err(|source| BackupError::SourceUnreachable {
                    kind: snapshot.kind,
                    source,
                })?;
            return Ok(restorable);
        }

        Ok(true)
    }

    /// Read back the artifact bytes for a restore.
    pub fn read_artifact(&self, snapshot: &Snapshot) -> Result<Vec<u8>, BackupError> {
        Ok(std::fs::read(&snapshot.local_path)?)
    }

    /// Drop snapshots older than the retention period, artifacts included.
    pub fn prune(&self, retention_days: i64) -> Result<Vec<String>, BackupError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut manifest = Manifest::load(&self.state_dir).map_err(BackupError::Manifest)?;

        let expired: Vec<Snapshot> = manifest
            .snapshots
            .iter()
            .filter(|s| s.created_at < cutoff)
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for snapshot in expired {
            if snapshot.local_path.exists() {
                std::fs::remove_file(&snapshot.local_path)?;
            }
            manifest.remove(&snapshot.id);
            removed.push(snapshot.id);
        }
        manifest.save().map_err(BackupError::Manifest)?;

        if !removed.is_empty() {
            info!("Pruned {} expired snapshot(s)", removed.len());
        }
        Ok(removed)
    }
}
