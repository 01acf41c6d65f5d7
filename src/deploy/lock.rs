//! Lease lock enforcing one active attempt per environment.
//!
//! The lock is a file created with `create_new` under the state directory,
//! held from `Idle -> BackingUp` until a terminal phase. It is deliberately
//! not released on drop: a crashed orchestrator leaves the lease behind for
//! the operator (and `reconcile`) to see.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::DeployError;

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployLock {
    pub environment: String,
    pub attempt_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl DeployLock {
    fn path(state_dir: &Path, environment: &str) -> PathBuf {
        state_dir.join(format!("{}.lock", environment))
    }

    /// Acquire the lease or fail fast with `AlreadyInProgress`.
    pub fn acquire(
        state_dir: &Path,
        environment: &str,
        attempt_id: &str,
    ) -> Result<LockGuard, DeployError> {
        std::fs::create_dir_all(state_dir).map_err(|e| DeployError::State(e.into()))?;
        let path = Self::path(state_dir, environment);

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::read(state_dir, environment).ok().flatten();
                return Err(DeployError::AlreadyInProgress {
                    environment: environment.to_string(),
                    holder: holder.map(|l| format!(
                        "attempt {} (pid {}{})",
                        l.attempt_id,
                        l.pid,
                        if l.holder_alive() { "" } else { ", no longer running" }
                    )),
                });
            }
            Err(e) => return Err(DeployError::State(e.into())),
        };

        let lock = DeployLock {
            environment: environment.to_string(),
            attempt_id: attempt_id.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&lock).map_err(|e| DeployError::State(e.into()))?;
        file.write_all(content.as_bytes())
            .map_err(|e| DeployError::State(e.into()))?;

        Ok(LockGuard { path })
    }

    pub fn read(state_dir: &Path, environment: &str) -> Result<Option<Self>> {
        let path = Self::path(state_dir, environment);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&content).with_context(|| {
            format!("Malformed lock file {}", path.display())
        })?))
    }

    /// Best-effort liveness check on the holding process.
    pub fn holder_alive(&self) -> bool {
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Release the lease. Called exactly once, at a terminal phase.
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove lock {}", self.path.display()))
    }
}
