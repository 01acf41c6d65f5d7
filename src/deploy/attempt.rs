use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::phase::Phase;
use super::DeployError;
use crate::backup::Snapshot;
use crate::health::HealthSample;
use crate::infra::ContainerHandle;
use crate::migrate::MigrationStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Succeeded,
    RolledBack,
    FailedUnrecoverable,
    /// Aborted before anything was mutated; the machine went back to Idle.
    Aborted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::RolledBack => "rolled-back",
            Outcome::FailedUnrecoverable => "failed-unrecoverable",
            Outcome::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One end-to-end orchestration run. Owns its snapshots and migration
/// steps; health samples are kept only for the monitoring window and are
/// not persisted.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub outcome: Option<Outcome>,
    pub failure: Option<String>,
    pub snapshots: Vec<Snapshot>,
    pub steps: Vec<MigrationStep>,
    pub cutover_at: Option<DateTime<Utc>>,
    pub write_marker: Option<String>,
    pub new_container: Option<ContainerHandle>,
    pub prior_container: Option<ContainerHandle>,
    #[serde(skip)]
    pub samples: Vec<HealthSample>,
}

impl DeploymentAttempt {
    pub fn new(environment: &str) -> Self {
        Self {
            id: Local::now().format("%Y%m%d-%H%M%S").to_string(),
            environment: environment.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            phase: Phase::Idle,
            outcome: None,
            failure: None,
            snapshots: Vec::new(),
            steps: Vec::new(),
            cutover_at: None,
            write_marker: None,
            new_container: None,
            prior_container: None,
            samples: Vec::new(),
        }
    }

    /// Move to the next phase, refusing anything the transition table
    /// does not admit.
    pub fn advance(&mut self, next: Phase) -> Result<(), DeployError> {
        if !self.phase.can_transition(next) {
            return Err(DeployError::PhaseOrder {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    fn file_path(state_dir: &Path, id: &str) -> PathBuf {
        state_dir.join("attempts").join(format!("{}.json", id))
    }

    /// Persist to `<state_dir>/attempts/<id>.json` so a manual `rollback`
    /// after a restart can see what this attempt did.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::file_path(state_dir, &self.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(state_dir: &Path, id: &str) -> Result<Self> {
        let path = Self::file_path(state_dir, id);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("No attempt record at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed attempt record at {}", path.display()))
    }
}
