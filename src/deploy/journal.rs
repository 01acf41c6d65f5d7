//! Append-only record of attempt transitions, one JSON object per line.
//!
//! The journal is the durable source of truth for "what happened": it
//! survives restarts, feeds `status`, and lets startup detect an attempt
//! that died without reaching a terminal phase.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::phase::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub attempt_id: String,
    pub environment: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create {}", state_dir.display()))?;
        Ok(Self {
            path: state_dir.join("journal.log"),
        })
    }

    pub fn record(&self, attempt_id: &str, environment: &str, phase: Phase) -> Result<()> {
        self.record_note(attempt_id, environment, phase, None)
    }

    pub fn record_note(
        &self,
        attempt_id: &str,
        environment: &str,
        phase: Phase,
        note: Option<String>,
    ) -> Result<()> {
        let entry = JournalEntry {
            at: Utc::now(),
            attempt_id: attempt_id.to_string(),
            environment: environment.to_string(),
            phase,
            note,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(line)
                .with_context(|| format!("Malformed journal line: {}", line))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// All entries for the most recent attempt in this environment.
    pub fn last_attempt(&self, environment: &str) -> Result<Option<Vec<JournalEntry>>> {
        let entries = self.entries()?;
        let last_id = match entries
            .iter()
            .rev()
            .find(|e| e.environment == environment)
            .map(|e| e.attempt_id.clone())
        {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(Some(
            entries
                .into_iter()
                .filter(|e| e.attempt_id == last_id)
                .collect(),
        ))
    }

    /// If the last attempt for this environment never closed (terminal
    /// phase, return to Idle, or explicit abandonment), journal it as
    /// abandoned and return its id.
    pub fn reconcile(&self, environment: &str) -> Result<Option<String>> {
        let entries = match self.last_attempt(environment)? {
            Some(entries) => entries,
            None => return Ok(None),
        };
        let last = match entries.last() {
            Some(last) => last.clone(),
            None => return Ok(None),
        };

        if attempt_closed(&last) {
            return Ok(None);
        }

        self.record_note(
            &last.attempt_id,
            environment,
            last.phase,
            Some("abandoned".to_string()),
        )?;
        Ok(Some(last.attempt_id))
    }
}

fn attempt_closed(entry: &JournalEntry) -> bool {
    entry.phase.is_terminal()
        || entry.phase == Phase::Idle
        || entry.note.as_deref() == Some("abandoned")
}
