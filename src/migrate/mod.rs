//! Ordered, reversible schema/data migrations with all-or-nothing `apply`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MigrationSpec;
use crate::infra::SchemaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    Schema,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Applied,
    Reversed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub kind: MigrationKind,
    pub forward: String,
    pub reverse: String,
    pub shadow_read: Option<String>,
    pub count_rows: Option<String>,
    pub state: StepState,
    pub rows_touched: u64,
}

impl MigrationStep {
    pub fn from_spec(spec: &MigrationSpec) -> Self {
        let kind = match spec.kind.as_str() {
            "data" => MigrationKind::Data,
            _ => MigrationKind::Schema,
        };
        Self {
            id: spec.id.clone(),
            kind,
            forward: spec.forward.clone(),
            reverse: spec.reverse.clone(),
            shadow_read: spec.shadow_read.clone(),
            count_rows: spec.count_rows.clone(),
            state: StepState::Pending,
            rows_touched: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration '{id}' failed to apply: {source}")]
    StepFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Migration '{id}' applied but shadow read through the new access path found nothing")]
    ShadowReadFailed { id: String },

    #[error("Reversal of migration '{id}' failed, schema state is unknown: {source}")]
    ReversalFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct MigrationExecutor {
    schema: Arc<dyn SchemaStore>,
}

impl MigrationExecutor {
    pub fn new(schema: Arc<dyn SchemaStore>) -> Self {
        Self { schema }
    }

    /// Apply steps in declared order. On the first failure every step this
    /// call already applied is reversed, in reverse order, before the error
    /// is returned.
    pub async fn apply(&self, steps: &mut [MigrationStep]) -> Result<(), MigrationError> {
        for i in 0..steps.len() {
            match self.apply_one(&mut steps[i]).await {
                Ok(()) => {}
                Err(e) => {
                    warn!("Migration '{}' failed, unwinding", steps[i].id);
                    // The failing step is included: a shadow-read failure
                    // leaves its forward action applied.
                    self.reverse(&mut steps[..=i]).await?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn apply_one(&self, step: &mut MigrationStep) -> Result<(), MigrationError> {
        debug!("Applying migration '{}'", step.id);

        self.schema
            .execute(&step.forward)
            .await
            .map_err(|source| MigrationError::StepFailed {
                id: step.id.clone(),
                source,
            })?;
        step.state = StepState::Applied;

        // A data migration is only durably applied once a read through the
        // new access path succeeds.
        if step.kind == MigrationKind::Data {
            if let Some(query) = &step.shadow_read {
                let seen =
                    self.schema
                        .probe(query)
                        .await
                        .map_err(|source| MigrationError::StepFailed {
                            id: step.id.clone(),
                            source,
                        })?;
                if !seen {
                    return Err(MigrationError::ShadowReadFailed {
                        id: step.id.clone(),
                    });
                }
            }
        }

        if let Some(query) = &step.count_rows {
            step.rows_touched = self.schema.count(query).await.unwrap_or(0);
        }

        Ok(())
    }

    /// Reverse applied steps in reverse declared order. Idempotent: a step
    /// that is Pending or already Reversed is skipped, not an error.
    pub async fn reverse(&self, steps: &mut [MigrationStep]) -> Result<(), MigrationError> {
        for step in steps.iter_mut().rev() {
            if step.state != StepState::Applied {
                debug!("Skipping reversal of '{}' (state {:?})", step.id, step.state);
                continue;
            }
            debug!("Reversing migration '{}'", step.id);
            self.schema.execute(&step.reverse).await.map_err(|source| {
                MigrationError::ReversalFailed {
                    id: step.id.clone(),
                    source,
                }
            })?;
            step.state = StepState::Reversed;
        }
        Ok(())
    }
}
