//! Ordered reversal of a failed deployment. Each step retries a bounded
//! number of times; the first step to exhaust its retries fails the whole
//! rollback with an error naming it, and nothing retries past that.

use anyhow::anyhow;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::deploy::attempt::DeploymentAttempt;
use crate::deploy::context::{Collaborators, DeployContext};
use crate::health::{HealthProber, HealthStatus};
use crate::migrate::MigrationExecutor;
use crate::output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStep {
    ArchiveNewRows,
    StopNewVersion,
    ReverseMigrations,
    RestoreArchivedRows,
    RestartPriorVersion,
    ClearCaches,
    VerifyHealth,
}

impl std::fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RollbackStep::ArchiveNewRows => "archive-new-rows",
            RollbackStep::StopNewVersion => "stop-new-version",
            RollbackStep::ReverseMigrations => "reverse-migrations",
            RollbackStep::RestoreArchivedRows => "restore-archived-rows",
            RollbackStep::RestartPriorVersion => "restart-prior-version",
            RollbackStep::ClearCaches => "clear-caches",
            RollbackStep::VerifyHealth => "verify-health",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error(
        "Rollback window expired: cutover was {elapsed_secs}s ago and {rows_written} row(s) \
         were written under the new schema; re-run `rollback --force` to accept the data loss"
    )]
    SafetyWindowExpired {
        elapsed_secs: u64,
        rows_written: u64,
    },

    #[error("Rollback failed at step '{step}': {source}")]
    StepFailed {
        step: RollbackStep,
        #[source]
        source: anyhow::Error,
    },
}

pub struct RollbackController {
    collab: Collaborators,
    executor: MigrationExecutor,
    prober: HealthProber,
    max_retries: u32,
    backoff: Duration,
    safety_window: Duration,
}

impl RollbackController {
    pub fn from_ctx(ctx: &DeployContext) -> Self {
        Self {
            collab: ctx.collab.clone(),
            executor: ctx.executor(),
            prober: ctx.prober(),
            max_retries: ctx.config.deploy.rollback_max_retries,
            backoff: Duration::from_secs(ctx.config.deploy.rollback_backoff_secs),
            safety_window: Duration::from_secs(ctx.config.deploy.rollback_window_secs),
        }
    }

    pub async fn rollback(
        &self,
        attempt: &mut DeploymentAttempt,
        force: bool,
    ) -> Result<(), RollbackError> {
        self.check_safety_window(attempt, force).await?;

        let total = 7;

        output::step(1, total, "Archiving rows written under the new schema");
        if attempt.cutover_at.is_some() {
            let database = self.collab.database.clone();
            self.retry_step(RollbackStep::ArchiveNewRows, || {
                let database = database.clone();
                async move { database.archive_recent_writes().await.map(|_| ()) }
            })
            .await?;
        }

        output::step(2, total, "Stopping new-version container");
        if let Some(new) = attempt.new_container.clone() {
            let runtime = self.collab.runtime.clone();
            self.retry_step(RollbackStep::StopNewVersion, || {
                let runtime = runtime.clone();
                let new = new.clone();
                async move { runtime.stop(&new).await }
            })
            .await?;
        }

        output::step(3, total, "Reversing migrations");
        let mut tries = 0;
        loop {
            match self.executor.reverse(&mut attempt.steps).await {
                Ok(()) => break,
                Err(e) => {
                    tries += 1;
                    warn!("Migration reversal failed (try {}/{}): {}", tries, self.max_retries, e);
                    if tries >= self.max_retries {
                        return Err(RollbackError::StepFailed {
                            step: RollbackStep::ReverseMigrations,
                            source: e.into(),
                        });
                    }
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }

        output::step(4, total, "Restoring archived rows onto the old schema");
        if attempt.cutover_at.is_some() {
            let database = self.collab.database.clone();
            self.retry_step(RollbackStep::RestoreArchivedRows, || {
                let database = database.clone();
                async move { database.restore_archived_writes().await }
            })
            .await?;
        }

        output::step(5, total, "Restarting prior-version container");
        if let Some(prior) = attempt.prior_container.clone() {
            let runtime = self.collab.runtime.clone();
            let image = crate::infra::ImageHandle {
                reference: prior.image.clone(),
            };
            let restarted = self
                .retry_step(RollbackStep::RestartPriorVersion, || {
                    let runtime = runtime.clone();
                    let image = image.clone();
                    async move { runtime.start(&image).await }
                })
                .await?;
            self.retry_step(RollbackStep::RestartPriorVersion, || {
                let runtime = runtime.clone();
                let restarted = restarted.clone();
                async move { runtime.promote(&restarted).await }
            })
            .await?;
        }

        output::step(6, total, "Clearing caches");
        if let Err(e) = self.collab.runtime.clear_caches().await {
            // Best-effort: a cold cache degrades, a failed flush must not
            // sink an otherwise working rollback.
            warn!("Cache clear failed (ignored): {:#}", e);
        }

        output::step(7, total, "Verifying health after rollback");
        match self.prober.await_healthy().await {
            HealthStatus::Healthy => Ok(()),
            status => Err(RollbackError::StepFailed {
                step: RollbackStep::VerifyHealth,
                source: anyhow!("health never recovered (classified {:?})", status),
            }),
        }
    }

    /// Past the safety window with rows written under the new schema,
    /// rolling back silently would lose data: require the explicit force
    /// acknowledgment instead. A refusal fires before any step runs and
    /// mutates nothing.
    pub async fn check_safety_window(
        &self,
        attempt: &DeploymentAttempt,
        force: bool,
    ) -> Result<(), RollbackError> {
        if force {
            return Ok(());
        }
        let (cutover_at, marker) = match (&attempt.cutover_at, &attempt.write_marker) {
            (Some(c), Some(m)) => (c, m),
            _ => return Ok(()),
        };

        let elapsed = (Utc::now() - *cutover_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed <= self.safety_window {
            return Ok(());
        }

        // If the activity query itself fails, assume rows were written.
        let rows = match self.collab.database.rows_written_since(marker).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not determine write activity: {:#}", e);
                1
            }
        };
        if rows > 0 {
            return Err(RollbackError::SafetyWindowExpired {
                elapsed_secs: elapsed.as_secs(),
                rows_written: rows,
            });
        }
        Ok(())
    }

    async fn retry_step<T, F, Fut>(&self, step: RollbackStep, mut op: F) -> Result<T, RollbackError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last: Option<anyhow::Error> = None;
        for try_no in 1..=self.max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Step '{}' failed (try {}/{}): {:#}", step, try_no, self.max_retries, e);
                    last = Some(e);
                    if try_no < self.max_retries {
                        debug!("Backing off {:?} before retrying '{}'", self.backoff, step);
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(RollbackError::StepFailed {
            step,
            source: last.unwrap_or_else(|| anyhow!("no attempts were made")),
        })
    }
}
