//! The deployment coordinator: one guarded pipeline per attempt,
//! backup -> build -> migrate -> cutover -> monitor, with automatic
//! rollback from any phase that has already mutated something.

pub mod attempt;
pub mod context;
pub mod journal;
pub mod lock;
pub mod phase;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::info;

use crate::backup::{BackupError, BackupManager, SnapshotKind};
use crate::health::{classify, HealthProber, HealthStatus};
use crate::migrate::MigrationError;
use crate::notify::Notifier;
use crate::output;
use crate::rollback::RollbackController;

use attempt::{DeploymentAttempt, Outcome};
use context::DeployContext;
use journal::Journal;
use lock::{DeployLock, LockGuard};
use phase::Phase;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("A deployment is already in progress for '{environment}'{}",
        .holder.as_ref().map(|h| format!(" (held by {})", h)).unwrap_or_default())]
    AlreadyInProgress {
        environment: String,
        holder: Option<String>,
    },

    #[error("Illegal phase transition: {from} -> {to}")]
    PhaseOrder { from: Phase, to: Phase },

    #[error(transparent)]
    State(anyhow::Error),
}

/// Run one deployment attempt end to end. Business failures (backup
/// aborts, rollbacks) are recorded on the returned attempt; `Err` is
/// reserved for the orchestrator's own failures, lock contention included.
pub async fn run(ctx: &DeployContext) -> Result<DeploymentAttempt, DeployError> {
    output::header(&format!(
        "Deploying {} to {}",
        ctx.config.app.name, ctx.environment
    ));

    let state_dir = ctx.state_dir();
    let journal = Journal::open(&state_dir).map_err(DeployError::State)?;

    if let Some(id) = journal.reconcile(&ctx.environment).map_err(DeployError::State)? {
        output::warning(&format!(
            "Previous attempt {} never reached a terminal phase; recorded as abandoned",
            id
        ));
    }

    let mut attempt = DeploymentAttempt::new(&ctx.environment);

    if ctx.flags.dry_run {
        print_plan(ctx, &attempt);
        attempt.finish(Outcome::Succeeded);
        return Ok(attempt);
    }

    let guard = DeployLock::acquire(&state_dir, &ctx.environment, &attempt.id)?;

    run_phases(ctx, &mut attempt, &journal).await?;

    attempt.save(&state_dir).map_err(DeployError::State)?;
    release(guard);

    Notifier::new(ctx.env.webhook_url.clone())
        .notify(&attempt)
        .await;

    Ok(attempt)
}

fn release(guard: LockGuard) {
    if let Err(e) = guard.release() {
        output::warning(&format!("Could not release deployment lock: {:#}", e));
    }
}

async fn run_phases(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    journal: &Journal,
) -> Result<(), DeployError> {
    let prober = ctx.prober();

    // Phase: backing up. Failures abort cleanly, nothing is mutated yet.
    transition(ctx, attempt, journal, Phase::BackingUp, None)?;
    if ctx.flags.skip_backup {
        output::warning("Skipping backup (--skip-backup): rollback will have no snapshot");
    } else if let Err(e) = backup_phase(&ctx.backup_manager(), attempt).await {
        return abort(ctx, attempt, journal, format!("Backup failed: {:#}", e));
    }
    if ctx.cancelled() {
        return abort(ctx, attempt, journal, "Cancelled by operator".to_string());
    }

    // Phase: building.
    transition(ctx, attempt, journal, Phase::Building, None)?;
    let image = match ctx.collab.runtime.build(&ctx.env.artifact).await {
        Ok(image) => image,
        Err(e) => return abort(ctx, attempt, journal, format!("Build failed: {:#}", e)),
    };
    output::success(&format!("Artifact ready: {}", image.reference));
    if ctx.cancelled() {
        return abort(ctx, attempt, journal, "Cancelled by operator".to_string());
    }

    // Phase: migrating. From here on, failure means rollback.
    transition(ctx, attempt, journal, Phase::Migrating, None)?;
    attempt.steps = ctx.migration_steps();
    if let Err(e) = ctx.executor().apply(&mut attempt.steps).await {
        let reason = format!("Migration failed: {:#}", e);
        if let MigrationError::ReversalFailed { .. } = e {
            // The in-call unwind itself failed: schema state is unknown,
            // no automatic rollback can be trusted.
            transition(ctx, attempt, journal, Phase::RollingBack, Some(reason.clone()))?;
            transition(ctx, attempt, journal, Phase::RollbackFailed, Some(reason.clone()))?;
            attempt.failure = Some(reason);
            attempt.finish(Outcome::FailedUnrecoverable);
            return Ok(());
        }
        return roll_back(ctx, attempt, journal, reason).await;
    }
    output::success(&format!("{} migration step(s) applied", attempt.steps.len()));
    if ctx.cancelled() {
        // Too late to abort in place: cancellation now rides the same
        // rollback path as a failure.
        return roll_back(ctx, attempt, journal, "Cancelled by operator".to_string()).await;
    }

    // Phase: cutting over.
    transition(ctx, attempt, journal, Phase::CuttingOver, None)?;
    if let Err(e) = cutover_phase(ctx, attempt, &image).await {
        return roll_back(ctx, attempt, journal, format!("Cutover failed: {:#}", e)).await;
    }
    output::success("Traffic switched to the new version");

    // Phase: monitoring.
    transition(ctx, attempt, journal, Phase::Monitoring, None)?;
    if let Some(reason) = monitor_phase(ctx, attempt, &prober).await {
        return roll_back(ctx, attempt, journal, reason).await;
    }

    transition(ctx, attempt, journal, Phase::Succeeded, None)?;
    attempt.finish(Outcome::Succeeded);
    output::success(&format!("Deploy complete: attempt {} is live", attempt.id));
    Ok(())
}

async fn backup_phase(
    manager: &BackupManager,
    attempt: &mut DeploymentAttempt,
) -> Result<(), BackupError> {
    for kind in [SnapshotKind::Database, SnapshotKind::Media] {
        let mut snapshot = manager.create_snapshot(kind).await?;
        if !manager.verify_snapshot(&mut snapshot).await? {
            return Err(BackupError::IntegrityCheckFailed {
                id: snapshot.id.clone(),
            });
        }
        output::success(&format!("Snapshot {} verified", snapshot.id));
        attempt.snapshots.push(snapshot);
    }
    Ok(())
}

async fn cutover_phase(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    image: &crate::infra::ImageHandle,
) -> anyhow::Result<()> {
    attempt.prior_container = ctx.collab.runtime.find(&ctx.env.container_label).await?;

    let new = ctx.collab.runtime.start(image).await?;
    ctx.collab.runtime.promote(&new).await?;
    attempt.new_container = Some(new);
    attempt.cutover_at = Some(Utc::now());
    attempt.write_marker = Some(ctx.collab.database.write_activity_marker().await?);

    if let Some(prior) = attempt.prior_container.clone() {
        ctx.collab.runtime.stop(&prior).await?;
    }
    Ok(())
}

/// Observe the new version for the configured window. Returns the reason
/// to roll back, or None when the window closes clean.
async fn monitor_phase(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    prober: &HealthProber,
) -> Option<String> {
    let window = Duration::from_secs(ctx.config.deploy.monitor_window_secs);
    let interval = Duration::from_secs(ctx.config.deploy.sample_interval_secs);
    let deadline = Instant::now() + window;

    let spinner = output::monitor_spinner(window.as_secs(), interval.as_secs());

    loop {
        let sample = prober.sample().await;
        attempt.samples.push(sample);

        if classify(&attempt.samples, prober.policy()) == HealthStatus::Failed {
            spinner.finish_and_clear();
            let errors: u32 = attempt.samples.iter().map(|s| s.error_count).sum();
            return Some(format!(
                "Health classified Failed during monitoring ({} error(s) in {} sample(s))",
                errors,
                attempt.samples.len()
            ));
        }
        if ctx.cancelled() {
            spinner.finish_and_clear();
            return Some("Cancelled by operator".to_string());
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    spinner.finish_and_clear();
    let errors: u32 = attempt.samples.iter().map(|s| s.error_count).sum();
    if errors > 0 {
        output::warning(&format!(
            "Monitoring window closed degraded ({} error(s), below threshold)",
            errors
        ));
    } else {
        output::success("Monitoring window closed healthy");
    }
    None
}

/// Abort before anything was mutated: back to Idle, lock released by the
/// caller, outcome Aborted.
fn abort(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    journal: &Journal,
    reason: String,
) -> Result<(), DeployError> {
    output::error(&reason);
    transition(ctx, attempt, journal, Phase::Idle, Some(reason.clone()))?;
    attempt.failure = Some(reason);
    attempt.finish(Outcome::Aborted);
    Ok(())
}

async fn roll_back(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    journal: &Journal,
    reason: String,
) -> Result<(), DeployError> {
    output::warning(&format!("{}, rolling back", reason));
    attempt.failure = Some(reason.clone());
    transition(ctx, attempt, journal, Phase::RollingBack, Some(reason))?;

    let controller = RollbackController::from_ctx(ctx);
    match controller.rollback(attempt, ctx.flags.force_rollback).await {
        Ok(()) => {
            transition(ctx, attempt, journal, Phase::RolledBack, None)?;
            attempt.finish(Outcome::RolledBack);
            output::success("Rollback complete: prior version restored and healthy");
        }
        Err(e) => {
            let detail = format!("{}", e);
            output::error(&detail);
            transition(ctx, attempt, journal, Phase::RollbackFailed, Some(detail.clone()))?;
            attempt.failure = Some(detail);
            attempt.finish(Outcome::FailedUnrecoverable);
            output::error("Rollback failed: manual operator intervention required");
        }
    }
    Ok(())
}

fn transition(
    ctx: &DeployContext,
    attempt: &mut DeploymentAttempt,
    journal: &Journal,
    next: Phase,
    note: Option<String>,
) -> Result<(), DeployError> {
    attempt.advance(next)?;
    output::phase(next, note.as_deref().unwrap_or(""));
    journal
        .record_note(&attempt.id, &attempt.environment, next, note)
        .map_err(DeployError::State)?;
    attempt.save(&ctx.state_dir()).map_err(DeployError::State)?;
    info!("Attempt {} entered phase {}", attempt.id, next);
    Ok(())
}

fn print_plan(ctx: &DeployContext, attempt: &DeploymentAttempt) {
    output::info(&format!("Dry run for attempt {}: nothing will change", attempt.id));
    output::info(&format!(
        "Phases: backing-up -> building -> migrating -> cutting-over -> monitoring ({}s window)",
        ctx.config.deploy.monitor_window_secs
    ));
    let steps = ctx.migration_steps();
    if steps.is_empty() {
        output::info("No migrations declared");
    } else {
        for step in &steps {
            output::info(&format!("Would apply migration {}", step.id));
        }
    }
    output::info(&format!("Artifact: {}", ctx.env.artifact));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Config, DeployConfig, EnvironmentConfig, MigrationSpec};
    use crate::deploy::context::{Collaborators, DeployFlags};
    use crate::infra::fake::{FakeDatabase, FakeMedia, FakeRuntime, FakeSchema, ScriptedEndpoint};
    use crate::infra::SchemaStore;
    use crate::migrate::StepState;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Fixture {
        ctx: DeployContext,
        runtime: Arc<FakeRuntime>,
        database: Arc<FakeDatabase>,
        schema: Arc<FakeSchema>,
        endpoint: Arc<ScriptedEndpoint>,
        _state: tempfile::TempDir,
    }

    fn migration(id: &str) -> MigrationSpec {
        MigrationSpec {
            id: id.to_string(),
            kind: "schema".to_string(),
            forward: format!("APPLY {}", id),
            reverse: format!("REVERT {}", id),
            shadow_read: None,
            count_rows: None,
        }
    }

    fn fixture(migrations: Vec<MigrationSpec>) -> Fixture {
        let state = tempfile::tempdir().unwrap();

        let env = EnvironmentConfig {
            health_url: "http://localhost:0/health".to_string(),
            database_url: "postgres://localhost/test".to_string(),
            media_path: "/tmp/media".to_string(),
            container_label: "role=web".to_string(),
            artifact: "portal:new".to_string(),
            webhook_url: None,
            snapshot_bucket: None,
            cache_clear_cmd: None,
        };
        let mut environments = HashMap::new();
        environments.insert("production".to_string(), env.clone());

        let config = Config {
            app: AppConfig {
                name: "portal".to_string(),
            },
            deploy: DeployConfig {
                state_dir: state.path().to_string_lossy().into_owned(),
                monitor_window_secs: 1,
                sample_interval_secs: 0,
                error_threshold: 10,
                // High enough that only the error budget can trip in tests.
                max_consecutive_failures: 1_000,
                rollback_window_secs: 300,
                rollback_max_retries: 2,
                rollback_backoff_secs: 0,
                retention_days: 14,
                probe_retries: 20,
                probe_interval_secs: 0,
            },
            environments,
            migrations,
        };

        let runtime = Arc::new(FakeRuntime::default());
        let database = Arc::new(FakeDatabase::default());
        let schema = Arc::new(FakeSchema::default());
        let endpoint = Arc::new(ScriptedEndpoint::default());

        let collab = Collaborators {
            runtime: runtime.clone(),
            database: database.clone(),
            schema: schema.clone(),
            media: Arc::new(FakeMedia),
            object_store: None,
            endpoint: endpoint.clone(),
        };

        let ctx = DeployContext::new(
            config,
            "production".to_string(),
            env,
            DeployFlags::default(),
            collab,
        );

        Fixture {
            ctx,
            runtime,
            database,
            schema,
            endpoint,
            _state: state,
        }
    }

    fn journal_phases(ctx: &DeployContext, attempt_id: &str) -> Vec<Phase> {
        Journal::open(&ctx.state_dir())
            .unwrap()
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.attempt_id == attempt_id)
            .map(|e| e.phase)
            .collect()
    }

    #[tokio::test]
    async fn clean_deploy_walks_every_phase_in_order() {
        let f = fixture(vec![migration("0001")]);

        let attempt = run(&f.ctx).await.unwrap();

        assert_eq!(attempt.outcome, Some(Outcome::Succeeded));
        assert_eq!(attempt.phase, Phase::Succeeded);
        assert_eq!(attempt.snapshots.len(), 2);
        assert!(attempt.steps.iter().all(|s| s.state == StepState::Applied));
        assert_eq!(
            journal_phases(&f.ctx, &attempt.id),
            vec![
                Phase::BackingUp,
                Phase::Building,
                Phase::Migrating,
                Phase::CuttingOver,
                Phase::Monitoring,
                Phase::Succeeded,
            ]
        );

        // Cutover ordering: build, start new, promote new, stop prior.
        let events = f.runtime.events();
        assert_eq!(events[0], "build portal:new");
        assert!(events[1].starts_with("start portal:new"));
        assert!(events[2].starts_with("promote"));
        assert_eq!(events[3], "stop c-prior");

        // Lock released at the terminal phase: a new deploy can start.
        assert!(DeployLock::read(&f.ctx.state_dir(), "production")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn backup_failure_aborts_before_any_mutation() {
        let f = fixture(vec![migration("0001")]);
        f.database.fail_dump();

        let attempt = run(&f.ctx).await.unwrap();

        assert_eq!(attempt.outcome, Some(Outcome::Aborted));
        assert_eq!(attempt.phase, Phase::Idle);
        assert!(attempt.failure.as_deref().unwrap().contains("Backup failed"));
        // No migration was ever applied and no container was touched.
        assert!(f.schema.executed().is_empty());
        assert!(f.runtime.events().is_empty());
        assert_eq!(
            journal_phases(&f.ctx, &attempt.id),
            vec![Phase::BackingUp, Phase::Idle]
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_aborts_like_a_backup_failure() {
        let f = fixture(vec![]);
        f.database.set_dump_valid(false);

        let attempt = run(&f.ctx).await.unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Aborted));
        assert!(attempt
            .failure
            .as_deref()
            .unwrap()
            .contains("integrity check"));
    }

    #[tokio::test]
    async fn build_failure_aborts_to_idle() {
        let f = fixture(vec![migration("0001")]);
        f.runtime.fail_build();

        let attempt = run(&f.ctx).await.unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Aborted));
        assert_eq!(attempt.phase, Phase::Idle);
        assert!(f.schema.executed().is_empty());
    }

    #[tokio::test]
    async fn failing_migration_step_unwinds_and_rolls_back() {
        let f = fixture((1..=5).map(|i| migration(&format!("{:04}", i))).collect());
        f.schema.fail_on("APPLY 0003");

        let attempt = run(&f.ctx).await.unwrap();

        assert_eq!(attempt.outcome, Some(Outcome::RolledBack));
        assert_eq!(attempt.phase, Phase::RolledBack);
        // Steps 1 and 2 were applied and then reversed; 3..5 never applied.
        assert_eq!(attempt.steps[0].state, StepState::Reversed);
        assert_eq!(attempt.steps[1].state, StepState::Reversed);
        assert_eq!(attempt.steps[2].state, StepState::Pending);
        assert_eq!(attempt.steps[4].state, StepState::Pending);
        assert!(journal_phases(&f.ctx, &attempt.id).contains(&Phase::RollingBack));
        // The environment is unlocked again.
        assert!(DeployLock::read(&f.ctx.state_dir(), "production")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn error_budget_breach_during_monitoring_triggers_rollback() {
        let f = fixture(vec![migration("0001")]);
        // 15 errors against a threshold of 10; healthy afterwards so the
        // post-rollback verification can pass.
        f.endpoint.push_failures(15);

        let attempt = run(&f.ctx).await.unwrap();

        assert_eq!(attempt.outcome, Some(Outcome::RolledBack));
        assert_eq!(attempt.phase, Phase::RolledBack);
        assert!(attempt
            .failure
            .as_deref()
            .unwrap()
            .contains("Health classified Failed"));
        // The migration applied during this attempt was reversed.
        assert_eq!(attempt.steps[0].state, StepState::Reversed);
        // Prior version was restarted and promoted.
        let events = f.runtime.events();
        assert!(events.iter().any(|e| e.starts_with("start portal:previous")));
    }

    #[tokio::test]
    async fn failed_monitoring_never_reaches_succeeded_even_when_rollback_fails() {
        let f = fixture(vec![migration("0001")]);
        f.endpoint.push_failures(15);
        f.endpoint.set_default_ok(false);
        // Rollback dies trying to restart the prior container.
        f.runtime.fail_start_for("portal:previous");

        let attempt = run(&f.ctx).await.unwrap();

        assert_eq!(attempt.outcome, Some(Outcome::FailedUnrecoverable));
        assert_eq!(attempt.phase, Phase::RollbackFailed);
        // The report names the exact failed rollback step.
        assert!(attempt
            .failure
            .as_deref()
            .unwrap()
            .contains("restart-prior-version"));
        assert!(!journal_phases(&f.ctx, &attempt.id).contains(&Phase::Succeeded));
    }

    #[tokio::test]
    async fn second_start_fails_fast_while_first_holds_the_lease() {
        let f = fixture(vec![]);
        let _held = DeployLock::acquire(&f.ctx.state_dir(), "production", "other").unwrap();

        let err = run(&f.ctx).await.unwrap_err();
        assert!(matches!(err, DeployError::AlreadyInProgress { .. }));
        // Nothing ran.
        assert!(f.runtime.events().is_empty());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let mut f = fixture(vec![migration("0001")]);
        f.ctx.flags.dry_run = true;

        let attempt = run(&f.ctx).await.unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Succeeded));
        assert!(f.runtime.events().is_empty());
        assert!(f.schema.executed().is_empty());
        assert!(journal_phases(&f.ctx, &attempt.id).is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_migrations_aborts_cleanly() {
        let f = fixture(vec![migration("0001")]);
        f.ctx
            .cancel
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let attempt = run(&f.ctx).await.unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Aborted));
        assert!(f.schema.executed().is_empty());
    }

    /// Flips the cancel flag the moment a migration applies, so the
    /// cancellation lands after the abort checkpoints have passed.
    struct CancelOnMigrate {
        inner: Arc<FakeSchema>,
        cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SchemaStore for CancelOnMigrate {
        async fn execute(&self, action: &str) -> anyhow::Result<()> {
            self.cancel.store(true, Ordering::SeqCst);
            self.inner.execute(action).await
        }

        async fn probe(&self, query: &str) -> anyhow::Result<bool> {
            self.inner.probe(query).await
        }

        async fn count(&self, query: &str) -> anyhow::Result<u64> {
            self.inner.count(query).await
        }
    }

    #[tokio::test]
    async fn cancellation_after_migrations_redirects_to_rollback() {
        let mut f = fixture(vec![migration("0001")]);
        f.ctx.collab.schema = Arc::new(CancelOnMigrate {
            inner: f.schema.clone(),
            cancel: f.ctx.cancel.clone(),
        });

        let attempt = run(&f.ctx).await.unwrap();

        // No abort in place once migrations ran: the attempt rides the
        // rollback path and ends RolledBack.
        assert_eq!(attempt.outcome, Some(Outcome::RolledBack));
        assert_eq!(attempt.phase, Phase::RolledBack);
        assert!(attempt.failure.as_deref().unwrap().contains("Cancelled"));
        assert_eq!(attempt.steps[0].state, StepState::Reversed);
        assert_eq!(f.schema.executed(), vec!["APPLY 0001", "REVERT 0001"]);

        // Cutover never happened.
        assert!(!f.runtime.events().iter().any(|e| e.starts_with("start")));
        assert!(journal_phases(&f.ctx, &attempt.id).contains(&Phase::RollingBack));
    }

    #[tokio::test]
    async fn interrupted_attempt_is_reported_abandoned_on_next_start() {
        let f = fixture(vec![]);
        {
            let journal = Journal::open(&f.ctx.state_dir()).unwrap();
            journal.record("dead", "production", Phase::Migrating).unwrap();
        }

        let attempt = run(&f.ctx).await.unwrap();
        assert_eq!(attempt.outcome, Some(Outcome::Succeeded));

        let journal = Journal::open(&f.ctx.state_dir()).unwrap();
        let abandoned = journal
            .entries()
            .unwrap()
            .into_iter()
            .find(|e| e.attempt_id == "dead" && e.note.as_deref() == Some("abandoned"));
        assert!(abandoned.is_some());
    }
}
