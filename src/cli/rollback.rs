use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::Config;
use crate::deploy::attempt::{DeploymentAttempt, Outcome};
use crate::deploy::context::{Collaborators, DeployContext, DeployFlags};
use crate::deploy::journal::Journal;
use crate::deploy::lock::DeployLock;
use crate::deploy::phase::Phase;
use crate::output;
use crate::rollback::RollbackController;

/// Operator-initiated rollback of the last journaled attempt.
pub async fn run(config: Config, environment: &str, force: bool) -> Result<ExitCode> {
    let env = config.environment(environment)?.clone();
    let state_dir = PathBuf::from(&config.deploy.state_dir);
    let collab = Collaborators::production(&config.app.name, &env, &state_dir);
    execute(config, environment, force, collab).await
}

pub(crate) async fn execute(
    config: Config,
    environment: &str,
    force: bool,
    collab: Collaborators,
) -> Result<ExitCode> {
    let env = config.environment(environment)?.clone();
    let state_dir = PathBuf::from(&config.deploy.state_dir);

    let journal = Journal::open(&state_dir)?;
    let entries = journal
        .last_attempt(environment)?
        .context("No deployment attempt on record for this environment")?;
    let attempt_id = entries[0].attempt_id.clone();

    let mut attempt = DeploymentAttempt::load(&state_dir, &attempt_id)
        .with_context(|| format!("Attempt {} has no persisted record", attempt_id))?;

    if attempt.phase == Phase::RolledBack {
        bail!("Attempt {} is already rolled back", attempt_id);
    }

    output::header(&format!(
        "Rolling back attempt {} on {}",
        attempt_id, environment
    ));

    let ctx = DeployContext::new(
        config,
        environment.to_string(),
        env,
        DeployFlags::default(),
        collab,
    );

    // Same lease as a deploy: no concurrent orchestration run may touch
    // this environment while we reverse it.
    let guard = DeployLock::acquire(&state_dir, environment, &attempt.id)
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let controller = RollbackController::from_ctx(&ctx);

    // A refusal is not a rollback failure: nothing has run yet, so the
    // persisted record stays exactly as it was. The operator re-runs with
    // --force to accept the data loss.
    if let Err(e) = controller.check_safety_window(&attempt, force).await {
        output::error(&format!("{}", e));
        guard.release()?;
        return Ok(ExitCode::FAILURE);
    }

    // Manual invocation sits outside the attempt's own transition table
    // (the attempt may already be terminal); the journal still records it.
    attempt.phase = Phase::RollingBack;
    journal.record_note(
        &attempt.id,
        environment,
        Phase::RollingBack,
        Some("manual rollback".to_string()),
    )?;

    // The window was already checked above; the steps run unguarded.
    let code = match controller.rollback(&mut attempt, true).await {
        Ok(()) => {
            attempt.phase = Phase::RolledBack;
            attempt.finish(Outcome::RolledBack);
            journal.record(&attempt.id, environment, Phase::RolledBack)?;
            output::success(&format!("Rolled back attempt {}", attempt.id));
            ExitCode::SUCCESS
        }
        Err(e) => {
            let detail = format!("{}", e);
            attempt.phase = Phase::RollbackFailed;
            attempt.failure = Some(detail.clone());
            attempt.finish(Outcome::FailedUnrecoverable);
            journal.record_note(&attempt.id, environment, Phase::RollbackFailed, Some(detail))?;
            output::error(&format!("{}", e));
            output::error("Manual operator intervention required");
            ExitCode::FAILURE
        }
    };

    attempt.save(&state_dir)?;
    guard.release()?;
    Ok(code)
}
