use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::deploy;
use crate::deploy::attempt::{DeploymentAttempt, Outcome};
use crate::deploy::context::{Collaborators, DeployContext, DeployFlags};
use crate::output;

pub async fn run(config: Config, environment: &str, flags: DeployFlags) -> Result<ExitCode> {
    let env = config.environment(environment)?.clone();
    let state_dir = PathBuf::from(&config.deploy.state_dir);
    let collab = Collaborators::production(&config.app.name, &env, &state_dir);
    let ctx = DeployContext::new(config, environment.to_string(), env, flags, collab);

    // First ctrl-c requests a clean cancel; the coordinator decides whether
    // that means abort or roll back.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Cancellation requested");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let attempt = deploy::run(&ctx).await?;
    report(&attempt);

    Ok(match attempt.outcome {
        Some(Outcome::Succeeded) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Structured terminal report: enough for an operator to decide whether to
/// retry, force-rollback, or intervene by hand.
pub fn report(attempt: &DeploymentAttempt) {
    output::header(&format!("Attempt {} ({})", attempt.id, attempt.environment));
    output::detail("phase reached", attempt.phase);
    if let Some(failure) = &attempt.failure {
        output::detail("failure", failure);
    }
    for snapshot in &attempt.snapshots {
        output::detail(
            "snapshot",
            format!(
                "{} ({:?}, {} bytes)",
                snapshot.id, snapshot.integrity, snapshot.size_bytes
            ),
        );
    }
    for step in &attempt.steps {
        output::detail("migration", format!("{} [{:?}]", step.id, step.state));
    }
    if let Some(outcome) = attempt.outcome {
        output::outcome(outcome);
    }
}
