use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::backup::manifest::Manifest;
use crate::backup::BackupManager;
use crate::config::Config;
use crate::deploy::context::Collaborators;
use crate::output;

/// Re-verify every retained snapshot. Exit 0 only when all of them pass;
/// the report names each corrupt snapshot.
pub async fn run(config: Config) -> Result<ExitCode> {
    let state_dir = PathBuf::from(&config.deploy.state_dir);

    // Dump verification only needs the tools, not a live target, so any
    // configured environment's collaborators will do.
    let env = config
        .environments
        .values()
        .next()
        .context("No environments configured")?
        .clone();
    let collab = Collaborators::production(&config.app.name, &env, &state_dir);
    let manager = BackupManager::new(
        collab.database,
        collab.media,
        collab.object_store,
        state_dir.clone(),
    );

    output::header("Verifying retained snapshots");

    let pruned = manager.prune(config.deploy.retention_days)?;
    for id in &pruned {
        output::info(&format!("Pruned expired snapshot {}", id));
    }

    let manifest = Manifest::load(&state_dir)?;
    if manifest.snapshots.is_empty() {
        output::warning("No snapshots on record");
        return Ok(ExitCode::SUCCESS);
    }

    let mut corrupt = Vec::new();
    for mut snapshot in manifest.snapshots {
        if manager.verify_snapshot(&mut snapshot).await? {
            output::success(&format!(
                "{} verified ({} bytes)",
                snapshot.id, snapshot.size_bytes
            ));
        } else {
            output::error(&format!("{} is corrupt", snapshot.id));
            corrupt.push(snapshot.id);
        }
    }

    if corrupt.is_empty() {
        output::success("All snapshots verified");
        Ok(ExitCode::SUCCESS)
    } else {
        output::error(&format!(
            "{} corrupt snapshot(s): {}",
            corrupt.len(),
            corrupt.join(", ")
        ));
        Ok(ExitCode::FAILURE)
    }
}
