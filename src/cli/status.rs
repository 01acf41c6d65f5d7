use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::config::Config;
use crate::deploy::attempt::DeploymentAttempt;
use crate::deploy::journal::Journal;
use crate::output;

/// Show the journaled history of the last attempt for an environment.
pub fn run(config: Config, environment: &str) -> Result<ExitCode> {
    // Fails fast on a typo'd environment name.
    config.environment(environment)?;
    let state_dir = PathBuf::from(&config.deploy.state_dir);

    let journal = Journal::open(&state_dir)?;
    let entries = match journal.last_attempt(environment)? {
        Some(entries) => entries,
        None => {
            output::info(&format!("No deployment attempts recorded for {}", environment));
            return Ok(ExitCode::SUCCESS);
        }
    };

    output::header(&format!(
        "Last attempt on {}: {}",
        environment, entries[0].attempt_id
    ));
    for entry in &entries {
        match &entry.note {
            Some(note) => println!(
                "  {}  {} ({})",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.phase,
                note
            ),
            None => println!(
                "  {}  {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.phase
            ),
        }
    }

    // The persisted record carries detail the journal does not: snapshots,
    // migration step states, the recorded failure.
    if let Ok(attempt) = DeploymentAttempt::load(&state_dir, &entries[0].attempt_id) {
        println!();
        super::deploy::report(&attempt);
    }

    Ok(ExitCode::SUCCESS)
}
