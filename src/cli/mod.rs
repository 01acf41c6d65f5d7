use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod deploy;
pub mod rollback;
pub mod status;
pub mod verify;

#[derive(Parser)]
#[command(
    name = "cutover",
    version,
    about = "Guarded deploys with automatic rollback"
)]
pub struct Cli {
    /// Path to cutover.toml
    #[arg(short, long, default_value = "cutover.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one deployment attempt: backup, build, migrate, cutover, monitor
    Deploy {
        /// Target environment
        #[arg(short, long)]
        env: String,
        /// Validate and print the plan without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Skip snapshot creation (rollback will have no backup)
        #[arg(long)]
        skip_backup: bool,
        /// Pre-acknowledge data loss if an automatic rollback lands
        /// outside the safety window
        #[arg(long)]
        force_rollback: bool,
    },

    /// Roll back the last deployment attempt
    Rollback {
        /// Target environment
        #[arg(short, long)]
        env: String,
        /// Acknowledge data loss when the safety window has expired
        #[arg(long)]
        force: bool,
    },

    /// Re-verify every retained snapshot in the backup manifest
    VerifyBackups,

    /// Show the last deployment attempt for an environment
    Status {
        /// Target environment
        #[arg(short, long)]
        env: String,
    },
}
