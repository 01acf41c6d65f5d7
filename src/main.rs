mod backup;
mod cli;
mod config;
mod deploy;
mod health;
mod infra;
mod migrate;
mod notify;
mod output;
mod rollback;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::Config;
use deploy::context::DeployFlags;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    let config = Config::load(&cli.config)?;

    let code = match cli.command {
        Command::Deploy {
            env,
            dry_run,
            skip_backup,
            force_rollback,
        } => {
            let flags = DeployFlags {
                dry_run,
                skip_backup,
                force_rollback,
            };
            cli::deploy::run(config, &env, flags).await?
        }

        Command::Rollback { env, force } => cli::rollback::run(config, &env, force).await?,

        Command::VerifyBackups => cli::verify::run(config).await?,

        Command::Status { env } => cli::status::run(config, &env)?,
    };

    Ok(code)
}
