use anyhow::{bail, Result};

use super::Config;

pub fn validate(config: &Config) -> Result<()> {
    if config.app.name.is_empty() {
        bail!("app.name cannot be empty");
    }

    if config.deploy.monitor_window_secs == 0 {
        bail!("deploy.monitor_window_secs must be greater than zero");
    }

    if config.deploy.error_threshold == 0 {
        bail!("deploy.error_threshold must be greater than zero");
    }

    if config.environments.is_empty() {
        bail!("No environments defined");
    }

    for (name, env) in &config.environments {
        if env.health_url.is_empty() {
            bail!("Environment '{}' has no health_url", name);
        }
        if env.database_url.is_empty() {
            bail!("Environment '{}' has no database_url", name);
        }
        if env.artifact.is_empty() {
            bail!("Environment '{}' has no artifact defined", name);
        }
    }

    for migration in &config.migrations {
        if migration.id.is_empty() {
            bail!("Migration with empty id");
        }
        match migration.kind.as_str() {
            "schema" | "data" => {}
            other => bail!(
                "Migration '{}' has invalid kind '{}'. Supported: schema, data",
                migration.id,
                other
            ),
        }
        if migration.forward.is_empty() || migration.reverse.is_empty() {
            bail!(
                "Migration '{}' must define both forward and reverse actions",
                migration.id
            );
        }
    }

    Ok(())
}
