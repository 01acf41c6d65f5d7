use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupManager;
use crate::config::{Config, EnvironmentConfig};
use crate::health::{HealthEndpoint, HealthPolicy, HealthProber, HttpEndpoint};
use crate::infra::shell::{DockerRuntime, PgAdmin, S3ObjectStore, TarMediaStore};
use crate::infra::{ContainerRuntime, DatabaseAdmin, MediaStore, ObjectStore, SchemaStore};
use crate::migrate::{MigrationExecutor, MigrationStep};

/// Handles to every external system the orchestrator touches.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub database: Arc<dyn DatabaseAdmin>,
    pub schema: Arc<dyn SchemaStore>,
    pub media: Arc<dyn MediaStore>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub endpoint: Arc<dyn HealthEndpoint>,
}

impl Collaborators {
    /// Wire up the real tools for an environment.
    pub fn production(app_name: &str, env: &EnvironmentConfig, state_dir: &std::path::Path) -> Self {
        let pg = Arc::new(PgAdmin::new(env.database_url.clone(), state_dir));
        Self {
            runtime: Arc::new(DockerRuntime::new(
                env.container_label.clone(),
                app_name,
                env.cache_clear_cmd.clone(),
            )),
            database: pg.clone(),
            schema: pg,
            media: Arc::new(TarMediaStore {
                path: env.media_path.clone(),
            }),
            object_store: env
                .snapshot_bucket
                .as_ref()
                .map(|bucket| {
                    Arc::new(S3ObjectStore {
                        bucket: bucket.clone(),
                    }) as Arc<dyn ObjectStore>
                }),
            endpoint: Arc::new(HttpEndpoint::new(env.health_url.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployFlags {
    pub dry_run: bool,
    pub skip_backup: bool,
    pub force_rollback: bool,
}

pub struct DeployContext {
    pub config: Config,
    pub environment: String,
    pub env: EnvironmentConfig,
    pub flags: DeployFlags,
    pub collab: Collaborators,
    /// Operator cancellation (ctrl-c). Honored between phases.
    pub cancel: Arc<AtomicBool>,
}

impl DeployContext {
    pub fn new(
        config: Config,
        environment: String,
        env: EnvironmentConfig,
        flags: DeployFlags,
        collab: Collaborators,
    ) -> Self {
        Self {
            config,
            environment,
            env,
            flags,
            collab,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.deploy.state_dir)
    }

    pub fn backup_manager(&self) -> BackupManager {
        BackupManager::new(
            self.collab.database.clone(),
            self.collab.media.clone(),
            self.collab.object_store.clone(),
            self.state_dir(),
        )
    }

    pub fn prober(&self) -> HealthProber {
        HealthProber::new(
            self.collab.endpoint.clone(),
            HealthPolicy {
                error_threshold: self.config.deploy.error_threshold,
                max_consecutive_failures: self.config.deploy.max_consecutive_failures,
            },
            self.config.deploy.probe_retries,
            Duration::from_secs(self.config.deploy.probe_interval_secs),
        )
    }

    pub fn executor(&self) -> MigrationExecutor {
        MigrationExecutor::new(self.collab.schema.clone())
    }

    pub fn migration_steps(&self) -> Vec<MigrationStep> {
        self.config
            .migrations
            .iter()
            .map(MigrationStep::from_spec)
            .collect()
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::SeqCst)
    }
}
