//! Production collaborator implementations backed by the standard operator
//! tools: docker, pg_dump/pg_restore/psql, tar, and the aws CLI.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    ContainerHandle, ContainerRuntime, DatabaseAdmin, ImageHandle, MediaStore, ObjectStore,
    SchemaStore,
};

async fn run(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    debug!("exec: {} {}", program, args.join(" "));
    let out = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }
    Ok(out.stdout)
}

async fn run_text(program: &str, args: &[&str]) -> Result<String> {
    let out = run(program, args).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

async fn run_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
    debug!("exec (piped): {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let mut stdin = child.stdin.take().context("Failed to open stdin")?;
    stdin.write_all(input).await?;
    drop(stdin);

    let out = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed to wait for {}", program))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }
    Ok(out.stdout)
}

/// Docker-backed runtime. Traffic cutover works through a stable DNS alias
/// on the edge network: the reverse proxy resolves the alias, so promoting
/// a container means attaching it under that alias.
pub struct DockerRuntime {
    pub label: String,
    pub network: String,
    pub live_alias: String,
    pub cache_clear_cmd: Option<String>,
}

impl DockerRuntime {
    pub fn new(label: String, app_name: &str, cache_clear_cmd: Option<String>) -> Self {
        Self {
            label,
            network: "edge".to_string(),
            live_alias: app_name.to_string(),
            cache_clear_cmd,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build(&self, artifact: &str) -> Result<ImageHandle> {
        run("docker", &["pull", artifact])
            .await
            .with_context(|| format!("Failed to pull image {}", artifact))?;
        Ok(ImageHandle {
            reference: artifact.to_string(),
        })
    }

    async fn start(&self, image: &ImageHandle) -> Result<ContainerHandle> {
        let id = run_text(
            "docker",
            &["run", "-d", "--label", &self.label, &image.reference],
        )
        .await
        .context("Failed to start container")?;
        Ok(ContainerHandle {
            id,
            image: image.reference.clone(),
        })
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<()> {
        run("docker", &["stop", &container.id]).await?;
        Ok(())
    }

    async fn find(&self, label: &str) -> Result<Option<ContainerHandle>> {
        let filter = format!("label={}", label);
        let out = run_text(
            "docker",
            &["ps", "--filter", &filter, "--format", "{{.ID}} {{.Image}}"],
        )
        .await?;

        Ok(out.lines().next().and_then(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?.to_string();
            let image = parts.next()?.to_string();
            Some(ContainerHandle { id, image })
        }))
    }

    async fn promote(&self, container: &ContainerHandle) -> Result<()> {
        run(
            "docker",
            &[
                "network",
                "connect",
                "--alias",
                &self.live_alias,
                &self.network,
                &container.id,
            ],
        )
        .await
        .context("Failed to attach container to edge network")?;
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        if let Some(cmd) = &self.cache_clear_cmd {
            run("sh", &["-c", cmd]).await?;
        }
        Ok(())
    }
}

/// PostgreSQL admin over pg_dump/pg_restore/psql.
pub struct PgAdmin {
    url: String,
    rescue_path: PathBuf,
}

impl PgAdmin {
    pub fn new(url: String, state_dir: &std::path::Path) -> Self {
        Self {
            url,
            rescue_path: state_dir.join("rescue.dump"),
        }
    }

    async fn scalar(&self, query: &str) -> Result<String> {
        run_text("psql", &[&self.url, "-t", "-A", "-c", query]).await
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn dump(&self) -> Result<Vec<u8>> {
        run("pg_dump", &["--format=custom", &self.url]).await
    }

    async fn verify_dump(&self, dump: &[u8]) -> Result<bool> {
        // Listing the archive's table of contents catches truncation and
        // format corruption without touching any live database.
        match run_with_stdin("pg_restore", &["--list"], dump).await {
            Ok(listing) => Ok(!listing.is_empty()),
            Err(e) => {
                debug!("pg_restore --list failed: {:#}", e);
                Ok(false)
            }
        }
    }

    async fn restore(&self, dump: &[u8]) -> Result<()> {
        run_with_stdin(
            "pg_restore",
            &["--clean", "--if-exists", "--dbname", &self.url],
            dump,
        )
        .await?;
        Ok(())
    }

    async fn write_activity_marker(&self) -> Result<String> {
        self.scalar(
            "SELECT COALESCE(sum(n_tup_ins + n_tup_upd + n_tup_del), 0) FROM pg_stat_user_tables",
        )
        .await
    }

    async fn rows_written_since(&self, marker: &str) -> Result<u64> {
        let now: u64 = self
            .write_activity_marker()
            .await?
            .parse()
            .context("Unexpected pg_stat output")?;
        let then: u64 = marker.parse().context("Malformed activity marker")?;
        Ok(now.saturating_sub(then))
    }

    async fn archive_recent_writes(&self) -> Result<u64> {
        let dump = run("pg_dump", &["--data-only", "--format=custom", &self.url]).await?;
        let size = dump.len() as u64;
        tokio::fs::write(&self.rescue_path, dump)
            .await
            .context("Failed to write rescue archive")?;
        Ok(size)
    }

    async fn restore_archived_writes(&self) -> Result<()> {
        let dump = tokio::fs::read(&self.rescue_path)
            .await
            .context("Rescue archive not found")?;
        run_with_stdin(
            "pg_restore",
            &["--data-only", "--dbname", &self.url],
            &dump,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SchemaStore for PgAdmin {
    async fn execute(&self, action: &str) -> Result<()> {
        run(
            "psql",
            &[&self.url, "-v", "ON_ERROR_STOP=1", "-c", action],
        )
        .await?;
        Ok(())
    }

    async fn probe(&self, query: &str) -> Result<bool> {
        let out = self.scalar(query).await?;
        Ok(!out.is_empty())
    }

    async fn count(&self, query: &str) -> Result<u64> {
        let out = self.scalar(query).await?;
        out.parse().context("Count query did not return a number")
    }
}

/// Media volume archived as a gzipped tarball.
pub struct TarMediaStore {
    pub path: String,
}

#[async_trait]
impl MediaStore for TarMediaStore {
    async fn archive(&self) -> Result<Vec<u8>> {
        run("tar", &["-C", &self.path, "-czf", "-", "."]).await
    }

    async fn restore(&self, archive: &[u8]) -> Result<()> {
        run_with_stdin("tar", &["-C", &self.path, "-xzf", "-"], archive).await?;
        Ok(())
    }
}

/// S3 object store via the aws CLI, streaming through stdin.
pub struct S3ObjectStore {
    pub bucket: String,
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let uri = format!("s3://{}/{}", self.bucket, key);
        run_with_stdin("aws", &["s3", "cp", "-", &uri], bytes)
            .await
            .with_context(|| format!("Failed to upload {}", uri))?;
        Ok(uri)
    }
}
