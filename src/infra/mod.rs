//! Typed interfaces to the infrastructure the orchestrator drives.
//!
//! Control flow never inspects raw tool output: every external system sits
//! behind one of these traits, and production implementations (`shell`)
//! translate to the actual CLI tools the way operators would run them.

pub mod shell;

#[cfg(test)]
pub mod fake;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A built image, ready to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHandle {
    pub reference: String,
}

/// A running (or stopped) container instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build(&self, artifact: &str) -> Result<ImageHandle>;
    async fn start(&self, image: &ImageHandle) -> Result<ContainerHandle>;
    async fn stop(&self, container: &ContainerHandle) -> Result<()>;
    /// Structured lookup by label selector.
    async fn find(&self, label: &str) -> Result<Option<ContainerHandle>>;
    /// Point traffic at this container.
    async fn promote(&self, container: &ContainerHandle) -> Result<()>;
    async fn clear_caches(&self) -> Result<()>;
}

#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Full logical dump. Read-only against the source.
    async fn dump(&self) -> Result<Vec<u8>>;
    /// Restorability smoke test against a throwaway target.
    async fn verify_dump(&self, dump: &[u8]) -> Result<bool>;
    async fn restore(&self, dump: &[u8]) -> Result<()>;
    /// Opaque write-activity marker, captured at cutover.
    async fn write_activity_marker(&self) -> Result<String>;
    /// Rows written since a previously captured marker.
    async fn rows_written_since(&self, marker: &str) -> Result<u64>;
    /// Move rows written under the new schema aside for later remapping.
    async fn archive_recent_writes(&self) -> Result<u64>;
    /// Map archived rows back onto the old schema.
    async fn restore_archived_writes(&self) -> Result<()>;
}

#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn execute(&self, action: &str) -> Result<()>;
    /// True when the probe query returns at least one row. Used for
    /// shadow-read verification after data migrations.
    async fn probe(&self, query: &str) -> Result<bool>;
    async fn count(&self, query: &str) -> Result<u64>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn archive(&self) -> Result<Vec<u8>>;
    async fn restore(&self, archive: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload an artifact, returning its remote URI.
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<String>;
}
