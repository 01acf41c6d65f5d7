//! In-memory collaborators for tests. Each fake records the calls it saw
//! and can be told to fail at a specific point.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    ContainerHandle, ContainerRuntime, DatabaseAdmin, ImageHandle, MediaStore, ObjectStore,
    SchemaStore,
};
use crate::health::{HealthEndpoint, HealthSample};

#[derive(Default)]
pub struct FakeSchema {
    executed: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    probe_fails: AtomicBool,
    row_count: AtomicU64,
}

impl FakeSchema {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn fail_on(&self, action: &str) {
        *self.fail_on.lock().unwrap() = Some(action.to_string());
    }

    pub fn set_probe_result(&self, ok: bool) {
        self.probe_fails.store(!ok, Ordering::SeqCst);
    }

    pub fn set_row_count(&self, count: u64) {
        self.row_count.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SchemaStore for FakeSchema {
    async fn execute(&self, action: &str) -> Result<()> {
        self.executed.lock().unwrap().push(action.to_string());
        if self.fail_on.lock().unwrap().as_deref() == Some(action) {
            bail!("simulated failure executing '{}'", action);
        }
        Ok(())
    }

    async fn probe(&self, _query: &str) -> Result<bool> {
        Ok(!self.probe_fails.load(Ordering::SeqCst))
    }

    async fn count(&self, _query: &str) -> Result<u64> {
        Ok(self.row_count.load(Ordering::SeqCst))
    }
}

pub struct FakeRuntime {
    pub events: Mutex<Vec<String>>,
    pub prior: Mutex<Option<ContainerHandle>>,
    fail_build: AtomicBool,
    /// Image reference whose `start` should fail.
    fail_start_for: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            prior: Mutex::new(Some(ContainerHandle {
                id: "c-prior".to_string(),
                image: "portal:previous".to_string(),
            })),
            fail_build: AtomicBool::new(false),
            fail_start_for: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

impl FakeRuntime {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn fail_build(&self) {
        self.fail_build.store(true, Ordering::SeqCst);
    }

    pub fn fail_start_for(&self, image: &str) {
        *self.fail_start_for.lock().unwrap() = Some(image.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build(&self, artifact: &str) -> Result<ImageHandle> {
        if self.fail_build.load(Ordering::SeqCst) {
            bail!("simulated build failure for {}", artifact);
        }
        self.record(format!("build {}", artifact));
        Ok(ImageHandle {
            reference: artifact.to_string(),
        })
    }

    async fn start(&self, image: &ImageHandle) -> Result<ContainerHandle> {
        if self.fail_start_for.lock().unwrap().as_deref() == Some(image.reference.as_str()) {
            bail!("simulated start failure for {}", image.reference);
        }
        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.record(format!("start {} ({})", image.reference, id));
        Ok(ContainerHandle {
            id,
            image: image.reference.clone(),
        })
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<()> {
        self.record(format!("stop {}", container.id));
        Ok(())
    }

    async fn find(&self, _label: &str) -> Result<Option<ContainerHandle>> {
        Ok(self.prior.lock().unwrap().clone())
    }

    async fn promote(&self, container: &ContainerHandle) -> Result<()> {
        self.record(format!("promote {}", container.id));
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        self.record("clear_caches".to_string());
        Ok(())
    }
}

pub struct FakeDatabase {
    fail_dump: AtomicBool,
    dump_is_valid: AtomicBool,
    rows_since_marker: AtomicU64,
    pub restored: AtomicBool,
    pub archived: AtomicBool,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self {
            fail_dump: AtomicBool::new(false),
            dump_is_valid: AtomicBool::new(true),
            rows_since_marker: AtomicU64::new(0),
            restored: AtomicBool::new(false),
            archived: AtomicBool::new(false),
        }
    }
}

impl FakeDatabase {
    pub fn fail_dump(&self) {
        self.fail_dump.store(true, Ordering::SeqCst);
    }

    pub fn set_dump_valid(&self, valid: bool) {
        self.dump_is_valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_rows_written(&self, rows: u64) {
        self.rows_since_marker.store(rows, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDatabase {
    async fn dump(&self) -> Result<Vec<u8>> {
        if self.fail_dump.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(b"-- fake dump\n".to_vec())
    }

    async fn verify_dump(&self, _dump: &[u8]) -> Result<bool> {
        Ok(self.dump_is_valid.load(Ordering::SeqCst))
    }

    async fn restore(&self, _dump: &[u8]) -> Result<()> {
        self.restored.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_activity_marker(&self) -> Result<String> {
        Ok("0".to_string())
    }

    async fn rows_written_since(&self, _marker: &str) -> Result<u64> {
        Ok(self.rows_since_marker.load(Ordering::SeqCst))
    }

    async fn archive_recent_writes(&self) -> Result<u64> {
        self.archived.store(true, Ordering::SeqCst);
        Ok(self.rows_since_marker.load(Ordering::SeqCst))
    }

    async fn restore_archived_writes(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMedia;

#[async_trait]
impl MediaStore for FakeMedia {
    async fn archive(&self) -> Result<Vec<u8>> {
        Ok(b"fake media tarball".to_vec())
    }

    async fn restore(&self, _archive: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeObjectStore {
    pub uploads: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn upload(&self, key: &str, _bytes: &[u8]) -> Result<String> {
        self.uploads.lock().unwrap().push(key.to_string());
        Ok(format!("s3://fake-bucket/{}", key))
    }
}

/// Health endpoint that plays back a script of samples, then repeats the
/// last configured default.
pub struct ScriptedEndpoint {
    script: Mutex<VecDeque<HealthSample>>,
    default_ok: AtomicBool,
}

impl Default for ScriptedEndpoint {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_ok: AtomicBool::new(true),
        }
    }
}

impl ScriptedEndpoint {
    pub fn push(&self, sample: HealthSample) {
        self.script.lock().unwrap().push_back(sample);
    }

    pub fn push_failures(&self, n: usize) {
        for _ in 0..n {
            self.push(HealthSample::failed(Some(500), 3));
        }
    }

    pub fn set_default_ok(&self, ok: bool) {
        self.default_ok.store(ok, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthEndpoint for ScriptedEndpoint {
    async fn probe(&self) -> HealthSample {
        if let Some(sample) = self.script.lock().unwrap().pop_front() {
            return sample;
        }
        if self.default_ok.load(Ordering::SeqCst) {
            HealthSample::healthy(200, 2)
        } else {
            HealthSample::failed(Some(503), 2)
        }
    }
}
