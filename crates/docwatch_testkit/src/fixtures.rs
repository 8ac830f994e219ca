//! Test fixtures.
//!
//! Provides a sample document type, populated in-memory sources and
//! temporary checkpoint files.

use docwatch_engine::{FileTokenStore, MemoryChangeSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Sample document used across tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Document identity.
    #[serde(rename = "_id")]
    pub id: String,
    /// Host name.
    pub name: String,
    /// Operating system.
    pub os: String,
    /// Number of CPUs.
    #[serde(default)]
    pub cpus: u32,
}

/// JSON form of a [`Host`].
pub fn host(id: &str, os: &str) -> Value {
    json!({
        "_id": id,
        "name": format!("{id}.example.net"),
        "os": os,
        "cpus": 4,
    })
}

/// Zero-padded host id, so ids sort in creation order.
pub fn host_id(n: usize) -> String {
    format!("host-{n:04}")
}

/// An in-memory source with `count` hosts in `collection`.
pub fn populated_source(collection: &str, count: usize) -> MemoryChangeSource {
    let source = MemoryChangeSource::new();
    for n in 0..count {
        source
            .insert(collection, host(&host_id(n), "linux"))
            .expect("Failed to insert fixture document");
    }
    source
}

/// A file token store in a temporary directory.
pub struct TestCheckpoint {
    /// The store.
    pub store: FileTokenStore,
    /// Kept alive to prevent cleanup.
    _temp_dir: TempDir,
}

impl TestCheckpoint {
    /// Creates an empty checkpoint file location.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileTokenStore::new(temp_dir.path().join("checkpoints").join("watch.json"));
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }
}

impl Default for TestCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
///
/// Returns whether the condition held. Works with a paused clock.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Awaits `fut`, failing the test if it takes longer than `timeout`.
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("Operation did not finish in time")
}
