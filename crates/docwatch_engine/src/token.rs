//! Resume token stores.
//!
//! A token store is the only durable state of a watch: the last handled
//! position, and the "start" entry written by fatal-error recovery. The
//! engine writes a checkpoint only after a unit has been handled, and never
//! re-reads it to confirm the write.

use crate::error::{WatchError, WatchResult};
use async_trait::async_trait;
use docwatch_protocol::{ResumeToken, StartPoint, Timestamp};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persistence boundary for watch positions.
///
/// Implementations must be idempotent under retry and safe to call from a
/// background task. When shared between watches, they must be safe for
/// concurrent use.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Durably records that everything up to `token` has been handled.
    ///
    /// Clears any start-at-time entry.
    async fn set_last_watch_token(
        &self,
        token: &ResumeToken,
        cluster_time: Timestamp,
    ) -> WatchResult<()>;

    /// Reads the position a watch should start from.
    async fn get_start_watch_token(&self) -> WatchResult<StartPoint>;

    /// Records a "start no earlier than" time and forgets the stored token.
    async fn set_start_watch_time(&self, start_at_time: Timestamp) -> WatchResult<()>;
}

/// A single write recorded by [`MemoryTokenStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenWrite {
    /// A checkpoint write.
    Token(ResumeToken, Timestamp),
    /// A start-at-time write.
    StartTime(Timestamp),
}

/// An in-memory token store that records every write.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    state: Mutex<StartPoint>,
    writes: Mutex<Vec<TokenWrite>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds a checkpoint.
    pub fn with_token(token: ResumeToken, cluster_time: Timestamp) -> Self {
        let store = Self::new();
        *store.state.lock() = StartPoint {
            token: Some(token),
            token_time: Some(cluster_time),
            start_at_time: None,
        };
        store
    }

    /// Current stored state.
    pub fn current(&self) -> StartPoint {
        self.state.lock().clone()
    }

    /// Every write in order.
    pub fn writes(&self) -> Vec<TokenWrite> {
        self.writes.lock().clone()
    }

    /// Number of checkpoint writes.
    pub fn token_write_count(&self) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|w| matches!(w, TokenWrite::Token(..)))
            .count()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn set_last_watch_token(
        &self,
        token: &ResumeToken,
        cluster_time: Timestamp,
    ) -> WatchResult<()> {
        *self.state.lock() = StartPoint {
            token: Some(token.clone()),
            token_time: Some(cluster_time),
            start_at_time: None,
        };
        self.writes
            .lock()
            .push(TokenWrite::Token(token.clone(), cluster_time));
        Ok(())
    }

    async fn get_start_watch_token(&self) -> WatchResult<StartPoint> {
        Ok(self.current())
    }

    async fn set_start_watch_time(&self, start_at_time: Timestamp) -> WatchResult<()> {
        *self.state.lock() = StartPoint {
            token: None,
            token_time: None,
            start_at_time: Some(start_at_time),
        };
        self.writes.lock().push(TokenWrite::StartTime(start_at_time));
        Ok(())
    }
}

/// A token store persisting the start point as a JSON file.
///
/// Writes use write-then-rename so a crash leaves either the previous or the
/// new checkpoint on disk, never a torn one:
/// 1. Write to a temporary file next to the checkpoint
/// 2. Sync the temporary file
/// 3. Rename it over the checkpoint
/// 4. Sync the directory so the rename is durable
///
/// The async [`TokenStore`] methods run the file work on the blocking pool.
/// [`load`](Self::load) and [`save`](Self::save) stay synchronous for callers
/// outside a runtime. Clones share the same write lock.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileTokenStore {
    /// Opens (without creating) a checkpoint file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint; a missing file is an empty start point.
    pub fn load(&self) -> WatchResult<StartPoint> {
        match fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(StartPoint::empty()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StartPoint::empty()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the checkpoint.
    pub fn save(&self, point: &StartPoint) -> WatchResult<()> {
        let _guard = self.lock.lock();
        let data = serde_json::to_vec_pretty(point)?;

        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        self.sync_directory()?;
        Ok(())
    }

    /// Removes the checkpoint file, if any.
    pub fn reset(&self) -> WatchResult<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> WatchResult<()> {
        if let Some(parent) = self.parent_dir() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> WatchResult<()> {
        // NTFS journals the rename; directory handles cannot be fsynced.
        Ok(())
    }

    async fn blocking<R, F>(&self, f: F) -> WatchResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&FileTokenStore) -> WatchResult<R> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(token_store_error)?
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn set_last_watch_token(
        &self,
        token: &ResumeToken,
        cluster_time: Timestamp,
    ) -> WatchResult<()> {
        let point = StartPoint {
            token: Some(token.clone()),
            token_time: Some(cluster_time),
            start_at_time: None,
        };
        self.blocking(move |store| store.save(&point)).await
    }

    async fn get_start_watch_token(&self) -> WatchResult<StartPoint> {
        self.blocking(FileTokenStore::load).await
    }

    async fn set_start_watch_time(&self, start_at_time: Timestamp) -> WatchResult<()> {
        let point = StartPoint {
            token: None,
            token_time: None,
            start_at_time: Some(start_at_time),
        };
        self.blocking(move |store| store.save(&point)).await
    }
}

/// Maps an arbitrary store failure into a token store error.
pub fn token_store_error(err: impl std::fmt::Display) -> WatchError {
    WatchError::TokenStore(err.to_string())
}
