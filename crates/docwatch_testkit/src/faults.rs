//! Fault injection.
//!
//! [`FaultySource`] wraps a change source and fails scripted calls;
//! [`FlakyTokenStore`] wraps a memory token store and fails scripted writes.

use async_trait::async_trait;
use docwatch_engine::{
    token_store_error, ChangeSource, ListCursor, ListOptions, MemoryTokenStore, TailCursor,
    TokenStore, WatchError, WatchOptions, WatchResult,
};
use docwatch_protocol::{FeedPosition, RawEvent, ResumeToken, StartAt, StartPoint, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A fault returned in place of a real result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A retryable source error.
    Transient,
    /// The stored position is no longer in the feed's history.
    HistoryLost,
}

impl Fault {
    fn into_error(self) -> WatchError {
        match self {
            Fault::Transient => WatchError::source_retryable("injected transient fault"),
            Fault::HistoryLost => WatchError::HistoryLost("injected history loss".into()),
        }
    }
}

#[derive(Default)]
struct FaultScript {
    polls: VecDeque<Fault>,
    opens: VecDeque<Fault>,
    tails_opened: Vec<StartAt>,
}

/// A change source failing scripted polls and cursor opens.
#[derive(Clone)]
pub struct FaultySource {
    inner: Arc<dyn ChangeSource>,
    script: Arc<Mutex<FaultScript>>,
}

impl FaultySource {
    /// Wraps a change source.
    pub fn new(inner: impl ChangeSource + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            script: Arc::default(),
        }
    }

    /// The next tail polls fail with `faults`, in order.
    pub fn fail_polls(&self, faults: impl IntoIterator<Item = Fault>) {
        self.script.lock().polls.extend(faults);
    }

    /// The next tail cursor opens fail with `faults`, in order.
    pub fn fail_opens(&self, faults: impl IntoIterator<Item = Fault>) {
        self.script.lock().opens.extend(faults);
    }

    /// Positions every tail cursor was opened from, in order.
    pub fn tails_opened(&self) -> Vec<StartAt> {
        self.script.lock().tails_opened.clone()
    }
}

#[async_trait]
impl ChangeSource for FaultySource {
    async fn head(&self) -> WatchResult<FeedPosition> {
        self.inner.head().await
    }

    async fn list(&self, options: &ListOptions) -> WatchResult<Box<dyn ListCursor>> {
        self.inner.list(options).await
    }

    async fn tail(
        &self,
        options: &WatchOptions,
        start: &StartAt,
    ) -> WatchResult<Box<dyn TailCursor>> {
        let fault = {
            let mut script = self.script.lock();
            script.tails_opened.push(start.clone());
            script.opens.pop_front()
        };
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }
        let inner = self.inner.tail(options, start).await?;
        Ok(Box::new(FaultyCursor {
            inner,
            script: Arc::clone(&self.script),
        }))
    }
}

struct FaultyCursor {
    inner: Box<dyn TailCursor>,
    script: Arc<Mutex<FaultScript>>,
}

#[async_trait]
impl TailCursor for FaultyCursor {
    async fn next_batch(
        &mut self,
        max_events: usize,
        max_await: Duration,
    ) -> WatchResult<Vec<RawEvent>> {
        let fault = self.script.lock().polls.pop_front();
        match fault {
            Some(fault) => Err(fault.into_error()),
            None => self.inner.next_batch(max_events, max_await).await,
        }
    }
}

/// A memory token store whose checkpoint writes can be made to fail.
#[derive(Default)]
pub struct FlakyTokenStore {
    inner: MemoryTokenStore,
    failures: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl FlakyTokenStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` checkpoint writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        *self.failures.lock() += n;
    }

    /// The wrapped store, holding every successful write.
    pub fn inner(&self) -> &MemoryTokenStore {
        &self.inner
    }

    /// Checkpoint writes attempted, failed or not.
    pub fn write_attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl TokenStore for FlakyTokenStore {
    async fn set_last_watch_token(
        &self,
        token: &ResumeToken,
        cluster_time: Timestamp,
    ) -> WatchResult<()> {
        *self.attempts.lock() += 1;
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(token_store_error(format!("injected write failure for {token}")));
            }
        }
        self.inner.set_last_watch_token(token, cluster_time).await
    }

    async fn get_start_watch_token(&self) -> WatchResult<StartPoint> {
        self.inner.get_start_watch_token().await
    }

    async fn set_start_watch_time(&self, start_at_time: Timestamp) -> WatchResult<()> {
        self.inner.set_start_watch_time(start_at_time).await
    }
}
