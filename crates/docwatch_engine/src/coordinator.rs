//! List-then-watch coordinator.
//!
//! Drives one watch through its phases:
//!
//! ```text
//! Listing -> ListDonePublished -> Tailing
//!    ^                               |
//!    +--------- FatalError <---------+
//! ```
//!
//! A watch with a stored token starts in `Tailing`. Otherwise it lists the
//! collection first, anchoring the tail at the stored start time or at the
//! feed head captured before the listing began, so no change committed during
//! the listing is missed.

use crate::config::{DispatchShape, ListOptions, LoopOptions, WatchOptions};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{WatchError, WatchResult};
use crate::recovery::{recover, FatalErrorCallback};
use crate::source::ChangeSource;
use crate::stop::StopSignal;
use crate::token::TokenStore;
use docwatch_protocol::{Event, FeedPosition, RawEvent, StartAt, Timestamp};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Number of fatal conditions tolerated in a row without any checkpoint
/// being written in between. The next one ends the watch.
pub const MAX_CONSECUTIVE_FATAL: u32 = 3;

/// Phase of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchPhase {
    /// Delivering the current contents of the collection.
    #[default]
    Listing,
    /// The `listerDone` sentinel has been handled.
    ListDonePublished,
    /// Delivering changes from the feed.
    Tailing,
    /// The stored position was lost; recovery is running.
    FatalError,
    /// The watch has ended.
    Stopped,
}

impl fmt::Display for WatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchPhase::Listing => "listing",
            WatchPhase::ListDonePublished => "list-done",
            WatchPhase::Tailing => "tailing",
            WatchPhase::FatalError => "fatal-error",
            WatchPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Where the unit holding the checkpoint was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// A `lister` or `listerDone` unit. Only a relist delivers it again.
    Listing,
    /// A tailed unit. Reopening the cursor at the durable position delivers
    /// it again.
    Tail,
}

/// Counters reported when a watch loop ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Phase the watch ended in.
    pub phase: WatchPhase,
    /// Completed or started listing passes.
    pub list_passes: u64,
    /// Documents delivered as `lister` events.
    pub listed_documents: u64,
    /// Events acknowledged by the handler.
    pub events_delivered: u64,
    /// Events acknowledged without being delivered to the handler.
    pub events_skipped: u64,
    /// Units abandoned after exhausting their retries.
    pub exhausted_units: u64,
    /// Events whose document failed to decode.
    pub decode_failures: u64,
    /// Successful checkpoint writes.
    pub checkpoints_written: u64,
    /// Failed checkpoint writes.
    pub checkpoint_failures: u64,
    /// Resumable source or store errors.
    pub source_errors: u64,
    /// Fatal conditions recovered from.
    pub fatal_recoveries: u64,
}

/// Runs one checkpointed watch.
pub(crate) struct Coordinator<T: Send + Sync> {
    name: String,
    source: Arc<dyn ChangeSource>,
    store: Arc<dyn TokenStore>,
    watch: WatchOptions,
    list: ListOptions,
    list_first: bool,
    batch_size: usize,
    dispatcher: Dispatcher<T>,
    fatal_callback: Option<FatalErrorCallback>,
    stop: StopSignal,
    stats: WatchStats,
    /// Last checkpoint written or loaded this session.
    durable: Option<FeedPosition>,
    /// Set once a unit exhausts its retries; no checkpoint is written until
    /// the abandoned unit can be delivered again.
    held: Option<Hold>,
    /// Best known cluster time of the watch position.
    last_known: Option<Timestamp>,
    /// Start time forced by recovery, ignoring any stored token.
    relist_from: Option<Timestamp>,
}

impl<T> Coordinator<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Validates `options` for `shape` and builds a coordinator.
    pub(crate) fn new(
        source: Arc<dyn ChangeSource>,
        mut options: LoopOptions<T>,
        shape: DispatchShape,
    ) -> WatchResult<Self> {
        options.check_set_default(shape)?;
        let list = {
            let mut list = options.list_options();
            if options.list_first {
                list.check_set_default()?;
            }
            list
        };
        let store = options
            .token_store
            .take()
            .ok_or_else(|| WatchError::invalid("token_store", "a token store is required"))?;
        let handler = options
            .handler
            .take()
            .ok_or_else(|| WatchError::invalid("handler", "a handler is required"))?;
        let stop = options.stop.take().unwrap_or_else(StopSignal::never);
        let retry = options.retry.unwrap_or_default();
        let batch_size = options.batch_size.unwrap_or(crate::config::DEFAULT_BATCH_SIZE);

        Ok(Self {
            dispatcher: Dispatcher::new(options.name.clone(), handler, retry, stop.clone()),
            name: options.name,
            source,
            store,
            watch: options.watch,
            list,
            list_first: options.list_first,
            batch_size,
            fatal_callback: options.fatal_callback,
            stop,
            stats: WatchStats::default(),
            durable: None,
            held: None,
            last_known: None,
            relist_from: None,
        })
    }

    /// Runs until stopped or a non-recoverable error occurs.
    pub(crate) async fn run(mut self) -> WatchResult<WatchStats> {
        info!(watch = %self.name, shape = ?self.dispatcher.shape(), "watch loop starting");
        let mut consecutive_fatal = 0u32;
        let mut checkpoint_mark = self.stats.checkpoints_written;

        loop {
            let err = match self.run_session().await {
                Ok(()) | Err(WatchError::Cancelled) => return Ok(self.finish()),
                Err(err) => err,
            };

            if err.is_history_lost() {
                if self.stats.checkpoints_written > checkpoint_mark {
                    consecutive_fatal = 0;
                }
                checkpoint_mark = self.stats.checkpoints_written;
                consecutive_fatal += 1;
                if consecutive_fatal > MAX_CONSECUTIVE_FATAL {
                    error!(
                        watch = %self.name,
                        error = %err,
                        attempts = consecutive_fatal,
                        "resume position keeps getting lost, giving up"
                    );
                    return Err(err);
                }
                self.enter_fatal(&err).await?;
            } else if err.is_resumable() {
                if let Err(WatchError::Cancelled) = self.backoff(&err).await {
                    return Ok(self.finish());
                }
            } else {
                error!(watch = %self.name, phase = %self.stats.phase, error = %err, "watch failed");
                return Err(err);
            }
        }
    }

    async fn enter_fatal(&mut self, err: &WatchError) -> WatchResult<()> {
        self.set_phase(WatchPhase::FatalError);
        let last_known = self.last_known.unwrap_or(Timestamp::ZERO);
        warn!(watch = %self.name, error = %err, last_known = %last_known, "resume position lost");
        recover(
            &self.name,
            self.fatal_callback.as_ref(),
            self.store.as_ref(),
            self.source.as_ref(),
            last_known,
        )
        .await?;
        self.stats.fatal_recoveries += 1;
        self.relist_from = Some(last_known);
        Ok(())
    }

    /// One session: read the start point, list if needed, then tail.
    async fn run_session(&mut self) -> WatchResult<()> {
        self.durable = None;
        self.held = None;

        let point = self.until_stopped(self.store.get_start_watch_token()).await?;
        let (token, start_time) = match self.relist_from {
            Some(fallback) => (None, point.start_at_time.or(Some(fallback))),
            None => (point.token, point.start_at_time),
        };

        if let Some(token) = token {
            let cluster_time = point.token_time.unwrap_or(Timestamp::ZERO);
            info!(watch = %self.name, token = %token, "resuming from stored token");
            self.last_known = Some(cluster_time);
            self.durable = Some(FeedPosition {
                token: token.clone(),
                cluster_time,
            });
            return self.tail(StartAt::Token(token)).await;
        }

        let anchor = match start_time {
            Some(ts) => {
                self.last_known = Some(ts);
                None
            }
            None => {
                let head = self.until_stopped(self.source.head()).await?;
                self.last_known = Some(head.cluster_time);
                Some(head)
            }
        };
        let start = match (&anchor, start_time) {
            (Some(head), _) => StartAt::Token(head.token.clone()),
            (None, Some(ts)) => StartAt::Time(ts),
            (None, None) => StartAt::Time(Timestamp::ZERO),
        };

        if self.list_first {
            let anchor_time = self.last_known.unwrap_or(Timestamp::ZERO);
            self.list_pass(anchor_time).await?;
            if let Some(head) = anchor {
                if self.held.is_none() {
                    self.checkpoint(head).await?;
                }
            }
        }
        self.relist_from = None;
        self.tail(start).await
    }

    async fn list_pass(&mut self, anchor_time: Timestamp) -> WatchResult<()> {
        self.set_phase(WatchPhase::Listing);
        self.stats.list_passes += 1;
        let mut cursor = self.until_stopped(self.source.list(&self.list)).await?;

        while let Some(page) = self.until_stopped(cursor.next_page()).await? {
            debug!(watch = %self.name, size = page.len(), "listing page");
            self.stats.listed_documents += page.len() as u64;
            let events: Vec<Event<T>> = page
                .into_iter()
                .map(|doc| {
                    self.decode(RawEvent::lister(
                        doc.collection,
                        doc.document_id,
                        doc.document_raw,
                        anchor_time,
                    ))
                })
                .collect();
            self.deliver(&events).await?;
        }

        let done = self.decode(RawEvent::list_done(self.list.collection.clone(), anchor_time));
        self.deliver(std::slice::from_ref(&done)).await?;
        self.set_phase(WatchPhase::ListDonePublished);
        Ok(())
    }

    async fn tail(&mut self, start: StartAt) -> WatchResult<()> {
        self.set_phase(WatchPhase::Tailing);
        let await_time = self.watch.await_time();
        let mut resume = start.clone();

        loop {
            debug!(watch = %self.name, from = %resume, "opening tail cursor");
            let opened = self
                .until_stopped(self.source.tail(&self.watch, &resume))
                .await;
            let err = match opened {
                Ok(mut cursor) => loop {
                    let polled = self
                        .until_stopped(cursor.next_batch(self.batch_size, await_time))
                        .await;
                    match polled {
                        Ok(raw) if raw.is_empty() => continue,
                        Ok(raw) => {
                            let events: Vec<Event<T>> =
                                raw.into_iter().map(|r| self.decode(r)).collect();
                            self.deliver(&events).await?;
                        }
                        Err(err) => break err,
                    }
                },
                Err(err) => err,
            };

            if !err.is_resumable() {
                return Err(err);
            }
            self.backoff(&err).await?;
            // Rewinding to the durable position redelivers a held tail unit.
            // A held listing unit stays held so the next session relists.
            resume = match &self.durable {
                Some(pos) => StartAt::Token(pos.token.clone()),
                None => start.clone(),
            };
            if self.held == Some(Hold::Tail) {
                self.held = None;
            }
        }
    }

    /// Delivers events as units of the handler's shape, checkpointing after
    /// each acknowledged unit.
    async fn deliver(&mut self, events: &[Event<T>]) -> WatchResult<()> {
        match self.dispatcher.shape() {
            DispatchShape::Single => {
                for event in events {
                    let outcome = self.dispatcher.dispatch_one(event).await;
                    self.settle(outcome, std::slice::from_ref(event)).await?;
                }
            }
            DispatchShape::Batch => {
                for chunk in events.chunks(self.batch_size) {
                    let outcome = self.dispatcher.dispatch_batch(chunk).await;
                    self.settle(outcome, chunk).await?;
                }
            }
        }
        Ok(())
    }

    async fn settle(&mut self, outcome: DispatchOutcome, unit: &[Event<T>]) -> WatchResult<()> {
        match outcome {
            DispatchOutcome::Handled { .. } => {
                self.stats.events_delivered += unit.len() as u64;
                self.checkpoint_unit(unit).await
            }
            DispatchOutcome::Skipped => {
                self.stats.events_skipped += unit.len() as u64;
                self.checkpoint_unit(unit).await
            }
            DispatchOutcome::Exhausted { attempts } => {
                self.stats.exhausted_units += 1;
                if self.held.is_none() {
                    let hold = match self.stats.phase {
                        WatchPhase::Listing => Hold::Listing,
                        _ => Hold::Tail,
                    };
                    warn!(
                        watch = %self.name,
                        attempts,
                        hold = ?hold,
                        "holding checkpoint"
                    );
                    self.held = Some(hold);
                }
                Ok(())
            }
            DispatchOutcome::Stopped { .. } => Err(WatchError::Cancelled),
        }
    }

    async fn checkpoint_unit(&mut self, unit: &[Event<T>]) -> WatchResult<()> {
        if self.held.is_some() {
            return Ok(());
        }
        let last = unit.iter().rev().find_map(|e| {
            e.token.as_ref().map(|token| FeedPosition {
                token: token.clone(),
                cluster_time: e.cluster_time,
            })
        });
        match last {
            Some(pos) => self.checkpoint(pos).await,
            None => Ok(()),
        }
    }

    async fn checkpoint(&mut self, pos: FeedPosition) -> WatchResult<()> {
        if self.stop.is_stopped() {
            return Err(WatchError::Cancelled);
        }
        match self
            .store
            .set_last_watch_token(&pos.token, pos.cluster_time)
            .await
        {
            Ok(()) => {
                debug!(watch = %self.name, token = %pos.token, "checkpoint written");
                self.stats.checkpoints_written += 1;
                self.last_known = Some(pos.cluster_time);
                self.durable = Some(pos);
            }
            Err(err) => {
                warn!(watch = %self.name, token = %pos.token, error = %err, "checkpoint write failed");
                self.stats.checkpoint_failures += 1;
            }
        }
        Ok(())
    }

    async fn backoff(&mut self, err: &WatchError) -> WatchResult<()> {
        let delay = self.watch.await_time();
        warn!(
            watch = %self.name,
            phase = %self.stats.phase,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "resumable error, reopening"
        );
        self.stats.source_errors += 1;
        if self.stop.sleep(delay).await {
            Ok(())
        } else {
            Err(WatchError::Cancelled)
        }
    }

    fn decode(&mut self, raw: RawEvent) -> Event<T> {
        let (event, err) = Event::decode(raw);
        if let Some(err) = err {
            warn!(
                watch = %self.name,
                id = %event.document_id,
                op = %event.operation_type,
                error = %err,
                "document did not decode, delivering without it"
            );
            self.stats.decode_failures += 1;
        }
        event
    }

    async fn until_stopped<R, F>(&self, fut: F) -> WatchResult<R>
    where
        F: Future<Output = WatchResult<R>>,
    {
        tokio::select! {
            biased;
            _ = self.stop.stopped() => Err(WatchError::Cancelled),
            result = fut => result,
        }
    }

    fn set_phase(&mut self, phase: WatchPhase) {
        if self.stats.phase != phase {
            info!(watch = %self.name, from = %self.stats.phase, to = %phase, "phase change");
            self.stats.phase = phase;
        }
    }

    fn finish(mut self) -> WatchStats {
        self.set_phase(WatchPhase::Stopped);
        info!(
            watch = %self.name,
            delivered = self.stats.events_delivered,
            checkpoints = self.stats.checkpoints_written,
            "watch loop stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryOptions;
    use crate::dispatch::{EventHandler, WatchHandler};
    use crate::memory::MemoryChangeSource;
    use crate::token::MemoryTokenStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Asks for a retry on every delivery of ids listed in `reject`.
    #[derive(Default)]
    struct Picky {
        reject: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl Picky {
        fn answer(&self, event: &Event<Value>) -> bool {
            self.seen.lock().push(event.document_id.clone());
            self.reject.iter().any(|id| *id == event.document_id)
        }
    }

    #[async_trait]
    impl EventHandler<Value> for Picky {
        async fn do_add(&self, event: &Event<Value>) -> bool {
            self.answer(event)
        }
        async fn do_update(&self, event: &Event<Value>) -> bool {
            self.answer(event)
        }
        async fn do_delete(&self, event: &Event<Value>) -> bool {
            self.answer(event)
        }
    }

    fn options(
        handler: Arc<Picky>,
        store: Arc<MemoryTokenStore>,
        stop: &StopSignal,
    ) -> LoopOptions<Value> {
        LoopOptions::new("hosts", WatchOptions::collection("hosts"))
            .with_token_store(store)
            .with_handler(WatchHandler::Single(handler))
            .with_retry(RetryOptions::new(2, Duration::from_millis(500)))
            .with_stop(stop.clone())
    }

    #[test]
    fn phase_names() {
        assert_eq!(WatchPhase::default(), WatchPhase::Listing);
        assert_eq!(WatchPhase::ListDonePublished.to_string(), "list-done");
        assert_eq!(WatchPhase::Stopped.to_string(), "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_unit_holds_checkpoint() {
        let source = MemoryChangeSource::new();
        let store = Arc::new(MemoryTokenStore::new());
        let handler = Arc::new(Picky {
            reject: vec!["bad"],
            ..Picky::default()
        });
        let stop = StopSignal::new();
        let coordinator = Coordinator::new(
            Arc::new(source.clone()),
            options(handler.clone(), store.clone(), &stop).without_listing(),
            DispatchShape::Single,
        )
        .unwrap();
        let task = tokio::spawn(coordinator.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.insert("hosts", json!({"_id": "good"})).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.insert("hosts", json!({"_id": "bad"})).unwrap();
        source.insert("hosts", json!({"_id": "after"})).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.stop();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.phase, WatchPhase::Stopped);
        assert_eq!(stats.exhausted_units, 1);
        assert_eq!(
            *handler.seen.lock(),
            vec!["good", "bad", "bad", "after"]
        );
        assert_eq!(store.token_write_count(), 1);
        assert_eq!(
            store.current().token.unwrap().as_str(),
            "0000000000000001"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listing_anchor_is_checkpointed() {
        let source = MemoryChangeSource::new();
        source.insert("hosts", json!({"_id": "a"})).unwrap();
        source.insert("hosts", json!({"_id": "b"})).unwrap();
        let store = Arc::new(MemoryTokenStore::new());
        let handler = Arc::new(Picky::default());
        let stop = StopSignal::new();
        let coordinator = Coordinator::new(
            Arc::new(source.clone()),
            options(handler.clone(), store.clone(), &stop),
            DispatchShape::Single,
        )
        .unwrap();
        let task = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.stop();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.listed_documents, 2);
        assert_eq!(stats.list_passes, 1);
        assert_eq!(*handler.seen.lock(), vec!["a", "b", ""]);
        assert_eq!(
            store.current().token.unwrap().as_str(),
            "0000000000000002"
        );
    }
}
