//! Entry points: raw subscriptions and checkpointed loops.

use crate::config::{DispatchShape, ListOptions, LoopOptions, WatchOptions};
use crate::coordinator::{Coordinator, WatchStats};
use crate::error::{WatchError, WatchResult};
use crate::recovery::FatalErrorCallback;
use crate::source::ChangeSource;
use crate::stop::StopSignal;
use docwatch_protocol::{Event, RawEvent, StartAt, Timestamp};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of a subscription channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// A stream of events fed by a background task.
///
/// Dropping the subscription stops the task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Event<T>>,
    stop: StopSignal,
    task: Option<JoinHandle<WatchResult<()>>>,
}

impl<T> Subscription<T> {
    /// Receives the next event. `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    /// Stops the background task. Buffered events can still be received.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// The signal stopping this subscription.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Waits for the background task to end and returns how it ended.
    ///
    /// Does not stop the task; call [`stop`](Self::stop) first to end an
    /// open-ended watch.
    pub async fn finish(mut self) -> WatchResult<()> {
        // Keep the channel open so the task is not cut short by a closed receiver.
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let drain = async {
            while self.rx.recv().await.is_some() {}
        };
        let (joined, ()) = tokio::join!(task, drain);
        joined.map_err(|e| WatchError::source_fatal(format!("subscription task failed: {e}")))?
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Sends one event unless stopped or the receiver is gone.
///
/// Returns false if the task should end.
async fn forward<T>(tx: &mpsc::Sender<Event<T>>, stop: &StopSignal, event: Event<T>) -> bool {
    tokio::select! {
        biased;
        _ = stop.stopped() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

fn decode<T: DeserializeOwned>(raw: RawEvent) -> Event<T> {
    let (event, err) = Event::decode(raw);
    if let Some(err) = err {
        warn!(id = %event.document_id, op = %event.operation_type, error = %err, "document did not decode");
    }
    event
}

/// Watches a change source.
#[derive(Clone)]
pub struct Watcher {
    source: Arc<dyn ChangeSource>,
}

impl Watcher {
    /// Creates a watcher over a change source.
    pub fn new(source: impl ChangeSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Creates a watcher over a shared change source.
    pub fn from_arc(source: Arc<dyn ChangeSource>) -> Self {
        Self { source }
    }

    /// The underlying change source.
    pub fn source(&self) -> &Arc<dyn ChangeSource> {
        &self.source
    }

    /// Subscribes to the raw change feed.
    ///
    /// Starts after `start_after_token`, else at `start_at_time`, else at the
    /// current head. There is no retry and no checkpointing. If the start
    /// position is lost, `fatal_callback` (if any) is invoked with the last
    /// known time and the channel is closed.
    pub async fn watch<T>(
        &self,
        mut options: WatchOptions,
        fatal_callback: Option<FatalErrorCallback>,
    ) -> WatchResult<Subscription<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        options.check_set_default()?;
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let stop = StopSignal::new();
        let task = tokio::spawn(tail_into(
            Arc::clone(&self.source),
            options,
            fatal_callback,
            tx,
            stop.clone(),
        ));
        Ok(Subscription {
            rx,
            stop,
            task: Some(task),
        })
    }

    /// Lists a collection as `lister` events followed by one `listerDone`.
    pub async fn list<T>(&self, mut options: ListOptions) -> WatchResult<Subscription<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        options.check_set_default()?;
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let stop = StopSignal::new();
        let task = tokio::spawn(list_into(
            Arc::clone(&self.source),
            options,
            tx,
            stop.clone(),
        ));
        Ok(Subscription {
            rx,
            stop,
            task: Some(task),
        })
    }

    /// Runs a checkpointed watch with a per-event handler.
    ///
    /// Returns once the stop signal fires, or with the error that ended it.
    pub async fn run_single_loop<T>(&self, options: LoopOptions<T>) -> WatchResult<WatchStats>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Coordinator::new(Arc::clone(&self.source), options, DispatchShape::Single)?
            .run()
            .await
    }

    /// Runs a checkpointed watch with a batch handler.
    ///
    /// Returns once the stop signal fires, or with the error that ended it.
    pub async fn run_batch_loop<T>(&self, options: LoopOptions<T>) -> WatchResult<WatchStats>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Coordinator::new(Arc::clone(&self.source), options, DispatchShape::Batch)?
            .run()
            .await
    }
}

async fn tail_into<T>(
    source: Arc<dyn ChangeSource>,
    options: WatchOptions,
    fatal_callback: Option<FatalErrorCallback>,
    tx: mpsc::Sender<Event<T>>,
    stop: StopSignal,
) -> WatchResult<()>
where
    T: DeserializeOwned + Send + 'static,
{
    let mut last_known = options.start_at_time;
    match forward_changes(source.as_ref(), &options, &tx, &stop, &mut last_known).await {
        Err(err) if err.is_history_lost() => {
            let last_known = last_known.unwrap_or(Timestamp::ZERO);
            warn!(error = %err, last_known = %last_known, "raw subscription lost its position");
            if let Some(callback) = fatal_callback {
                callback(last_known).await.map_err(|e| {
                    error!(error = %e, "fatal error callback failed");
                    WatchError::FatalCallback(e.to_string())
                })?;
            }
            Err(err)
        }
        Err(err) => {
            error!(error = %err, "raw subscription failed");
            Err(err)
        }
        Ok(()) => {
            info!("raw subscription stopped");
            Ok(())
        }
    }
}

async fn forward_changes<T>(
    source: &dyn ChangeSource,
    options: &WatchOptions,
    tx: &mpsc::Sender<Event<T>>,
    stop: &StopSignal,
    last_known: &mut Option<Timestamp>,
) -> WatchResult<()>
where
    T: DeserializeOwned + Send + 'static,
{
    let start = match (&options.start_after_token, options.start_at_time) {
        (Some(token), _) => StartAt::Token(token.clone()),
        (None, Some(ts)) => StartAt::Time(ts),
        (None, None) => {
            let head = source.head().await?;
            *last_known = Some(head.cluster_time);
            StartAt::Token(head.token)
        }
    };
    debug!(from = %start, "raw subscription starting");
    let mut cursor = source.tail(options, &start).await?;
    let await_time = options.await_time();
    loop {
        let batch = tokio::select! {
            biased;
            _ = stop.stopped() => return Ok(()),
            batch = cursor.next_batch(DEFAULT_CHANNEL_CAPACITY, await_time) => batch?,
        };
        for raw in batch {
            *last_known = Some(raw.cluster_time);
            if !forward(tx, stop, decode(raw)).await {
                return Ok(());
            }
        }
    }
}

async fn list_into<T>(
    source: Arc<dyn ChangeSource>,
    options: ListOptions,
    tx: mpsc::Sender<Event<T>>,
    stop: StopSignal,
) -> WatchResult<()>
where
    T: DeserializeOwned + Send + 'static,
{
    let head = source.head().await?;
    let mut cursor = source.list(&options).await?;
    loop {
        let page = tokio::select! {
            biased;
            _ = stop.stopped() => return Ok(()),
            page = cursor.next_page() => page?,
        };
        let Some(page) = page else {
            break;
        };
        for doc in page {
            let raw = RawEvent::lister(
                doc.collection,
                doc.document_id,
                doc.document_raw,
                head.cluster_time,
            );
            if !forward(&tx, &stop, decode(raw)).await {
                return Ok(());
            }
        }
    }
    let done = RawEvent::list_done(options.collection.clone(), head.cluster_time);
    forward(&tx, &stop, decode(done)).await;
    Ok(())
}
