//! Event dispatch with bounded retry.
//!
//! A watch delivers events through exactly one handler shape, fixed when the
//! watch is configured:
//! - [`EventHandler`]: one callback per event, routed by operation type
//! - [`BatchHandler`]: one callback per ordered batch
//!
//! Every callback returns `true` to ask for a retry. The same unit is
//! re-invoked after the configured delay, up to the configured number of
//! invocations.

use crate::config::{DispatchShape, RetryOptions};
use crate::stop::StopSignal;
use async_trait::async_trait;
use docwatch_protocol::{Event, OperationType};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Per-event consumer.
///
/// Routing:
/// - `insert`, `lister` and `listerDone` go to [`do_add`](Self::do_add), so
///   an idempotent upsert consumer can treat the reconciliation pass as adds.
///   `listerDone` has no document; check `operation_type` to demarcate the
///   end of the backlog.
/// - `update` and `replace` go to [`do_update`](Self::do_update).
/// - `delete` goes to [`do_delete`](Self::do_delete).
/// - Collection-level, database-level and `invalidate` events are not
///   delivered to this shape; they are acknowledged and skipped.
#[async_trait]
pub trait EventHandler<T: Send + Sync>: Send + Sync {
    /// Handles an added document. Returns `true` to retry.
    async fn do_add(&self, event: &Event<T>) -> bool;

    /// Handles an updated or replaced document. Returns `true` to retry.
    async fn do_update(&self, event: &Event<T>) -> bool;

    /// Handles a deleted document. Returns `true` to retry.
    async fn do_delete(&self, event: &Event<T>) -> bool;
}

/// Batch consumer. Receives every event kind, in feed order.
#[async_trait]
pub trait BatchHandler<T: Send + Sync>: Send + Sync {
    /// Handles an ordered batch. Returns `true` to retry the whole batch.
    async fn do_batch(&self, events: &[Event<T>]) -> bool;
}

/// The handler of a watch: one shape or the other, never both.
pub enum WatchHandler<T: Send + Sync> {
    /// Per-event callbacks.
    Single(Arc<dyn EventHandler<T>>),
    /// Batch callback.
    Batch(Arc<dyn BatchHandler<T>>),
}

impl<T: Send + Sync> WatchHandler<T> {
    /// Wraps a per-event handler.
    pub fn single(handler: impl EventHandler<T> + 'static) -> Self {
        Self::Single(Arc::new(handler))
    }

    /// Wraps a batch handler.
    pub fn batch(handler: impl BatchHandler<T> + 'static) -> Self {
        Self::Batch(Arc::new(handler))
    }

    /// Shape of this handler.
    pub fn shape(&self) -> DispatchShape {
        match self {
            WatchHandler::Single(_) => DispatchShape::Single,
            WatchHandler::Batch(_) => DispatchShape::Batch,
        }
    }
}

impl<T: Send + Sync> Clone for WatchHandler<T> {
    fn clone(&self) -> Self {
        match self {
            WatchHandler::Single(h) => WatchHandler::Single(Arc::clone(h)),
            WatchHandler::Batch(h) => WatchHandler::Batch(Arc::clone(h)),
        }
    }
}

/// Result of driving one unit through its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler accepted the unit.
    Handled {
        /// Number of invocations, including the successful one.
        attempts: u32,
    },
    /// The handler kept asking for retries until the limit.
    Exhausted {
        /// Number of invocations made.
        attempts: u32,
    },
    /// The stop signal fired during a retry wait.
    Stopped {
        /// Number of invocations made.
        attempts: u32,
    },
    /// The event kind is not delivered to this handler shape.
    Skipped,
}

impl DispatchOutcome {
    /// Returns true if the checkpoint may move past this unit.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, DispatchOutcome::Handled { .. } | DispatchOutcome::Skipped)
    }

    /// Number of handler invocations.
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Handled { attempts }
            | DispatchOutcome::Exhausted { attempts }
            | DispatchOutcome::Stopped { attempts } => *attempts,
            DispatchOutcome::Skipped => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Add,
    Update,
    Delete,
}

fn route(operation_type: OperationType) -> Option<Route> {
    match operation_type {
        OperationType::Insert | OperationType::Lister | OperationType::ListDone => Some(Route::Add),
        OperationType::Update | OperationType::Replace => Some(Route::Update),
        OperationType::Delete => Some(Route::Delete),
        OperationType::Drop
        | OperationType::Rename
        | OperationType::DropDatabase
        | OperationType::Invalidate => None,
    }
}

/// Drives units through a handler with bounded, fixed-delay retry.
///
/// Both dispatch methods accept either handler shape. The watch loops call
/// the one matching [`shape`](Self::shape); the other adapts the unit so a
/// caller driving a dispatcher directly can mix them.
pub struct Dispatcher<T: Send + Sync> {
    name: String,
    handler: WatchHandler<T>,
    retry: RetryOptions,
    stop: StopSignal,
}

impl<T: Send + Sync> Dispatcher<T> {
    /// Creates a dispatcher. `retry` must already be validated.
    pub fn new(
        name: impl Into<String>,
        handler: WatchHandler<T>,
        retry: RetryOptions,
        stop: StopSignal,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            retry,
            stop,
        }
    }

    /// Shape of the underlying handler.
    pub fn shape(&self) -> DispatchShape {
        self.handler.shape()
    }

    /// Delivers a single event.
    ///
    /// With a batch handler the event is delivered as a batch of one.
    pub async fn dispatch_one(&self, event: &Event<T>) -> DispatchOutcome {
        match &self.handler {
            WatchHandler::Single(handler) => self.deliver(handler.as_ref(), event).await,
            WatchHandler::Batch(handler) => {
                let batch = std::slice::from_ref(event);
                self.with_retry("batch", || handler.do_batch(batch)).await
            }
        }
    }

    /// Delivers an ordered batch as one unit.
    ///
    /// With a per-event handler each event is delivered in order; the batch
    /// is acknowledged only if every event is.
    pub async fn dispatch_batch(&self, events: &[Event<T>]) -> DispatchOutcome {
        if events.is_empty() {
            return DispatchOutcome::Skipped;
        }
        match &self.handler {
            WatchHandler::Batch(handler) => {
                debug!(watch = %self.name, size = events.len(), "dispatching batch");
                self.with_retry("batch", || handler.do_batch(events)).await
            }
            WatchHandler::Single(handler) => {
                let mut attempts = 0;
                for event in events {
                    let outcome = self.deliver(handler.as_ref(), event).await;
                    attempts += outcome.attempts();
                    if !outcome.is_acknowledged() {
                        return outcome;
                    }
                }
                DispatchOutcome::Handled { attempts }
            }
        }
    }

    async fn deliver(&self, handler: &dyn EventHandler<T>, event: &Event<T>) -> DispatchOutcome {
        let Some(route) = route(event.operation_type) else {
            debug!(
                watch = %self.name,
                op = %event.operation_type,
                collection = %event.collection,
                "event kind not delivered to per-event handler"
            );
            return DispatchOutcome::Skipped;
        };
        debug!(
            watch = %self.name,
            op = %event.operation_type,
            id = %event.document_id,
            "dispatching event"
        );
        let unit = event.operation_type.as_str();
        match route {
            Route::Add => self.with_retry(unit, || handler.do_add(event)).await,
            Route::Update => self.with_retry(unit, || handler.do_update(event)).await,
            Route::Delete => self.with_retry(unit, || handler.do_delete(event)).await,
        }
    }

    async fn with_retry<F, Fut>(&self, unit: &str, mut call: F) -> DispatchOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let max = self.retry.max_retry_count.max(1);
        for attempt in 1..=max {
            if !call().await {
                return DispatchOutcome::Handled { attempts: attempt };
            }
            if attempt == max {
                break;
            }
            warn!(
                watch = %self.name,
                unit,
                attempt,
                max,
                delay_ms = self.retry.retry_duration.as_millis() as u64,
                "handler requested retry"
            );
            if !self.stop.sleep(self.retry.retry_duration).await {
                return DispatchOutcome::Stopped { attempts: attempt };
            }
        }
        error!(
            watch = %self.name,
            unit,
            attempts = max,
            "retries exhausted, unit will be redelivered after restart"
        );
        DispatchOutcome::Exhausted { attempts: max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwatch_protocol::{RawEvent, ResumeToken, Timestamp};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<&'static str>>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn with(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::default(),
                batch_sizes: Mutex::default(),
            })
        }

        fn answer(&self, call: &'static str) -> bool {
            self.calls.lock().push(call);
            self.answers.lock().pop_front().unwrap_or(false)
        }
    }

    #[async_trait]
    impl EventHandler<()> for Scripted {
        async fn do_add(&self, _: &Event<()>) -> bool {
            self.answer("add")
        }
        async fn do_update(&self, _: &Event<()>) -> bool {
            self.answer("update")
        }
        async fn do_delete(&self, _: &Event<()>) -> bool {
            self.answer("delete")
        }
    }

    #[async_trait]
    impl BatchHandler<()> for Scripted {
        async fn do_batch(&self, events: &[Event<()>]) -> bool {
            self.batch_sizes.lock().push(events.len());
            self.answer("batch")
        }
    }

    fn event(raw: RawEvent) -> Event<()> {
        Event::decode(raw).0
    }

    fn token() -> ResumeToken {
        ResumeToken::new("01").unwrap()
    }

    fn retry(count: u32) -> RetryOptions {
        RetryOptions::new(count, Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn routes_by_operation_type() {
        let handler = Scripted::with(&[]);
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Single(handler.clone()),
            retry(3),
            StopSignal::never(),
        );
        let ts = Timestamp::new(1, 0);
        let events = vec![
            event(RawEvent::lister("c", "a", vec![], ts)),
            event(RawEvent::list_done("c", ts)),
            event(RawEvent::insert("c", "a", vec![], ts, token())),
            event(RawEvent::replace("c", "a", vec![], ts, token())),
            event(RawEvent::delete("c", "a", ts, token())),
        ];
        for e in &events {
            assert!(dispatcher.dispatch_one(e).await.is_acknowledged());
        }
        assert_eq!(
            *handler.calls.lock(),
            vec!["add", "add", "add", "update", "delete"]
        );

        let drop = event(RawEvent::collection_level(OperationType::Drop, "c", ts, token()));
        assert_eq!(dispatcher.dispatch_one(&drop).await, DispatchOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_handled() {
        let handler = Scripted::with(&[true, true, false]);
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Single(handler.clone()),
            retry(10),
            StopSignal::never(),
        );
        let e = event(RawEvent::insert("c", "a", vec![], Timestamp::ZERO, token()));
        let start = tokio::time::Instant::now();
        assert_eq!(
            dispatcher.dispatch_one(&e).await,
            DispatchOutcome::Handled { attempts: 3 }
        );
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_exhausts_retries() {
        let handler = Scripted::with(&[true, true, true]);
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Batch(handler.clone()),
            retry(2),
            StopSignal::never(),
        );
        let batch = vec![event(RawEvent::insert("c", "a", vec![], Timestamp::ZERO, token()))];
        assert_eq!(
            dispatcher.dispatch_batch(&batch).await,
            DispatchOutcome::Exhausted { attempts: 2 }
        );
        assert_eq!(handler.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_retry_wait() {
        let handler = Scripted::with(&[true; 10]);
        let stop = StopSignal::new();
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Single(handler.clone()),
            RetryOptions::new(10, Duration::from_secs(30)),
            stop.clone(),
        );
        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            stopper.stop();
        });
        let e = event(RawEvent::delete("c", "a", Timestamp::ZERO, token()));
        assert_eq!(
            dispatcher.dispatch_one(&e).await,
            DispatchOutcome::Stopped { attempts: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_handler_takes_batches_in_order() {
        let handler = Scripted::with(&[false, true, false]);
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Single(handler.clone()),
            retry(3),
            StopSignal::never(),
        );
        let ts = Timestamp::ZERO;
        let batch = vec![
            event(RawEvent::insert("c", "a", vec![], ts, token())),
            event(RawEvent::delete("c", "b", ts, token())),
        ];
        assert_eq!(
            dispatcher.dispatch_batch(&batch).await,
            DispatchOutcome::Handled { attempts: 3 }
        );
        assert_eq!(*handler.calls.lock(), vec!["add", "delete", "delete"]);
        assert_eq!(dispatcher.dispatch_batch(&[]).await, DispatchOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_handler_takes_single_events_as_batches_of_one() {
        let handler = Scripted::with(&[true, false]);
        let dispatcher = Dispatcher::new(
            "t",
            WatchHandler::Batch(handler.clone()),
            retry(3),
            StopSignal::never(),
        );
        let e = event(RawEvent::insert("c", "a", vec![], Timestamp::ZERO, token()));
        assert_eq!(
            dispatcher.dispatch_one(&e).await,
            DispatchOutcome::Handled { attempts: 2 }
        );
        assert_eq!(*handler.calls.lock(), vec!["batch", "batch"]);
        assert_eq!(*handler.batch_sizes.lock(), vec![1, 1]);
    }
}
