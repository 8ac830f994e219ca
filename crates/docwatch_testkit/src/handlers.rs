//! Recording handlers.
//!
//! [`RecordingHandler`] implements both handler shapes. It records every
//! invocation and answers from a script: `true` asks for a retry, and an
//! exhausted script answers `false` (handled).

use async_trait::async_trait;
use docwatch_engine::{BatchHandler, EventHandler, WatchHandler};
use docwatch_protocol::{Event, OperationType};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Which callback was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `do_add`.
    Add,
    /// `do_update`.
    Update,
    /// `do_delete`.
    Delete,
    /// `do_batch`.
    Batch,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Call<T> {
    /// Callback invoked.
    pub kind: CallKind,
    /// Events passed, in order.
    pub events: Vec<Event<T>>,
    /// What the handler answered (`true` = retry).
    pub retried: bool,
}

/// A handler recording every invocation.
pub struct RecordingHandler<T> {
    script: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<Call<T>>>,
}

impl<T: Clone + Send + Sync + 'static> RecordingHandler<T> {
    /// A handler accepting everything.
    pub fn new() -> Arc<Self> {
        Self::scripted(std::iter::empty())
    }

    /// A handler answering invocations from `answers` in order.
    pub fn scripted(answers: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(answers.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A handler asking for a retry on its first `n` invocations.
    pub fn retrying(n: usize) -> Arc<Self> {
        Self::scripted(std::iter::repeat(true).take(n))
    }

    /// Queues more answers.
    pub fn push_answers(&self, answers: impl IntoIterator<Item = bool>) {
        self.script.lock().extend(answers);
    }

    /// As a per-event watch handler.
    pub fn single(self: &Arc<Self>) -> WatchHandler<T> {
        WatchHandler::Single(Arc::clone(self) as Arc<dyn EventHandler<T>>)
    }

    /// As a batch watch handler.
    pub fn batch(self: &Arc<Self>) -> WatchHandler<T> {
        WatchHandler::Batch(Arc::clone(self) as Arc<dyn BatchHandler<T>>)
    }

    /// Every invocation so far.
    pub fn calls(&self) -> Vec<Call<T>> {
        self.calls.lock().clone()
    }

    /// Number of invocations.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Events of accepted invocations, flattened in order.
    pub fn accepted(&self) -> Vec<Event<T>> {
        self.calls
            .lock()
            .iter()
            .filter(|c| !c.retried)
            .flat_map(|c| c.events.iter().cloned())
            .collect()
    }

    /// Operation types of accepted events, in order.
    pub fn ops(&self) -> Vec<OperationType> {
        self.accepted().iter().map(|e| e.operation_type).collect()
    }

    /// Document ids of accepted events, in order.
    pub fn ids(&self) -> Vec<String> {
        self.accepted()
            .into_iter()
            .map(|e| e.document_id)
            .collect()
    }

    fn answer(&self, kind: CallKind, events: &[Event<T>]) -> bool {
        let retried = self.script.lock().pop_front().unwrap_or(false);
        self.calls.lock().push(Call {
            kind,
            events: events.to_vec(),
            retried,
        });
        retried
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EventHandler<T> for RecordingHandler<T> {
    async fn do_add(&self, event: &Event<T>) -> bool {
        self.answer(CallKind::Add, std::slice::from_ref(event))
    }

    async fn do_update(&self, event: &Event<T>) -> bool {
        self.answer(CallKind::Update, std::slice::from_ref(event))
    }

    async fn do_delete(&self, event: &Event<T>) -> bool {
        self.answer(CallKind::Delete, std::slice::from_ref(event))
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BatchHandler<T> for RecordingHandler<T> {
    async fn do_batch(&self, events: &[Event<T>]) -> bool {
        self.answer(CallKind::Batch, events)
    }
}
