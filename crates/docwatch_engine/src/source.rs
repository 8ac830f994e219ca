//! Change source abstraction.
//!
//! A change source is the document store seen from the watch engine: a way to
//! page through the current contents of a collection, and an ordered,
//! resumable feed of changes. The engine never talks to a store directly.

use crate::config::{ListOptions, WatchOptions};
use crate::error::WatchResult;
use async_trait::async_trait;
use docwatch_protocol::{FeedPosition, RawEvent, StartAt};
use std::time::Duration;

/// One document returned by a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedDocument {
    /// Identity of the document.
    pub document_id: String,
    /// Collection owning the document.
    pub collection: String,
    /// Encoded snapshot, projection applied.
    pub document_raw: Vec<u8>,
}

/// Paged scan over the current contents of a collection.
#[async_trait]
pub trait ListCursor: Send {
    /// Next page, ordered by document id. `None` once exhausted.
    async fn next_page(&mut self) -> WatchResult<Option<Vec<ListedDocument>>>;
}

/// Open, resumable position in the change feed.
#[async_trait]
pub trait TailCursor: Send {
    /// Returns up to `max_events` ordered events.
    ///
    /// Waits at most `max_await` for the first one; an empty result means no
    /// change arrived in time.
    async fn next_batch(
        &mut self,
        max_events: usize,
        max_await: Duration,
    ) -> WatchResult<Vec<RawEvent>>;
}

/// A document store with a change feed.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Current end of the feed.
    ///
    /// Tailing from the returned token yields exactly the changes committed
    /// after this call.
    async fn head(&self) -> WatchResult<FeedPosition>;

    /// Starts a paged listing. `options` must already be validated.
    async fn list(&self, options: &ListOptions) -> WatchResult<Box<dyn ListCursor>>;

    /// Opens a tail cursor. `options` must already be validated.
    ///
    /// Fails with [`WatchError::HistoryLost`](crate::WatchError::HistoryLost)
    /// if `start` is no longer covered by the retained history.
    async fn tail(&self, options: &WatchOptions, start: &StartAt)
        -> WatchResult<Box<dyn TailCursor>>;
}
