//! Watch, list and loop options.
//!
//! Options are plain builders. Every entry point validates them with
//! `check_set_default`, which fills defaults in place and rejects impossible
//! values before any I/O happens. A rejected structure keeps its meaning:
//! defaults are applied only once every check has passed.

use crate::dispatch::WatchHandler;
use crate::error::{WatchError, WatchResult};
use crate::recovery::FatalErrorCallback;
use crate::stop::StopSignal;
use crate::token::TokenStore;
use docwatch_protocol::{
    CollectionFilter, FieldFilter, OperationType, Projection, ResumeToken, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;

/// Default time a tail poll may block waiting for changes.
pub const DEFAULT_MAX_AWAIT_TIME: Duration = Duration::from_secs(1);
/// Longest accepted tail poll wait.
pub const MAX_AWAIT_TIME_LIMIT: Duration = Duration::from_secs(3600);
/// Default listing page size.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
/// Smallest accepted listing page size.
pub const MIN_PAGE_SIZE: u32 = 200;
/// Largest accepted listing page size.
pub const MAX_PAGE_SIZE: u32 = 2000;
/// Default number of handler invocations per unit.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;
/// Default delay between handler invocations.
pub const DEFAULT_RETRY_DURATION: Duration = Duration::from_secs(1);
/// Smallest accepted retry delay for per-event handlers.
pub const MIN_SINGLE_RETRY_DURATION: Duration = Duration::from_millis(500);
/// Smallest accepted retry delay for batch handlers.
pub const MIN_BATCH_RETRY_DURATION: Duration = Duration::from_millis(200);
/// Default number of events per batch (and per tail poll).
pub const DEFAULT_BATCH_SIZE: usize = 200;
/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 2000;

/// The two consumer shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchShape {
    /// One callback per event.
    Single,
    /// One callback per ordered batch.
    Batch,
}

impl DispatchShape {
    /// Minimum retry delay accepted for this shape.
    pub fn min_retry_duration(&self) -> Duration {
        match self {
            DispatchShape::Single => MIN_SINGLE_RETRY_DURATION,
            DispatchShape::Batch => MIN_BATCH_RETRY_DURATION,
        }
    }
}

/// Options for tailing a change feed.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Collection to watch.
    pub collection: Option<String>,
    /// Collection-name filter, alternative or addition to `collection`.
    pub collection_filter: Option<CollectionFilter>,
    /// Field-level filter applied to events carrying a document.
    pub filter: FieldFilter,
    /// Field projection of delivered documents.
    pub fields: Projection,
    /// Operation types to deliver; empty delivers all.
    pub operation_types: Vec<OperationType>,
    /// Only observe majority-committed changes. Defaults to `true`.
    pub majority_commit: Option<bool>,
    /// Longest a single poll may block. Defaults to 1s.
    pub max_await_time: Option<Duration>,
    /// Start strictly after this token (raw subscriptions only).
    pub start_after_token: Option<ResumeToken>,
    /// Start no earlier than this time (raw subscriptions only).
    pub start_at_time: Option<Timestamp>,
}

impl WatchOptions {
    /// Options watching a single collection.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: Some(name.into()),
            ..Self::default()
        }
    }

    /// Options watching every collection accepted by a filter.
    pub fn collections(filter: CollectionFilter) -> Self {
        Self {
            collection_filter: Some(filter),
            ..Self::default()
        }
    }

    /// Sets the field filter.
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the projection.
    pub fn with_fields(mut self, fields: Projection) -> Self {
        self.fields = fields;
        self
    }

    /// Restricts delivered operation types.
    pub fn with_operation_types(mut self, types: impl IntoIterator<Item = OperationType>) -> Self {
        self.operation_types = types.into_iter().collect();
        self
    }

    /// Sets the poll wait.
    pub fn with_max_await_time(mut self, wait: Duration) -> Self {
        self.max_await_time = Some(wait);
        self
    }

    /// Sets majority-commit reads.
    pub fn with_majority_commit(mut self, majority: bool) -> Self {
        self.majority_commit = Some(majority);
        self
    }

    /// Starts strictly after a token.
    pub fn with_start_after_token(mut self, token: ResumeToken) -> Self {
        self.start_after_token = Some(token);
        self
    }

    /// Starts no earlier than a time.
    pub fn with_start_at_time(mut self, ts: Timestamp) -> Self {
        self.start_at_time = Some(ts);
        self
    }

    /// Returns true if an event on `collection` is in scope.
    pub fn accepts_collection(&self, collection: &str) -> bool {
        let by_name = self.collection.as_deref().map(|c| c == collection);
        let by_filter = self.collection_filter.as_ref().map(|f| f.matches(collection));
        match (by_name, by_filter) {
            (Some(a), Some(b)) => a || b,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => false,
        }
    }

    /// Returns true if the operation type is in scope.
    pub fn accepts_operation(&self, op: OperationType) -> bool {
        self.operation_types.is_empty() || self.operation_types.contains(&op)
    }

    /// The poll wait, defaulted.
    pub fn await_time(&self) -> Duration {
        self.max_await_time.unwrap_or(DEFAULT_MAX_AWAIT_TIME)
    }

    /// Validates the options, then fills defaults.
    pub fn check_set_default(&mut self) -> WatchResult<()> {
        self.validate()?;
        self.majority_commit.get_or_insert(true);
        self.max_await_time.get_or_insert(DEFAULT_MAX_AWAIT_TIME);
        Ok(())
    }

    fn validate(&self) -> WatchResult<()> {
        match (&self.collection, &self.collection_filter) {
            (None, None) => {
                return Err(WatchError::invalid(
                    "collection",
                    "a collection name or a collection filter is required",
                ))
            }
            (Some(name), _) if name.is_empty() => {
                return Err(WatchError::invalid("collection", "collection name is empty"))
            }
            (_, Some(filter)) if filter.is_empty() => {
                return Err(WatchError::invalid(
                    "collection_filter",
                    "collection filter lists no collections",
                ))
            }
            _ => {}
        }
        if let Some(wait) = self.max_await_time {
            if wait.is_zero() || wait > MAX_AWAIT_TIME_LIMIT {
                return Err(WatchError::invalid(
                    "max_await_time",
                    format!("must be within (0, {MAX_AWAIT_TIME_LIMIT:?}], got {wait:?}"),
                ));
            }
        }
        if self.start_after_token.is_some() && self.start_at_time.is_some() {
            return Err(WatchError::invalid(
                "start_at_time",
                "start_after_token and start_at_time are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Options for listing the documents of one collection.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Collection to list.
    pub collection: String,
    /// Field-level filter.
    pub filter: FieldFilter,
    /// Field projection.
    pub fields: Projection,
    /// Documents per page, within [200, 2000]. Defaults to 1000.
    pub page_size: Option<u32>,
}

impl ListOptions {
    /// Options listing a collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Sets the field filter.
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the projection.
    pub fn with_fields(mut self, fields: Projection) -> Self {
        self.fields = fields;
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// The page size, defaulted.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE) as usize
    }

    /// Validates the options, then fills defaults.
    pub fn check_set_default(&mut self) -> WatchResult<()> {
        if self.collection.is_empty() {
            return Err(WatchError::invalid("collection", "collection name is required"));
        }
        if let Some(size) = self.page_size {
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
                return Err(WatchError::invalid(
                    "page_size",
                    format!("must be within [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}], got {size}"),
                ));
            }
        }
        self.page_size.get_or_insert(DEFAULT_PAGE_SIZE);
        Ok(())
    }
}

/// Retry policy for handler callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum invocations of a callback for one unit. Zero means default.
    pub max_retry_count: u32,
    /// Delay between invocations. Zero means default.
    pub retry_duration: Duration,
}

impl RetryOptions {
    /// Creates a retry policy.
    pub fn new(max_retry_count: u32, retry_duration: Duration) -> Self {
        Self {
            max_retry_count,
            retry_duration,
        }
    }

    fn validate(&self, shape: DispatchShape) -> WatchResult<()> {
        let floor = shape.min_retry_duration();
        if !self.retry_duration.is_zero() && self.retry_duration < floor {
            return Err(WatchError::invalid(
                "retry_duration",
                format!("must be at least {floor:?}, got {:?}", self.retry_duration),
            ));
        }
        Ok(())
    }

    fn set_default(&mut self) {
        if self.max_retry_count == 0 {
            self.max_retry_count = DEFAULT_MAX_RETRY_COUNT;
        }
        if self.retry_duration.is_zero() {
            self.retry_duration = DEFAULT_RETRY_DURATION;
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRY_COUNT, DEFAULT_RETRY_DURATION)
    }
}

/// Options for a long-running, checkpointed watch loop.
pub struct LoopOptions<T: Send + Sync> {
    /// Name of the watch, used in logs.
    pub name: String,
    /// What to watch.
    pub watch: WatchOptions,
    /// Where checkpoints live.
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Consumer of the events.
    pub handler: Option<WatchHandler<T>>,
    /// Retry policy; `None` uses the defaults.
    pub retry: Option<RetryOptions>,
    /// Events per batch and per poll.
    pub batch_size: Option<usize>,
    /// Listing page size.
    pub page_size: Option<u32>,
    /// Stop signal; `None` runs until a fatal error.
    pub stop: Option<StopSignal>,
    /// Picks a new start time when the stored position is lost.
    pub fatal_callback: Option<FatalErrorCallback>,
    /// Run the reconciliation listing when no token is stored.
    pub list_first: bool,
}

impl<T: Send + Sync> LoopOptions<T> {
    /// Creates loop options.
    pub fn new(name: impl Into<String>, watch: WatchOptions) -> Self {
        Self {
            name: name.into(),
            watch,
            token_store: None,
            handler: None,
            retry: None,
            batch_size: None,
            page_size: None,
            stop: None,
            fatal_callback: None,
            list_first: true,
        }
    }

    /// Sets the token store.
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Sets the handler.
    pub fn with_handler(mut self, handler: WatchHandler<T>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the listing page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Sets the stop signal.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Sets the fatal-error callback.
    pub fn with_fatal_callback(mut self, callback: FatalErrorCallback) -> Self {
        self.fatal_callback = Some(callback);
        self
    }

    /// Skips the reconciliation listing: tail from the stored position or
    /// the feed head.
    pub fn without_listing(mut self) -> Self {
        self.list_first = false;
        self
    }

    /// Listing options derived from the watch options.
    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            collection: self.watch.collection.clone().unwrap_or_default(),
            filter: self.watch.filter.clone(),
            fields: self.watch.fields.clone(),
            page_size: self.page_size,
        }
    }

    /// Validates the options for `shape`, then fills defaults.
    pub fn check_set_default(&mut self, shape: DispatchShape) -> WatchResult<()> {
        self.validate(shape)?;

        self.watch.check_set_default()?;
        let mut retry = self.retry.unwrap_or_default();
        retry.set_default();
        self.retry = Some(retry);
        self.batch_size.get_or_insert(DEFAULT_BATCH_SIZE);
        self.page_size.get_or_insert(DEFAULT_PAGE_SIZE);
        self.stop.get_or_insert_with(StopSignal::never);
        Ok(())
    }

    fn validate(&self, shape: DispatchShape) -> WatchResult<()> {
        if self.name.is_empty() {
            return Err(WatchError::invalid("name", "watch name is required"));
        }
        if self.token_store.is_none() {
            return Err(WatchError::invalid("token_store", "a token store is required"));
        }
        match &self.handler {
            None => return Err(WatchError::invalid("handler", "a handler is required")),
            Some(handler) if handler.shape() != shape => {
                return Err(WatchError::invalid(
                    "handler",
                    format!("expected a {shape:?} handler, got {:?}", handler.shape()),
                ))
            }
            Some(_) => {}
        }
        if let Some(retry) = &self.retry {
            retry.validate(shape)?;
        }
        if let Some(size) = self.batch_size {
            if size == 0 || size > MAX_BATCH_SIZE {
                return Err(WatchError::invalid(
                    "batch_size",
                    format!("must be within [1, {MAX_BATCH_SIZE}], got {size}"),
                ));
            }
        }
        if self.list_first {
            let mut list = self.list_options();
            if list.collection.is_empty() {
                return Err(WatchError::invalid(
                    "collection",
                    "listing requires a collection name; use without_listing() for filters",
                ));
            }
            list.check_set_default()?;
        }
        let mut watch = self.watch.clone();
        watch.check_set_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BatchHandler, EventHandler};
    use crate::token::MemoryTokenStore;
    use async_trait::async_trait;
    use docwatch_protocol::Event;

    struct Noop;

    #[async_trait]
    impl EventHandler<()> for Noop {
        async fn do_add(&self, _: &Event<()>) -> bool {
            false
        }
        async fn do_update(&self, _: &Event<()>) -> bool {
            false
        }
        async fn do_delete(&self, _: &Event<()>) -> bool {
            false
        }
    }

    #[async_trait]
    impl BatchHandler<()> for Noop {
        async fn do_batch(&self, _: &[Event<()>]) -> bool {
            false
        }
    }

    fn loop_opts(handler: WatchHandler<()>) -> LoopOptions<()> {
        LoopOptions::new("hosts-sync", WatchOptions::collection("hosts"))
            .with_token_store(Arc::new(MemoryTokenStore::new()))
            .with_handler(handler)
    }

    #[test]
    fn watch_defaults() {
        let mut opts = WatchOptions::collection("hosts");
        opts.check_set_default().unwrap();
        assert_eq!(opts.majority_commit, Some(true));
        assert_eq!(opts.max_await_time, Some(Duration::from_secs(1)));
    }

    #[test]
    fn watch_requires_collection_or_filter() {
        let mut opts = WatchOptions::default();
        assert!(matches!(
            opts.check_set_default(),
            Err(WatchError::InvalidOptions { field: "collection", .. })
        ));
        assert!(opts.majority_commit.is_none());

        let mut opts = WatchOptions::collections(CollectionFilter::pattern("^cc_").unwrap());
        opts.check_set_default().unwrap();
        assert!(opts.accepts_collection("cc_hosts"));
        assert!(!opts.accepts_collection("hosts"));
    }

    #[test]
    fn watch_rejects_conflicting_start() {
        let mut opts = WatchOptions::collection("hosts")
            .with_start_after_token(ResumeToken::new("01").unwrap())
            .with_start_at_time(Timestamp::new(1, 0));
        assert!(opts.check_set_default().is_err());
    }

    #[test]
    fn watch_rejects_zero_await() {
        let mut opts = WatchOptions::collection("hosts").with_max_await_time(Duration::ZERO);
        assert!(opts.check_set_default().is_err());
    }

    #[test]
    fn list_page_size_bounds() {
        let mut opts = ListOptions::new("hosts");
        opts.check_set_default().unwrap();
        assert_eq!(opts.page_size, Some(1000));

        for bad in [0, 199, 2001] {
            let mut opts = ListOptions::new("hosts").with_page_size(bad);
            assert!(opts.check_set_default().is_err(), "page size {bad}");
            assert_eq!(opts.page_size, Some(bad));
        }
        for good in [200, 2000] {
            ListOptions::new("hosts")
                .with_page_size(good)
                .check_set_default()
                .unwrap();
        }
        assert!(ListOptions::new("").check_set_default().is_err());
    }

    #[test]
    fn loop_defaults_when_retry_omitted() {
        let mut opts = loop_opts(WatchHandler::single(Noop));
        opts.check_set_default(DispatchShape::Single).unwrap();
        assert_eq!(opts.retry, Some(RetryOptions::new(10, Duration::from_secs(1))));
        assert_eq!(opts.batch_size, Some(DEFAULT_BATCH_SIZE));
        assert!(opts.stop.as_ref().is_some_and(|s| !s.is_stopped()));
        assert_eq!(opts.watch.max_await_time, Some(DEFAULT_MAX_AWAIT_TIME));
    }

    #[test]
    fn loop_defaults_only_zero_retry_fields() {
        let mut opts = loop_opts(WatchHandler::single(Noop))
            .with_retry(RetryOptions::new(3, Duration::ZERO));
        opts.check_set_default(DispatchShape::Single).unwrap();
        assert_eq!(opts.retry, Some(RetryOptions::new(3, Duration::from_secs(1))));

        let mut opts = loop_opts(WatchHandler::single(Noop))
            .with_retry(RetryOptions::new(0, Duration::from_millis(700)));
        opts.check_set_default(DispatchShape::Single).unwrap();
        assert_eq!(opts.retry, Some(RetryOptions::new(10, Duration::from_millis(700))));
    }

    #[test]
    fn retry_floor_per_shape() {
        let mut opts = loop_opts(WatchHandler::single(Noop))
            .with_retry(RetryOptions::new(3, Duration::from_millis(499)));
        assert!(opts.check_set_default(DispatchShape::Single).is_err());
        assert_eq!(
            opts.retry,
            Some(RetryOptions::new(3, Duration::from_millis(499)))
        );

        let mut opts = loop_opts(WatchHandler::batch(Noop))
            .with_retry(RetryOptions::new(3, Duration::from_millis(199)));
        assert!(opts.check_set_default(DispatchShape::Batch).is_err());

        let mut opts = loop_opts(WatchHandler::batch(Noop))
            .with_retry(RetryOptions::new(3, Duration::from_millis(200)));
        opts.check_set_default(DispatchShape::Batch).unwrap();
    }

    #[test]
    fn loop_requires_matching_handler() {
        let mut opts = loop_opts(WatchHandler::batch(Noop));
        let err = opts.check_set_default(DispatchShape::Single).unwrap_err();
        assert!(matches!(err, WatchError::InvalidOptions { field: "handler", .. }));

        let mut opts: LoopOptions<()> = LoopOptions::new("w", WatchOptions::collection("hosts"))
            .with_token_store(Arc::new(MemoryTokenStore::new()));
        assert!(opts.check_set_default(DispatchShape::Single).is_err());
    }

    #[test]
    fn loop_requires_name_and_store() {
        let mut opts = loop_opts(WatchHandler::single(Noop));
        opts.name.clear();
        assert!(opts.check_set_default(DispatchShape::Single).is_err());

        let mut opts = loop_opts(WatchHandler::single(Noop));
        opts.token_store = None;
        assert!(matches!(
            opts.check_set_default(DispatchShape::Single),
            Err(WatchError::InvalidOptions { field: "token_store", .. })
        ));
    }

    #[test]
    fn listing_needs_collection_name() {
        let filter = CollectionFilter::Names(vec!["hosts".into()]);
        let mut opts: LoopOptions<()> = LoopOptions::new("w", WatchOptions::collections(filter))
            .with_token_store(Arc::new(MemoryTokenStore::new()))
            .with_handler(WatchHandler::single(Noop));
        assert!(opts.check_set_default(DispatchShape::Single).is_err());

        let mut opts = opts.without_listing();
        opts.check_set_default(DispatchShape::Single).unwrap();
    }

    #[test]
    fn batch_size_bounds() {
        let mut opts = loop_opts(WatchHandler::batch(Noop)).with_batch_size(0);
        assert!(opts.check_set_default(DispatchShape::Batch).is_err());
        let mut opts = loop_opts(WatchHandler::batch(Noop)).with_batch_size(2001);
        assert!(opts.check_set_default(DispatchShape::Batch).is_err());
        let mut opts = loop_opts(WatchHandler::batch(Noop)).with_batch_size(50);
        opts.check_set_default(DispatchShape::Batch).unwrap();
        assert_eq!(opts.batch_size, Some(50));
    }
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn page_size_accepted_iff_in_range(size in 0u32..5000) {
            let mut opts = ListOptions::new("hosts").with_page_size(size);
            let ok = opts.check_set_default().is_ok();
            prop_assert_eq!(ok, (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size));
            prop_assert_eq!(opts.page_size, Some(size));
        }

        #[test]
        fn retry_floor_holds(millis in 0u64..3000, count in 0u32..20, batch in any::<bool>()) {
            let shape = if batch { DispatchShape::Batch } else { DispatchShape::Single };
            let mut retry = RetryOptions::new(count, Duration::from_millis(millis));
            let result = retry.validate(shape);
            let floor = shape.min_retry_duration();
            prop_assert_eq!(
                result.is_ok(),
                millis == 0 || Duration::from_millis(millis) >= floor
            );
            if result.is_ok() {
                retry.set_default();
                prop_assert!(retry.max_retry_count >= 1);
                prop_assert!(retry.retry_duration >= floor);
                if count != 0 {
                    prop_assert_eq!(retry.max_retry_count, count);
                }
            }
        }
    }
}
