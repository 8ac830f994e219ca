//! # docwatch Engine
//!
//! Resumable list-then-watch engine over document change feeds.
//!
//! This crate provides:
//! - Option validation with defaults (`check_set_default`)
//! - The [`ChangeSource`] seam and an in-memory reference source
//! - Resume token stores (in-memory and file-backed) and a named registry
//! - The list-then-watch coordinator with checkpointing
//! - Per-event and batch dispatch with bounded, fixed-delay retry
//! - Fatal-error recovery when the stored position is lost
//! - Raw subscriptions over a bounded channel
//!
//! ## Architecture
//!
//! A watch first **lists** the collection, delivering every document as a
//! synthetic `lister` event followed by one `listerDone`, then **tails** the
//! change feed from a position captured before the listing began:
//! 1. Read the stored start point
//! 2. List (unless a token is stored)
//! 3. Tail, checkpointing after every acknowledged unit
//!
//! ## Key Invariants
//!
//! - The checkpoint never moves past an unacknowledged unit
//! - Events are delivered in feed order
//! - `listerDone` is delivered exactly once per listing, after every `lister`
//! - Nothing is written after the stop signal is observed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod dispatch;
mod error;
mod memory;
mod recovery;
mod registry;
mod source;
mod stop;
mod token;
mod watcher;

pub use config::{
    DispatchShape, ListOptions, LoopOptions, RetryOptions, WatchOptions, DEFAULT_BATCH_SIZE,
    DEFAULT_MAX_AWAIT_TIME, DEFAULT_MAX_RETRY_COUNT, DEFAULT_PAGE_SIZE, DEFAULT_RETRY_DURATION,
    MAX_AWAIT_TIME_LIMIT, MAX_BATCH_SIZE, MAX_PAGE_SIZE, MIN_BATCH_RETRY_DURATION,
    MIN_PAGE_SIZE, MIN_SINGLE_RETRY_DURATION,
};
pub use coordinator::{WatchPhase, WatchStats, MAX_CONSECUTIVE_FATAL};
pub use dispatch::{BatchHandler, DispatchOutcome, Dispatcher, EventHandler, WatchHandler};
pub use error::{WatchError, WatchResult};
pub use memory::{MemoryChangeSource, DEFAULT_MAX_HISTORY};
pub use recovery::{fatal_callback, restart_with_margin, FatalErrorCallback};
pub use registry::{RegistryUpdater, TokenStoreRegistry};
pub use source::{ChangeSource, ListCursor, ListedDocument, TailCursor};
pub use stop::StopSignal;
pub use token::{token_store_error, FileTokenStore, MemoryTokenStore, TokenStore, TokenWrite};
pub use watcher::{Subscription, Watcher, DEFAULT_CHANNEL_CAPACITY};

pub use docwatch_protocol::{
    CollectionFilter, Event, FeedPosition, FieldFilter, OperationType, Projection, RawEvent,
    ResumeToken, StartAt, StartPoint, Timestamp,
};
