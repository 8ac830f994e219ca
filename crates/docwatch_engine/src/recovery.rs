//! Fatal-error recovery.
//!
//! When the stored position has fallen out of the feed's retained history,
//! tailing cannot resume. The watch hands the last known timestamp to a
//! [`FatalErrorCallback`], which picks and persists a new starting time; the
//! watch then relists from that time.
//!
//! Without a callback the watch restarts just after the current feed head.
//! The relist rebuilds the snapshot, so nothing before the head is needed.

use crate::error::{WatchError, WatchResult};
use crate::source::ChangeSource;
use crate::token::TokenStore;
use docwatch_protocol::Timestamp;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Callback invoked once per fatal condition with the last known timestamp.
///
/// It should persist a safe new start time through the token store's
/// [`set_start_watch_time`](TokenStore::set_start_watch_time). An error ends
/// the watch.
pub type FatalErrorCallback = Arc<dyn Fn(Timestamp) -> BoxFuture<'static, WatchResult<()>> + Send + Sync>;

/// Wraps an async closure as a [`FatalErrorCallback`].
pub fn fatal_callback<F, Fut>(f: F) -> FatalErrorCallback
where
    F: Fn(Timestamp) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WatchResult<()>> + Send + 'static,
{
    Arc::new(move |ts| Box::pin(f(ts)))
}

/// A callback that restarts `margin_secs` seconds before the last known time.
///
/// Only recovers on sources whose retained history still reaches back past
/// the margin. A source that has dropped everything up to the last known
/// time reports the earlier start as lost too, and the watch gives up after
/// [`MAX_CONSECUTIVE_FATAL`](crate::MAX_CONSECUTIVE_FATAL) attempts.
pub fn restart_with_margin(store: Arc<dyn TokenStore>, margin_secs: u32) -> FatalErrorCallback {
    fatal_callback(move |ts: Timestamp| {
        let store = Arc::clone(&store);
        async move {
            store
                .set_start_watch_time(ts.saturating_sub_secs(margin_secs))
                .await
        }
    })
}

/// Runs recovery for one fatal condition.
///
/// Without a callback the start time becomes the successor of the current
/// head's cluster time.
pub(crate) async fn recover(
    name: &str,
    callback: Option<&FatalErrorCallback>,
    store: &dyn TokenStore,
    source: &dyn ChangeSource,
    last_known: Timestamp,
) -> WatchResult<()> {
    info!(watch = name, last_known = %last_known, "resume position lost, picking a new start time");
    let result = match callback {
        Some(callback) => callback(last_known).await,
        None => restart_after_head(store, source).await,
    };
    result.map_err(|e| {
        error!(watch = name, error = %e, "fatal error callback failed");
        WatchError::FatalCallback(e.to_string())
    })
}

async fn restart_after_head(store: &dyn TokenStore, source: &dyn ChangeSource) -> WatchResult<()> {
    let head = source.head().await?;
    store.set_start_watch_time(head.cluster_time.successor()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChangeSource;
    use crate::token::{MemoryTokenStore, TokenWrite};
    use serde_json::json;

    #[tokio::test]
    async fn default_recovery_starts_after_head() {
        let source = MemoryChangeSource::new();
        source.insert("hosts", json!({"_id": "a"})).unwrap();
        let head = source.head().await.unwrap();
        let store = MemoryTokenStore::new();
        recover("w", None, &store, &source, Timestamp::new(50, 2))
            .await
            .unwrap();
        assert_eq!(
            store.writes(),
            vec![TokenWrite::StartTime(head.cluster_time.successor())]
        );
    }

    #[tokio::test]
    async fn margin_callback_moves_start_back() {
        let store = Arc::new(MemoryTokenStore::new());
        let callback = restart_with_margin(store.clone(), 30);
        recover(
            "w",
            Some(&callback),
            store.as_ref(),
            &MemoryChangeSource::new(),
            Timestamp::new(100, 7),
        )
            .await
            .unwrap();
        assert_eq!(store.current().start_at_time, Some(Timestamp::new(70, 0)));
    }

    #[tokio::test]
    async fn callback_error_is_fatal() {
        let store = MemoryTokenStore::new();
        let callback = fatal_callback(|_| async { Err(WatchError::TokenStore("down".into())) });
        let err = recover("w", Some(&callback), &store, &MemoryChangeSource::new(), Timestamp::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::FatalCallback(msg) if msg.contains("down")));
        assert!(store.writes().is_empty());
    }
}
