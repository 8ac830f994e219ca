//! In-memory change source.
//!
//! Collections of JSON documents plus an ordered, bounded history of every
//! committed change. Tokens are the zero-padded hex sequence number of the
//! change; cluster times come from a clock that never goes backwards.
//!
//! Used by tests and the CLI, and as the reference for what a
//! [`ChangeSource`] adapter must provide.

use crate::config::{ListOptions, WatchOptions};
use crate::error::{WatchError, WatchResult};
use crate::source::{ChangeSource, ListCursor, ListedDocument, TailCursor};
use async_trait::async_trait;
use docwatch_protocol::{
    document_id, encode_document, ChangeDescription, FeedPosition, FieldFilter, OperationType,
    Projection, RawEvent, ResumeToken, StartAt, Timestamp, ID_FIELD,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::debug;

/// Default number of retained history entries.
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

#[derive(Debug, Clone)]
struct HistoryEntry {
    seq: u64,
    operation_type: OperationType,
    collection: String,
    document_id: String,
    document: Option<Value>,
    change_description: Option<ChangeDescription>,
    rename_to: Option<String>,
    cluster_time: Timestamp,
}

#[derive(Debug)]
struct FeedState {
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    history: VecDeque<HistoryEntry>,
    last_seq: u64,
    /// Every sequence number up to this one has been dropped.
    truncated_through: u64,
    /// Cluster time of the newest dropped entry.
    truncated_time: Option<Timestamp>,
    clock: Timestamp,
    max_history: usize,
}

impl FeedState {
    fn tick(&mut self) -> Timestamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0);
        self.clock = if now > self.clock.seconds {
            Timestamp::new(now, 1)
        } else {
            Timestamp::new(self.clock.seconds, self.clock.ordinal.saturating_add(1))
        };
        self.clock
    }

    fn record(
        &mut self,
        operation_type: OperationType,
        collection: &str,
        document_id: &str,
        document: Option<Value>,
    ) -> &mut HistoryEntry {
        self.last_seq += 1;
        let cluster_time = self.tick();
        self.history.push_back(HistoryEntry {
            seq: self.last_seq,
            operation_type,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            document,
            change_description: None,
            rename_to: None,
            cluster_time,
        });
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.drop_oldest(excess);
        }
        // Just pushed, so the history is not empty.
        let last = self.history.len() - 1;
        &mut self.history[last]
    }

    fn drop_oldest(&mut self, count: usize) {
        for _ in 0..count {
            let Some(entry) = self.history.pop_front() else {
                break;
            };
            self.truncated_through = entry.seq;
            self.truncated_time = Some(entry.cluster_time);
        }
    }

    fn documents_mut(&mut self, collection: &str) -> &mut BTreeMap<String, Value> {
        self.collections.entry(collection.to_string()).or_default()
    }

    fn existing_mut(&mut self, collection: &str, id: &str) -> WatchResult<&mut Value> {
        self.collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| {
                WatchError::invalid("document_id", format!("no document {id} in {collection}"))
            })
    }

    /// Sequence number after which a tail starting at `start` reads.
    fn resolve(&self, start: &StartAt) -> WatchResult<u64> {
        match start {
            StartAt::Token(token) => {
                let seq = parse_token(token)?;
                if seq > self.last_seq {
                    return Err(WatchError::source_fatal(format!(
                        "resume token {token} is ahead of the feed"
                    )));
                }
                if seq < self.truncated_through {
                    return Err(WatchError::HistoryLost(format!(
                        "token {token} is older than the retained history"
                    )));
                }
                Ok(seq)
            }
            StartAt::Time(ts) => {
                if self.truncated_time.is_some_and(|lost| *ts <= lost) {
                    return Err(WatchError::HistoryLost(format!(
                        "time {ts} is older than the retained history"
                    )));
                }
                Ok(self
                    .history
                    .iter()
                    .take_while(|e| e.cluster_time < *ts)
                    .last()
                    .map(|e| e.seq)
                    .unwrap_or(self.truncated_through))
            }
        }
    }
}

fn token_for(seq: u64) -> WatchResult<ResumeToken> {
    Ok(ResumeToken::new(format!("{seq:016x}"))?)
}

fn parse_token(token: &ResumeToken) -> WatchResult<u64> {
    u64::from_str_radix(token.as_str(), 16)
        .map_err(|_| WatchError::source_fatal(format!("malformed resume token {token}")))
}

#[derive(Debug)]
struct Shared {
    state: Mutex<FeedState>,
    notify: Notify,
}

/// An in-memory document store with a change feed.
///
/// Clones share the same store.
#[derive(Debug, Clone)]
pub struct MemoryChangeSource {
    shared: Arc<Shared>,
}

impl Default for MemoryChangeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChangeSource {
    /// Creates an empty store with the default history bound.
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store retaining at most `max_history` changes.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FeedState {
                    collections: BTreeMap::new(),
                    history: VecDeque::new(),
                    last_seq: 0,
                    truncated_through: 0,
                    truncated_time: None,
                    clock: Timestamp::ZERO,
                    max_history: max_history.max(1),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn commit<R>(&self, f: impl FnOnce(&mut FeedState) -> WatchResult<R>) -> WatchResult<R> {
        let result = f(&mut self.shared.state.lock())?;
        self.shared.notify.notify_waiters();
        Ok(result)
    }

    /// Inserts a document, assigning a random `_id` if it has none.
    ///
    /// Returns the document id.
    pub fn insert(&self, collection: &str, document: Value) -> WatchResult<String> {
        let existing_id = document_id(&document);
        let Value::Object(mut map) = document else {
            return Err(WatchError::invalid("document", "documents must be JSON objects"));
        };
        let id = match existing_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                map.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };
        let document = Value::Object(map);
        self.commit(|state| {
            let docs = state.documents_mut(collection);
            if docs.contains_key(&id) {
                return Err(WatchError::invalid(
                    "document",
                    format!("duplicate {ID_FIELD} {id} in {collection}"),
                ));
            }
            docs.insert(id.clone(), document.clone());
            state.record(OperationType::Insert, collection, &id, Some(document));
            Ok(id.clone())
        })
    }

    /// Sets and removes top-level fields of an existing document.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        set: Map<String, Value>,
        unset: Vec<String>,
    ) -> WatchResult<()> {
        self.commit(|state| {
            let doc = state.existing_mut(collection, id)?;
            if let Value::Object(map) = doc {
                for (key, value) in &set {
                    if key != ID_FIELD {
                        map.insert(key.clone(), value.clone());
                    }
                }
                for key in &unset {
                    if key != ID_FIELD {
                        map.remove(key);
                    }
                }
            }
            let post_image = doc.clone();
            let entry = state.record(OperationType::Update, collection, id, Some(post_image));
            entry.change_description = Some(ChangeDescription {
                updated_fields: set,
                removed_fields: unset,
            });
            Ok(())
        })
    }

    /// Replaces an existing document, keeping its `_id`.
    pub fn replace(&self, collection: &str, id: &str, document: Value) -> WatchResult<()> {
        let Value::Object(mut map) = document else {
            return Err(WatchError::invalid("document", "documents must be JSON objects"));
        };
        map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        let document = Value::Object(map);
        self.commit(|state| {
            *state.existing_mut(collection, id)? = document.clone();
            state.record(OperationType::Replace, collection, id, Some(document));
            Ok(())
        })
    }

    /// Deletes a document.
    pub fn delete(&self, collection: &str, id: &str) -> WatchResult<()> {
        self.commit(|state| {
            state.existing_mut(collection, id)?;
            state.documents_mut(collection).remove(id);
            state.record(OperationType::Delete, collection, id, None);
            Ok(())
        })
    }

    /// Drops a collection and all its documents.
    pub fn drop_collection(&self, collection: &str) -> WatchResult<()> {
        self.commit(|state| {
            state.collections.remove(collection);
            state.record(OperationType::Drop, collection, "", None);
            Ok(())
        })
    }

    /// Renames a collection.
    pub fn rename_collection(&self, from: &str, to: &str) -> WatchResult<()> {
        self.commit(|state| {
            let docs = state.collections.remove(from).unwrap_or_default();
            state.collections.insert(to.to_string(), docs);
            let entry = state.record(OperationType::Rename, from, "", None);
            entry.rename_to = Some(to.to_string());
            Ok(())
        })
    }

    /// Drops every collection. Emits `dropDatabase` followed by `invalidate`.
    pub fn drop_database(&self) -> WatchResult<()> {
        self.commit(|state| {
            state.collections.clear();
            state.record(OperationType::DropDatabase, "", "", None);
            state.record(OperationType::Invalidate, "", "", None);
            Ok(())
        })
    }

    /// Returns a document by id.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.shared
            .state
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.shared
            .state
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Sequence number of the newest change.
    pub fn last_sequence(&self) -> u64 {
        self.shared.state.lock().last_seq
    }

    /// Number of retained history entries.
    pub fn history_len(&self) -> usize {
        self.shared.state.lock().history.len()
    }

    /// Drops every history entry up to and including `seq`.
    ///
    /// Cursors positioned before `seq` fail with `HistoryLost` on their next
    /// poll.
    pub fn truncate_history(&self, seq: u64) {
        let mut state = self.shared.state.lock();
        let count = state.history.iter().take_while(|e| e.seq <= seq).count();
        state.drop_oldest(count);
        debug!(through = seq, dropped = count, "history truncated");
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn head(&self) -> WatchResult<FeedPosition> {
        let state = self.shared.state.lock();
        Ok(FeedPosition {
            token: token_for(state.last_seq)?,
            cluster_time: state.clock,
        })
    }

    async fn list(&self, options: &ListOptions) -> WatchResult<Box<dyn ListCursor>> {
        Ok(Box::new(MemoryListCursor {
            shared: Arc::clone(&self.shared),
            collection: options.collection.clone(),
            filter: options.filter.clone(),
            fields: options.fields.clone(),
            page_size: options.effective_page_size(),
            last_id: None,
            done: false,
        }))
    }

    async fn tail(
        &self,
        options: &WatchOptions,
        start: &StartAt,
    ) -> WatchResult<Box<dyn TailCursor>> {
        let after = self.shared.state.lock().resolve(start)?;
        debug!(%start, after, "tail cursor opened");
        Ok(Box::new(MemoryTailCursor {
            shared: Arc::clone(&self.shared),
            options: options.clone(),
            after,
        }))
    }
}

struct MemoryListCursor {
    shared: Arc<Shared>,
    collection: String,
    filter: FieldFilter,
    fields: Projection,
    page_size: usize,
    last_id: Option<String>,
    done: bool,
}

#[async_trait]
impl ListCursor for MemoryListCursor {
    async fn next_page(&mut self) -> WatchResult<Option<Vec<ListedDocument>>> {
        if self.done {
            return Ok(None);
        }
        let selected: Vec<(String, Value)> = {
            let state = self.shared.state.lock();
            let Some(docs) = state.collections.get(&self.collection) else {
                self.done = true;
                return Ok(None);
            };
            let lower = match &self.last_id {
                Some(id) => Bound::Excluded(id.clone()),
                None => Bound::Unbounded,
            };
            docs.range::<String, _>((lower, Bound::Unbounded))
                .filter(|(_, doc)| self.filter.matches(doc))
                .take(self.page_size)
                .map(|(id, doc)| (id.clone(), self.fields.apply(doc)))
                .collect()
        };
        if selected.len() < self.page_size {
            self.done = true;
        }
        if selected.is_empty() {
            return Ok(None);
        }
        self.last_id = selected.last().map(|(id, _)| id.clone());
        let page = selected
            .into_iter()
            .map(|(document_id, doc)| {
                Ok(ListedDocument {
                    document_id,
                    collection: self.collection.clone(),
                    document_raw: encode_document(&doc)?,
                })
            })
            .collect::<WatchResult<Vec<_>>>()?;
        Ok(Some(page))
    }
}

struct MemoryTailCursor {
    shared: Arc<Shared>,
    options: WatchOptions,
    after: u64,
}

impl MemoryTailCursor {
    fn accepts(&self, entry: &HistoryEntry) -> bool {
        let database_level = matches!(
            entry.operation_type,
            OperationType::DropDatabase | OperationType::Invalidate
        );
        if !database_level && !self.options.accepts_collection(&entry.collection) {
            return false;
        }
        if !self.options.accepts_operation(entry.operation_type) {
            return false;
        }
        entry
            .document
            .as_ref()
            .map_or(true, |doc| self.options.filter.matches(doc))
    }

    fn to_raw(&self, entry: &HistoryEntry) -> WatchResult<RawEvent> {
        let document_raw = entry
            .document
            .as_ref()
            .map(|doc| encode_document(&self.options.fields.apply(doc)))
            .transpose()?;
        Ok(RawEvent {
            document_id: entry.document_id.clone(),
            operation_type: entry.operation_type,
            collection: entry.collection.clone(),
            cluster_time: entry.cluster_time,
            token: Some(token_for(entry.seq)?),
            document_raw,
            change_description: entry.change_description.clone(),
            rename_to: entry.rename_to.clone(),
        })
    }

    fn take_ready(&mut self, max_events: usize) -> WatchResult<Vec<RawEvent>> {
        let state = self.shared.state.lock();
        if self.after < state.truncated_through {
            return Err(WatchError::HistoryLost(format!(
                "changes after sequence {} were dropped",
                self.after
            )));
        }
        let mut events = Vec::new();
        let after = self.after;
        for entry in state.history.iter().filter(|e| e.seq > after) {
            if events.len() >= max_events {
                break;
            }
            self.after = entry.seq;
            if self.accepts(entry) {
                events.push(self.to_raw(entry)?);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl TailCursor for MemoryTailCursor {
    async fn next_batch(
        &mut self,
        max_events: usize,
        max_await: Duration,
    ) -> WatchResult<Vec<RawEvent>> {
        let deadline = tokio::time::Instant::now() + max_await;
        let max_events = max_events.max(1);
        loop {
            let shared = Arc::clone(&self.shared);
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.take_ready(max_events)?;
            if !events.is_empty() {
                return Ok(events);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwatch_protocol::decode_document;
    use serde_json::json;

    fn watch(collection: &str) -> WatchOptions {
        let mut opts = WatchOptions::collection(collection);
        opts.check_set_default().unwrap();
        opts
    }

    fn ops(events: &[RawEvent]) -> Vec<OperationType> {
        events.iter().map(|e| e.operation_type).collect()
    }

    #[tokio::test]
    async fn list_pages_in_id_order() {
        let source = MemoryChangeSource::new();
        for id in ["c", "a", "b", "e", "d"] {
            source.insert("hosts", json!({"_id": id, "n": 1})).unwrap();
        }
        let mut opts = ListOptions::new("hosts").with_page_size(200);
        opts.check_set_default().unwrap();
        opts.page_size = Some(2);

        let mut cursor = source.list(&opts).await.unwrap();
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            pages.push(page.into_iter().map(|d| d.document_id).collect::<Vec<_>>());
        }
        assert_eq!(pages, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
    }

    #[tokio::test]
    async fn list_applies_filter_and_projection() {
        let source = MemoryChangeSource::new();
        source
            .insert("hosts", json!({"_id": "h1", "os": "linux", "ip": "10.0.0.1"}))
            .unwrap();
        source
            .insert("hosts", json!({"_id": "h2", "os": "bsd", "ip": "10.0.0.2"}))
            .unwrap();
        let opts = ListOptions::new("hosts")
            .with_filter(FieldFilter::any().equals("os", "linux"))
            .with_fields(Projection::fields(["ip"]));

        let mut cursor = source.list(&opts).await.unwrap();
        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
        let doc: Value = decode_document(&page[0].document_raw).unwrap();
        assert_eq!(doc, json!({"_id": "h1", "ip": "10.0.0.1"}));
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tail_from_head_sees_only_later_changes() {
        let source = MemoryChangeSource::new();
        source.insert("hosts", json!({"_id": "old"})).unwrap();
        let head = source.head().await.unwrap();
        source.insert("hosts", json!({"_id": "new"})).unwrap();
        source.insert("other", json!({"_id": "x"})).unwrap();

        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(head.token))
            .await
            .unwrap();
        let events = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].document_id, "new");
        assert_eq!(events[0].token.as_ref().unwrap().as_str(), "0000000000000002");
    }

    #[tokio::test]
    async fn tokens_and_times_increase() {
        let source = MemoryChangeSource::new();
        let start = source.head().await.unwrap();
        let id = source.insert("hosts", json!({"n": 1})).unwrap();
        let mut set = Map::new();
        set.insert("n".into(), json!(2));
        source.update("hosts", &id, set, vec![]).unwrap();
        source.delete("hosts", &id).unwrap();

        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(start.token))
            .await
            .unwrap();
        let events = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            ops(&events),
            vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
        );
        assert!(events.windows(2).all(|w| w[0].cluster_time < w[1].cluster_time));
        let update = &events[1];
        assert_eq!(
            update.change_description.as_ref().unwrap().updated_fields["n"],
            json!(2)
        );
        assert!(events[2].document_raw.is_none());
    }

    #[tokio::test]
    async fn tail_respects_max_events() {
        let source = MemoryChangeSource::new();
        let start = source.head().await.unwrap();
        for i in 0..5 {
            source.insert("hosts", json!({"_id": format!("h{i}")})).unwrap();
        }
        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(start.token))
            .await
            .unwrap();
        let first = cursor.next_batch(3, Duration::from_millis(10)).await.unwrap();
        let second = cursor.next_batch(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tail_waits_up_to_max_await() {
        let source = MemoryChangeSource::new();
        let head = source.head().await.unwrap();
        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(head.token))
            .await
            .unwrap();
        let start = tokio::time::Instant::now();
        let events = cursor.next_batch(10, Duration::from_secs(2)).await.unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn tail_wakes_on_write() {
        let source = MemoryChangeSource::new();
        let head = source.head().await.unwrap();
        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(head.token))
            .await
            .unwrap();
        let writer = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert("hosts", json!({"_id": "late"})).unwrap();
        });
        let events = cursor.next_batch(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(events[0].document_id, "late");
    }

    #[tokio::test]
    async fn collection_events() {
        let source = MemoryChangeSource::new();
        let head = source.head().await.unwrap();
        source.insert("hosts", json!({"_id": "a"})).unwrap();
        source.rename_collection("hosts", "machines").unwrap();
        source.drop_collection("machines").unwrap();
        source.drop_database().unwrap();

        let mut opts = WatchOptions::collections(docwatch_protocol::CollectionFilter::Names(vec![
            "hosts".into(),
            "machines".into(),
        ]));
        opts.check_set_default().unwrap();
        let mut cursor = source.tail(&opts, &StartAt::Token(head.token)).await.unwrap();
        let events = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            ops(&events),
            vec![
                OperationType::Insert,
                OperationType::Rename,
                OperationType::Drop,
                OperationType::DropDatabase,
                OperationType::Invalidate,
            ]
        );
        assert_eq!(events[1].rename_to.as_deref(), Some("machines"));
        assert_eq!(source.count("machines"), 0);
    }

    #[tokio::test]
    async fn truncated_history_is_lost() {
        let source = MemoryChangeSource::new();
        let start = source.head().await.unwrap();
        for i in 0..4 {
            source.insert("hosts", json!({"_id": format!("h{i}")})).unwrap();
        }
        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(start.token.clone()))
            .await
            .unwrap();
        source.truncate_history(2);
        assert_eq!(source.history_len(), 2);

        let err = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, WatchError::HistoryLost(_)));
        let err = source
            .tail(&watch("hosts"), &StartAt::Token(start.token))
            .await
            .err()
            .unwrap();
        assert!(err.is_history_lost());

        let ok = source
            .tail(&watch("hosts"), &StartAt::Token(token_for(2).unwrap()))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn bounded_history_drops_oldest() {
        let source = MemoryChangeSource::with_max_history(2);
        let start = source.head().await.unwrap();
        for i in 0..3 {
            source.insert("hosts", json!({"_id": format!("h{i}")})).unwrap();
        }
        assert_eq!(source.history_len(), 2);
        assert!(source
            .tail(&watch("hosts"), &StartAt::Token(start.token))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn start_at_time_includes_that_time() {
        let source = MemoryChangeSource::new();
        source.insert("hosts", json!({"_id": "a"})).unwrap();
        source.insert("hosts", json!({"_id": "b"})).unwrap();
        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Token(token_for(0).unwrap()))
            .await
            .unwrap();
        let all = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap();

        let mut cursor = source
            .tail(&watch("hosts"), &StartAt::Time(all[1].cluster_time))
            .await
            .unwrap();
        let events = cursor.next_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].document_id, "b");
    }

    #[test]
    fn writes_validate_documents() {
        let source = MemoryChangeSource::new();
        assert!(source.insert("hosts", json!([1, 2])).is_err());
        source.insert("hosts", json!({"_id": "a"})).unwrap();
        assert!(source.insert("hosts", json!({"_id": "a"})).is_err());
        assert!(source.delete("hosts", "missing").is_err());
        assert_eq!(source.last_sequence(), 1);
    }
}
