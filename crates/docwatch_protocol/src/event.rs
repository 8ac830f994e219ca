//! Change-feed events.
//!
//! A change source produces [`RawEvent`]s carrying CBOR-encoded documents.
//! Consumers receive [`Event<T>`], the same event with its document decoded
//! into the caller's typed shape.

use crate::document::decode_document;
use crate::error::ProtocolError;
use crate::position::{ResumeToken, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Document was inserted.
    #[serde(rename = "insert")]
    Insert,
    /// Document was deleted.
    #[serde(rename = "delete")]
    Delete,
    /// Document was replaced as a whole.
    #[serde(rename = "replace")]
    Replace,
    /// Document was partially updated.
    #[serde(rename = "update")]
    Update,
    /// Collection was dropped.
    #[serde(rename = "drop")]
    Drop,
    /// Collection was renamed.
    #[serde(rename = "rename")]
    Rename,
    /// Database was dropped.
    #[serde(rename = "dropDatabase")]
    DropDatabase,
    /// The stream can no longer continue from its current position.
    #[serde(rename = "invalidate")]
    Invalidate,
    /// Synthetic: a document found by the reconciliation listing.
    #[serde(rename = "lister")]
    Lister,
    /// Synthetic: the reconciliation listing has been fully replayed.
    #[serde(rename = "listerDone")]
    ListDone,
}

impl OperationType {
    /// All operation types, in declaration order.
    pub const ALL: [OperationType; 10] = [
        OperationType::Insert,
        OperationType::Delete,
        OperationType::Replace,
        OperationType::Update,
        OperationType::Drop,
        OperationType::Rename,
        OperationType::DropDatabase,
        OperationType::Invalidate,
        OperationType::Lister,
        OperationType::ListDone,
    ];

    /// Wire name of the operation type.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Update => "update",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
            OperationType::Lister => "lister",
            OperationType::ListDone => "listerDone",
        }
    }

    /// Returns true for changes to a single document.
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Delete
                | OperationType::Replace
                | OperationType::Update
        )
    }

    /// Returns true for kinds produced by the watch engine itself.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, OperationType::Lister | OperationType::ListDone)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ProtocolError::InvalidOperationType(s.to_string()))
    }
}

/// Fields touched by a partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeDescription {
    /// Fields added or updated, with their new values.
    pub updated_fields: Map<String, Value>,
    /// Fields removed from the document.
    pub removed_fields: Vec<String>,
}

/// An event as produced by a change source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Identity of the affected document (empty for collection-level events).
    pub document_id: String,
    /// Kind of change.
    pub operation_type: OperationType,
    /// Collection owning the document.
    pub collection: String,
    /// Cluster time of the change.
    pub cluster_time: Timestamp,
    /// Position resuming immediately after this event. `None` for synthetic
    /// events, which are not part of the feed.
    pub token: Option<ResumeToken>,
    /// CBOR-encoded document snapshot, when available.
    pub document_raw: Option<Vec<u8>>,
    /// Partial update description (update events only).
    pub change_description: Option<ChangeDescription>,
    /// New collection name (rename events only).
    pub rename_to: Option<String>,
}

impl RawEvent {
    fn base(
        operation_type: OperationType,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        cluster_time: Timestamp,
        token: Option<ResumeToken>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            operation_type,
            collection: collection.into(),
            cluster_time,
            token,
            document_raw: None,
            change_description: None,
            rename_to: None,
        }
    }

    /// Creates an insert event.
    pub fn insert(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document_raw: Vec<u8>,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        let mut event = Self::base(
            OperationType::Insert,
            collection,
            document_id,
            cluster_time,
            Some(token),
        );
        event.document_raw = Some(document_raw);
        event
    }

    /// Creates an update event with its post-image and change description.
    pub fn update(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document_raw: Option<Vec<u8>>,
        description: ChangeDescription,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        let mut event = Self::base(
            OperationType::Update,
            collection,
            document_id,
            cluster_time,
            Some(token),
        );
        event.document_raw = document_raw;
        event.change_description = Some(description);
        event
    }

    /// Creates a replace event.
    pub fn replace(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document_raw: Vec<u8>,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        let mut event = Self::base(
            OperationType::Replace,
            collection,
            document_id,
            cluster_time,
            Some(token),
        );
        event.document_raw = Some(document_raw);
        event
    }

    /// Creates a delete event. Deletes carry no document.
    pub fn delete(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        Self::base(
            OperationType::Delete,
            collection,
            document_id,
            cluster_time,
            Some(token),
        )
    }

    /// Creates a collection-level or database-level event.
    pub fn collection_level(
        operation_type: OperationType,
        collection: impl Into<String>,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        Self::base(operation_type, collection, "", cluster_time, Some(token))
    }

    /// Creates a rename event.
    pub fn rename(
        collection: impl Into<String>,
        rename_to: impl Into<String>,
        cluster_time: Timestamp,
        token: ResumeToken,
    ) -> Self {
        let mut event = Self::collection_level(OperationType::Rename, collection, cluster_time, token);
        event.rename_to = Some(rename_to.into());
        event
    }

    /// Creates a synthetic listing event for an existing document.
    pub fn lister(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        document_raw: Vec<u8>,
        cluster_time: Timestamp,
    ) -> Self {
        let mut event = Self::base(
            OperationType::Lister,
            collection,
            document_id,
            cluster_time,
            None,
        );
        event.document_raw = Some(document_raw);
        event
    }

    /// Creates the payload-free listing sentinel.
    pub fn list_done(collection: impl Into<String>, cluster_time: Timestamp) -> Self {
        Self::base(OperationType::ListDone, collection, "", cluster_time, None)
    }
}

/// An event with its document decoded into `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    /// Identity of the affected document.
    pub document_id: String,
    /// Kind of change.
    pub operation_type: OperationType,
    /// Decoded document snapshot, when one was present and decodable.
    pub document: Option<T>,
    /// The encoded snapshot as produced by the source.
    pub document_raw: Option<Vec<u8>>,
    /// Collection owning the document.
    pub collection: String,
    /// Cluster time of the change.
    pub cluster_time: Timestamp,
    /// Position resuming immediately after this event.
    pub token: Option<ResumeToken>,
    /// Partial update description.
    pub change_description: Option<ChangeDescription>,
    /// New collection name for rename events.
    pub rename_to: Option<String>,
}

impl<T: DeserializeOwned> Event<T> {
    /// Decodes a raw event.
    ///
    /// Returns the event together with the decoding error, if any. A document
    /// that does not decode leaves `document` as `None`; `document_raw` is kept.
    pub fn decode(raw: RawEvent) -> (Self, Option<ProtocolError>) {
        let (document, error) = match raw.document_raw.as_deref() {
            Some(bytes) => match decode_document::<T>(bytes) {
                Ok(doc) => (Some(doc), None),
                Err(e) => (None, Some(e)),
            },
            None => (None, None),
        };
        let event = Self {
            document_id: raw.document_id,
            operation_type: raw.operation_type,
            document,
            document_raw: raw.document_raw,
            collection: raw.collection,
            cluster_time: raw.cluster_time,
            token: raw.token,
            change_description: raw.change_description,
            rename_to: raw.rename_to,
        };
        (event, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::encode_document;
    use serde_json::json;

    fn token(s: &str) -> ResumeToken {
        ResumeToken::new(s).unwrap()
    }

    #[test]
    fn operation_type_names_roundtrip() {
        for op in OperationType::ALL {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!("upsert".parse::<OperationType>().is_err());
        assert_eq!(OperationType::ListDone.to_string(), "listerDone");
    }

    #[test]
    fn operation_type_classes() {
        assert!(OperationType::Update.is_document_level());
        assert!(!OperationType::Drop.is_document_level());
        assert!(!OperationType::Lister.is_document_level());
        assert!(OperationType::ListDone.is_synthetic());
        assert!(!OperationType::Invalidate.is_synthetic());
    }

    #[test]
    fn list_done_has_no_payload() {
        let event = RawEvent::list_done("hosts", Timestamp::new(3, 0));
        assert_eq!(event.operation_type, OperationType::ListDone);
        assert!(event.document_raw.is_none());
        assert!(event.token.is_none());
        assert!(event.document_id.is_empty());
    }

    #[test]
    fn decode_typed_document() {
        let raw = RawEvent::insert(
            "hosts",
            "h1",
            encode_document(&json!({"_id": "h1", "ip": "10.0.0.1"})).unwrap(),
            Timestamp::new(5, 1),
            token("01"),
        );
        let (event, err) = Event::<Value>::decode(raw);
        assert!(err.is_none());
        assert_eq!(event.document, Some(json!({"_id": "h1", "ip": "10.0.0.1"})));
        assert_eq!(event.token, Some(token("01")));
        assert_eq!(event.collection, "hosts");
    }

    #[test]
    fn decode_failure_keeps_raw() {
        let raw = RawEvent::insert("hosts", "h1", vec![0xff], Timestamp::new(5, 1), token("02"));
        let (event, err) = Event::<Value>::decode(raw);
        assert!(err.is_some());
        assert!(event.document.is_none());
        assert_eq!(event.document_raw, Some(vec![0xff]));
    }

    #[test]
    fn rename_carries_target() {
        let raw = RawEvent::rename("hosts", "hosts_v2", Timestamp::new(9, 0), token("03"));
        assert_eq!(raw.operation_type, OperationType::Rename);
        assert_eq!(raw.rename_to.as_deref(), Some("hosts_v2"));
    }
}
