//! # docwatch Protocol
//!
//! Change-feed positions, events and document codecs for docwatch.
//!
//! This crate provides:
//! - `ResumeToken`, `Timestamp` and `StartAt` for resumable positions
//! - `RawEvent` and `Event<T>` for change-feed events
//! - `OperationType`, including the synthetic `lister` / `listerDone` kinds
//! - Document projection, field filters and collection-name filters
//! - CBOR encoding/decoding of documents
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod event;
mod position;

pub use document::{
    decode_document, document_id, encode_document, lookup_path, CollectionFilter, FieldFilter,
    Projection, ID_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{ChangeDescription, Event, OperationType, RawEvent};
pub use position::{FeedPosition, ResumeToken, StartAt, StartPoint, Timestamp};
