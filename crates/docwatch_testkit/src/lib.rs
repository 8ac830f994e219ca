//! # docwatch Testkit
//!
//! Test utilities for docwatch.
//!
//! This crate provides:
//! - Fixtures: populated in-memory sources, temporary checkpoint files
//! - Recording handlers with scripted retry answers, for both shapes
//! - Fault injection around change sources and token stores
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docwatch_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn lists_then_tails() {
//!     let source = populated_source("hosts", 3);
//!     let handler = RecordingHandler::<Host>::new();
//!     // ... run a loop and inspect handler.ops()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod handlers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::handlers::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use handlers::*;
