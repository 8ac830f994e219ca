//! Property-based test generators using proptest.
//!
//! Provides strategies for generating documents, write scripts and
//! options that maintain required invariants.

use crate::fixtures::host;
use docwatch_engine::{MemoryChangeSource, RetryOptions};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::time::Duration;

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating operating system names.
pub fn os_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["linux", "bsd", "windows", "darwin"]).prop_map(str::to_string)
}

/// One write against a collection of hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a new host.
    Insert {
        /// Operating system of the new host.
        os: String,
    },
    /// Update the `os` field of the n-th live host (modulo the live count).
    Update {
        /// Index into the live hosts.
        pick: usize,
        /// New operating system.
        os: String,
    },
    /// Delete the n-th live host (modulo the live count).
    Delete {
        /// Index into the live hosts.
        pick: usize,
    },
}

/// Strategy for a single write.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        3 => os_strategy().prop_map(|os| WriteOp::Insert { os }),
        2 => (any::<usize>(), os_strategy()).prop_map(|(pick, os)| WriteOp::Update { pick, os }),
        1 => any::<usize>().prop_map(|pick| WriteOp::Delete { pick }),
    ]
}

/// Strategy for a script of writes.
pub fn write_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), 1..=max_len.max(1))
}

/// Applies a write script to `collection`. Returns the number of changes made.
///
/// Updates and deletes with no live host are skipped.
pub fn apply_script(source: &MemoryChangeSource, collection: &str, script: &[WriteOp]) -> usize {
    let mut live: Vec<String> = Vec::new();
    let mut next_id = source.count(collection);
    let mut applied = 0;
    for op in script {
        match op {
            WriteOp::Insert { os } => {
                let id = format!("gen-{next_id:05}");
                next_id += 1;
                source
                    .insert(collection, host(&id, os))
                    .expect("Failed to insert generated document");
                live.push(id);
            }
            WriteOp::Update { pick, os } => {
                if live.is_empty() {
                    continue;
                }
                let id = &live[pick % live.len()];
                let mut set = Map::new();
                set.insert("os".into(), Value::String(os.clone()));
                source
                    .update(collection, id, set, vec![])
                    .expect("Failed to update generated document");
            }
            WriteOp::Delete { pick } => {
                if live.is_empty() {
                    continue;
                }
                let id = live.remove(pick % live.len());
                source
                    .delete(collection, &id)
                    .expect("Failed to delete generated document");
            }
        }
        applied += 1;
    }
    applied
}

/// Strategy for retry options valid for either handler shape.
pub fn retry_options_strategy() -> impl Strategy<Value = RetryOptions> {
    (1u32..5, 500u64..2000)
        .prop_map(|(count, millis)| RetryOptions::new(count, Duration::from_millis(millis)))
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 64,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn collection_names_are_nonempty(name in collection_name_strategy()) {
            prop_assert!(!name.is_empty());
        }

        #[test]
        fn script_applies_every_insert(script in write_script_strategy(30)) {
            let source = MemoryChangeSource::new();
            let applied = apply_script(&source, "hosts", &script);
            let inserts = script.iter().filter(|op| matches!(op, WriteOp::Insert { .. })).count();
            prop_assert!(applied >= inserts);
            prop_assert_eq!(source.last_sequence() as usize, applied);
        }
    }
}
