//! Channels: per-edge communication cells with merge behaviors
//!
//! A channel is a named cell through which nodes communicate. Each
//! channel carries a behavior that decides how a batch of incoming
//! values merges into the cell:
//!
//! | Behavior | Merge | Typical use |
//! |----------|-------|-------------|
//! | `LastValue` | keeps the last element of an update | forward edges |
//! | `Topic` | appends everything, never deduplicates | pub/sub fan-in |
//! | `Ephemeral` | keeps the *first* element, erases after one observation | produce-once/consume-once signals |
//! | `Barrier` | accumulates sender ids until the expected set is covered | joins / rendezvous |
//!
//! Channels also carry a strictly monotonic 64-bit version, an
//! `available` flag, and a last-updated-step marker the scheduler uses
//! to plan the next super-step. Channel operations never fail: a
//! non-string value written to a barrier is discarded silently, since
//! barrier contents are a set of sender ids.
//!
//! Locking is fine-grained: one mutex per channel, held only for the
//! duration of a single operation.

mod manager;

pub use manager::ChannelManager;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Merge behavior of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBehavior {
    /// Snapshot semantics: the last element of an update wins
    LastValue,
    /// Append-only log preserving insertion order
    Topic,
    /// Single-reader handoff: first element wins, self-erases on consume
    Ephemeral,
    /// Rendezvous on a set of expected sender ids
    Barrier,
}

/// Marker value for a channel that has not been touched in any step
pub const STEP_UNMARKED: i64 = -1;

#[derive(Debug)]
struct ChannelCell {
    value: Option<serde_json::Value>,
    values: Vec<serde_json::Value>,
    seen: BTreeSet<String>,
    version: i64,
    available: bool,
    updated_step: i64,
}

impl ChannelCell {
    fn new() -> Self {
        Self {
            value: None,
            values: Vec::new(),
            seen: BTreeSet::new(),
            version: 0,
            available: false,
            updated_step: STEP_UNMARKED,
        }
    }
}

/// A named, versioned communication cell
#[derive(Debug)]
pub struct Channel {
    name: String,
    behavior: ChannelBehavior,
    /// Barrier only: sender ids required before the channel opens
    expected: BTreeSet<String>,
    cell: Mutex<ChannelCell>,
}

impl Channel {
    pub fn new(name: impl Into<String>, behavior: ChannelBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            expected: BTreeSet::new(),
            cell: Mutex::new(ChannelCell::new()),
        }
    }

    /// Barrier channel expecting the given sender ids.
    pub fn barrier(name: impl Into<String>, expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            behavior: ChannelBehavior::Barrier,
            expected: expected.into_iter().collect(),
            cell: Mutex::new(ChannelCell::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> ChannelBehavior {
        self.behavior
    }

    /// Apply a batch of incoming values at `step`.
    ///
    /// Returns whether the channel considered the update meaningful;
    /// the version is bumped by exactly one iff this returns true.
    /// Topic and Barrier accept empty batches (recording the scheduling
    /// tick); LastValue and Ephemeral ignore them.
    pub fn update(&self, values: Vec<serde_json::Value>, step: i64) -> bool {
        let mut cell = self.cell.lock().unwrap();

        let updated = match self.behavior {
            ChannelBehavior::LastValue => match values.into_iter().next_back() {
                Some(last) => {
                    cell.value = Some(last);
                    cell.available = true;
                    true
                }
                None => false,
            },
            ChannelBehavior::Ephemeral => match values.into_iter().next() {
                Some(first) => {
                    cell.value = Some(first);
                    cell.available = true;
                    true
                }
                None => false,
            },
            ChannelBehavior::Topic => {
                if !values.is_empty() {
                    cell.values.extend(values);
                    cell.available = true;
                }
                true
            }
            ChannelBehavior::Barrier => {
                for value in values {
                    // Non-string senders are dropped: the barrier is a set
                    // of sender ids.
                    if let Some(sender) = value.as_str() {
                        cell.seen.insert(sender.to_string());
                    }
                }
                cell.available = self.expected.iter().all(|id| cell.seen.contains(id));
                true
            }
        };

        if updated {
            cell.version += 1;
            cell.updated_step = step;
        }
        updated
    }

    /// Current observable view: scalar, list, or sender set.
    pub fn get(&self) -> Option<serde_json::Value> {
        let cell = self.cell.lock().unwrap();
        match self.behavior {
            ChannelBehavior::LastValue | ChannelBehavior::Ephemeral => cell.value.clone(),
            ChannelBehavior::Topic => {
                if cell.values.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Array(cell.values.clone()))
                }
            }
            ChannelBehavior::Barrier => {
                if cell.seen.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Array(
                        cell.seen.iter().cloned().map(serde_json::Value::from).collect(),
                    ))
                }
            }
        }
    }

    /// Ephemeral only: erase the value after its single observation.
    pub fn consume(&self) {
        if self.behavior == ChannelBehavior::Ephemeral {
            let mut cell = self.cell.lock().unwrap();
            cell.value = None;
            cell.available = false;
        }
    }

    /// Clear `available` after the scheduler has consumed the update;
    /// a barrier also resets its seen set so the next round starts
    /// empty.
    pub fn acknowledge(&self) {
        let mut cell = self.cell.lock().unwrap();
        cell.available = false;
        if self.behavior == ChannelBehavior::Barrier {
            cell.seen.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.cell.lock().unwrap().available
    }

    pub fn version(&self) -> i64 {
        self.cell.lock().unwrap().version
    }

    pub fn is_updated_in_step(&self, step: i64) -> bool {
        self.cell.lock().unwrap().updated_step == step
    }

    /// Barrier sender ids observed so far (sorted).
    pub fn barrier_seen(&self) -> Vec<String> {
        self.cell.lock().unwrap().seen.iter().cloned().collect()
    }

    /// Restore the barrier seen set during checkpoint replay;
    /// availability is recomputed from the expected set.
    pub fn restore_barrier_seen(&self, seen: Vec<String>) {
        let mut cell = self.cell.lock().unwrap();
        cell.seen = seen.into_iter().collect();
        cell.available = self.expected.iter().all(|id| cell.seen.contains(id));
    }

    /// Rebuild the cell from a checkpointed view and version.
    pub fn restore(&self, value: Option<serde_json::Value>, version: i64) {
        {
            let mut cell = self.cell.lock().unwrap();
            cell.version = version;
            cell.updated_step = STEP_UNMARKED;
        }
        match (self.behavior, value) {
            (ChannelBehavior::Barrier, Some(serde_json::Value::Array(senders))) => {
                self.restore_barrier_seen(
                    senders
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                );
            }
            (ChannelBehavior::Barrier, _) => {}
            (ChannelBehavior::Topic, Some(serde_json::Value::Array(items))) => {
                let mut cell = self.cell.lock().unwrap();
                cell.available = !items.is_empty();
                cell.values = items;
            }
            (ChannelBehavior::Topic, _) => {}
            (_, value) => {
                let mut cell = self.cell.lock().unwrap();
                cell.available = value.is_some();
                cell.value = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn last_value_keeps_last_element() {
        let chan = Channel::new("out", ChannelBehavior::LastValue);
        assert!(chan.update(vec![json!("a"), json!("b")], 1));
        assert_eq!(chan.get(), Some(json!("b")));
        assert_eq!(chan.version(), 1);
        assert!(chan.is_available());
        assert!(chan.is_updated_in_step(1));
    }

    #[test]
    fn last_value_ignores_empty_update() {
        let chan = Channel::new("out", ChannelBehavior::LastValue);
        assert!(!chan.update(vec![], 1));
        assert_eq!(chan.version(), 0);
        assert!(!chan.is_available());
        assert!(!chan.is_updated_in_step(1));
    }

    #[test]
    fn topic_accumulates_in_order() {
        let chan = Channel::new("log", ChannelBehavior::Topic);
        assert!(chan.update(vec![json!("x")], 1));
        assert!(chan.update(vec![json!("y"), json!("z")], 2));
        assert_eq!(chan.get(), Some(json!(["x", "y", "z"])));
        assert_eq!(chan.version(), 2);
    }

    #[test]
    fn topic_never_deduplicates() {
        let chan = Channel::new("log", ChannelBehavior::Topic);
        chan.update(vec![json!("x"), json!("x")], 1);
        assert_eq!(chan.get(), Some(json!(["x", "x"])));
    }

    #[test]
    fn topic_empty_update_records_tick() {
        let chan = Channel::new("log", ChannelBehavior::Topic);
        assert!(chan.update(vec![], 3));
        assert_eq!(chan.version(), 1);
        assert!(chan.is_updated_in_step(3));
        // Nothing was mutated, so the channel is not available.
        assert!(!chan.is_available());
    }

    #[test]
    fn ephemeral_keeps_first_element() {
        let chan = Channel::new("signal", ChannelBehavior::Ephemeral);
        chan.update(vec![json!(1), json!(2)], 1);
        assert_eq!(chan.get(), Some(json!(1)));
    }

    #[test]
    fn ephemeral_is_single_shot() {
        let chan = Channel::new("signal", ChannelBehavior::Ephemeral);
        chan.update(vec![json!("ping")], 1);
        assert!(chan.is_available());

        chan.consume();
        assert_eq!(chan.get(), None);
        assert!(!chan.is_available());

        // Consume is idempotent and a no-op for other behaviors.
        chan.consume();
        assert_eq!(chan.get(), None);
    }

    #[test]
    fn consume_is_noop_for_last_value() {
        let chan = Channel::new("out", ChannelBehavior::LastValue);
        chan.update(vec![json!(5)], 1);
        chan.consume();
        assert_eq!(chan.get(), Some(json!(5)));
    }

    #[test]
    fn barrier_waits_for_expected_set() {
        let chan = Channel::barrier("join", ["n1".to_string(), "n2".to_string()]);

        assert!(chan.update(vec![json!("n1")], 1));
        assert!(!chan.is_available());

        // Non-string senders are dropped silently.
        assert!(chan.update(vec![json!("n2"), json!(42)], 2));
        assert!(chan.is_available());
        assert_eq!(chan.barrier_seen(), vec!["n1".to_string(), "n2".to_string()]);

        chan.acknowledge();
        assert!(chan.barrier_seen().is_empty());
        assert!(!chan.is_available());
    }

    #[test]
    fn barrier_seen_restore_recomputes_availability() {
        let chan = Channel::barrier("join", ["a".to_string(), "b".to_string()]);
        chan.restore_barrier_seen(vec!["a".to_string()]);
        assert!(!chan.is_available());
        chan.restore_barrier_seen(vec!["a".to_string(), "b".to_string()]);
        assert!(chan.is_available());
    }

    #[test]
    fn acknowledge_clears_available_only() {
        let chan = Channel::new("out", ChannelBehavior::LastValue);
        chan.update(vec![json!("v")], 4);
        chan.acknowledge();
        assert!(!chan.is_available());
        // The value and the step marker survive.
        assert_eq!(chan.get(), Some(json!("v")));
        assert!(chan.is_updated_in_step(4));
    }

    #[test]
    fn restore_round_trip() {
        let source = Channel::new("log", ChannelBehavior::Topic);
        source.update(vec![json!(1), json!(2)], 1);

        let restored = Channel::new("log", ChannelBehavior::Topic);
        restored.restore(source.get(), source.version());
        assert_eq!(restored.get(), Some(json!([1, 2])));
        assert_eq!(restored.version(), 1);
        assert!(!restored.is_updated_in_step(1));
    }

    proptest! {
        // Versions never decrease, and bump by exactly one iff update
        // reports a meaningful change.
        #[test]
        fn version_monotonicity(
            batches in prop::collection::vec(
                prop::collection::vec(prop_oneof![
                    Just(json!("s")),
                    Just(json!(7)),
                    Just(json!(null)),
                ], 0..3),
                0..12,
            ),
            behavior_idx in 0usize..4,
        ) {
            let behavior = [
                ChannelBehavior::LastValue,
                ChannelBehavior::Topic,
                ChannelBehavior::Ephemeral,
                ChannelBehavior::Barrier,
            ][behavior_idx];
            let chan = Channel::new("c", behavior);

            for (step, batch) in batches.into_iter().enumerate() {
                let before = chan.version();
                let updated = chan.update(batch, step as i64);
                let after = chan.version();
                prop_assert!(after >= before);
                prop_assert_eq!(after == before + 1, updated);
            }
        }
    }
}
