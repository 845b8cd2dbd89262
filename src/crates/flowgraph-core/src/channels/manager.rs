//! Channel registry
//!
//! The manager owns every channel of a run, keyed by name. The
//! scheduler references channels by name through the manager rather
//! than by pointer, so restoring a checkpoint rebuilds the manager in
//! isolation. The registry lock guards only the map; each channel
//! carries its own mutex.

use super::{Channel, ChannelBehavior};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Idempotent: an existing channel keeps its
    /// behavior and contents.
    pub fn add_channel(&self, name: &str, behavior: ChannelBehavior) -> Arc<Channel> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name, behavior)))
            .clone()
    }

    /// Register a barrier channel with its expected sender set.
    /// Idempotent like [`add_channel`](Self::add_channel).
    pub fn add_barrier(
        &self,
        name: &str,
        expected: impl IntoIterator<Item = String>,
    ) -> Arc<Channel> {
        let mut channels = self.channels.write().unwrap();
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::barrier(name, expected)))
            .clone()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().unwrap().get(name).cloned()
    }

    /// Shallow copy of the registry, insulating iterators from
    /// concurrent additions.
    pub fn all_channels(&self) -> HashMap<String, Arc<Channel>> {
        self.channels.read().unwrap().clone()
    }

    /// Observable values and versions of every channel, for
    /// checkpointing. Channels with nothing to observe are omitted
    /// from the value map but still report their version.
    pub fn snapshot(&self) -> (HashMap<String, serde_json::Value>, HashMap<String, i64>) {
        let channels = self.channels.read().unwrap();
        let mut values = HashMap::new();
        let mut versions = HashMap::new();
        for (name, channel) in channels.iter() {
            if let Some(value) = channel.get() {
                values.insert(name.clone(), value);
            }
            versions.insert(name.clone(), channel.version());
        }
        (values, versions)
    }

    /// Rehydrate registered channels from a checkpoint snapshot.
    pub fn restore(
        &self,
        values: &HashMap<String, serde_json::Value>,
        versions: &HashMap<String, i64>,
    ) {
        let channels = self.channels.read().unwrap();
        for (name, channel) in channels.iter() {
            let version = versions.get(name).copied().unwrap_or(0);
            channel.restore(values.get(name).cloned(), version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_channel_is_idempotent() {
        let manager = ChannelManager::new();
        let first = manager.add_channel("out", ChannelBehavior::Topic);
        first.update(vec![json!(1)], 0);

        // Re-adding with a different behavior neither replaces the
        // channel nor its contents.
        let second = manager.add_channel("out", ChannelBehavior::LastValue);
        assert_eq!(second.behavior(), ChannelBehavior::Topic);
        assert_eq!(second.get(), Some(json!([1])));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn lookup_and_shallow_copy() {
        let manager = ChannelManager::new();
        manager.add_channel("a", ChannelBehavior::LastValue);
        manager.add_channel("b", ChannelBehavior::Topic);

        assert!(manager.channel("a").is_some());
        assert!(manager.channel("missing").is_none());

        let copy = manager.all_channels();
        manager.add_channel("c", ChannelBehavior::Ephemeral);
        assert_eq!(copy.len(), 2);
        assert_eq!(manager.all_channels().len(), 3);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let manager = ChannelManager::new();
        manager
            .add_channel("out", ChannelBehavior::LastValue)
            .update(vec![json!("v")], 2);
        manager
            .add_barrier("join", ["a".to_string(), "b".to_string()])
            .update(vec![json!("a")], 2);

        let (values, versions) = manager.snapshot();

        let fresh = ChannelManager::new();
        fresh.add_channel("out", ChannelBehavior::LastValue);
        fresh.add_barrier("join", ["a".to_string(), "b".to_string()]);
        fresh.restore(&values, &versions);

        let out = fresh.channel("out").unwrap();
        assert_eq!(out.get(), Some(json!("v")));
        assert_eq!(out.version(), 1);

        let join = fresh.channel("join").unwrap();
        assert_eq!(join.barrier_seen(), vec!["a".to_string()]);
        assert!(!join.is_available());
    }
}
