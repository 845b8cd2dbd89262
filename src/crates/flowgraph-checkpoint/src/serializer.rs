//! Serialization protocol for checkpoint payloads

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for serializing and deserializing checkpoint data.
///
/// Backends use this to encode checkpoints, metadata, and pending
/// writes. The reference encoding is JSON; any implementation must
/// round-trip values by *value*, though numeric representation may
/// widen (JSON stores every number as a double).
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// Serialize to a JSON value (for backends with native JSON columns)
    fn dumps_json<T: Serialize>(&self, value: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Deserialize from a JSON value
    fn loads_json<T: for<'de> Deserialize<'de>>(&self, value: &serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// JSON serializer (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::new();
        let mut cp = Checkpoint::empty();
        cp.channel_values.insert("out".into(), json!({"n": 7}));

        let bytes = serializer.dumps(&cp).unwrap();
        let restored: Checkpoint = serializer.loads(&bytes).unwrap();

        assert_eq!(restored.id, cp.id);
        assert_eq!(restored.channel_values.get("out"), Some(&json!({"n": 7})));
    }

    #[test]
    fn numeric_widening_preserves_value() {
        let serializer = JsonSerializer::new();
        let bytes = serializer.dumps(&json!(42_i64)).unwrap();
        let restored: serde_json::Value = serializer.loads(&bytes).unwrap();

        // Integers may come back widened; value equality is guaranteed.
        assert_eq!(restored.as_f64(), Some(42.0));
    }
}
