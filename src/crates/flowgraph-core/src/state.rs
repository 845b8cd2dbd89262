//! State schema and reducers
//!
//! The committed state of a run is a map from declared keys to JSON
//! values. Every key carries a declared semantic type and a reducer: a
//! pure function that merges an incoming delta into the committed
//! value. The scheduler never mutates state in place; each super-step
//! produces a new committed state by running the reducers over the
//! collected deltas.
//!
//! Reducers must be deterministic and side-effect free. The scheduler
//! applies them in deterministic order (per task, keys ascending), so
//! non-commutative reducers still replay identically.

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Declared semantic type of a state key, carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Bool,
    List,
    Map,
    Any,
}

/// Pure merge function for one state key.
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current`, producing the next committed
    /// value. `current` is `None` the first time the key is written.
    fn apply(&self, current: Option<&Value>, update: Value) -> Value;
}

impl fmt::Debug for dyn Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<reducer>")
    }
}

/// Default reducer: the incoming delta replaces the committed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn apply(&self, _current: Option<&Value>, update: Value) -> Value {
        update
    }
}

/// Appends the delta to an ordered sequence. Array deltas extend the
/// sequence element by element; scalar deltas append as one element.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn apply(&self, current: Option<&Value>, update: Value) -> Value {
        let mut items = match current {
            Some(Value::Array(existing)) => existing.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        match update {
            Value::Array(incoming) => items.extend(incoming),
            other => items.push(other),
        }
        Value::Array(items)
    }
}

/// Merges two mappings key by key; the incoming side wins per key.
/// A non-object on either side degrades to overwrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeMapReducer;

impl Reducer for MergeMapReducer {
    fn apply(&self, current: Option<&Value>, update: Value) -> Value {
        match (current, update) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let mut merged = existing.clone();
                for (key, value) in incoming {
                    merged.insert(key, value);
                }
                Value::Object(merged)
            }
            (_, update) => update,
        }
    }
}

/// Set union: appends only elements not already present, preserving
/// first-insertion order. Elements compare by value.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionReducer;

impl Reducer for UnionReducer {
    fn apply(&self, current: Option<&Value>, update: Value) -> Value {
        let mut items = match current {
            Some(Value::Array(existing)) => existing.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        let incoming = match update {
            Value::Array(values) => values,
            other => vec![other],
        };
        for value in incoming {
            if !items.contains(&value) {
                items.push(value);
            }
        }
        Value::Array(items)
    }
}

#[derive(Clone)]
struct FieldSpec {
    value_type: ValueType,
    reducer: Arc<dyn Reducer>,
    default: Option<Value>,
}

/// Declares the recognized state keys, their semantic types, reducers,
/// and optional defaults. Writes to undeclared keys are a schema
/// mismatch.
#[derive(Clone, Default)]
pub struct StateSchema {
    fields: HashMap<String, FieldSpec>,
}

impl fmt::Debug for StateSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSchema")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field. The last declaration of a name wins.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        value_type: ValueType,
        reducer: Arc<dyn Reducer>,
        default: Option<Value>,
    ) -> &mut Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                value_type,
                reducer,
                default,
            },
        );
        self
    }

    /// Declare a field with the overwrite reducer and no default.
    pub fn add_simple_field(&mut self, name: impl Into<String>, value_type: ValueType) -> &mut Self {
        self.add_field(name, value_type, Arc::new(OverwriteReducer), None)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_type(&self, name: &str) -> Option<ValueType> {
        self.fields.get(name).map(|spec| spec.value_type)
    }

    /// Declared field names, sorted.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.keys().cloned().collect();
        names.sort();
        names
    }

    /// Committed state for a fresh run: declared defaults overlaid with
    /// the caller's initial values. Undeclared initial keys are a
    /// schema mismatch.
    pub fn initial_state(&self, provided: HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        let mut state = HashMap::new();
        for (name, spec) in &self.fields {
            if let Some(default) = &spec.default {
                state.insert(name.clone(), default.clone());
            }
        }
        for (key, value) in provided {
            if !self.has_field(&key) {
                return Err(GraphError::SchemaMismatch { key });
            }
            state.insert(key, value);
        }
        Ok(state)
    }

    /// Merge one delta map into the committed state, keys in ascending
    /// order.
    pub fn apply(&self, state: &mut HashMap<String, Value>, delta: HashMap<String, Value>) -> Result<()> {
        let mut entries: Vec<(String, Value)> = delta.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, update) in entries {
            let spec = self
                .fields
                .get(&key)
                .ok_or_else(|| GraphError::SchemaMismatch { key: key.clone() })?;
            let next = spec.reducer.apply(state.get(&key), update);
            state.insert(key, next);
        }
        Ok(())
    }
}

/// Immutable view of committed state handed to a node.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    values: HashMap<String, Value>,
}

impl StateSnapshot {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.values
    }
}

impl From<HashMap<String, Value>> for StateSnapshot {
    fn from(values: HashMap<String, Value>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_replaces() {
        let reducer = OverwriteReducer;
        assert_eq!(reducer.apply(Some(&json!(1)), json!(2)), json!(2));
        assert_eq!(reducer.apply(None, json!("x")), json!("x"));
    }

    #[test]
    fn append_extends_sequences() {
        let reducer = AppendReducer;
        let first = reducer.apply(None, json!(["a"]));
        let second = reducer.apply(Some(&first), json!("b"));
        let third = reducer.apply(Some(&second), json!(["c", "d"]));
        assert_eq!(third, json!(["a", "b", "c", "d"]));
    }

    #[test]
    fn merge_map_right_wins_per_key() {
        let reducer = MergeMapReducer;
        let merged = reducer.apply(
            Some(&json!({"a": 1, "b": 2})),
            json!({"b": 20, "c": 3}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 20, "c": 3}));
    }

    #[test]
    fn union_deduplicates_preserving_order() {
        let reducer = UnionReducer;
        let first = reducer.apply(None, json!(["x", "y"]));
        let second = reducer.apply(Some(&first), json!(["y", "z", "x"]));
        assert_eq!(second, json!(["x", "y", "z"]));
    }

    fn schema() -> StateSchema {
        let mut schema = StateSchema::new();
        schema
            .add_field(
                "messages",
                ValueType::List,
                Arc::new(AppendReducer),
                Some(json!([])),
            )
            .add_field("meta", ValueType::Map, Arc::new(MergeMapReducer), None)
            .add_simple_field("status", ValueType::String);
        schema
    }

    #[test]
    fn initial_state_overlays_defaults() {
        let schema = schema();
        let state = schema
            .initial_state(HashMap::from([("status".to_string(), json!("new"))]))
            .unwrap();
        assert_eq!(state.get("messages"), Some(&json!([])));
        assert_eq!(state.get("status"), Some(&json!("new")));
        assert!(!state.contains_key("meta"));
    }

    #[test]
    fn undeclared_initial_key_is_schema_mismatch() {
        let err = schema()
            .initial_state(HashMap::from([("bogus".to_string(), json!(1))]))
            .unwrap_err();
        assert!(matches!(err, GraphError::SchemaMismatch { key } if key == "bogus"));
    }

    #[test]
    fn apply_routes_each_key_through_its_reducer() {
        let schema = schema();
        let mut state = schema.initial_state(HashMap::new()).unwrap();

        schema
            .apply(
                &mut state,
                HashMap::from([
                    ("messages".to_string(), json!(["hello"])),
                    ("meta".to_string(), json!({"lang": "en"})),
                ]),
            )
            .unwrap();
        schema
            .apply(
                &mut state,
                HashMap::from([
                    ("messages".to_string(), json!(["world"])),
                    ("meta".to_string(), json!({"tone": "formal"})),
                    ("status".to_string(), json!("done")),
                ]),
            )
            .unwrap();

        assert_eq!(state.get("messages"), Some(&json!(["hello", "world"])));
        assert_eq!(
            state.get("meta"),
            Some(&json!({"lang": "en", "tone": "formal"}))
        );
        assert_eq!(state.get("status"), Some(&json!("done")));
    }

    #[test]
    fn apply_rejects_undeclared_keys() {
        let schema = schema();
        let mut state = HashMap::new();
        let err = schema
            .apply(&mut state, HashMap::from([("nope".to_string(), json!(0))]))
            .unwrap_err();
        assert!(matches!(err, GraphError::SchemaMismatch { key } if key == "nope"));
    }
}
