//! Mutable state carried by a job across retries and delays.
//!
//! A [`JobState`] is an ordered map of plain JSON data. It travels inside the
//! `job-state` message property: restored when a job is received, mutated by
//! the task while it runs, and written back when the job is released.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Raised when a value cannot be represented as plain data.
#[derive(Error, Debug)]
pub enum JobStateError {
    #[error("Value for key '{key}' cannot be stored in job state: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Ordered key/value state of a job.
///
/// Values are validated when they are inserted, so a state that exists can
/// always be serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobState(Map<String, Value>);

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`.
    ///
    /// The value is converted to plain data right away. If that fails (a type
    /// whose `Serialize` implementation refuses, a map with non string keys...)
    /// an [`JobStateError::InvalidValue`] is returned and the state is left
    /// untouched.
    pub fn put<V: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &V,
    ) -> Result<(), JobStateError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|source| JobStateError::InvalidValue {
            key: key.clone(),
            source,
        })?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Reads `key` as `T`, falling back to `default` when the key is missing
    /// or holds something else.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.0
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
            .unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes `key`, keeping the order of the remaining entries.
    pub fn forget(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn all(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn serialize(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Restores a state from its serialized form.
    ///
    /// A blob that is not a JSON object yields an empty state: the job then
    /// restarts fresh instead of crashing the consumer loop.
    pub fn deserialize(bytes: impl AsRef<[u8]>) -> Self {
        match serde_json::from_slice::<Value>(bytes.as_ref()) {
            Ok(Value::Object(map)) => JobState(map),
            Ok(other) => {
                debug!(kind = ?other, "Job state is not an object, starting fresh");
                JobState::default()
            }
            Err(e) => {
                debug!(error = %e, "Malformed job state, starting fresh");
                JobState::default()
            }
        }
    }
}

impl From<Map<String, Value>> for JobState {
    fn from(map: Map<String, Value>) -> Self {
        JobState(map)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use serde::Serializer;
    use serde_json::json;

    use super::*;

    /// Stands in for an OS handle: refuses to be turned into data.
    struct FileHandle;

    impl Serialize for FileHandle {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("file handles cannot be serialized"))
        }
    }

    #[test]
    fn put_get_has_forget() {
        let mut state = JobState::new();
        assert!(state.is_empty());

        state.put("counter", &3).unwrap();
        state.put("name", "export").unwrap();
        assert!(state.has("counter"));
        assert_eq!(state.get("name"), Some(&json!("export")));
        assert_eq!(state.get_or("counter", 0u32), 3);
        assert_eq!(state.get_or("missing", 7u32), 7);
        assert_eq!(state.get_or("name", 7u32), 7);

        assert_eq!(state.forget("counter"), Some(json!(3)));
        assert!(!state.has("counter"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn insertion_order_is_kept() {
        let mut state = JobState::new();
        state.put("z", &1).unwrap();
        state.put("a", &2).unwrap();
        state.put("m", &3).unwrap();
        state.forget("a");

        let keys: Vec<_> = state.all().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "m"]);
        assert_eq!(state.serialize(), r#"{"z":1,"m":3}"#);
    }

    #[test]
    fn resource_like_values_are_rejected_and_state_unchanged() {
        let mut state = JobState::new();
        state.put("kept", &true).unwrap();
        let before = state.clone();

        let err = state.put("file", &FileHandle).unwrap_err();
        assert!(matches!(err, JobStateError::InvalidValue { ref key, .. } if key == "file"));

        let mut bad_keys = HashMap::new();
        bad_keys.insert(vec![1u8], 1);
        assert!(state.put("bytes_keyed", &bad_keys).is_err());

        assert_eq!(state, before);
    }

    #[test]
    fn malformed_blobs_yield_empty_state() {
        assert!(JobState::deserialize("not json").is_empty());
        assert!(JobState::deserialize("[1,2,3]").is_empty());
        assert!(JobState::deserialize("").is_empty());
        assert_eq!(
            JobState::deserialize(r#"{"a":1}"#).get("a"),
            Some(&json!(1))
        );
    }

    fn plain_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".*".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn serialize_round_trips(entries in prop::collection::vec((".*", plain_value()), 0..8)) {
            let mut state = JobState::new();
            for (key, value) in &entries {
                state.put(key.clone(), value).unwrap();
            }
            prop_assert_eq!(JobState::deserialize(state.serialize()), state);
        }
    }
}
