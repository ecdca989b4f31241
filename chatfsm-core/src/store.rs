//! Persistence adapter for conversation state.

use crate::definition::INITIAL_STATE;
use crate::error::StoreError;
use crate::message::Key;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;

/// Loads and saves `(state id, data)` per conversation.
///
/// `load` returns the initial state and freshly initialized data for a key
/// it has never seen. Errors are reserved for real failures, such as a lost
/// database connection.
pub trait SaveLoader: Send + Sync {
    fn load(&self, key: &Key) -> Result<(String, Value), StoreError>;

    fn save(&self, key: &Key, state: &str, data: &Value) -> Result<(), StoreError>;
}

/// Produces the data of a conversation that has no stored state yet.
pub type StateInitializer = Box<dyn Fn(&Key) -> Value + Send + Sync>;

/// A stored conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub state: String,
    pub data: Value,
}

/// In-memory [`SaveLoader`].
pub struct MemoryStore {
    records: DashMap<Key, StoredState>,
    init: StateInitializer,
}

impl MemoryStore {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn(&Key) -> Value + Send + Sync + 'static,
    {
        Self {
            records: DashMap::new(),
            init: Box::new(init),
        }
    }

    /// Returns the stored record of `key`, if any.
    pub fn get(&self, key: &Key) -> Option<StoredState> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Forgets a conversation; its next message starts from the initial
    /// state.
    pub fn remove(&self, key: &Key) -> Option<StoredState> {
        self.records.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(|_| Value::Null)
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .finish()
    }
}

impl SaveLoader for MemoryStore {
    fn load(&self, key: &Key) -> Result<(String, Value), StoreError> {
        match self.records.get(key) {
            Some(record) => Ok((record.state.clone(), record.data.clone())),
            None => Ok((INITIAL_STATE.to_string(), (self.init)(key))),
        }
    }

    fn save(&self, key: &Key, state: &str, data: &Value) -> Result<(), StoreError> {
        self.records.insert(
            key.clone(),
            StoredState {
                state: state.to_string(),
                data: data.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unseen_key_is_initialized() {
        let store = MemoryStore::new(|key| json!({"greeting": format!("hi {}", key)}));

        let (state, data) = store.load(&Key::new("7")).unwrap();
        assert_eq!(state, INITIAL_STATE);
        assert_eq!(data, json!({"greeting": "hi 7"}));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let store = MemoryStore::default();
        let key = Key::new("7");

        store.save(&key, "ask_name", &json!("Alice")).unwrap();
        let (state, data) = store.load(&key).unwrap();
        assert_eq!(state, "ask_name");
        assert_eq!(data, json!("Alice"));

        let removed = store.remove(&key).unwrap();
        assert_eq!(removed.state, "ask_name");
        assert_eq!(store.load(&key).unwrap().0, INITIAL_STATE);
    }
}
