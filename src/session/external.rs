// Per-request key/value store — where generation and runner markers live between requests.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

/// Key/value view of the caller's external (e.g. HTTP) session.
pub trait ExternalSession: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;

    fn set(&self, key: &str, value: Bytes);

    fn remove(&self, key: &str);

    fn keys(&self) -> Vec<String>;

    /// Return the stored value, or store and return `init()` if absent.
    ///
    /// The default is not atomic; implementations that can be shared across
    /// concurrent requests should override it.
    fn get_or_set(&self, key: &str, init: &mut dyn FnMut() -> Bytes) -> Bytes {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = init();
        self.set(key, value.clone());
        value
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|b| String::from_utf8(b.to_vec()).ok())
    }

    fn set_string(&self, key: &str, value: &str) {
        self.set(key, Bytes::copy_from_slice(value.as_bytes()));
    }
}

/// In-memory external session.
#[derive(Debug, Default)]
pub struct MemorySessionState {
    values: RwLock<HashMap<String, Bytes>>,
}

impl MemorySessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl ExternalSession for MemorySessionState {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Bytes) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    fn get_or_set(&self, key: &str, init: &mut dyn FnMut() -> Bytes) -> Bytes {
        self.values
            .write()
            .entry(key.to_string())
            .or_insert_with(init)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_helpers_round_trip() {
        let state = MemorySessionState::new();
        state.set_string("k", "-3");
        assert_eq!(state.get_string("k").as_deref(), Some("-3"));
        state.remove("k");
        assert!(state.get("k").is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn get_or_set_keeps_first_value() {
        let state = MemorySessionState::new();
        let first = state.get_or_set("id", &mut || Bytes::from_static(b"one"));
        let second = state.get_or_set("id", &mut || Bytes::from_static(b"two"));
        assert_eq!(first, second);
        assert_eq!(state.keys(), vec!["id".to_string()]);
    }
}
