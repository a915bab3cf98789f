use crate::protocol::TIME_KEY;
use std::collections::{BTreeMap, HashMap};

/// Outcome of applying one key/value update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreUpdate {
    /// Value was new or different and has been stored
    Changed,
    /// Value equals the stored one
    Unchanged,
    /// Key is never stored
    Ignored,
}

impl StoreUpdate {
    pub fn is_changed(&self) -> bool {
        matches!(self, StoreUpdate::Changed)
    }
}

/// Local mirror of a device's parameters, keyed by command path
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: HashMap<String, String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` if it differs from the current value
    ///
    /// Comparison is exact string equality. `TIME;VALUE` is always ignored.
    pub fn apply(&mut self, key: &str, value: &str) -> StoreUpdate {
        if key == TIME_KEY {
            return StoreUpdate::Ignored;
        }
        if self.params.get(key).map(String::as_str) == Some(value) {
            return StoreUpdate::Unchanged;
        }
        self.params.insert(key.to_string(), value.to_string());
        StoreUpdate::Changed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Sorted copy of every stored parameter
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
