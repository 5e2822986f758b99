use ringkv_lib::{distance, hash_identifier, Identifier};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::node::lock;

/// Key/value pairs for the slice of the ring this node currently owns.
///
/// Every operation, migration included, serializes on a single lock.
#[derive(Debug, Default)]
pub struct DataStore {
    entries: Mutex<HashMap<String, String>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, value: String) {
        lock(&self.entries).insert(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        lock(&self.entries).remove(key)
    }

    pub fn search(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    /// Removes and returns every entry whose identifier is clockwise-closer to
    /// `joining_id` than to `owner_id`. A key sitting exactly on the joining
    /// identifier moves; one sitting exactly on the owner stays.
    pub fn extract_keys_closer_to(
        &self,
        joining_id: Identifier,
        owner_id: Identifier,
    ) -> Vec<(String, String)> {
        let mut entries = lock(&self.entries);
        let moving: Vec<String> = entries
            .keys()
            .filter(|key| {
                let key_id = hash_identifier(key);
                distance(key_id, joining_id) < distance(key_id, owner_id)
            })
            .cloned()
            .collect();

        moving
            .into_iter()
            .filter_map(|key| entries.remove_entry(&key))
            .collect()
    }

    /// Copy of all entries, for status reporting and invariant checks.
    pub fn snapshot(&self) -> HashMap<String, String> {
        lock(&self.entries).clone()
    }
}
