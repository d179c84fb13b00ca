use std::collections::HashMap;

use crate::raft::state::Command;

/// The replicated key-value state machine.
///
/// Committed log entries are delivered here by the apply loop, in index
/// order. Application is idempotent per index: replaying an entry at or
/// below `applied_index` (e.g. during post-restart log replay) is a no-op,
/// so no index can ever be applied twice with different effects.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
    applied_index: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the committed entry at `index` to the map.
    pub fn apply(&mut self, index: u64, command: &Command) {
        if index <= self.applied_index {
            return;
        }
        self.applied_index = index;

        match command {
            Command::Put { key, value } => {
                self.data.insert(key.clone(), value.clone());
            }
            Command::Delete { key } => {
                self.data.remove(key);
            }
            Command::Noop => {}
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// Highest log index reflected in the map.
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of the whole map, for the dump endpoint.
    pub fn dump(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Command {
        Command::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_put_and_get() {
        let mut store = KvStore::new();
        store.apply(1, &put("foo", "bar"));

        assert_eq!(store.get("foo"), Some(&"bar".to_string()));
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.applied_index(), 1);
    }

    #[test]
    fn test_delete() {
        let mut store = KvStore::new();
        store.apply(1, &put("foo", "bar"));
        store.apply(
            2,
            &Command::Delete {
                key: "foo".to_string(),
            },
        );

        assert_eq!(store.get("foo"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_noop_advances_applied_index_only() {
        let mut store = KvStore::new();
        store.apply(1, &Command::Noop);

        assert!(store.is_empty());
        assert_eq!(store.applied_index(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut store = KvStore::new();
        store.apply(1, &put("k", "first"));
        store.apply(2, &put("k", "second"));

        // Replaying an already-applied index must not clobber later state.
        store.apply(1, &put("k", "first"));

        assert_eq!(store.get("k"), Some(&"second".to_string()));
        assert_eq!(store.applied_index(), 2);
    }

    #[test]
    fn test_dump() {
        let mut store = KvStore::new();
        store.apply(1, &put("a", "1"));
        store.apply(2, &put("b", "2"));

        let dump = store.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump.get("a"), Some(&"1".to_string()));
    }
}
