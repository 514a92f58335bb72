//! Local key to database key mappings

use std::collections::{BTreeMap, HashSet};

use crate::batch::Key;

/// Mapping from one target's original local keys to database keys
///
/// Keys are the values the batch arrived with, so a collision swap that
/// moves an unresolved row never touches the map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierMap {
    resolved: BTreeMap<Key, Key>,
    db_ids: HashSet<Key>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database key for an original local key
    pub fn get(&self, local: Key) -> Option<Key> {
        self.resolved.get(&local).copied()
    }

    /// Database key for a local key, or the key itself when unmapped
    pub fn resolve(&self, local: Key) -> Key {
        self.get(local).unwrap_or(local)
    }

    /// Record a resolution
    ///
    /// An original key is mapped once; a second insert for the same key
    /// keeps the first mapping and returns false.
    pub fn insert(&mut self, local: Key, db: Key) -> bool {
        if self.resolved.contains_key(&local) {
            return false;
        }
        self.resolved.insert(local, db);
        self.db_ids.insert(db);
        true
    }

    /// Whether some row of this target already resolved to `db`
    pub fn contains_db_id(&self, db: Key) -> bool {
        self.db_ids.contains(&db)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Resolutions ordered by original local key
    pub fn iter(&self) -> impl Iterator<Item = (Key, Key)> + '_ {
        self.resolved.iter().map(|(l, d)| (*l, *d))
    }
}
