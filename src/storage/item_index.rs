//! In-memory map from item key to its current version.
//!
//! ITEM_INFO and key-addressed GETs answer from this map; the slice
//! files stay append-only underneath. The map is rebuilt at open by
//! replaying index records and kept current on every add and delete.
//! Replay is last-writer-wins by `time_tag`; a record with an equal
//! tag replaces the previous one, so within one replica arrival order
//! breaks ties.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{IndexEntry, KeyTriple};

#[derive(Default)]
pub struct ItemIndex {
    items: RwLock<HashMap<KeyTriple, IndexEntry>>,
}

impl ItemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record into the map, honoring the version order.
    pub fn replay(&self, entry: IndexEntry) {
        let mut items = self.items.write().unwrap();
        match items.get_mut(&entry.header.key()) {
            Some(current) => {
                if entry.header.time_tag >= current.header.time_tag {
                    *current = entry;
                }
            }
            None => {
                items.insert(entry.header.key(), entry);
            }
        }
    }

    /// Current version of a key, tombstones included.
    pub fn lookup(&self, key: &KeyTriple) -> Option<IndexEntry> {
        self.items.read().unwrap().get(key).copied()
    }

    /// Current version of a key, `None` when absent or deleted.
    pub fn lookup_live(&self, key: &KeyTriple) -> Option<IndexEntry> {
        self.lookup(key).filter(|entry| !entry.header.is_deleted())
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemHeader, ItemPointer, TimeTag, ST_ITEM_DELETED};

    fn entry(item_key: u64, mod_time: u32, op: u32, status: u8) -> IndexEntry {
        IndexEntry {
            pointer: ItemPointer {
                slice_id: 0,
                seek: mod_time,
            },
            header: ItemHeader {
                status,
                level: 1,
                sub_level: 1,
                item_key,
                time_tag: TimeTag { mod_time, op },
                size: 4,
                ..Default::default()
            },
        }
    }

    #[test]
    fn last_writer_wins() {
        let index = ItemIndex::new();
        index.replay(entry(1, 10, 0, 0));
        index.replay(entry(1, 5, 99, 0));

        let current = index.lookup(&(1, 1, 1)).unwrap();
        assert_eq!(current.header.time_tag.mod_time, 10);
    }

    #[test]
    fn op_breaks_same_second_ties() {
        let index = ItemIndex::new();
        index.replay(entry(1, 10, 2, 0));
        index.replay(entry(1, 10, 1, 0));
        assert_eq!(index.lookup(&(1, 1, 1)).unwrap().header.time_tag.op, 2);
    }

    #[test]
    fn tombstone_supersedes_and_is_superseded() {
        let index = ItemIndex::new();
        index.replay(entry(1, 10, 0, 0));
        index.replay(entry(1, 11, 0, ST_ITEM_DELETED));
        assert!(index.lookup_live(&(1, 1, 1)).is_none());
        assert!(index.lookup(&(1, 1, 1)).is_some());

        // a later live version revives the key
        index.replay(entry(1, 12, 0, 0));
        assert!(index.lookup_live(&(1, 1, 1)).is_some());
    }
}
