//! Per-node storage state: one slice manager per `(level, sub_level)`
//! directory plus the item index over all of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{format_err, Error};

use crate::tools::{disk_usage, epoch_now};
use crate::types::{
    CapacityInfo, IndexEntry, ItemHeader, ItemPointer, KeyTriple, Level, Seek, SliceId, SubLevel,
    ST_ITEM_DELETED,
};
use crate::wire::StorageError;

use super::item_index::ItemIndex;
use super::slice_manager::SliceManager;

pub struct Storage {
    data_path: PathBuf,
    min_disk_free: f64,
    max_slice_size: u32,
    fsync: bool,
    levels: RwLock<HashMap<(Level, SubLevel), Arc<SliceManager>>>,
    items: ItemIndex,
    op_counter: AtomicU32,
}

impl Storage {
    /// Open every `(level, sub_level)` tree under `data_path`,
    /// rebuilding slice indexes as needed, and replay all records
    /// into the item index.
    pub fn open(
        data_path: &Path,
        min_disk_free: f64,
        max_slice_size: u32,
        fsync: bool,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(data_path)?;

        let storage = Self {
            data_path: data_path.to_owned(),
            min_disk_free,
            max_slice_size,
            fsync,
            levels: RwLock::new(HashMap::new()),
            items: ItemIndex::new(),
            op_counter: AtomicU32::new(0),
        };

        for (level, sub_level) in list_level_dirs(data_path)? {
            storage.level_manager(level, sub_level, true)?;
        }

        log::info!(
            "storage opened at {:?}: {} levels, {} items",
            data_path,
            storage.levels.read().unwrap().len(),
            storage.items.len()
        );
        Ok(storage)
    }

    fn level_manager(
        &self,
        level: Level,
        sub_level: SubLevel,
        create: bool,
    ) -> Result<Option<Arc<SliceManager>>, Error> {
        if let Some(manager) = self.levels.read().unwrap().get(&(level, sub_level)) {
            return Ok(Some(manager.clone()));
        }
        if !create {
            return Ok(None);
        }

        let mut levels = self.levels.write().unwrap();
        if let Some(manager) = levels.get(&(level, sub_level)) {
            return Ok(Some(manager.clone()));
        }

        let path = self
            .data_path
            .join(level.to_string())
            .join(sub_level.to_string());
        let (manager, entries) =
            SliceManager::open(&path, self.min_disk_free, self.max_slice_size, self.fsync)?;
        for entry in entries {
            self.items.replay(entry);
        }
        let manager = Arc::new(manager);
        levels.insert((level, sub_level), manager.clone());
        Ok(Some(manager))
    }

    /// Stamp a fresh modification ordinal unless the caller (a
    /// replicating primary) already declared one.
    fn stamp(&self, header: &mut ItemHeader) {
        if header.time_tag.is_zero() {
            header.time_tag.mod_time = epoch_now();
            header.time_tag.op = self.op_counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Persist one item; returns where it landed and the header as
    /// written (time tag stamped).
    pub fn put(
        &self,
        mut header: ItemHeader,
        payload: &[u8],
    ) -> Result<(ItemPointer, ItemHeader), Error> {
        self.stamp(&mut header);
        let manager = self
            .level_manager(header.level, header.sub_level, true)?
            .ok_or_else(|| format_err!("level manager vanished"))?;
        let pointer = manager.add(&header, payload)?;
        self.items.replay(IndexEntry { pointer, header });
        Ok((pointer, header))
    }

    /// Append a tombstone for the key; deleting an unknown key is
    /// fine (the tombstone still wins over laggard replicas).
    pub fn delete(&self, mut header: ItemHeader) -> Result<ItemHeader, Error> {
        header.status |= ST_ITEM_DELETED;
        header.size = 0;
        self.stamp(&mut header);
        let manager = self
            .level_manager(header.level, header.sub_level, true)?
            .ok_or_else(|| format_err!("level manager vanished"))?;
        let pointer = manager.add(&header, &[])?;
        self.items.replay(IndexEntry { pointer, header });
        Ok(header)
    }

    /// Current live header for the key.
    pub fn item_info(&self, key: &KeyTriple) -> Option<ItemHeader> {
        self.items.lookup_live(key).map(|entry| entry.header)
    }

    /// Full current version, tombstones included (replication pull
    /// compares tags before fetching).
    pub fn item_version(&self, key: &KeyTriple) -> Option<IndexEntry> {
        self.items.lookup(key)
    }

    /// Read header + payload; a NULL pointer resolves the current
    /// version by key, an explicit pointer addresses one record.
    pub fn get(&self, expected: &ItemHeader, pointer: &ItemPointer) -> Result<Vec<u8>, Error> {
        let manager = self
            .level_manager(expected.level, expected.sub_level, false)?
            .ok_or(StorageError::NotFound)?;

        if pointer.is_null() {
            let entry = self
                .items
                .lookup_live(&expected.key())
                .ok_or(StorageError::NotFound)?;
            manager.get(&entry.pointer, &entry.header)
        } else {
            manager.get(pointer, expected)
        }
    }

    /// `load_index` of the addressed level directory (SYNC_NEXT).
    pub fn load_index(
        &self,
        level: Level,
        sub_level: SubLevel,
        buf: &mut Vec<u8>,
        slice_id: &mut SliceId,
        seek: &mut Seek,
    ) -> Result<bool, Error> {
        let manager = self
            .level_manager(level, sub_level, false)?
            .ok_or(StorageError::NotFound)?;
        manager.load_index(buf, slice_id, seek)
    }

    pub fn capacity(&self) -> CapacityInfo {
        match disk_usage(&self.data_path) {
            Ok(status) => CapacityInfo {
                total_bytes: status.total,
                free_bytes: status.avail,
            },
            Err(err) => {
                log::error!("statfs on {:?} failed - {}", self.data_path, err);
                CapacityInfo::default()
            }
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Level pairs currently present on this node.
    pub fn levels(&self) -> Vec<(Level, SubLevel)> {
        let mut levels: Vec<_> = self.levels.read().unwrap().keys().copied().collect();
        levels.sort_unstable();
        levels
    }

    pub fn flush(&self) -> Result<(), Error> {
        for manager in self.levels.read().unwrap().values() {
            manager.flush()?;
        }
        Ok(())
    }
}

fn list_level_dirs(data_path: &Path) -> Result<Vec<(Level, SubLevel)>, Error> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(data_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let level: Level = match entry.file_name().to_string_lossy().parse() {
            Ok(level) => level,
            Err(_) => continue,
        };
        for sub_entry in std::fs::read_dir(entry.path())? {
            let sub_entry = sub_entry?;
            if !sub_entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(sub_level) = sub_entry.file_name().to_string_lossy().parse::<SubLevel>() {
                found.push((level, sub_level));
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}
