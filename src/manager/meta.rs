//! Placement metadata interface.
//!
//! The relational store backing range metadata is an external
//! collaborator; the manager core only consumes this trait. The
//! shipped implementation keeps the rows in one JSON file (enough for
//! small deployments and for the administrative flow to edit by
//! hand); tests use the in-memory variant.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use crate::tools::replace_file;
use crate::types::{Level, SubLevel};

/// Key-space width assigned to newly created range indexes.
pub const DEFAULT_RANGE_SIZE: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRow {
    pub id: u32,
    pub addr: String,
    pub capacity_total: u64,
    pub capacity_free: u64,
    pub status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeIndexRow {
    pub index_id: u32,
    pub level: Level,
    pub sub_level: SubLevel,
    pub range_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRow {
    pub range_id: u64,
    pub index_id: u32,
    pub range_index: u64,
    /// Ordered replica list; the first entry is the primary.
    pub storages: Vec<u32>,
}

pub trait MetaStore: Send + Sync {
    fn load_storages(&self) -> Result<Vec<StorageRow>, Error>;
    fn load_index_ranges(&self) -> Result<Vec<RangeIndexRow>, Error>;
    fn load_ranges(&self) -> Result<Vec<RangeRow>, Error>;
    /// Single-range fetch for miss-driven loading.
    fn load_range(&self, index_id: u32, range_index: u64) -> Result<Option<RangeRow>, Error>;
    /// Create a `(level, sub_level)`; `None` when it already exists.
    fn add_level(&self, level: Level, sub_level: SubLevel) -> Result<Option<RangeIndexRow>, Error>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaFile {
    #[serde(default)]
    storages: Vec<StorageRow>,
    #[serde(default)]
    index_ranges: Vec<RangeIndexRow>,
    #[serde(default)]
    ranges: Vec<RangeRow>,
}

impl MetaFile {
    fn next_index_id(&self) -> u32 {
        self.index_ranges
            .iter()
            .map(|row| row.index_id + 1)
            .max()
            .unwrap_or(1)
    }
}

/// Metadata rows in one JSON file; every read hits the file so
/// administrative edits are picked up without a restart.
pub struct JsonMetaStore {
    path: PathBuf,
    // serializes read-modify-write cycles of add_level
    write_lock: Mutex<()>,
}

impl JsonMetaStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let store = Self {
            path: path.to_owned(),
            write_lock: Mutex::new(()),
        };
        if !path.exists() {
            log::warn!("metadata file {:?} does not exist yet - starting empty", path);
        } else {
            store.read_file()?;
        }
        Ok(store)
    }

    fn read_file(&self) -> Result<MetaFile, Error> {
        if !self.path.exists() {
            return Ok(MetaFile::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|err| format_err!("unable to read metadata {:?} - {}", self.path, err))?;
        serde_json::from_str(&raw)
            .map_err(|err| format_err!("unable to parse metadata {:?} - {}", self.path, err))
    }

    fn write_file(&self, file: &MetaFile) -> Result<(), Error> {
        let raw = serde_json::to_vec_pretty(file)?;
        replace_file(&self.path, &raw)
    }
}

impl MetaStore for JsonMetaStore {
    fn load_storages(&self) -> Result<Vec<StorageRow>, Error> {
        Ok(self.read_file()?.storages)
    }

    fn load_index_ranges(&self) -> Result<Vec<RangeIndexRow>, Error> {
        Ok(self.read_file()?.index_ranges)
    }

    fn load_ranges(&self) -> Result<Vec<RangeRow>, Error> {
        Ok(self.read_file()?.ranges)
    }

    fn load_range(&self, index_id: u32, range_index: u64) -> Result<Option<RangeRow>, Error> {
        Ok(self
            .read_file()?
            .ranges
            .into_iter()
            .find(|row| row.index_id == index_id && row.range_index == range_index))
    }

    fn add_level(&self, level: Level, sub_level: SubLevel) -> Result<Option<RangeIndexRow>, Error> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = self.read_file()?;
        if file
            .index_ranges
            .iter()
            .any(|row| row.level == level && row.sub_level == sub_level)
        {
            return Ok(None);
        }
        let row = RangeIndexRow {
            index_id: file.next_index_id(),
            level,
            sub_level,
            range_size: DEFAULT_RANGE_SIZE,
        };
        file.index_ranges.push(row.clone());
        self.write_file(&file)?;
        Ok(Some(row))
    }
}

/// In-memory metadata rows for tests; `fail` simulates an unreachable
/// store.
#[derive(Default)]
pub struct MemMetaStore {
    state: Mutex<MetaFile>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_storage(&self, row: StorageRow) {
        self.state.lock().unwrap().storages.push(row);
    }

    pub fn add_index_range(&self, row: RangeIndexRow) {
        self.state.lock().unwrap().index_ranges.push(row);
    }

    pub fn add_range(&self, row: RangeRow) {
        self.state.lock().unwrap().ranges.push(row);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            bail!("metadata store unreachable");
        }
        Ok(())
    }
}

impl MetaStore for MemMetaStore {
    fn load_storages(&self) -> Result<Vec<StorageRow>, Error> {
        self.check()?;
        Ok(self.state.lock().unwrap().storages.clone())
    }

    fn load_index_ranges(&self) -> Result<Vec<RangeIndexRow>, Error> {
        self.check()?;
        Ok(self.state.lock().unwrap().index_ranges.clone())
    }

    fn load_ranges(&self) -> Result<Vec<RangeRow>, Error> {
        self.check()?;
        Ok(self.state.lock().unwrap().ranges.clone())
    }

    fn load_range(&self, index_id: u32, range_index: u64) -> Result<Option<RangeRow>, Error> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .ranges
            .iter()
            .find(|row| row.index_id == index_id && row.range_index == range_index)
            .cloned())
    }

    fn add_level(&self, level: Level, sub_level: SubLevel) -> Result<Option<RangeIndexRow>, Error> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state
            .index_ranges
            .iter()
            .any(|row| row.level == level && row.sub_level == sub_level)
        {
            return Ok(None);
        }
        let row = RangeIndexRow {
            index_id: state.next_index_id(),
            level,
            sub_level,
            range_size: DEFAULT_RANGE_SIZE,
        };
        state.index_ranges.push(row.clone());
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_level_is_persistent_and_conflict_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let store = JsonMetaStore::open(&path).unwrap();

        let row = store.add_level(1, 2).unwrap().unwrap();
        assert_eq!(row.range_size, DEFAULT_RANGE_SIZE);
        assert!(store.add_level(1, 2).unwrap().is_none());

        // a second store instance sees the new level
        let other = JsonMetaStore::open(&path).unwrap();
        assert_eq!(other.load_index_ranges().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_metadata_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(JsonMetaStore::open(&path).is_err());
    }
}
