//! Owns the slice pairs under one level directory.
//!
//! All writes for a `(level, sub_level)` funnel through one open
//! slice; once appending the next item would push it past the
//! configured maximum size the slice is closed for writes and a new
//! pair is allocated. Closed slices remain readable forever.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{format_err, Error};

use crate::tools::disk_usage;
use crate::types::{IndexEntry, ItemHeader, ItemPointer, Seek, SliceId, ITEM_HEADER_SIZE};
use crate::wire::StorageError;

use super::slice::Slice;

pub struct SliceManager {
    path: PathBuf,
    min_disk_free: f64,
    max_slice_size: u32,
    fsync: bool,
    slices: RwLock<BTreeMap<SliceId, Arc<Slice>>>,
    write_slice: Mutex<Option<Arc<Slice>>>,
    next_slice_id: AtomicU32,
}

impl SliceManager {
    /// Open every slice pair under `path`, rebuilding indexes where
    /// they disagree with the data files. Returns the manager and all
    /// index records in `(slice_id, write order)` sequence.
    pub fn open(
        path: &Path,
        min_disk_free: f64,
        max_slice_size: u32,
        fsync: bool,
    ) -> Result<(Self, Vec<IndexEntry>), Error> {
        std::fs::create_dir_all(path.join("data"))?;
        std::fs::create_dir_all(path.join("index"))?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(path.join("data"))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let id: SliceId = name
                .parse()
                .map_err(|_| format_err!("unexpected slice file name {:?}", name))?;
            ids.push(id);
        }
        ids.sort_unstable();

        let mut slices = BTreeMap::new();
        let mut all_entries = Vec::new();
        for id in &ids {
            let (slice, entries) = Slice::open(path, *id, fsync)?;
            all_entries.extend(entries);
            slices.insert(*id, Arc::new(slice));
        }

        let next_slice_id = ids.last().map(|id| id + 1).unwrap_or(0);

        Ok((
            Self {
                path: path.to_owned(),
                min_disk_free,
                max_slice_size,
                fsync,
                slices: RwLock::new(slices),
                write_slice: Mutex::new(None),
                next_slice_id: AtomicU32::new(next_slice_id),
            },
            all_entries,
        ))
    }

    pub fn slice_count(&self) -> usize {
        self.slices.read().unwrap().len()
    }

    /// True iff writing `size` more bytes keeps the configured
    /// fraction of the filesystem free.
    pub fn can_put(&self, size: u32) -> bool {
        match disk_usage(&self.path) {
            Ok(status) => {
                (status.avail as f64) - (size as f64) >= self.min_disk_free * (status.total as f64)
            }
            Err(err) => {
                log::error!("statfs on {:?} failed - {}", self.path, err);
                false
            }
        }
    }

    /// Append one record, allocating a fresh slice when the open one
    /// is full (an empty slice accepts any record, so oversized items
    /// still land somewhere).
    pub fn add(&self, header: &ItemHeader, payload: &[u8]) -> Result<ItemPointer, Error> {
        let need = ITEM_HEADER_SIZE as u32 + header.size;
        if !self.can_put(need) {
            return Err(StorageError::NoSpace.into());
        }

        let mut current = self.write_slice.lock().unwrap();

        let full = match current.as_ref() {
            Some(slice) => {
                let len = slice.data_len();
                len > 0 && len as u64 + need as u64 > self.max_slice_size as u64
            }
            None => true,
        };
        if full {
            let id = self.next_slice_id.fetch_add(1, Ordering::SeqCst);
            let (slice, _) = Slice::open(&self.path, id, self.fsync)?;
            let slice = Arc::new(slice);
            self.slices.write().unwrap().insert(id, slice.clone());
            *current = Some(slice);
        }

        let slice = current.as_ref().unwrap();
        slice.append(header, payload)
    }

    /// Positional read of header + payload for network handoff.
    pub fn get(&self, pointer: &ItemPointer, expected: &ItemHeader) -> Result<Vec<u8>, Error> {
        let slice = self
            .slices
            .read()
            .unwrap()
            .get(&pointer.slice_id)
            .cloned()
            .ok_or(StorageError::NotFound)?;
        slice.read(pointer, expected)
    }

    /// Emit the next framed chunk of index records at the cursor
    /// `(slice_id, seek)`, advancing the cursor. Returns `false` once
    /// no records remain at or past the cursor.
    pub fn load_index(
        &self,
        buf: &mut Vec<u8>,
        slice_id: &mut SliceId,
        seek: &mut Seek,
    ) -> Result<bool, Error> {
        let slices = self.slices.read().unwrap();
        for (id, slice) in slices.range(*slice_id..) {
            let start = if *id == *slice_id { *seek } else { 0 };
            if let Some((chunk, _finished)) = slice.read_index_chunk(start, buf)? {
                *slice_id = *id;
                *seek = start + chunk;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn flush(&self) -> Result<(), Error> {
        for slice in self.slices.read().unwrap().values() {
            slice.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeTag;

    fn test_header(item_key: u64, size: u32) -> ItemHeader {
        ItemHeader {
            level: 1,
            sub_level: 1,
            item_key,
            time_tag: TimeTag {
                mod_time: 1,
                op: 1,
            },
            size,
            ..Default::default()
        }
    }

    #[test]
    fn full_disk_floor_rejects_put() {
        let dir = tempfile::tempdir().unwrap();
        // a floor of 100% free can never be satisfied
        let (manager, _) = SliceManager::open(dir.path(), 1.0, 1000, false).unwrap();
        let err = manager.add(&test_header(1, 4), b"test").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NoSpace)
        ));
    }

    #[test]
    fn monotonic_slice_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (manager, _) = SliceManager::open(dir.path(), 0.0, 10, false).unwrap();
            manager.add(&test_header(1, 4), b"test").unwrap();
            manager.add(&test_header(2, 4), b"test").unwrap();
        }
        let (manager, entries) = SliceManager::open(dir.path(), 0.0, 10, false).unwrap();
        assert_eq!(entries.len(), 2);
        let pointer = manager.add(&test_header(3, 4), b"test").unwrap();
        assert_eq!(pointer.slice_id, 2);
    }
}
