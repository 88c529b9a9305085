//! A slice pair: one data file and one index file holding many packed
//! items.
//!
//! The data file is a sequence of `ItemHeader` + payload records in
//! write order and is never rewritten. The index file carries one
//! 32-byte [`IndexEntry`] per write, tombstones included. The data
//! file is authoritative: on open the data records are scanned and the
//! index is rebuilt whenever it disagrees (missing, short, or
//! truncated), so losing an index file costs a scan, never data.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use crate::types::{
    IndexEntry, ItemHeader, ItemPointer, Seek, SliceId, INDEX_ENTRY_SIZE, ITEM_HEADER_SIZE,
};
use crate::wire::{MAX_INDEX_CHUNK, PACKET_FINISHED_FLAG};

pub struct Slice {
    id: SliceId,
    data: File,
    index: File,
    fsync: bool,
    write: Mutex<WriteState>,
}

struct WriteState {
    data_len: Seek,
    index_len: Seek,
}

fn data_file_path(level_dir: &Path, id: SliceId) -> PathBuf {
    level_dir.join("data").join(id.to_string())
}

fn index_file_path(level_dir: &Path, id: SliceId) -> PathBuf {
    level_dir.join("index").join(id.to_string())
}

impl Slice {
    /// Open (or create) the pair for `id` under `level_dir`, scan the
    /// data file, and repair the index if needed. Returns the slice
    /// and every record it holds, in write order.
    pub fn open(level_dir: &Path, id: SliceId, fsync: bool) -> Result<(Self, Vec<IndexEntry>), Error> {
        let data_path = data_file_path(level_dir, id);
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .map_err(|err| format_err!("unable to open slice data file {:?} - {}", data_path, err))?;

        let index_path = index_file_path(level_dir, id);
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index_path)
            .map_err(|err| format_err!("unable to open slice index file {:?} - {}", index_path, err))?;

        let raw_len = data.metadata()?.len();
        if raw_len > u32::MAX as u64 {
            bail!("slice data file {:?} too large ({} bytes)", data_path, raw_len);
        }

        let (entries, good_len) = scan_data(&data, id, raw_len as Seek)?;

        if (good_len as u64) < raw_len {
            log::warn!(
                "slice {}: discarding {} trailing bytes of interrupted write",
                id,
                raw_len - good_len as u64
            );
            data.set_len(good_len as u64)?;
            data.sync_data()?;
        }

        let expected_index_len = (entries.len() * INDEX_ENTRY_SIZE) as u64;
        let index_len = index.metadata()?.len();
        if index_len != expected_index_len {
            log::warn!(
                "slice {}: index has {} bytes, data implies {} - rebuilding index from data",
                id,
                index_len,
                expected_index_len
            );
            rebuild_index(&index, &entries)?;
        }

        let slice = Self {
            id,
            data,
            index,
            fsync,
            write: Mutex::new(WriteState {
                data_len: good_len,
                index_len: expected_index_len as Seek,
            }),
        };
        Ok((slice, entries))
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn data_len(&self) -> Seek {
        self.write.lock().unwrap().data_len
    }

    pub fn index_len(&self) -> Seek {
        self.write.lock().unwrap().index_len
    }

    /// Append one record to data and index; returns where it landed.
    pub fn append(&self, header: &ItemHeader, payload: &[u8]) -> Result<ItemPointer, Error> {
        if payload.len() != header.size as usize {
            bail!(
                "header declares {} payload bytes, got {}",
                header.size,
                payload.len()
            );
        }

        let mut state = self.write.lock().unwrap();

        let record_len = ITEM_HEADER_SIZE as u64 + payload.len() as u64;
        if state.data_len as u64 + record_len > u32::MAX as u64 {
            bail!("slice {} exceeds the addressable size", self.id);
        }

        let pointer = ItemPointer {
            slice_id: self.id,
            seek: state.data_len,
        };

        let mut record = Vec::with_capacity(ITEM_HEADER_SIZE + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(payload);
        self.data.write_all_at(&record, state.data_len as u64)?;

        let entry = IndexEntry {
            pointer,
            header: *header,
        };
        self.index
            .write_all_at(&entry.to_bytes(), state.index_len as u64)?;

        if self.fsync {
            self.data.sync_data()?;
            self.index.sync_data()?;
        }

        state.data_len += record.len() as Seek;
        state.index_len += INDEX_ENTRY_SIZE as Seek;

        Ok(pointer)
    }

    /// Positional read of header + payload; the stored record must
    /// match the expected key triple, size, and be live.
    pub fn read(&self, pointer: &ItemPointer, expected: &ItemHeader) -> Result<Vec<u8>, Error> {
        use crate::wire::StorageError;

        let mut buf = vec![0u8; ITEM_HEADER_SIZE + expected.size as usize];
        if self.data.read_exact_at(&mut buf, pointer.seek as u64).is_err() {
            return Err(StorageError::NotFound.into());
        }

        let stored = ItemHeader::from_bytes(&buf)?;
        if stored.key() != expected.key() || stored.size != expected.size || stored.is_deleted() {
            return Err(StorageError::NotFound.into());
        }
        Ok(buf)
    }

    /// Copy one framed chunk of raw index bytes starting at `seek`
    /// into `buf`. Returns the chunk length and whether it ends the
    /// slice, or `None` when `seek` is already past the end.
    pub fn read_index_chunk(&self, seek: Seek, buf: &mut Vec<u8>) -> Result<Option<(Seek, bool)>, Error> {
        let index_len = self.index_len();
        if seek >= index_len {
            return Ok(None);
        }

        let chunk = (index_len - seek).min(MAX_INDEX_CHUNK as Seek);
        let finished = seek + chunk == index_len;

        let mut word = chunk;
        if finished {
            word |= PACKET_FINISHED_FLAG;
        }
        buf.extend_from_slice(&word.to_le_bytes());

        let start = buf.len();
        buf.resize(start + chunk as usize, 0);
        self.index
            .read_exact_at(&mut buf[start..], seek as u64)?;

        Ok(Some((chunk, finished)))
    }

    pub fn flush(&self) -> Result<(), Error> {
        let _state = self.write.lock().unwrap();
        self.data.sync_data()?;
        self.index.sync_data()?;
        Ok(())
    }
}

/// Walk the data file record by record; stops at the first header that
/// is cut short or declares more payload than the file holds. Returns
/// the good records and the offset of the last good boundary.
fn scan_data(data: &File, id: SliceId, len: Seek) -> Result<(Vec<IndexEntry>, Seek), Error> {
    let mut entries = Vec::new();
    let mut offset: Seek = 0;

    while (offset as u64) + ITEM_HEADER_SIZE as u64 <= len as u64 {
        let mut raw = [0u8; ITEM_HEADER_SIZE];
        data.read_exact_at(&mut raw, offset as u64)?;
        let header = ItemHeader::from_bytes(&raw)?;

        // a corrupt size field must not wrap the offset math
        let record_len = ITEM_HEADER_SIZE as u64 + header.size as u64;
        if offset as u64 + record_len > len as u64 {
            break;
        }

        entries.push(IndexEntry {
            pointer: ItemPointer {
                slice_id: id,
                seek: offset,
            },
            header,
        });
        offset += record_len as Seek;
    }

    Ok((entries, offset))
}

fn rebuild_index(index: &File, entries: &[IndexEntry]) -> Result<(), Error> {
    let mut raw = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE);
    for entry in entries {
        raw.extend_from_slice(&entry.to_bytes());
    }
    index.set_len(0)?;
    index.write_all_at(&raw, 0)?;
    index.sync_data()?;
    Ok(())
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
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();

        let (slice, entries) = Slice::open(dir.path(), 0, false).unwrap();
        assert!(entries.is_empty());

        let header = test_header(7, 4);
        let pointer = slice.append(&header, b"test").unwrap();
        assert_eq!(pointer, ItemPointer { slice_id: 0, seek: 0 });

        let buf = slice.read(&pointer, &header).unwrap();
        assert_eq!(&buf[..ITEM_HEADER_SIZE], &header.to_bytes());
        assert_eq!(&buf[ITEM_HEADER_SIZE..], b"test");
    }

    #[test]
    fn wrong_key_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();

        let (slice, _) = Slice::open(dir.path(), 0, false).unwrap();
        let header = test_header(7, 4);
        let pointer = slice.append(&header, b"test").unwrap();

        let mut other = header;
        other.item_key = 8;
        assert!(slice.read(&pointer, &other).is_err());
    }

    #[test]
    fn truncated_trailing_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();

        {
            let (slice, _) = Slice::open(dir.path(), 3, false).unwrap();
            slice.append(&test_header(1, 4), b"good").unwrap();
        }

        // simulate an interrupted write: a full header promising more
        // payload than was persisted
        let data_path = dir.path().join("data").join("3");
        let mut raw = std::fs::read(&data_path).unwrap();
        raw.extend_from_slice(&test_header(2, 100).to_bytes());
        raw.extend_from_slice(b"partial");
        std::fs::write(&data_path, &raw).unwrap();

        let (slice, entries) = Slice::open(dir.path(), 3, false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].header.item_key, 1);
        assert_eq!(slice.data_len(), (ITEM_HEADER_SIZE + 4) as Seek);
    }
}
