//! The placement index: key space -> range -> storage replicas.
//!
//! One [`RangeIndex`] exists per `(level, sub_level)`; it maps
//! `item_key / range_size` to a [`Range`] owning an ordered replica
//! list. Everything is loaded from the metadata store at startup and
//! refreshed on demand when a key hits an unknown range. Updates
//! mutate the live objects so `Arc`s held by in-flight requests stay
//! meaningful.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Error};
use percent_encoding::percent_decode_str;

use crate::types::{ItemHeader, ItemKey, Level, SubLevel};

use super::cluster::{ClusterManager, StorageNode};
use super::meta::{MetaStore, RangeIndexRow, RangeRow};

pub struct Range {
    range_id: u64,
    range_index: u64,
    storages: RwLock<Vec<Arc<StorageNode>>>,
}

impl Range {
    fn from_row(row: &RangeRow, cluster: &ClusterManager) -> Arc<Self> {
        Arc::new(Self {
            range_id: row.range_id,
            range_index: row.range_index,
            storages: RwLock::new(cluster.nodes_for(&row.storages)),
        })
    }

    pub fn range_id(&self) -> u64 {
        self.range_id
    }

    pub fn range_index(&self) -> u64 {
        self.range_index
    }

    /// Snapshot of the ordered replica list (primary first).
    pub fn storages(&self) -> Vec<Arc<StorageNode>> {
        self.storages.read().unwrap().clone()
    }

    /// Merge a refreshed row: replicas vanished from the row are
    /// removed atomically, new ones appended; kept nodes retain their
    /// `Arc` identity.
    pub fn update(&self, row: &RangeRow, cluster: &ClusterManager) {
        let mut storages = self.storages.write().unwrap();
        storages.retain(|node| row.storages.contains(&node.id()));
        for id in &row.storages {
            if storages.iter().any(|node| node.id() == *id) {
                continue;
            }
            if let Some(node) = cluster.node(*id) {
                storages.push(node);
            } else {
                log::warn!("range {} references unknown storage {}", self.range_id, id);
            }
        }
    }
}

pub struct RangeIndex {
    index_id: u32,
    level: Level,
    sub_level: SubLevel,
    range_size: u64,
    ranges: RwLock<HashMap<u64, Arc<Range>>>,
}

impl RangeIndex {
    pub fn new(row: &RangeIndexRow) -> Self {
        Self {
            index_id: row.index_id,
            level: row.level,
            sub_level: row.sub_level,
            range_size: row.range_size.max(1),
            ranges: RwLock::new(HashMap::new()),
        }
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn sub_level(&self) -> SubLevel {
        self.sub_level
    }

    pub fn calc_range_index(&self, item_key: ItemKey) -> u64 {
        item_key / self.range_size
    }

    pub fn find(&self, range_index: u64) -> Option<Arc<Range>> {
        self.ranges.read().unwrap().get(&range_index).cloned()
    }

    pub fn add(&self, row: &RangeRow, cluster: &ClusterManager) -> Arc<Range> {
        let mut ranges = self.ranges.write().unwrap();
        match ranges.get(&row.range_index) {
            Some(range) => {
                range.update(row, cluster);
                range.clone()
            }
            None => {
                let range = Range::from_row(row, cluster);
                ranges.insert(row.range_index, range.clone());
                range
            }
        }
    }

    /// Miss-driven load. Double-checked: a row fetched concurrently
    /// by another task wins and the duplicate is discarded.
    pub fn load_range(
        &self,
        range_index: u64,
        meta: &dyn MetaStore,
        cluster: &ClusterManager,
    ) -> Result<Option<Arc<Range>>, Error> {
        if let Some(range) = self.find(range_index) {
            return Ok(Some(range));
        }

        let row = match meta.load_range(self.index_id, range_index)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut ranges = self.ranges.write().unwrap();
        if let Some(existing) = ranges.get(&range_index) {
            return Ok(Some(existing.clone()));
        }
        let range = Range::from_row(&row, cluster);
        ranges.insert(range_index, range.clone());
        Ok(Some(range))
    }
}

/// All range indexes known to a manager, addressed by level pair.
#[derive(Default)]
pub struct IndexManager {
    levels: RwLock<HashMap<(Level, SubLevel), Arc<RangeIndex>>>,
    by_id: RwLock<HashMap<u32, Arc<RangeIndex>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every known level and its ranges from the metadata store.
    pub fn load_all(&self, meta: &dyn MetaStore, cluster: &ClusterManager) -> Result<(), Error> {
        for row in meta.load_index_ranges()? {
            self.add_level_index(&row);
        }
        for row in meta.load_ranges()? {
            match self.by_id.read().unwrap().get(&row.index_id) {
                Some(index) => {
                    index.add(&row, cluster);
                }
                None => log::warn!(
                    "range {} references unknown range index {}",
                    row.range_id,
                    row.index_id
                ),
            }
        }
        Ok(())
    }

    pub fn find(&self, level: Level, sub_level: SubLevel) -> Option<Arc<RangeIndex>> {
        self.levels.read().unwrap().get(&(level, sub_level)).cloned()
    }

    /// Insert a level's range index; an existing one is kept.
    pub fn add_level_index(&self, row: &RangeIndexRow) -> Arc<RangeIndex> {
        let mut levels = self.levels.write().unwrap();
        if let Some(index) = levels.get(&(row.level, row.sub_level)) {
            return index.clone();
        }
        let index = Arc::new(RangeIndex::new(row));
        levels.insert((row.level, row.sub_level), index.clone());
        self.by_id
            .write()
            .unwrap()
            .insert(row.index_id, index.clone());
        index
    }

    /// Find a level's index, refreshing from the metadata store on a
    /// miss (a level created through another manager).
    pub fn ensure_level(
        &self,
        level: Level,
        sub_level: SubLevel,
        meta: &dyn MetaStore,
    ) -> Result<Option<Arc<RangeIndex>>, Error> {
        if let Some(index) = self.find(level, sub_level) {
            return Ok(Some(index));
        }
        for row in meta.load_index_ranges()? {
            self.add_level_index(&row);
        }
        Ok(self.find(level, sub_level))
    }

    pub fn level_count(&self) -> usize {
        self.levels.read().unwrap().len()
    }
}

/// Parse `/<level>/<sub_level>/<item_key_hex>.<crc_hex>` into an item
/// header plus the 32-bit content CRC.
pub fn parse_url(path: &str) -> Result<(ItemHeader, u32), Error> {
    let decoded = percent_decode_str(path).decode_utf8()?;
    let mut parts = decoded.split('/').filter(|part| !part.is_empty());

    let level: Level = match parts.next().map(str::parse) {
        Some(Ok(level)) => level,
        _ => bail!("bad level in url {:?}", path),
    };
    let sub_level: SubLevel = match parts.next().map(str::parse) {
        Some(Ok(sub_level)) => sub_level,
        _ => bail!("bad sub level in url {:?}", path),
    };
    let file = match parts.next() {
        Some(file) => file,
        None => bail!("missing file name in url {:?}", path),
    };
    if parts.next().is_some() {
        bail!("trailing path components in url {:?}", path);
    }

    let (key_hex, crc_hex) = match file.split_once('.') {
        Some(split) => split,
        None => bail!("missing crc suffix in url {:?}", path),
    };
    let item_key = ItemKey::from_str_radix(key_hex, 16)
        .map_err(|_| anyhow::format_err!("bad item key in url {:?}", path))?;
    let crc = u32::from_str_radix(crc_hex, 16)
        .map_err(|_| anyhow::format_err!("bad crc in url {:?}", path))?;

    let header = ItemHeader {
        level,
        sub_level,
        item_key,
        ..Default::default()
    };
    Ok((header, crc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::meta::{MemMetaStore, StorageRow};
    use crate::manager::cluster::NODE_STATUS_OK;

    fn index_row() -> RangeIndexRow {
        RangeIndexRow {
            index_id: 1,
            level: 1,
            sub_level: 1,
            range_size: 1024,
        }
    }

    fn storage_row(id: u32) -> StorageRow {
        StorageRow {
            id,
            addr: format!("127.0.0.1:{}", 7790 + id),
            capacity_total: 1000,
            capacity_free: 1000,
            status: NODE_STATUS_OK,
        }
    }

    #[test]
    fn range_index_math() {
        let index = RangeIndex::new(&index_row());
        assert_eq!(index.calc_range_index(0), 0);
        assert_eq!(index.calc_range_index(1023), 0);
        assert_eq!(index.calc_range_index(1024), 1);
    }

    #[test]
    fn load_range_on_miss() {
        let meta = MemMetaStore::new();
        let cluster = ClusterManager::new(0.05);
        cluster.load(&[storage_row(1)]).unwrap();
        meta.add_range(RangeRow {
            range_id: 5,
            index_id: 1,
            range_index: 2,
            storages: vec![1],
        });

        let index = RangeIndex::new(&index_row());
        assert!(index.find(2).is_none());

        let range = index.load_range(2, &meta, &cluster).unwrap().unwrap();
        assert_eq!(range.range_id(), 5);
        assert_eq!(range.storages().len(), 1);

        // second lookup is a pure cache hit
        meta.set_unreachable(true);
        assert!(index.load_range(2, &meta, &cluster).unwrap().is_some());
        assert!(index.load_range(3, &meta, &cluster).is_err());
    }

    #[test]
    fn update_preserves_node_identity() {
        let cluster = ClusterManager::new(0.05);
        cluster
            .load(&[storage_row(1), storage_row(2), storage_row(3)])
            .unwrap();
        let row = RangeRow {
            range_id: 9,
            index_id: 1,
            range_index: 0,
            storages: vec![1, 2],
        };
        let range = Range::from_row(&row, &cluster);
        let kept = range.storages()[0].clone();

        let refreshed = RangeRow {
            storages: vec![1, 3],
            ..row
        };
        range.update(&refreshed, &cluster);

        let storages = range.storages();
        assert_eq!(
            storages.iter().map(|node| node.id()).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(Arc::ptr_eq(&kept, &storages[0]));
    }

    #[test]
    fn url_parsing() {
        let (header, crc) = parse_url("/1/2/00ff.1a2b3c4d").unwrap();
        assert_eq!(header.level, 1);
        assert_eq!(header.sub_level, 2);
        assert_eq!(header.item_key, 0xff);
        assert_eq!(crc, 0x1a2b3c4d);

        assert!(parse_url("/1/2/00ff").is_err());
        assert!(parse_url("/300/2/00ff.0").is_err());
        assert!(parse_url("/1/2").is_err());
        assert!(parse_url("/1/2/xyz.0").is_err());
        assert!(parse_url("/1/2/0.0/extra").is_err());
    }
}
