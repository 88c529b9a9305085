//! Storage node records as the manager sees them.
//!
//! Nodes are loaded from the metadata store and kept alive for the
//! whole process: refreshes mutate the existing records so `Arc`
//! identity held by in-flight commands stays valid. Capacity fields
//! are cache, not truth - they are corrected by PUT and PING answers
//! and readers accept slightly stale values.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{format_err, Error};

use crate::types::CapacityInfo;

use super::meta::StorageRow;

/// Node is up and accepts commands.
pub const NODE_STATUS_OK: u8 = 1;

#[derive(Debug, Clone, Copy, Default)]
struct NodeCapacity {
    total: u64,
    free: u64,
}

#[derive(Debug)]
pub struct StorageNode {
    id: u32,
    addr: SocketAddr,
    min_disk_free: f64,
    state: Mutex<NodeState>,
}

#[derive(Debug)]
struct NodeState {
    status: u8,
    capacity: NodeCapacity,
}

impl StorageNode {
    fn from_row(row: &StorageRow, min_disk_free: f64) -> Result<Self, Error> {
        let addr = row
            .addr
            .parse()
            .map_err(|err| format_err!("bad storage address {:?} - {}", row.addr, err))?;
        Ok(Self {
            id: row.id,
            addr,
            min_disk_free,
            state: Mutex::new(NodeState {
                status: row.status,
                capacity: NodeCapacity {
                    total: row.capacity_total,
                    free: row.capacity_free,
                },
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_ok(&self) -> bool {
        self.state.lock().unwrap().status == NODE_STATUS_OK
    }

    /// True iff `size` more bytes keep the node above its free-space
    /// floor.
    pub fn can_put(&self, size: u32) -> bool {
        let state = self.state.lock().unwrap();
        (state.capacity.free as f64) - (size as f64)
            >= self.min_disk_free * (state.capacity.total as f64)
    }

    /// Account a successful PUT against the cached capacity.
    pub fn note_put(&self, size: u32) {
        let mut state = self.state.lock().unwrap();
        state.capacity.free = state.capacity.free.saturating_sub(size as u64);
    }

    /// Fold a PING capacity snapshot into the cache.
    pub fn update_capacity(&self, info: CapacityInfo) {
        let mut state = self.state.lock().unwrap();
        state.capacity.total = info.total_bytes;
        state.capacity.free = info.free_bytes;
    }

    fn refresh(&self, row: &StorageRow) {
        let mut state = self.state.lock().unwrap();
        state.status = row.status;
        state.capacity.total = row.capacity_total;
        state.capacity.free = row.capacity_free;
    }
}

pub struct ClusterManager {
    min_disk_free: f64,
    nodes: RwLock<HashMap<u32, Arc<StorageNode>>>,
}

impl ClusterManager {
    pub fn new(min_disk_free: f64) -> Self {
        Self {
            min_disk_free,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Load or refresh node records; existing `Arc`s are mutated in
    /// place, never replaced.
    pub fn load(&self, rows: &[StorageRow]) -> Result<(), Error> {
        let mut nodes = self.nodes.write().unwrap();
        for row in rows {
            match nodes.get(&row.id) {
                Some(node) => node.refresh(row),
                None => {
                    let node = StorageNode::from_row(row, self.min_disk_free)?;
                    nodes.insert(row.id, Arc::new(node));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: u32) -> Option<Arc<StorageNode>> {
        self.nodes.read().unwrap().get(&id).cloned()
    }

    /// Resolve a replica id list; unknown ids are skipped with a
    /// warning (a refresh will bring them in).
    pub fn nodes_for(&self, ids: &[u32]) -> Vec<Arc<StorageNode>> {
        let nodes = self.nodes.read().unwrap();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match nodes.get(id) {
                Some(node) => found.push(node.clone()),
                None => log::warn!("range references unknown storage {}", id),
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }
}
