//! Core item data model shared by the storage and manager daemons.
//!
//! Everything in here has a stable binary layout: the same bytes are
//! written into slice files and sent over the storage wire protocol.
//! All integers are little-endian; the codecs are explicit so there is
//! no implicit struct padding to worry about.

use std::convert::TryInto;

use anyhow::{bail, Error};

pub type Level = u8;
pub type SubLevel = u8;
pub type ItemKey = u64;
pub type SliceId = u32;
pub type Seek = u32;

/// Full address of an object in the system.
pub type KeyTriple = (Level, SubLevel, ItemKey);

/// Status bit 0 - the record is a deleted tombstone.
pub const ST_ITEM_DELETED: u8 = 0x01;

/// Modification ordinal used for cross-replica version resolution.
///
/// `mod_time` is wall-clock seconds; `op` is a per-process monotonic
/// counter breaking ties between modifications within one second. The
/// derived ordering (`mod_time` first, then `op`) is the total order
/// replicas agree on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeTag {
    pub mod_time: u32,
    pub op: u32,
}

impl TimeTag {
    pub fn is_zero(&self) -> bool {
        self.mod_time == 0 && self.op == 0
    }
}

pub const ITEM_HEADER_SIZE: usize = 24;

/// Item record header, written verbatim in front of every payload in a
/// slice data file and carried in ITEM_INFO/GET/PUT/DELETE commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemHeader {
    pub status: u8,
    pub reserved: u8,
    pub level: Level,
    pub sub_level: SubLevel,
    pub item_key: ItemKey,
    pub time_tag: TimeTag,
    /// Payload length in bytes, header excluded.
    pub size: u32,
}

impl ItemHeader {
    pub fn key(&self) -> KeyTriple {
        (self.level, self.sub_level, self.item_key)
    }

    pub fn is_deleted(&self) -> bool {
        self.status & ST_ITEM_DELETED != 0
    }

    pub fn to_bytes(&self) -> [u8; ITEM_HEADER_SIZE] {
        let mut buf = [0u8; ITEM_HEADER_SIZE];
        buf[0] = self.status;
        buf[1] = self.reserved;
        buf[2] = self.level;
        buf[3] = self.sub_level;
        buf[4..12].copy_from_slice(&self.item_key.to_le_bytes());
        buf[12..16].copy_from_slice(&self.time_tag.mod_time.to_le_bytes());
        buf[16..20].copy_from_slice(&self.time_tag.op.to_le_bytes());
        buf[20..24].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ITEM_HEADER_SIZE {
            bail!("item header too small ({} bytes)", buf.len());
        }
        Ok(Self {
            status: buf[0],
            reserved: buf[1],
            level: buf[2],
            sub_level: buf[3],
            item_key: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            time_tag: TimeTag {
                mod_time: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
                op: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            },
            size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

pub const ITEM_POINTER_SIZE: usize = 8;

/// Location of an item record inside a level directory: which slice
/// pair, and the data-file offset of its header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemPointer {
    pub slice_id: SliceId,
    pub seek: Seek,
}

impl ItemPointer {
    /// Sentinel pointer in a GET request: resolve the item by key.
    pub const NULL: ItemPointer = ItemPointer {
        slice_id: u32::MAX,
        seek: 0,
    };

    pub fn is_null(&self) -> bool {
        self.slice_id == u32::MAX
    }

    pub fn to_bytes(&self) -> [u8; ITEM_POINTER_SIZE] {
        let mut buf = [0u8; ITEM_POINTER_SIZE];
        buf[0..4].copy_from_slice(&self.slice_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.seek.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ITEM_POINTER_SIZE {
            bail!("item pointer too small ({} bytes)", buf.len());
        }
        Ok(Self {
            slice_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            seek: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

pub const INDEX_ENTRY_SIZE: usize = ITEM_POINTER_SIZE + ITEM_HEADER_SIZE;

/// One record of a slice index file: where the item sits, and the full
/// header that was written there. Appended once per write, tombstones
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pointer: ItemPointer,
    pub header: ItemHeader,
}

impl IndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[..ITEM_POINTER_SIZE].copy_from_slice(&self.pointer.to_bytes());
        buf[ITEM_POINTER_SIZE..].copy_from_slice(&self.header.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < INDEX_ENTRY_SIZE {
            bail!("index entry too small ({} bytes)", buf.len());
        }
        Ok(Self {
            pointer: ItemPointer::from_bytes(&buf[..ITEM_POINTER_SIZE])?,
            header: ItemHeader::from_bytes(&buf[ITEM_POINTER_SIZE..])?,
        })
    }
}

pub const CAPACITY_INFO_SIZE: usize = 16;

/// Disk capacity snapshot answered to PING.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl CapacityInfo {
    pub fn to_bytes(&self) -> [u8; CAPACITY_INFO_SIZE] {
        let mut buf = [0u8; CAPACITY_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.total_bytes.to_le_bytes());
        buf[8..16].copy_from_slice(&self.free_bytes.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CAPACITY_INFO_SIZE {
            bail!("capacity info too small ({} bytes)", buf.len());
        }
        Ok(Self {
            total_bytes: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            free_bytes: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}
