//! Storage wire protocol.
//!
//! Every connection between a manager and a storage (and between two
//! storages during replication) carries a stream of length-prefixed
//! commands: a 5-byte [`CmdHeader`] followed by `size` payload bytes,
//! answered by a 5-byte [`AnswerHeader`] followed by `size` payload
//! bytes. All fields are little-endian.

use std::convert::{TryFrom, TryInto};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use crate::types::{Level, Seek, SliceId, SubLevel};

pub const CMD_HEADER_SIZE: usize = 5;
pub const ANSWER_HEADER_SIZE: usize = 5;

/// Upper bound for a declared command or answer payload; anything
/// larger is a protocol violation and drops the connection.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Bit 31 of an index chunk frame word: this chunk ends its slice.
pub const PACKET_FINISHED_FLAG: u32 = 0x8000_0000;

/// Raw index bytes served per `load_index` call.
pub const MAX_INDEX_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCmd {
    NoCmd = 0,
    ItemInfo = 1,
    Get = 2,
    Put = 3,
    Delete = 4,
    Ping = 5,
    SyncNext = 6,
}

impl TryFrom<u8> for StorageCmd {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => StorageCmd::NoCmd,
            1 => StorageCmd::ItemInfo,
            2 => StorageCmd::Get,
            3 => StorageCmd::Put,
            4 => StorageCmd::Delete,
            5 => StorageCmd::Ping,
            6 => StorageCmd::SyncNext,
            other => bail!("unknown storage command {}", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnswerStatus {
    Ok = 0,
    Error = 1,
    NotFound = 2,
    NoSpace = 3,
}

impl TryFrom<u8> for AnswerStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => AnswerStatus::Ok,
            1 => AnswerStatus::Error,
            2 => AnswerStatus::NotFound,
            3 => AnswerStatus::NoSpace,
            other => bail!("unknown answer status {}", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub cmd: StorageCmd,
    pub size: u32,
}

impl CmdHeader {
    pub fn new(cmd: StorageCmd, size: u32) -> Self {
        Self { cmd, size }
    }

    pub fn to_bytes(&self) -> [u8; CMD_HEADER_SIZE] {
        let mut buf = [0u8; CMD_HEADER_SIZE];
        buf[0] = self.cmd as u8;
        buf[1..5].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CMD_HEADER_SIZE {
            bail!("command header too small ({} bytes)", buf.len());
        }
        let cmd = StorageCmd::try_from(buf[0])?;
        let size = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        if size > MAX_BODY_SIZE {
            bail!("declared command payload too large ({} bytes)", size);
        }
        Ok(Self { cmd, size })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerHeader {
    pub status: AnswerStatus,
    pub size: u32,
}

impl AnswerHeader {
    pub fn new(status: AnswerStatus, size: u32) -> Self {
        Self { status, size }
    }

    pub fn to_bytes(&self) -> [u8; ANSWER_HEADER_SIZE] {
        let mut buf = [0u8; ANSWER_HEADER_SIZE];
        buf[0] = self.status as u8;
        buf[1..5].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ANSWER_HEADER_SIZE {
            bail!("answer header too small ({} bytes)", buf.len());
        }
        let status = AnswerStatus::try_from(buf[0])?;
        let size = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        if size > MAX_BODY_SIZE {
            bail!("declared answer payload too large ({} bytes)", size);
        }
        Ok(Self { status, size })
    }
}

pub const SYNC_CURSOR_SIZE: usize = 10;

/// Replication pull position inside a peer's index files. The answer
/// to SYNC_NEXT echoes the cursor to use for the following call, so
/// the puller keeps no state beyond the last answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub level: Level,
    pub sub_level: SubLevel,
    pub slice_id: SliceId,
    pub seek: Seek,
}

impl SyncCursor {
    pub fn to_bytes(&self) -> [u8; SYNC_CURSOR_SIZE] {
        let mut buf = [0u8; SYNC_CURSOR_SIZE];
        buf[0] = self.level;
        buf[1] = self.sub_level;
        buf[2..6].copy_from_slice(&self.slice_id.to_le_bytes());
        buf[6..10].copy_from_slice(&self.seek.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SYNC_CURSOR_SIZE {
            bail!("sync cursor too small ({} bytes)", buf.len());
        }
        Ok(Self {
            level: buf[0],
            sub_level: buf[1],
            slice_id: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            seek: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
        })
    }
}

/// Storage-side outcome kinds that map onto wire answer statuses.
///
/// Everything else travels as a plain [`anyhow::Error`] and answers
/// `AnswerStatus::Error`.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("item not found")]
    NotFound,
    #[error("not enough free space")]
    NoSpace,
}

/// Map an execution result onto the wire status.
pub fn answer_status_for(err: &Error) -> AnswerStatus {
    match err.downcast_ref::<StorageError>() {
        Some(StorageError::NotFound) => AnswerStatus::NotFound,
        Some(StorageError::NoSpace) => AnswerStatus::NoSpace,
        None => AnswerStatus::Error,
    }
}

/// One blocking command round-trip over a fresh connection.
///
/// The replication worker runs on its own thread and talks to peers
/// with plain blocking sockets; the manager's pooled async client
/// lives in `manager::pool`.
pub fn sync_call(
    addr: &SocketAddr,
    cmd: StorageCmd,
    body: &[u8],
    timeout: Duration,
) -> Result<(AnswerStatus, Vec<u8>), Error> {
    let mut stream = TcpStream::connect_timeout(addr, timeout)
        .map_err(|err| format_err!("unable to connect to storage {} - {}", addr, err))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(&CmdHeader::new(cmd, body.len() as u32).to_bytes())?;
    stream.write_all(body)?;

    let mut head = [0u8; ANSWER_HEADER_SIZE];
    stream.read_exact(&mut head)?;
    let answer = AnswerHeader::from_bytes(&head)?;

    let mut payload = vec![0u8; answer.size as usize];
    stream.read_exact(&mut payload)?;

    Ok((answer.status, payload))
}
