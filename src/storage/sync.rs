//! Inter-storage replication.
//!
//! Writes answered on the primary are pushed to the configured peers
//! by a dedicated worker thread draining a channel (decoupling the
//! answer path from peer latency). A peer that was down for longer
//! than the queue survives catches up by pulling index chunks with
//! SYNC_NEXT and fetching the records it is missing.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{Receiver, Sender};

use crate::types::{
    IndexEntry, ItemHeader, Level, SubLevel, INDEX_ENTRY_SIZE, ITEM_HEADER_SIZE,
};
use crate::wire::{
    sync_call, AnswerStatus, StorageCmd, SyncCursor, PACKET_FINISHED_FLAG, SYNC_CURSOR_SIZE,
};

use super::store::Storage;

pub struct SyncTask {
    pub cmd: StorageCmd,
    pub header: ItemHeader,
    pub payload: Vec<u8>,
}

pub struct SyncWorker {
    tx: Option<Sender<SyncTask>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SyncWorker {
    pub fn spawn(peers: Vec<SocketAddr>, timeout: Duration) -> Result<Self, Error> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("metis-sync".to_string())
            .spawn(move || worker_loop(&peers, rx, timeout))
            .map_err(|err| format_err!("unable to spawn sync worker - {}", err))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<SyncTask> {
        self.tx.as_ref().unwrap().clone()
    }

    /// Drain the queue and stop the worker.
    pub fn shutdown(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("sync worker panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(peers: &[SocketAddr], rx: Receiver<SyncTask>, timeout: Duration) {
    while let Ok(task) = rx.recv() {
        for peer in peers {
            if push_task(peer, &task, timeout).is_err() {
                // one retry; after that, last-writer-wins and the
                // SYNC_NEXT catch-up make later convergence safe
                if let Err(err) = push_task(peer, &task, timeout) {
                    log::error!(
                        "replication of item {:016x} to {} failed - {} - dropping task",
                        task.header.item_key,
                        peer,
                        err
                    );
                }
            }
        }
    }
}

fn push_task(peer: &SocketAddr, task: &SyncTask, timeout: Duration) -> Result<(), Error> {
    let mut body = Vec::with_capacity(ITEM_HEADER_SIZE + task.payload.len());
    body.extend_from_slice(&task.header.to_bytes());
    if task.cmd == StorageCmd::Put {
        body.extend_from_slice(&task.payload);
    }

    let (status, _) = sync_call(peer, task.cmd, &body, timeout)?;
    if status != AnswerStatus::Ok {
        bail!("peer answered {:?}", status);
    }
    Ok(())
}

/// Pull every record of `(level, sub_level)` the peer has and we are
/// missing (or hold an older version of). Returns the number of
/// records applied.
pub fn pull_from_peer(
    storage: &Storage,
    peer: &SocketAddr,
    level: Level,
    sub_level: SubLevel,
    timeout: Duration,
) -> Result<usize, Error> {
    let mut cursor = SyncCursor {
        level,
        sub_level,
        slice_id: 0,
        seek: 0,
    };
    let mut applied = 0;

    loop {
        let (status, payload) = sync_call(peer, StorageCmd::SyncNext, &cursor.to_bytes(), timeout)?;
        match status {
            AnswerStatus::Ok => {}
            AnswerStatus::NotFound => break,
            other => bail!("peer {} answered {:?} to SYNC_NEXT", peer, other),
        }

        if payload.len() < SYNC_CURSOR_SIZE + 4 {
            bail!("short SYNC_NEXT answer ({} bytes)", payload.len());
        }
        cursor = SyncCursor::from_bytes(&payload)?;

        let word = u32::from_le_bytes(
            payload[SYNC_CURSOR_SIZE..SYNC_CURSOR_SIZE + 4]
                .try_into()
                .unwrap(),
        );
        let chunk_len = (word & !PACKET_FINISHED_FLAG) as usize;
        let chunk = &payload[SYNC_CURSOR_SIZE + 4..];
        if chunk.len() != chunk_len || chunk_len % INDEX_ENTRY_SIZE != 0 {
            bail!("malformed SYNC_NEXT chunk ({} bytes, frame {})", chunk.len(), chunk_len);
        }

        for raw in chunk.chunks(INDEX_ENTRY_SIZE) {
            let entry = IndexEntry::from_bytes(raw)?;
            if apply_entry(storage, peer, &entry, timeout)? {
                applied += 1;
            }
        }
    }

    Ok(applied)
}

fn apply_entry(
    storage: &Storage,
    peer: &SocketAddr,
    entry: &IndexEntry,
    timeout: Duration,
) -> Result<bool, Error> {
    let newer = match storage.item_version(&entry.header.key()) {
        Some(local) => entry.header.time_tag > local.header.time_tag,
        None => true,
    };
    if !newer {
        return Ok(false);
    }

    if entry.header.is_deleted() {
        storage.delete(entry.header)?;
        return Ok(true);
    }

    let mut body = Vec::with_capacity(ITEM_HEADER_SIZE + 8);
    body.extend_from_slice(&entry.header.to_bytes());
    body.extend_from_slice(&entry.pointer.to_bytes());
    let (status, data) = sync_call(peer, StorageCmd::Get, &body, timeout)?;

    if status != AnswerStatus::Ok {
        // superseded on the peer since the chunk was cut; a later
        // chunk entry carries the current version
        log::warn!(
            "peer {} answered {:?} fetching item {:016x}",
            peer,
            status,
            entry.header.item_key
        );
        return Ok(false);
    }
    if data.len() != ITEM_HEADER_SIZE + entry.header.size as usize {
        bail!("peer {} sent {} bytes for item {:016x}", peer, data.len(), entry.header.item_key);
    }

    let header = ItemHeader::from_bytes(&data)?;
    storage.put(header, &data[ITEM_HEADER_SIZE..])?;
    Ok(true)
}
