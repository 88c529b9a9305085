//! TCP command service of a storage node.
//!
//! Each connection carries a stream of length-prefixed commands; the
//! service decodes them, routes to the [`Storage`], and writes the
//! answer back. Malformed outer framing (unknown command byte,
//! oversize declared payload, truncated header) drops the connection;
//! a command that merely fails to execute answers its error status and
//! the connection lives on.

use std::sync::Arc;

use anyhow::{bail, Error};
use crossbeam_channel::Sender;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::types::{ItemHeader, ItemPointer, ITEM_HEADER_SIZE, ITEM_POINTER_SIZE};
use crate::wire::{
    answer_status_for, AnswerHeader, AnswerStatus, CmdHeader, StorageCmd, SyncCursor,
    CMD_HEADER_SIZE, SYNC_CURSOR_SIZE,
};

use super::store::Storage;
use super::sync::SyncTask;

pub struct StorageContext {
    pub storage: Arc<Storage>,
    pub sync: Option<Sender<SyncTask>>,
}

/// Accept loop. Connection count is bounded by `max_connections`; the
/// permit is taken before accepting, so overload surfaces as listen
/// backlog instead of unbounded tasks.
pub async fn serve(
    ctx: Arc<StorageContext>,
    listener: TcpListener,
    max_connections: usize,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), Error> {
    let connections = Arc::new(Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = connections.clone().acquire_owned() => permit?,
        };
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("accept failed - {}", err);
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = handle_connection(ctx, stream).await {
                log::warn!("connection from {} dropped - {}", peer, err);
            }
        });
    }

    log::info!("storage service shutting down - flushing slices");
    ctx.storage.flush()?;
    Ok(())
}

async fn handle_connection(ctx: Arc<StorageContext>, mut stream: TcpStream) -> Result<(), Error> {
    stream.set_nodelay(true).ok();

    let mut head = [0u8; CMD_HEADER_SIZE];
    loop {
        match stream.read_exact(&mut head).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let cmd = CmdHeader::from_bytes(&head)?;

        let mut body = vec![0u8; cmd.size as usize];
        stream.read_exact(&mut body).await?;

        let (status, payload) =
            match tokio::task::block_in_place(|| execute(&ctx, cmd.cmd, &body)) {
                Ok(payload) => (AnswerStatus::Ok, payload),
                Err(err) => {
                    let status = answer_status_for(&err);
                    if status == AnswerStatus::Error {
                        log::warn!("{:?} command failed - {}", cmd.cmd, err);
                    }
                    (status, Vec::new())
                }
            };

        stream
            .write_all(&AnswerHeader::new(status, payload.len() as u32).to_bytes())
            .await?;
        stream.write_all(&payload).await?;
    }
}

fn execute(ctx: &StorageContext, cmd: StorageCmd, body: &[u8]) -> Result<Vec<u8>, Error> {
    use crate::wire::StorageError;

    match cmd {
        StorageCmd::ItemInfo => {
            let header = ItemHeader::from_bytes(body)?;
            let current = ctx
                .storage
                .item_info(&header.key())
                .ok_or(StorageError::NotFound)?;
            Ok(current.to_bytes().to_vec())
        }
        StorageCmd::Get => {
            if body.len() < ITEM_HEADER_SIZE + ITEM_POINTER_SIZE {
                bail!("GET body too small ({} bytes)", body.len());
            }
            let header = ItemHeader::from_bytes(body)?;
            let pointer = ItemPointer::from_bytes(&body[ITEM_HEADER_SIZE..])?;
            ctx.storage.get(&header, &pointer)
        }
        StorageCmd::Put => {
            let header = ItemHeader::from_bytes(body)?;
            let payload = &body[ITEM_HEADER_SIZE..];
            if payload.len() != header.size as usize {
                bail!(
                    "PUT declares {} payload bytes, got {}",
                    header.size,
                    payload.len()
                );
            }
            // a zero tag marks a primary write; replication PUTs carry
            // the primary's tag and must not be pushed onward again
            let primary = header.time_tag.is_zero();
            let (pointer, written) = ctx.storage.put(header, payload)?;
            if primary {
                replicate(ctx, StorageCmd::Put, written, payload.to_vec());
            }
            Ok(pointer.to_bytes().to_vec())
        }
        StorageCmd::Delete => {
            let header = ItemHeader::from_bytes(body)?;
            let primary = header.time_tag.is_zero();
            let written = ctx.storage.delete(header)?;
            if primary {
                replicate(ctx, StorageCmd::Delete, written, Vec::new());
            }
            Ok(Vec::new())
        }
        StorageCmd::Ping => Ok(ctx.storage.capacity().to_bytes().to_vec()),
        StorageCmd::SyncNext => {
            let cursor = SyncCursor::from_bytes(body)?;
            let mut slice_id = cursor.slice_id;
            let mut seek = cursor.seek;
            let mut chunk = Vec::new();
            let more = ctx.storage.load_index(
                cursor.level,
                cursor.sub_level,
                &mut chunk,
                &mut slice_id,
                &mut seek,
            )?;
            if !more {
                return Err(StorageError::NotFound.into());
            }
            let next = SyncCursor {
                level: cursor.level,
                sub_level: cursor.sub_level,
                slice_id,
                seek,
            };
            let mut payload = Vec::with_capacity(SYNC_CURSOR_SIZE + chunk.len());
            payload.extend_from_slice(&next.to_bytes());
            payload.extend_from_slice(&chunk);
            Ok(payload)
        }
        StorageCmd::NoCmd => Ok(Vec::new()),
    }
}

/// Hand the freshly written record to the sync worker; replication to
/// secondaries is asynchronous, local durability already happened.
fn replicate(ctx: &StorageContext, cmd: StorageCmd, header: ItemHeader, payload: Vec<u8>) {
    if let Some(sync) = &ctx.sync {
        let task = SyncTask {
            cmd,
            header,
            payload,
        };
        if sync.send(task).is_err() {
            log::error!("sync worker is gone - replication task dropped");
        }
    }
}
