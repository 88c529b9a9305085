//! Pooled command clients to storage nodes.
//!
//! One command is one event walking an explicit state machine
//! (`WaitConnection -> SendRequest -> WaitAnswer -> Ready | Error`).
//! The pool owns the sockets; an event borrows one for the duration
//! of a command and gives it back when the answer was read cleanly.
//! A pooled socket whose peer reset between commands is detected at
//! the first send (or at the immediately following read) and reopened
//! once; fresh connections get no retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::types::{CapacityInfo, ItemHeader, ItemPointer, ITEM_HEADER_SIZE, ITEM_POINTER_SIZE};
use crate::wire::{
    AnswerHeader, AnswerStatus, CmdHeader, StorageCmd, StorageError, ANSWER_HEADER_SIZE,
    CMD_HEADER_SIZE,
};

use super::cluster::StorageNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    WaitConnection,
    SendRequest,
    WaitAnswer,
    Ready,
    Error,
}

/// Decoded storage answer as delivered to callers; transport-level
/// failures (refused, reset, deadline) surface as `Error` status.
#[derive(Debug, Clone)]
pub struct StorageAnswerData {
    pub status: AnswerStatus,
    pub payload: Bytes,
}

impl StorageAnswerData {
    fn error() -> Self {
        Self {
            status: AnswerStatus::Error,
            payload: Bytes::new(),
        }
    }
}

struct CmdEvent {
    state: EventState,
    conn: Option<TcpStream>,
    /// The connection came from the free list; entitles one reset.
    pooled: bool,
    retried: bool,
}

pub struct CommandPool {
    max_connections_per_storage: usize,
    timeout: Duration,
    free: Mutex<HashMap<u32, Vec<TcpStream>>>,
}

impl CommandPool {
    pub fn new(max_connections_per_storage: usize, timeout: Duration) -> Self {
        Self {
            max_connections_per_storage,
            timeout,
            free: Mutex::new(HashMap::new()),
        }
    }

    fn take_pooled(&self, id: u32) -> Option<TcpStream> {
        self.free.lock().unwrap().get_mut(&id)?.pop()
    }

    fn give_back(&self, id: u32, conn: TcpStream) {
        let mut free = self.free.lock().unwrap();
        let list = free.entry(id).or_default();
        if list.len() < self.max_connections_per_storage {
            list.push(conn);
        }
        // above the cap the socket is simply dropped
    }

    /// Idle sockets currently pooled for a storage.
    pub fn idle_connections(&self, id: u32) -> usize {
        self.free
            .lock()
            .unwrap()
            .get(&id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// One command round-trip with deadline; never panics the caller
    /// with transport errors - they come back as an `Error` answer.
    pub async fn send_command(
        &self,
        node: &Arc<StorageNode>,
        cmd: StorageCmd,
        body: &[u8],
    ) -> StorageAnswerData {
        match tokio::time::timeout(self.timeout, self.run_event(node, cmd, body)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => {
                log::warn!("{:?} to storage {} failed - {}", cmd, node.id(), err);
                StorageAnswerData::error()
            }
            Err(_) => {
                log::warn!(
                    "{:?} to storage {} timed out after {:?}",
                    cmd,
                    node.id(),
                    self.timeout
                );
                StorageAnswerData::error()
            }
        }
    }

    async fn run_event(
        &self,
        node: &Arc<StorageNode>,
        cmd: StorageCmd,
        body: &[u8],
    ) -> Result<StorageAnswerData, Error> {
        let mut frame = Vec::with_capacity(CMD_HEADER_SIZE + body.len());
        frame.extend_from_slice(&CmdHeader::new(cmd, body.len() as u32).to_bytes());
        frame.extend_from_slice(body);

        let mut event = match self.take_pooled(node.id()) {
            Some(conn) => CmdEvent {
                state: EventState::SendRequest,
                conn: Some(conn),
                pooled: true,
                retried: false,
            },
            None => CmdEvent {
                state: EventState::WaitConnection,
                conn: None,
                pooled: false,
                retried: false,
            },
        };

        loop {
            match event.state {
                EventState::WaitConnection => {
                    let conn = TcpStream::connect(node.addr()).await.map_err(|err| {
                        event.state = EventState::Error;
                        format_err!("unable to connect to {} - {}", node.addr(), err)
                    })?;
                    conn.set_nodelay(true).ok();
                    event.conn = Some(conn);
                    event.pooled = false;
                    event.state = EventState::SendRequest;
                }
                EventState::SendRequest => {
                    let conn = event.conn.as_mut().unwrap();
                    match conn.write_all(&frame).await {
                        Ok(_) => event.state = EventState::WaitAnswer,
                        Err(err) => {
                            if !event.reset_once(node) {
                                bail!("send to {} failed - {}", node.addr(), err);
                            }
                        }
                    }
                }
                EventState::WaitAnswer => {
                    let conn = event.conn.as_mut().unwrap();
                    match read_answer(conn).await {
                        Ok(answer) => {
                            event.state = EventState::Ready;
                            // the socket was drained exactly to the answer
                            // boundary; hand it back for the next command
                            if let Some(conn) = event.conn.take() {
                                self.give_back(node.id(), conn);
                            }
                            return Ok(answer);
                        }
                        Err(err) => {
                            // a dead pooled peer often accepts the write and
                            // fails at the read; the same single reset applies
                            if !event.reset_once(node) {
                                bail!("answer from {} failed - {}", node.addr(), err);
                            }
                        }
                    }
                }
                EventState::Ready | EventState::Error => unreachable!(),
            }
        }
    }

    /// ITEM_INFO fan-out: one command per replica in parallel; the
    /// task is complete when every event answered or errored. An
    /// empty replica list yields no task.
    pub async fn item_info(
        &self,
        storages: &[Arc<StorageNode>],
        header: &ItemHeader,
    ) -> Option<ItemInfoTask> {
        if storages.is_empty() {
            return None;
        }
        let body = header.to_bytes();

        let answers = futures::future::join_all(storages.iter().map(|node| {
            let body = body;
            async move {
                let answer = self.send_command(node, StorageCmd::ItemInfo, &body).await;
                let header = match answer.status {
                    AnswerStatus::Ok => ItemHeader::from_bytes(&answer.payload).ok(),
                    _ => None,
                };
                let status = match (answer.status, &header) {
                    // an OK answer without a decodable header is garbage
                    (AnswerStatus::Ok, None) => AnswerStatus::Error,
                    (status, _) => status,
                };
                ItemInfoAnswer {
                    storage: node.clone(),
                    status,
                    header,
                }
            }
        }))
        .await;

        Some(ItemInfoTask { answers })
    }

    /// PUT one item; decodes the answered pointer and accounts the
    /// bytes against the node's cached capacity.
    pub async fn put_item(
        &self,
        node: &Arc<StorageNode>,
        header: &ItemHeader,
        payload: &[u8],
    ) -> Result<ItemPointer, Error> {
        let mut body = Vec::with_capacity(ITEM_HEADER_SIZE + payload.len());
        body.extend_from_slice(&header.to_bytes());
        body.extend_from_slice(payload);

        let answer = self.send_command(node, StorageCmd::Put, &body).await;
        match answer.status {
            AnswerStatus::Ok => {
                let pointer = ItemPointer::from_bytes(&answer.payload)?;
                node.note_put(header.size);
                Ok(pointer)
            }
            AnswerStatus::NoSpace => Err(StorageError::NoSpace.into()),
            other => bail!("storage {} answered {:?} to PUT", node.id(), other),
        }
    }

    /// GET the current version by key; returns header + payload.
    pub async fn get_item(
        &self,
        node: &Arc<StorageNode>,
        header: &ItemHeader,
    ) -> Result<Vec<u8>, Error> {
        let mut body = Vec::with_capacity(ITEM_HEADER_SIZE + ITEM_POINTER_SIZE);
        body.extend_from_slice(&header.to_bytes());
        body.extend_from_slice(&ItemPointer::NULL.to_bytes());

        let answer = self.send_command(node, StorageCmd::Get, &body).await;
        match answer.status {
            AnswerStatus::Ok => {
                if answer.payload.len() != ITEM_HEADER_SIZE + header.size as usize {
                    bail!(
                        "storage {} sent {} bytes, expected {}",
                        node.id(),
                        answer.payload.len(),
                        ITEM_HEADER_SIZE + header.size as usize
                    );
                }
                Ok(answer.payload.to_vec())
            }
            AnswerStatus::NotFound => Err(StorageError::NotFound.into()),
            other => bail!("storage {} answered {:?} to GET", node.id(), other),
        }
    }

    /// PING one storage and fold the answered capacity snapshot into
    /// its cached record.
    pub async fn ping(&self, node: &Arc<StorageNode>) -> Result<CapacityInfo, Error> {
        let answer = self.send_command(node, StorageCmd::Ping, &[]).await;
        match answer.status {
            AnswerStatus::Ok => {
                let info = CapacityInfo::from_bytes(&answer.payload)?;
                node.update_capacity(info);
                Ok(info)
            }
            other => bail!("storage {} answered {:?} to PING", node.id(), other),
        }
    }

    /// DELETE on one replica.
    pub async fn delete_item(
        &self,
        node: &Arc<StorageNode>,
        header: &ItemHeader,
    ) -> Result<(), Error> {
        let answer = self
            .send_command(node, StorageCmd::Delete, &header.to_bytes())
            .await;
        match answer.status {
            AnswerStatus::Ok => Ok(()),
            other => bail!("storage {} answered {:?} to DELETE", node.id(), other),
        }
    }
}

impl CmdEvent {
    /// Drop the dead pooled socket and go back to connecting; only
    /// once, and only for sockets that came from the pool.
    fn reset_once(&mut self, node: &Arc<StorageNode>) -> bool {
        if !self.pooled || self.retried {
            self.state = EventState::Error;
            return false;
        }
        log::warn!("reset closed connection to storage {}", node.addr());
        self.conn = None;
        self.retried = true;
        self.state = EventState::WaitConnection;
        true
    }
}

async fn read_answer(conn: &mut TcpStream) -> Result<StorageAnswerData, Error> {
    let mut head = [0u8; ANSWER_HEADER_SIZE];
    conn.read_exact(&mut head).await?;
    let answer = AnswerHeader::from_bytes(&head)?;

    // the answer is complete once the declared payload is fully
    // present - read_exact returns only then
    let mut payload = vec![0u8; answer.size as usize];
    conn.read_exact(&mut payload).await?;

    Ok(StorageAnswerData {
        status: answer.status,
        payload: Bytes::from(payload),
    })
}

#[derive(Debug, Clone)]
pub struct ItemInfoAnswer {
    pub storage: Arc<StorageNode>,
    pub status: AnswerStatus,
    pub header: Option<ItemHeader>,
}

/// Collected fan-out answers, one per replica.
pub struct ItemInfoTask {
    pub answers: Vec<ItemInfoAnswer>,
}

impl ItemInfoTask {
    /// Replicas eligible for a PUT of `size` bytes, in answer order.
    /// A replica that answered (OK or NOT_FOUND - the item may be
    /// new) counts as alive; only transport errors exclude it.
    pub fn put_candidates(&self, size: u32) -> Vec<Arc<StorageNode>> {
        self.answers
            .iter()
            .filter(|answer| answer.status != AnswerStatus::Error)
            .filter(|answer| answer.storage.is_ok() && answer.storage.can_put(size))
            .map(|answer| answer.storage.clone())
            .collect()
    }

    /// First eligible PUT replica.
    pub fn get_put_storage(&self, size: u32) -> Option<Arc<StorageNode>> {
        self.put_candidates(size).into_iter().next()
    }

    /// The OK answer carrying the greatest version ordinal.
    pub fn best_get(&self) -> Option<&ItemInfoAnswer> {
        self.answers
            .iter()
            .filter(|answer| answer.status == AnswerStatus::Ok)
            .filter(|answer| answer.header.is_some())
            .max_by_key(|answer| answer.header.unwrap().time_tag)
    }

    pub fn all_not_found(&self) -> bool {
        !self.answers.is_empty()
            && self
                .answers
                .iter()
                .all(|answer| answer.status == AnswerStatus::NotFound)
    }
}
