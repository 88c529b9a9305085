//! End-to-end tests running real storage services on ephemeral ports
//! behind a manager dispatch: PUT/GET fan-out, capacity floors,
//! version resolution, pooled connection recovery, and replication.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use metis::config::ManagerConfig;
use metis::manager::{
    handle_request, ClusterManager, CommandPool, IndexManager, ManagerContext, MemMetaStore,
    MetaStore, RangeIndexRow, RangeRow, StorageRow, NODE_STATUS_OK,
};
use metis::storage::{self, pull_from_peer, Storage, StorageContext, SyncWorker};
use metis::types::{ItemHeader, TimeTag, ITEM_HEADER_SIZE};
use metis::wire::{
    sync_call, AnswerHeader, AnswerStatus, CmdHeader, StorageCmd, CMD_HEADER_SIZE,
};

struct TestStorage {
    addr: SocketAddr,
    storage: Arc<Storage>,
    _dir: tempfile::TempDir,
    _worker: Option<SyncWorker>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

async fn spawn_storage(peers: Vec<SocketAddr>) -> TestStorage {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path(), 0.0, 10_000_000, false).unwrap());
    let worker = if peers.is_empty() {
        None
    } else {
        Some(SyncWorker::spawn(peers, Duration::from_secs(2)).unwrap())
    };
    let ctx = Arc::new(StorageContext {
        storage: storage.clone(),
        sync: worker.as_ref().map(|worker| worker.sender()),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = storage::serve(ctx, listener, 64, async {
            let _ = rx.await;
        })
        .await;
    });

    TestStorage {
        addr,
        storage,
        _dir: dir,
        _worker: worker,
        _shutdown: tx,
    }
}

struct TestManager {
    ctx: Arc<ManagerContext>,
    meta: Arc<MemMetaStore>,
}

fn manager_for(meta: Arc<MemMetaStore>) -> TestManager {
    let cluster = Arc::new(ClusterManager::new(0.05));
    cluster.load(&meta.load_storages().unwrap()).unwrap();
    let index = Arc::new(IndexManager::new());
    index.load_all(meta.as_ref(), &cluster).unwrap();
    let pool = Arc::new(CommandPool::new(4, Duration::from_secs(2)));

    let ctx = Arc::new(ManagerContext {
        config: Arc::new(ManagerConfig::default()),
        meta: meta.clone(),
        cluster,
        index,
        pool,
    });
    TestManager { ctx, meta }
}

fn storage_row(id: u32, addr: &SocketAddr, free: u64) -> StorageRow {
    StorageRow {
        id,
        addr: addr.to_string(),
        capacity_total: 1000,
        capacity_free: free,
        status: NODE_STATUS_OK,
    }
}

fn seed_level(meta: &MemMetaStore, storages: Vec<u32>) {
    meta.add_index_range(RangeIndexRow {
        index_id: 1,
        level: 1,
        sub_level: 1,
        range_size: 1024,
    });
    meta.add_range(RangeRow {
        range_id: 1,
        index_id: 1,
        range_index: 0,
        storages,
    });
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn url_for(key: u64, payload: &[u8]) -> String {
    format!("/1/1/{:x}.{:x}", key, crc32(payload))
}

fn header_for(key: u64, size: u32, mod_time: u32, op: u32) -> ItemHeader {
    ItemHeader {
        level: 1,
        sub_level: 1,
        item_key: key,
        time_tag: TimeTag { mod_time, op },
        size,
        ..Default::default()
    }
}

async fn blocking_call(
    addr: SocketAddr,
    cmd: StorageCmd,
    body: Vec<u8>,
) -> (AnswerStatus, Vec<u8>) {
    tokio::task::spawn_blocking(move || {
        sync_call(&addr, cmd, &body, Duration::from_secs(2)).unwrap()
    })
    .await
    .unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_fan_out_picks_first_healthy() {
    let a = spawn_storage(vec![]).await;
    let b = spawn_storage(vec![]).await;
    // nothing listens on port 1 - commands to it answer ERROR
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let meta = Arc::new(MemMetaStore::new());
    meta.add_storage(storage_row(1, &dead, 1000));
    meta.add_storage(storage_row(2, &a.addr, 1000));
    meta.add_storage(storage_row(3, &b.addr, 1000));
    seed_level(&meta, vec![1, 2, 3]);
    let manager = manager_for(meta);

    let payload = b"test data";
    let request = Request::builder()
        .method("PUT")
        .uri(url_for(1, payload))
        .body(Body::from(&payload[..]))
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // the first healthy replica took the bytes, the second stayed empty
    let info = a.storage.item_info(&(1, 1, 1)).unwrap();
    assert_eq!(info.size, payload.len() as u32);
    assert!(b.storage.item_info(&(1, 1, 1)).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_with_all_replicas_full_answers_507() {
    let a = spawn_storage(vec![]).await;
    let b = spawn_storage(vec![]).await;

    let meta = Arc::new(MemMetaStore::new());
    // zero free bytes on both replicas - can_put fails everywhere
    meta.add_storage(storage_row(1, &a.addr, 0));
    meta.add_storage(storage_row(2, &b.addr, 0));
    seed_level(&meta, vec![1, 2]);
    let manager = manager_for(meta);

    let payload = b"test data";
    let request = Request::builder()
        .method("PUT")
        .uri(url_for(1, payload))
        .body(Body::from(&payload[..]))
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);

    // no slice files were touched
    assert_eq!(a.storage.item_count(), 0);
    assert_eq!(b.storage.item_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_streams_from_newest_replica() {
    let a = spawn_storage(vec![]).await;
    let b = spawn_storage(vec![]).await;

    // replica A holds a tombstone, replica B a strictly newer live
    // version
    a.storage
        .put(header_for(1, 3, 100, 1), b"old")
        .unwrap();
    a.storage.delete(header_for(1, 0, 100, 2)).unwrap();
    b.storage
        .put(header_for(1, 5, 150, 1), b"fresh")
        .unwrap();

    let meta = Arc::new(MemMetaStore::new());
    meta.add_storage(storage_row(1, &a.addr, 1000));
    meta.add_storage(storage_row(2, &b.addr, 1000));
    seed_level(&meta, vec![1, 2]);
    let manager = manager_for(meta);

    let request = Request::builder()
        .method("GET")
        .uri(url_for(1, b"fresh"))
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"fresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_tombstones_the_current_version() {
    let a = spawn_storage(vec![]).await;
    a.storage.put(header_for(4, 4, 100, 1), b"gone").unwrap();

    let meta = Arc::new(MemMetaStore::new());
    meta.add_storage(storage_row(1, &a.addr, 1000));
    seed_level(&meta, vec![1]);
    let manager = manager_for(meta);

    let request = Request::builder()
        .method("DELETE")
        .uri("/1/1/4.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(a.storage.item_info(&(1, 1, 4)).is_none());

    // a second delete finds nothing
    let request = Request::builder()
        .method("DELETE")
        .uri("/1/1/4.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_unknown_item_answers_404() {
    let a = spawn_storage(vec![]).await;

    let meta = Arc::new(MemMetaStore::new());
    meta.add_storage(storage_row(1, &a.addr, 1000));
    seed_level(&meta, vec![1]);
    let manager = manager_for(meta);

    // known range, item never written
    let request = Request::builder()
        .method("GET")
        .uri("/1/1/7.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // key outside any range row
    let request = Request::builder()
        .method("GET")
        .uri("/1/1/fffff.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn meta_outage_answers_503_but_cached_ranges_serve() {
    let a = spawn_storage(vec![]).await;

    let meta = Arc::new(MemMetaStore::new());
    meta.add_storage(storage_row(1, &a.addr, 1000));
    seed_level(&meta, vec![1]);
    let manager = manager_for(meta);

    manager.meta.set_unreachable(true);

    // unknown level needs the metadata store - 503
    let request = Request::builder()
        .method("GET")
        .uri("/2/1/7.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // the cached range keeps serving (item is simply missing)
    let request = Request::builder()
        .method("GET")
        .uri("/1/1/7.0")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mkcol_creates_level_once() {
    let meta = Arc::new(MemMetaStore::new());
    let manager = manager_for(meta);

    let request = Request::builder()
        .method("MKCOL")
        .uri("/5/6")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::builder()
        .method("MKCOL")
        .uri("/5/6")
        .body(Body::empty())
        .unwrap();
    let response = handle_request(manager.ctx.clone(), request).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

/// Answers exactly one command per connection, then closes it - the
/// "peer reset between requests" case the pool must recover from.
async fn one_answer_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut head = [0u8; CMD_HEADER_SIZE];
                if conn.read_exact(&mut head).await.is_err() {
                    return;
                }
                let cmd = match CmdHeader::from_bytes(&head) {
                    Ok(cmd) => cmd,
                    Err(_) => return,
                };
                let mut body = vec![0u8; cmd.size as usize];
                if conn.read_exact(&mut body).await.is_err() {
                    return;
                }
                let _ = conn
                    .write_all(&AnswerHeader::new(AnswerStatus::Ok, 0).to_bytes())
                    .await;
                // dropping the connection here leaves a dead socket in
                // the manager's pool
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_recovers_a_reset_pooled_connection() {
    let addr = one_answer_server().await;

    let cluster = ClusterManager::new(0.0);
    cluster.load(&[storage_row(1, &addr, 1000)]).unwrap();
    let node = cluster.node(1).unwrap();
    let pool = CommandPool::new(4, Duration::from_secs(2));

    let first = pool.send_command(&node, StorageCmd::Ping, &[]).await;
    assert_eq!(first.status, AnswerStatus::Ok);
    assert_eq!(pool.idle_connections(1), 1);

    // let the server side close land
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = pool.send_command(&node, StorageCmd::Ping, &[]).await;
    assert_eq!(second.status, AnswerStatus::Ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_refreshes_the_capacity_cache() {
    let a = spawn_storage(vec![]).await;

    let cluster = ClusterManager::new(0.0);
    // seeded with a bogus one-byte capacity
    cluster
        .load(&[StorageRow {
            id: 1,
            addr: a.addr.to_string(),
            capacity_total: 1,
            capacity_free: 0,
            status: NODE_STATUS_OK,
        }])
        .unwrap();
    let node = cluster.node(1).unwrap();
    assert!(!node.can_put(1));

    let pool = CommandPool::new(4, Duration::from_secs(2));
    let info = pool.ping(&node).await.unwrap();
    assert!(info.total_bytes > 0);

    // the snapshot replaced the bogus numbers
    assert!(node.can_put(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_exceeds_the_connection_cap() {
    let a = spawn_storage(vec![]).await;

    let cluster = ClusterManager::new(0.0);
    cluster.load(&[storage_row(1, &a.addr, 1000)]).unwrap();
    let node = cluster.node(1).unwrap();
    let pool = Arc::new(CommandPool::new(2, Duration::from_secs(2)));

    let answers = futures::future::join_all((0..6).map(|_| {
        let pool = pool.clone();
        let node = node.clone();
        async move { pool.send_command(&node, StorageCmd::Ping, &[]).await }
    }))
    .await;

    for answer in answers {
        assert_eq!(answer.status, AnswerStatus::Ok);
    }
    assert!(pool.idle_connections(1) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_round_trips_through_item_info() {
    let a = spawn_storage(vec![]).await;

    let header = header_for(9, 4, 0, 0);
    let mut body = header.to_bytes().to_vec();
    body.extend_from_slice(b"abcd");
    let (status, pointer) = blocking_call(a.addr, StorageCmd::Put, body).await;
    assert_eq!(status, AnswerStatus::Ok);
    assert_eq!(pointer.len(), 8);

    let (status, raw) =
        blocking_call(a.addr, StorageCmd::ItemInfo, header.to_bytes().to_vec()).await;
    assert_eq!(status, AnswerStatus::Ok);
    let answered = ItemHeader::from_bytes(&raw).unwrap();
    assert_eq!(answered.key(), header.key());
    assert_eq!(answered.size, 4);
    // the storage stamped a real modification ordinal
    assert!(!answered.time_tag.is_zero());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_pushes_writes_to_its_peer() {
    let b = spawn_storage(vec![]).await;
    let a = spawn_storage(vec![b.addr]).await;

    let header = header_for(11, 4, 0, 0);
    let mut body = header.to_bytes().to_vec();
    body.extend_from_slice(b"repl");
    let (status, _) = blocking_call(a.addr, StorageCmd::Put, body).await;
    assert_eq!(status, AnswerStatus::Ok);

    let storage = b.storage.clone();
    assert!(wait_until(move || storage.item_info(&(1, 1, 11)).is_some()).await);

    // the replica carries the primary's time tag
    let primary = a.storage.item_info(&(1, 1, 11)).unwrap();
    let replica = b.storage.item_info(&(1, 1, 11)).unwrap();
    assert_eq!(primary.time_tag, replica.time_tag);

    // deletes propagate the same way
    let (status, _) =
        blocking_call(a.addr, StorageCmd::Delete, header.to_bytes().to_vec()).await;
    assert_eq!(status, AnswerStatus::Ok);
    let storage = b.storage.clone();
    assert!(wait_until(move || storage.item_info(&(1, 1, 11)).is_none()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_next_pull_catches_a_peer_up() {
    let a = spawn_storage(vec![]).await;
    a.storage.put(header_for(1, 4, 100, 1), b"one!").unwrap();
    a.storage.put(header_for(2, 4, 100, 2), b"two!").unwrap();

    let b = spawn_storage(vec![]).await;

    let puller = b.storage.clone();
    let peer = a.addr;
    let applied = tokio::task::spawn_blocking(move || {
        pull_from_peer(&puller, &peer, 1, 1, Duration::from_secs(2)).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(applied, 2);

    let one = b.storage.item_info(&(1, 1, 1)).unwrap();
    assert_eq!(one.size, 4);
    let data = b
        .storage
        .get(&one, &metis::types::ItemPointer::NULL)
        .unwrap();
    assert_eq!(&data[ITEM_HEADER_SIZE..], b"one!");

    // a tombstone written after the first pull propagates on the next
    a.storage.delete(header_for(1, 0, 101, 1)).unwrap();
    let puller = b.storage.clone();
    let applied = tokio::task::spawn_blocking(move || {
        pull_from_peer(&puller, &peer, 1, 1, Duration::from_secs(2)).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(applied, 1);
    assert!(b.storage.item_info(&(1, 1, 1)).is_none());
}
