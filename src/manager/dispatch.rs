//! WebDAV front of the manager: translates HTTP verbs into storage
//! command fan-outs and maps the outcomes onto status codes.
//!
//! | outcome | code |
//! |---|---|
//! | stored | 201 |
//! | unknown item / level | 404 |
//! | level exists (MKCOL) | 409 |
//! | all replicas failed / bad payload | 502 |
//! | metadata store unreachable, range miss | 503 |
//! | no replica can take the bytes | 507 |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Error;
use http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response};

use crate::config::ManagerConfig;
use crate::types::{ItemHeader, Level, SubLevel, ITEM_HEADER_SIZE};
use crate::wire::{StorageError, MAX_BODY_SIZE};

use super::cluster::ClusterManager;
use super::meta::MetaStore;
use super::pool::CommandPool;
use super::range::{parse_url, IndexManager, Range};

pub struct ManagerContext {
    pub config: Arc<ManagerConfig>,
    pub meta: Arc<dyn MetaStore>,
    pub cluster: Arc<ClusterManager>,
    pub index: Arc<IndexManager>,
    pub pool: Arc<CommandPool>,
}

/// Run the HTTP front until `shutdown` resolves. In-flight requests
/// are bounded by the worker-queue-length knob.
pub async fn serve(
    ctx: Arc<ManagerContext>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), Error> {
    let requests = Arc::new(tokio::sync::Semaphore::new(
        ctx.config.worker_queue_length.max(1),
    ));
    let make_service = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        let requests = requests.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = ctx.clone();
                let requests = requests.clone();
                async move {
                    let _permit = requests.acquire_owned().await.ok();
                    Ok::<_, Infallible>(handle_request(ctx, req).await)
                }
            }))
        }
    });

    hyper::Server::try_bind(&addr)?
        .serve(make_service)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Entry point, also driven directly by the end-to-end tests.
pub async fn handle_request(ctx: Arc<ManagerContext>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match method.as_str() {
        "PUT" => handle_put(&ctx, &path, req).await,
        "GET" => handle_get(&ctx, &path, false).await,
        "HEAD" => handle_get(&ctx, &path, true).await,
        "DELETE" => handle_delete(&ctx, &path).await,
        "MKCOL" => handle_mkcol(&ctx, &path).await,
        _ => Ok(status_response(StatusCode::METHOD_NOT_ALLOWED)),
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            log::error!("{} {} failed - {:#}", method, path, err);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn handle_put(
    ctx: &ManagerContext,
    path: &str,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let (mut header, _crc) = match parse_url(path) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("PUT with unparsable url {:?} - {}", path, err);
            return Ok(status_response(StatusCode::NOT_FOUND));
        }
    };

    let body = hyper::body::to_bytes(req.into_body()).await?;
    // the wire frame carries the item header in front of the payload,
    // so the configured ceiling is additionally bounded by what a
    // single command may declare
    let limit =
        (ctx.config.max_object_size as usize).min(MAX_BODY_SIZE as usize - ITEM_HEADER_SIZE);
    if body.len() > limit {
        return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE));
    }
    header.size = body.len() as u32;

    let range = match lookup_range(ctx, &header) {
        RangeLookup::Found(range) => range,
        RangeLookup::Missing => return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE)),
        RangeLookup::MetaFailed(err) => {
            log::error!("range lookup failed - {:#}", err);
            return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
        }
    };

    let task = match ctx.pool.item_info(&range.storages(), &header).await {
        Some(task) => task,
        None => return Ok(status_response(StatusCode::INSUFFICIENT_STORAGE)),
    };

    for node in task.put_candidates(header.size) {
        match ctx.pool.put_item(&node, &header, &body).await {
            Ok(_pointer) => return Ok(status_response(StatusCode::CREATED)),
            Err(err)
                if matches!(
                    err.downcast_ref::<StorageError>(),
                    Some(StorageError::NoSpace)
                ) =>
            {
                // NO_SPACE: the floor moved since the capacity cache;
                // exclude this replica and try the next
                log::warn!("storage {} rejected PUT - {}", node.id(), err);
                continue;
            }
            Err(err) => {
                log::error!("PUT on storage {} failed - {:#}", node.id(), err);
                return Ok(status_response(StatusCode::BAD_GATEWAY));
            }
        }
    }

    Ok(status_response(StatusCode::INSUFFICIENT_STORAGE))
}

async fn handle_get(
    ctx: &ManagerContext,
    path: &str,
    head_only: bool,
) -> Result<Response<Body>, Error> {
    let (header, crc) = match parse_url(path) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(status_response(StatusCode::NOT_FOUND)),
    };

    let range = match lookup_range(ctx, &header) {
        RangeLookup::Found(range) => range,
        RangeLookup::Missing => return Ok(status_response(StatusCode::NOT_FOUND)),
        RangeLookup::MetaFailed(err) => {
            log::error!("range lookup failed - {:#}", err);
            return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
        }
    };

    let task = match ctx.pool.item_info(&range.storages(), &header).await {
        Some(task) => task,
        None => return Ok(status_response(StatusCode::BAD_GATEWAY)),
    };
    if task.all_not_found() {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }
    let best = match task.best_get() {
        Some(best) => best.clone(),
        None => return Ok(status_response(StatusCode::BAD_GATEWAY)),
    };
    let current = best.header.unwrap();

    if head_only {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, current.size)
            .body(Body::empty())?);
    }

    let raw = match ctx.pool.get_item(&best.storage, &current).await {
        Ok(raw) => raw,
        Err(err) => match err.downcast_ref::<StorageError>() {
            Some(StorageError::NotFound) => return Ok(status_response(StatusCode::NOT_FOUND)),
            _ => {
                log::error!("GET from storage {} failed - {:#}", best.storage.id(), err);
                return Ok(status_response(StatusCode::BAD_GATEWAY));
            }
        },
    };
    let payload = raw[ITEM_HEADER_SIZE..].to_vec();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let actual_crc = hasher.finalize();
    if actual_crc != crc {
        log::error!(
            "item {:016x} crc mismatch: url says {:08x}, payload is {:08x}",
            current.item_key,
            crc,
            actual_crc
        );
        return Ok(status_response(StatusCode::BAD_GATEWAY));
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))?)
}

async fn handle_delete(ctx: &ManagerContext, path: &str) -> Result<Response<Body>, Error> {
    let (header, _crc) = match parse_url(path) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(status_response(StatusCode::NOT_FOUND)),
    };

    let range = match lookup_range(ctx, &header) {
        RangeLookup::Found(range) => range,
        RangeLookup::Missing => return Ok(status_response(StatusCode::NOT_FOUND)),
        RangeLookup::MetaFailed(err) => {
            log::error!("range lookup failed - {:#}", err);
            return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
        }
    };

    let task = match ctx.pool.item_info(&range.storages(), &header).await {
        Some(task) => task,
        None => return Ok(status_response(StatusCode::BAD_GATEWAY)),
    };
    if task.all_not_found() {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }

    // tombstone the replica holding the current version; its sync
    // worker propagates the delete to the others
    let best = match task.best_get() {
        Some(best) => best.clone(),
        None => return Ok(status_response(StatusCode::BAD_GATEWAY)),
    };
    match ctx.pool.delete_item(&best.storage, &header).await {
        Ok(()) => Ok(status_response(StatusCode::NO_CONTENT)),
        Err(err) => {
            log::error!("DELETE on storage {} failed - {:#}", best.storage.id(), err);
            Ok(status_response(StatusCode::BAD_GATEWAY))
        }
    }
}

async fn handle_mkcol(ctx: &ManagerContext, path: &str) -> Result<Response<Body>, Error> {
    let (level, sub_level) = match parse_level_path(path) {
        Some(parsed) => parsed,
        None => return Ok(status_response(StatusCode::NOT_FOUND)),
    };

    match ctx.meta.add_level(level, sub_level) {
        Ok(Some(row)) => {
            ctx.index.add_level_index(&row);
            log::info!("created level {}/{}", level, sub_level);
            Ok(status_response(StatusCode::CREATED))
        }
        Ok(None) => Ok(status_response(StatusCode::CONFLICT)),
        Err(err) => {
            log::error!("MKCOL {}/{} failed - {:#}", level, sub_level, err);
            Ok(status_response(StatusCode::SERVICE_UNAVAILABLE))
        }
    }
}

enum RangeLookup {
    Found(Arc<Range>),
    Missing,
    MetaFailed(Error),
}

fn lookup_range(ctx: &ManagerContext, header: &ItemHeader) -> RangeLookup {
    let index = match ctx
        .index
        .ensure_level(header.level, header.sub_level, ctx.meta.as_ref())
    {
        Ok(Some(index)) => index,
        Ok(None) => return RangeLookup::Missing,
        Err(err) => return RangeLookup::MetaFailed(err),
    };

    let range_index = index.calc_range_index(header.item_key);
    match index.load_range(range_index, ctx.meta.as_ref(), &ctx.cluster) {
        Ok(Some(range)) => RangeLookup::Found(range),
        Ok(None) => RangeLookup::Missing,
        Err(err) => RangeLookup::MetaFailed(err),
    }
}

fn parse_level_path(path: &str) -> Option<(Level, SubLevel)> {
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    let level = parts.next()?.parse().ok()?;
    let sub_level = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((level, sub_level))
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}
