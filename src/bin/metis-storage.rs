//! Storage node daemon: persists object bytes in packed slice files
//! and serves the binary storage command protocol.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::Parser;
use tokio::net::TcpListener;

use metis::config::StorageConfig;
use metis::storage::{self, Storage, StorageContext, SyncWorker};

#[derive(Parser)]
#[command(name = "metis-storage", about = "Metis storage node daemon", version)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, default_value = "/etc/metis/storage.json")]
    config: PathBuf,
    /// Override the configured data directory
    #[arg(long)]
    data_path: Option<PathBuf>,
    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
    /// Override the configured server id
    #[arg(long)]
    server_id: Option<u32>,
    /// Override the configured worker thread count
    #[arg(long)]
    workers: Option<usize>,
    /// Override the configured connection limit
    #[arg(long)]
    worker_queue_length: Option<usize>,
    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
    /// Log to this file instead of stderr
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run(Args::parse()) {
        eprintln!("metis-storage: {:#}", err);
        std::process::exit(-1);
    }
}

fn run(args: Args) -> Result<(), Error> {
    let mut config = if args.config.exists() {
        StorageConfig::load(&args.config)?
    } else {
        StorageConfig::default()
    };
    if let Some(data_path) = args.data_path {
        config.data_path = data_path;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(server_id) = args.server_id {
        config.server_id = server_id;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(worker_queue_length) = args.worker_queue_length {
        config.worker_queue_length = worker_queue_length;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    if let Some(log_path) = args.log_path {
        config.log_path = Some(log_path);
    }

    init_logger(&config.log_level, config.log_path.as_deref())?;
    log::info!(
        "starting metis storage server {} on {:?}",
        config.server_id,
        config.data_path
    );

    let peers = config
        .sync_peers
        .iter()
        .map(|peer| {
            peer.parse::<SocketAddr>()
                .map_err(|err| format_err!("bad sync peer address {:?} - {}", peer, err))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let storage = Arc::new(Storage::open(
            &config.data_path,
            config.min_disk_free,
            config.max_slice_size,
            config.fsync,
        )?);

        if config.pull_on_start && !peers.is_empty() {
            catch_up(storage.clone(), peers.clone(), config.cmd_timeout()).await?;
        }

        let sync_worker = if peers.is_empty() {
            None
        } else {
            Some(SyncWorker::spawn(peers, config.cmd_timeout())?)
        };

        let ctx = Arc::new(StorageContext {
            storage,
            sync: sync_worker.as_ref().map(|worker| worker.sender()),
        });

        let listener = TcpListener::bind(&config.listen).await?;
        log::info!("listening on {}", config.listen);
        storage::serve(ctx, listener, config.worker_queue_length, shutdown_signal()).await?;

        if let Some(worker) = sync_worker {
            worker.shutdown();
        }
        Ok(())
    })
}

async fn catch_up(
    storage: Arc<Storage>,
    peers: Vec<SocketAddr>,
    timeout: std::time::Duration,
) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || {
        for peer in &peers {
            for (level, sub_level) in storage.levels() {
                match storage::pull_from_peer(&storage, peer, level, sub_level, timeout) {
                    Ok(0) => {}
                    Ok(applied) => log::info!(
                        "pulled {} records of {}/{} from {}",
                        applied,
                        level,
                        sub_level,
                        peer
                    ),
                    Err(err) => log::warn!("catch-up pull from {} failed - {}", peer, err),
                }
            }
        }
    })
    .await?;
    Ok(())
}

fn init_logger(level: &str, path: Option<&std::path::Path>) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    if let Some(path) = path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format_err!("unable to open log file {:?} - {}", path, err))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            log::error!("unable to install SIGTERM handler - {}", err);
            futures::future::pending::<()>().await;
            unreachable!();
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    log::warn!("interruption signal received - flushing data");
}
