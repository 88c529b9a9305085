//! Manager daemon: fronts HTTP/WebDAV traffic and dispatches it to
//! the storage nodes owning each key range.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::Parser;

use metis::config::ManagerConfig;
use metis::manager::{
    self, ClusterManager, CommandPool, IndexManager, JsonMetaStore, ManagerContext, MetaStore,
};

#[derive(Parser)]
#[command(name = "metis-manager", about = "Metis manager daemon", version)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, default_value = "/etc/metis/manager.json")]
    config: PathBuf,
    /// Override the configured metadata file
    #[arg(long)]
    meta_path: Option<PathBuf>,
    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
    /// Override the configured server id
    #[arg(long)]
    server_id: Option<u32>,
    /// Override the configured worker thread count
    #[arg(long)]
    workers: Option<usize>,
    /// Override the configured request limit
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
        eprintln!("metis-manager: {:#}", err);
        std::process::exit(-1);
    }
}

fn run(args: Args) -> Result<(), Error> {
    let mut config = if args.config.exists() {
        ManagerConfig::load(&args.config)?
    } else {
        ManagerConfig::default()
    };
    if let Some(meta_path) = args.meta_path {
        config.meta_path = meta_path;
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
        "starting metis manager {} with metadata {:?}",
        config.server_id,
        config.meta_path
    );

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|err| format_err!("bad listen address {:?} - {}", config.listen, err))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let meta: Arc<dyn MetaStore> = Arc::new(JsonMetaStore::open(&config.meta_path)?);
        let cluster = Arc::new(ClusterManager::new(config.min_disk_free));
        cluster.load(&meta.load_storages()?)?;

        let index = Arc::new(IndexManager::new());
        index.load_all(meta.as_ref(), &cluster)?;
        log::info!(
            "loaded {} storages and {} levels",
            cluster.len(),
            index.level_count()
        );

        let pool = Arc::new(CommandPool::new(
            config.max_connections_per_storage,
            config.cmd_timeout(),
        ));

        let ctx = Arc::new(ManagerContext {
            config: Arc::new(config),
            meta,
            cluster,
            index,
            pool,
        });

        log::info!("listening on {}", addr);
        manager::serve(ctx, addr, shutdown_signal()).await
    })
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
    log::warn!("interruption signal received - shutting down");
}
