//! volmgr cluster volume manager daemon (volmgrd).
//!
//! Manages replicated block-storage volumes across a cluster of nodes:
//! keeps the authoritative cluster graph in the control-volume store,
//! watches the replication event feed for changes made by peers, and
//! converges local state toward the operator-declared targets.
//!
//! Usage:
//!   volmgrd --node-name <NAME> [OPTIONS]

mod config;
mod deployer;
mod events;
mod persistence;
mod reconcile;
mod server;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use volmgr_proto::defaults::DEFAULT_CONF_PATH;

use crate::config::{ServerConf, KEY_STORE_PATH};
use crate::events::EventsWatcher;
use crate::persistence::ControlStore;
use crate::reconcile::CmdResCtl;
use crate::server::Server;

/// volmgr cluster volume manager daemon
#[derive(Parser, Debug)]
#[command(name = "volmgrd", version, about = "Cluster volume manager daemon")]
struct Args {
    /// Name of this cluster node
    #[arg(short = 'n', long)]
    node_name: String,

    /// Configuration file path
    #[arg(short = 'c', long, default_value = DEFAULT_CONF_PATH)]
    config: PathBuf,

    /// Control-volume store path (overrides the configuration file)
    #[arg(short = 's', long)]
    store: Option<PathBuf>,

    /// Format an empty control-volume store before starting
    #[arg(long)]
    init: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("volmgrd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut conf = ServerConf::load(&args.config).await;
    if let Some(store) = &args.store {
        conf.set(KEY_STORE_PATH, &store.display().to_string());
    }

    if args.init {
        let path = PathBuf::from(conf.store_path());
        if let Err(e) = ControlStore::create(&path) {
            error!("cannot format control store {}: {}", path.display(), e);
            std::process::exit(1);
        }
        info!("formatted empty control store {}", path.display());
    }

    let util_path = conf.util_path().to_string();
    let events_util = conf.events_util().to_string();
    let res_ctl = CmdResCtl::new(&util_path, &events_util);

    let mut server = match Server::new(conf, &args.node_name, Box::new(res_ctl)) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.initial_up().await {
        error!("cannot bring up the initial configuration: {}", e);
        std::process::exit(1);
    }

    let trigger = Arc::new(Notify::new());
    let watcher = EventsWatcher::new(&util_path, &events_util, trigger.clone());
    let mut watcher_handle = tokio::spawn(watcher.run());

    info!("volmgrd ready (node '{}')", server.node_name());

    loop {
        tokio::select! {
            _ = trigger.notified() => {
                if let Err(e) = server.react_to_peer_change().await {
                    warn!("reconciliation after peer change failed: {}", e);
                }
            }
            joined = &mut watcher_handle => {
                match joined {
                    Ok(Err(e)) => error!("event feed failed: {}", e),
                    Ok(Ok(())) => warn!("event feed ended"),
                    Err(e) => error!("event watcher task panicked: {}", e),
                }
                std::process::exit(1);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    if let Err(e) = server.save_conf().await {
        error!("failed to save the configuration on shutdown: {}", e);
    }
    info!("volmgrd stopped");
}
