//! Address verification cache daemon.
//!
//! Startup ordering matters here. The cache table is opened first, before
//! the supervisor would drop privileges, so file creation happens while
//! still privileged; then the worker moves into its own process group so a
//! supervisor-directed broadcast signal cannot kill it in the middle of a
//! store update. With a memory-only cache the max-use and idle shutdowns
//! are disabled, because exiting would destroy the cache.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mail_core::{
    server::{self, ServerLimits, ServerOptions},
    table::{self, AccessMode, Table, FLAG_DUP_REPLACE, FLAG_SYNC_UPDATE},
};
use verify::{
    PolicyEngine, QueueClient, SystemClock, VerifyConfig, VerifyWorker,
};

#[derive(Debug, Parser)]
#[command(name = "verifyd")]
#[command(about = "Recipient address verification cache server")]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long, value_name = "PATH", default_value = "/etc/mail/verifyd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config: VerifyConfig = mail_core::config::load(&cli.config)?;

    let memory_only = config.verify.is_memory_only();
    let cache: Arc<dyn Table> = if memory_only {
        info!("keeping verification state in volatile memory");
        table::open_table("memory:verify", AccessMode::ReadWriteCreate, FLAG_DUP_REPLACE)?
    } else {
        info!(map = %config.verify.map, "opening persistent verification cache");
        table::open_table(
            &config.verify.map,
            AccessMode::ReadWriteCreate,
            FLAG_DUP_REPLACE | FLAG_SYNC_UPDATE,
        )?
    };

    // Never get killed by a supervisor broadcast in the middle of an
    // update; that would corrupt the persistent store.
    if let Err(err) = nix::unistd::setsid() {
        warn!("cannot detach into a new session: {err}");
    }

    let mut limits = config.server.limits();
    if memory_only {
        limits = ServerLimits {
            max_use: 0,
            max_idle: Duration::ZERO,
        };
    }

    let prober = Arc::new(QueueClient::new(&config.probe.submit_socket));
    let engine = PolicyEngine::new(
        cache.clone(),
        config.verify.policy_options(),
        Arc::new(SystemClock),
        prober,
    );
    let worker = Arc::new(VerifyWorker::new(engine));

    let listener = server::bind_unix(&config.server.socket_path)?;
    info!(socket = %config.server.socket_path.display(), "verifyd listening");

    let options = ServerOptions {
        limits,
        solitary: true,
    };
    let watched = cache.clone();
    let outcome = server::serve(listener, worker, options, move || {
        if watched.changed() {
            info!("verification cache has changed -- restarting");
            false
        } else {
            true
        }
    })
    .await?;

    info!(?outcome, "verifyd exiting");
    Ok(())
}
