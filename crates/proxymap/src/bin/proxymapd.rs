//! Proxy map server daemon.
//!
//! Serves read-only table lookups to other mail system processes over a
//! Unix-domain socket, so chrooted clients can reach tables outside their
//! jail and scarce backend connections are shared instead of multiplied.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mail_core::server::{self, ServerOptions};
use proxymap::{ApprovedSet, ProxyConfig, ProxyWorker};

#[derive(Debug, Parser)]
#[command(name = "proxymapd")]
#[command(about = "Read-only lookup table proxy server")]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long, value_name = "PATH", default_value = "/etc/mail/proxymapd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config: ProxyConfig = mail_core::config::load(&cli.config)?;

    let approved = ApprovedSet::parse(&config.proxy.read_maps);
    info!(tables = approved.len(), "approved table list ready");
    let worker = Arc::new(ProxyWorker::new(approved));

    let listener = server::bind_unix(&config.server.socket_path)?;
    info!(socket = %config.server.socket_path.display(), "proxymapd listening");

    let options = ServerOptions {
        limits: config.server.limits(),
        solitary: false,
    };
    let watched = worker.clone();
    let outcome = server::serve(listener, worker, options, move || {
        match watched.registry_changed() {
            Some(label) => {
                info!("table {label} has changed -- restarting");
                false
            }
            None => true,
        }
    })
    .await?;

    info!(?outcome, "proxymapd exiting");
    Ok(())
}
