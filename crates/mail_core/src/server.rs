//! Multi-client socket server skeleton.
//!
//! A worker accepts connections on one Unix-domain listener and hands each
//! to a [`ConnectionHandler`]. The skeleton owns process-lifetime policy:
//! exit after serving a bounded number of client connections, exit after a
//! bounded idle period, and run a `pre_accept` check between connections so
//! workers can restart cleanly when their configuration tables change. The
//! supervisor respawns exited workers.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    net::{UnixListener, UnixStream},
    task::JoinSet,
    time,
};
use tracing::{debug, warn};

use crate::attr::AttrError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Client-side trouble: the connection is dropped, the worker lives on.
    #[error("client connection error: {0}")]
    Client(#[from] AttrError),
    /// A broken invariant on the worker side; the whole worker aborts and
    /// the supervisor respawns it with fresh state.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind listener socket `{path}`: {source}")]
    Bind {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("worker aborted: {0}")]
    Fatal(String),
}

/// Process-lifetime limits; zero disables the corresponding shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    /// Client connections to serve before exiting.
    pub max_use: u32,
    /// Exit after this long with no client activity.
    pub max_idle: Duration,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_use: 100,
            max_idle: Duration::from_secs(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    pub limits: ServerLimits,
    /// Serve one connection at a time, to completion. Required for workers
    /// that write a shared store and must never interleave with a second
    /// client of the same listener.
    pub solitary: bool,
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The idle limit elapsed with no client activity.
    Idle,
    /// The max-use connection budget is spent.
    MaxUse,
    /// The pre-accept check asked for a clean exit.
    PreAcceptStop,
}

#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serves one client connection to completion: a loop of request frame
    /// in, reply frame out, until the client hangs up.
    async fn serve_connection(&self, stream: UnixStream) -> Result<(), ConnectionError>;
}

/// Removes a stale socket file and binds the listener.
pub fn bind_unix(path: &Path) -> Result<UnixListener, ServerError> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs the accept loop until one of the lifetime policies fires.
///
/// `pre_accept` runs between connections; returning `false` drains any
/// in-flight connections and exits cleanly. In-flight requests are never
/// abandoned mid-update.
pub async fn serve<H, F>(
    listener: UnixListener,
    handler: Arc<H>,
    options: ServerOptions,
    mut pre_accept: F,
) -> Result<ServeOutcome, ServerError>
where
    H: ConnectionHandler,
    F: FnMut() -> bool + Send,
{
    let mut served: u32 = 0;
    let mut active: JoinSet<Result<(), ConnectionError>> = JoinSet::new();

    loop {
        if !pre_accept() {
            drain(&mut active).await?;
            return Ok(ServeOutcome::PreAcceptStop);
        }

        let accepted = if options.limits.max_idle.is_zero() {
            Some(listener.accept().await)
        } else {
            match time::timeout(options.limits.max_idle, listener.accept()).await {
                Ok(accepted) => Some(accepted),
                Err(_) => None,
            }
        };

        let Some(accepted) = accepted else {
            if active.is_empty() {
                return Ok(ServeOutcome::Idle);
            }
            // Clients are still being served; the worker is not idle.
            reap_finished(&mut active)?;
            continue;
        };

        let (stream, _addr) = accepted.map_err(ServerError::Accept)?;
        served = served.saturating_add(1);
        debug!(served, "accepted client connection");

        if options.solitary {
            settle(handler.serve_connection(stream).await)?;
        } else {
            let handler = handler.clone();
            active.spawn(async move { handler.serve_connection(stream).await });
            reap_finished(&mut active)?;
        }

        if options.limits.max_use != 0 && served >= options.limits.max_use {
            drain(&mut active).await?;
            return Ok(ServeOutcome::MaxUse);
        }
    }
}

fn settle(result: Result<(), ConnectionError>) -> Result<(), ServerError> {
    match result {
        Ok(()) => Ok(()),
        Err(ConnectionError::Fatal(message)) => Err(ServerError::Fatal(message)),
        Err(err) => {
            warn!("client connection dropped: {err}");
            Ok(())
        }
    }
}

fn reap_finished(active: &mut JoinSet<Result<(), ConnectionError>>) -> Result<(), ServerError> {
    while let Some(joined) = active.try_join_next() {
        match joined {
            Ok(result) => settle(result)?,
            Err(join_err) => warn!("connection task failed: {join_err}"),
        }
    }
    Ok(())
}

async fn drain(active: &mut JoinSet<Result<(), ConnectionError>>) -> Result<(), ServerError> {
    while let Some(joined) = active.join_next().await {
        match joined {
            Ok(result) => settle(result)?,
            Err(join_err) => warn!("connection task failed: {join_err}"),
        }
    }
    Ok(())
}
