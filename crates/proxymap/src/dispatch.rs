//! Per-connection request dispatcher.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::warn;

use mail_core::{
    attr::{AttrError, AttrReader, AttrWriter},
    proto::{
        ProxyStatus, ATTR_FLAGS, ATTR_KEY, ATTR_STATUS, ATTR_TABLE, ATTR_VALUE, REQ_PROXY_LOOKUP,
        REQ_PROXY_OPEN,
    },
    server::{ConnectionError, ConnectionHandler},
    table::{AccessMode, Table, TableRegistry},
};

use crate::gate::{canonicalize, ApprovedSet};

/// One proxy worker: the approved list plus the registry of open handles.
///
/// Shared across all connections of the worker; the registry is the point
/// of the service, so handles deliberately outlive every client.
pub struct ProxyWorker {
    approved: ApprovedSet,
    registry: Mutex<TableRegistry>,
}

enum Found {
    Table(Arc<dyn Table>),
    Refused(ProxyStatus),
}

impl ProxyWorker {
    pub fn new(approved: ApprovedSet) -> Self {
        Self {
            approved,
            registry: Mutex::new(TableRegistry::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, TableRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an already-open handle, bypassing the backend open path.
    /// `canonical` must be in canonical form.
    pub fn register_table(&self, canonical: &str, user_flags: u32, table: Arc<dyn Table>) {
        self.registry().insert(canonical, user_flags, table);
    }

    /// Number of distinct handles opened so far.
    pub fn open_table_count(&self) -> usize {
        self.registry().len()
    }

    /// Label of the first registered table whose backing file changed on
    /// disk, if any. The worker restarts cleanly when this fires.
    pub fn registry_changed(&self) -> Option<String> {
        self.registry().changed()
    }

    /// Canonicalize, gate, and open (or reuse) the table named by a request.
    fn find_table(&self, reference: &str, user_flags: u32) -> Result<Found, ConnectionError> {
        let Some(canonical) = canonicalize(reference) else {
            return Ok(Found::Refused(ProxyStatus::Bad));
        };
        if !self.approved.contains(canonical) {
            warn!("request for unapproved table: {canonical:?}");
            warn!("to approve this table, list proxy:{canonical} in the proxy read_maps setting");
            return Ok(Found::Refused(ProxyStatus::Deny));
        }
        self.registry()
            .open_shared(canonical, AccessMode::ReadOnly, user_flags)
            .map(Found::Table)
            // The approved list names this table, so it must open; failure
            // here is a worker-fatal condition, not a client error.
            .map_err(|err| {
                ConnectionError::Fatal(format!("cannot open approved table `{canonical}`: {err}"))
            })
    }

    /// Serves one client connection: request frames in, reply frames out,
    /// until the client hangs up.
    pub async fn handle_stream<S>(&self, stream: S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = AttrReader::wrapping(read_half);
        let mut writer = AttrWriter::wrapping(write_half);
        loop {
            let request = match reader.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(err) if err.is_frame_error() => {
                    warn!("malformed request frame: {err}");
                    if err.needs_resync() {
                        reader.skip_to_end().await?;
                    }
                    reply_status_only(&mut writer, ProxyStatus::Bad).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match request.as_str() {
                REQ_PROXY_LOOKUP => self.lookup_request(&mut reader, &mut writer).await?,
                REQ_PROXY_OPEN => self.open_request(&mut reader, &mut writer).await?,
                other => {
                    warn!("unrecognized request: {other:?}, ignored");
                    reader.skip_to_end().await?;
                    reply_status_only(&mut writer, ProxyStatus::Bad).await?;
                }
            }
        }
    }

    async fn lookup_request<R, W>(
        &self,
        reader: &mut AttrReader<R>,
        writer: &mut AttrWriter<W>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let body = async {
            let table = reader.read_string(ATTR_TABLE).await?;
            let flags = reader.read_number(ATTR_FLAGS).await?;
            let key = reader.read_string(ATTR_KEY).await?;
            reader.expect_end().await?;
            Ok::<_, AttrError>((table, flags, key))
        }
        .await;

        let (status, value) = match body {
            Err(err) => {
                if !err.is_frame_error() {
                    return Err(err.into());
                }
                warn!("malformed lookup request: {err}");
                if err.needs_resync() {
                    reader.skip_to_end().await?;
                }
                (ProxyStatus::Bad, String::new())
            }
            Ok((table, flags, key)) => match u32::try_from(flags) {
                Err(_) => (ProxyStatus::Bad, String::new()),
                Ok(user_flags) => match self.find_table(&table, user_flags)? {
                    Found::Refused(status) => (status, String::new()),
                    Found::Table(handle) => match handle.lookup(&key) {
                        Ok(Some(value)) => (ProxyStatus::Ok, value),
                        Ok(None) => (ProxyStatus::NoKey, String::new()),
                        Err(err) => {
                            warn!("lookup in `{table}` failed: {err}");
                            (ProxyStatus::Retry, String::new())
                        }
                    },
                },
            },
        };

        writer.write_number(ATTR_STATUS, status.code());
        writer.write_string(ATTR_VALUE, &value);
        writer.finish().await?;
        Ok(())
    }

    async fn open_request<R, W>(
        &self,
        reader: &mut AttrReader<R>,
        writer: &mut AttrWriter<W>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let body = async {
            let table = reader.read_string(ATTR_TABLE).await?;
            let flags = reader.read_number(ATTR_FLAGS).await?;
            reader.expect_end().await?;
            Ok::<_, AttrError>((table, flags))
        }
        .await;

        let (status, handle_flags) = match body {
            Err(err) => {
                if !err.is_frame_error() {
                    return Err(err.into());
                }
                warn!("malformed open request: {err}");
                if err.needs_resync() {
                    reader.skip_to_end().await?;
                }
                (ProxyStatus::Bad, 0)
            }
            Ok((table, flags)) => match u32::try_from(flags) {
                Err(_) => (ProxyStatus::Bad, 0),
                Ok(user_flags) => match self.find_table(&table, user_flags)? {
                    Found::Refused(status) => (status, 0),
                    Found::Table(handle) => (ProxyStatus::Ok, i64::from(handle.flags())),
                },
            },
        };

        writer.write_number(ATTR_STATUS, status.code());
        writer.write_number(ATTR_FLAGS, handle_flags);
        writer.finish().await?;
        Ok(())
    }
}

async fn reply_status_only<W>(
    writer: &mut AttrWriter<W>,
    status: ProxyStatus,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_number(ATTR_STATUS, status.code());
    writer.finish().await?;
    Ok(())
}

#[async_trait]
impl ConnectionHandler for ProxyWorker {
    async fn serve_connection(&self, stream: UnixStream) -> Result<(), ConnectionError> {
        self.handle_stream(stream).await
    }
}
