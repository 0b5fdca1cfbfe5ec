//! Per-connection request dispatcher.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::warn;

use mail_core::{
    attr::{AttrError, AttrReader, AttrWriter},
    proto::{
        AddrStatus, VerifyStatus, ATTR_ADDRESS, ATTR_ADDR_STATUS, ATTR_STATUS, ATTR_WHY,
        REQ_VERIFY_QUERY, REQ_VERIFY_UPDATE,
    },
    server::{ConnectionError, ConnectionHandler},
};

use crate::policy::PolicyEngine;

/// One verify worker. The listener is served solitary, one client session
/// at a time, so cache reads and writes never interleave.
pub struct VerifyWorker {
    engine: PolicyEngine,
}

impl VerifyWorker {
    pub fn new(engine: PolicyEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
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
                    reply_status(&mut writer, VerifyStatus::Bad).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match request.as_str() {
                REQ_VERIFY_UPDATE => self.update_request(&mut reader, &mut writer).await?,
                REQ_VERIFY_QUERY => self.query_request(&mut reader, &mut writer).await?,
                other => {
                    warn!("unrecognized request: {other:?}, ignored");
                    reader.skip_to_end().await?;
                    reply_status(&mut writer, VerifyStatus::Bad).await?;
                }
            }
        }
    }

    async fn update_request<R, W>(
        &self,
        reader: &mut AttrReader<R>,
        writer: &mut AttrWriter<W>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let body = async {
            let address = reader.read_string(ATTR_ADDRESS).await?;
            let status = reader.read_number(ATTR_ADDR_STATUS).await?;
            let why = reader.read_string(ATTR_WHY).await?;
            reader.expect_end().await?;
            Ok::<_, AttrError>((address, status, why))
        }
        .await;

        let status = match body {
            Err(err) => {
                if !err.is_frame_error() {
                    return Err(err.into());
                }
                warn!("malformed update request: {err}");
                if err.needs_resync() {
                    reader.skip_to_end().await?;
                }
                VerifyStatus::Bad
            }
            Ok((address, status, why)) => self.engine.update(&address, status, &why),
        };
        reply_status(writer, status).await
    }

    async fn query_request<R, W>(
        &self,
        reader: &mut AttrReader<R>,
        writer: &mut AttrWriter<W>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let body = async {
            let address = reader.read_string(ATTR_ADDRESS).await?;
            reader.expect_end().await?;
            Ok::<_, AttrError>(address)
        }
        .await;

        let address = match body {
            Err(err) => {
                if !err.is_frame_error() {
                    return Err(err.into());
                }
                warn!("malformed query request: {err}");
                if err.needs_resync() {
                    reader.skip_to_end().await?;
                }
                writer.write_number(ATTR_STATUS, VerifyStatus::Bad.code());
                writer.write_number(ATTR_ADDR_STATUS, AddrStatus::Todo.code());
                writer.write_string(ATTR_WHY, "");
                writer.finish().await?;
                return Ok(());
            }
            Ok(address) => address,
        };

        let outcome = self.engine.query(&address);
        writer.write_number(ATTR_STATUS, VerifyStatus::Ok.code());
        writer.write_number(ATTR_ADDR_STATUS, outcome.status.code());
        writer.write_string(ATTR_WHY, &outcome.text);
        // Flush the reply before the refresh step: probe submission blocks
        // on the queue daemon and must not hold up the client.
        writer.finish().await?;

        self.engine.refresh(outcome).await;
        Ok(())
    }
}

async fn reply_status<W>(
    writer: &mut AttrWriter<W>,
    status: VerifyStatus,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_number(ATTR_STATUS, status.code());
    writer.finish().await?;
    Ok(())
}

#[async_trait]
impl ConnectionHandler for VerifyWorker {
    async fn serve_connection(&self, stream: UnixStream) -> Result<(), ConnectionError> {
        self.handle_stream(stream).await
    }
}
