//! Probe message submission.
//!
//! A probe is a specially flagged message injected into the mail queue to
//! discover whether a recipient is deliverable: it runs through routing and
//! rewriting but is discarded at final delivery. Submission is atomic:
//! either the whole session succeeds and the probe is queued, or it failed
//! and nothing was scheduled. An asynchronous submitter is therefore a
//! drop-in replacement behind the same trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use mail_core::{
    attr::{AttrError, AttrReader, AttrWriter},
    proto::{
        ATTR_ADDRESS, ATTR_FLAGS, ATTR_REQUEST, ATTR_SENDER, ATTR_STATUS, FLAG_VERIFY_PROBE,
        REQ_QUEUE_SUBMIT,
    },
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot reach the mail submission service at `{socket}`: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("probe submission session failed: {0}")]
    Session(#[from] AttrError),
    #[error("mail submission service refused the probe (status {status})")]
    Refused { status: i64 },
}

/// Submits one verify-only probe message.
#[async_trait]
pub trait ProbeSubmitter: Send + Sync {
    /// `Ok(())` means the probe is in the queue. An empty `sender` selects
    /// the null sender address.
    async fn submit(&self, sender: &str, recipient: &str) -> Result<(), ProbeError>;
}

/// Speaks one `submit` attribute frame per probe to the queue daemon's
/// Unix-domain socket.
pub struct QueueClient {
    socket: PathBuf,
}

impl QueueClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

#[async_trait]
impl ProbeSubmitter for QueueClient {
    async fn submit(&self, sender: &str, recipient: &str) -> Result<(), ProbeError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| ProbeError::Connect {
                socket: self.socket.clone(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = AttrReader::wrapping(read_half);
        let mut writer = AttrWriter::wrapping(write_half);

        writer
            .write_string(ATTR_REQUEST, REQ_QUEUE_SUBMIT)
            .write_string(ATTR_SENDER, sender)
            .write_string(ATTR_ADDRESS, recipient)
            .write_number(ATTR_FLAGS, FLAG_VERIFY_PROBE);
        writer.finish().await?;

        let status = reader.read_number(ATTR_STATUS).await?;
        reader.expect_end().await?;
        if status != 0 {
            return Err(ProbeError::Refused { status });
        }
        debug!("probe for {recipient} queued");
        Ok(())
    }
}
