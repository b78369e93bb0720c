//! Newline-delimited frame transport.
//!
//! One task owns the read half; writes go through a mutex-guarded handle so
//! concurrent handlers emit whole frames, never interleaved fragments. The
//! first failed write latches the transport as dead for the rest of the
//! session.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Spawn a task that splits the stream into trimmed, non-empty lines.
/// The channel closes when the peer closes the stream or a read fails.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if tx.send(trimmed.to_string()).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Transport input closed");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "Transport read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Shared handle for writing outbound frames.
#[derive(Clone)]
pub struct FrameWriter {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    failed: CancellationToken,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        FrameWriter {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            failed: CancellationToken::new(),
        }
    }

    /// Write one frame and flush. Returns false once the transport is dead;
    /// the first failure latches and later sends fail without touching the
    /// stream.
    pub async fn send(&self, frame: &str) -> bool {
        if self.failed.is_cancelled() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut writer, frame).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Transport write failed");
                self.failed.cancel();
                false
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves once a write has failed; never resolves on a healthy
    /// transport.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }
}

async fn write_frame(
    writer: &mut Box<dyn AsyncWrite + Unpin + Send>,
    frame: &str,
) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
