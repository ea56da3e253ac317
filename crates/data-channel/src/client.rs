//! TCP upload client (sender side).
//!
//! Connects to the receiver, sends the handshake, waits for the resume
//! offset, then streams the rest of the source file under the receiver's
//! credit window.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rft_protocol::wire::{read_frame, write_frame};
use rft_protocol::{ErrorKind, Frame, TransferRequest};
use rft_transfer::{ChunkProducer, CreditWindow};

use crate::error::DataChannelError;
use crate::wire::{recv_frame, send_error, unexpected};
use crate::{HANDSHAKE_TIMEOUT, TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT};

/// How long to wait for the receiver's reason after a write fails.
const REASON_GRACE: Duration = Duration::from_secs(2);

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Storage path the receiver finalised.
    pub resolved_path: String,
    /// Blocks the receiver already had.
    pub resume_offset: u64,
    pub chunks_sent: u64,
    /// Bytes sent in this session (excludes resumed blocks).
    pub bytes_sent: u64,
    pub file_size: u64,
}

/// TCP client for sending one file.
pub struct UploadClient;

impl UploadClient {
    /// Uploads `source` to the receiver at `addr`.
    ///
    /// Progress is reported as `(bytes_done, file_size)` where `bytes_done`
    /// includes the blocks skipped on resume. Events are dropped when the
    /// channel is full.
    pub async fn upload(
        addr: SocketAddr,
        request: &TransferRequest,
        source: &Path,
        cancel: CancellationToken,
        progress_tx: mpsc::Sender<(u64, u64)>,
    ) -> Result<UploadReport, DataChannelError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
                match result {
                    Ok(Ok(s)) => {
                        info!(%addr, "upload connection established");
                        s
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
        Self::run(reader, writer, request, source, cancel, progress_tx).await
    }

    async fn run<R, W>(
        mut reader: R,
        mut writer: W,
        request: &TransferRequest,
        source: &Path,
        cancel: CancellationToken,
        progress_tx: mpsc::Sender<(u64, u64)>,
    ) -> Result<UploadReport, DataChannelError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut request = request.clone();
        let file_size = tokio::fs::metadata(source).await?.len();
        match request.file_size {
            Some(declared) if declared != file_size => {
                return Err(DataChannelError::Protocol(format!(
                    "request declares {declared} bytes, {} has {file_size}",
                    source.display()
                )));
            }
            Some(_) => {}
            None => request.file_size = Some(file_size),
        }

        let handshake = request.encode()?;
        write_frame(&mut writer, &Frame::Handshake(handshake)).await?;

        let (resume_offset, block_size) =
            match recv_frame(&mut reader, &cancel, HANDSHAKE_TIMEOUT).await? {
                Frame::Accept {
                    resume_offset,
                    block_size,
                } => (resume_offset, block_size),
                other => return Err(unexpected(other, "ACCEPT")),
            };
        if block_size != request.block_size {
            let reason = format!(
                "receiver echoed block size {block_size}, requested {}",
                request.block_size
            );
            send_error(&mut writer, ErrorKind::IncompatibleResume, reason.clone()).await;
            return Err(DataChannelError::Protocol(reason));
        }
        info!(
            file = %request.file_name,
            resume_offset,
            block_size,
            "upload accepted"
        );

        let mut producer = match ChunkProducer::open(source, block_size, resume_offset).await {
            Ok(p) => p,
            Err(e) => {
                send_error(&mut writer, e.kind(), e.to_string()).await;
                return Err(e.into());
            }
        };

        let window = CreditWindow::new(0);
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let listener = tokio::spawn(listen(reader, window.clone(), outcome_tx));

        let sent = send_chunks(&mut writer, &mut producer, &window, &cancel, &progress_tx).await;
        let (chunks_sent, bytes_sent) = match sent {
            Ok(counts) => counts,
            Err(DataChannelError::Cancelled) => {
                listener.abort();
                send_error(&mut writer, ErrorKind::Cancelled, "sender cancelled".into()).await;
                return Err(DataChannelError::Cancelled);
            }
            Err(e @ (DataChannelError::Protocol(_) | DataChannelError::Wire(_))) => {
                // The receiver usually says why it stopped before hanging up.
                let reason = tokio::time::timeout(REASON_GRACE, &mut outcome_rx).await;
                listener.abort();
                return match reason {
                    Ok(Ok(Err(reason))) => Err(reason),
                    _ => Err(e),
                };
            }
            Err(e) => {
                listener.abort();
                return Err(e);
            }
        };

        let resolved_path = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                listener.abort();
                return Err(DataChannelError::Cancelled);
            }
            outcome = &mut outcome_rx => outcome.map_err(|_| {
                DataChannelError::Protocol("receiver connection lost before DONE".into())
            })??,
        };

        info!(
            path = %resolved_path,
            chunks_sent,
            bytes_sent,
            "upload complete"
        );
        Ok(UploadReport {
            resolved_path,
            resume_offset,
            chunks_sent,
            bytes_sent,
            file_size,
        })
    }
}

/// Streams every remaining chunk, then `END`.
///
/// Cancellation is observed between frames only, so the receiver never
/// sees a torn `CHUNK`.
async fn send_chunks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    producer: &mut ChunkProducer,
    window: &CreditWindow,
    cancel: &CancellationToken,
    progress_tx: &mpsc::Sender<(u64, u64)>,
) -> Result<(u64, u64), DataChannelError> {
    let mut chunks = 0u64;
    let mut bytes = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(DataChannelError::Cancelled);
        }
        let chunk = match producer.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                send_error(writer, e.kind(), format!("source read failed: {e}")).await;
                return Err(e.into());
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
            granted = window.acquire() => granted.map_err(|_| {
                DataChannelError::Protocol("receiver stopped granting credits".into())
            })?,
        }

        bytes += chunk.len() as u64;
        chunks += 1;
        write_frame(
            writer,
            &Frame::Chunk {
                sequence: chunk.sequence,
                data: chunk.data,
            },
        )
        .await?;

        // Report progress (non-blocking).
        let _ = progress_tx.try_send((producer.position(), producer.file_size()));
    }

    write_frame(writer, &Frame::End).await?;
    debug!(chunks, bytes, "end of file sent");
    Ok((chunks, bytes))
}

/// Reads receiver frames after `ACCEPT`: grants credits and delivers the
/// final `DONE` or `ERROR`. Closes `window` when it stops.
async fn listen<R: AsyncRead + Unpin>(
    mut reader: R,
    window: CreditWindow,
    outcome_tx: oneshot::Sender<Result<String, DataChannelError>>,
) {
    let outcome = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Credit(n))) => window.grant(n),
            Ok(Some(Frame::Done(path))) => break Ok(path),
            Ok(Some(other)) => break Err(unexpected(other, "CREDIT or DONE")),
            Ok(None) => {
                break Err(DataChannelError::Protocol(
                    "receiver closed the connection".into(),
                ));
            }
            Err(e) => break Err(e.into()),
        }
    };
    window.close();
    let _ = outcome_tx.send(outcome);
}
