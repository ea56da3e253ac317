//! TCP upload server (receiver side).
//!
//! Accepts connections until cancelled and runs one upload session per
//! connection against a shared [`Receiver`].

use std::net::SocketAddr;

use futures_util::stream;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use rft_protocol::wire::{read_frame_limited, write_frame};
use rft_protocol::{ErrorKind, Frame};
use rft_transfer::{Chunk, Receiver, SessionOutcome, TransferError};

use crate::error::DataChannelError;
use crate::wire::{recv_frame, send_error, unexpected};
use crate::{HANDSHAKE_TIMEOUT, TCP_BUFFER_SIZE};

/// TCP server receiving uploads into a storage root.
#[derive(Clone)]
pub struct UploadServer {
    receiver: Receiver,
    window: u32,
    cancel: CancellationToken,
    sessions: TaskTracker,
}

impl UploadServer {
    /// `window` is the number of chunks a sender may have in flight.
    pub fn new(receiver: Receiver, window: u32, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            window: window.max(1),
            cancel,
            sessions: TaskTracker::new(),
        }
    }

    /// Binds `addr` for [`serve`](Self::serve).
    pub async fn bind(addr: &str) -> Result<TcpListener, DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "upload listener bound");
        Ok(listener)
    }

    /// Accepts connections until cancelled, one task per connection.
    ///
    /// On cancellation, waits for open sessions to pause before returning.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    drop(listener);
                    self.sessions.close();
                    info!(open = self.sessions.len(), "upload listener stopped");
                    self.sessions.wait().await;
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };

            let server = self.clone();
            self.sessions.spawn(async move {
                match server.handle_connection(stream, addr).await {
                    Ok(outcome) => debug!(%addr, path = %outcome.resolved_path, "connection finished"),
                    Err(e) => warn!(%addr, "upload failed: {e}"),
                }
            });
        }
    }

    /// Runs one upload session on an accepted connection.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<SessionOutcome, DataChannelError> {
        info!(%addr, "upload connection accepted");
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
        self.run_session(reader, writer).await
    }

    async fn run_session<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<SessionOutcome, DataChannelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let cancel = self.cancel.child_token();

        let handshake = match recv_frame(&mut reader, &cancel, HANDSHAKE_TIMEOUT).await? {
            Frame::Handshake(text) => text,
            other => {
                let err = unexpected(other, "HANDSHAKE");
                send_error(&mut writer, ErrorKind::MalformedHandshake, err.to_string()).await;
                return Err(err);
            }
        };

        let session = match self.receiver.open_session(&handshake).await {
            Ok(s) => s,
            Err(e) => {
                warn!("upload refused: {e}");
                send_error(&mut writer, e.kind(), e.to_string()).await;
                return Err(e.into());
            }
        };

        let accepted = async {
            write_frame(
                &mut writer,
                &Frame::Accept {
                    resume_offset: session.resume_offset(),
                    block_size: session.block_size(),
                },
            )
            .await?;
            write_frame(&mut writer, &Frame::Credit(self.window)).await
        }
        .await;
        if let Err(e) = accepted {
            let err = TransferError::Channel(format!("could not accept upload: {e}"));
            return Err(session.abandon(err).await.into());
        }

        let max_chunk = session.block_size().saturating_add(8);
        let chunks = Box::pin(chunk_stream(&mut reader, &mut writer, max_chunk));
        let result = session.consume(chunks, cancel).await;

        match result {
            Ok(outcome) => {
                write_frame(&mut writer, &Frame::Done(outcome.resolved_path.clone())).await?;
                Ok(outcome)
            }
            Err(e) => {
                send_error(&mut writer, e.kind(), e.to_string()).await;
                Err(e.into())
            }
        }
    }
}

/// Turns incoming `CHUNK` frames into a chunk stream ending at `END`.
///
/// Each poll after a chunk first returns that chunk's credit to the sender.
/// Frames longer than `max_len` are rejected before they are buffered.
fn chunk_stream<'a, R, W>(
    reader: &'a mut R,
    writer: &'a mut W,
    max_len: u32,
) -> impl futures_util::Stream<Item = Result<Chunk, TransferError>> + 'a
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    stream::unfold((reader, writer, false), move |(reader, writer, owed)| async move {
        if owed {
            if let Err(e) = write_frame(writer, &Frame::Credit(1)).await {
                // Keep reading: whatever the sender already wrote is still valid.
                debug!("credit not delivered: {e}");
            }
        }
        let item = match read_frame_limited(reader, max_len).await {
            Ok(Some(Frame::Chunk { sequence, data })) => Ok(Chunk::new(sequence, data)),
            Ok(Some(Frame::End)) => return None,
            Ok(Some(Frame::Error {
                kind: ErrorKind::Cancelled,
                ..
            })) => Err(TransferError::Cancelled),
            Ok(Some(Frame::Error { kind, reason })) => Err(TransferError::Channel(format!(
                "sender aborted ({kind}): {reason}"
            ))),
            Ok(Some(other)) => Err(TransferError::Channel(format!(
                "unexpected {} frame during transfer",
                other.name()
            ))),
            Ok(None) => Err(TransferError::Channel(
                "connection closed before end of file".into(),
            )),
            Err(e) => Err(TransferError::Channel(e.to_string())),
        };
        let owed = item.is_ok();
        Some((item, (reader, writer, owed)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rft_catalog::MemoryCatalog;
    use rft_protocol::wire::read_frame;
    use rft_protocol::TransferRequest;
    use std::sync::Arc;

    fn server(root: &std::path::Path) -> (UploadServer, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        let receiver = Receiver::new(catalog.clone(), root);
        (
            UploadServer::new(receiver, 2, CancellationToken::new()),
            catalog,
        )
    }

    #[tokio::test]
    async fn non_handshake_first_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path());
        let (client, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(async move { server.run_session(server_read, server_write).await });
        write_frame(&mut client_write, &Frame::End).await.unwrap();

        let reply = read_frame(&mut client_read).await.unwrap().unwrap();
        assert!(matches!(
            reply,
            Frame::Error {
                kind: ErrorKind::MalformedHandshake,
                ..
            }
        ));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn in_memory_session_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (server, catalog) = server(dir.path());
        let (client, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(async move { server.run_session(server_read, server_write).await });

        let mut request = TransferRequest::new("key", "note.txt");
        request.block_size = 4;
        write_frame(&mut client_write, &Frame::Handshake(request.encode().unwrap()))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client_read).await.unwrap().unwrap(),
            Frame::Accept {
                resume_offset: 0,
                block_size: 4
            }
        );
        assert_eq!(
            read_frame(&mut client_read).await.unwrap().unwrap(),
            Frame::Credit(2)
        );

        for (sequence, data) in [(1u64, &b"hell"[..]), (2, &b"o"[..])] {
            write_frame(
                &mut client_write,
                &Frame::Chunk {
                    sequence,
                    data: data.to_vec(),
                },
            )
            .await
            .unwrap();
        }
        write_frame(&mut client_write, &Frame::End).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = read_frame(&mut client_read).await.unwrap().unwrap();
            let done = matches!(frame, Frame::Done(_));
            frames.push(frame);
            if done {
                break;
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame::Credit(1),
                Frame::Credit(1),
                Frame::Done("note.txt".into())
            ]
        );

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes, 5);
        assert_eq!(std::fs::read(dir.path().join("note.txt")).unwrap(), b"hello");
        assert_eq!(
            catalog.status("note.txt"),
            Some(rft_protocol::LifecycleStatus::Uploaded)
        );
    }

    #[tokio::test]
    async fn peer_gone_before_accept_pauses_session() {
        let dir = tempfile::tempdir().unwrap();
        let (server, catalog) = server(dir.path());

        let mut handshake = Vec::new();
        let request = TransferRequest::new("key", "late.bin");
        write_frame(&mut handshake, &Frame::Handshake(request.encode().unwrap()))
            .await
            .unwrap();
        let (peer, server_end) = tokio::io::duplex(64);
        drop(peer);

        let err = server
            .run_session(&handshake[..], server_end)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DataChannelError::Transfer(TransferError::Channel(_))
        ));
        assert_eq!(
            catalog.history("late.bin"),
            vec![
                rft_protocol::LifecycleStatus::Initiated,
                rft_protocol::LifecycleStatus::Paused
            ]
        );
        assert!(dir.path().join("late.bin.part").exists());
        assert!(server.receiver.registry().is_empty());
    }

    #[tokio::test]
    async fn oversized_chunk_frame_pauses() {
        let dir = tempfile::tempdir().unwrap();
        let (server, catalog) = server(dir.path());
        let (client, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(async move { server.run_session(server_read, server_write).await });

        let mut request = TransferRequest::new("key", "big.bin");
        request.block_size = 4;
        write_frame(&mut client_write, &Frame::Handshake(request.encode().unwrap()))
            .await
            .unwrap();
        read_frame(&mut client_read).await.unwrap().unwrap();
        read_frame(&mut client_read).await.unwrap().unwrap();

        // Header only: a 1 MiB chunk for a 4-byte block.
        let mut header = vec![rft_protocol::wire::TAG_CHUNK];
        header.extend_from_slice(&(1024u32 * 1024).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client_write, &header)
            .await
            .unwrap();

        let reply = read_frame(&mut client_read).await.unwrap().unwrap();
        assert!(matches!(
            reply,
            Frame::Error {
                kind: ErrorKind::Channel,
                ..
            }
        ));
        assert!(task.await.unwrap().is_err());
        assert_eq!(
            catalog.status("big.bin"),
            Some(rft_protocol::LifecycleStatus::Paused)
        );
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let cancel = CancellationToken::new();
        let server = UploadServer::new(Receiver::new(catalog, dir.path()), 2, cancel.clone());
        let listener = UploadServer::bind("127.0.0.1:0").await.unwrap();

        cancel.cancel();
        server.serve(listener).await.unwrap();
    }
}
