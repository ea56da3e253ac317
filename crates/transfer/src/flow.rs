//! Credit-based flow control between producer and consumer.
//!
//! The consumer side grants credits; the producer side spends one credit per
//! chunk and suspends while it has none. The initial grant is the window
//! size, and each chunk the consumer finishes with earns one more credit, so
//! at most `window` chunks are ever in flight.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{Semaphore, mpsc};

use crate::TransferError;
use crate::chunked::ChunkProducer;
use crate::types::Chunk;

/// Credits the producer may spend on chunks.
#[derive(Debug, Clone)]
pub struct CreditWindow {
    permits: Arc<Semaphore>,
}

impl CreditWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(initial as usize)),
        }
    }

    /// Spends one credit, waiting until one is granted.
    pub async fn acquire(&self) -> Result<(), TransferError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransferError::Channel("flow control window closed".into()))?;
        permit.forget();
        Ok(())
    }

    /// Grants `n` more credits.
    pub fn grant(&self, n: u32) {
        if n > 0 {
            self.permits.add_permits(n as usize);
        }
    }

    /// Wakes every waiter with an error; no further credit can be spent.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

enum PipeItem {
    Chunk(Chunk),
    End,
    Error(TransferError),
}

/// Creates an in-process flow-controlled chunk channel with `window` credits.
pub fn pipe(window: u32) -> (ChunkSender, ChunkStream) {
    let window = window.max(1);
    let (tx, rx) = mpsc::channel(window as usize + 1);
    let credits = CreditWindow::new(window);
    (
        ChunkSender {
            tx,
            credits: credits.clone(),
        },
        ChunkStream {
            rx,
            credits,
            owed: false,
            done: false,
        },
    )
}

/// Producer half of [`pipe`].
pub struct ChunkSender {
    tx: mpsc::Sender<PipeItem>,
    credits: CreditWindow,
}

impl ChunkSender {
    /// Sends one chunk, suspending while the window is exhausted.
    pub async fn send(&self, chunk: Chunk) -> Result<(), TransferError> {
        self.credits.acquire().await?;
        self.tx
            .send(PipeItem::Chunk(chunk))
            .await
            .map_err(|_| TransferError::Channel("consumer went away".into()))
    }

    /// Signals normal end of the sequence.
    pub async fn finish(self) -> Result<(), TransferError> {
        self.tx
            .send(PipeItem::End)
            .await
            .map_err(|_| TransferError::Channel("consumer went away".into()))
    }

    /// Terminates the sequence with `error`.
    pub async fn fail(self, error: TransferError) {
        let _ = self.tx.send(PipeItem::Error(error)).await;
    }

    /// Drains `producer` into the channel and signals end. Returns the
    /// number of chunks sent.
    pub async fn pump(self, producer: &mut ChunkProducer) -> Result<u64, TransferError> {
        let mut sent = 0;
        loop {
            match producer.next_chunk().await {
                Ok(Some(chunk)) => {
                    self.send(chunk).await?;
                    sent += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail(TransferError::Channel(format!("source read failed: {e}")))
                        .await;
                    return Err(e);
                }
            }
        }
        self.finish().await?;
        Ok(sent)
    }
}

/// Consumer half of [`pipe`].
///
/// Yields chunks in send order. Polling for the next item returns the credit
/// of the previously yielded chunk. Ends with `None` after an explicit
/// finish; a sender dropped without finishing yields a channel error.
pub struct ChunkStream {
    rx: mpsc::Receiver<PipeItem>,
    credits: CreditWindow,
    owed: bool,
    done: bool,
}

impl Stream for ChunkStream {
    type Item = Result<Chunk, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.owed {
            this.credits.grant(1);
            this.owed = false;
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(PipeItem::Chunk(chunk))) => {
                this.owed = true;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(PipeItem::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(PipeItem::Error(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(TransferError::Channel(
                    "producer dropped before end of file".into(),
                ))))
            }
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.credits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn window_blocks_until_granted() {
        let window = CreditWindow::new(1);
        window.acquire().await.unwrap();
        assert_eq!(window.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), window.acquire()).await;
        assert!(blocked.is_err());

        window.grant(1);
        tokio::time::timeout(Duration::from_millis(500), window.acquire())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_window_fails_waiters() {
        let window = CreditWindow::new(0);
        let waiter = {
            let w = window.clone();
            tokio::spawn(async move { w.acquire().await })
        };
        tokio::task::yield_now().await;
        window.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TransferError::Channel(_))
        ));
        assert!(window.is_closed());
    }

    #[tokio::test]
    async fn sender_suspends_beyond_window() {
        let (tx, mut rx) = pipe(2);
        let producer = tokio::spawn(async move {
            for seq in 1..=5u64 {
                tx.send(Chunk::new(seq, vec![seq as u8])).await?;
            }
            tx.finish().await
        });

        // Nothing consumed yet: only the window's worth can be in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let mut seqs = Vec::new();
        while let Some(item) = rx.next().await {
            seqs.push(item.unwrap().sequence);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_is_channel_error() {
        let (tx, mut rx) = pipe(2);
        tx.send(Chunk::new(1, vec![1])).await.unwrap();
        drop(tx);

        assert_eq!(rx.next().await.unwrap().unwrap().sequence, 1);
        assert!(matches!(
            rx.next().await,
            Some(Err(TransferError::Channel(_)))
        ));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_stream_unblocks_sender() {
        let (tx, rx) = pipe(1);
        tx.send(Chunk::new(1, vec![1])).await.unwrap();
        drop(rx);
        assert!(tx.send(Chunk::new(2, vec![2])).await.is_err());
    }

    #[tokio::test]
    async fn explicit_failure_reaches_consumer() {
        let (tx, mut rx) = pipe(2);
        tx.fail(TransferError::Cancelled).await;
        assert!(matches!(rx.next().await, Some(Err(TransferError::Cancelled))));
    }
}
