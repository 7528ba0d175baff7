//! Dedicated writer task for one session.
//!
//! Every send on a session goes through one writer task fed by an mpsc
//! channel, so the four segments of a message are never interleaved with
//! another message's segments. Each queued message carries a oneshot
//! acknowledgement that resolves once all of its segments (and the flush)
//! have been written.
//!
//! # Architecture
//!
//! ```text
//! send() ─┐
//! send() ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► TCP write half
//! send() ─┘         (ack via oneshot) ◄───────────┘
//! ```

use std::io;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{PeerwireError, Result};
use crate::pipeline::MessageWriter;
use crate::protocol::{FrameSegments, Message};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A message ready to be written, plus the sender's acknowledgement.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Pre-encoded, range-checked segments.
    pub segments: FrameSegments,
    ack: oneshot::Sender<Result<()>>,
}

impl OutboundMessage {
    /// Encode `message` and pair it with a fresh acknowledgement channel.
    pub fn new(message: &Message) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let segments = FrameSegments::from_message(message)?;
        let (ack, ack_rx) = oneshot::channel();
        Ok((Self { segments, ack }, ack_rx))
    }

    /// Total size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.segments.size()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Messages that may wait in the queue before `send` starts waiting.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending messages to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
}

impl WriterHandle {
    /// Queue a message and wait until it has been written.
    ///
    /// # Errors
    ///
    /// - `CorruptMessage` if a length is out of range (nothing is queued)
    /// - `NoConnection` if the writer task is gone
    /// - `Io` if writing this message failed
    pub async fn send(&self, message: &Message) -> Result<()> {
        let (outbound, ack) = OutboundMessage::new(message)?;
        self.tx
            .send(outbound)
            .await
            .map_err(|_| PeerwireError::NoConnection)?;
        ack.await.map_err(|_| PeerwireError::NoConnection)?
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending messages.
///
/// The task runs in the caller's current span. It finishes with `Ok(())`
/// when every handle is dropped, or with the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, MessageWriter::new(writer)).in_current_span());
    (WriterHandle { tx }, task)
}

/// Main writer loop - one message at a time, acknowledged after the flush.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: MessageWriter<W>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match writer.write_segments(&outbound.segments).await {
            Ok(()) => {
                let _ = outbound.ack.send(Ok(()));
            }
            Err(e) => {
                tracing::debug!(error = %e, "write failed, stopping writer");
                let copy = io::Error::new(e.kind(), e.to_string());
                let _ = outbound.ack.send(Err(PeerwireError::Io(copy)));
                // Queued messages are dropped with the receiver; their
                // senders see NoConnection.
                return Err(PeerwireError::Io(e));
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MessageReader;
    use crate::protocol::{encode_message, MAX_PAYLOAD_SIZE};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::duplex;

    /// Accepts `budget` bytes, then fails every write.
    struct FailingWriter {
        budget: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_writer_config_default() {
        assert_eq!(WriterConfig::default().channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_outbound_message_size() {
        let msg = Message::new(&b"hello"[..], &b"m"[..]);
        let (outbound, _ack) = OutboundMessage::new(&msg).unwrap();
        assert_eq!(outbound.size(), msg.encoded_len());
    }

    #[tokio::test]
    async fn test_send_resolves_after_write() {
        let (client, server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let msg = Message::new(&b"hello"[..], &b""[..]);
        handle.send(&msg).await.unwrap();

        let mut reader = MessageReader::new(server);
        assert_eq!(reader.receive_message().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_not_interleaved() {
        let (client, server) = duplex(64);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let mut sends = Vec::new();
        for i in 0..8u8 {
            let handle = handle.clone();
            sends.push(tokio::spawn(async move {
                let msg = Message::new(vec![i; 300], vec![i]);
                handle.send(&msg).await
            }));
        }

        let mut reader = MessageReader::new(server);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let msg = reader.receive_message().await.unwrap();
            let tag = msg.metadata()[0];
            assert!(msg.payload().iter().all(|b| *b == tag));
            seen.push(tag);
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_oversize_rejected_before_queueing() {
        let (client, _server) = duplex(64);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let result = handle
            .send(&Message::from_payload(vec![0u8; MAX_PAYLOAD_SIZE + 1]))
            .await;
        assert!(matches!(result, Err(PeerwireError::CorruptMessage(_))));
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_reported_to_sender_and_task() {
        let msg = Message::new(&b"payload"[..], &b"meta"[..]);
        // Enough for the metadata length and metadata, then fail
        let (handle, task) = spawn_writer_task(FailingWriter { budget: 6 }, WriterConfig::default());

        let result = handle.send(&msg).await;
        assert!(matches!(result, Err(PeerwireError::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe));

        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send(&msg).await,
            Err(PeerwireError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn test_empty_payload_written_without_payload_segment() {
        let (client, server) = duplex(64);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let msg = Message::new(&b""[..], &b"only-meta"[..]);
        handle.send(&msg).await.unwrap();
        drop(handle);

        let mut server = server;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, encode_message(&msg).unwrap());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
