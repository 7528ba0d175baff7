//! Message pipeline - drives the frame codec against a live byte stream.
//!
//! [`MessageReader`] pulls exactly the bytes each decode step asks for and
//! yields whole messages. [`MessageWriter`] writes the four wire segments of
//! one message in order. Neither type knows about sessions; the session
//! driver owns one reader and the writer task owns one writer.
//!
//! # Example
//!
//! ```
//! use peerwire::pipeline::{MessageReader, MessageWriter};
//! use peerwire::protocol::Message;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let (a, b) = tokio::io::duplex(1024);
//! let mut writer = MessageWriter::new(a);
//! let mut reader = MessageReader::new(b);
//!
//! writer.send_message(&Message::new(&b"ping"[..], &b""[..])).await.unwrap();
//! let received = reader.receive_message().await.unwrap();
//! assert_eq!(received.payload(), b"ping");
//! # });
//! ```

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeerwireError, Result};
use crate::protocol::{FrameDecoder, FrameSegments, Message, MAX_PAYLOAD_SIZE};

/// Reads whole messages from an async byte stream.
pub struct MessageReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_max_payload(reader, MAX_PAYLOAD_SIZE)
    }

    /// Create a reader with a tighter payload ceiling.
    pub fn with_max_payload(reader: R, max_payload_size: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_max_payload(max_payload_size),
        }
    }

    /// Receive the next message.
    ///
    /// Each decode step awaits an exact-length read. Nothing is returned
    /// until the whole frame has arrived.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the stream ends before the first byte of a frame
    /// - `Io(UnexpectedEof)` if the stream ends inside a frame
    /// - `CorruptMessage` if the payload length is out of range; no payload
    ///   bytes are read for that frame
    /// - `Io` for any other transport error
    ///
    /// # Cancel safety
    ///
    /// Not cancel safe. Dropping the future mid-frame loses the bytes read so
    /// far; keep the future alive across `select!` iterations instead.
    pub async fn receive_message(&mut self) -> Result<Message> {
        self.decoder.reset();
        loop {
            let frame_start = self.decoder.is_at_frame_boundary();
            let step = self.decoder.step();
            let mut chunk = BytesMut::zeroed(self.decoder.bytes_needed());
            self.fill(&mut chunk, frame_start, step.name()).await?;

            if let Some(message) = self.decoder.advance(chunk.freeze())? {
                return Ok(message);
            }
        }
    }

    async fn fill(&mut self, buf: &mut [u8], frame_start: bool, step: &str) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                if frame_start && filled == 0 {
                    return Err(PeerwireError::ConnectionClosed);
                }
                return Err(PeerwireError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended during {} read ({} of {} bytes)", step, filled, buf.len()),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes whole messages to an async byte stream.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode and write one message, then flush.
    ///
    /// # Errors
    ///
    /// `CorruptMessage` if a length is out of range (nothing is written), or
    /// `Io` from the first segment write that fails.
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let segments = FrameSegments::from_message(message)?;
        self.write_segments(&segments).await?;
        Ok(())
    }

    /// Write pre-encoded segments in wire order.
    ///
    /// A failing segment short-circuits the rest. An empty payload stops
    /// right after the payload length field.
    pub async fn write_segments(&mut self, segments: &FrameSegments) -> io::Result<()> {
        self.writer.write_all(&segments.metadata_length).await?;
        if !segments.metadata.is_empty() {
            self.writer.write_all(&segments.metadata).await?;
        }
        self.writer.write_all(&segments.payload_length).await?;
        if !segments.payload.is_empty() {
            self.writer.write_all(&segments.payload).await?;
        }
        self.writer.flush().await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_message, MAX_PAYLOAD_SIZE};
    use std::io::Cursor;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_receive_sequence() {
        let mut wire = encode_message(&Message::new(&b"one"[..], &b"a"[..])).unwrap();
        wire.extend(encode_message(&Message::new(&b""[..], &b"b"[..])).unwrap());
        wire.extend(encode_message(&Message::new(&b"three"[..], &b""[..])).unwrap());

        let mut reader = MessageReader::new(Cursor::new(wire));

        assert_eq!(reader.receive_message().await.unwrap().payload(), b"one");
        let second = reader.receive_message().await.unwrap();
        assert!(second.payload().is_empty());
        assert_eq!(second.metadata(), b"b");
        assert_eq!(reader.receive_message().await.unwrap().payload(), b"three");
        assert!(matches!(
            reader.receive_message().await,
            Err(PeerwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let wire = encode_message(&Message::new(&b"truncated"[..], &b""[..])).unwrap();
        let mut reader = MessageReader::new(Cursor::new(wire[..wire.len() - 2].to_vec()));

        match reader.receive_message().await {
            Err(PeerwireError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversize_length_reads_no_payload() {
        let mut wire = vec![0u8, 0];
        wire.extend_from_slice(&((MAX_PAYLOAD_SIZE + 1) as i32).to_le_bytes());
        wire.extend_from_slice(b"leftover");

        let mut reader = MessageReader::new(Cursor::new(wire));
        let result = reader.receive_message().await;

        assert!(matches!(result, Err(PeerwireError::CorruptMessage(_))));
        assert_eq!(reader.get_ref().position(), 6);
    }

    #[tokio::test]
    async fn test_writer_output_matches_encoder() {
        let msg = Message::new(&b"hello world"[..], vec![0x00u8]);
        let mut writer = MessageWriter::new(Vec::new());

        writer.send_message(&msg).await.unwrap();

        assert_eq!(writer.into_inner(), encode_message(&msg).unwrap());
    }

    #[tokio::test]
    async fn test_writer_rejects_oversize_without_writing() {
        let msg = Message::from_payload(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let mut writer = MessageWriter::new(Vec::new());

        assert!(matches!(
            writer.send_message(&msg).await,
            Err(PeerwireError::CorruptMessage(_))
        ));
        assert!(writer.get_ref().is_empty());
    }

    #[tokio::test]
    async fn test_duplex_with_small_buffer() {
        // 7-byte pipe forces every segment through several partial reads
        let (a, b) = duplex(7);
        let payload = vec![0xABu8; 1000];
        let sent = Message::new(payload.clone(), &b"meta"[..]);

        let send = {
            let sent = sent.clone();
            tokio::spawn(async move {
                let mut writer = MessageWriter::new(a);
                writer.send_message(&sent).await
            })
        };

        let mut reader = MessageReader::new(b);
        let received = reader.receive_message().await.unwrap();
        send.await.unwrap().unwrap();

        assert_eq!(received, sent);
    }
}
