//! Length-prefixed message framing over a non-blocking byte channel.
//!
//! [`FramedChannel`] never waits for readiness. Each call moves as many bytes as the
//! underlying [`RawChannel`] accepts right now and keeps a cursor per direction, so a
//! message interrupted by `WouldBlock` resumes exactly where it stopped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, TransportError};
use crate::protocol::{decode_length, encode_length, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use crate::readiness::{Interest, Selectable};

/// A byte stream that reports `WouldBlock` instead of waiting.
///
/// `read` returns `Ok(0)` at end of stream. Implementations may buffer internally
/// (TLS does); `has_buffered_input` and `has_pending_output` expose that so the
/// multiplexer can re-dispatch without waiting on the socket.
#[async_trait]
pub trait RawChannel: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes internally buffered output. Returns `true` once nothing is pending.
    async fn flush(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Advances transport-level work (handshakes, buffered output).
    /// Returns `true` when application data can flow.
    async fn drive(&mut self) -> io::Result<bool> {
        self.flush().await
    }

    async fn close(&mut self) -> io::Result<()>;

    fn has_buffered_input(&self) -> bool {
        false
    }

    fn has_pending_output(&self) -> bool {
        false
    }

    /// Extra interest the transport itself needs to make progress.
    fn transport_interest(&self) -> Interest {
        Interest::NONE
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Handle the readiness source waits on.
    fn selectable(&self) -> Arc<dyn Selectable>;
}

/// Plain TCP, no transformation.
pub struct PlainChannel {
    stream: Arc<TcpStream>,
    peer: Option<SocketAddr>,
}

impl PlainChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Arc::new(stream),
            peer,
        }
    }
}

#[async_trait]
impl RawChannel for PlainChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    async fn close(&mut self) -> io::Result<()> {
        match Arc::get_mut(&mut self.stream) {
            Some(stream) => stream.shutdown().await,
            // readiness watcher still holds a handle; the socket closes when it lets go
            None => Ok(()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn selectable(&self) -> Arc<dyn Selectable> {
        self.stream.clone()
    }
}

/// Result of a [`FramedChannel::read`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    /// A whole message was assembled.
    Complete(Vec<u8>),
    /// More bytes are needed; the partial message is kept.
    WouldBlock,
    /// The peer closed the stream. Any partial message was discarded.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes pulled from the raw channel by this call.
    pub consumed: usize,
    pub status: ReadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The message and any transport-buffered bytes are out.
    Sent,
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub consumed: usize,
    pub status: WriteStatus,
}

#[derive(Default)]
struct ReadCursor {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    prefix_filled: usize,
    payload: Option<BytesMut>,
    payload_len: usize,
}

impl ReadCursor {
    fn in_progress(&self) -> bool {
        self.prefix_filled > 0
    }

    fn reset(&mut self) {
        *self = ReadCursor::default();
    }
}

struct WriteCursor {
    frame: Vec<u8>,
    written: usize,
}

/// Message framing with resumable partial reads and writes.
pub struct FramedChannel<C: ?Sized = dyn RawChannel> {
    read_cursor: ReadCursor,
    write_cursor: Option<WriteCursor>,
    max_payload: usize,
    raw: Box<C>,
}

impl<C: RawChannel + ?Sized> FramedChannel<C> {
    pub fn new(raw: Box<C>) -> Self {
        Self::with_max_payload(raw, MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(raw: Box<C>, max_payload: usize) -> Self {
        Self {
            read_cursor: ReadCursor::default(),
            write_cursor: None,
            max_payload,
            raw,
        }
    }

    /// Reads until one message completes, the channel would block, or the peer closes.
    ///
    /// Only the bytes of the current message are requested from the raw channel, so
    /// the next message stays in the transport.
    pub async fn read(&mut self) -> Result<ReadOutcome> {
        let mut consumed = 0;
        loop {
            let cursor = &mut self.read_cursor;
            let result = if cursor.prefix_filled < LENGTH_PREFIX_SIZE {
                let filled = cursor.prefix_filled;
                self.raw.read(&mut cursor.prefix[filled..]).await
            } else {
                let payload_len = cursor.payload_len;
                let payload = cursor
                    .payload
                    .get_or_insert_with(|| BytesMut::zeroed(payload_len));
                let filled = cursor.prefix_filled - LENGTH_PREFIX_SIZE;
                if filled == payload_len {
                    let message = payload.split().freeze().to_vec();
                    cursor.reset();
                    return Ok(ReadOutcome {
                        consumed,
                        status: ReadStatus::Complete(message),
                    });
                }
                self.raw.read(&mut payload[filled..]).await
            };

            match result {
                Ok(0) => {
                    self.read_cursor.reset();
                    return Ok(ReadOutcome {
                        consumed,
                        status: ReadStatus::Closed,
                    });
                }
                Ok(n) => {
                    consumed += n;
                    let cursor = &mut self.read_cursor;
                    cursor.prefix_filled += n;
                    if cursor.prefix_filled == LENGTH_PREFIX_SIZE && cursor.payload.is_none() {
                        cursor.payload_len = decode_length(cursor.prefix, self.max_payload)?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome {
                        consumed,
                        status: ReadStatus::WouldBlock,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.read_cursor.reset();
                    return Err(e.into());
                }
            }
        }
    }

    /// Stages a message for sending. Fails if the previous one is not fully out yet.
    pub fn start_write(&mut self, payload: &[u8]) -> Result<()> {
        if self.write_cursor.is_some() {
            return Err(TransportError::WriteInProgress);
        }
        let prefix = encode_length(payload.len())?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(payload);
        self.write_cursor = Some(WriteCursor { frame, written: 0 });
        Ok(())
    }

    /// Continues sending the staged message.
    ///
    /// `Sent` is only reported once the raw channel holds no pending output either.
    pub async fn write(&mut self) -> Result<WriteOutcome> {
        let mut consumed = 0;
        if let Some(cursor) = self.write_cursor.as_mut() {
            while cursor.written < cursor.frame.len() {
                match self.raw.write(&cursor.frame[cursor.written..]).await {
                    Ok(0) => return Err(TransportError::ConnectionReset),
                    Ok(n) => {
                        cursor.written += n;
                        consumed += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(WriteOutcome {
                            consumed,
                            status: WriteStatus::WouldBlock,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !self.raw.flush().await? {
            return Ok(WriteOutcome {
                consumed,
                status: WriteStatus::WouldBlock,
            });
        }
        self.write_cursor = None;
        Ok(WriteOutcome {
            consumed,
            status: WriteStatus::Sent,
        })
    }

    /// Lets the transport make progress on its own work.
    pub async fn drive(&mut self) -> Result<bool> {
        Ok(self.raw.drive().await?)
    }

    pub fn has_pending_write(&self) -> bool {
        self.write_cursor.is_some()
    }

    pub fn is_reading_message(&self) -> bool {
        self.read_cursor.in_progress()
    }

    pub fn has_buffered_input(&self) -> bool {
        self.raw.has_buffered_input()
    }

    pub fn transport_interest(&self) -> Interest {
        let mut interest = self.raw.transport_interest();
        if self.raw.has_pending_output() {
            interest = interest | Interest::WRITABLE;
        }
        interest
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.raw.peer_addr()
    }

    pub fn selectable(&self) -> Arc<dyn Selectable> {
        self.raw.selectable()
    }

    /// Drops partial state in both directions and closes the raw channel.
    pub async fn close(&mut self) -> Result<()> {
        self.read_cursor.reset();
        self.write_cursor = None;
        self.raw.close().await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedChannel;
    use super::*;
    use crate::protocol::encode_frame;

    fn framed(raw: ScriptedChannel) -> FramedChannel<ScriptedChannel> {
        FramedChannel::new(Box::new(raw))
    }

    #[tokio::test]
    async fn test_read_whole_message() {
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&encode_frame(b"payload").unwrap());
        let mut channel = framed(raw);

        let outcome = channel.read().await.unwrap();
        assert_eq!(outcome.status, ReadStatus::Complete(b"payload".to_vec()));
        assert_eq!(outcome.consumed, 11);
    }

    #[tokio::test]
    async fn test_read_resumes_across_would_block() {
        let frame = encode_frame(b"abcdefgh").unwrap();
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&frame[..2]);
        raw.push_block();
        raw.push_bytes(&frame[2..7]);
        raw.push_block();
        raw.push_bytes(&frame[7..]);
        let mut channel = framed(raw);

        let first = channel.read().await.unwrap();
        assert_eq!(first.status, ReadStatus::WouldBlock);
        assert_eq!(first.consumed, 2);
        assert!(channel.is_reading_message());

        let second = channel.read().await.unwrap();
        assert_eq!(second.status, ReadStatus::WouldBlock);
        assert_eq!(second.consumed, 5);

        let third = channel.read().await.unwrap();
        assert_eq!(third.status, ReadStatus::Complete(b"abcdefgh".to_vec()));
        assert!(!channel.is_reading_message());
    }

    #[tokio::test]
    async fn test_read_leaves_next_message_untouched() {
        let mut bytes = encode_frame(b"one").unwrap();
        bytes.extend(encode_frame(b"two").unwrap());
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&bytes);
        let mut channel = framed(raw);

        assert_eq!(
            channel.read().await.unwrap().status,
            ReadStatus::Complete(b"one".to_vec())
        );
        assert_eq!(
            channel.read().await.unwrap().status,
            ReadStatus::Complete(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_peer_close_mid_frame() {
        let frame = encode_frame(b"truncated").unwrap();
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&frame[..6]);
        raw.eof = true;
        let mut channel = framed(raw);

        let outcome = channel.read().await.unwrap();
        assert_eq!(outcome.status, ReadStatus::Closed);
        assert!(!channel.is_reading_message());
    }

    #[tokio::test]
    async fn test_zero_length_message() {
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&[0, 0, 0, 0]);
        let mut channel = framed(raw);
        assert_eq!(
            channel.read().await.unwrap().status,
            ReadStatus::Complete(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&1_000u32.to_be_bytes());
        let mut channel = FramedChannel::with_max_payload(Box::new(raw), 16);
        let err = channel.read().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame { .. }));
    }

    #[tokio::test]
    async fn test_write_resumes_after_would_block() {
        let mut raw = ScriptedChannel::new();
        raw.write_chunk = 3;
        raw.stutter = true;
        let sink = raw.outbound.clone();
        let mut channel = framed(raw);

        channel.start_write(b"0123456789").unwrap();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let outcome = channel.write().await.unwrap();
            if outcome.status == WriteStatus::Sent {
                break;
            }
            assert!(rounds < 20);
        }
        assert!(rounds > 1);
        assert!(!channel.has_pending_write());
        assert_eq!(*sink.lock().unwrap(), encode_frame(b"0123456789").unwrap());
    }

    #[tokio::test]
    async fn test_second_write_while_pending_rejected() {
        let mut raw = ScriptedChannel::new();
        raw.stutter = true;
        let mut channel = framed(raw);
        channel.start_write(b"first").unwrap();
        assert_eq!(channel.write().await.unwrap().status, WriteStatus::WouldBlock);
        assert!(matches!(
            channel.start_write(b"second"),
            Err(TransportError::WriteInProgress)
        ));
    }

    #[tokio::test]
    async fn test_close_discards_partial_state() {
        let frame = encode_frame(b"partial").unwrap();
        let mut raw = ScriptedChannel::new();
        raw.push_bytes(&frame[..5]);
        let mut channel = framed(raw);
        channel.read().await.unwrap();
        channel.start_write(b"unsent").unwrap();

        channel.close().await.unwrap();
        assert!(!channel.is_reading_message());
        assert!(!channel.has_pending_write());
    }
}
