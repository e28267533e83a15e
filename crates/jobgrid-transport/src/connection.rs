//! Blocking-style framed connections for the dialing side (nodes and clients).
//!
//! The driver side multiplexes non-blocking channels; peers that own a single
//! connection simply await whole frames on a tokio stream, optionally wrapped in TLS.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::message::{deserialize_message, serialize_message, WireMessage};
use crate::protocol::{decode_length, encode_frame, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use crate::tls::TlsConnector;

/// A dialed stream, plain or TLS.
pub enum ConnectionStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read side of a framed connection.
pub struct FrameReader {
    inner: ReadHalf<ConnectionStream>,
    max_payload: usize,
}

impl FrameReader {
    /// Reads one message. `Ok(None)` means the peer closed between frames.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = match self.inner.read(&mut prefix[filled..]).await {
                Ok(n) => n,
                // TLS peers that drop the socket without close_notify
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && filled == 0 => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed);
            }
            filled += n;
        }

        let len = decode_length(prefix, self.max_payload)?;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.inner.read_exact(&mut payload).await.map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    TransportError::ConnectionClosed
                } else {
                    TransportError::IoError(e)
                }
            })?;
        }
        deserialize_message(&payload).map(Some)
    }
}

/// Write side of a framed connection.
pub struct FrameWriter {
    inner: WriteHalf<ConnectionStream>,
}

impl FrameWriter {
    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        let frame = encode_frame(&serialize_message(message)?)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends close_notify (TLS) and shuts the write direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub struct FramedConnection {
    reader: FrameReader,
    writer: FrameWriter,
    peer: SocketAddr,
}

impl FramedConnection {
    /// Dials `addr`, performing the TLS handshake when a connector and server name
    /// are given.
    pub async fn connect(addr: SocketAddr, tls: Option<(&TlsConnector, &str)>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        stream.set_nodelay(true)?;

        let stream = match tls {
            Some((connector, domain)) => {
                let tls = connector.connect(domain, stream).await?;
                ConnectionStream::Tls(Box::new(tls))
            }
            None => ConnectionStream::Plain(stream),
        };
        debug!(%addr, tls = matches!(stream, ConnectionStream::Tls(_)), "connected");
        Ok(Self::from_stream(stream, addr))
    }

    pub fn from_stream(stream: ConnectionStream, peer: SocketAddr) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                inner: read,
                max_payload: MAX_PAYLOAD_SIZE,
            },
            writer: FrameWriter { inner: write },
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        self.reader.recv().await
    }

    /// Like [`FramedConnection::recv`] but treats a clean close as an error.
    pub async fn expect(&mut self) -> Result<WireMessage> {
        self.recv().await?.ok_or(TransportError::ConnectionClosed)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_roundtrip_and_clean_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = FramedConnection::from_stream(ConnectionStream::Plain(stream), peer);
            let message = conn.expect().await.unwrap();
            conn.send(&message).await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let mut conn = FramedConnection::connect(addr, None).await.unwrap();
        let message = WireMessage::JobCancelled {
            job_id: Uuid::new_v4(),
        };
        conn.send(&message).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(message));
        assert_eq!(conn.recv().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0, 0]).await.unwrap();
        });

        let mut conn = FramedConnection::connect(addr, None).await.unwrap();
        assert!(matches!(conn.recv().await, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let mut conn = FramedConnection::connect(addr, None).await.unwrap();
        assert!(matches!(conn.recv().await, Err(TransportError::InvalidFrame { .. })));
    }

    #[tokio::test]
    async fn test_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = FramedConnection::connect(addr, None).await.err().unwrap();
        assert!(err.is_transient());
    }
}
