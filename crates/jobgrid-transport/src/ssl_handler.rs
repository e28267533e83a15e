//! TLS over the non-blocking [`RawChannel`] contract.
//!
//! [`SslHandler`] owns one rustls session. The handshake advances as a side effect of
//! `read`, `write` and `drive`; packet processing during the handshake (the CPU-heavy
//! part: key exchange, certificate verification) runs on a [`DelegatedTaskPool`] so the
//! event loop never does crypto inline. After the handshake, records are processed inline.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::framed::RawChannel;
use crate::readiness::{Interest, Selectable};

const CLOSE_FLUSH_ATTEMPTS: usize = 4;
const CLOSE_FLUSH_WAIT: Duration = Duration::from_millis(50);

type DelegatedJob = Box<dyn FnOnce() + Send + 'static>;

struct PoolThread {
    sender: crossbeam_channel::Sender<DelegatedJob>,
    handle: std::thread::JoinHandle<()>,
}

/// Single dedicated thread for handshake work, started on first use.
pub struct DelegatedTaskPool {
    name: String,
    thread: Option<PoolThread>,
    running: Arc<AtomicBool>,
}

impl DelegatedTaskPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thread: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn(&self) -> io::Result<PoolThread> {
        let (sender, receiver) = crossbeam_channel::unbounded::<DelegatedJob>();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                running.store(false, Ordering::SeqCst);
            })
            .inspect_err(|_| self.running.store(false, Ordering::SeqCst))?;
        Ok(PoolThread { sender, handle })
    }

    /// Runs `f` on the pool thread and waits for its result without blocking the caller's
    /// executor thread.
    pub async fn run<F, R>(&mut self, f: F) -> io::Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.thread.is_none() {
            self.thread = Some(self.spawn()?);
        }
        let sender = self
            .thread
            .as_ref()
            .map(|t| &t.sender)
            .ok_or_else(|| io::Error::other("delegated task pool not started"))?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| io::Error::other("delegated task pool stopped"))?;
        rx.await
            .map_err(|_| io::Error::other("delegated task dropped"))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flag that stays observable after the pool itself is dropped.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Stops the thread and waits for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(PoolThread { sender, handle }) = self.thread.take() {
            drop(sender);
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for DelegatedTaskPool {
    fn drop(&mut self) {
        // dropping the sender ends the thread once queued work is done
        self.thread.take();
    }
}

/// Blocking-style `Read`/`Write` over a tokio socket's non-blocking calls.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Inbound {
    Processed,
    WouldBlock,
    Eof,
}

fn tls_io_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// One TLS session over a TCP socket.
pub struct SslHandler {
    stream: Arc<TcpStream>,
    conn: Option<rustls::Connection>,
    pool: DelegatedTaskPool,
    peer: Option<SocketAddr>,
    plaintext_pending: usize,
    closed: bool,
}

impl SslHandler {
    /// Server side of a freshly accepted connection.
    pub fn server(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(|e| TransportError::TlsError {
            reason: format!("failed to create server session: {}", e),
        })?;
        Ok(Self::with_connection(stream, conn.into()))
    }

    /// Client side of an established TCP connection.
    pub fn client(
        stream: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let conn =
            rustls::ClientConnection::new(config, server_name).map_err(|e| TransportError::TlsError {
                reason: format!("failed to create client session: {}", e),
            })?;
        Ok(Self::with_connection(stream, conn.into()))
    }

    fn with_connection(stream: TcpStream, conn: rustls::Connection) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Arc::new(stream),
            conn: Some(conn),
            pool: DelegatedTaskPool::new("tls-delegated-tasks"),
            peer,
            plaintext_pending: 0,
            closed: false,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_handshaking())
    }

    pub fn delegated_pool_running(&self) -> bool {
        self.pool.is_running()
    }

    pub fn delegated_pool_flag(&self) -> Arc<AtomicBool> {
        self.pool.running_flag()
    }

    /// True once `close` released the session buffers.
    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    fn conn_mut(&mut self) -> io::Result<&mut rustls::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "TLS session released"))
    }

    /// Writes queued TLS records. `Ok(true)` once nothing is left.
    fn flush_tls(&mut self) -> io::Result<bool> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(true);
        };
        while conn.wants_write() {
            match conn.write_tls(&mut SocketIo(&self.stream)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn process_packets(&mut self) -> io::Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "TLS session released"))?;

        let (conn, result) = if conn.is_handshaking() {
            self.pool
                .run(move || {
                    let result = conn.process_new_packets().map(|state| state.plaintext_bytes_to_read());
                    (conn, result)
                })
                .await?
        } else {
            let result = conn
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read());
            (conn, result)
        };
        self.conn = Some(conn);

        match result {
            Ok(pending) => {
                self.plaintext_pending = pending;
                Ok(())
            }
            Err(e) => {
                // rustls queued an alert for the peer
                let _ = self.flush_tls();
                Err(tls_io_error(e))
            }
        }
    }

    async fn read_inbound(&mut self) -> io::Result<Inbound> {
        let stream = self.stream.clone();
        let conn = self.conn_mut()?;
        match conn.read_tls(&mut SocketIo(&stream)) {
            Ok(0) => return Ok(Inbound::Eof),
            Ok(n) => trace!(bytes = n, "read TLS records"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Inbound::WouldBlock),
            Err(e) => return Err(e),
        }
        self.process_packets().await?;
        Ok(Inbound::Processed)
    }
}

#[async_trait]
impl RawChannel for SslHandler {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.flush_tls()?;
            let conn = self.conn_mut()?;
            if !conn.is_handshaking() {
                let result = conn.reader().read(buf);
                match result {
                    Ok(n) => {
                        self.plaintext_pending = self.plaintext_pending.saturating_sub(n);
                        return Ok(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
            match self.read_inbound().await? {
                Inbound::Processed => continue,
                Inbound::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                Inbound::Eof => return Ok(0),
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_handshaking() && !self.drive().await? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let written = self.conn_mut()?.writer().write(buf)?;
        self.flush_tls()?;
        if written == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written)
    }

    async fn flush(&mut self) -> io::Result<bool> {
        self.flush_tls()
    }

    async fn drive(&mut self) -> io::Result<bool> {
        loop {
            if !self.flush_tls()? {
                return Ok(false);
            }
            if !self.is_handshaking() {
                return Ok(true);
            }
            match self.read_inbound().await? {
                Inbound::Processed => {
                    if !self.is_handshaking() {
                        debug!(peer = ?self.peer, "TLS handshake complete");
                    }
                }
                Inbound::WouldBlock => return Ok(false),
                Inbound::Eof => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ))
                }
            }
        }
    }

    /// Sends close_notify and gives the socket a few chances to take it. The peer's own
    /// close_notify is not awaited.
    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            for _ in 0..CLOSE_FLUSH_ATTEMPTS {
                match self.flush_tls() {
                    Ok(true) => break,
                    Ok(false) => {
                        let _ = tokio::time::timeout(CLOSE_FLUSH_WAIT, self.stream.writable()).await;
                    }
                    Err(e) => {
                        debug!(peer = ?self.peer, error = %e, "close_notify not delivered");
                        break;
                    }
                }
            }
        }

        self.conn = None;
        self.plaintext_pending = 0;
        self.pool.shutdown().await;
        if let Some(stream) = Arc::get_mut(&mut self.stream) {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn has_buffered_input(&self) -> bool {
        self.plaintext_pending > 0
    }

    fn has_pending_output(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.wants_write())
    }

    fn transport_interest(&self) -> Interest {
        match self.conn.as_ref() {
            Some(conn) if conn.is_handshaking() => {
                if conn.wants_write() {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE
                }
            }
            _ => Interest::NONE,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn selectable(&self) -> Arc<dyn Selectable> {
        self.stream.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framed::{FramedChannel, ReadStatus, WriteStatus};
    use crate::protocol::encode_frame;
    use crate::tls::{self, testing::localhost_configs, TlsConnector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn wait_ready(channel: &FramedChannel<SslHandler>, interest: Interest) {
        let interest = interest | channel.transport_interest();
        let _ = tokio::time::timeout(Duration::from_millis(200), channel.selectable().ready(interest)).await;
    }

    async fn read_message(channel: &mut FramedChannel<SslHandler>) -> Vec<u8> {
        for _ in 0..200 {
            match channel.read().await.unwrap().status {
                ReadStatus::Complete(message) => return message,
                ReadStatus::WouldBlock => wait_ready(channel, Interest::READABLE).await,
                ReadStatus::Closed => panic!("peer closed"),
            }
        }
        panic!("no message");
    }

    async fn write_message(channel: &mut FramedChannel<SslHandler>, payload: &[u8]) {
        channel.start_write(payload).unwrap();
        for _ in 0..200 {
            if channel.write().await.unwrap().status == WriteStatus::Sent {
                return;
            }
            wait_ready(channel, Interest::WRITABLE).await;
        }
        panic!("message not sent");
    }

    #[tokio::test]
    async fn test_framed_roundtrip_over_tls() {
        let (server_cfg, client_cfg) = localhost_configs(true);
        let server_config = tls::server_config(&server_cfg).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let connector = TlsConnector::new(&client_cfg).unwrap();
            let tcp = TcpStream::connect(addr).await.unwrap();
            let mut stream = connector.connect("localhost", tcp).await.unwrap();
            stream.write_all(&encode_frame(b"hello driver").unwrap()).await.unwrap();
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut reply = vec![0u8; u32::from_be_bytes(prefix) as usize];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let handler = SslHandler::server(tcp, server_config).unwrap();
        let mut channel = FramedChannel::new(Box::new(handler));

        assert_eq!(read_message(&mut channel).await, b"hello driver");
        write_message(&mut channel, b"hello node").await;
        assert_eq!(client.await.unwrap(), b"hello node");
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_mid_handshake_releases_pool() {
        let (server_cfg, client_cfg) = localhost_configs(false);
        let server_config = tls::server_config(&server_cfg).unwrap();
        let client_config = tls::client_config(&client_cfg).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // a client that sends its hello and then stalls
        let client = tokio::spawn(async move {
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            let mut session =
                rustls::ClientConnection::new(client_config, tls::server_name("localhost").unwrap())
                    .unwrap();
            let mut hello = Vec::new();
            session.write_tls(&mut hello).unwrap();
            tcp.write_all(&hello).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            tcp
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let mut handler = SslHandler::server(tcp, server_config).unwrap();
        let flag = handler.delegated_pool_flag();

        for _ in 0..50 {
            let _ = handler.drive().await.unwrap();
            if handler.delegated_pool_running() {
                break;
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(20),
                handler.selectable().ready(Interest::READABLE),
            )
            .await;
        }
        assert!(handler.delegated_pool_running());
        assert!(handler.is_handshaking());

        handler.close().await.unwrap();
        assert!(handler.is_released());
        assert!(!flag.load(Ordering::SeqCst));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_garbage_handshake_fails() {
        let (server_cfg, _) = localhost_configs(false);
        let server_config = tls::server_config(&server_cfg).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            tcp
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        let mut handler = SslHandler::server(tcp, server_config).unwrap();

        let mut failed = false;
        for _ in 0..50 {
            match handler.drive().await {
                Err(_) => {
                    failed = true;
                    break;
                }
                Ok(_) => {
                    let _ = tokio::time::timeout(
                        Duration::from_millis(20),
                        handler.selectable().ready(Interest::READABLE),
                    )
                    .await;
                }
            }
        }
        assert!(failed);
        handler.close().await.unwrap();
        assert!(!handler.delegated_pool_running());
    }
}
