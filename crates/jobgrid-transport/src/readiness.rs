//! Readiness selection behind a small portable interface.
//!
//! The multiplexer only sees [`ReadinessSource`]: register a channel with an interest,
//! wait for events, re-arm. [`TokioReadiness`] implements it with one lightweight watcher
//! task per channel on top of the tokio reactor (epoll/kqueue/IOCP underneath). Watchers
//! are one-shot: after reporting, a channel stays silent until its interest is set again.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifier of a registered channel.
pub type ChannelId = u64;

/// Identifier of a registered listening socket.
pub type ListenerId = u64;

const READ_BIT: u8 = 0b01;
const WRITE_BIT: u8 = 0b10;

/// Operations a channel waits for. Empty means the channel is not watched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READ_BIT);
    pub const WRITABLE: Interest = Interest(WRITE_BIT);
    pub const BOTH: Interest = Interest(READ_BIT | WRITE_BIT);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READ_BIT != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITE_BIT != 0
    }

    fn to_tokio(self) -> Option<tokio::io::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE),
            (true, false) => Some(tokio::io::Interest::READABLE),
            (false, true) => Some(tokio::io::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// Operations that are ready on a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(READ_BIT);
    pub const WRITABLE: Readiness = Readiness(WRITE_BIT);
    pub const BOTH: Readiness = Readiness(READ_BIT | WRITE_BIT);

    pub fn from_bits(bits: u8) -> Readiness {
        Readiness(bits & (READ_BIT | WRITE_BIT))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READ_BIT != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITE_BIT != 0
    }

    /// Keeps only what the interest asked for.
    pub fn filter(self, interest: Interest) -> Readiness {
        Readiness(self.0 & interest.0)
    }

    fn from_tokio(ready: tokio::io::Ready) -> Readiness {
        let mut bits = 0;
        if ready.is_readable() || ready.is_read_closed() {
            bits |= READ_BIT;
        }
        if ready.is_writable() || ready.is_write_closed() {
            bits |= WRITE_BIT;
        }
        Readiness(bits)
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl From<Interest> for Readiness {
    fn from(interest: Interest) -> Readiness {
        Readiness(interest.0)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Interest(self.0), f)
    }
}

/// Something whose readiness can be awaited.
#[async_trait]
pub trait Selectable: Send + Sync + 'static {
    async fn ready(&self, interest: Interest) -> io::Result<Readiness>;
}

#[async_trait]
impl Selectable for TcpStream {
    async fn ready(&self, interest: Interest) -> io::Result<Readiness> {
        let Some(interest) = interest.to_tokio() else {
            return std::future::pending().await;
        };
        let ready = TcpStream::ready(self, interest).await?;
        Ok(Readiness::from_tokio(ready))
    }
}

/// Event reported by a readiness source.
pub enum ReadyEvent {
    Channel {
        id: ChannelId,
        readiness: Readiness,
    },
    Accepted {
        listener: ListenerId,
        stream: TcpStream,
        peer: SocketAddr,
        secure: bool,
    },
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyEvent::Channel { id, readiness } => f
                .debug_struct("Channel")
                .field("id", id)
                .field("readiness", readiness)
                .finish(),
            ReadyEvent::Accepted {
                listener,
                peer,
                secure,
                ..
            } => f
                .debug_struct("Accepted")
                .field("listener", listener)
                .field("peer", peer)
                .field("secure", secure)
                .finish(),
        }
    }
}

/// Cloneable handle used from transitions to re-arm or wake channels.
pub trait InterestRegistrar: Send + Sync {
    /// Arms the channel's watcher with a new interest (one-shot).
    fn set_interest(&self, id: ChannelId, interest: Interest);

    /// Reports readiness for a channel without consulting the socket.
    fn wake(&self, id: ChannelId, readiness: Readiness);

    /// Stops watching a channel.
    fn deregister(&self, id: ChannelId);
}

/// Readiness selection primitive owned by a multiplexer. The multiplexer's run
/// future holds it across awaits, so it must be shareable.
#[async_trait]
pub trait ReadinessSource: Send + Sync {
    fn register_listener(&mut self, listener: TcpListener, secure: bool) -> io::Result<ListenerId>;

    fn register(&mut self, id: ChannelId, handle: Arc<dyn Selectable>, interest: Interest);

    fn deregister(&mut self, id: ChannelId);

    fn registrar(&self) -> Arc<dyn InterestRegistrar>;

    /// Waits for at least one event, or until `timeout` elapses (empty result).
    async fn wait(&mut self, timeout: Option<Duration>) -> Vec<ReadyEvent>;

    /// Stops every watcher and listener.
    fn close(&mut self);
}

struct Watcher {
    arm: watch::Sender<Interest>,
    task: JoinHandle<()>,
}

struct Registry {
    events: mpsc::UnboundedSender<ReadyEvent>,
    watchers: Mutex<HashMap<ChannelId, Watcher>>,
}

impl InterestRegistrar for Registry {
    fn set_interest(&self, id: ChannelId, interest: Interest) {
        if let Some(watcher) = self.watchers.lock().unwrap().get(&id) {
            watcher.arm.send_replace(interest);
        }
    }

    fn wake(&self, id: ChannelId, readiness: Readiness) {
        let _ = self.events.send(ReadyEvent::Channel { id, readiness });
    }

    fn deregister(&self, id: ChannelId) {
        if let Some(watcher) = self.watchers.lock().unwrap().remove(&id) {
            watcher.task.abort();
        }
    }
}

/// [`ReadinessSource`] backed by the tokio reactor.
pub struct TokioReadiness {
    registry: Arc<Registry>,
    receiver: mpsc::UnboundedReceiver<ReadyEvent>,
    listeners: HashMap<ListenerId, JoinHandle<()>>,
    next_listener: AtomicU64,
}

impl Default for TokioReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioReadiness {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(Registry {
                events,
                watchers: Mutex::new(HashMap::new()),
            }),
            receiver,
            listeners: HashMap::new(),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn watched_channels(&self) -> usize {
        self.registry.watchers.lock().unwrap().len()
    }
}

async fn watch_channel(
    id: ChannelId,
    handle: Arc<dyn Selectable>,
    mut arm: watch::Receiver<Interest>,
    events: mpsc::UnboundedSender<ReadyEvent>,
) {
    loop {
        let interest = *arm.borrow_and_update();
        if interest.is_empty() {
            if arm.changed().await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            changed = arm.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            result = handle.ready(interest) => {
                let readiness = match result {
                    Ok(readiness) => readiness.filter(interest),
                    Err(e) => {
                        debug!(channel = id, error = %e, "readiness wait failed");
                        // let the transition hit the error on its next I/O call
                        Readiness::from(interest)
                    }
                };
                if events.send(ReadyEvent::Channel { id, readiness }).is_err() {
                    return;
                }
                if arm.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn accept_loop(
    listener_id: ListenerId,
    listener: TcpListener,
    secure: bool,
    events: mpsc::UnboundedSender<ReadyEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let event = ReadyEvent::Accepted {
                    listener: listener_id,
                    stream,
                    peer,
                    secure,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(listener = listener_id, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[async_trait]
impl ReadinessSource for TokioReadiness {
    fn register_listener(&mut self, listener: TcpListener, secure: bool) -> io::Result<ListenerId> {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let events = self.registry.events.clone();
        let task = tokio::spawn(accept_loop(id, listener, secure, events));
        self.listeners.insert(id, task);
        Ok(id)
    }

    fn register(&mut self, id: ChannelId, handle: Arc<dyn Selectable>, interest: Interest) {
        let (arm, arm_rx) = watch::channel(interest);
        let events = self.registry.events.clone();
        let task = tokio::spawn(watch_channel(id, handle, arm_rx, events));
        if let Some(old) = self
            .registry
            .watchers
            .lock()
            .unwrap()
            .insert(id, Watcher { arm, task })
        {
            old.task.abort();
        }
    }

    fn deregister(&mut self, id: ChannelId) {
        InterestRegistrar::deregister(self.registry.as_ref(), id);
    }

    fn registrar(&self) -> Arc<dyn InterestRegistrar> {
        self.registry.clone()
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Vec<ReadyEvent> {
        let first = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.receiver.recv()).await {
                Ok(event) => event,
                Err(_) => return Vec::new(),
            },
            None => self.receiver.recv().await,
        };

        let mut events = Vec::new();
        if let Some(event) = first {
            events.push(event);
            while let Ok(event) = self.receiver.try_recv() {
                events.push(event);
            }
        }
        events
    }

    fn close(&mut self) {
        for (_, task) in self.listeners.drain() {
            task.abort();
        }
        for (_, watcher) in self.registry.watchers.lock().unwrap().drain() {
            watcher.task.abort();
        }
    }
}
