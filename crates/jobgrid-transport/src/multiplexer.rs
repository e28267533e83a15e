//! Readiness-driven connection multiplexer.
//!
//! One loop waits on a [`ReadinessSource`], accepts connections on its listeners and
//! runs one state-machine step per ready channel. A channel is never stepped by two
//! tasks at once: readiness that arrives while a step is running is folded into the
//! channel's pending bits and picked up by the running task before it lets go.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{Result, TransportError};
use crate::framed::{FramedChannel, PlainChannel, RawChannel};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::readiness::{
    ChannelId, InterestRegistrar, Readiness, ReadinessSource, ReadyEvent, TokioReadiness,
};
use crate::ssl_handler::SslHandler;
use crate::state_machine::{StateKind, StateMachine};

/// The protocol side of a multiplexer: its state machine and per-channel context.
#[async_trait]
pub trait ChannelServer: Send + Sync + 'static {
    type State: StateKind;
    type Transition: StateKind;
    type Context: Send + 'static;

    fn state_machine(&self) -> &StateMachine<Self::State, Self::Transition, Self::Context>;

    fn create_context(&self, id: ChannelId, peer: SocketAddr, secure: bool) -> Self::Context;

    /// Receives the handle of the multiplexer serving this server, once, at bind time.
    fn attach(&self, _handle: MultiplexerHandle) {}

    /// Called exactly once when the channel leaves the multiplexer, before its socket
    /// is closed. `state` is the last state the channel was in.
    async fn on_close(&self, channel: &mut Channel<Self::Context>, state: Self::State);
}

/// How ready channels are stepped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    /// Inline on the loop task, one channel after another.
    Sequential,
    /// On spawned tasks, at most `workers` at a time.
    Parallel { workers: usize },
}

impl Default for TransitionMode {
    fn default() -> Self {
        TransitionMode::Parallel { workers: 16 }
    }
}

#[derive(Clone)]
pub struct MultiplexerConfig {
    pub name: String,
    pub listen: Vec<SocketAddr>,
    pub tls_listen: Vec<SocketAddr>,
    /// Required when `tls_listen` is not empty.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Wakes the loop at least this often even without events.
    pub select_timeout: Option<Duration>,
    pub mode: TransitionMode,
}

impl MultiplexerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: Vec::new(),
            tls_listen: Vec::new(),
            tls: None,
            select_timeout: Some(Duration::from_secs(1)),
            mode: TransitionMode::default(),
        }
    }
}

struct SlotInner<S: ChannelServer> {
    channel: Channel<S::Context>,
    state: S::State,
    closed: bool,
}

struct Slot<S: ChannelServer> {
    inner: Mutex<SlotInner<S>>,
    pending: AtomicU8,
}

struct Shared<S: ChannelServer> {
    name: Arc<str>,
    server: Arc<S>,
    channels: DashMap<ChannelId, Arc<Slot<S>>>,
    registrar: Arc<dyn InterestRegistrar>,
    metrics: Arc<TransportMetrics>,
}

/// Cloneable control surface of a running multiplexer.
#[derive(Clone)]
pub struct MultiplexerHandle {
    name: Arc<str>,
    registrar: Arc<dyn InterestRegistrar>,
    shutdown: CancellationToken,
    metrics: Arc<TransportMetrics>,
}

impl MultiplexerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules a step for `id` as if the socket had reported `readiness`.
    pub fn wake(&self, id: ChannelId, readiness: Readiness) {
        self.metrics.inc_wakeups();
        self.registrar.wake(id, readiness);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn active_channels(&self) -> u32 {
        self.metrics.snapshot().active_connections
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub struct ConnectionMultiplexer<S: ChannelServer> {
    shared: Arc<Shared<S>>,
    readiness: Box<dyn ReadinessSource>,
    tls: Option<Arc<rustls::ServerConfig>>,
    select_timeout: Option<Duration>,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    local_addrs: Vec<SocketAddr>,
    tls_addrs: Vec<SocketAddr>,
    next_id: ChannelId,
}

impl<S: ChannelServer> ConnectionMultiplexer<S> {
    /// Binds every configured listener on a [`TokioReadiness`] source.
    pub async fn bind(config: MultiplexerConfig, server: Arc<S>) -> Result<Self> {
        Self::bind_with(config, server, Box::new(TokioReadiness::new())).await
    }

    pub async fn bind_with(
        config: MultiplexerConfig,
        server: Arc<S>,
        mut readiness: Box<dyn ReadinessSource>,
    ) -> Result<Self> {
        if !config.tls_listen.is_empty() && config.tls.is_none() {
            return Err(TransportError::TlsError {
                reason: format!("{}: TLS listeners configured without a server config", config.name),
            });
        }

        let mut local_addrs = Vec::with_capacity(config.listen.len());
        for addr in &config.listen {
            let listener = bind_listener(*addr).await?;
            local_addrs.push(listener.local_addr()?);
            readiness.register_listener(listener, false)?;
        }
        let mut tls_addrs = Vec::with_capacity(config.tls_listen.len());
        for addr in &config.tls_listen {
            let listener = bind_listener(*addr).await?;
            tls_addrs.push(listener.local_addr()?);
            readiness.register_listener(listener, true)?;
        }

        let workers = match config.mode {
            TransitionMode::Sequential => None,
            TransitionMode::Parallel { workers } => Some(Arc::new(Semaphore::new(workers.max(1)))),
        };

        let shared = Arc::new(Shared {
            name: Arc::from(config.name.as_str()),
            server,
            channels: DashMap::new(),
            registrar: readiness.registrar(),
            metrics: Arc::new(TransportMetrics::new()),
        });

        let mux = Self {
            shared,
            readiness,
            tls: config.tls,
            select_timeout: config.select_timeout,
            workers,
            shutdown: CancellationToken::new(),
            local_addrs,
            tls_addrs,
            next_id: 1,
        };
        mux.shared.server.attach(mux.handle());
        Ok(mux)
    }

    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            name: self.shared.name.clone(),
            registrar: self.shared.registrar.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.shared.metrics.clone(),
        }
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn tls_addrs(&self) -> &[SocketAddr] {
        &self.tls_addrs
    }

    /// Runs until [`MultiplexerHandle::shutdown`], then closes every channel.
    pub async fn run(mut self) -> Result<()> {
        info!(
            server = %self.shared.name,
            plain = ?self.local_addrs,
            tls = ?self.tls_addrs,
            "multiplexer started"
        );
        let shutdown = self.shutdown.clone();

        loop {
            let events = tokio::select! {
                _ = shutdown.cancelled() => break,
                events = self.readiness.wait(self.select_timeout) => events,
            };

            let mut ready: Vec<(ChannelId, Readiness)> = Vec::new();
            let mut index: HashMap<ChannelId, usize> = HashMap::new();
            for event in events {
                match event {
                    ReadyEvent::Accepted {
                        stream,
                        peer,
                        secure,
                        ..
                    } => self.accept(stream, peer, secure),
                    ReadyEvent::Channel { id, readiness } => match index.get(&id) {
                        Some(&at) => {
                            ready[at].1 = ready[at].1 | readiness;
                            self.shared.metrics.inc_coalesced();
                        }
                        None => {
                            index.insert(id, ready.len());
                            ready.push((id, readiness));
                        }
                    },
                }
            }

            for (id, readiness) in ready {
                self.dispatch(id, readiness).await;
            }
        }

        self.close_all().await;
        self.readiness.close();
        info!(server = %self.shared.name, "multiplexer stopped");
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr, secure: bool) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(server = %self.shared.name, %peer, error = %e, "set_nodelay failed");
        }

        let raw: Box<dyn RawChannel> = if secure {
            let Some(config) = self.tls.clone() else {
                warn!(server = %self.shared.name, %peer, "TLS connection without server config");
                return;
            };
            match SslHandler::server(stream, config) {
                Ok(handler) => Box::new(handler),
                Err(e) => {
                    warn!(server = %self.shared.name, %peer, error = %e, "TLS setup failed");
                    return;
                }
            }
        } else {
            Box::new(PlainChannel::new(stream))
        };

        let id = self.next_id;
        self.next_id += 1;

        let initial = self.shared.server.state_machine().initial();
        let context = self.shared.server.create_context(id, peer, secure);
        let mut channel = Channel::new(id, FramedChannel::new(raw), context, secure);
        channel.set_interest(initial.interest);
        let selectable = channel.framed().selectable();
        let interest = initial.interest | channel.framed().transport_interest();

        self.shared.channels.insert(
            id,
            Arc::new(Slot {
                inner: Mutex::new(SlotInner {
                    channel,
                    state: initial.state,
                    closed: false,
                }),
                pending: AtomicU8::new(0),
            }),
        );
        self.shared.metrics.connection_opened(secure);
        self.readiness.register(id, selectable, interest);
        debug!(server = %self.shared.name, channel = id, %peer, secure, "channel accepted");
    }

    async fn dispatch(&self, id: ChannelId, readiness: Readiness) {
        let Some(slot) = self.shared.channels.get(&id).map(|entry| entry.value().clone()) else {
            return;
        };
        slot.pending.fetch_or(readiness.bits(), Ordering::SeqCst);

        match &self.workers {
            None => run_slot(self.shared.clone(), id, slot).await,
            Some(workers) => {
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    return;
                };
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    run_slot(shared, id, slot).await;
                    drop(permit);
                });
            }
        }
    }

    async fn close_all(&self) {
        let slots: Vec<(ChannelId, Arc<Slot<S>>)> = self
            .shared
            .channels
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, slot) in slots {
            let mut inner = slot.inner.lock().await;
            if !inner.closed {
                close_channel(&self.shared, id, &mut inner).await;
            }
        }
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::ConnectionRefused {
            addr: format!("{} ({})", addr, e),
        })
}

/// Steps one channel until no readiness is pending. Returns at once if another task
/// already owns the channel; that task will see the bits set by the caller.
async fn run_slot<S: ChannelServer>(shared: Arc<Shared<S>>, id: ChannelId, slot: Arc<Slot<S>>) {
    loop {
        let Ok(mut guard) = slot.inner.try_lock() else {
            shared.metrics.inc_coalesced();
            return;
        };
        if guard.closed {
            return;
        }
        let bits = slot.pending.swap(0, Ordering::SeqCst);
        if bits == 0 {
            drop(guard);
            // bits set by a caller whose try_lock lost against us
            if slot.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            continue;
        }

        let inner = &mut *guard;
        inner.channel.set_readiness(Readiness::from_bits(bits));
        let state = inner.state;
        shared.metrics.inc_transitions();

        match shared.server.state_machine().step(&mut inner.channel, state).await {
            Ok(outcome) if outcome.closed => {
                inner.state = outcome.state;
                close_channel(&shared, id, inner).await;
                return;
            }
            Ok(outcome) => {
                inner.state = outcome.state;
                let interest = outcome.interest | inner.channel.framed().transport_interest();
                if interest.is_readable() && inner.channel.framed().has_buffered_input() {
                    // decrypted bytes the socket will never report
                    slot.pending.fetch_or(Readiness::READABLE.bits(), Ordering::SeqCst);
                }
                shared.registrar.set_interest(id, interest);
            }
            Err(e) => {
                shared.metrics.inc_transition_errors();
                warn!(
                    server = %shared.name,
                    channel = id,
                    state = ?state,
                    peer = ?inner.channel.peer_addr(),
                    error = %e,
                    "transition failed, closing channel"
                );
                close_channel(&shared, id, inner).await;
                return;
            }
        }
        drop(guard);
    }
}

async fn close_channel<S: ChannelServer>(
    shared: &Shared<S>,
    id: ChannelId,
    inner: &mut SlotInner<S>,
) {
    inner.closed = true;
    shared.registrar.deregister(id);
    shared.server.on_close(&mut inner.channel, inner.state).await;
    if let Err(e) = inner.channel.framed_mut().close().await {
        debug!(server = %shared.name, channel = id, error = %e, "close failed");
    }
    shared.channels.remove(&id);
    shared.metrics.connection_closed();
    debug!(server = %shared.name, channel = id, state = ?inner.state, "channel closed");
}
