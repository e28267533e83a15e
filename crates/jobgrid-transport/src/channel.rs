//! A multiplexed connection as seen by state handlers.

use std::net::SocketAddr;

use crate::error::Result;
use crate::framed::{FramedChannel, ReadStatus, WriteStatus};
use crate::message::{deserialize_message, serialize_message, WireMessage};
use crate::readiness::{ChannelId, Interest, Readiness};

/// What a non-blocking receive produced.
#[derive(Debug)]
pub enum Received {
    Message(WireMessage),
    Pending,
    Closed,
}

/// One peer connection: its framing, its readiness for the current step, and the
/// server-specific context `C`.
pub struct Channel<C> {
    id: ChannelId,
    framed: FramedChannel,
    context: C,
    readiness: Readiness,
    interest: Interest,
    secure: bool,
}

impl<C> Channel<C> {
    pub fn new(id: ChannelId, framed: FramedChannel, context: C, secure: bool) -> Self {
        Self {
            id,
            framed,
            context,
            readiness: Readiness::EMPTY,
            interest: Interest::NONE,
            secure,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.framed.peer_addr()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn framed(&self) -> &FramedChannel {
        &self.framed
    }

    pub fn framed_mut(&mut self) -> &mut FramedChannel {
        &mut self.framed
    }

    /// Readiness that triggered the current step.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }

    /// Interest of the current state.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_readiness(&mut self, readiness: Readiness) {
        self.readiness = readiness;
    }

    pub(crate) fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Reads and decodes at most one message.
    pub async fn receive(&mut self) -> Result<Received> {
        match self.framed.read().await?.status {
            ReadStatus::Complete(bytes) => Ok(Received::Message(deserialize_message(&bytes)?)),
            ReadStatus::WouldBlock => Ok(Received::Pending),
            ReadStatus::Closed => Ok(Received::Closed),
        }
    }

    /// Encodes and stages a message; call [`Channel::send_pending`] to push it.
    pub fn start_send(&mut self, message: &WireMessage) -> Result<()> {
        let bytes = serialize_message(message)?;
        self.framed.start_write(&bytes)
    }

    /// Continues the staged message. `true` once it is fully sent.
    pub async fn send_pending(&mut self) -> Result<bool> {
        Ok(self.framed.write().await?.status == WriteStatus::Sent)
    }

    pub fn has_pending_send(&self) -> bool {
        self.framed.has_pending_write()
    }

    pub fn into_context(self) -> C {
        self.context
    }
}
