//! Generic per-channel state machine.
//!
//! A machine is a set of state handlers plus an explicit transition table mapping
//! `(state, transition)` to the next state and the readiness interest to arm for it.
//! [`StateMachineBuilder::build`] rejects incomplete tables, so a missing entry is a
//! startup error. At runtime, a handler returning an undeclared transition is fatal for
//! that channel only.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::error::{Result, TransportError};
use crate::readiness::Interest;

/// Bounds shared by state and transition enums.
pub trait StateKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> StateKind for T {}

/// Work performed while a channel is in one state.
///
/// `perform` must do at most one bounded unit of I/O or computation and must be safe to
/// call again while the channel stays ready; any progress lives in the channel itself.
#[async_trait]
pub trait StateHandler<T, C>: Send + Sync {
    async fn perform(&self, channel: &mut Channel<C>) -> Result<T>;

    /// Every transition `perform` can return.
    fn transitions(&self) -> &'static [T];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTarget<S> {
    pub state: S,
    pub interest: Interest,
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome<S> {
    pub state: S,
    pub interest: Interest,
    /// The channel reached a terminal state and must be closed.
    pub closed: bool,
}

pub struct StateMachine<S, T, C> {
    name: &'static str,
    handlers: HashMap<S, Arc<dyn StateHandler<T, C>>>,
    table: HashMap<(S, T), TransitionTarget<S>>,
    initial: TransitionTarget<S>,
    terminal: HashSet<S>,
}

pub struct StateMachineBuilder<S, T, C> {
    name: &'static str,
    handlers: HashMap<S, Arc<dyn StateHandler<T, C>>>,
    table: HashMap<(S, T), TransitionTarget<S>>,
    initial: Option<TransitionTarget<S>>,
    terminal: HashSet<S>,
}

impl<S: StateKind, T: StateKind, C: Send> StateMachineBuilder<S, T, C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: HashMap::new(),
            table: HashMap::new(),
            initial: None,
            terminal: HashSet::new(),
        }
    }

    pub fn initial(mut self, state: S, interest: Interest) -> Self {
        self.initial = Some(TransitionTarget { state, interest });
        self
    }

    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    pub fn handler(mut self, state: S, handler: Arc<dyn StateHandler<T, C>>) -> Self {
        self.handlers.insert(state, handler);
        self
    }

    pub fn transition(mut self, from: S, transition: T, to: S, interest: Interest) -> Self {
        self.table.insert(
            (from, transition),
            TransitionTarget {
                state: to,
                interest,
            },
        );
        self
    }

    pub fn build(self) -> Result<StateMachine<S, T, C>> {
        let name = self.name;
        let invalid = |reason: String| TransportError::InvalidStateTable {
            reason: format!("{}: {}", name, reason),
        };

        let initial = self
            .initial
            .ok_or_else(|| invalid("no initial state".to_string()))?;
        if !self.handlers.contains_key(&initial.state) {
            return Err(invalid(format!("initial state {:?} has no handler", initial.state)));
        }

        for state in &self.terminal {
            if self.handlers.contains_key(state) {
                return Err(invalid(format!("terminal state {:?} has a handler", state)));
            }
        }

        for (state, handler) in &self.handlers {
            for transition in handler.transitions() {
                if !self.table.contains_key(&(*state, *transition)) {
                    return Err(invalid(format!(
                        "state {:?} declares {:?} but the table has no entry for it",
                        state, transition
                    )));
                }
            }
        }

        for ((from, transition), target) in &self.table {
            if !self.handlers.contains_key(from) {
                return Err(invalid(format!(
                    "entry ({:?}, {:?}) starts from a state without handler",
                    from, transition
                )));
            }
            if !self.handlers.contains_key(&target.state) && !self.terminal.contains(&target.state)
            {
                return Err(invalid(format!(
                    "entry ({:?}, {:?}) leads to {:?}, which has no handler and is not terminal",
                    from, transition, target.state
                )));
            }
        }

        Ok(StateMachine {
            name: self.name,
            handlers: self.handlers,
            table: self.table,
            initial,
            terminal: self.terminal,
        })
    }
}

impl<S: StateKind, T: StateKind, C: Send> StateMachine<S, T, C> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initial(&self) -> TransitionTarget<S> {
        self.initial
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Looks up the table entry for `(state, transition)`.
    pub fn target(&self, state: S, transition: T) -> Result<TransitionTarget<S>> {
        self.table
            .get(&(state, transition))
            .copied()
            .ok_or_else(|| TransportError::IllegalTransition {
                state: format!("{:?}", state),
                transition: format!("{:?}", transition),
            })
    }

    /// Runs one transition for `channel`, currently in `state`.
    ///
    /// Transport work (TLS handshake, buffered ciphertext) is advanced first; while it
    /// is incomplete the handler is not called and the state is kept.
    pub async fn step(&self, channel: &mut Channel<C>, state: S) -> Result<StepOutcome<S>> {
        if self.is_terminal(state) {
            return Ok(StepOutcome {
                state,
                interest: Interest::NONE,
                closed: true,
            });
        }

        if !channel.framed_mut().drive().await? {
            return Ok(StepOutcome {
                state,
                interest: channel.interest() | channel.framed().transport_interest(),
                closed: false,
            });
        }

        let handler = self
            .handlers
            .get(&state)
            .ok_or_else(|| TransportError::MissingHandler {
                state: format!("{:?}", state),
            })?;
        let transition = handler.perform(channel).await?;
        let target = self.target(state, transition)?;
        channel.set_interest(target.interest);

        Ok(StepOutcome {
            state: target.state,
            interest: target.interest,
            closed: self.is_terminal(target.state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Received;
    use crate::framed::testing::ScriptedChannel;
    use crate::framed::{FramedChannel, RawChannel};
    use crate::message::{serialize_message, WireMessage};
    use crate::protocol::encode_frame;
    use uuid::Uuid;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum EchoState {
        Receiving,
        Replying,
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum EchoTransition {
        KeepReceiving,
        Reply,
        KeepReplying,
        Done,
        Close,
    }

    #[derive(Default)]
    struct EchoContext {
        last: Option<WireMessage>,
    }

    struct ReceiveHandler;

    #[async_trait]
    impl StateHandler<EchoTransition, EchoContext> for ReceiveHandler {
        async fn perform(&self, channel: &mut Channel<EchoContext>) -> Result<EchoTransition> {
            match channel.receive().await? {
                Received::Message(message) => {
                    channel.start_send(&message)?;
                    channel.context_mut().last = Some(message);
                    Ok(EchoTransition::Reply)
                }
                Received::Pending => Ok(EchoTransition::KeepReceiving),
                Received::Closed => Ok(EchoTransition::Close),
            }
        }

        fn transitions(&self) -> &'static [EchoTransition] {
            &[
                EchoTransition::KeepReceiving,
                EchoTransition::Reply,
                EchoTransition::Close,
            ]
        }
    }

    struct ReplyHandler;

    #[async_trait]
    impl StateHandler<EchoTransition, EchoContext> for ReplyHandler {
        async fn perform(&self, channel: &mut Channel<EchoContext>) -> Result<EchoTransition> {
            if channel.send_pending().await? {
                Ok(EchoTransition::Done)
            } else {
                Ok(EchoTransition::KeepReplying)
            }
        }

        fn transitions(&self) -> &'static [EchoTransition] {
            &[EchoTransition::Done, EchoTransition::KeepReplying]
        }
    }

    fn builder() -> StateMachineBuilder<EchoState, EchoTransition, EchoContext> {
        StateMachineBuilder::new("echo")
            .initial(EchoState::Receiving, Interest::READABLE)
            .terminal(EchoState::Closed)
            .handler(EchoState::Receiving, Arc::new(ReceiveHandler))
            .handler(EchoState::Replying, Arc::new(ReplyHandler))
            .transition(
                EchoState::Receiving,
                EchoTransition::KeepReceiving,
                EchoState::Receiving,
                Interest::READABLE,
            )
            .transition(
                EchoState::Receiving,
                EchoTransition::Reply,
                EchoState::Replying,
                Interest::WRITABLE,
            )
            .transition(
                EchoState::Receiving,
                EchoTransition::Close,
                EchoState::Closed,
                Interest::NONE,
            )
            .transition(
                EchoState::Replying,
                EchoTransition::KeepReplying,
                EchoState::Replying,
                Interest::WRITABLE,
            )
    }

    fn complete() -> StateMachine<EchoState, EchoTransition, EchoContext> {
        builder()
            .transition(
                EchoState::Replying,
                EchoTransition::Done,
                EchoState::Receiving,
                Interest::READABLE,
            )
            .build()
            .unwrap()
    }

    fn channel(raw: ScriptedChannel) -> Channel<EchoContext> {
        let raw: Box<dyn RawChannel> = Box::new(raw);
        Channel::new(1, FramedChannel::new(raw), EchoContext::default(), false)
    }

    fn cancel_frame() -> Vec<u8> {
        let message = WireMessage::CancelJob {
            job_id: Uuid::nil(),
        };
        encode_frame(&serialize_message(&message).unwrap()).unwrap()
    }

    #[test]
    fn test_missing_table_entry_fails_at_build() {
        let err = builder().build().err().unwrap();
        assert!(matches!(err, TransportError::InvalidStateTable { .. }));
        assert!(err.to_string().contains("Done"));
    }

    #[test]
    fn test_target_without_handler_fails_at_build() {
        let err = builder()
            .transition(
                EchoState::Replying,
                EchoTransition::Done,
                EchoState::Receiving,
                Interest::READABLE,
            )
            .transition(
                EchoState::Replying,
                EchoTransition::Close,
                EchoState::Closed,
                Interest::NONE,
            )
            .terminal(EchoState::Replying)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidStateTable { .. }));
    }

    #[test]
    fn test_missing_initial_fails_at_build() {
        let result = StateMachineBuilder::<EchoState, EchoTransition, EchoContext>::new("empty").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_step_through_echo() {
        let machine = complete();
        let mut raw = ScriptedChannel::new();
        let frame = cancel_frame();
        raw.push_bytes(&frame[..3]);
        raw.push_block();
        raw.push_bytes(&frame[3..]);
        let sink = raw.outbound.clone();
        let mut channel = channel(raw);

        let first = machine.step(&mut channel, EchoState::Receiving).await.unwrap();
        assert_eq!(first.state, EchoState::Receiving);
        assert!(!first.closed);

        let second = machine.step(&mut channel, first.state).await.unwrap();
        assert_eq!(second.state, EchoState::Replying);
        assert_eq!(second.interest, Interest::WRITABLE);

        let third = machine.step(&mut channel, second.state).await.unwrap();
        assert_eq!(third.state, EchoState::Receiving);
        assert_eq!(*sink.lock().unwrap(), frame);
        assert!(channel.context().last.is_some());
    }

    #[tokio::test]
    async fn test_repeated_step_is_harmless() {
        let machine = complete();
        let mut channel = channel(ScriptedChannel::new());
        for _ in 0..5 {
            let outcome = machine.step(&mut channel, EchoState::Receiving).await.unwrap();
            assert_eq!(outcome.state, EchoState::Receiving);
        }
    }

    #[tokio::test]
    async fn test_peer_close_reaches_terminal() {
        let machine = complete();
        let mut raw = ScriptedChannel::new();
        raw.eof = true;
        let mut channel = channel(raw);
        let outcome = machine.step(&mut channel, EchoState::Receiving).await.unwrap();
        assert!(outcome.closed);
        assert_eq!(outcome.state, EchoState::Closed);
    }

    #[tokio::test]
    async fn test_undeclared_transition_is_channel_error() {
        struct Rogue;

        #[async_trait]
        impl StateHandler<EchoTransition, EchoContext> for Rogue {
            async fn perform(&self, _channel: &mut Channel<EchoContext>) -> Result<EchoTransition> {
                Ok(EchoTransition::Done)
            }

            fn transitions(&self) -> &'static [EchoTransition] {
                &[EchoTransition::KeepReceiving]
            }
        }

        let machine = StateMachineBuilder::new("rogue")
            .initial(EchoState::Receiving, Interest::READABLE)
            .handler(EchoState::Receiving, Arc::new(Rogue) as Arc<dyn StateHandler<_, _>>)
            .transition(
                EchoState::Receiving,
                EchoTransition::KeepReceiving,
                EchoState::Receiving,
                Interest::READABLE,
            )
            .build()
            .unwrap();
        let mut channel = channel(ScriptedChannel::new());
        let err = machine.step(&mut channel, EchoState::Receiving).await.unwrap_err();
        assert!(matches!(err, TransportError::IllegalTransition { .. }));
    }
}
