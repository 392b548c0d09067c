//! Coordinator of common subset sessions
//!
//! Multiplexes [sessions](CommonSubset) identified by `(session_id, state_index)` over a single
//! [`Transport`]. Sessions live in an [`InstanceWindow`]:
//! * Local call for `state_index` moves the window forward, sessions older than
//!   `state_index - past_instances` are closed
//! * Messages addressed to sessions within `future_instances` ahead that weren't asked locally
//!   yet create them, so that nothing sent by faster peers is lost
//! * Messages addressed to anything further are dropped
//!
//! Every session runs in its own task. Registry lock is never held while a session is being
//! driven.

use core::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    codec::Wire,
    config::AcsConfig,
    gpa::{NodeId, ProtocolError},
    net::Transport,
    window::{InstanceWindow, OutOfWindow},
    Ciphersuite, DkShare, PeerIndex,
};

use super::{batch::MsgBatch, session::CommonSubset, AcsOutput};

/// Callback receiving decided proposals
pub type Callback = Box<dyn FnOnce(AcsOutput) + Send + 'static>;

/// Common subset coordinator
pub struct Coordinator<C: Ciphersuite, T: Transport> {
    inner: Arc<Inner<C, T>>,
}

impl<C: Ciphersuite, T: Transport> Clone for Coordinator<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: Ciphersuite, T: Transport> {
    me_index: PeerIndex,
    members: Vec<NodeId>,
    dk: Arc<DkShare<C::Curve>>,
    config: AcsConfig,
    transport: T,
    state: Mutex<State<C>>,
}

struct State<C: Ciphersuite> {
    closed: bool,
    sessions: InstanceWindow<u64, SessionHandle<C>>,
}

struct SessionHandle<C: Ciphersuite> {
    asked: bool,
    inbox: mpsc::UnboundedSender<Event<C>>,
}

enum Event<C: Ciphersuite> {
    Input { value: Vec<u8>, callback: Callback },
    Batch(MsgBatch<C>),
}

impl<C: Ciphersuite, T: Transport> Coordinator<C, T> {
    /// Constructs a coordinator
    ///
    /// `members` must be ordered the same way as public shares in `dk`. Must be called within
    /// tokio runtime context.
    pub fn new(
        members: Vec<NodeId>,
        dk: Arc<DkShare<C::Curve>>,
        transport: T,
        config: AcsConfig,
    ) -> Result<Self, CoordinatorError> {
        config.validate().map_err(Reason::InvalidConfig)?;
        if members.len() != usize::from(dk.n()) {
            return Err(Reason::MembersMismatch.into());
        }
        let sessions = InstanceWindow::new(config.past_instances, config.future_instances);
        Ok(Self {
            inner: Arc::new(Inner {
                me_index: dk.index(),
                members,
                dk,
                config,
                transport,
                state: Mutex::new(State {
                    closed: false,
                    sessions,
                }),
            }),
        })
    }

    /// Runs common subset for `(session_id, state_index)` proposing `value`
    ///
    /// `callback` is called once with decided proposals. It's never called if the session
    /// gets out of the window or the coordinator is closed before the decision.
    ///
    /// Fails if the session was already asked, if it's already behind the window, or if `value`
    /// is empty or larger than [`max_message_size`](AcsConfig::max_message_size).
    pub fn run_acs_consensus(
        &self,
        value: Vec<u8>,
        session_id: u64,
        state_index: u32,
        callback: impl FnOnce(AcsOutput) + Send + 'static,
    ) -> Result<(), CoordinatorError> {
        if value.is_empty() || value.len() > self.inner.config.max_message_size {
            return Err(Reason::InvalidProposal { len: value.len() }.into());
        }
        if self.inner.members.len() == 1 {
            if self.inner.state.lock().closed {
                return Err(Reason::Closed.into());
            }
            let output = AcsOutput::from([(self.inner.me_index, value)]);
            callback(output);
            return Ok(());
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Reason::Closed.into());
        }
        let reaped = state.sessions.advance(state_index);
        for ((index, id), _session) in &reaped {
            tracing::debug!(session_id = id, state_index = index, "session closed");
        }
        let session = state
            .sessions
            .get_or_create_with(state_index, session_id, || {
                spawn_session(&self.inner, session_id, state_index)
            })?;
        if session.asked {
            return Err(Reason::Duplicate {
                session_id,
                state_index,
            }
            .into());
        }
        session
            .inbox
            .send(Event::Input {
                value,
                callback: Box::new(callback),
            })
            .map_err(|_| Reason::Closed)?;
        session.asked = true;
        Ok(())
    }

    /// Handles a message received from member `from`
    ///
    /// Malformed messages, and messages addressed to sessions out of the window, are logged
    /// and dropped.
    pub fn receive(&self, from: PeerIndex, payload: Bytes) {
        let batch = match MsgBatch::<C>::from_bytes(payload) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(from, error = %err, "dropping malformed batch");
                return;
            }
        };
        if batch.src != from || batch.dst != self.inner.me_index {
            tracing::warn!(
                from,
                src = batch.src,
                dst = batch.dst,
                "batch src/dst doesn't match the link"
            );
            return;
        }
        let (session_id, state_index) = (batch.session_id, batch.state_index);
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        match state
            .sessions
            .get_or_create_with(state_index, session_id, || {
                spawn_session(&self.inner, session_id, state_index)
            }) {
            Ok(session) => {
                let _ = session.inbox.send(Event::Batch(batch));
            }
            Err(err) => {
                let err = CoordinatorError::from(err);
                tracing::debug!(from, session_id, error = %err, "batch dropped");
            }
        }
    }

    /// Closes all sessions
    ///
    /// Pending callbacks are never called.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let sessions = state.sessions.drain();
        tracing::debug!(n = sessions.len(), "coordinator closed");
    }

    /// Number of running sessions
    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Latest state index asked locally
    pub fn current_state_index(&self) -> u32 {
        self.inner.state.lock().sessions.current()
    }
}

fn spawn_session<C: Ciphersuite, T: Transport>(
    inner: &Arc<Inner<C, T>>,
    session_id: u64,
    state_index: u32,
) -> Result<SessionHandle<C>, Reason> {
    let session = CommonSubset::new(
        session_id,
        state_index,
        inner.members.clone(),
        inner.dk.clone(),
        inner.config.resend_period,
        inner.config.max_message_size,
    )
    .map_err(Reason::Session)?;
    let (tx, rx) = mpsc::unbounded_channel();
    tracing::debug!(session_id, state_index, "session created");
    tokio::spawn(run_session(inner.clone(), session, rx));
    Ok(SessionHandle {
        asked: false,
        inbox: tx,
    })
}

async fn run_session<C: Ciphersuite, T: Transport>(
    inner: Arc<Inner<C, T>>,
    mut session: CommonSubset<C>,
    mut inbox: mpsc::UnboundedReceiver<Event<C>>,
) {
    let mut callback: Option<Callback> = None;
    let mut ticker = tokio::time::interval(inner.config.resend_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let now = tokio::time::Instant::now().into_std();
        let batches = tokio::select! {
            event = inbox.recv() => match event {
                None => break,
                Some(Event::Input { value, callback: cb }) => {
                    callback = Some(cb);
                    match session.input(value, now) {
                        Ok(batches) => batches,
                        Err(err) => {
                            tracing::error!(error = %err, "session rejected the input");
                            vec![]
                        }
                    }
                }
                Some(Event::Batch(batch)) => session.receive(batch, now),
            },
            _ = ticker.tick() => session.tick(now),
        };
        for batch in batches {
            inner.transport.send(batch.dst, batch.to_bytes());
        }
        if let Some(output) = session.output() {
            if let Some(cb) = callback.take() {
                cb(output.clone());
            }
        }
    }
    tracing::trace!(status = %session.status(), "session task finished");
}

/// Coordinator error
#[derive(Debug)]
pub struct CoordinatorError(Reason);

#[derive(Debug)]
enum Reason {
    Duplicate { session_id: u64, state_index: u32 },
    OutOfWindow(OutOfWindow),
    InvalidProposal { len: usize },
    Session(ProtocolError),
    Closed,
    MembersMismatch,
    InvalidConfig(crate::config::InvalidConfig),
}

impl CoordinatorError {
    /// Indicates that the session was already asked
    pub fn is_duplicate(&self) -> bool {
        matches!(self.0, Reason::Duplicate { .. })
    }
    /// Indicates that the session is out of the window
    pub fn is_out_of_window(&self) -> bool {
        matches!(self.0, Reason::OutOfWindow(_))
    }
    /// Indicates that the proposed value is empty or too large
    pub fn is_invalid_proposal(&self) -> bool {
        matches!(self.0, Reason::InvalidProposal { .. })
    }
}

impl From<OutOfWindow> for Reason {
    fn from(err: OutOfWindow) -> Self {
        Reason::OutOfWindow(err)
    }
}

impl From<Reason> for CoordinatorError {
    fn from(err: Reason) -> Self {
        Self(err)
    }
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::Duplicate {
                session_id,
                state_index,
            } => write!(
                f,
                "session {session_id} at state index {state_index} was already asked"
            ),
            Reason::OutOfWindow(_) => f.write_str("session is out of the window"),
            Reason::InvalidProposal { len } => {
                write!(f, "proposed value of {len} bytes is empty or too large")
            }
            Reason::Session(_) => f.write_str("session cannot be created"),
            Reason::Closed => f.write_str("coordinator is closed"),
            Reason::MembersMismatch => f.write_str("members don't match the key share"),
            Reason::InvalidConfig(_) => f.write_str("invalid config"),
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            Reason::Duplicate { .. }
            | Reason::InvalidProposal { .. }
            | Reason::Closed
            | Reason::MembersMismatch => None,
            Reason::OutOfWindow(err) => Some(err),
            Reason::Session(err) => Some(err),
            Reason::InvalidConfig(err) => Some(err),
        }
    }
}
