//! Bracha reliable broadcast
//!
//! Proposer sends its value to everyone. Members echo the proposal, and once enough echoes or
//! readies are collected they announce READY for the value. The value is delivered once more than
//! $2f$ members are ready for it. If any correct member delivers a value, every correct member
//! eventually delivers the same value, even if the proposer is faulty.
//!
//! Delivery is gated by a [predicate](Predicate): a member echoes the proposal and delivers the
//! value only when the predicate accepts it. The predicate can be replaced at any time with
//! [`RbcInput::Predicate`], which lets the caller accept values that depend on its own
//! progress. Predicates must be monotone: once a value is accepted, it must stay accepted.
//!
//! Every message carries the full value; values are expected to be small.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{self, DecodeError, Wire},
    gpa::{Automaton, NodeId, OutMessages, ProtocolError},
    key::max_faulty,
};

/// Acceptance predicate
pub type Predicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Predicate that accepts any value
pub fn accept_all() -> Predicate {
    Arc::new(|_| true)
}

/// Input of [`Rbc`]
#[derive(Clone)]
pub enum RbcInput {
    /// Broadcasts a value. Allowed only at the proposer, once.
    Broadcast(Vec<u8>),
    /// Replaces the acceptance predicate
    Predicate(Predicate),
}

impl fmt::Debug for RbcInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RbcInput::Broadcast(value) => write!(f, "Broadcast({} bytes)", value.len()),
            RbcInput::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Message of [`Rbc`]
#[derive(Clone, PartialEq, Eq)]
pub enum RbcMessage {
    /// Value sent by the proposer
    Propose(Bytes),
    /// Echo of the proposal
    Echo(Bytes),
    /// Sender is ready to deliver the value
    Ready(Bytes),
}

impl fmt::Debug for RbcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, value) = match self {
            RbcMessage::Propose(v) => ("Propose", v),
            RbcMessage::Echo(v) => ("Echo", v),
            RbcMessage::Ready(v) => ("Ready", v),
        };
        write!(f, "{kind}({} bytes)", value.len())
    }
}

pub(crate) const TAG_PROPOSE: u8 = 0x10;
pub(crate) const TAG_ECHO: u8 = 0x20;
pub(crate) const TAG_READY: u8 = 0x30;

impl Wire for RbcMessage {
    fn encode(&self, buf: &mut BytesMut) {
        let (tag, value) = match self {
            RbcMessage::Propose(v) => (TAG_PROPOSE, v),
            RbcMessage::Echo(v) => (TAG_ECHO, v),
            RbcMessage::Ready(v) => (TAG_READY, v),
        };
        buf.put_u8(tag);
        codec::put_bytes(buf, value);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_PROPOSE => Ok(RbcMessage::Propose(codec::get_bytes(buf)?)),
            TAG_ECHO => Ok(RbcMessage::Echo(codec::get_bytes(buf)?)),
            TAG_READY => Ok(RbcMessage::Ready(codec::get_bytes(buf)?)),
            tag => Err(DecodeError::unknown_tag("rbc message", tag)),
        }
    }
}

/// Votes of one kind, every sender votes at most once
#[derive(Default)]
struct Votes {
    voted: BTreeSet<NodeId>,
    by_value: BTreeMap<Bytes, usize>,
}

impl Votes {
    /// Registers a vote, returns number of votes for the value, or `None` if the sender
    /// already voted
    fn add(&mut self, from: NodeId, value: &Bytes) -> Option<usize> {
        if !self.voted.insert(from) {
            return None;
        }
        let count = self.by_value.entry(value.clone()).or_insert(0);
        *count += 1;
        Some(*count)
    }
}

/// Reliable broadcast instance of a single proposer
pub struct Rbc {
    peers: Vec<NodeId>,
    me: NodeId,
    proposer: NodeId,
    f: usize,
    max_message_size: usize,
    predicate: Predicate,

    broadcast: bool,
    /// Proposal that didn't satisfy the predicate yet
    stashed: Option<Bytes>,
    echo_sent: bool,
    ready_sent: bool,
    echoes: Votes,
    readies: Votes,
    output: Option<Vec<u8>>,
}

impl Rbc {
    /// Constructs an instance of the broadcast of `proposer`
    pub fn new(
        peers: Vec<NodeId>,
        me: NodeId,
        proposer: NodeId,
        max_message_size: usize,
        predicate: Predicate,
    ) -> Self {
        let f = max_faulty(peers.len());
        Self {
            peers,
            me,
            proposer,
            f,
            max_message_size,
            predicate,
            broadcast: false,
            stashed: None,
            echo_sent: false,
            ready_sent: false,
            echoes: Votes::default(),
            readies: Votes::default(),
            output: None,
        }
    }

    /// Proposer of the broadcast
    pub fn proposer(&self) -> NodeId {
        self.proposer
    }

    fn n(&self) -> usize {
        self.peers.len()
    }

    fn broadcast_value(&mut self, value: Vec<u8>) -> Result<OutMessages<RbcMessage>, ProtocolError> {
        if self.me != self.proposer {
            return Err(ProtocolError::unexpected_input(
                "broadcast at a member that isn't the proposer",
            ));
        }
        if self.broadcast {
            return Err(ProtocolError::duplicate_input("broadcast value"));
        }
        if value.is_empty() || value.len() > self.max_message_size {
            return Err(ProtocolError::unexpected_input(
                "broadcast value is empty or too large",
            ));
        }
        self.broadcast = true;
        let mut out = OutMessages::new();
        out.broadcast(&self.peers, RbcMessage::Propose(Bytes::from(value)));
        Ok(out)
    }

    fn set_predicate(&mut self, predicate: Predicate) -> OutMessages<RbcMessage> {
        self.predicate = predicate;
        let mut out = OutMessages::new();
        if let Some(value) = self.stashed.take() {
            out.add_all(self.handle_propose(self.proposer, value));
        }
        if let Some(value) = self.deliverable() {
            self.deliver(value);
        }
        out
    }

    fn handle_propose(&mut self, from: NodeId, value: Bytes) -> OutMessages<RbcMessage> {
        if from != self.proposer {
            tracing::warn!(peer = %from, proposer = %self.proposer, "propose from non-proposer");
            return OutMessages::new();
        }
        if self.echo_sent {
            return OutMessages::new();
        }
        if !(self.predicate)(&value) {
            tracing::trace!(proposer = %self.proposer, "proposal postponed until predicate holds");
            self.stashed = Some(value);
            return OutMessages::new();
        }
        self.echo_sent = true;
        let mut out = OutMessages::new();
        out.broadcast(&self.peers, RbcMessage::Echo(value));
        out
    }

    fn handle_echo(&mut self, from: NodeId, value: Bytes) -> OutMessages<RbcMessage> {
        let Some(count) = self.echoes.add(from, &value) else {
            return OutMessages::new();
        };
        if 2 * count > self.n() + self.f {
            return self.send_ready(value);
        }
        OutMessages::new()
    }

    fn handle_ready(&mut self, from: NodeId, value: Bytes) -> OutMessages<RbcMessage> {
        let Some(count) = self.readies.add(from, &value) else {
            return OutMessages::new();
        };
        let out = if count > self.f {
            self.send_ready(value.clone())
        } else {
            OutMessages::new()
        };
        if count > 2 * self.f && self.output.is_none() && (self.predicate)(&value) {
            self.deliver(value);
        }
        out
    }

    fn send_ready(&mut self, value: Bytes) -> OutMessages<RbcMessage> {
        let mut out = OutMessages::new();
        if !self.ready_sent {
            self.ready_sent = true;
            out.broadcast(&self.peers, RbcMessage::Ready(value));
        }
        out
    }

    /// Value that has enough readies and satisfies the predicate
    fn deliverable(&self) -> Option<Bytes> {
        if self.output.is_some() {
            return None;
        }
        self.readies
            .by_value
            .iter()
            .find(|(value, count)| **count > 2 * self.f && (self.predicate)(value))
            .map(|(value, _)| value.clone())
    }

    fn deliver(&mut self, value: Bytes) {
        tracing::debug!(proposer = %self.proposer, len = value.len(), "rbc delivered");
        self.stashed = None;
        self.output = Some(value.to_vec());
    }
}

impl Automaton for Rbc {
    type Input = RbcInput;
    type Message = RbcMessage;
    type Output = Vec<u8>;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        match input {
            RbcInput::Broadcast(value) => self.broadcast_value(value),
            RbcInput::Predicate(predicate) => Ok(self.set_predicate(predicate)),
        }
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        let value = match &msg {
            RbcMessage::Propose(v) | RbcMessage::Echo(v) | RbcMessage::Ready(v) => v,
        };
        if value.is_empty() || value.len() > self.max_message_size {
            tracing::warn!(peer = %from, len = value.len(), "rbc value is empty or too large");
            return OutMessages::new();
        }
        if !self.peers.contains(&from) {
            tracing::warn!(peer = %from, "rbc message from unknown peer");
            return OutMessages::new();
        }
        match msg {
            RbcMessage::Propose(value) => self.handle_propose(from, value),
            RbcMessage::Echo(value) => self.handle_echo(from, value),
            RbcMessage::Ready(value) => self.handle_ready(from, value),
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        self.output.as_ref()
    }

    fn status(&self) -> String {
        format!(
            "{{RBC:proposer={},echo_sent={},ready_sent={},echoes={},readies={},stashed={},done={}}}",
            self.proposer,
            self.echo_sent,
            self.ready_sent,
            self.echoes.voted.len(),
            self.readies.voted.len(),
            self.stashed.is_some(),
            self.output.is_some(),
        )
    }
}
