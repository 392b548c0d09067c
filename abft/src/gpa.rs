//! Protocol automaton framework
//!
//! Every protocol in this crate is an [`Automaton`]: a deterministic state machine that reacts to
//! local [inputs](Automaton::input) and network [messages](Automaton::message) by returning
//! [messages to be sent](OutMessages), and that eventually exposes an [output](Automaton::output).
//! Automata never do I/O and never look at the clock, time only gets in as an explicit input
//! (e.g. [tick of acknowledgement handler](ack_handler::AckInput::Tick)). Given the same sequence
//! of inputs and messages, an automaton always produces the same outputs.
//!
//! Automata compose:
//! * [`wrapper`] routes messages of nested automata by `(subsystem, index)`
//! * [`own_handler::OwnHandler`] loops back messages addressed to the local node
//! * [`ack_handler::AckHandler`] adds at-least-once delivery over lossy transport

use core::fmt;

pub mod ack_handler;
pub mod own_handler;
pub mod wrapper;

/// Identifier of a committee member
///
/// Opaque 32 bytes, usually [derived](crate::key::NodeIdentity::node_id) from the member's public
/// key. Node ids are totally ordered, the order carries no meaning except for being stable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Constructs node id from raw bytes
    pub const fn new(id: [u8; 32]) -> Self {
        Self(id)
    }
    /// Raw bytes of the id
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// Message addressed to a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing<M> {
    /// Recipient
    pub to: NodeId,
    /// Message
    pub msg: M,
}

/// Messages produced by a single call to an automaton
///
/// Caller is expected to consume it exactly once, performing the actual sends.
#[derive(Debug, Clone)]
pub struct OutMessages<M>(Vec<Outgoing<M>>);

impl<M> OutMessages<M> {
    /// No messages
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds a message to `to`
    pub fn add(&mut self, to: NodeId, msg: M) -> &mut Self {
        self.0.push(Outgoing { to, msg });
        self
    }

    /// Appends all messages from `other`
    pub fn add_all(&mut self, other: OutMessages<M>) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    /// Sends a copy of `msg` to every node in `peers`
    pub fn broadcast<'a>(&mut self, peers: impl IntoIterator<Item = &'a NodeId>, msg: M) -> &mut Self
    where
        M: Clone,
    {
        self.0
            .extend(peers.into_iter().map(|to| Outgoing { to: *to, msg: msg.clone() }));
        self
    }

    /// Converts every message, keeping recipients
    pub fn map<P>(self, mut f: impl FnMut(M) -> P) -> OutMessages<P> {
        OutMessages(
            self.0
                .into_iter()
                .map(|Outgoing { to, msg }| Outgoing { to, msg: f(msg) })
                .collect(),
        )
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Indicates that there are no messages
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over messages
    pub fn iter(&self) -> core::slice::Iter<'_, Outgoing<M>> {
        self.0.iter()
    }
}

impl<M> Default for OutMessages<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> IntoIterator for OutMessages<M> {
    type Item = Outgoing<M>;
    type IntoIter = std::vec::IntoIter<Outgoing<M>>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<M> FromIterator<Outgoing<M>> for OutMessages<M> {
    fn from_iter<I: IntoIterator<Item = Outgoing<M>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<M> Extend<Outgoing<M>> for OutMessages<M> {
    fn extend<I: IntoIterator<Item = Outgoing<M>>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// Protocol state machine
///
/// ## Contract
/// * Calls must be serialized by the caller, automata do no internal locking
/// * Output is set once: after [`output`](Self::output) returned `Some(v)`, it keeps
///   returning the same `v`
/// * Network messages are never trusted: malformed or unexpected messages are logged and
///   dropped internally, [`message`](Self::message) doesn't fail
/// * Local inputs are trusted: inconsistent inputs are reported via [`ProtocolError`]
pub trait Automaton {
    /// Local input
    type Input;
    /// Network message
    type Message: Clone + fmt::Debug;
    /// Protocol output
    type Output;

    /// Handles local input
    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError>;
    /// Handles a message received from `from`
    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message>;
    /// Returns protocol output, if it's already available
    fn output(&self) -> Option<&Self::Output>;
    /// Human-readable status for debugging stuck instances
    fn status(&self) -> String;
}

/// Position of `id` in the ordered member list
pub fn index_of(peers: &[NodeId], id: &NodeId) -> Option<u16> {
    peers
        .iter()
        .position(|p| p == id)
        .and_then(|i| u16::try_from(i).ok())
}

/// Local input was rejected by the automaton
#[derive(Debug)]
pub struct ProtocolError(Reason);

#[derive(Debug)]
enum Reason {
    Inconsistency(String),
    DuplicateInput(&'static str),
    UnexpectedInput(&'static str),
    InvalidConfig(&'static str),
    Bug(Bug),
}

/// Error indicating a bug in this crate
#[derive(Debug)]
pub(crate) enum Bug {
    OwnIndexOutOfRange,
    EvalPointMissing,
    Interpolation,
    AggregatedSignatureInvalid,
}

impl ProtocolError {
    /// Externally decided data doesn't match committee parameters
    ///
    /// Indicates misbehaving orchestration layer, the instance can't make progress.
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self(Reason::Inconsistency(msg.into()))
    }
    /// Input was already provided
    pub fn duplicate_input(what: &'static str) -> Self {
        Self(Reason::DuplicateInput(what))
    }
    /// Input is not expected in the current state
    pub fn unexpected_input(what: &'static str) -> Self {
        Self(Reason::UnexpectedInput(what))
    }
    /// Automaton can't be constructed with given parameters
    pub fn invalid_config(what: &'static str) -> Self {
        Self(Reason::InvalidConfig(what))
    }

    /// Indicates that the error is fatal inconsistency of externally decided data
    pub fn is_inconsistency(&self) -> bool {
        matches!(self.0, Reason::Inconsistency(_))
    }
    /// Indicates that the input was rejected as a duplicate
    pub fn is_duplicate(&self) -> bool {
        matches!(self.0, Reason::DuplicateInput(_))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::Inconsistency(msg) => write!(f, "inconsistent agreement result: {msg}"),
            Reason::DuplicateInput(what) => write!(f, "{what} was already provided"),
            Reason::UnexpectedInput(what) => write!(f, "unexpected input: {what}"),
            Reason::InvalidConfig(what) => write!(f, "invalid config: {what}"),
            Reason::Bug(_) => f.write_str("bug occurred"),
        }
    }
}

impl fmt::Display for Bug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bug::OwnIndexOutOfRange => f.write_str("own index is out of range"),
            Bug::EvalPointMissing => f.write_str("evaluation point of a member is missing"),
            Bug::Interpolation => f.write_str("interpolation failed"),
            Bug::AggregatedSignatureInvalid => {
                f.write_str("aggregated signature doesn't verify against the public key")
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            Reason::Inconsistency(_)
            | Reason::DuplicateInput(_)
            | Reason::UnexpectedInput(_)
            | Reason::InvalidConfig(_) => None,
            Reason::Bug(bug) => Some(bug),
        }
    }
}

impl std::error::Error for Bug {}

impl From<Bug> for ProtocolError {
    fn from(err: Bug) -> Self {
        ProtocolError(Reason::Bug(err))
    }
}
