//! DSS node
//!
//! Runs [`Dss`] instances over a [`Transport`]. Instances are grouped into named series (one
//! per signing context, e.g. a chain), and are indexed within a series by a growing state
//! index, so that nonces can be generated ahead of the message that needs to be signed.
//!
//! Every series keeps its instances in an [`InstanceWindow`]. Messages addressed to an instance
//! that isn't started locally yet are buffered in its window slot and replayed once the
//! instance is started. Starting an instance moves the window of its series forward: older
//! instances are closed and buffers of never started ones are dropped.
//!
//! Every instance runs in its own task behind [`AckHandler`], ticked every
//! [`tick_period`](DssConfig::tick_period) to resend unacknowledged messages.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec::{self, DecodeError, Wire},
    config::DssConfig,
    gpa::{
        ack_handler::{AckHandler, AckInput, AckMessage},
        index_of,
        own_handler::OwnHandler,
        Automaton, NodeId, OutMessages, ProtocolError,
    },
    key::{Committee, NodeIdentity},
    net::Transport,
    signature::Signature,
    window::{InstanceWindow, OutOfWindow},
    Ciphersuite, DkShare, PeerIndex,
};

use super::{Dss, DssInput, DssMessage};

/// Callback receiving nonce dealings proposed by the local member
pub type ProposalCallback = Box<dyn FnOnce(Vec<PeerIndex>) + Send + 'static>;
/// Callback receiving the aggregated signature
pub type SignatureCallback<C> = Box<dyn FnOnce(Signature<C>) + Send + 'static>;

type Handler<C> = AckHandler<OwnHandler<Dss<C>>>;
type HandlerMessage<C> = AckMessage<DssMessage<C>>;

/// DSS node
pub struct DssNode<C: Ciphersuite, T: Transport> {
    inner: Arc<Inner<C, T>>,
}

impl<C: Ciphersuite, T: Transport> Clone for DssNode<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: Ciphersuite, T: Transport> {
    identity: NodeIdentity<C>,
    committee: Committee<C>,
    config: DssConfig,
    transport: T,
    state: Mutex<State<C>>,
}

struct State<C: Ciphersuite> {
    closed: bool,
    rng: ChaCha20Rng,
    series: BTreeMap<Vec<u8>, InstanceWindow<(), Slot<C>>>,
}

enum Slot<C: Ciphersuite> {
    /// Messages received before the instance was started
    Pending(Vec<(NodeId, HandlerMessage<C>)>),
    Running(mpsc::UnboundedSender<Event<C>>),
}

enum Event<C: Ciphersuite> {
    Message {
        from: NodeId,
        msg: HandlerMessage<C>,
    },
    Decided {
        proposals: Vec<Vec<PeerIndex>>,
        message: Vec<u8>,
    },
    Status(oneshot::Sender<String>),
}

/// DSS message along with the instance it belongs to
struct Envelope<C: Ciphersuite> {
    key: Bytes,
    index: u32,
    msg: HandlerMessage<C>,
}

impl<C: Ciphersuite> Wire for Envelope<C> {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_bytes(buf, &self.key);
        buf.put_u32(self.index);
        self.msg.encode(buf);
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            key: codec::get_bytes(buf)?,
            index: codec::get_u32(buf)?,
            msg: AckMessage::decode(buf)?,
        })
    }
}

impl<C: Ciphersuite, T: Transport> DssNode<C, T> {
    /// Constructs a node
    ///
    /// `rng` seeds nonce dealings of all instances started by this node. Must be called within
    /// tokio runtime context.
    pub fn new(
        identity: NodeIdentity<C>,
        committee: Committee<C>,
        transport: T,
        config: DssConfig,
        rng: ChaCha20Rng,
    ) -> Result<Self, NodeError> {
        config.validate().map_err(Reason::InvalidConfig)?;
        if committee.index_of(&identity.node_id()).is_none() {
            return Err(Reason::NotInCommittee.into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                committee,
                config,
                transport,
                state: Mutex::new(State {
                    closed: false,
                    rng,
                    series: BTreeMap::new(),
                }),
            }),
        })
    }

    /// Starts instance `index` of series `key`
    ///
    /// `on_proposal` is called once the local nonce proposal is known: the caller is expected
    /// to agree on proposals and then call [`decided_index_proposals`](Self::decided_index_proposals).
    /// `on_signature` is called with the aggregated signature. Callbacks are never called if
    /// the instance is closed before.
    pub fn start(
        &self,
        key: &[u8],
        index: u32,
        dk: Arc<DkShare<C::Curve>>,
        on_proposal: impl FnOnce(Vec<PeerIndex>) + Send + 'static,
        on_signature: impl FnOnce(Signature<C>) + Send + 'static,
    ) -> Result<(), NodeError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Reason::Closed.into());
        }
        let mut seed = [0u8; 32];
        state.rng.fill_bytes(&mut seed);
        let rng = ChaCha20Rng::from_seed(seed);

        let dss = Dss::new(
            self.inner.committee.clone(),
            self.inner.identity.clone(),
            dk,
            rng,
        )
        .map_err(Reason::Protocol)?;
        let me = self.inner.identity.node_id();
        let config = &self.inner.config;
        let handler = AckHandler::new(me, OwnHandler::new(me, dss), config.resend_period);

        let series = state.series.entry(key.to_vec()).or_insert_with(|| {
            InstanceWindow::new(config.past_instances, config.future_instances)
        });
        let reaped = series.advance(index);
        for ((reaped_index, ()), _) in &reaped {
            tracing::debug!(series = %hex::encode(key), index = reaped_index, "instance closed");
        }
        let slot = series
            .get_or_try_insert_with(index, (), || Slot::Pending(vec![]))
            .map_err(Reason::OutOfWindow)?;
        let buffered = match slot {
            Slot::Running(_) => return Err(Reason::Duplicate { index }.into()),
            Slot::Pending(buffered) => std::mem::take(buffered),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        for (from, msg) in buffered {
            let _ = tx.send(Event::Message { from, msg });
        }
        *slot = Slot::Running(tx);
        tracing::debug!(series = %hex::encode(key), index, "instance started");

        tokio::spawn(run_instance(
            self.inner.clone(),
            Bytes::copy_from_slice(key),
            index,
            handler,
            rx,
            Box::new(on_proposal),
            Box::new(on_signature),
        ));
        Ok(())
    }

    /// Inputs decided proposals and the message to sign into instance `index` of series `key`
    pub fn decided_index_proposals(
        &self,
        key: &[u8],
        index: u32,
        proposals: Vec<Vec<PeerIndex>>,
        message: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.send_event(key, index, Event::Decided { proposals, message })
    }

    /// Human-readable status of instance `index` of series `key`
    pub async fn status_string(&self, key: &[u8], index: u32) -> Result<String, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send_event(key, index, Event::Status(tx))?;
        rx.await.map_err(|_| Reason::Closed.into())
    }

    /// Handles a message received from member `from`
    ///
    /// Malformed messages and messages addressed to instances out of the window are logged
    /// and dropped.
    pub fn receive(&self, from: PeerIndex, payload: Bytes) {
        let Some(from_id) = self.inner.committee.members().get(usize::from(from)).copied() else {
            tracing::warn!(from, "dss message from unknown member");
            return;
        };
        let envelope = match Envelope::<C>::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(peer = %from_id, error = %err, "dropping malformed dss message");
                return;
            }
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        let config = &self.inner.config;
        let series = state
            .series
            .entry(envelope.key.to_vec())
            .or_insert_with(|| InstanceWindow::new(config.past_instances, config.future_instances));
        match series.get_or_try_insert_with(envelope.index, (), || Slot::Pending(vec![])) {
            Ok(Slot::Running(inbox)) => {
                let _ = inbox.send(Event::Message {
                    from: from_id,
                    msg: envelope.msg,
                });
            }
            Ok(Slot::Pending(buffered)) => buffered.push((from_id, envelope.msg)),
            Err(err) => {
                tracing::debug!(peer = %from_id, error = %err, "dss message dropped");
            }
        }
    }

    /// Closes all instances of all series
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let series = std::mem::take(&mut state.series);
        tracing::debug!(series = series.len(), "dss node closed");
    }

    /// Number of running instances across all series
    pub fn active_instances(&self) -> usize {
        self.inner
            .state
            .lock()
            .series
            .values()
            .flat_map(|window| window.iter())
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .count()
    }

    fn send_event(&self, key: &[u8], index: u32, event: Event<C>) -> Result<(), NodeError> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(Reason::Closed.into());
        }
        match state.series.get(key).and_then(|s| s.get(index, &())) {
            Some(Slot::Running(inbox)) => inbox.send(event).map_err(|_| Reason::Closed.into()),
            _ => Err(Reason::UnknownInstance { index }.into()),
        }
    }
}

async fn run_instance<C: Ciphersuite, T: Transport>(
    inner: Arc<Inner<C, T>>,
    key: Bytes,
    index: u32,
    mut handler: Handler<C>,
    mut inbox: mpsc::UnboundedReceiver<Event<C>>,
    on_proposal: ProposalCallback,
    on_signature: SignatureCallback<C>,
) {
    let mut on_proposal = Some(on_proposal);
    let mut on_signature = Some(on_signature);
    let mut ticker = tokio::time::interval(inner.config.tick_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut out = match handler.input(AckInput::Nested(DssInput::Start)) {
        Ok(out) => out,
        Err(err) => {
            tracing::error!(index, error = %err, "dss instance failed to start");
            return;
        }
    };
    loop {
        send_all(&inner, &key, index, out);
        if let Some(output) = handler.output() {
            if let Some(indexes) = &output.proposed_indexes {
                if let Some(cb) = on_proposal.take() {
                    cb(indexes.clone());
                }
            }
            if let Some(signature) = output.signature {
                if let Some(cb) = on_signature.take() {
                    cb(signature);
                }
            }
        }

        out = tokio::select! {
            event = inbox.recv() => match event {
                None => break,
                Some(Event::Message { from, msg }) => handler.message(from, msg),
                Some(Event::Decided { proposals, message }) => {
                    match handler.input(AckInput::Nested(DssInput::Decided { proposals, message })) {
                        Ok(out) => out,
                        Err(err) if err.is_inconsistency() => {
                            tracing::error!(index, error = %err, "decided proposals are inconsistent");
                            OutMessages::new()
                        }
                        Err(err) => {
                            tracing::warn!(index, error = %err, "decision rejected");
                            OutMessages::new()
                        }
                    }
                }
                Some(Event::Status(reply)) => {
                    let _ = reply.send(handler.status());
                    OutMessages::new()
                }
            },
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now().into_std();
                match handler.input(AckInput::Tick(now)) {
                    Ok(out) => out,
                    Err(err) => {
                        tracing::error!(index, error = %err, "tick failed");
                        OutMessages::new()
                    }
                }
            }
        };
    }
    tracing::trace!(index, status = %handler.status(), "dss instance finished");
}

fn send_all<C: Ciphersuite, T: Transport>(
    inner: &Inner<C, T>,
    key: &Bytes,
    index: u32,
    msgs: OutMessages<HandlerMessage<C>>,
) {
    for outgoing in msgs {
        let Some(to) = index_of(inner.committee.members(), &outgoing.to) else {
            tracing::error!(to = %outgoing.to, "message to unknown peer");
            continue;
        };
        let envelope = Envelope {
            key: key.clone(),
            index,
            msg: outgoing.msg,
        };
        inner.transport.send(to, envelope.to_bytes());
    }
}

/// DSS node error
#[derive(Debug)]
pub struct NodeError(Reason);

#[derive(Debug)]
enum Reason {
    Duplicate { index: u32 },
    UnknownInstance { index: u32 },
    OutOfWindow(OutOfWindow),
    Closed,
    NotInCommittee,
    InvalidConfig(crate::config::InvalidConfig),
    Protocol(ProtocolError),
}

impl NodeError {
    /// Indicates that the instance was already started
    pub fn is_duplicate(&self) -> bool {
        matches!(self.0, Reason::Duplicate { .. })
    }
    /// Indicates that the instance isn't running
    pub fn is_unknown_instance(&self) -> bool {
        matches!(self.0, Reason::UnknownInstance { .. })
    }
    /// Indicates that the instance is out of the window of its series
    pub fn is_out_of_window(&self) -> bool {
        matches!(self.0, Reason::OutOfWindow(_))
    }
}

impl From<Reason> for NodeError {
    fn from(err: Reason) -> Self {
        Self(err)
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::Duplicate { index } => write!(f, "instance {index} was already started"),
            Reason::UnknownInstance { index } => write!(f, "instance {index} is not running"),
            Reason::OutOfWindow(_) => f.write_str("instance is out of the window"),
            Reason::Closed => f.write_str("node is closed"),
            Reason::NotInCommittee => f.write_str("local node is not in the committee"),
            Reason::InvalidConfig(_) => f.write_str("invalid config"),
            Reason::Protocol(_) => f.write_str("instance cannot be constructed"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            Reason::Duplicate { .. }
            | Reason::UnknownInstance { .. }
            | Reason::Closed
            | Reason::NotInCommittee => None,
            Reason::OutOfWindow(err) => Some(err),
            Reason::InvalidConfig(err) => Some(err),
            Reason::Protocol(err) => Some(err),
        }
    }
}
