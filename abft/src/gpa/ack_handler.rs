//! At-least-once delivery over lossy transport
//!
//! [`AckHandler`] wraps an automaton that assumes eventual delivery of every message. Outgoing
//! messages are grouped into per-peer batches numbered by a per-peer counter. A batch is kept
//! until the peer acknowledges it and is resent on [ticks](AckInput::Tick) while it stays
//! unacknowledged. Acknowledgements of received batches piggy-back on the next batch sent to
//! the same peer.
//!
//! Before the first batch is sent to a peer, nodes exchange `Reset` messages to agree on batch
//! numbering: the peer reports the latest batch id it has seen from us, and we continue from the
//! next one. Messages produced while the handshake is in progress are queued.
//!
//! Self-addressed messages are not expected here: wrap the nested automaton into
//! [`OwnHandler`](super::own_handler::OwnHandler) first.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{self, DecodeError, Wire};

use super::{Automaton, NodeId, OutMessages, ProtocolError};

/// Input of [`AckHandler`]
#[derive(Debug, Clone)]
pub enum AckInput<I> {
    /// Input of the nested automaton
    Nested(I),
    /// Periodic tick driving retransmission
    Tick(Instant),
}

/// Message of [`AckHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMessage<M> {
    /// Batch numbering handshake
    Reset {
        /// `false` for a request, `true` for a response
        response: bool,
        /// In response: the latest batch id received from the requester
        latest_id: u32,
    },
    /// Batch of nested messages
    Batch {
        /// Batch id, `None` for ack-only batches that don't need acknowledgement themselves
        id: Option<u32>,
        /// Nested messages
        msgs: Vec<M>,
        /// Ids of acknowledged batches
        acks: Vec<u32>,
    },
}

struct SentBatch<M> {
    msgs: Vec<M>,
    acks: Vec<u32>,
    /// Unset until the first tick after sending, so that a batch is never resent too early
    sent: Option<Instant>,
}

/// Adds acknowledgements and retransmission to the nested automaton
pub struct AckHandler<A: Automaton> {
    me: NodeId,
    nested: A,
    resend_period: Duration,
    now: Option<Instant>,

    initialized: BTreeSet<NodeId>,
    init_pending: BTreeMap<NodeId, Vec<A::Message>>,
    /// Next batch id for every peer
    counters: BTreeMap<NodeId, u32>,
    sent_unacked: BTreeMap<NodeId, BTreeMap<u32, SentBatch<A::Message>>>,
    /// Batch ids received from the peer, mapped to the id of our batch that acknowledged them
    recv_acks_in: BTreeMap<NodeId, BTreeMap<u32, Option<u32>>>,
}

impl<A: Automaton> AckHandler<A> {
    /// Wraps `nested` running on node `me`
    pub fn new(me: NodeId, nested: A, resend_period: Duration) -> Self {
        Self {
            me,
            nested,
            resend_period,
            now: None,
            initialized: BTreeSet::new(),
            init_pending: BTreeMap::new(),
            counters: BTreeMap::new(),
            sent_unacked: BTreeMap::new(),
            recv_acks_in: BTreeMap::new(),
        }
    }

    /// Nested automaton
    pub fn nested(&self) -> &A {
        &self.nested
    }

    /// Forgets everything about `peer`
    ///
    /// Stops resending messages to a peer that is known to be gone.
    pub fn dismiss_peer(&mut self, peer: &NodeId) {
        self.initialized.remove(peer);
        self.init_pending.remove(peer);
        self.counters.remove(peer);
        self.sent_unacked.remove(peer);
        self.recv_acks_in.remove(peer);
    }

    /// Delivers a message to the nested automaton bypassing acknowledgements
    pub fn nested_message(
        &mut self,
        from: NodeId,
        msg: A::Message,
    ) -> OutMessages<AckMessage<A::Message>> {
        let msgs = self.nested.message(from, msg);
        self.make_batches(msgs)
    }

    /// Calls the nested automaton directly, batching the messages it produces
    pub fn nested_call(
        &mut self,
        f: impl FnOnce(&mut A) -> OutMessages<A::Message>,
    ) -> OutMessages<AckMessage<A::Message>> {
        let msgs = f(&mut self.nested);
        self.make_batches(msgs)
    }

    fn handle_tick(&mut self, now: Instant) -> OutMessages<AckMessage<A::Message>> {
        self.now = Some(now);
        let mut resend = OutMessages::new();
        for (peer, batches) in &mut self.sent_unacked {
            for (id, batch) in batches.iter_mut() {
                match batch.sent {
                    None => batch.sent = Some(now),
                    Some(sent) if now.saturating_duration_since(sent) > self.resend_period => {
                        batch.sent = Some(now);
                        resend.add(
                            *peer,
                            AckMessage::Batch {
                                id: Some(*id),
                                msgs: batch.msgs.clone(),
                                acks: batch.acks.clone(),
                            },
                        );
                    }
                    Some(_) => {}
                }
            }
        }
        for peer in self.init_pending.keys() {
            resend.add(
                *peer,
                AckMessage::Reset {
                    response: false,
                    latest_id: 0,
                },
            );
        }
        resend
    }

    fn handle_reset(
        &mut self,
        from: NodeId,
        response: bool,
        latest_id: u32,
    ) -> OutMessages<AckMessage<A::Message>> {
        if !response {
            let latest_id = self
                .recv_acks_in
                .get(&from)
                .and_then(|received| received.keys().next_back().copied())
                .unwrap_or(0);
            let mut out = OutMessages::new();
            out.add(
                from,
                AckMessage::Reset {
                    response: true,
                    latest_id,
                },
            );
            return out;
        }
        if self.initialized.contains(&from) {
            return OutMessages::new();
        }
        self.counters.insert(from, latest_id.wrapping_add(1));
        self.initialized.insert(from);
        self.make_batches(OutMessages::new())
    }

    fn handle_batch(
        &mut self,
        from: NodeId,
        id: Option<u32>,
        msgs: Vec<A::Message>,
        acks: Vec<u32>,
    ) -> OutMessages<AckMessage<A::Message>> {
        if let Some(unacked) = self.sent_unacked.get_mut(&from) {
            for acked in &acks {
                unacked.remove(acked);
            }
        }
        let Some(id) = id else {
            return OutMessages::new();
        };

        let received = self.recv_acks_in.entry(from).or_default();
        match received.get(&id) {
            Some(None) => {
                // Received, but not acknowledged yet
                let mut out = OutMessages::new();
                out.add(
                    from,
                    AckMessage::Batch {
                        id: None,
                        msgs: vec![],
                        acks: vec![id],
                    },
                );
                return out;
            }
            Some(Some(acked_in)) => {
                // The ack got lost, resend the batch that carried it
                let acked_in = *acked_in;
                let mut out = OutMessages::new();
                if let Some(batch) = self
                    .sent_unacked
                    .get_mut(&from)
                    .and_then(|unacked| unacked.get_mut(&acked_in))
                {
                    batch.sent = self.now;
                    out.add(
                        from,
                        AckMessage::Batch {
                            id: Some(acked_in),
                            msgs: batch.msgs.clone(),
                            acks: batch.acks.clone(),
                        },
                    );
                }
                return out;
            }
            None => {}
        }

        let mut nested_msgs = OutMessages::new();
        for msg in msgs {
            nested_msgs.add_all(self.nested.message(from, msg));
        }
        self.recv_acks_in.entry(from).or_default().insert(id, None);
        self.make_batches(nested_msgs)
    }

    fn make_batches(
        &mut self,
        msgs: OutMessages<A::Message>,
    ) -> OutMessages<AckMessage<A::Message>> {
        let mut grouped: BTreeMap<NodeId, Vec<A::Message>> = BTreeMap::new();
        for out in msgs {
            debug_assert!(out.to != self.me, "self-addressed message reached ack handler");
            grouped.entry(out.to).or_default().push(out.msg);
        }
        for (peer, pending) in std::mem::take(&mut self.init_pending) {
            grouped.entry(peer).or_default().extend(pending);
        }

        let mut batches = OutMessages::new();
        for (peer, msgs) in grouped {
            if !self.initialized.contains(&peer) {
                self.init_pending.entry(peer).or_default().extend(msgs);
                batches.add(
                    peer,
                    AckMessage::Reset {
                        response: false,
                        latest_id: 0,
                    },
                );
                continue;
            }
            let counter = self.counters.entry(peer).or_insert(0);
            let id = *counter;
            *counter = counter.wrapping_add(1);

            let mut acks = vec![];
            if let Some(received) = self.recv_acks_in.get_mut(&peer) {
                for (received_id, acked_in) in received.iter_mut() {
                    if acked_in.is_none() {
                        acks.push(*received_id);
                        *acked_in = Some(id);
                    }
                }
            }

            self.sent_unacked.entry(peer).or_default().insert(
                id,
                SentBatch {
                    msgs: msgs.clone(),
                    acks: acks.clone(),
                    sent: None,
                },
            );
            batches.add(
                peer,
                AckMessage::Batch {
                    id: Some(id),
                    msgs,
                    acks,
                },
            );
        }
        batches
    }
}

impl<A: Automaton> Automaton for AckHandler<A> {
    type Input = AckInput<A::Input>;
    type Message = AckMessage<A::Message>;
    type Output = A::Output;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        match input {
            AckInput::Tick(now) => Ok(self.handle_tick(now)),
            AckInput::Nested(input) => {
                let msgs = self.nested.input(input)?;
                Ok(self.make_batches(msgs))
            }
        }
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        match msg {
            AckMessage::Reset {
                response,
                latest_id,
            } => self.handle_reset(from, response, latest_id),
            AckMessage::Batch { id, msgs, acks } => self.handle_batch(from, id, msgs, acks),
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        self.nested.output()
    }

    fn status(&self) -> String {
        format!("{{ACK:{}}}", self.nested.status())
    }
}

const TAG_RESET: u8 = 0;
const TAG_BATCH: u8 = 1;

impl<M: Wire> Wire for AckMessage<M> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AckMessage::Reset {
                response,
                latest_id,
            } => {
                buf.put_u8(TAG_RESET);
                buf.put_u8(u8::from(*response));
                buf.put_u32(*latest_id);
            }
            AckMessage::Batch { id, msgs, acks } => {
                buf.put_u8(TAG_BATCH);
                match id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_u32(*id);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u16(msgs.len() as u16);
                for msg in msgs {
                    msg.encode(buf);
                }
                buf.put_u16(acks.len() as u16);
                for ack in acks {
                    buf.put_u32(*ack);
                }
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_RESET => Ok(AckMessage::Reset {
                response: codec::get_bool(buf)?,
                latest_id: codec::get_u32(buf)?,
            }),
            TAG_BATCH => {
                let id = if codec::get_bool(buf)? {
                    Some(codec::get_u32(buf)?)
                } else {
                    None
                };
                let msgs_count = codec::get_u16(buf)?;
                let msgs = (0..msgs_count)
                    .map(|_| M::decode(buf))
                    .collect::<Result<Vec<_>, _>>()?;
                let acks_count = codec::get_u16(buf)?;
                let acks = (0..acks_count)
                    .map(|_| codec::get_u32(buf))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(AckMessage::Batch { id, msgs, acks })
            }
            tag => Err(DecodeError::unknown_tag("ack handler message", tag)),
        }
    }
}
