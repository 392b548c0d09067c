//! Common subset session with explicit redelivery
//!
//! Binary agreement assumes that every message is eventually delivered, while the transport
//! may lose them. [`CommonSubset`] groups messages of [`Acs`] into [batches](MsgBatch), keeps
//! every batch until the recipient acknowledges it, and resends it once it stays
//! unacknowledged for twice the resend period. Received batches are acknowledged right away:
//! acks piggy-back on batches going to the same peer, or are sent in an [ack-only
//! batch](batch::ACK_ONLY).
//!
//! After the instance [terminated](Acs::is_terminated), protocol messages are not sent
//! anymore, but retransmissions of peers are still acknowledged, so that they stop resending.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    gpa::{index_of, own_handler::OwnHandler, Automaton, NodeId, OutMessages, ProtocolError},
    Ciphersuite, DkShare, PeerIndex,
};

use super::{
    batch::{self, MsgBatch},
    Acs, AcsMessage, AcsOutput,
};

struct SentBatch<C: Ciphersuite> {
    batch: MsgBatch<C>,
    sent_at: Instant,
}

/// Single common subset session
pub struct CommonSubset<C: Ciphersuite> {
    session_id: u64,
    state_index: u32,
    me_index: PeerIndex,
    peers: Vec<NodeId>,
    acs: OwnHandler<Acs<C>>,
    resend_period: Duration,

    batch_counter: u32,
    /// Sent batches that aren't acknowledged yet
    missing_acks: BTreeMap<u32, SentBatch<C>>,
    /// Per peer: ids of received batches mapped onto id of the batch that acknowledged them
    recv_batches: BTreeMap<PeerIndex, BTreeMap<u32, u32>>,
    /// Per peer: ids of received batches to be acknowledged
    pending_acks: BTreeMap<PeerIndex, Vec<u32>>,
}

impl<C: Ciphersuite> CommonSubset<C> {
    /// Constructs a session
    ///
    /// `peers` must be ordered the same way as public shares in `dk`.
    pub fn new(
        session_id: u64,
        state_index: u32,
        peers: Vec<NodeId>,
        dk: Arc<DkShare<C::Curve>>,
        resend_period: Duration,
        max_message_size: usize,
    ) -> Result<Self, ProtocolError> {
        let me_index = dk.index();
        let me = *peers
            .get(usize::from(me_index))
            .ok_or(ProtocolError::invalid_config("local node is not among peers"))?;
        let mut salt = session_id.to_be_bytes().to_vec();
        salt.extend_from_slice(&state_index.to_be_bytes());
        let acs = Acs::new(peers.clone(), me, dk, &salt, max_message_size)?;
        Ok(Self {
            session_id,
            state_index,
            me_index,
            peers,
            acs: OwnHandler::new(me, acs),
            resend_period,
            batch_counter: 0,
            missing_acks: BTreeMap::new(),
            recv_batches: BTreeMap::new(),
            pending_acks: BTreeMap::new(),
        })
    }

    /// Session id
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// State index of the session
    pub fn state_index(&self) -> u32 {
        self.state_index
    }

    /// Proposes own value
    pub fn input(&mut self, value: Vec<u8>, now: Instant) -> Result<Vec<MsgBatch<C>>, ProtocolError> {
        let msgs = self.acs.input(value)?;
        Ok(self.make_batches(msgs, now))
    }

    /// Handles a batch received from a peer
    ///
    /// Batch is expected to be addressed to this session and to the local node.
    pub fn receive(&mut self, batch: MsgBatch<C>, now: Instant) -> Vec<MsgBatch<C>> {
        let from = batch.src;
        let Some(from_id) = self.peers.get(usize::from(from)).copied() else {
            tracing::warn!(from, "batch from unknown peer");
            return vec![];
        };

        for ack in &batch.acks {
            if self
                .missing_acks
                .get(ack)
                .is_some_and(|sent| sent.batch.dst == from)
            {
                self.missing_acks.remove(ack);
            }
        }
        if batch.is_ack_only() {
            return vec![];
        }

        let received = self.recv_batches.entry(from).or_default();
        if let Some(acked_in) = received.get(&batch.id).copied() {
            // Duplicate: our ack got lost. Resend the batch that carried it if it's still
            // around, otherwise acknowledge once again.
            tracing::trace!(from, id = batch.id, "duplicate batch");
            if let Some(sent) = self.missing_acks.get_mut(&acked_in) {
                sent.sent_at = now;
                return vec![sent.batch.clone()];
            }
            return vec![self.ack_only(from, vec![batch.id])];
        }
        received.insert(batch.id, batch::ACK_ONLY);
        self.pending_acks.entry(from).or_default().push(batch.id);

        let mut out = OutMessages::new();
        for msg in batch.msgs {
            out.add_all(self.acs.message(from_id, msg));
        }
        self.make_batches(out, now)
    }

    /// Resends batches that stay unacknowledged for too long
    pub fn tick(&mut self, now: Instant) -> Vec<MsgBatch<C>> {
        let resend_after = self.resend_period * 2;
        let mut resend = vec![];
        for sent in self.missing_acks.values_mut() {
            if now.saturating_duration_since(sent.sent_at) >= resend_after {
                sent.sent_at = now;
                resend.push(sent.batch.clone());
            }
        }
        if !resend.is_empty() {
            tracing::trace!(
                session_id = self.session_id,
                state_index = self.state_index,
                n = resend.len(),
                "resending unacknowledged batches"
            );
        }
        resend
    }

    /// Decided proposals
    pub fn output(&self) -> Option<&AcsOutput> {
        self.acs.output()
    }

    /// Indicates that the session doesn't need to send protocol messages anymore
    pub fn is_terminated(&self) -> bool {
        self.acs.nested().is_terminated()
    }

    /// Number of sent batches that are not acknowledged yet
    pub fn unacknowledged(&self) -> usize {
        self.missing_acks.len()
    }

    /// Human-readable status
    pub fn status(&self) -> String {
        format!(
            "{{CS:session={},state_index={},unacked={},{}}}",
            self.session_id,
            self.state_index,
            self.missing_acks.len(),
            self.acs.status()
        )
    }

    fn next_batch_id(&mut self) -> u32 {
        self.batch_counter = self.batch_counter.wrapping_add(1);
        if self.batch_counter == batch::ACK_ONLY {
            self.batch_counter = 1;
        }
        self.batch_counter
    }

    fn ack_only(&self, to: PeerIndex, acks: Vec<u32>) -> MsgBatch<C> {
        MsgBatch {
            session_id: self.session_id,
            state_index: self.state_index,
            id: batch::ACK_ONLY,
            src: self.me_index,
            dst: to,
            msgs: vec![],
            acks,
        }
    }

    fn make_batches(&mut self, msgs: OutMessages<AcsMessage<C>>, now: Instant) -> Vec<MsgBatch<C>> {
        let mut grouped: BTreeMap<PeerIndex, Vec<AcsMessage<C>>> = BTreeMap::new();
        if self.is_terminated() {
            if !msgs.is_empty() {
                tracing::trace!(n = msgs.len(), "session terminated, protocol messages dropped");
            }
        } else {
            for outgoing in msgs {
                match index_of(&self.peers, &outgoing.to) {
                    Some(to) => grouped.entry(to).or_default().push(outgoing.msg),
                    None => tracing::error!(to = %outgoing.to, "message to unknown peer"),
                }
            }
        }

        let mut batches = vec![];
        for (to, msgs) in grouped {
            let id = self.next_batch_id();
            let acks = self.pending_acks.remove(&to).unwrap_or_default();
            if let Some(received) = self.recv_batches.get_mut(&to) {
                for ack in &acks {
                    received.insert(*ack, id);
                }
            }
            let batch = MsgBatch {
                session_id: self.session_id,
                state_index: self.state_index,
                id,
                src: self.me_index,
                dst: to,
                msgs,
                acks,
            };
            self.missing_acks.insert(
                id,
                SentBatch {
                    batch: batch.clone(),
                    sent_at: now,
                },
            );
            batches.push(batch);
        }

        // Acks that didn't fit into any batch
        for (to, acks) in std::mem::take(&mut self.pending_acks) {
            if !acks.is_empty() {
                batches.push(self.ack_only(to, acks));
            }
        }
        batches
    }
}
