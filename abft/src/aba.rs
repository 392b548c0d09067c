//! Asynchronous binary agreement
//!
//! Signature-free binary agreement of Mostéfaoui, Moumen and Raynal, with [common coin] to
//! break symmetry. Every round:
//! 1. Members broadcast `BVAL(r, est)`. A value received from $f+1$ members is relayed, a value
//!    received from $2f+1$ members joins `bin_values`.
//! 2. Once `bin_values` is not empty, members broadcast `AUX(r, b)` for the first value in it.
//! 3. Once $n-f$ `AUX` messages carry values from `bin_values`, the round coin is released.
//!    If all those values equal $b$ and the coin equals $b$, $b$ is decided. The next round
//!    starts with $b$ if all values were $b$, or with the coin otherwise.
//!
//! Deciding members announce it with `DONE(b)`: $f+1$ of them are enough for anyone to adopt
//! the decision, and once $n-f$ announced it the instance [terminates](Aba::is_terminated).
//!
//! [common coin]: crate::coin

use core::fmt;
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{self, DecodeError, Wire},
    coin::{CoinInput, CoinMessage, CommonCoin},
    config::CoinConfig,
    dleq,
    gpa::{Automaton, NodeId, OutMessages, ProtocolError},
    key::max_faulty,
    Ciphersuite, DkShare,
};

/// Messages addressed to rounds further ahead are dropped
pub const MAX_ROUNDS_AHEAD: u16 = 10;

/// Message of [`Aba`]
#[derive(Clone, PartialEq, Eq)]
pub enum AbaMessage<C: Ciphersuite> {
    /// Binary value broadcast
    Bval {
        /// Round
        round: u16,
        /// Value
        value: bool,
    },
    /// Auxiliary value
    Aux {
        /// Round
        round: u16,
        /// Value
        value: bool,
    },
    /// Sender decided
    Done {
        /// Round of the decision
        round: u16,
        /// Decided value
        value: bool,
    },
    /// Coin message of the round
    Coin {
        /// Round
        round: u16,
        /// Coin message
        msg: CoinMessage<C>,
    },
}

impl<C: Ciphersuite> AbaMessage<C> {
    fn round(&self) -> u16 {
        match self {
            AbaMessage::Bval { round, .. }
            | AbaMessage::Aux { round, .. }
            | AbaMessage::Done { round, .. }
            | AbaMessage::Coin { round, .. } => *round,
        }
    }
}

impl<C: Ciphersuite> fmt::Debug for AbaMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbaMessage::Bval { round, value } => write!(f, "Bval({round}, {value})"),
            AbaMessage::Aux { round, value } => write!(f, "Aux({round}, {value})"),
            AbaMessage::Done { round, value } => write!(f, "Done({round}, {value})"),
            AbaMessage::Coin { round, .. } => write!(f, "Coin({round})"),
        }
    }
}

pub(crate) const TAG_BVAL: u8 = 0x40;
pub(crate) const TAG_AUX: u8 = 0x50;
pub(crate) const TAG_COIN: u8 = 0x60;
pub(crate) const TAG_DONE: u8 = 0x70;

impl<C: Ciphersuite> Wire for AbaMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AbaMessage::Bval { round, value } => {
                buf.put_u8(TAG_BVAL | u8::from(*value));
                buf.put_u16(*round);
            }
            AbaMessage::Aux { round, value } => {
                buf.put_u8(TAG_AUX | u8::from(*value));
                buf.put_u16(*round);
            }
            AbaMessage::Done { round, value } => {
                buf.put_u8(TAG_DONE | u8::from(*value));
                buf.put_u16(*round);
            }
            AbaMessage::Coin {
                round,
                msg: CoinMessage::Share { share, proof },
            } => {
                buf.put_u8(TAG_COIN);
                buf.put_u16(*round);
                codec::put_point::<C>(buf, share);
                proof.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let tag = codec::get_u8(buf)?;
        let value = tag & 1 == 1;
        let round = codec::get_u16(buf)?;
        match tag & 0xfe {
            TAG_BVAL => Ok(AbaMessage::Bval { round, value }),
            TAG_AUX => Ok(AbaMessage::Aux { round, value }),
            TAG_DONE => Ok(AbaMessage::Done { round, value }),
            TAG_COIN if !value => Ok(AbaMessage::Coin {
                round,
                msg: CoinMessage::Share {
                    share: codec::get_point::<C>(buf)?,
                    proof: dleq::Proof::decode(buf)?,
                },
            }),
            _ => Err(DecodeError::unknown_tag("aba message", tag)),
        }
    }
}

struct Round<C: Ciphersuite> {
    bval_received: [BTreeSet<NodeId>; 2],
    bval_sent: [bool; 2],
    bin_values: [bool; 2],
    aux_received: BTreeMap<NodeId, bool>,
    aux_sent: bool,
    coin: CommonCoin<C>,
}

impl<C: Ciphersuite> Round<C> {
    /// Values from `bin_values` carried by `AUX` messages, along with the number of such messages
    fn aux_values(&self) -> (usize, [bool; 2]) {
        let mut count = 0;
        let mut values = [false; 2];
        for value in self.aux_received.values() {
            if self.bin_values[usize::from(*value)] {
                count += 1;
                values[usize::from(*value)] = true;
            }
        }
        (count, values)
    }
}

/// Binary agreement instance
pub struct Aba<C: Ciphersuite> {
    peers: Vec<NodeId>,
    me: NodeId,
    f: usize,
    dk: Arc<DkShare<C::Curve>>,
    coin_sid_prefix: Vec<u8>,
    coin_config: CoinConfig,

    round: u16,
    estimate: Option<bool>,
    rounds: BTreeMap<u16, Round<C>>,
    /// Messages received before input
    pending: Vec<(NodeId, AbaMessage<C>)>,
    /// Messages of future rounds, except coin messages that go right to the round coin
    postponed: BTreeMap<u16, Vec<(NodeId, AbaMessage<C>)>>,

    decision: Option<bool>,
    done_sent: bool,
    done_received: [BTreeSet<NodeId>; 2],
    terminated: bool,
}

impl<C: Ciphersuite> Aba<C> {
    /// Constructs an instance
    ///
    /// Round coins are seeded with `coin_sid_prefix || round`, so the prefix must be unique
    /// per instance. `peers` must be ordered the same way as public shares in `dk`.
    pub fn new(
        peers: Vec<NodeId>,
        me: NodeId,
        dk: Arc<DkShare<C::Curve>>,
        coin_sid_prefix: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if peers.len() != usize::from(dk.n()) {
            return Err(ProtocolError::invalid_config(
                "number of peers doesn't match the key share",
            ));
        }
        let f = max_faulty(peers.len());
        Ok(Self {
            peers,
            me,
            f,
            dk,
            coin_sid_prefix,
            coin_config: CoinConfig::default(),
            round: 0,
            estimate: None,
            rounds: BTreeMap::new(),
            pending: vec![],
            postponed: BTreeMap::new(),
            decision: None,
            done_sent: false,
            done_received: [BTreeSet::new(), BTreeSet::new()],
            terminated: false,
        })
    }

    /// Indicates that enough members decided, and the instance doesn't need to run anymore
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Current round
    pub fn round(&self) -> u16 {
        self.round
    }

    fn n(&self) -> usize {
        self.peers.len()
    }

    fn round_state(&mut self, round: u16) -> Result<&mut Round<C>, ProtocolError> {
        match self.rounds.entry(round) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut sid = self.coin_sid_prefix.clone();
                sid.extend_from_slice(&round.to_be_bytes());
                let coin = CommonCoin::new(
                    self.me,
                    self.peers.clone(),
                    self.dk.clone(),
                    sid,
                    self.coin_config.resend_period,
                    self.coin_config.give_up_timeout,
                )?;
                Ok(entry.insert(Round {
                    bval_received: [BTreeSet::new(), BTreeSet::new()],
                    bval_sent: [false; 2],
                    bin_values: [false; 2],
                    aux_received: BTreeMap::new(),
                    aux_sent: false,
                    coin,
                }))
            }
        }
    }

    fn start(&mut self, estimate: bool) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        if self.estimate.is_some() {
            return Err(ProtocolError::duplicate_input("binary agreement estimate"));
        }
        self.estimate = Some(estimate);
        let mut out = self.send_bval(self.round, estimate)?;
        for (from, msg) in std::mem::take(&mut self.pending) {
            out.add_all(self.handle_message(from, msg)?);
        }
        Ok(out)
    }

    fn send_bval(
        &mut self,
        round: u16,
        value: bool,
    ) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        let state = self.round_state(round)?;
        let already_sent = std::mem::replace(&mut state.bval_sent[usize::from(value)], true);
        let mut out = OutMessages::new();
        if !already_sent {
            out.broadcast(&self.peers, AbaMessage::Bval { round, value });
        }
        Ok(out)
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        msg: AbaMessage<C>,
    ) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        if let AbaMessage::Done { value, .. } = msg {
            return self.handle_done(from, value);
        }
        if self.terminated {
            return Ok(OutMessages::new());
        }
        let round = msg.round();
        if round < self.round {
            return Ok(OutMessages::new());
        }
        if round > self.round.saturating_add(MAX_ROUNDS_AHEAD) {
            tracing::debug!(peer = %from, round, current = self.round, "aba message is too far ahead");
            return Ok(OutMessages::new());
        }
        if let AbaMessage::Coin { round, msg } = msg {
            let state = self.round_state(round)?;
            let out = state.coin.message(from, msg);
            let mut out = wrap_coin(round, out);
            if round == self.round {
                out.add_all(self.try_finish_round()?);
            }
            return Ok(out);
        }
        if round > self.round {
            self.postponed.entry(round).or_default().push((from, msg));
            return Ok(OutMessages::new());
        }

        match msg {
            AbaMessage::Bval { round, value } => self.handle_bval(from, round, value),
            AbaMessage::Aux { round, value } => self.handle_aux(from, round, value),
            AbaMessage::Done { .. } | AbaMessage::Coin { .. } => Ok(OutMessages::new()),
        }
    }

    fn handle_bval(
        &mut self,
        from: NodeId,
        round: u16,
        value: bool,
    ) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        let f = self.f;
        let v = usize::from(value);
        let state = self.round_state(round)?;
        if !state.bval_received[v].insert(from) {
            return Ok(OutMessages::new());
        }
        let count = state.bval_received[v].len();

        let mut out = OutMessages::new();
        if count > f {
            out.add_all(self.send_bval(round, value)?);
        }
        if count <= 2 * f {
            return Ok(out);
        }
        let state = self.round_state(round)?;
        if state.bin_values[v] {
            return Ok(out);
        }
        state.bin_values[v] = true;
        let send_aux = !std::mem::replace(&mut state.aux_sent, true);
        if send_aux {
            out.broadcast(&self.peers, AbaMessage::Aux { round, value });
        }
        out.add_all(self.try_finish_round()?);
        Ok(out)
    }

    fn handle_aux(
        &mut self,
        from: NodeId,
        round: u16,
        value: bool,
    ) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        let state = self.round_state(round)?;
        if state.aux_received.contains_key(&from) {
            return Ok(OutMessages::new());
        }
        state.aux_received.insert(from, value);
        self.try_finish_round()
    }

    fn try_finish_round(&mut self) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        let round = self.round;
        let quorum = self.n() - self.f;
        let state = self.round_state(round)?;
        let (count, values) = state.aux_values();
        if count < quorum {
            return Ok(OutMessages::new());
        }

        let mut out = OutMessages::new();
        if !state.coin.is_started() {
            let coin_out = state.coin.input(CoinInput::Start)?;
            out.add_all(wrap_coin(round, coin_out));
        }
        let Some(coin) = state.coin.output().map(|c| c.bit()) else {
            return Ok(out);
        };

        let next_estimate = match values {
            [true, false] => Some(false),
            [false, true] => Some(true),
            _ => None,
        };
        if next_estimate == Some(coin) && self.decision.is_none() {
            tracing::debug!(round, decision = coin, "aba decided");
            self.decision = Some(coin);
            out.add_all(self.send_done(round, coin));
        }
        let estimate = next_estimate.unwrap_or(coin);
        self.estimate = Some(estimate);

        // Next round
        self.round = round.saturating_add(1);
        self.rounds.remove(&round);
        tracing::trace!(round = self.round, estimate, "aba round started");
        out.add_all(self.send_bval(self.round, estimate)?);
        if let Some(postponed) = self.postponed.remove(&self.round) {
            for (from, msg) in postponed {
                out.add_all(self.handle_message(from, msg)?);
            }
        }
        Ok(out)
    }

    fn send_done(&mut self, round: u16, value: bool) -> OutMessages<AbaMessage<C>> {
        let mut out = OutMessages::new();
        if !self.done_sent {
            self.done_sent = true;
            out.broadcast(&self.peers, AbaMessage::Done { round, value });
        }
        out
    }

    fn handle_done(
        &mut self,
        from: NodeId,
        value: bool,
    ) -> Result<OutMessages<AbaMessage<C>>, ProtocolError> {
        let other = !value;
        if self.done_received[usize::from(other)].contains(&from)
            || !self.done_received[usize::from(value)].insert(from)
        {
            return Ok(OutMessages::new());
        }
        let count = self.done_received[usize::from(value)].len();
        let mut out = OutMessages::new();
        if count > self.f && self.decision.is_none() {
            tracing::debug!(decision = value, "aba decision adopted");
            self.decision = Some(value);
            out.add_all(self.send_done(self.round, value));
        }
        if count >= self.n() - self.f && !self.terminated {
            tracing::debug!(round = self.round, "aba terminated");
            self.terminated = true;
            self.rounds.clear();
            self.postponed.clear();
        }
        Ok(out)
    }
}

fn wrap_coin<C: Ciphersuite>(
    round: u16,
    msgs: OutMessages<CoinMessage<C>>,
) -> OutMessages<AbaMessage<C>> {
    msgs.map(|msg| AbaMessage::Coin { round, msg })
}

impl<C: Ciphersuite> Automaton for Aba<C> {
    type Input = bool;
    type Message = AbaMessage<C>;
    type Output = bool;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        self.start(input)
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        if !self.peers.contains(&from) {
            tracing::warn!(peer = %from, "aba message from unknown peer");
            return OutMessages::new();
        }
        if self.estimate.is_none() && !matches!(msg, AbaMessage::Done { .. }) {
            self.pending.push((from, msg));
            return OutMessages::new();
        }
        match self.handle_message(from, msg) {
            Ok(out) => out,
            Err(err) => {
                tracing::error!(error = %err, "aba failed to handle message");
                OutMessages::new()
            }
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        self.decision.as_ref()
    }

    fn status(&self) -> String {
        let current = self.rounds.get(&self.round);
        format!(
            "{{ABA:round={},est={:?},bin_values={:?},aux={},coin={},decision={:?},done={}/{},terminated={}}}",
            self.round,
            self.estimate,
            current.map(|r| r.bin_values),
            current.map_or(0, |r| r.aux_received.len()),
            current.map_or_else(|| "-".to_owned(), |r| r.coin.status()),
            self.decision,
            self.done_received[0].len(),
            self.done_received[1].len(),
            self.terminated,
        )
    }
}
