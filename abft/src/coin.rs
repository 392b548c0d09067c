//! Common Coin
//!
//! Threshold coin of Cachin, Kursawe and Shoup. For a seed `sid`, every member computes a coin
//! share $\sigma_i = x_i \cdot H(\text{sid})$ where $x_i$ is its long-term secret share and $H$
//! hashes onto the curve, and proves with a [DLEQ proof](crate::dleq) that the share is
//! consistent with its public share. Any $t$ valid shares interpolate to $x \cdot H(\text{sid})$,
//! which is then hashed into the [coin value](Coin). Until $t$ members released their shares,
//! the value is unpredictable to anyone.
//!
//! All correct members obtain the same value for the same `sid`, no matter which shares they
//! combine.
//!
//! [`CommonCoin`] is the automaton, used directly by [binary agreement](crate::aba).
//! [`service::CoinService`] runs coins over a [transport](crate::net::Transport) for callers
//! that just want to [get a coin](service::CoinService::get_coin).

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use digest::{FixedOutput, Update};
use generic_ec::{NonZero, Point, Scalar};

use crate::{
    codec::{self, DecodeError, Wire},
    dleq,
    gpa::{index_of, Automaton, Bug, NodeId, OutMessages, ProtocolError},
    poly, Ciphersuite, DkShare, PeerIndex,
};

pub mod service;

/// Coin value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coin([u8; 32]);

impl Coin {
    /// Coin value bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    /// Single bit derived from the value, used to flip binary agreement rounds
    pub fn bit(&self) -> bool {
        self.0[0] & 1 == 1
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Input of [`CommonCoin`]
#[derive(Debug, Clone, Copy)]
pub enum CoinInput {
    /// Releases own coin share
    Start,
    /// Drives resending of own share and the give-up timer
    ///
    /// Coins embedded into other protocols rely on their redelivery and never tick.
    Tick(Instant),
}

/// Message of [`CommonCoin`]
#[derive(Clone, PartialEq, Eq)]
pub enum CoinMessage<C: Ciphersuite> {
    /// Coin share of the sender
    Share {
        /// $\sigma_j = x_j \cdot H(\text{sid})$
        share: Point<C::Curve>,
        /// Proof that $\sigma_j$ is consistent with public share of the sender
        proof: dleq::Proof<C>,
    },
}

impl<C: Ciphersuite> fmt::Debug for CoinMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinMessage::Share { .. } => f.write_str("CoinShare"),
        }
    }
}

const TAG_SHARE: u8 = 0;

impl<C: Ciphersuite> Wire for CoinMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            CoinMessage::Share { share, proof } => {
                buf.put_u8(TAG_SHARE);
                codec::put_point::<C>(buf, share);
                proof.encode(buf);
            }
        }
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_SHARE => Ok(CoinMessage::Share {
                share: codec::get_point::<C>(buf)?,
                proof: dleq::Proof::decode(buf)?,
            }),
            tag => Err(DecodeError::unknown_tag("coin message", tag)),
        }
    }
}

/// Common coin automaton for a single `sid`
pub struct CommonCoin<C: Ciphersuite> {
    me: NodeId,
    peers: Vec<NodeId>,
    dk: Arc<DkShare<C::Curve>>,
    sid: Vec<u8>,
    base: Point<C::Curve>,

    resend_period: Duration,
    give_up_timeout: Duration,
    started_at: Option<Instant>,
    last_resend: Option<Instant>,

    own_share: Option<CoinMessage<C>>,
    /// Valid shares, including own one
    shares: BTreeMap<PeerIndex, Point<C::Curve>>,
    /// Peers we haven't got a share from. We keep resending them our share, as they likely
    /// haven't got it either.
    missing: BTreeSet<PeerIndex>,
    /// Peers we answered within the current resend period
    answered: BTreeSet<PeerIndex>,
    output: Option<Coin>,
    given_up: bool,
}

impl<C: Ciphersuite> CommonCoin<C> {
    /// Constructs a coin for `sid`
    ///
    /// `peers` must be ordered the same way as public shares in `dk`.
    pub fn new(
        me: NodeId,
        peers: Vec<NodeId>,
        dk: Arc<DkShare<C::Curve>>,
        sid: Vec<u8>,
        resend_period: Duration,
        give_up_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        if peers.len() != usize::from(dk.n()) {
            return Err(ProtocolError::invalid_config(
                "number of peers doesn't match the key share",
            ));
        }
        if index_of(&peers, &me) != Some(dk.index()) {
            return Err(ProtocolError::invalid_config(
                "own position among peers doesn't match the key share",
            ));
        }
        let base = C::hash_to_point(b"coin", &[&sid]);
        let missing = (0..dk.n()).filter(|j| *j != dk.index()).collect();
        Ok(Self {
            me,
            peers,
            dk,
            sid,
            base,
            resend_period,
            give_up_timeout,
            started_at: None,
            last_resend: None,
            own_share: None,
            shares: BTreeMap::new(),
            missing,
            answered: BTreeSet::new(),
            output: None,
            given_up: false,
        })
    }

    /// Coin seed
    pub fn sid(&self) -> &[u8] {
        &self.sid
    }

    /// Indicates that own share was released
    pub fn is_started(&self) -> bool {
        self.own_share.is_some()
    }

    /// Indicates that the coin wasn't produced in time and should be discarded
    pub fn is_given_up(&self) -> bool {
        self.given_up
    }

    fn start(&mut self) -> Result<OutMessages<CoinMessage<C>>, ProtocolError> {
        if self.own_share.is_some() {
            return Err(ProtocolError::duplicate_input("coin start"));
        }
        let own_public_share = self
            .dk
            .public_share(self.dk.index())
            .ok_or(Bug::OwnIndexOutOfRange)?;
        let share = self.base * self.dk.secret_share();
        let proof = dleq::Proof::prove(
            self.dk.secret_share(),
            dleq::Statement {
                base1: &Point::generator().to_point(),
                point1: &own_public_share,
                base2: &self.base,
                point2: &share,
                context: &self.sid,
            },
        );
        let msg = CoinMessage::Share { share, proof };
        self.own_share = Some(msg.clone());
        self.shares.insert(self.dk.index(), share);
        tracing::trace!(sid = %hex::encode(&self.sid), "coin share released");

        let mut out = OutMessages::new();
        out.broadcast(self.peers.iter().filter(|p| **p != self.me), msg);
        self.try_combine()?;
        Ok(out)
    }

    fn tick(&mut self, now: Instant) -> OutMessages<CoinMessage<C>> {
        let started_at = *self.started_at.get_or_insert(now);
        if self.output.is_none()
            && !self.given_up
            && now.saturating_duration_since(started_at) > self.give_up_timeout
        {
            tracing::warn!(sid = %hex::encode(&self.sid), status = %self.status(), "giving up the coin");
            self.given_up = true;
        }
        if self.given_up {
            return OutMessages::new();
        }
        let Some(own_share) = &self.own_share else {
            return OutMessages::new();
        };
        if let Some(last) = self.last_resend {
            if now.saturating_duration_since(last) < self.resend_period {
                return OutMessages::new();
            }
        }
        self.last_resend = Some(now);
        self.answered.clear();
        let mut out = OutMessages::new();
        out.broadcast(
            self.missing
                .iter()
                .filter_map(|j| self.peers.get(usize::from(*j))),
            own_share.clone(),
        );
        out
    }

    fn handle_share(
        &mut self,
        from: NodeId,
        share: Point<C::Curve>,
        proof: dleq::Proof<C>,
    ) -> Result<OutMessages<CoinMessage<C>>, ProtocolError> {
        let mut out = OutMessages::new();
        let Some(j) = index_of(&self.peers, &from) else {
            tracing::warn!(peer = %from, "coin share from unknown peer");
            return Ok(out);
        };
        if self.shares.contains_key(&j) {
            // Peer keeps resending its share only while it misses ours
            if let Some(own_share) = &self.own_share {
                if self.answered.insert(j) {
                    out.add(from, own_share.clone());
                }
            }
            return Ok(out);
        }
        let Some(public_share) = self.dk.public_share(j) else {
            return Ok(out);
        };
        let statement = dleq::Statement {
            base1: &Point::generator().to_point(),
            point1: &public_share,
            base2: &self.base,
            point2: &share,
            context: &self.sid,
        };
        if proof.verify(statement).is_err() {
            tracing::warn!(peer = %from, sid = %hex::encode(&self.sid), "invalid coin share");
            return Ok(out);
        }
        self.shares.insert(j, share);
        self.missing.remove(&j);
        self.try_combine()?;
        Ok(out)
    }

    fn try_combine(&mut self) -> Result<(), ProtocolError> {
        // Own share must be released before the coin may be revealed locally
        if self.output.is_some() || self.own_share.is_none() {
            return Ok(());
        }
        let t = usize::from(self.dk.threshold());
        if self.shares.len() < t {
            return Ok(());
        }
        let shares = self
            .shares
            .iter()
            .take(t)
            .map(|(j, share)| {
                let x_j: NonZero<Scalar<C::Curve>> =
                    self.dk.eval_point(*j).ok_or(Bug::EvalPointMissing)?;
                Ok((x_j, *share))
            })
            .collect::<Result<Vec<_>, Bug>>()?;
        let combined =
            poly::interpolate_points(&shares, &Scalar::zero()).ok_or(Bug::Interpolation)?;
        let value = C::digest(b"coin")
            .chain(&self.sid)
            .chain(C::serialize_point(&combined).as_ref())
            .finalize_fixed();
        let coin = Coin(value.into());
        tracing::debug!(sid = %hex::encode(&self.sid), %coin, "coin is ready");
        self.output = Some(coin);
        Ok(())
    }
}

impl<C: Ciphersuite> Automaton for CommonCoin<C> {
    type Input = CoinInput;
    type Message = CoinMessage<C>;
    type Output = Coin;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        match input {
            CoinInput::Start => self.start(),
            CoinInput::Tick(now) => Ok(self.tick(now)),
        }
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        let result = match msg {
            CoinMessage::Share { share, proof } => self.handle_share(from, share, proof),
        };
        result.unwrap_or_else(|err| {
            tracing::error!(error = %err, "coin failed");
            OutMessages::new()
        })
    }

    fn output(&self) -> Option<&Self::Output> {
        self.output.as_ref()
    }

    fn status(&self) -> String {
        format!(
            "{{COIN:sid={},started={},shares={}/{},done={},given_up={}}}",
            hex::encode(&self.sid),
            self.own_share.is_some(),
            self.shares.len(),
            self.dk.threshold(),
            self.output.is_some(),
            self.given_up,
        )
    }
}
