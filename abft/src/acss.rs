//! Asynchronous complete secret sharing
//!
//! Dealer shares a secret with a random polynomial of degree $f$ and reliably broadcasts a
//! [deal](Deal): Feldman commitment to the polynomial, ephemeral key $R = r \cdot G$, and the
//! shares encrypted for every member with a pad derived from $r \cdot PK_j$. Every member
//! decrypts its share with $sk_i \cdot R$ and checks it against the commitment:
//! * Valid share: `OK` is sent to everyone
//! * Invalid share: `IMPLICATE` reveals $sk_i \cdot R$ with a [DLEQ proof](crate::dleq), which
//!   lets anyone check that the dealer cheated. Every member that validates an implicate
//!   reveals its own key with `RECOVER`, and $f+1$ valid recovered shares let the implicating
//!   member interpolate its share.
//!
//! $n-f$ `OK` or $f+1$ `READY` trigger own `READY`. Once $n-f$ `READY` are collected and the
//! own share is known, the share is output. If one correct member outputs, all correct members
//! eventually output shares consistent with the same commitment.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use generic_ec::{NonZero, Point, Scalar, SecretScalar};
use rand_chacha::ChaCha20Rng;

use crate::{
    codec::{self, DecodeError, Wire},
    dleq,
    gpa::{Automaton, Bug, NodeId, OutMessages, ProtocolError},
    key::{default_eval_points, max_faulty, Committee, NodeIdentity},
    poly::{self, Commitment, Polynomial},
    rbc::{Rbc, RbcInput, RbcMessage},
    Ciphersuite, PeerIndex,
};

/// Upper bound on the encoded deal
pub const MAX_DEAL_SIZE: usize = 1 << 20;

/// Output of [`Acss`]
#[derive(Clone)]
pub struct AcssOutput<C: Ciphersuite> {
    /// Own share of the dealt secret
    pub share: SecretScalar<C::Curve>,
    /// Commitment to the sharing polynomial
    pub commitment: Commitment<C::Curve>,
}

impl<C: Ciphersuite> fmt::Debug for AcssOutput<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcssOutput")
            .field("commitment", &self.commitment)
            .finish_non_exhaustive()
    }
}

/// Broadcast part of the sharing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deal<C: Ciphersuite> {
    /// Commitment to the sharing polynomial
    pub commitment: Commitment<C::Curve>,
    /// $R = r \cdot G$
    pub ephemeral: Point<C::Curve>,
    /// Share of member $j$ encrypted with pad derived from $r \cdot PK_j$
    pub encrypted: Vec<Scalar<C::Curve>>,
}

impl<C: Ciphersuite> Deal<C> {
    fn is_well_formed(&self, n: usize, f: usize) -> bool {
        self.commitment.len() == f + 1 && self.encrypted.len() == n
    }
}

impl<C: Ciphersuite> Wire for Deal<C> {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_points::<C>(buf, &self.commitment.0);
        codec::put_point::<C>(buf, &self.ephemeral);
        buf.put_u16(self.encrypted.len() as u16);
        for scalar in &self.encrypted {
            codec::put_scalar::<C>(buf, scalar);
        }
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let commitment = Commitment(codec::get_points::<C>(buf)?);
        let ephemeral = codec::get_point::<C>(buf)?;
        let len = codec::get_u16(buf)?;
        let encrypted = (0..len)
            .map(|_| codec::get_scalar::<C>(buf))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            commitment,
            ephemeral,
            encrypted,
        })
    }
}

/// Pad encrypting share of member `j` derived from the shared key $r \cdot PK_j = sk_j \cdot R$
fn pad<C: Ciphersuite>(shared_key: &Point<C::Curve>, j: PeerIndex) -> Scalar<C::Curve> {
    C::hash_to_scalar(
        b"acss-pad",
        &[C::serialize_point(shared_key).as_ref(), &j.to_be_bytes()],
    )
}

/// Input of [`Acss`]
pub enum AcssInput<C: Ciphersuite> {
    /// Shares the secret. Allowed only at the dealer, once.
    Deal(SecretScalar<C::Curve>),
}

impl<C: Ciphersuite> fmt::Debug for AcssInput<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcssInput::Deal(_) => f.write_str("Deal"),
        }
    }
}

/// Message of [`Acss`]
#[derive(Clone, PartialEq, Eq)]
pub enum AcssMessage<C: Ciphersuite> {
    /// Reliable broadcast of the deal
    Rbc(RbcMessage),
    /// Sender's share is valid
    Ok,
    /// Sender is ready to output
    Ready,
    /// Sender's share is invalid, the key decrypting it is revealed
    Implicate {
        /// $sk_j \cdot R$
        key: Point<C::Curve>,
        /// Proof that the key is consistent with identity public key of the sender
        proof: dleq::Proof<C>,
    },
    /// Sender reveals its key to help implicating members recover their shares
    Recover {
        /// $sk_j \cdot R$
        key: Point<C::Curve>,
        /// Proof that the key is consistent with identity public key of the sender
        proof: dleq::Proof<C>,
    },
}

impl<C: Ciphersuite> fmt::Debug for AcssMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcssMessage::Rbc(msg) => write!(f, "Rbc({msg:?})"),
            AcssMessage::Ok => f.write_str("Ok"),
            AcssMessage::Ready => f.write_str("Ready"),
            AcssMessage::Implicate { .. } => f.write_str("Implicate"),
            AcssMessage::Recover { .. } => f.write_str("Recover"),
        }
    }
}

const TAG_RBC: u8 = 0;
const TAG_OK: u8 = 1;
const TAG_READY: u8 = 2;
const TAG_IMPLICATE: u8 = 3;
const TAG_RECOVER: u8 = 4;

impl<C: Ciphersuite> Wire for AcssMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AcssMessage::Rbc(msg) => {
                buf.put_u8(TAG_RBC);
                msg.encode(buf);
            }
            AcssMessage::Ok => buf.put_u8(TAG_OK),
            AcssMessage::Ready => buf.put_u8(TAG_READY),
            AcssMessage::Implicate { key, proof } | AcssMessage::Recover { key, proof } => {
                let tag = if matches!(self, AcssMessage::Implicate { .. }) {
                    TAG_IMPLICATE
                } else {
                    TAG_RECOVER
                };
                buf.put_u8(tag);
                codec::put_point::<C>(buf, key);
                proof.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_RBC => Ok(AcssMessage::Rbc(RbcMessage::decode(buf)?)),
            TAG_OK => Ok(AcssMessage::Ok),
            TAG_READY => Ok(AcssMessage::Ready),
            TAG_IMPLICATE => Ok(AcssMessage::Implicate {
                key: codec::get_point::<C>(buf)?,
                proof: dleq::Proof::decode(buf)?,
            }),
            TAG_RECOVER => Ok(AcssMessage::Recover {
                key: codec::get_point::<C>(buf)?,
                proof: dleq::Proof::decode(buf)?,
            }),
            tag => Err(DecodeError::unknown_tag("acss message", tag)),
        }
    }
}

/// ACSS instance of a single dealer
pub struct Acss<C: Ciphersuite> {
    committee: Committee<C>,
    identity: NodeIdentity<C>,
    me_index: PeerIndex,
    dealer: NodeId,
    n: usize,
    f: usize,
    eval_points: Vec<NonZero<Scalar<C::Curve>>>,
    rng: ChaCha20Rng,

    rbc: Rbc,
    dealt: bool,
    deal: Option<Deal<C>>,
    share: Option<SecretScalar<C::Curve>>,
    share_invalid: bool,

    ok_received: BTreeSet<NodeId>,
    ready_received: BTreeSet<NodeId>,
    ready_sent: bool,
    recover_sent: bool,
    /// Implicates and recovers received before the deal was delivered
    postponed: Vec<(NodeId, AcssMessage<C>)>,
    implicated: BTreeSet<NodeId>,
    recovered: BTreeMap<PeerIndex, Scalar<C::Curve>>,
    output: Option<AcssOutput<C>>,
}

impl<C: Ciphersuite> Acss<C> {
    /// Constructs an instance of sharing by `dealer`
    ///
    /// `rng` is used only if the local node is the dealer.
    pub fn new(
        committee: Committee<C>,
        identity: NodeIdentity<C>,
        dealer: NodeId,
        rng: ChaCha20Rng,
    ) -> Result<Self, ProtocolError> {
        let me_index = committee
            .index_of(&identity.node_id())
            .ok_or(ProtocolError::invalid_config("local node is not in the committee"))?;
        if committee.index_of(&dealer).is_none() {
            return Err(ProtocolError::invalid_config("dealer is not in the committee"));
        }
        let n = committee.n();
        let f = max_faulty(n);
        let eval_points = default_eval_points(n as u16);

        let predicate = Arc::new(move |bytes: &[u8]| {
            Deal::<C>::from_bytes(Bytes::copy_from_slice(bytes))
                .is_ok_and(|deal| deal.is_well_formed(n, f))
        });
        let rbc = Rbc::new(
            committee.members().to_vec(),
            identity.node_id(),
            dealer,
            MAX_DEAL_SIZE,
            predicate,
        );

        Ok(Self {
            committee,
            identity,
            me_index,
            dealer,
            n,
            f,
            eval_points,
            rng,
            rbc,
            dealt: false,
            deal: None,
            share: None,
            share_invalid: false,
            ok_received: BTreeSet::new(),
            ready_received: BTreeSet::new(),
            ready_sent: false,
            recover_sent: false,
            postponed: vec![],
            implicated: BTreeSet::new(),
            recovered: BTreeMap::new(),
            output: None,
        })
    }

    /// Dealer of the sharing
    pub fn dealer(&self) -> NodeId {
        self.dealer
    }

    fn eval_point(&self, j: PeerIndex) -> Result<NonZero<Scalar<C::Curve>>, Bug> {
        self.eval_points
            .get(usize::from(j))
            .copied()
            .ok_or(Bug::EvalPointMissing)
    }

    fn broadcast(&self, msg: AcssMessage<C>) -> OutMessages<AcssMessage<C>> {
        let mut out = OutMessages::new();
        out.broadcast(self.committee.members(), msg);
        out
    }

    fn deal_secret(
        &mut self,
        secret: SecretScalar<C::Curve>,
    ) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        if self.identity.node_id() != self.dealer {
            return Err(ProtocolError::unexpected_input("deal at a member that isn't the dealer"));
        }
        if self.dealt {
            return Err(ProtocolError::duplicate_input("deal"));
        }
        self.dealt = true;

        let polynomial = Polynomial::sample(&mut self.rng, self.f, secret);
        let ephemeral_secret = SecretScalar::<C::Curve>::random(&mut self.rng);
        let ephemeral = Point::generator() * &ephemeral_secret;
        let encrypted = self
            .committee
            .public_keys()
            .iter()
            .zip(&self.eval_points)
            .enumerate()
            .map(|(j, (pk_j, x_j))| {
                let shared_key = *pk_j * &ephemeral_secret;
                let share = polynomial.eval(x_j.as_ref());
                share.as_ref() + pad::<C>(&shared_key, j as PeerIndex)
            })
            .collect();
        let deal = Deal::<C> {
            commitment: polynomial.commit(),
            ephemeral,
            encrypted,
        };
        tracing::debug!(dealer = %self.dealer, "dealing the secret");
        let msgs = self
            .rbc
            .input(RbcInput::Broadcast(deal.to_bytes().to_vec()))?;
        Ok(msgs.map(AcssMessage::Rbc))
    }

    /// Decrypts share of member `j` with its revealed key
    fn decrypt(&self, deal: &Deal<C>, j: PeerIndex, key: &Point<C::Curve>) -> Option<Scalar<C::Curve>> {
        let encrypted = deal.encrypted.get(usize::from(j))?;
        Some(*encrypted - pad::<C>(key, j))
    }

    fn key_statement<'a>(
        &'a self,
        deal: &'a Deal<C>,
        j: PeerIndex,
        key: &'a Point<C::Curve>,
        generator: &'a Point<C::Curve>,
    ) -> Option<dleq::Statement<'a, C>> {
        Some(dleq::Statement {
            base1: generator,
            point1: self.committee.public_keys().get(usize::from(j))?,
            base2: &deal.ephemeral,
            point2: key,
            context: self.dealer.as_bytes(),
        })
    }

    fn prove_key(&self, deal: &Deal<C>) -> Result<(Point<C::Curve>, dleq::Proof<C>), Bug> {
        let key = deal.ephemeral * self.identity.secret_key();
        let generator = Point::generator().to_point();
        let statement = self
            .key_statement(deal, self.me_index, &key, &generator)
            .ok_or(Bug::OwnIndexOutOfRange)?;
        let proof = dleq::Proof::prove(self.identity.secret_key(), statement);
        Ok((key, proof))
    }

    fn on_deal_delivered(&mut self) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        let Some(bytes) = self.rbc.output() else {
            return Ok(OutMessages::new());
        };
        if self.deal.is_some() {
            return Ok(OutMessages::new());
        }
        // Predicate guarantees that the deal is well-formed
        let deal = match Deal::<C>::from_bytes(Bytes::copy_from_slice(bytes)) {
            Ok(deal) => deal,
            Err(err) => {
                tracing::error!(error = %err, "delivered deal is malformed");
                return Ok(OutMessages::new());
            }
        };

        let key = deal.ephemeral * self.identity.secret_key();
        let x_i = self.eval_point(self.me_index)?;
        let share = self
            .decrypt(&deal, self.me_index, &key)
            .ok_or(Bug::OwnIndexOutOfRange)?;
        let mut out = OutMessages::new();
        if deal.commitment.verify_share(x_i.as_ref(), &share) {
            let mut share = share;
            self.share = Some(SecretScalar::new(&mut share));
            out.add_all(self.broadcast(AcssMessage::Ok));
        } else {
            tracing::warn!(dealer = %self.dealer, "dealt share is invalid, implicating the dealer");
            self.share_invalid = true;
            let (key, proof) = self.prove_key(&deal)?;
            out.add_all(self.broadcast(AcssMessage::Implicate { key, proof }));
        }
        self.deal = Some(deal);

        for (from, msg) in std::mem::take(&mut self.postponed) {
            out.add_all(self.handle_message(from, msg)?);
        }
        out.add_all(self.try_output()?);
        Ok(out)
    }

    /// Validates revealed key of member `j` and decrypts its share
    ///
    /// Returns `None` if the key is invalid, or the decrypted share and whether it's consistent
    /// with the commitment.
    fn check_revealed_key(
        &self,
        j: PeerIndex,
        key: &Point<C::Curve>,
        proof: &dleq::Proof<C>,
    ) -> Result<Option<(Scalar<C::Curve>, bool)>, Bug> {
        let Some(deal) = &self.deal else {
            return Ok(None);
        };
        let generator = Point::generator().to_point();
        let Some(statement) = self.key_statement(deal, j, key, &generator) else {
            return Ok(None);
        };
        if proof.verify(statement).is_err() {
            return Ok(None);
        }
        let Some(share) = self.decrypt(deal, j, key) else {
            return Ok(None);
        };
        let x_j = self.eval_point(j)?;
        Ok(Some((share, deal.commitment.verify_share(x_j.as_ref(), &share))))
    }

    fn handle_implicate(
        &mut self,
        from: NodeId,
        j: PeerIndex,
        key: Point<C::Curve>,
        proof: dleq::Proof<C>,
    ) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        if !self.implicated.insert(from) {
            return Ok(OutMessages::new());
        }
        match self.check_revealed_key(j, &key, &proof)? {
            Some((_, false)) => {}
            Some((_, true)) => {
                tracing::warn!(peer = %from, "implicate of a valid share");
                return Ok(OutMessages::new());
            }
            None => {
                tracing::warn!(peer = %from, "invalid implicate");
                return Ok(OutMessages::new());
            }
        }
        if self.recover_sent {
            return Ok(OutMessages::new());
        }
        self.recover_sent = true;
        tracing::debug!(dealer = %self.dealer, peer = %from, "dealer implicated, revealing own key");
        let deal = self.deal.as_ref().ok_or(Bug::Interpolation)?;
        let (key, proof) = self.prove_key(deal)?;
        Ok(self.broadcast(AcssMessage::Recover { key, proof }))
    }

    fn handle_recover(
        &mut self,
        from: NodeId,
        j: PeerIndex,
        key: Point<C::Curve>,
        proof: dleq::Proof<C>,
    ) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        if self.share.is_some() || self.recovered.contains_key(&j) {
            return Ok(OutMessages::new());
        }
        match self.check_revealed_key(j, &key, &proof)? {
            Some((share, true)) => {
                self.recovered.insert(j, share);
            }
            _ => {
                tracing::warn!(peer = %from, "invalid recover");
                return Ok(OutMessages::new());
            }
        }
        if self.recovered.len() <= self.f {
            return Ok(OutMessages::new());
        }

        let shares = self
            .recovered
            .iter()
            .map(|(j, share)| Ok((self.eval_point(*j)?, *share)))
            .collect::<Result<Vec<_>, Bug>>()?;
        let x_i = self.eval_point(self.me_index)?;
        let mut share = poly::interpolate(&shares, x_i.as_ref()).ok_or(Bug::Interpolation)?;
        tracing::debug!(dealer = %self.dealer, "own share recovered");
        self.share = Some(SecretScalar::new(&mut share));
        self.try_output()
    }

    fn try_output(&mut self) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        let mut out = OutMessages::new();
        if !self.ready_sent
            && (self.ok_received.len() >= self.n - self.f || self.ready_received.len() > self.f)
        {
            self.ready_sent = true;
            out.add_all(self.broadcast(AcssMessage::Ready));
        }
        if self.output.is_none() && self.ready_received.len() >= self.n - self.f {
            if let (Some(share), Some(deal)) = (&self.share, &self.deal) {
                tracing::debug!(dealer = %self.dealer, "acss done");
                self.output = Some(AcssOutput {
                    share: share.clone(),
                    commitment: deal.commitment.clone(),
                });
            }
        }
        Ok(out)
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        msg: AcssMessage<C>,
    ) -> Result<OutMessages<AcssMessage<C>>, ProtocolError> {
        let Some(j) = self.committee.index_of(&from) else {
            tracing::warn!(peer = %from, "acss message from unknown peer");
            return Ok(OutMessages::new());
        };
        match msg {
            AcssMessage::Rbc(msg) => {
                let mut out = self.rbc.message(from, msg).map(AcssMessage::Rbc);
                out.add_all(self.on_deal_delivered()?);
                Ok(out)
            }
            AcssMessage::Ok => {
                self.ok_received.insert(from);
                self.try_output()
            }
            AcssMessage::Ready => {
                self.ready_received.insert(from);
                self.try_output()
            }
            msg @ (AcssMessage::Implicate { .. } | AcssMessage::Recover { .. })
                if self.deal.is_none() =>
            {
                self.postponed.push((from, msg));
                Ok(OutMessages::new())
            }
            AcssMessage::Implicate { key, proof } => self.handle_implicate(from, j, key, proof),
            AcssMessage::Recover { key, proof } => self.handle_recover(from, j, key, proof),
        }
    }
}

impl<C: Ciphersuite> Automaton for Acss<C> {
    type Input = AcssInput<C>;
    type Message = AcssMessage<C>;
    type Output = AcssOutput<C>;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        match input {
            AcssInput::Deal(secret) => self.deal_secret(secret),
        }
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        match self.handle_message(from, msg) {
            Ok(out) => out,
            Err(err) => {
                tracing::error!(dealer = %self.dealer, error = %err, "acss failed");
                OutMessages::new()
            }
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        self.output.as_ref()
    }

    fn status(&self) -> String {
        format!(
            "{{ACSS:dealer={},deal={},share={},invalid={},ok={},ready={},recovered={},done={}}}",
            self.dealer,
            self.deal.is_some(),
            self.share.is_some(),
            self.share_invalid,
            self.ok_received.len(),
            self.ready_received.len(),
            self.recovered.len(),
            self.output.is_some(),
        )
    }
}

