//! Distributed Schnorr signing
//!
//! Signs a message with a long-term $t$-out-of-$n$ key $x$ using a fresh nonce $k$ generated
//! by [Nonce-DKG](crate::adkg::nonce). Runs in two phases:
//! 1. Nonce-DKG is started. Once the local member knows which dealings it proposes to use,
//!    [proposal](DssOutput::proposed_indexes) is output. The caller agrees on proposals of
//!    the committee (e.g. via [common subset](crate::acs)) and obtains the message to sign.
//! 2. Decided proposals and the message are [input](DssInput::Decided). Once the nonce share
//!    $k_i$ is known, member computes partial signature $s_i = k_i + e \cdot x_i$ where
//!    $e = H(K, X, m)$, and sends it to everyone else. Partial signature of member $j$ is
//!    verified as $s_j \cdot G = K_j + e \cdot X_j$, and enough valid partials are
//!    interpolated into the signature $(K, s)$.
//!
//! Partial signatures received before the local member is ready to verify them are buffered.
//!
//! Nonce must never be reused: every instance signs exactly one message.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use generic_ec::{NonZero, Point, Scalar};
use rand_chacha::ChaCha20Rng;

use crate::{
    adkg::{
        nonce::{NonceDkg, NonceMessage},
        DkgInput, DkgKey,
    },
    codec::{self, DecodeError, Wire},
    gpa::{
        wrapper::{self, Subsystem, Wrapped},
        Automaton, Bug, NodeId, OutMessages, ProtocolError,
    },
    key::{default_eval_points, max_faulty, Committee, NodeIdentity},
    poly,
    signature::Signature,
    Ciphersuite, DkShare, PeerIndex,
};

pub mod node;

const SUBSYSTEM_NONCE: Subsystem = Subsystem(0);

/// Input of [`Dss`]
#[derive(Debug, Clone)]
pub enum DssInput {
    /// Starts generating the nonce
    Start,
    /// Decided nonce proposals and the message to sign
    Decided {
        /// Decided proposals of at least $n-f$ members
        proposals: Vec<Vec<PeerIndex>>,
        /// Message to sign
        message: Vec<u8>,
    },
}

/// Output of [`Dss`]
#[derive(Debug, Clone)]
pub struct DssOutput<C: Ciphersuite> {
    /// Nonce dealings proposed by the local member
    pub proposed_indexes: Option<Vec<PeerIndex>>,
    /// Aggregated signature
    pub signature: Option<Signature<C>>,
}

/// Message of [`Dss`]
#[derive(Clone, PartialEq, Eq)]
pub enum DssMessage<C: Ciphersuite> {
    /// Message of the nonce generation
    Nonce(Wrapped<NonceMessage<C>>),
    /// Partial signature $s_j$ of the sender
    Partial(Scalar<C::Curve>),
}

impl<C: Ciphersuite> fmt::Debug for DssMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DssMessage::Nonce(w) => write!(f, "Nonce({:?})", w.msg),
            DssMessage::Partial(_) => f.write_str("Partial"),
        }
    }
}

const TAG_NONCE: u8 = 0;
const TAG_PARTIAL: u8 = 1;

impl<C: Ciphersuite> Wire for DssMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            DssMessage::Nonce(w) => {
                buf.put_u8(TAG_NONCE);
                w.encode(buf);
            }
            DssMessage::Partial(share) => {
                buf.put_u8(TAG_PARTIAL);
                codec::put_scalar::<C>(buf, share);
            }
        }
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match codec::get_u8(buf)? {
            TAG_NONCE => Ok(DssMessage::Nonce(Wrapped::<NonceMessage<C>>::decode(buf)?)),
            TAG_PARTIAL => Ok(DssMessage::Partial(codec::get_scalar::<C>(buf)?)),
            tag => Err(DecodeError::unknown_tag("dss message", tag)),
        }
    }
}

/// State available once both the nonce and the message to sign are known
struct Signer<C: Ciphersuite> {
    /// Public nonce $K$
    nonce_public: Point<C::Curve>,
    /// Commitment to the nonce polynomial
    nonce: DkgKey<C>,
    challenge: Scalar<C::Curve>,
}

/// DSS automaton
pub struct Dss<C: Ciphersuite> {
    me: NodeId,
    peers: Vec<NodeId>,
    f: usize,
    dk: Arc<DkShare<C::Curve>>,
    eval_points: Vec<NonZero<Scalar<C::Curve>>>,
    nonce: NonceDkg<C>,

    message: Option<Vec<u8>>,
    signer: Option<Signer<C>>,
    /// Partials received before the signer was created, not verified yet
    buffered: BTreeMap<PeerIndex, Scalar<C::Curve>>,
    /// Verified partials, including own one
    partials: BTreeMap<PeerIndex, Scalar<C::Curve>>,
    output: DssOutput<C>,
}

impl<C: Ciphersuite> Dss<C> {
    /// Constructs an instance
    ///
    /// Committee must be ordered the same way as public shares in `dk`, and `dk` must use
    /// [default evaluation points](default_eval_points). `rng` seeds own nonce dealing.
    pub fn new(
        committee: Committee<C>,
        identity: NodeIdentity<C>,
        dk: Arc<DkShare<C::Curve>>,
        rng: ChaCha20Rng,
    ) -> Result<Self, ProtocolError> {
        let me = identity.node_id();
        if committee.n() != usize::from(dk.n()) {
            return Err(ProtocolError::invalid_config(
                "committee size doesn't match the key share",
            ));
        }
        if committee.index_of(&me) != Some(dk.index()) {
            return Err(ProtocolError::invalid_config(
                "own position in the committee doesn't match the key share",
            ));
        }
        let eval_points = default_eval_points::<C::Curve>(dk.n());
        if dk.eval_points() != eval_points.as_slice() {
            return Err(ProtocolError::invalid_config(
                "key share must use default evaluation points",
            ));
        }
        let peers = committee.members().to_vec();
        let f = max_faulty(peers.len());
        let nonce = NonceDkg::new(committee, identity, rng)?;
        Ok(Self {
            me,
            peers,
            f,
            dk,
            eval_points,
            nonce,
            message: None,
            signer: None,
            buffered: BTreeMap::new(),
            partials: BTreeMap::new(),
            output: DssOutput {
                proposed_indexes: None,
                signature: None,
            },
        })
    }

    /// Number of partials required to aggregate the signature
    fn required_partials(&self) -> usize {
        usize::from(self.dk.threshold()).max(self.f + 1)
    }

    fn nonce_out(msgs: OutMessages<NonceMessage<C>>) -> OutMessages<DssMessage<C>> {
        wrapper::wrap(SUBSYSTEM_NONCE, 0, msgs, DssMessage::Nonce)
    }

    /// Pulls progress of the nonce generation, creates the signer when possible
    fn progress(&mut self) -> Result<OutMessages<DssMessage<C>>, ProtocolError> {
        let mut out = OutMessages::new();
        let Some(nonce_output) = self.nonce.output() else {
            return Ok(out);
        };
        if self.output.proposed_indexes.is_none() {
            if let Some(indexes) = &nonce_output.indexes {
                self.output.proposed_indexes = Some(indexes.clone());
            }
        }
        if self.signer.is_some() {
            return Ok(out);
        }
        let (Some(message), Some(nonce)) = (&self.message, &nonce_output.key) else {
            return Ok(out);
        };

        let nonce_public = nonce.public_key();
        let challenge =
            C::compute_challenge(&nonce_public, &self.dk.shared_public_key(), message);
        let own = nonce.share.as_ref() + challenge * self.dk.secret_share().as_ref();
        let signer = Signer {
            nonce_public,
            nonce: nonce.clone(),
            challenge,
        };
        tracing::debug!(me = %self.me, "partial signature created");

        let others = self.peers.iter().filter(|p| **p != self.me);
        out.broadcast(others, DssMessage::Partial(own));
        self.partials.insert(self.dk.index(), own);
        self.signer = Some(signer);

        for (j, share) in std::mem::take(&mut self.buffered) {
            self.verify_partial(j, share)?;
        }
        self.try_aggregate()?;
        Ok(out)
    }

    fn verify_partial(&mut self, j: PeerIndex, share: Scalar<C::Curve>) -> Result<(), Bug> {
        if self.signer.is_none() {
            return Ok(());
        }
        if self.partial_is_valid(j, &share)? {
            self.partials.insert(j, share);
        } else {
            tracing::warn!(me = %self.me, from = j, "invalid partial signature");
        }
        Ok(())
    }

    /// Checks $s_j \cdot G = K_j + e \cdot X_j$
    fn partial_is_valid(&self, j: PeerIndex, share: &Scalar<C::Curve>) -> Result<bool, Bug> {
        let Some(signer) = &self.signer else {
            return Ok(false);
        };
        let x_j = self.eval_points.get(usize::from(j)).ok_or(Bug::EvalPointMissing)?;
        let Some(public_share) = self.dk.public_share(j) else {
            return Ok(false);
        };
        let nonce_share = signer.nonce.commitment.eval(x_j.as_ref());
        Ok(Point::generator() * *share == nonce_share + public_share * signer.challenge)
    }

    /// Interpolates the signature once enough partials are collected
    ///
    /// If the interpolated signature doesn't verify, partials it was built from are checked
    /// one by one, invalid ones are dropped, and aggregation is retried with the rest.
    fn try_aggregate(&mut self) -> Result<(), Bug> {
        if self.output.signature.is_some() {
            return Ok(());
        }
        let required = self.required_partials();
        loop {
            let (Some(signer), Some(message)) = (&self.signer, &self.message) else {
                return Ok(());
            };
            if self.partials.len() < required {
                return Ok(());
            }
            let used = self
                .partials
                .iter()
                .take(required)
                .map(|(j, share)| (*j, *share))
                .collect::<Vec<_>>();
            let shares = used
                .iter()
                .map(|(j, share)| {
                    let x_j = self.eval_points.get(usize::from(*j)).ok_or(Bug::EvalPointMissing)?;
                    Ok((*x_j, *share))
                })
                .collect::<Result<Vec<_>, Bug>>()?;
            let z = poly::interpolate(&shares, &Scalar::zero()).ok_or(Bug::Interpolation)?;
            let signature = Signature {
                r: signer.nonce_public,
                z,
            };
            if signature.verify(&self.dk.shared_public_key(), message).is_ok() {
                tracing::info!(me = %self.me, "signature aggregated");
                self.output.signature = Some(signature);
                return Ok(());
            }

            let mut dropped = 0;
            for (j, share) in &used {
                if !self.partial_is_valid(*j, share)? {
                    tracing::warn!(me = %self.me, from = *j, "partial signature dropped");
                    self.partials.remove(j);
                    dropped += 1;
                }
            }
            if dropped == 0 {
                return Err(Bug::AggregatedSignatureInvalid);
            }
            tracing::warn!(
                me = %self.me,
                dropped,
                remaining = self.partials.len(),
                "aggregated signature is invalid, retrying"
            );
        }
    }

    fn handle_partial(
        &mut self,
        from: NodeId,
        share: Scalar<C::Curve>,
    ) -> Result<(), ProtocolError> {
        if self.output.signature.is_some() {
            return Ok(());
        }
        let Some(j) = crate::gpa::index_of(&self.peers, &from) else {
            tracing::warn!(peer = %from, "partial signature from unknown peer");
            return Ok(());
        };
        if self.partials.contains_key(&j) || self.buffered.contains_key(&j) {
            tracing::warn!(peer = %from, "duplicate partial signature");
            return Ok(());
        }
        if self.signer.is_none() {
            self.buffered.insert(j, share);
            return Ok(());
        }
        self.verify_partial(j, share)?;
        self.try_aggregate()?;
        Ok(())
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        msg: DssMessage<C>,
    ) -> Result<OutMessages<DssMessage<C>>, ProtocolError> {
        match msg {
            DssMessage::Nonce(w) if w.subsystem == SUBSYSTEM_NONCE && w.index == 0 => {
                let mut out = Self::nonce_out(self.nonce.message(from, w.msg));
                out.add_all(self.progress()?);
                Ok(out)
            }
            DssMessage::Nonce(w) => {
                tracing::warn!(
                    peer = %from,
                    subsystem = w.subsystem.0,
                    index = w.index,
                    "unknown nested message"
                );
                Ok(OutMessages::new())
            }
            DssMessage::Partial(share) => {
                self.handle_partial(from, share)?;
                Ok(OutMessages::new())
            }
        }
    }
}

impl<C: Ciphersuite> Automaton for Dss<C> {
    type Input = DssInput;
    type Message = DssMessage<C>;
    type Output = DssOutput<C>;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        let mut out = match input {
            DssInput::Start => Self::nonce_out(self.nonce.input(DkgInput::Start)?),
            DssInput::Decided { proposals, message } => {
                if self.message.is_some() {
                    return Err(ProtocolError::duplicate_input("decided proposals"));
                }
                let msgs = self.nonce.input(DkgInput::AgreementResult(proposals))?;
                self.message = Some(message);
                Self::nonce_out(msgs)
            }
        };
        out.add_all(self.progress()?);
        Ok(out)
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        match self.handle_message(from, msg) {
            Ok(out) => out,
            Err(err) => {
                tracing::error!(me = %self.me, error = %err, "dss failed");
                OutMessages::new()
            }
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        if self.output.proposed_indexes.is_none() && self.output.signature.is_none() {
            return None;
        }
        Some(&self.output)
    }

    fn status(&self) -> String {
        format!(
            "{{DSS:decided={},signer={},partials={},buffered={},done={},{}}}",
            self.message.is_some(),
            self.signer.is_some(),
            self.partials.len(),
            self.buffered.len(),
            self.output.signature.is_some(),
            self.nonce.status(),
        )
    }
}

