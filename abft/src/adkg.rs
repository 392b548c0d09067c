//! Asynchronous distributed key generation
//!
//! Every member deals a random secret via [ACSS](crate::acss), so $n$ sharings run in parallel.
//! Member $i$ collects the set $T_i$ of dealers whose sharing has completed locally. Sum of the
//! shares dealt by an agreed set of dealers is the member's share of the generated key: as long
//! as the set contains at least one correct dealer, nobody knows the key.
//!
//! Agreement on the set of dealers is external: members propose their $T_i$, some agreement
//! protocol (e.g. [common subset](crate::acs)) decides on the proposals of at least $n-f$
//! members, and the decision is input into the automaton. Dealers that appear in at least
//! $f+1$ decided proposals are [agreed](agreement::decide_indexes).
//!
//! This module provides two flavours:
//! * [`Adkg`] proposes $T_i$ once $|T_i| = f+1$ and reliably broadcasts it. Broadcast of
//!   $T_j$ is only accepted once $T_j \subseteq T_i$. Used to generate long-term keys, the
//!   result [converts](DkgKey::to_dk_share) into a [`DkShare`](crate::DkShare).
//! * [`nonce::NonceDkg`] proposes $T_i$ once $|T_i| = n-f$ and doesn't broadcast it. Used to
//!   generate one-time nonces for [signing](crate::dss).

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use generic_ec::{Point, SecretScalar};
use rand_chacha::ChaCha20Rng;

use crate::{
    acss::{Acss, AcssInput, AcssMessage, AcssOutput},
    codec::{self, DecodeError, Wire},
    gpa::{
        wrapper::{self, Subsystem, UnexpectedMessage, Wrapped},
        Automaton, Bug, NodeId, OutMessages, ProtocolError,
    },
    key::{default_eval_points, max_faulty, Committee, DkShare, InvalidKeyShare, NodeIdentity},
    poly::Commitment,
    rbc::{self, Rbc, RbcInput, RbcMessage},
    Ciphersuite, PeerIndex,
};

pub mod agreement;
pub mod nonce;

const SUBSYSTEM_ACSS: Subsystem = Subsystem(0);
const SUBSYSTEM_PROPOSAL: Subsystem = Subsystem(1);

/// Input of [`Adkg`] and [`NonceDkg`](nonce::NonceDkg)
#[derive(Debug, Clone)]
pub enum DkgInput {
    /// Deals own secret
    Start,
    /// Proposals decided by the external agreement
    AgreementResult(Vec<Vec<PeerIndex>>),
}

/// Output of [`Adkg`] and [`NonceDkg`](nonce::NonceDkg)
///
/// Produced in two phases: first, `indexes` proposed by the local member become known, then
/// `key` once the agreement result is received and all agreed sharings completed.
#[derive(Clone)]
pub struct DkgOutput<C: Ciphersuite> {
    /// Dealers proposed by the local member
    pub indexes: Option<Vec<PeerIndex>>,
    /// Generated key share
    pub key: Option<DkgKey<C>>,
}

impl<C: Ciphersuite> fmt::Debug for DkgOutput<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkgOutput")
            .field("indexes", &self.indexes)
            .field("key", &self.key)
            .finish()
    }
}

/// Share of a generated key
#[derive(Clone)]
pub struct DkgKey<C: Ciphersuite> {
    /// Dealers whose sharings are summed into the key
    pub indexes: Vec<PeerIndex>,
    /// Index of the local member
    pub index: PeerIndex,
    /// Secret share of the local member
    pub share: SecretScalar<C::Curve>,
    /// Commitment to the polynomial sharing the key
    pub commitment: Commitment<C::Curve>,
}

impl<C: Ciphersuite> DkgKey<C> {
    /// Generated public key
    pub fn public_key(&self) -> Point<C::Curve> {
        self.commitment.constant_term()
    }

    /// Minimal number of shares required to reconstruct the key
    pub fn threshold(&self) -> u16 {
        self.commitment.len() as u16
    }

    /// Converts into the long-term key share
    ///
    /// Members are evaluated at [default points](default_eval_points).
    pub fn to_dk_share(&self, n: u16) -> Result<DkShare<C::Curve>, InvalidKeyShare> {
        let eval_points = default_eval_points::<C::Curve>(n);
        let public_shares = eval_points
            .iter()
            .map(|x| self.commitment.eval(x.as_ref()))
            .collect();
        DkShare::new(
            self.index,
            self.threshold(),
            self.public_key(),
            public_shares,
            eval_points,
            self.share.clone(),
        )
    }
}

impl<C: Ciphersuite> fmt::Debug for DkgKey<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkgKey")
            .field("indexes", &self.indexes)
            .field("index", &self.index)
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// $n$ parallel sharings, one per dealer
pub(crate) struct Dealings<C: Ciphersuite> {
    me_index: PeerIndex,
    rng: ChaCha20Rng,
    acss: Vec<Acss<C>>,
    started: bool,
    completed: BTreeMap<PeerIndex, AcssOutput<C>>,
}

impl<C: Ciphersuite> Dealings<C> {
    pub fn new(
        committee: &Committee<C>,
        identity: &NodeIdentity<C>,
        rng: ChaCha20Rng,
    ) -> Result<Self, ProtocolError> {
        let me_index = committee
            .index_of(&identity.node_id())
            .ok_or(ProtocolError::invalid_config("local node is not in the committee"))?;
        let acss = committee
            .members()
            .iter()
            .enumerate()
            .map(|(j, dealer)| {
                // Every sharing gets its own stream, stream 0 is left for own secret
                let mut acss_rng = rng.clone();
                acss_rng.set_stream(j as u64 + 1);
                Acss::new(committee.clone(), identity.clone(), *dealer, acss_rng)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            me_index,
            rng,
            acss,
            started: false,
            completed: BTreeMap::new(),
        })
    }

    fn wrap(index: PeerIndex, msgs: OutMessages<AcssMessage<C>>) -> OutMessages<Wrapped<AcssMessage<C>>> {
        wrapper::wrap(SUBSYSTEM_ACSS, index, msgs, |w| w)
    }

    pub fn start(&mut self) -> Result<OutMessages<Wrapped<AcssMessage<C>>>, ProtocolError> {
        if self.started {
            return Err(ProtocolError::duplicate_input("start"));
        }
        self.started = true;
        let secret = SecretScalar::<C::Curve>::random(&mut self.rng);
        let acss = self
            .acss
            .get_mut(usize::from(self.me_index))
            .ok_or(Bug::OwnIndexOutOfRange)?;
        let msgs = acss.input(AcssInput::Deal(secret))?;
        self.collect(self.me_index);
        Ok(Self::wrap(self.me_index, msgs))
    }

    /// Handles the message, returns whether a sharing completed
    pub fn message(
        &mut self,
        from: NodeId,
        msg: Wrapped<AcssMessage<C>>,
    ) -> Result<(OutMessages<Wrapped<AcssMessage<C>>>, bool), UnexpectedMessage> {
        if msg.subsystem != SUBSYSTEM_ACSS {
            return Err(UnexpectedMessage {
                subsystem: msg.subsystem,
                index: msg.index,
            });
        }
        let acss = wrapper::resolve(msg.subsystem, msg.index, &mut self.acss)?;
        let msgs = acss.message(from, msg.msg);
        let completed = self.collect(msg.index);
        Ok((Self::wrap(msg.index, msgs), completed))
    }

    fn collect(&mut self, index: PeerIndex) -> bool {
        if self.completed.contains_key(&index) {
            return false;
        }
        let Some(output) = self.acss.get(usize::from(index)).and_then(|a| a.output()) else {
            return false;
        };
        tracing::debug!(dealer = index, "sharing completed");
        self.completed.insert(index, output.clone());
        true
    }

    /// Dealers whose sharings completed, in ascending order
    pub fn completed(&self) -> Vec<PeerIndex> {
        self.completed.keys().copied().collect()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Sums shares dealt by `agreed` dealers, or returns `None` if some sharing isn't completed
    pub fn sum(&self, agreed: &[PeerIndex]) -> Option<DkgKey<C>> {
        let outputs = agreed
            .iter()
            .map(|j| self.completed.get(j))
            .collect::<Option<Vec<_>>>()?;
        let mut share = outputs
            .iter()
            .fold(generic_ec::Scalar::zero(), |acc, output| acc + output.share.as_ref());
        let commitment = Commitment::sum(outputs.iter().map(|output| &output.commitment));
        Some(DkgKey {
            indexes: agreed.to_vec(),
            index: self.me_index,
            share: SecretScalar::new(&mut share),
            commitment,
        })
    }

    pub fn status(&self) -> String {
        self.acss
            .iter()
            .map(|acss| acss.status())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Message of [`Adkg`]
#[derive(Clone, PartialEq, Eq)]
pub enum AdkgMessage<C: Ciphersuite> {
    /// Message of the sharing of dealer `index`
    Acss(Wrapped<AcssMessage<C>>),
    /// Message of the broadcast of the proposal of member `index`
    Proposal(Wrapped<RbcMessage>),
}

impl<C: Ciphersuite> fmt::Debug for AdkgMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdkgMessage::Acss(w) => write!(f, "Acss[{}]({:?})", w.index, w.msg),
            AdkgMessage::Proposal(w) => write!(f, "Proposal[{}]({:?})", w.index, w.msg),
        }
    }
}

impl<C: Ciphersuite> Wire for AdkgMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            AdkgMessage::Acss(w) => w.encode(buf),
            AdkgMessage::Proposal(w) => w.encode(buf),
        }
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let Some(&subsystem) = buf.first() else {
            return Err(DecodeError::malformed("adkg message"));
        };
        match Subsystem(subsystem) {
            SUBSYSTEM_ACSS => Ok(AdkgMessage::Acss(Wrapped::decode(buf)?)),
            SUBSYSTEM_PROPOSAL => Ok(AdkgMessage::Proposal(Wrapped::decode(buf)?)),
            _ => Err(DecodeError::unknown_tag("adkg subsystem", subsystem)),
        }
    }
}

fn encode_indexes(indexes: &[PeerIndex]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    codec::put_u16s(&mut buf, indexes);
    buf.to_vec()
}

fn decode_indexes(bytes: &[u8]) -> Option<Vec<PeerIndex>> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let indexes = codec::get_u16s(&mut buf).ok()?;
    buf.is_empty().then_some(indexes)
}

/// Accepts proposals of at least `min_len` dealers that all completed locally
fn subset_predicate(completed: Vec<PeerIndex>, min_len: usize) -> rbc::Predicate {
    let completed: BTreeSet<PeerIndex> = completed.into_iter().collect();
    Arc::new(move |bytes: &[u8]| {
        decode_indexes(bytes).is_some_and(|proposal| {
            proposal.len() >= min_len && proposal.iter().all(|j| completed.contains(j))
        })
    })
}

/// ADKG automaton
pub struct Adkg<C: Ciphersuite> {
    me: NodeId,
    me_index: PeerIndex,
    n: usize,
    f: usize,
    dealings: Dealings<C>,
    proposals: Vec<Rbc>,
    proposed: bool,
    agreed: Option<Vec<PeerIndex>>,
    output: DkgOutput<C>,
}

impl<C: Ciphersuite> Adkg<C> {
    /// Constructs an instance
    ///
    /// `rng` seeds own dealing. It must not be reused for anything else.
    pub fn new(
        committee: Committee<C>,
        identity: NodeIdentity<C>,
        rng: ChaCha20Rng,
    ) -> Result<Self, ProtocolError> {
        let dealings = Dealings::new(&committee, &identity, rng)?;
        let me = identity.node_id();
        let n = committee.n();
        let f = max_faulty(n);
        let proposals = committee
            .members()
            .iter()
            .map(|proposer| {
                Rbc::new(
                    committee.members().to_vec(),
                    me,
                    *proposer,
                    codec::MAX_BYTES_LEN,
                    subset_predicate(vec![], f + 1),
                )
            })
            .collect();
        Ok(Self {
            me,
            me_index: dealings.me_index,
            n,
            f,
            dealings,
            proposals,
            proposed: false,
            agreed: None,
            output: DkgOutput {
                indexes: None,
                key: None,
            },
        })
    }

    fn proposal_out(index: PeerIndex, msgs: OutMessages<RbcMessage>) -> OutMessages<AdkgMessage<C>> {
        wrapper::wrap(SUBSYSTEM_PROPOSAL, index, msgs, AdkgMessage::Proposal)
    }

    /// Reacts on a completed sharing: refreshes predicates and proposes once enough completed
    fn on_sharing_completed(&mut self) -> Result<OutMessages<AdkgMessage<C>>, ProtocolError> {
        let completed = self.dealings.completed();
        let mut out = OutMessages::new();
        for (j, rbc) in self.proposals.iter_mut().enumerate() {
            let predicate = subset_predicate(completed.clone(), self.f + 1);
            out.add_all(Self::proposal_out(
                j as PeerIndex,
                rbc.input(RbcInput::Predicate(predicate))?,
            ));
        }
        if !self.proposed && completed.len() > self.f {
            self.proposed = true;
            tracing::debug!(me = %self.me, indexes = ?completed, "proposing dealers");
            let rbc = self
                .proposals
                .get_mut(usize::from(self.me_index))
                .ok_or(Bug::OwnIndexOutOfRange)?;
            out.add_all(Self::proposal_out(
                self.me_index,
                rbc.input(RbcInput::Broadcast(encode_indexes(&completed)))?,
            ));
        }
        self.check_proposals();
        self.try_finish();
        Ok(out)
    }

    fn check_proposals(&mut self) {
        if self.output.indexes.is_some() {
            return;
        }
        let delivered = self
            .proposals
            .iter()
            .find_map(|rbc| rbc.output().and_then(|bytes| decode_indexes(bytes)));
        if let Some(indexes) = delivered {
            tracing::debug!(me = %self.me, ?indexes, "proposal delivered");
            self.output.indexes = Some(indexes);
        }
    }

    fn try_finish(&mut self) {
        if self.output.key.is_some() {
            return;
        }
        if let Some(agreed) = &self.agreed {
            if let Some(key) = self.dealings.sum(agreed) {
                tracing::info!(me = %self.me, public_key = ?key.public_key(), "key generated");
                self.output.key = Some(key);
            }
        }
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        msg: AdkgMessage<C>,
    ) -> Result<OutMessages<AdkgMessage<C>>, ProtocolError> {
        match msg {
            AdkgMessage::Acss(msg) => {
                let (msgs, completed) = match self.dealings.message(from, msg) {
                    Ok(res) => res,
                    Err(err) => {
                        tracing::warn!(peer = %from, error = %err, "adkg message dropped");
                        return Ok(OutMessages::new());
                    }
                };
                let mut out = msgs.map(AdkgMessage::Acss);
                if completed {
                    out.add_all(self.on_sharing_completed()?);
                }
                Ok(out)
            }
            AdkgMessage::Proposal(w) => {
                let rbc = match wrapper::resolve(w.subsystem, w.index, &mut self.proposals) {
                    Ok(rbc) if w.subsystem == SUBSYSTEM_PROPOSAL => rbc,
                    _ => {
                        tracing::warn!(peer = %from, index = w.index, "proposal message dropped");
                        return Ok(OutMessages::new());
                    }
                };
                let out = Self::proposal_out(w.index, rbc.message(from, w.msg));
                self.check_proposals();
                Ok(out)
            }
        }
    }
}

impl<C: Ciphersuite> Automaton for Adkg<C> {
    type Input = DkgInput;
    type Message = AdkgMessage<C>;
    type Output = DkgOutput<C>;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        match input {
            DkgInput::Start => {
                let mut out = self.dealings.start()?.map(AdkgMessage::Acss);
                if self.dealings.completed_len() > 0 {
                    out.add_all(self.on_sharing_completed()?);
                }
                Ok(out)
            }
            DkgInput::AgreementResult(proposals) => {
                if self.agreed.is_some() {
                    return Err(ProtocolError::duplicate_input("agreement result"));
                }
                let agreed = agreement::decide_indexes(&proposals, self.n, self.f)?;
                tracing::debug!(me = %self.me, ?agreed, "dealers agreed");
                self.agreed = Some(agreed);
                self.try_finish();
                Ok(OutMessages::new())
            }
        }
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        match self.handle_message(from, msg) {
            Ok(out) => out,
            Err(err) => {
                tracing::error!(me = %self.me, error = %err, "adkg failed");
                OutMessages::new()
            }
        }
    }

    fn output(&self) -> Option<&Self::Output> {
        if self.output.indexes.is_none() && self.output.key.is_none() {
            return None;
        }
        Some(&self.output)
    }

    fn status(&self) -> String {
        format!(
            "{{ADKG:completed={},proposed={},agreed={:?},done={},acss=[{}]}}",
            self.dealings.completed_len(),
            self.proposed,
            self.agreed,
            self.output.key.is_some(),
            self.dealings.status(),
        )
    }
}
