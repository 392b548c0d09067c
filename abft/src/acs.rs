//! Asynchronous Common Subset
//!
//! HoneyBadgerBFT composition of $n$ [reliable broadcasts](crate::rbc) and $n$
//! [binary agreements](crate::aba), one of each per member:
//! * Every member reliably broadcasts its proposal
//! * Once proposal of member $j$ is delivered, $1$ is input into agreement $j$
//! * Once $n-f$ agreements output $1$, $0$ is input into all agreements that got no input yet
//! * Once all agreements decided, the output is the set of proposals whose agreements decided
//!   $1$ (waiting for the proposals that aren't delivered yet)
//!
//! All correct members output the same set of at least $n-f$ proposals.
//!
//! [`Acs`] is the pure automaton. [`session::CommonSubset`] runs it with explicit redelivery
//! and acknowledgements, and [`coordinator::Coordinator`] multiplexes many sessions over a
//! transport.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    aba::{Aba, AbaMessage},
    codec::{self, DecodeError, Wire},
    gpa::{
        index_of,
        wrapper::{self, Subsystem, Wrapped},
        Automaton, Bug, NodeId, OutMessages, ProtocolError,
    },
    key::max_faulty,
    rbc::{self, Rbc, RbcInput, RbcMessage},
    Ciphersuite, DkShare, PeerIndex,
};

pub mod batch;
pub mod coordinator;
pub mod session;

const SUBSYSTEM_RBC: Subsystem = Subsystem(0);
const SUBSYSTEM_ABA: Subsystem = Subsystem(1);

/// Decided proposals, indexed by the proposer
pub type AcsOutput = BTreeMap<PeerIndex, Vec<u8>>;

/// Message of [`Acs`]
#[derive(Clone, PartialEq, Eq)]
pub enum AcsMessage<C: Ciphersuite> {
    /// Message of reliable broadcast of proposer `index`
    Rbc(Wrapped<RbcMessage>),
    /// Message of binary agreement on proposer `index`
    Aba(Wrapped<AbaMessage<C>>),
}

impl<C: Ciphersuite> AcsMessage<C> {
    /// Proposer the message relates to
    pub fn proposer(&self) -> PeerIndex {
        match self {
            AcsMessage::Rbc(w) => w.index,
            AcsMessage::Aba(w) => w.index,
        }
    }
}

impl<C: Ciphersuite> fmt::Debug for AcsMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcsMessage::Rbc(w) => write!(f, "Rbc[{}]({:?})", w.index, w.msg),
            AcsMessage::Aba(w) => write!(f, "Aba[{}]({:?})", w.index, w.msg),
        }
    }
}

/// Encoded as proposer index followed by the nested message. Nested message kind is told by
/// the high nibble of its tag: RBC tags are `0x1_..0x3_`, ABA tags are `0x4_..0x7_`.
impl<C: Ciphersuite> Wire for AcsMessage<C> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.proposer());
        match self {
            AcsMessage::Rbc(w) => w.msg.encode(buf),
            AcsMessage::Aba(w) => w.msg.encode(buf),
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let index = codec::get_u16(buf)?;
        let Some(&tag) = buf.chunk().first() else {
            return Err(DecodeError::malformed("acs message"));
        };
        match tag & 0xf0 {
            rbc::TAG_PROPOSE | rbc::TAG_ECHO | rbc::TAG_READY => Ok(AcsMessage::Rbc(
                Wrapped::new(SUBSYSTEM_RBC, index, RbcMessage::decode(buf)?),
            )),
            crate::aba::TAG_BVAL | crate::aba::TAG_AUX | crate::aba::TAG_COIN
            | crate::aba::TAG_DONE => Ok(AcsMessage::Aba(Wrapped::new(
                SUBSYSTEM_ABA,
                index,
                AbaMessage::decode(buf)?,
            ))),
            _ => Err(DecodeError::unknown_tag("acs message", tag)),
        }
    }
}

/// Asynchronous common subset automaton
pub struct Acs<C: Ciphersuite> {
    me: NodeId,
    me_index: PeerIndex,
    n: usize,
    f: usize,
    rbcs: Vec<Rbc>,
    abas: Vec<Aba<C>>,
    aba_input: Vec<bool>,
    output: Option<AcsOutput>,
}

impl<C: Ciphersuite> Acs<C> {
    /// Constructs an instance
    ///
    /// `salt` must be unique per instance, it separates coins of different instances.
    /// `peers` must be ordered the same way as public shares in `dk`.
    pub fn new(
        peers: Vec<NodeId>,
        me: NodeId,
        dk: Arc<DkShare<C::Curve>>,
        salt: &[u8],
        max_message_size: usize,
    ) -> Result<Self, ProtocolError> {
        let me_index = index_of(&peers, &me)
            .ok_or(ProtocolError::invalid_config("local node is not among peers"))?;
        let n = peers.len();
        let rbcs = peers
            .iter()
            .map(|proposer| {
                Rbc::new(
                    peers.clone(),
                    me,
                    *proposer,
                    max_message_size,
                    rbc::accept_all(),
                )
            })
            .collect();
        let abas = (0..n)
            .map(|j| {
                let mut coin_sid_prefix = salt.to_vec();
                coin_sid_prefix.extend_from_slice(&(j as u16).to_be_bytes());
                Aba::new(peers.clone(), me, dk.clone(), coin_sid_prefix)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            me,
            me_index,
            n,
            f: max_faulty(n),
            rbcs,
            abas,
            aba_input: vec![false; n],
            output: None,
        })
    }

    /// Indicates that the output is known and all agreements terminated, so the instance
    /// produces no more messages that peers need
    pub fn is_terminated(&self) -> bool {
        self.output.is_some() && self.abas.iter().all(|aba| aba.is_terminated())
    }

    fn rbc_out(index: PeerIndex, msgs: OutMessages<RbcMessage>) -> OutMessages<AcsMessage<C>> {
        wrapper::wrap(SUBSYSTEM_RBC, index, msgs, AcsMessage::Rbc)
    }

    fn aba_out(index: PeerIndex, msgs: OutMessages<AbaMessage<C>>) -> OutMessages<AcsMessage<C>> {
        wrapper::wrap(SUBSYSTEM_ABA, index, msgs, AcsMessage::Aba)
    }

    fn aba_input(
        &mut self,
        index: usize,
        value: bool,
    ) -> Result<OutMessages<AcsMessage<C>>, ProtocolError> {
        self.aba_input[index] = true;
        let aba = self.abas.get_mut(index).ok_or(Bug::OwnIndexOutOfRange)?;
        let msgs = aba.input(value)?;
        Ok(Self::aba_out(index as PeerIndex, msgs))
    }

    /// Moves the composition forward until nothing changes
    fn progress(&mut self) -> Result<OutMessages<AcsMessage<C>>, ProtocolError> {
        let mut out = OutMessages::new();
        loop {
            let mut changed = false;

            for j in 0..self.n {
                if !self.aba_input[j] && self.rbcs[j].output().is_some() {
                    out.add_all(self.aba_input(j, true)?);
                    changed = true;
                }
            }
            let ones = self
                .abas
                .iter()
                .filter(|aba| aba.output() == Some(&true))
                .count();
            if ones >= self.n - self.f {
                for j in 0..self.n {
                    if !self.aba_input[j] {
                        out.add_all(self.aba_input(j, false)?);
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }
        self.try_output();
        Ok(out)
    }

    fn try_output(&mut self) {
        if self.output.is_some() {
            return;
        }
        let mut output = AcsOutput::new();
        for (j, (aba, rbc)) in self.abas.iter().zip(&self.rbcs).enumerate() {
            match aba.output() {
                None => return,
                Some(false) => {}
                Some(true) => match rbc.output() {
                    Some(value) => {
                        output.insert(j as PeerIndex, value.clone());
                    }
                    None => return,
                },
            }
        }
        tracing::info!(me = %self.me, proposals = output.len(), "acs decided");
        self.output = Some(output);
    }

    fn handle_message(
        &mut self,
        from: NodeId,
        msg: AcsMessage<C>,
    ) -> Result<OutMessages<AcsMessage<C>>, wrapper::UnexpectedMessage> {
        Ok(match msg {
            AcsMessage::Rbc(w) => {
                let rbc = wrapper::resolve(w.subsystem, w.index, &mut self.rbcs)?;
                Self::rbc_out(w.index, rbc.message(from, w.msg))
            }
            AcsMessage::Aba(w) => {
                let aba = wrapper::resolve(w.subsystem, w.index, &mut self.abas)?;
                Self::aba_out(w.index, aba.message(from, w.msg))
            }
        })
    }
}

impl<C: Ciphersuite> Automaton for Acs<C> {
    type Input = Vec<u8>;
    type Message = AcsMessage<C>;
    type Output = AcsOutput;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        let me_index = self.me_index;
        let rbc = self
            .rbcs
            .get_mut(usize::from(me_index))
            .ok_or(Bug::OwnIndexOutOfRange)?;
        let mut out = Self::rbc_out(me_index, rbc.input(RbcInput::Broadcast(input))?);
        out.add_all(self.progress()?);
        Ok(out)
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        let mut out = match self.handle_message(from, msg) {
            Ok(out) => out,
            Err(err) => {
                tracing::warn!(peer = %from, error = %err, "acs message dropped");
                return OutMessages::new();
            }
        };
        match self.progress() {
            Ok(more) => {
                out.add_all(more);
            }
            Err(err) => tracing::error!(error = %err, "acs failed to make progress"),
        }
        out
    }

    fn output(&self) -> Option<&Self::Output> {
        self.output.as_ref()
    }

    fn status(&self) -> String {
        let delivered = self.rbcs.iter().filter(|r| r.output().is_some()).count();
        let decided: String = self
            .abas
            .iter()
            .map(|aba| match aba.output() {
                None => '?',
                Some(true) => '1',
                Some(false) => '0',
            })
            .collect();
        let stuck = self
            .abas
            .iter()
            .enumerate()
            .filter(|(_, aba)| aba.output().is_none())
            .map(|(j, aba)| format!("{j}:{}", aba.status()))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{{ACS:delivered={delivered}/{},decided={decided},done={},pending=[{stuck}]}}",
            self.n,
            self.output.is_some(),
        )
    }
}
