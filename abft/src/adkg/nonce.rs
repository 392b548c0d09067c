//! Nonce-DKG
//!
//! Generates a one-time secret nonce for a single [signature](crate::dss). Differs from
//! [ADKG](super::Adkg) in that the local proposal is the set of the first $n-f$ completed
//! sharings, and it's not broadcast: proposals are agreed by an external common subset run
//! by the caller.

use rand_chacha::ChaCha20Rng;

use crate::{
    acss::AcssMessage,
    gpa::{wrapper::Wrapped, Automaton, NodeId, OutMessages, ProtocolError},
    key::{max_faulty, Committee, NodeIdentity},
    Ciphersuite, PeerIndex,
};

use super::{agreement, Dealings, DkgInput, DkgOutput};

/// Message of [`NonceDkg`]
pub type NonceMessage<C> = Wrapped<AcssMessage<C>>;

/// Nonce-DKG automaton
pub struct NonceDkg<C: Ciphersuite> {
    me: NodeId,
    n: usize,
    f: usize,
    dealings: Dealings<C>,
    agreed: Option<Vec<PeerIndex>>,
    output: DkgOutput<C>,
}

impl<C: Ciphersuite> NonceDkg<C> {
    /// Constructs an instance
    ///
    /// `rng` seeds own dealing. It must not be reused for anything else.
    pub fn new(
        committee: Committee<C>,
        identity: NodeIdentity<C>,
        rng: ChaCha20Rng,
    ) -> Result<Self, ProtocolError> {
        let dealings = Dealings::new(&committee, &identity, rng)?;
        let n = committee.n();
        Ok(Self {
            me: identity.node_id(),
            n,
            f: max_faulty(n),
            dealings,
            agreed: None,
            output: DkgOutput {
                indexes: None,
                key: None,
            },
        })
    }

    fn on_progress(&mut self) {
        if self.output.indexes.is_none() && self.dealings.completed_len() >= self.n - self.f {
            let indexes = self.dealings.completed();
            tracing::debug!(me = %self.me, ?indexes, "nonce dealers proposed");
            self.output.indexes = Some(indexes);
        }
        if self.output.key.is_some() {
            return;
        }
        // Agreed sharing may not be completed locally yet, it's retried on every completion
        if let Some(agreed) = &self.agreed {
            match self.dealings.sum(agreed) {
                Some(key) => {
                    tracing::debug!(me = %self.me, "nonce generated");
                    self.output.key = Some(key);
                }
                None => tracing::trace!(me = %self.me, ?agreed, "waiting for agreed sharings"),
            }
        }
    }
}

impl<C: Ciphersuite> Automaton for NonceDkg<C> {
    type Input = DkgInput;
    type Message = NonceMessage<C>;
    type Output = DkgOutput<C>;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        let out = match input {
            DkgInput::Start => self.dealings.start()?,
            DkgInput::AgreementResult(proposals) => {
                if self.agreed.is_some() {
                    return Err(ProtocolError::duplicate_input("agreement result"));
                }
                let agreed = agreement::decide_indexes(&proposals, self.n, self.f)?;
                self.agreed = Some(agreed);
                OutMessages::new()
            }
        };
        self.on_progress();
        Ok(out)
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        match self.dealings.message(from, msg) {
            Ok((out, completed)) => {
                if completed {
                    self.on_progress();
                }
                out
            }
            Err(err) => {
                tracing::warn!(peer = %from, error = %err, "nonce message dropped");
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
            "{{NONCE:completed={},agreed={:?},done={},acss=[{}]}}",
            self.dealings.completed_len(),
            self.agreed,
            self.output.key.is_some(),
            self.dealings.status(),
        )
    }
}
