//! Local delivery of self-addressed messages

use std::collections::VecDeque;

use super::{Automaton, NodeId, OutMessages, Outgoing, ProtocolError};

/// Delivers messages the nested automaton addresses to the local node right away
///
/// Protocols are written symmetrically: a node broadcasting a value sends it to itself as
/// well. Such messages never hit the transport, the wrapper feeds them back into the nested
/// automaton until no more self-addressed messages are produced. Only messages for other
/// nodes are returned.
pub struct OwnHandler<A> {
    me: NodeId,
    nested: A,
}

impl<A: Automaton> OwnHandler<A> {
    /// Wraps `nested` running on node `me`
    pub fn new(me: NodeId, nested: A) -> Self {
        Self { me, nested }
    }

    /// Nested automaton
    pub fn nested(&self) -> &A {
        &self.nested
    }

    /// Calls the nested automaton directly, delivering resulting self-addressed messages
    pub fn nested_call(
        &mut self,
        f: impl FnOnce(&mut A) -> OutMessages<A::Message>,
    ) -> OutMessages<A::Message> {
        let msgs = f(&mut self.nested);
        self.deliver_own(msgs)
    }

    fn deliver_own(&mut self, msgs: OutMessages<A::Message>) -> OutMessages<A::Message> {
        let mut queue: VecDeque<_> = msgs.into_iter().collect();
        let mut out = OutMessages::new();
        while let Some(Outgoing { to, msg }) = queue.pop_front() {
            if to == self.me {
                queue.extend(self.nested.message(self.me, msg));
            } else {
                out.add(to, msg);
            }
        }
        out
    }
}

impl<A: Automaton> Automaton for OwnHandler<A> {
    type Input = A::Input;
    type Message = A::Message;
    type Output = A::Output;

    fn input(&mut self, input: Self::Input) -> Result<OutMessages<Self::Message>, ProtocolError> {
        let msgs = self.nested.input(input)?;
        Ok(self.deliver_own(msgs))
    }

    fn message(&mut self, from: NodeId, msg: Self::Message) -> OutMessages<Self::Message> {
        let msgs = self.nested.message(from, msg);
        self.deliver_own(msgs)
    }

    fn output(&self) -> Option<&Self::Output> {
        self.nested.output()
    }

    fn status(&self) -> String {
        self.nested.status()
    }
}
