//! Routing messages of nested automata
//!
//! A parent automaton that runs several families of nested automata (e.g. ACS runs $n$ RBC and
//! $n$ ABA instances) tags every nested message with `(subsystem, index)`: subsystem selects the
//! family, index selects the instance within it. On receipt, the parent [resolves](resolve) the
//! pair back into the nested instance. Pairs that don't resolve are reported as
//! [`UnexpectedMessage`].

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{self, DecodeError, Wire};

use super::OutMessages;

/// Family of nested automata within a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subsystem(pub u8);

/// Message of a nested automaton
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapped<M> {
    /// Family the nested automaton belongs to
    pub subsystem: Subsystem,
    /// Index of the nested automaton within the family
    pub index: u16,
    /// Nested message
    pub msg: M,
}

impl<M> Wrapped<M> {
    /// Wraps a message
    pub fn new(subsystem: Subsystem, index: u16, msg: M) -> Self {
        Self {
            subsystem,
            index,
            msg,
        }
    }
}

/// Wraps every message produced by nested automaton `(subsystem, index)`
///
/// `into` lifts wrapped message into the parent's message type.
pub fn wrap<M, P>(
    subsystem: Subsystem,
    index: u16,
    msgs: OutMessages<M>,
    mut into: impl FnMut(Wrapped<M>) -> P,
) -> OutMessages<P> {
    msgs.map(|msg| into(Wrapped::new(subsystem, index, msg)))
}

/// Resolves `(subsystem, index)` into the nested automaton
pub fn resolve<T>(
    subsystem: Subsystem,
    index: u16,
    instances: &mut [T],
) -> Result<&mut T, UnexpectedMessage> {
    instances
        .get_mut(usize::from(index))
        .ok_or(UnexpectedMessage { subsystem, index })
}

impl<M: Wire> Wire for Wrapped<M> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.subsystem.0);
        buf.put_u16(self.index);
        self.msg.encode(buf)
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let subsystem = Subsystem(codec::get_u8(buf)?);
        let index = codec::get_u16(buf)?;
        let msg = M::decode(buf)?;
        Ok(Self {
            subsystem,
            index,
            msg,
        })
    }
}

/// Message addressed to a nested automaton that doesn't exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnexpectedMessage {
    /// Subsystem the message was addressed to
    pub subsystem: Subsystem,
    /// Index the message was addressed to
    pub index: u16,
}

impl fmt::Display for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected message for subsystem {} index {}",
            self.subsystem.0, self.index
        )
    }
}

impl std::error::Error for UnexpectedMessage {}
