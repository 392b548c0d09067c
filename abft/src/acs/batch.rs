//! Wire unit of a common subset session
//!
//! ```text
//! session_id: u64 | state_index: u32 | id: u32 | src: u16 | dst: u16
//! msg_count: u16  | msg_count × (proposer: u16 | tag: u8 | payload)
//! ack_count: u16  | ack_count × id: u32
//! ```
//!
//! Batch with `id = 0` carries only acknowledgements and is never acknowledged itself.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{self, DecodeError, Wire},
    Ciphersuite, PeerIndex,
};

use super::AcsMessage;

/// Id of batches that only carry acknowledgements
pub const ACK_ONLY: u32 = 0;

/// Batch of messages of a single common subset session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBatch<C: Ciphersuite> {
    /// Session id
    pub session_id: u64,
    /// State index of the session
    pub state_index: u32,
    /// Batch id, unique within the session at the sender
    pub id: u32,
    /// Sender
    pub src: PeerIndex,
    /// Recipient
    pub dst: PeerIndex,
    /// Protocol messages
    pub msgs: Vec<AcsMessage<C>>,
    /// Ids of acknowledged batches previously received from `dst`
    pub acks: Vec<u32>,
}

impl<C: Ciphersuite> MsgBatch<C> {
    /// Indicates that the batch carries only acknowledgements
    pub fn is_ack_only(&self) -> bool {
        self.id == ACK_ONLY
    }
}

impl<C: Ciphersuite> Wire for MsgBatch<C> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.session_id);
        buf.put_u32(self.state_index);
        buf.put_u32(self.id);
        buf.put_u16(self.src);
        buf.put_u16(self.dst);
        buf.put_u16(self.msgs.len() as u16);
        for msg in &self.msgs {
            msg.encode(buf);
        }
        buf.put_u16(self.acks.len() as u16);
        for ack in &self.acks {
            buf.put_u32(*ack);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let session_id = codec::get_u64(buf)?;
        let state_index = codec::get_u32(buf)?;
        let id = codec::get_u32(buf)?;
        let src = codec::get_u16(buf)?;
        let dst = codec::get_u16(buf)?;
        let msg_count = codec::get_u16(buf)?;
        let msgs = (0..msg_count)
            .map(|_| AcsMessage::decode(buf))
            .collect::<Result<Vec<_>, _>>()?;
        let ack_count = codec::get_u16(buf)?;
        let acks = (0..ack_count)
            .map(|_| codec::get_u32(buf))
            .collect::<Result<Vec<_>, _>>()?;
        if id == ACK_ONLY && !msgs.is_empty() {
            return Err(DecodeError::malformed("ack-only batch carrying messages"));
        }
        Ok(Self {
            session_id,
            state_index,
            id,
            src,
            dst,
            msgs,
            acks,
        })
    }
}
