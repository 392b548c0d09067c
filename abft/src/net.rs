//! Transport
//!
//! Services send messages through [`Transport`] and receive them by having the embedder call
//! their `receive` method with the sender's index and the raw payload. The transport gives no
//! guarantees: messages may be lost, reordered, or duplicated. Protocols build their own
//! redelivery on top of it.

use std::sync::Arc;

use bytes::Bytes;

use crate::PeerIndex;

/// Fire-and-forget transport to committee members
pub trait Transport: Send + Sync + 'static {
    /// Sends `payload` to member `to`
    ///
    /// Must not block. Delivery is not guaranteed.
    fn send(&self, to: PeerIndex, payload: Bytes);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, to: PeerIndex, payload: Bytes) {
        (**self).send(to, payload)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, to: PeerIndex, payload: Bytes) {
        (**self).send(to, payload)
    }
}
