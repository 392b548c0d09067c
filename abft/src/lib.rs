//! Asynchronous BFT agreement, key generation and threshold Schnorr signing for a fixed committee
//!
//! Committee of $n$ members tolerates up to $f = \lfloor (n - 1) / 3 \rfloor$ byzantine members and
//! makes progress without any timing assumptions. All protocols are expressed as deterministic
//! [automata](gpa::Automaton): they consume local inputs and network messages and produce
//! messages to be sent, never performing I/O themselves. Thin async services put them on top of a
//! [transport](net::Transport) that may drop, reorder or duplicate messages.
//!
//! This crate provides:
//! * [Automaton framework](gpa) \
//!   State machine contract, [message wrapper](gpa::wrapper) for nesting automata, and an
//!   [acknowledgement handler](gpa::ack_handler) adding at-least-once delivery.
//! * [Common Coin](coin) \
//!   Threshold coin: shared randomness that no coalition of $f$ members can predict.
//! * [Reliable Broadcast](rbc) and [Binary Agreement](aba)
//! * [Asynchronous Common Subset](acs) \
//!   HoneyBadgerBFT composition plus the [session layer](acs::session) with explicit
//!   redelivery and the [coordinator](acs::coordinator) multiplexing many sessions.
//! * [ACSS](acss), [ADKG](adkg) and [Nonce-DKG](adkg::nonce) \
//!   Asynchronous verifiable secret sharing and distributed key generation.
//! * [Distributed Schnorr Signing](dss) \
//!   One-time nonce is generated by Nonce-DKG and combined with a long-term key share; the
//!   [node](dss::node) manages series of signing instances over a transport.

#![forbid(unsafe_code, unused_crate_dependencies)]
#![deny(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use generic_ec;

pub mod aba;
pub mod acs;
pub mod acss;
pub mod adkg;
pub mod ciphersuite;
pub mod codec;
pub mod coin;
pub mod config;
pub mod dleq;
pub mod dss;
pub mod gpa;
pub mod key;
pub mod net;
pub mod poly;
pub mod rbc;
pub mod signature;
pub mod window;

/// Key share
///
/// This module re-exports type definitions from [`key_share`](::key_share) crate. Long-term key
/// shares are imported into the protocols via [`DkShare`](crate::key::DkShare).
pub mod key_share {
    #[doc(inline)]
    pub use key_share::{CoreKeyShare as KeyShare, KeyInfo, VssSetup};

    #[cfg(feature = "spof")]
    #[doc(inline)]
    pub use key_share::reconstruct_secret_key;
}

/// Trusted dealer
///
/// Trusted dealer generates key shares in one place, which creates SPOF/T (single point of
/// failure/trust). It's mainly intended to be used in tests, real deployments should run
/// [ADKG](crate::adkg).
///
/// ## Example
/// Generate 3-out-of-4 long-term key:
/// ```rust,no_run
/// use abft::generic_ec::curves::Secp256k1;
/// use rand_core::SeedableRng;
///
/// let mut rng = rand_chacha::ChaCha20Rng::from_seed([0u8; 32]);
///
/// let key_shares = abft::trusted_dealer::builder::<Secp256k1>(4)
///     .set_threshold(Some(3))
///     .generate_shares(&mut rng)?;
/// let dk_shares = key_shares
///     .iter()
///     .map(abft::key::DkShare::try_from)
///     .collect::<Result<Vec<_>, _>>()?;
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
#[cfg(feature = "spof")]
pub mod trusted_dealer {
    pub use key_share::trusted_dealer::*;
}

pub use self::{
    ciphersuite::Ciphersuite,
    gpa::{Automaton, NodeId, OutMessages},
    key::DkShare,
};

/// Index of a committee member, position of the member in the ordered member list
pub type PeerIndex = u16;
