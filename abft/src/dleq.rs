//! Proof of discrete log equality (Chaum-Pedersen)
//!
//! Proves that $P_1 = x \cdot B_1$ and $P_2 = x \cdot B_2$ for the same secret $x$ without
//! revealing it. Used by the [common coin](crate::coin) to show that a coin share was produced
//! by the holder of a public key share, and by [ACSS](crate::acss) to reveal decryption keys.
//!
//! The proof is non-interactive (Fiat-Shamir). Proving nonce is derived deterministically from
//! the secret and the statement, so proving requires no randomness and the automata using it
//! stay deterministic.

use core::fmt;

use bytes::{Bytes, BytesMut};
use generic_ec::{Point, Scalar, SecretScalar};

use crate::{
    codec::{self, DecodeError},
    Ciphersuite,
};

/// DLEQ statement
#[derive(Debug, Clone, Copy)]
pub struct Statement<'a, C: Ciphersuite> {
    /// First base $B_1$
    pub base1: &'a Point<C::Curve>,
    /// $P_1 = x \cdot B_1$
    pub point1: &'a Point<C::Curve>,
    /// Second base $B_2$
    pub base2: &'a Point<C::Curve>,
    /// $P_2 = x \cdot B_2$
    pub point2: &'a Point<C::Curve>,
    /// Context the proof is bound to
    pub context: &'a [u8],
}

/// DLEQ proof
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Proof<C: Ciphersuite> {
    challenge: Scalar<C::Curve>,
    response: Scalar<C::Curve>,
}

impl<C: Ciphersuite> Proof<C> {
    /// Proves the statement knowing `secret` $x$
    pub fn prove(secret: &SecretScalar<C::Curve>, statement: Statement<C>) -> Self {
        let mut nonce = C::hash_to_scalar(
            b"dleq-nonce",
            &[
                C::serialize_scalar(secret.as_ref()).as_ref(),
                C::serialize_point(statement.base2).as_ref(),
                C::serialize_point(statement.point2).as_ref(),
                statement.context,
            ],
        );
        let nonce = SecretScalar::new(&mut nonce);
        let commit1 = *statement.base1 * &nonce;
        let commit2 = *statement.base2 * &nonce;
        let challenge = Self::challenge(&statement, &commit1, &commit2);
        let response = nonce.as_ref() + challenge * secret.as_ref();
        Self {
            challenge,
            response,
        }
    }

    /// Verifies the proof
    pub fn verify(&self, statement: Statement<C>) -> Result<(), InvalidProof> {
        let commit1 = *statement.base1 * self.response - *statement.point1 * self.challenge;
        let commit2 = *statement.base2 * self.response - *statement.point2 * self.challenge;
        if Self::challenge(&statement, &commit1, &commit2) == self.challenge {
            Ok(())
        } else {
            Err(InvalidProof)
        }
    }

    fn challenge(
        statement: &Statement<C>,
        commit1: &Point<C::Curve>,
        commit2: &Point<C::Curve>,
    ) -> Scalar<C::Curve> {
        C::hash_to_scalar(
            b"dleq",
            &[
                C::serialize_point(statement.base1).as_ref(),
                C::serialize_point(statement.point1).as_ref(),
                C::serialize_point(statement.base2).as_ref(),
                C::serialize_point(statement.point2).as_ref(),
                C::serialize_point(commit1).as_ref(),
                C::serialize_point(commit2).as_ref(),
                statement.context,
            ],
        )
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        codec::put_scalar::<C>(buf, &self.challenge);
        codec::put_scalar::<C>(buf, &self.response);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            challenge: codec::get_scalar::<C>(buf)?,
            response: codec::get_scalar::<C>(buf)?,
        })
    }
}

impl<C: Ciphersuite> fmt::Debug for Proof<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proof").finish_non_exhaustive()
    }
}

/// DLEQ proof is invalid
#[derive(Debug)]
pub struct InvalidProof;

impl fmt::Display for InvalidProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid DLEQ proof")
    }
}

impl std::error::Error for InvalidProof {}
