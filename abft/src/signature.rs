//! Schnorr signature

use core::fmt;

use bytes::{Bytes, BytesMut};
use generic_ec::{Point, Scalar};

use crate::{
    codec::{self, DecodeError, Wire},
    Ciphersuite,
};

/// Schnorr Signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(bound = "")
)]
pub struct Signature<C: Ciphersuite> {
    /// $R$ component of the signature
    pub r: Point<C::Curve>,
    /// $z$ component of the signature
    pub z: Scalar<C::Curve>,
}

impl<C: Ciphersuite> Signature<C> {
    /// Verifies signature against a public key and a message
    pub fn verify(&self, public_key: &Point<C::Curve>, msg: &[u8]) -> Result<(), InvalidSignature> {
        let challenge = C::compute_challenge(&self.r, public_key, msg);

        let lhs = Point::generator() * self.z;
        let rhs = self.r + *public_key * challenge;

        if lhs == rhs {
            Ok(())
        } else {
            Err(InvalidSignature)
        }
    }
}

impl<C: Ciphersuite> Wire for Signature<C> {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_point::<C>(buf, &self.r);
        codec::put_scalar::<C>(buf, &self.z);
    }
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            r: codec::get_point::<C>(buf)?,
            z: codec::get_scalar::<C>(buf)?,
        })
    }
}

/// Signature verification failed
#[derive(Debug)]
pub struct InvalidSignature;

impl fmt::Display for InvalidSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid signature")
    }
}

impl std::error::Error for InvalidSignature {}
