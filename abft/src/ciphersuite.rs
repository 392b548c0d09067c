//! Ciphersuite
//!
//! Ciphersuite specifies which curve and hash primitives are used by the protocols: common coin,
//! DLEQ proofs, encryption of ACSS deals and Schnorr signatures all go through it.
//!
//! Out of the box, we provide:
//! * [Secp256k1], requires `ciphersuite-secp256k1` feature

use generic_ec::{
    errors::{InvalidPoint, InvalidScalar},
    Curve, Point, Scalar, SecretScalar,
};

#[cfg(feature = "ciphersuite-secp256k1")]
mod secp256k1;

#[cfg(feature = "ciphersuite-secp256k1")]
pub use secp256k1::Secp256k1;

/// Ciphersuite determines an underlying curve and set of cryptographic primitives
/// used in the protocols
pub trait Ciphersuite: Sized + Clone + Copy + core::fmt::Debug + Send + Sync + 'static {
    /// Name of the ciphersuite, used for domain separation of every hash
    const NAME: &'static str;

    /// Underlying curve
    type Curve: Curve;

    /// Digest used to derive fixed-size byte strings (coin values, node ids, encryption pads)
    type Digest: digest::Update
        + digest::FixedOutput
        + digest::OutputSizeUser<OutputSize = digest::consts::U32>
        + Default
        + Clone;

    /// Hashes a list of bytestrings into a scalar
    ///
    /// `tag` separates domains: the same `msg` hashed under different tags produces
    /// independent scalars.
    fn hash_to_scalar(tag: &[u8], msg: &[&[u8]]) -> Scalar<Self::Curve>;

    /// Hashes a list of bytestrings into a point with unknown discrete logarithm
    fn hash_to_point(tag: &[u8], msg: &[&[u8]]) -> Point<Self::Curve>;

    /// Computes the challenge according to Schnorr scheme
    fn compute_challenge(
        commitment: &Point<Self::Curve>,
        public_key: &Point<Self::Curve>,
        msg: &[u8],
    ) -> Scalar<Self::Curve> {
        Self::hash_to_scalar(
            b"chal",
            &[
                Self::serialize_point(commitment).as_ref(),
                Self::serialize_point(public_key).as_ref(),
                msg,
            ],
        )
    }

    /// Digest prefixed with the suite name and `tag`
    fn digest(tag: &[u8]) -> Self::Digest {
        use digest::Update;
        Self::Digest::default()
            .chain(Self::NAME.as_bytes())
            .chain(tag)
    }

    /// Byte array that contains bytes representation of the point
    type PointBytes: AsRef<[u8]>;
    /// Serializes point
    fn serialize_point(point: &Point<Self::Curve>) -> Self::PointBytes;
    /// Deserializes point
    fn deserialize_point(bytes: &[u8]) -> Result<Point<Self::Curve>, InvalidPoint>;

    /// Byte array that contains bytes representation of the scalar
    type ScalarBytes: AsRef<[u8]>;
    /// Size of serialized scalar in bytes
    const SCALAR_SIZE: usize;
    /// Serializes scalar
    fn serialize_scalar(scalar: &Scalar<Self::Curve>) -> Self::ScalarBytes;
    /// Deserializes scalar
    fn deserialize_scalar(bytes: &[u8]) -> Result<Scalar<Self::Curve>, InvalidScalar>;
    /// Deserializes secret scalar
    fn deserialize_secret_scalar(bytes: &[u8]) -> Result<SecretScalar<Self::Curve>, InvalidScalar> {
        let mut scalar = Self::deserialize_scalar(bytes)?;
        Ok(SecretScalar::new(&mut scalar))
    }
}
