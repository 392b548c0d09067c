//! Keys: long-term distributed key shares, node identities and committees

use core::fmt;

use digest::{FixedOutput, Update};
use generic_ec::{Curve, NonZero, Point, Scalar, SecretScalar};
use rand_core::{CryptoRng, RngCore};

use crate::{Ciphersuite, NodeId, PeerIndex};

/// Maximum number of faulty members tolerated by a committee of `n` members
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Long-term distributed key share
///
/// Read-only from the protocols' point of view. Holds everything a committee member knows
/// about a $t$-out-of-$n$ shared key: the shared public key, public shares of all members,
/// evaluation points of the sharing polynomial, and own secret share.
///
/// Can be imported from [`KeyShare`](crate::key_share::KeyShare) (e.g. generated by trusted
/// dealer), or obtained from [ADKG](crate::adkg).
#[derive(Clone)]
pub struct DkShare<E: Curve> {
    index: PeerIndex,
    threshold: u16,
    shared_public_key: Point<E>,
    public_shares: Vec<Point<E>>,
    eval_points: Vec<NonZero<Scalar<E>>>,
    secret_share: SecretScalar<E>,
}

impl<E: Curve> DkShare<E> {
    /// Constructs a key share, validating its consistency
    pub fn new(
        index: PeerIndex,
        threshold: u16,
        shared_public_key: Point<E>,
        public_shares: Vec<Point<E>>,
        eval_points: Vec<NonZero<Scalar<E>>>,
        secret_share: SecretScalar<E>,
    ) -> Result<Self, InvalidKeyShare> {
        let n = public_shares.len();
        if eval_points.len() != n {
            return Err(Reason::EvalPointsLength {
                n,
                eval_points: eval_points.len(),
            }
            .into());
        }
        if threshold == 0 || usize::from(threshold) > n {
            return Err(Reason::Threshold { threshold, n }.into());
        }
        let own_public_share = public_shares
            .get(usize::from(index))
            .ok_or(Reason::IndexOutOfRange { index, n })?;
        if Point::generator() * &secret_share != *own_public_share {
            return Err(Reason::SecretShareMismatch.into());
        }
        if !crate::poly::distinct(&eval_points) {
            return Err(Reason::DuplicateEvalPoints.into());
        }
        Ok(Self {
            index,
            threshold,
            shared_public_key,
            public_shares,
            eval_points,
            secret_share,
        })
    }

    /// Number of members sharing the key
    pub fn n(&self) -> u16 {
        self.public_shares.len() as u16
    }
    /// Minimal number of members required to sign
    pub fn threshold(&self) -> u16 {
        self.threshold
    }
    /// Index of the local member
    pub fn index(&self) -> PeerIndex {
        self.index
    }
    /// Shared public key
    pub fn shared_public_key(&self) -> Point<E> {
        self.shared_public_key
    }
    /// Public share of member `j`
    pub fn public_share(&self, j: PeerIndex) -> Option<Point<E>> {
        self.public_shares.get(usize::from(j)).copied()
    }
    /// Public shares of all members
    pub fn public_shares(&self) -> &[Point<E>] {
        &self.public_shares
    }
    /// Evaluation point of member `j`
    pub fn eval_point(&self, j: PeerIndex) -> Option<NonZero<Scalar<E>>> {
        self.eval_points.get(usize::from(j)).copied()
    }
    /// Evaluation points of all members
    pub fn eval_points(&self) -> &[NonZero<Scalar<E>>] {
        &self.eval_points
    }
    /// Secret share of the local member
    pub fn secret_share(&self) -> &SecretScalar<E> {
        &self.secret_share
    }
}

impl<E: Curve> fmt::Debug for DkShare<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkShare")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("n", &self.n())
            .field("shared_public_key", &self.shared_public_key)
            .finish_non_exhaustive()
    }
}

impl<E: Curve> TryFrom<&crate::key_share::KeyShare<E>> for DkShare<E> {
    type Error = InvalidKeyShare;

    fn try_from(key_share: &crate::key_share::KeyShare<E>) -> Result<Self, Self::Error> {
        if key_share.vss_setup.is_none() {
            return Err(Reason::NotThreshold.into());
        }
        let n = key_share.public_shares.len();
        let eval_points = (0..n)
            .map(|j| {
                u16::try_from(j)
                    .ok()
                    .and_then(|j| key_share.share_preimage(j))
                    .ok_or(Reason::IndexOutOfRange {
                        index: j as u16,
                        n,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        DkShare::new(
            key_share.i,
            key_share.min_signers(),
            *AsRef::<Point<E>>::as_ref(&key_share.shared_public_key),
            key_share
                .public_shares
                .iter()
                .map(|p| *AsRef::<Point<E>>::as_ref(p))
                .collect(),
            eval_points,
            AsRef::<SecretScalar<E>>::as_ref(&key_share.x).clone(),
        )
    }
}

impl<E: Curve> TryFrom<crate::key_share::KeyShare<E>> for DkShare<E> {
    type Error = InvalidKeyShare;

    fn try_from(key_share: crate::key_share::KeyShare<E>) -> Result<Self, Self::Error> {
        DkShare::try_from(&key_share)
    }
}

/// Default evaluation points: member `j` evaluates the sharing polynomial at $j + 1$
pub fn default_eval_points<E: Curve>(n: u16) -> Vec<NonZero<Scalar<E>>> {
    (1..=n)
        .filter_map(|x| NonZero::from_scalar(Scalar::from(u64::from(x))))
        .collect()
}

/// Long-term identity of a node
///
/// Identity key is used to encrypt shares dealt to the node in [ACSS](crate::acss). The
/// [node id](NodeId) is derived from the public key.
#[derive(Clone)]
pub struct NodeIdentity<C: Ciphersuite> {
    secret_key: SecretScalar<C::Curve>,
    public_key: Point<C::Curve>,
    node_id: NodeId,
}

impl<C: Ciphersuite> NodeIdentity<C> {
    /// Generates a random identity
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self::from_secret_key(SecretScalar::random(rng))
    }
    /// Constructs identity from the secret key
    pub fn from_secret_key(secret_key: SecretScalar<C::Curve>) -> Self {
        let public_key = Point::generator() * &secret_key;
        Self {
            secret_key,
            public_key,
            node_id: node_id_of::<C>(&public_key),
        }
    }
    /// Secret key
    pub fn secret_key(&self) -> &SecretScalar<C::Curve> {
        &self.secret_key
    }
    /// Public key
    pub fn public_key(&self) -> Point<C::Curve> {
        self.public_key
    }
    /// Node id derived from the public key
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

/// Derives node id from its public key
pub fn node_id_of<C: Ciphersuite>(public_key: &Point<C::Curve>) -> NodeId {
    let id = C::digest(b"node-id")
        .chain(C::serialize_point(public_key).as_ref())
        .finalize_fixed();
    NodeId::new(id.into())
}

/// Ordered list of committee members and their identity public keys
///
/// Order is stable for the lifetime of a protocol instance: member index used by the
/// protocols is the position in this list.
#[derive(Clone, Debug)]
pub struct Committee<C: Ciphersuite> {
    members: Vec<NodeId>,
    public_keys: Vec<Point<C::Curve>>,
}

impl<C: Ciphersuite> Committee<C> {
    /// Constructs a committee from identity public keys of its members
    pub fn from_public_keys(public_keys: Vec<Point<C::Curve>>) -> Self {
        Self {
            members: public_keys.iter().map(node_id_of::<C>).collect(),
            public_keys,
        }
    }
    /// Member ids, ordered
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }
    /// Identity public keys of members, ordered
    pub fn public_keys(&self) -> &[Point<C::Curve>] {
        &self.public_keys
    }
    /// Number of members
    pub fn n(&self) -> usize {
        self.members.len()
    }
    /// Number of tolerated faulty members
    pub fn f(&self) -> usize {
        max_faulty(self.n())
    }
    /// Index of member `id`
    pub fn index_of(&self, id: &NodeId) -> Option<PeerIndex> {
        crate::gpa::index_of(&self.members, id)
    }
}

/// Key share is not valid
#[derive(Debug)]
pub struct InvalidKeyShare(Reason);

#[derive(Debug)]
enum Reason {
    NotThreshold,
    EvalPointsLength { n: usize, eval_points: usize },
    Threshold { threshold: u16, n: usize },
    IndexOutOfRange { index: u16, n: usize },
    SecretShareMismatch,
    DuplicateEvalPoints,
}

impl From<Reason> for InvalidKeyShare {
    fn from(err: Reason) -> Self {
        Self(err)
    }
}

impl fmt::Display for InvalidKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Reason::NotThreshold => f.write_str("key share is not a threshold key share"),
            Reason::EvalPointsLength { n, eval_points } => write!(
                f,
                "key is shared among {n} members, but {eval_points} evaluation points provided"
            ),
            Reason::Threshold { threshold, n } => {
                write!(f, "threshold {threshold} is not in range [1; {n}]")
            }
            Reason::IndexOutOfRange { index, n } => {
                write!(f, "index {index} is out of range [0; {n})")
            }
            Reason::SecretShareMismatch => {
                f.write_str("secret share doesn't match the public share")
            }
            Reason::DuplicateEvalPoints => f.write_str("evaluation points are not distinct"),
        }
    }
}

impl std::error::Error for InvalidKeyShare {}
