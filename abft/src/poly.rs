//! Polynomials, Feldman commitments and Lagrange interpolation

use core::iter;

use generic_ec::{Curve, NonZero, Point, Scalar, SecretScalar};
use rand_core::{CryptoRng, RngCore};

/// Polynomial $f(x) = \sum_k a_k x^k$ over the scalar field
pub struct Polynomial<E: Curve> {
    coefs: Vec<SecretScalar<E>>,
}

impl<E: Curve> Polynomial<E> {
    /// Samples a random polynomial of given `degree` with $f(0) = $ `secret`
    pub fn sample(
        rng: &mut (impl RngCore + CryptoRng),
        degree: usize,
        secret: SecretScalar<E>,
    ) -> Self {
        let coefs = iter::once(secret)
            .chain(iter::repeat_with(|| SecretScalar::random(rng)).take(degree))
            .collect();
        Self { coefs }
    }

    /// Evaluates $f(x)$
    pub fn eval(&self, x: &Scalar<E>) -> SecretScalar<E> {
        // Horner's method
        let mut acc = self
            .coefs
            .iter()
            .rev()
            .fold(Scalar::zero(), |acc, coef| acc * x + coef.as_ref());
        SecretScalar::new(&mut acc)
    }

    /// Feldman commitment $\\{a_k \cdot G\\}_k$
    pub fn commit(&self) -> Commitment<E> {
        Commitment(
            self.coefs
                .iter()
                .map(|coef| Point::generator() * coef)
                .collect(),
        )
    }
}

/// Feldman commitment to a polynomial
///
/// $k$-th point commits to $k$-th coefficient of the polynomial, so the commitment evaluated at
/// $x$ equals $f(x) \cdot G$.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment<E: Curve>(pub Vec<Point<E>>);

impl<E: Curve> Commitment<E> {
    /// Evaluates the committed polynomial "in the exponent", i.e. returns $f(x) \cdot G$
    pub fn eval(&self, x: &Scalar<E>) -> Point<E> {
        self.0
            .iter()
            .rev()
            .fold(Point::zero(), |acc, coef| acc * x + coef)
    }

    /// Commitment to the free term, $f(0) \cdot G$
    pub fn constant_term(&self) -> Point<E> {
        self.0.first().copied().unwrap_or_else(Point::zero)
    }

    /// Number of coefficients (degree + 1)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Indicates that commitment has no coefficients
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks that `share` is the evaluation of the committed polynomial at `x`
    pub fn verify_share(&self, x: &Scalar<E>, share: &Scalar<E>) -> bool {
        Point::generator() * share == self.eval(x)
    }

    /// Commitment to the sum of committed polynomials
    pub fn sum<'a>(commitments: impl IntoIterator<Item = &'a Commitment<E>>) -> Self {
        let mut acc: Vec<Point<E>> = vec![];
        for commitment in commitments {
            if acc.len() < commitment.0.len() {
                acc.resize(commitment.0.len(), Point::zero());
            }
            for (acc, coef) in acc.iter_mut().zip(&commitment.0) {
                *acc = *acc + coef;
            }
        }
        Self(acc)
    }
}

/// Computes Lagrange coefficient $\lambda_i(x)$ for interpolation at `x`
///
/// $\lambda_i(x) = \prod_{j \ne i} \frac{x - x_j}{x_i - x_j}$
///
/// Returns `None` if `x_i` is not in `points`, or if some point appears in the list more than
/// once.
pub fn lagrange_coefficient<E: Curve>(
    points: &[NonZero<Scalar<E>>],
    x_i: &NonZero<Scalar<E>>,
    x: &Scalar<E>,
) -> Option<Scalar<E>> {
    let mut x_i_observed = false;

    let mut num = Scalar::one();
    let mut denom = NonZero::<Scalar<E>>::one();

    for x_j in points {
        let Some(substraction) = NonZero::from_scalar(x_i - x_j) else {
            if x_i_observed {
                // x_i appears twice
                return None;
            }
            x_i_observed = true;
            continue;
        };
        num = num * (x - x_j.as_ref());
        denom = denom * substraction;
    }

    if !x_i_observed {
        return None;
    }

    Some(num * denom.invert())
}

/// Interpolates $f(x)$ from shares $\\{(x_j, f(x_j))\\}_j$
///
/// Returns `None` if evaluation points are not distinct. Result is correct only if
/// `shares.len()` is more than the degree of $f$.
pub fn interpolate<E: Curve>(
    shares: &[(NonZero<Scalar<E>>, Scalar<E>)],
    x: &Scalar<E>,
) -> Option<Scalar<E>> {
    let points = shares.iter().map(|(x_j, _)| *x_j).collect::<Vec<_>>();
    if !distinct(&points) {
        return None;
    }
    shares.iter().try_fold(Scalar::zero(), |acc, (x_j, y_j)| {
        Some(acc + lagrange_coefficient(&points, x_j, x)? * y_j)
    })
}

/// Interpolates $f(x) \cdot B$ from shares $\\{(x_j, f(x_j) \cdot B)\\}_j$ "in the exponent"
///
/// Same requirements as for [`interpolate`] apply.
pub fn interpolate_points<E: Curve>(
    shares: &[(NonZero<Scalar<E>>, Point<E>)],
    x: &Scalar<E>,
) -> Option<Point<E>> {
    let points = shares.iter().map(|(x_j, _)| *x_j).collect::<Vec<_>>();
    if !distinct(&points) {
        return None;
    }
    shares.iter().try_fold(Point::zero(), |acc, (x_j, y_j)| {
        Some(acc + *y_j * lagrange_coefficient(&points, x_j, x)?)
    })
}

pub(crate) fn distinct<E: Curve>(points: &[NonZero<Scalar<E>>]) -> bool {
    points
        .iter()
        .enumerate()
        .all(|(i, x_i)| points[i + 1..].iter().all(|x_j| x_i != x_j))
}
