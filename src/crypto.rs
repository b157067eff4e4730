//! This module contains our cryptographic primitives: Shamir sharing over
//! the secret field and the Pedersen commitment scheme that makes shares
//! verifiable.

use crate::algebra::{Fq, Polynomial};
use crate::error::ShareError;

use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

/// A Shamir share: the evaluation of the sharing polynomial at `index`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Share {
    pub index: u64,
    pub value: Fq,
}

impl Share {
    pub fn new(index: u64, value: Fq) -> Share {
        Share { index, value }
    }
}

/// Polynomial degree used for secrets that flow into multiplications.
pub fn multiplicative_degree(threshold: u64) -> usize {
    ((threshold - 1) / 2) as usize
}

/// Split a sharing polynomial into one share per party, indexed `1..=n`.
pub fn split(poly: &Polynomial, n: u64) -> Vec<Share> {
    (1..=n)
        .map(|i| Share::new(i, poly.evaluate(&Fq::from(i))))
        .collect()
}

/// Lagrange coefficients for interpolating at `at` from the points `xs`.
/// The `xs` must be pairwise distinct.
pub(crate) fn lagrange_coefficients(xs: &[Fq], at: &Fq) -> Vec<Fq> {
    xs.iter()
        .map(|xi| {
            let mut num = Fq::one();
            let mut den = Fq::one();
            for xj in xs {
                if xj == xi {
                    continue;
                }
                num *= at - xj;
                den *= xi - xj;
            }
            num * den.inv()
        })
        .collect()
}

/// Reconstruct the secret from at least `threshold` distinct-index shares.
///
/// The `threshold` lowest-indexed shares interpolate the polynomial; any
/// further shares are checked against it and `ShareError::Inconsistent` is
/// returned when one falls off the curve.
pub fn join(shares: &[Share], threshold: usize) -> Result<Fq, ShareError> {
    let mut by_index: Vec<&Share> = Vec::new();
    for s in shares {
        if !by_index.iter().any(|t| t.index == s.index) {
            by_index.push(s);
        }
    }
    by_index.sort_by_key(|s| s.index);

    if by_index.len() < threshold {
        return Err(ShareError::BelowThreshold {
            needed: threshold,
            got: by_index.len(),
        });
    }

    let (base, extra) = by_index.split_at(threshold);
    let xs: Vec<Fq> = base.iter().map(|s| Fq::from(s.index)).collect();

    for s in extra {
        let coeffs = lagrange_coefficients(&xs, &Fq::from(s.index));
        let expected: Fq = base
            .iter()
            .zip(&coeffs)
            .map(|(b, c)| &b.value * c)
            .sum();
        if expected != s.value {
            return Err(ShareError::Inconsistent);
        }
    }

    let coeffs = lagrange_coefficients(&xs, &Fq::zero());
    Ok(base
        .iter()
        .zip(&coeffs)
        .map(|(b, c)| &b.value * c)
        .sum())
}

pub mod pedersen {
    use super::lagrange_coefficients;
    use crate::algebra::Fq;

    use num_bigint::BigUint;
    use serde::de;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt;

    /// Order-q subgroup of `Z_p*` with `p = 56q + 1`. Both generators have
    /// order exactly q, which the additive homomorphism on exponents needs.
    static P: &str = "454370853564663995177";
    static G: &str = "72057594037927936";
    static H: &str = "103295605594920676682";

    /// A commitment `g^s * h^t mod p`.
    #[derive(Clone, PartialEq, Eq)]
    pub struct Commitment(BigUint);

    impl fmt::Debug for Commitment {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let bytes = self.0.to_bytes_be();
            f.debug_struct("Commitment")
                .field("c", &format_args!("{:x?}...", bytes.get(0..2).unwrap_or(&bytes)))
                .finish()
        }
    }

    impl Serialize for Commitment {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(&self.0.to_bytes_be())
        }
    }

    struct CommitmentVisitor;

    impl<'de> de::Visitor<'de> for CommitmentVisitor {
        type Value = Commitment;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a group element")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Commitment(BigUint::from_bytes_be(v)))
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Commitment(BigUint::from_bytes_be(&v)))
        }
    }

    impl<'de> Deserialize<'de> for Commitment {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(CommitmentVisitor)
        }
    }

    /// The commitment scheme parameters. Immutable after construction and
    /// shared read-only between the engines.
    #[derive(Clone, Debug)]
    pub struct Scheme {
        p: BigUint,
        g: BigUint,
        h: BigUint,
    }

    impl Default for Scheme {
        fn default() -> Scheme {
            Scheme {
                p: P.parse().expect("built-in group modulus must parse"),
                g: G.parse().expect("built-in generator must parse"),
                h: H.parse().expect("built-in generator must parse"),
            }
        }
    }

    impl Scheme {
        pub fn new(p: BigUint, g: BigUint, h: BigUint) -> Scheme {
            Scheme { p, g, h }
        }

        /// Commit to `s` under blinding `t`.
        pub fn commit(&self, s: &Fq, t: &Fq) -> Commitment {
            let gs = self.g.modpow(s.value(), &self.p);
            let ht = self.h.modpow(t.value(), &self.p);
            Commitment(gs * ht % &self.p)
        }

        /// Check that `(s, t)` opens `c`.
        pub fn verify(&self, s: &Fq, t: &Fq, c: &Commitment) -> bool {
            self.commit(s, t) == *c
        }

        /// The commitment to the sum of two committed values, by the
        /// homomorphism `commit(s1+s2, t1+t2) = commit(s1,t1)*commit(s2,t2)`.
        pub fn combine(&self, a: &Commitment, b: &Commitment) -> Commitment {
            Commitment(&a.0 * &b.0 % &self.p)
        }

        /// Lagrange interpolation on the commitment side: the commitment a
        /// degree-bounded sharing would place at index `at`, computed from
        /// the commitments at `points` without opening anything.
        pub fn interpolate(&self, points: &[(u64, Commitment)], at: u64) -> Commitment {
            let xs: Vec<Fq> = points.iter().map(|(i, _)| Fq::from(*i)).collect();
            let coeffs = lagrange_coefficients(&xs, &Fq::from(at));
            let mut acc = BigUint::from(1u32);
            for ((_, c), l) in points.iter().zip(&coeffs) {
                acc = acc * c.0.modpow(l.value(), &self.p) % &self.p;
            }
            Commitment(acc)
        }
    }
}

/// A share together with the Pedersen commitment binding its value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VShare {
    pub share: Share,
    pub decommit: Fq,
    pub commitment: pedersen::Commitment,
}

impl VShare {
    pub fn verify(&self, scheme: &pedersen::Scheme) -> bool {
        scheme.verify(&self.share.value, &self.decommit, &self.commitment)
    }

    /// Component-wise sum of two verifiable shares of the same index.
    pub fn combine(&self, other: &VShare, scheme: &pedersen::Scheme) -> VShare {
        debug_assert_eq!(self.share.index, other.share.index);
        VShare {
            share: Share::new(self.share.index, &self.share.value + &other.share.value),
            decommit: &self.decommit + &other.decommit,
            commitment: scheme.combine(&self.commitment, &other.commitment),
        }
    }
}

pub mod vss {
    use super::{pedersen, split, VShare};
    use crate::algebra::{Fq, Polynomial};

    use rand::Rng;

    /// Pedersen-verifiable Shamir sharing of `secret` at the given degree:
    /// `n` shares whose commitments all pass `VShare::verify` and whose
    /// share components reconstruct `secret` from any `degree + 1` of them.
    pub fn share(
        scheme: &pedersen::Scheme,
        secret: &Fq,
        n: u64,
        degree: usize,
        rng: &mut impl Rng,
    ) -> Vec<VShare> {
        let value_poly = Polynomial::random(degree, secret.clone(), rng);
        let blind_poly = Polynomial::random(degree, Fq::random(rng), rng);
        split(&value_poly, n)
            .into_iter()
            .zip(split(&blind_poly, n))
            .map(|(share, blind)| {
                let commitment = scheme.commit(&share.value, &blind.value);
                VShare {
                    share,
                    decommit: blind.value,
                    commitment,
                }
            })
            .collect()
    }
}
