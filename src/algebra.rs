//! The prime field that secrets, shares and opened values live in.
//! The modulus is a process-wide context, initialized on first use.

use auto_ops::*;
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use quickcheck::{Arbitrary, Gen};
use rand::Rng;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{AddAssign, MulAssign, Neg, SubAssign};
use std::sync::OnceLock;

/// Decimal string of the secret-field modulus.
/// A 63-bit prime with `Q ≡ 3 (mod 4)`, so square roots exist by exponentiation.
static Q: &str = "8113765242226142771";

static CONTEXT: OnceLock<FieldContext> = OnceLock::new();

struct FieldContext {
    modulus: BigUint,
    width: usize,
}

fn context() -> &'static FieldContext {
    CONTEXT.get_or_init(|| {
        let modulus: BigUint = Q.parse().expect("built-in modulus must parse");
        let width = ((modulus.bits() + 7) / 8) as usize;
        FieldContext { modulus, width }
    })
}

/// The field modulus `q`.
pub fn modulus() -> &'static BigUint {
    &context().modulus
}

/// Number of bytes in the canonical big-endian encoding of a field element.
pub fn modulus_width() -> usize {
    context().width
}

pub fn get_modulus_string() -> String {
    modulus().to_string()
}

/// An element of the prime field `Z_q`. The value is kept reduced.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fq(BigUint);

impl Fq {
    pub fn new(value: BigUint) -> Fq {
        Fq(value % modulus())
    }

    /// Uniformly random field element.
    pub fn random(rng: &mut impl Rng) -> Fq {
        Fq(rng.gen_biguint_below(modulus()))
    }

    /// `self^e mod q`, where the exponent is read as an integer.
    pub fn pow(&self, e: &Fq) -> Fq {
        Fq(self.0.modpow(&e.0, modulus()))
    }

    /// Multiplicative inverse by Fermat's little theorem. The caller must
    /// rule out zero first.
    pub fn inv(&self) -> Fq {
        let e = modulus() - 2u32;
        Fq(self.0.modpow(&e, modulus()))
    }

    /// The value reduced by an integer divisor, re-read as a field element.
    pub fn reduced_by(&self, divisor: &Fq) -> Fq {
        Fq(&self.0 % &divisor.0)
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Canonical big-endian encoding, left-padded to the modulus width.
    pub fn to_bytes(&self) -> Vec<u8> {
        let raw = self.0.to_bytes_be();
        let mut out = vec![0u8; modulus_width() - raw.len()];
        out.extend_from_slice(&raw);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Fq {
        Fq::new(BigUint::from_bytes_be(bytes))
    }
}

impl fmt::Debug for Fq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Fq {
    fn from(x: u64) -> Fq {
        Fq::new(BigUint::from(x))
    }
}

impl_op_ex!(+|a: &Fq, b: &Fq| -> Fq {
    Fq((&a.0 + &b.0) % modulus())
});

impl_op_ex!(-|a: &Fq, b: &Fq| -> Fq {
    Fq((&a.0 + modulus() - &b.0) % modulus())
});

impl_op_ex!(*|a: &Fq, b: &Fq| -> Fq {
    Fq((&a.0 * &b.0) % modulus())
});

impl AddAssign<Fq> for Fq {
    fn add_assign(&mut self, rhs: Fq) {
        *self = &*self + rhs;
    }
}

impl SubAssign<Fq> for Fq {
    fn sub_assign(&mut self, rhs: Fq) {
        *self = &*self - rhs;
    }
}

impl MulAssign<Fq> for Fq {
    fn mul_assign(&mut self, rhs: Fq) {
        *self = &*self * rhs;
    }
}

impl Neg for Fq {
    type Output = Fq;

    fn neg(self) -> Fq {
        Fq((modulus() - self.0) % modulus())
    }
}

impl Neg for &Fq {
    type Output = Fq;

    fn neg(self) -> Fq {
        Fq((modulus() - &self.0) % modulus())
    }
}

impl Zero for Fq {
    fn zero() -> Fq {
        Fq(BigUint::zero())
    }

    fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl One for Fq {
    fn one() -> Fq {
        Fq(BigUint::one())
    }
}

impl std::iter::Sum for Fq {
    fn sum<I: Iterator<Item = Fq>>(iter: I) -> Self {
        let mut out = Zero::zero();
        for x in iter {
            out += x;
        }
        out
    }
}

impl Arbitrary for Fq {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        Fq::from(u64::arbitrary(g))
    }
}

impl Serialize for Fq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

struct FqVisitor;

impl<'de> de::Visitor<'de> for FqVisitor {
    type Value = Fq;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a field element")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Fq::from_bytes(v))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Fq::from_bytes(&v))
    }
}

impl<'de> Deserialize<'de> for Fq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(FqVisitor)
    }
}

/// A polynomial over `Fq`, lowest coefficient first. The constant term is
/// the shared secret when the polynomial is used for Shamir sharing.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<Fq>,
}

impl Polynomial {
    /// A polynomial of the given degree with the given constant term and
    /// uniformly random remaining coefficients.
    pub fn random(degree: usize, constant: Fq, rng: &mut impl Rng) -> Polynomial {
        let mut coeffs = Vec::with_capacity(degree + 1);
        coeffs.push(constant);
        for _ in 0..degree {
            coeffs.push(Fq::random(rng));
        }
        Polynomial { coeffs }
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    /// Horner evaluation at `x`.
    pub fn evaluate(&self, x: &Fq) -> Fq {
        let mut acc = Fq::zero();
        for c in self.coeffs.iter().rev() {
            acc = acc * x + c;
        }
        acc
    }
}
