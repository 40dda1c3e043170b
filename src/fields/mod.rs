//! Finite fields the runtime computes over: a prime field Zp with a modulus
//! chosen at setup, and GF(2^8).

mod gf256;
mod prime;

pub use gf256::Gf256;
pub use prime::{find_prime, PrimeField};

use std::fmt::Debug;

use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ArithmeticError;

/// Field descriptor: a capability object bundling the arithmetic of one
/// concrete field. The runtime threads a descriptor through every operation,
/// which is what lets the modulus be a setup-time value rather than a type
/// parameter.
///
/// Elements are plain machine words, always canonically reduced; only
/// inversion (and division) of zero can fail.
pub trait Field: Clone + PartialEq + Debug + 'static {
    type Elem: Copy + Eq + Debug + Serialize + DeserializeOwned + 'static;

    /// True for fields of characteristic two, where xor coincides with
    /// addition.
    const BINARY: bool;

    fn zero(&self) -> Self::Elem;
    fn one(&self) -> Self::Elem;

    /// Canonical element for an integer (reduced modulo the field size).
    fn element(&self, value: u64) -> Self::Elem;

    /// Integer representative in [0, field size).
    fn to_u64(&self, a: Self::Elem) -> u64;

    fn add(&self, a: Self::Elem, b: Self::Elem) -> Self::Elem;
    fn sub(&self, a: Self::Elem, b: Self::Elem) -> Self::Elem;
    fn neg(&self, a: Self::Elem) -> Self::Elem;
    fn mul(&self, a: Self::Elem, b: Self::Elem) -> Self::Elem;

    fn inv(&self, a: Self::Elem) -> Result<Self::Elem, ArithmeticError>;

    fn div(&self, a: Self::Elem, b: Self::Elem) -> Result<Self::Elem, ArithmeticError> {
        Ok(self.mul(a, self.inv(b)?))
    }

    fn pow(&self, a: Self::Elem, mut exponent: u64) -> Self::Elem {
        let mut base = a;
        let mut result = self.one();
        while exponent > 0 {
            if exponent & 1 == 1 {
                result = self.mul(result, base);
            }
            base = self.mul(base, base);
            exponent >>= 1;
        }
        result
    }

    /// Uniformly random element.
    fn random(&self, rng: &mut dyn RngCore) -> Self::Elem;

    /// Number of elements; used for PRF domain separation and sampling.
    fn size(&self) -> u64;
}
