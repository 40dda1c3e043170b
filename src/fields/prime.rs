use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::ArithmeticError;

use super::Field;

/// The field Zp for a prime modulus chosen at setup time.
///
/// Elements are `u64` integers in [0, p); all operations keep them
/// canonically reduced. Products go through `u128`, so any prime below 2^64
/// is usable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PrimeField {
    modulus: u64,
}

impl PrimeField {
    /// Create the field Zp. The modulus must be prime; this is a setup-time
    /// check, not a hot path.
    pub fn new(modulus: u64) -> Self {
        assert!(is_prime(modulus), "{} is not a prime", modulus);
        PrimeField { modulus }
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    /// Whether p ≡ 3 (mod 4), which admits the cheap square-root formula.
    pub fn is_blum(&self) -> bool {
        self.modulus % 4 == 3
    }

    /// Extract bit `index` of the integer representative.
    pub fn bit(&self, a: u64, index: usize) -> u64 {
        (a >> index) & 1
    }

    /// A square root of `a`, assuming one exists. For Blum primes this is
    /// a^((p+1)/4); otherwise Tonelli-Shanks. No attempt is made to return
    /// the positive root.
    pub fn sqrt(&self, a: u64) -> u64 {
        let p = self.modulus;
        if a == 0 {
            return 0;
        }
        if self.is_blum() {
            return self.pow(a, (p + 1) / 4);
        }

        // Tonelli-Shanks: write p - 1 = q * 2^s with q odd.
        let mut q = p - 1;
        let mut s = 0u32;
        while q % 2 == 0 {
            q /= 2;
            s += 1;
        }

        // Find a quadratic non-residue z.
        let mut z = 2;
        while self.pow(z, (p - 1) / 2) == 1 {
            z += 1;
        }

        let mut m = s;
        let mut c = self.pow(z, q);
        let mut t = self.pow(a, q);
        let mut r = self.pow(a, (q + 1) / 2);

        while t != 1 {
            let mut i = 0u32;
            let mut squared = t;
            while squared != 1 {
                squared = self.mul(squared, squared);
                i += 1;
            }
            let b = self.pow(c, 1u64 << (m - i - 1));
            m = i;
            c = self.mul(b, b);
            t = self.mul(t, c);
            r = self.mul(r, b);
        }
        r
    }
}

impl Field for PrimeField {
    type Elem = u64;

    const BINARY: bool = false;

    fn zero(&self) -> u64 {
        0
    }

    fn one(&self) -> u64 {
        1 % self.modulus
    }

    fn element(&self, value: u64) -> u64 {
        value % self.modulus
    }

    fn to_u64(&self, a: u64) -> u64 {
        a
    }

    fn add(&self, a: u64, b: u64) -> u64 {
        let sum = (a as u128) + (b as u128);
        (sum % self.modulus as u128) as u64
    }

    fn sub(&self, a: u64, b: u64) -> u64 {
        if a >= b {
            a - b
        } else {
            a + (self.modulus - b)
        }
    }

    fn neg(&self, a: u64) -> u64 {
        if a == 0 {
            0
        } else {
            self.modulus - a
        }
    }

    fn mul(&self, a: u64, b: u64) -> u64 {
        ((a as u128 * b as u128) % self.modulus as u128) as u64
    }

    fn inv(&self, a: u64) -> Result<u64, ArithmeticError> {
        if a == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        // Extended Euclidean algorithm over signed intermediates.
        let (mut last_x, mut x) = (1i128, 0i128);
        let (mut r, mut new_r) = (a as i128, self.modulus as i128);
        while new_r != 0 {
            let quotient = r / new_r;
            let tmp = last_x - quotient * x;
            last_x = x;
            x = tmp;
            let tmp = r - quotient * new_r;
            r = new_r;
            new_r = tmp;
        }
        let inverse = last_x.rem_euclid(self.modulus as i128) as u64;
        Ok(inverse)
    }

    fn random(&self, rng: &mut dyn RngCore) -> u64 {
        rng.gen_range(0..self.modulus)
    }

    fn size(&self) -> u64 {
        self.modulus
    }
}

/// Locate the smallest prime >= `bound`; with `blum` set, additionally
/// require p ≡ 3 (mod 4) so that square roots can be extracted cheaply.
/// One-time setup utility.
pub fn find_prime(bound: u64, blum: bool) -> u64 {
    let mut candidate = bound.max(2);
    loop {
        if is_prime(candidate) && (!blum || candidate % 4 == 3) {
            return candidate;
        }
        candidate += 1;
    }
}

/// Deterministic Miller-Rabin, valid for all u64 inputs with this base set.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n == p {
            return true;
        }
        if n % p == 0 {
            return false;
        }
    }

    let mut d = n - 1;
    let mut s = 0u32;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }

    let mulmod = |a: u64, b: u64| ((a as u128 * b as u128) % n as u128) as u64;
    let powmod = |mut base: u64, mut exp: u64| {
        let mut result = 1u64;
        base %= n;
        while exp > 0 {
            if exp & 1 == 1 {
                result = mulmod(result, base);
            }
            base = mulmod(base, base);
            exp >>= 1;
        }
        result
    };

    'witness: for a in [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = powmod(a, d);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 0..s - 1 {
            x = mulmod(x, x);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
