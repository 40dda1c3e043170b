use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::ArithmeticError;

use super::Field;

/// Log/exp tables for GF(2^8) under the AES reduction polynomial
/// x^8 + x^4 + x^3 + x + 1, generated from the generator 0x03.
const fn build_tables() -> ([u8; 256], [u8; 256]) {
    let mut exp = [0u8; 256];
    let mut log = [0u8; 256];

    let mut a: u8 = 1;
    let mut c = 0;
    while c < 255 {
        exp[c] = a;
        let carry = a & 0x80;
        a <<= 1;
        if carry == 0x80 {
            a ^= 0x1b;
        }
        a ^= exp[c];
        c += 1;
    }
    exp[255] = exp[0];

    let mut c = 0;
    while c < 255 {
        log[exp[c] as usize] = c as u8;
        c += 1;
    }

    (exp, log)
}

const EXP_TABLE: [u8; 256] = build_tables().0;
const LOG_TABLE: [u8; 256] = build_tables().1;

/// The field GF(2^8). Addition is xor, multiplication goes through the
/// log/exp tables, inversion is a table lookup.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Gf256;

impl Field for Gf256 {
    type Elem = u8;

    const BINARY: bool = true;

    fn zero(&self) -> u8 {
        0
    }

    fn one(&self) -> u8 {
        1
    }

    fn element(&self, value: u64) -> u8 {
        (value % 256) as u8
    }

    fn to_u64(&self, a: u8) -> u64 {
        a as u64
    }

    fn add(&self, a: u8, b: u8) -> u8 {
        a ^ b
    }

    fn sub(&self, a: u8, b: u8) -> u8 {
        a ^ b
    }

    fn neg(&self, a: u8) -> u8 {
        a
    }

    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let log_product = (LOG_TABLE[a as usize] as u16 + LOG_TABLE[b as usize] as u16) % 255;
        EXP_TABLE[log_product as usize]
    }

    fn inv(&self, a: u8) -> Result<u8, ArithmeticError> {
        if a == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        Ok(EXP_TABLE[255 - LOG_TABLE[a as usize] as usize])
    }

    fn random(&self, rng: &mut dyn RngCore) -> u8 {
        rng.gen()
    }

    fn size(&self) -> u64 {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_xor() {
        let gf = Gf256;
        assert_eq!(gf.add(0x01, 0x01), 0);
        assert_eq!(gf.add(0x01, 0x02), 3);
        for a in 0..=255u8 {
            assert_eq!(gf.add(a, a), 0);
            assert_eq!(gf.sub(a, a), 0);
            assert_eq!(gf.neg(a), a);
        }
    }

    #[test]
    fn test_mul() {
        let gf = Gf256;
        assert_eq!(gf.mul(0, 47), 0);
        assert_eq!(gf.mul(2, 3), 6);
        assert_eq!(gf.mul(16, 32), 54);
        // Commutativity and distributivity spot checks.
        for a in [3u8, 17, 99, 200] {
            for b in [5u8, 77, 131, 255] {
                assert_eq!(gf.mul(a, b), gf.mul(b, a));
                let c = 0x1d;
                assert_eq!(gf.mul(a, gf.add(b, c)), gf.add(gf.mul(a, b), gf.mul(a, c)));
            }
        }
    }

    #[test]
    fn test_inverse() {
        let gf = Gf256;
        assert_eq!(gf.inv(0), Err(ArithmeticError::DivisionByZero));
        for a in 1..=255u8 {
            assert_eq!(gf.mul(a, gf.inv(a).unwrap()), 1);
        }
    }

    #[test]
    fn test_pow() {
        let gf = Gf256;
        assert_eq!(gf.pow(2, 0), 1);
        assert_eq!(gf.pow(2, 1), 2);
        assert_eq!(gf.pow(2, 8), gf.mul(gf.pow(2, 4), gf.pow(2, 4)));
        // Multiplicative group order.
        for a in [1u8, 2, 3, 99, 255] {
            assert_eq!(gf.pow(a, 255), 1);
        }
    }
}
