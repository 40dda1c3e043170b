//! Integer comparison of shared values: mask the difference with random
//! bits, open it, and resolve the borrow with a log-depth bitwise circuit.
//!
//! Operands must fit in `bit_length` bits and the modulus must exceed
//! 2^(bit_length + security_parameter + 2) so the masked opening cannot
//! wrap.

use std::rc::Rc;

use crate::error::MpcError;
use crate::fields::{Field, PrimeField};
use crate::share::{Promise, Share};

use super::Runtime;

impl Runtime {
    /// `[a >= b]` as a shared bit, for a, b in `[0, 2^bit_length)`.
    ///
    /// One opening plus `O(log bit_length)` multiplication rounds; the
    /// opened value is statistically masked.
    pub fn greater_than_equal(
        self: &Rc<Self>,
        a: &Share<PrimeField>,
        b: &Share<PrimeField>,
    ) -> Share<PrimeField> {
        let field = a.field().clone();
        let bits = self.options().bit_length;
        let mask_bits = self.options().security_parameter;
        assert!(
            bits + mask_bits + 2 < 64 && field.modulus() > 1u64 << (bits + mask_bits + 2),
            "modulus too small for {}-bit comparison with {}-bit masking",
            bits,
            mask_bits
        );
        let two_to_l = field.element(1u64 << bits);

        // z = a - b + 2^l lies in [0, 2^(l+1)); its l-th bit is [a >= b].
        let z = (a.clone() - b.clone()).add_clear(two_to_l);

        // Random masking bits: l for the low part we compare against, the
        // rest blind the high part of the opening.
        let low_bits: Vec<Share<PrimeField>> =
            (0..bits).map(|_| self.prss_random_bit(&field)).collect();
        let high_bits: Vec<Share<PrimeField>> = (0..mask_bits + 1)
            .map(|_| self.prss_random_bit(&field))
            .collect();

        let low_mask = weighted_sum(&field, &low_bits, 0);
        let high_mask = weighted_sum(&field, &high_bits, bits);
        let opened = self.open(&(z.clone() + low_mask.clone() + high_mask));

        let result: Promise<u64> = Promise::new();
        let output = result.clone();
        let field_cb = field.clone();
        self.schedule(&opened, move |runtime, outcome| {
            let masked = match outcome {
                Ok(masked) => *masked,
                Err(error) => {
                    output.resolve(Err(error.clone()));
                    return;
                }
            };
            let field = field_cb;
            let masked_low = masked & ((1u64 << bits) - 1);
            let public_bits: Vec<u64> = (0..bits).map(|i| field.bit(masked_low, i)).collect();

            // borrow = [masked mod 2^l < low_mask]
            let borrow = runtime.bitwise_less(&field, &public_bits, &low_bits);

            // z mod 2^l reconstructed from the public residue, then the
            // l-th bit of z extracted by shifting.
            let z_low = runtime
                .share_constant(&field, field.element(masked_low))
                - low_mask
                + borrow.mul_clear(field.element(1u64 << bits));
            let shifted = z - z_low;
            let inverse = match field.inv(field.element(1u64 << bits)) {
                Ok(inverse) => inverse,
                Err(error) => {
                    output.resolve(Err(MpcError::from(error)));
                    return;
                }
            };
            shifted
                .mul_clear(inverse)
                .promise()
                .on_resolved(move |outcome| output.resolve(outcome.clone()));
        });
        Share::from_promise(result, field, Rc::downgrade(self))
    }

    /// `[a > b]` as a shared bit.
    pub fn greater_than(
        self: &Rc<Self>,
        a: &Share<PrimeField>,
        b: &Share<PrimeField>,
    ) -> Share<PrimeField> {
        let field = a.field().clone();
        self.share_constant(&field, field.one()) - self.greater_than_equal(b, a)
    }

    /// `[public < shared]` for bit-decomposed operands, least significant
    /// bit first. Tree fold: each segment carries (cmp, neq) where neq
    /// flags a difference inside the segment and cmp is +/-neq depending on
    /// direction; the higher segment wins whenever it differs.
    fn bitwise_less(
        self: &Rc<Self>,
        field: &PrimeField,
        public_bits: &[u64],
        shared_bits: &[Share<PrimeField>],
    ) -> Share<PrimeField> {
        assert_eq!(public_bits.len(), shared_bits.len());

        let mut segments: Vec<(Share<PrimeField>, Share<PrimeField>)> = public_bits
            .iter()
            .zip(shared_bits)
            .map(|(&public, shared)| {
                if public == 0 {
                    (-shared.clone(), shared.clone())
                } else {
                    let flipped = self
                        .share_constant(field, field.one())
                        - shared.clone();
                    (flipped.clone(), flipped)
                }
            })
            .collect();

        while segments.len() > 1 {
            let mut next = Vec::with_capacity((segments.len() + 1) / 2);
            let mut iter = segments.into_iter();
            while let Some(lo) = iter.next() {
                match iter.next() {
                    Some(hi) => {
                        let cmp = lo.0.clone() + hi.0 - self.mul(&lo.0, &hi.1);
                        let neq = lo.1.clone() + hi.1.clone() - self.mul(&lo.1, &hi.1);
                        next.push((cmp, neq));
                    }
                    None => next.push(lo),
                }
            }
            segments = next;
        }

        let Some((cmp, neq)) = segments.pop() else {
            return self.share_constant(field, field.zero());
        };
        match field.inv(field.element(2)) {
            Ok(half) => (neq - cmp).mul_clear(half),
            Err(error) => Share::from_promise(
                Promise::failed(MpcError::from(error)),
                field.clone(),
                Rc::downgrade(self),
            ),
        }
    }
}

/// `sum 2^(offset + i) * bits[i]`, no communication.
fn weighted_sum(
    field: &PrimeField,
    bits: &[Share<PrimeField>],
    offset: usize,
) -> Share<PrimeField> {
    let mut total: Option<Share<PrimeField>> = None;
    for (index, bit) in bits.iter().enumerate() {
        let term = bit.mul_clear(field.element(1u64 << (offset + index)));
        total = Some(match total {
            Some(total) => total + term,
            None => term,
        });
    }
    let Some(total) = total else {
        panic!("weighted sum over an empty bit vector");
    };
    total
}
