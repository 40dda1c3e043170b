//! Shamir secret sharing: polynomial sharing, Lagrange recombination, and
//! error-correcting reconstruction for the actively secure protocols.
//!
//! Player `i` always evaluates at the field element `i`; player identifiers
//! start at 1 so that no share is ever the secret itself.

use rand::RngCore;

use crate::error::{ArithmeticError, MpcError};
use crate::fields::Field;
use crate::PartyId;

/// Share a secret among players `1..=num_players` with a random polynomial
/// of the given degree.
///
/// Any `degree + 1` of the returned points determine the secret; any
/// `degree` of them are uniformly random and reveal nothing.
pub fn share<F: Field>(
    field: &F,
    secret: F::Elem,
    degree: usize,
    num_players: usize,
    rng: &mut dyn RngCore,
) -> Vec<(PartyId, F::Elem)> {
    assert!(degree < num_players, "sharing degree must be below the player count");

    // Coefficients a_1..a_degree; the constant term is the secret.
    let coefficients: Vec<F::Elem> = (0..degree).map(|_| field.random(rng)).collect();

    (1..=num_players)
        .map(|id| {
            let x = field.element(id as u64);
            // Horner evaluation, highest coefficient first.
            let mut value = field.zero();
            for &coefficient in coefficients.iter().rev() {
                value = field.add(field.mul(value, x), coefficient);
            }
            value = field.add(field.mul(value, x), secret);
            (id, value)
        })
        .collect()
}

/// Recombine shares into the secret, the polynomial's value at zero.
///
/// All provided shares are used, so the caller picks how many to hand in;
/// `degree + 1` correct shares suffice. Player identifiers must be distinct.
pub fn recombine<F: Field>(
    field: &F,
    shares: &[(PartyId, F::Elem)],
) -> Result<F::Elem, ArithmeticError> {
    recombine_at(field, shares, field.zero())
}

/// Recombine shares into the polynomial's value at an arbitrary point.
pub fn recombine_at<F: Field>(
    field: &F,
    shares: &[(PartyId, F::Elem)],
    at: F::Elem,
) -> Result<F::Elem, ArithmeticError> {
    let mut result = field.zero();
    for (i, &(id_i, value)) in shares.iter().enumerate() {
        let x_i = field.element(id_i as u64);
        let mut weight = field.one();
        for (j, &(id_j, _)) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            assert_ne!(id_i, id_j, "duplicate share from player {}", id_i);
            let x_j = field.element(id_j as u64);
            weight = field.mul(
                weight,
                field.div(field.sub(at, x_j), field.sub(x_i, x_j))?,
            );
        }
        result = field.add(result, field.mul(weight, value));
    }
    Ok(result)
}

/// Check that all points lie on a single polynomial of the given degree.
pub fn verify_sharing<F: Field>(
    field: &F,
    shares: &[(PartyId, F::Elem)],
    degree: usize,
) -> Result<bool, ArithmeticError> {
    if shares.len() <= degree + 1 {
        return Ok(true);
    }
    let basis = &shares[..degree + 1];
    for &(id, value) in &shares[degree + 1..] {
        let expected = recombine_at(field, basis, field.element(id as u64))?;
        if expected != value {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reconstruct the value at zero of the degree-`degree` polynomial agreeing
/// with all but at most `max_errors` of the points (Berlekamp-Welch).
///
/// Requires `points.len() >= degree + 2 * max_errors + 1`; fails with
/// [`MpcError::ShareConsistency`] when no polynomial within the error bound
/// exists.
pub fn decode_robust<F: Field>(
    field: &F,
    points: &[(PartyId, F::Elem)],
    degree: usize,
    max_errors: usize,
) -> Result<F::Elem, MpcError> {
    assert!(
        points.len() >= degree + 2 * max_errors + 1,
        "{} points cannot correct {} errors at degree {}",
        points.len(),
        max_errors,
        degree
    );

    if max_errors == 0 {
        // Plain interpolation, then consistency check against the rest.
        if !verify_sharing(field, points, degree).map_err(MpcError::from)? {
            return Err(MpcError::ShareConsistency(
                "shares do not lie on a polynomial of the expected degree".into(),
            ));
        }
        return recombine(field, &points[..degree + 1]).map_err(MpcError::from);
    }

    // Solve for Q of degree <= degree + max_errors and monic E of degree
    // max_errors with Q(x_i) = y_i * E(x_i) for every point. Unknowns are
    // the coefficients of Q followed by the non-leading coefficients of E.
    let q_len = degree + max_errors + 1;
    let unknowns = q_len + max_errors;

    let mut matrix: Vec<Vec<F::Elem>> = Vec::with_capacity(points.len());
    for &(id, y) in points {
        let x = field.element(id as u64);
        let mut row = Vec::with_capacity(unknowns + 1);
        let mut power = field.one();
        for _ in 0..q_len {
            row.push(power);
            power = field.mul(power, x);
        }
        let mut power = field.one();
        for _ in 0..max_errors {
            row.push(field.neg(field.mul(y, power)));
            power = field.mul(power, x);
        }
        // power is now x^max_errors, the monic term moved to the right side.
        row.push(field.mul(y, power));
        matrix.push(row);
    }

    let solution = solve(field, &mut matrix, unknowns)?;
    let q = &solution[..q_len];
    let mut e: Vec<F::Elem> = solution[q_len..].to_vec();
    e.push(field.one());

    // f = Q / E must divide exactly.
    let f = divide_exact(field, q, &e).ok_or_else(|| {
        MpcError::ShareConsistency("corrupted shares exceed the correction bound".into())
    })?;

    // The decoded polynomial must actually fit all but max_errors points.
    let mut disagreements = 0;
    for &(id, y) in points {
        let x = field.element(id as u64);
        let mut value = field.zero();
        for &coefficient in f.iter().rev() {
            value = field.add(field.mul(value, x), coefficient);
        }
        if value != y {
            disagreements += 1;
        }
    }
    if disagreements > max_errors {
        return Err(MpcError::ShareConsistency(format!(
            "{} corrupted shares, at most {} correctable",
            disagreements, max_errors
        )));
    }

    Ok(f.first().copied().unwrap_or_else(|| field.zero()))
}

/// Gaussian elimination over the field. Free variables are set to zero; an
/// inconsistent row means no solution exists.
fn solve<F: Field>(
    field: &F,
    matrix: &mut [Vec<F::Elem>],
    unknowns: usize,
) -> Result<Vec<F::Elem>, MpcError> {
    let rows = matrix.len();
    let mut pivot_of_column = vec![None; unknowns];
    let mut row = 0;

    for column in 0..unknowns {
        if row == rows {
            break;
        }
        let Some(pivot) = (row..rows).find(|&r| matrix[r][column] != field.zero()) else {
            continue;
        };
        matrix.swap(row, pivot);

        let inverse = field.inv(matrix[row][column]).map_err(MpcError::from)?;
        for entry in matrix[row].iter_mut() {
            *entry = field.mul(*entry, inverse);
        }
        for other in 0..rows {
            if other == row || matrix[other][column] == field.zero() {
                continue;
            }
            let factor = matrix[other][column];
            for index in 0..=unknowns {
                let delta = field.mul(factor, matrix[row][index]);
                matrix[other][index] = field.sub(matrix[other][index], delta);
            }
        }
        pivot_of_column[column] = Some(row);
        row += 1;
    }

    // Rows with no pivot must have a zero right-hand side.
    for r in row..rows {
        if matrix[r][unknowns] != field.zero() {
            return Err(MpcError::ShareConsistency(
                "corrupted shares exceed the correction bound".into(),
            ));
        }
    }

    Ok((0..unknowns)
        .map(|column| match pivot_of_column[column] {
            Some(r) => matrix[r][unknowns],
            None => field.zero(),
        })
        .collect())
}

/// Polynomial long division, returning the quotient only when the remainder
/// is zero. Coefficients are little-endian.
fn divide_exact<F: Field>(field: &F, numerator: &[F::Elem], divisor: &[F::Elem]) -> Option<Vec<F::Elem>> {
    let divisor_degree = divisor.iter().rposition(|&c| c != field.zero())?;
    let mut remainder: Vec<F::Elem> = numerator.to_vec();
    let mut quotient = vec![field.zero(); numerator.len().saturating_sub(divisor_degree)];

    // The divisor is monic by construction, no leading-coefficient inverse
    // is needed.
    for index in (divisor_degree..remainder.len()).rev() {
        let factor = remainder[index];
        if factor == field.zero() {
            continue;
        }
        quotient[index - divisor_degree] = factor;
        for (offset, &coefficient) in divisor.iter().enumerate() {
            let position = index - divisor_degree + offset;
            remainder[position] =
                field.sub(remainder[position], field.mul(factor, coefficient));
        }
    }

    if remainder.iter().any(|&c| c != field.zero()) {
        return None;
    }
    Some(quotient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Gf256, PrimeField};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn share_and_recombine() {
        let field = PrimeField::new(31);
        let mut rng = SmallRng::seed_from_u64(7);

        let shares = share(&field, 17, 1, 3, &mut rng);
        assert_eq!(shares.len(), 3);

        // Any two of three shares recombine, one share reveals nothing (it
        // recombines to itself, not to the secret in general).
        assert_eq!(recombine(&field, &shares[..2]).unwrap(), 17);
        assert_eq!(recombine(&field, &shares[1..]).unwrap(), 17);
        assert_eq!(recombine(&field, &[shares[0], shares[2]]).unwrap(), 17);
    }

    #[test]
    fn recombine_at_interpolates() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(3);

        let shares = share(&field, 999, 2, 7, &mut rng);
        for &(id, value) in &shares {
            let from_others: Vec<_> = shares
                .iter()
                .filter(|&&(other, _)| other != id)
                .take(3)
                .copied()
                .collect();
            assert_eq!(
                recombine_at(&field, &from_others, field.element(id as u64)).unwrap(),
                value
            );
        }
    }

    #[test]
    fn sharing_works_in_gf256() {
        let field = Gf256;
        let mut rng = SmallRng::seed_from_u64(11);

        let shares = share(&field, 0xab, 2, 5, &mut rng);
        assert_eq!(recombine(&field, &shares[..3]).unwrap(), 0xab);
        assert_eq!(recombine(&field, &shares[2..]).unwrap(), 0xab);
        assert!(verify_sharing(&field, &shares, 2).unwrap());
    }

    #[test]
    fn verify_sharing_detects_corruption() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(5);

        let mut shares = share(&field, 123, 1, 5, &mut rng);
        assert!(verify_sharing(&field, &shares, 1).unwrap());
        shares[4].1 = field.add(shares[4].1, 1);
        assert!(!verify_sharing(&field, &shares, 1).unwrap());
    }

    #[test]
    fn robust_decode_corrects_one_error() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(13);

        let mut shares = share(&field, 500, 1, 4, &mut rng);
        shares[2].1 = field.add(shares[2].1, 77);
        assert_eq!(decode_robust(&field, &shares, 1, 1).unwrap(), 500);
    }

    #[test]
    fn robust_decode_without_errors() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(17);

        let shares = share(&field, 42, 2, 7, &mut rng);
        assert_eq!(decode_robust(&field, &shares, 2, 2).unwrap(), 42);
        assert_eq!(decode_robust(&field, &shares[..3], 2, 0).unwrap(), 42);
    }

    #[test]
    fn robust_decode_rejects_excess_errors() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(19);

        let mut shares = share(&field, 42, 1, 4, &mut rng);
        shares[0].1 = field.add(shares[0].1, 1);
        shares[1].1 = field.add(shares[1].1, 2);
        assert!(matches!(
            decode_robust(&field, &shares, 1, 1),
            Err(MpcError::ShareConsistency(_))
        ));
    }
}
