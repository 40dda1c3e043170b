//! Pseudo-random secret sharing: correlated symmetric keys let the players
//! produce Shamir sharings of random values without any communication.
//!
//! One key per subset of `n - t` players, handed to the subset's members at
//! setup. Evaluating a PRF on a shared program-counter context then yields,
//! at every player, consistent points of the polynomial
//! `sum over subsets A of PRF_{k_A}(context) * f_A(x)` where `f_A` is the
//! degree-`t` polynomial with `f_A(0) = 1` and `f_A(j) = 0` for `j` outside
//! `A`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::error::ArithmeticError;
use crate::fields::Field;
use crate::PartyId;

/// A symmetric key together with the player subset that holds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetKey {
    pub subset: Vec<PartyId>,
    pub key: [u8; 32],
}

/// Keys of one dealer's dedicated key set. The dealer itself holds every
/// subset's key and can therefore compute the dealt value in the clear.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealerKeys {
    pub dealer: PartyId,
    pub keys: Vec<SubsetKey>,
}

/// The PRSS key material one player holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrssKeys {
    /// Keys of the subsets this player belongs to.
    pub random: Vec<SubsetKey>,
    /// Per-dealer key sets for masked input sharing.
    pub dealer: Vec<DealerKeys>,
}

impl PrssKeys {
    pub fn keys_of_dealer(&self, dealer: PartyId) -> &[SubsetKey] {
        self.dealer
            .iter()
            .find(|set| set.dealer == dealer)
            .map(|set| set.keys.as_slice())
            .unwrap_or(&[])
    }
}

/// All subsets of `{1..n}` of size `n - t`, each sorted ascending.
pub fn prss_subsets(num_players: usize, threshold: usize) -> Vec<Vec<PartyId>> {
    let size = num_players - threshold;
    let mut subsets = Vec::new();
    let mut current = Vec::with_capacity(size);
    fill_subsets(1, num_players, size, &mut current, &mut subsets);
    subsets
}

fn fill_subsets(
    from: PartyId,
    num_players: usize,
    size: usize,
    current: &mut Vec<PartyId>,
    subsets: &mut Vec<Vec<PartyId>>,
) {
    if current.len() == size {
        subsets.push(current.clone());
        return;
    }
    for id in from..=num_players {
        current.push(id);
        fill_subsets(id + 1, num_players, size, current, subsets);
        current.pop();
    }
}

/// Dealer-side setup: fresh keys for every subset, distributed so player `i`
/// receives exactly the keys of subsets containing `i`, plus one complete
/// key set per dealer. Returns the key material for players `1..=n` in
/// order.
pub fn generate_keys(
    num_players: usize,
    threshold: usize,
    rng: &mut dyn RngCore,
) -> Vec<PrssKeys> {
    let subsets = prss_subsets(num_players, threshold);
    let mut players = vec![PrssKeys::default(); num_players];

    let mut fresh_keys = || -> Vec<SubsetKey> {
        subsets
            .iter()
            .map(|subset| {
                let mut key = [0u8; 32];
                rng.fill_bytes(&mut key);
                SubsetKey {
                    subset: subset.clone(),
                    key,
                }
            })
            .collect()
    };

    for entry in fresh_keys() {
        for &member in &entry.subset {
            players[member - 1].random.push(entry.clone());
        }
    }

    for dealer in 1..=num_players {
        let keys = fresh_keys();
        for (index, player) in players.iter_mut().enumerate() {
            let id = index + 1;
            let held: Vec<SubsetKey> = if id == dealer {
                keys.clone()
            } else {
                keys.iter()
                    .filter(|entry| entry.subset.contains(&id))
                    .cloned()
                    .collect()
            };
            player.dealer.push(DealerKeys {
                dealer,
                keys: held,
            });
        }
    }

    players
}

/// Keyed PRF into the field: SHAKE-256 over (key, modulus, context, index)
/// with rejection sampling, so identical inputs reproduce identical field
/// elements on every player.
fn prf<F: Field>(field: &F, key: &[u8; 32], context: &[u8], index: u32) -> F::Elem {
    let mut hasher = Shake256::default();
    hasher.update(key);
    hasher.update(&field.size().to_be_bytes());
    hasher.update(context);
    hasher.update(&index.to_be_bytes());
    let mut reader = hasher.finalize_xof();

    let size = field.size();
    let mask = size.checked_next_power_of_two().map_or(u64::MAX, |p| p - 1);
    let mut buffer = [0u8; 8];
    loop {
        reader.read(&mut buffer);
        let candidate = u64::from_be_bytes(buffer) & mask;
        if candidate < size {
            return field.element(candidate);
        }
    }
}

/// `f_A(x)` for the subset `A`: one at zero, zero at every player outside
/// the subset.
fn subset_polynomial<F: Field>(
    field: &F,
    num_players: usize,
    subset: &[PartyId],
    at: PartyId,
) -> Result<F::Elem, ArithmeticError> {
    let x = field.element(at as u64);
    let mut value = field.one();
    for j in 1..=num_players {
        if subset.contains(&j) {
            continue;
        }
        let x_j = field.element(j as u64);
        value = field.mul(value, field.div(field.sub(x_j, x), x_j)?);
    }
    Ok(value)
}

/// This player's point of a degree-`t` pseudo-random sharing for the given
/// context. All players calling this with the same context hold a consistent
/// sharing of [`prss_secret`] of the same keys.
pub fn prss_share<F: Field>(
    field: &F,
    num_players: usize,
    my_id: PartyId,
    keys: &[SubsetKey],
    context: &[u8],
) -> Result<F::Elem, ArithmeticError> {
    let mut share = field.zero();
    for entry in keys {
        if !entry.subset.contains(&my_id) {
            continue;
        }
        let sample = prf(field, &entry.key, context, 0);
        let weight = subset_polynomial(field, num_players, &entry.subset, my_id)?;
        share = field.add(share, field.mul(sample, weight));
    }
    Ok(share)
}

/// The secret underlying [`prss_share`]; computable only with the complete
/// key set (i.e. by the dealer of a dealer key set).
pub fn prss_secret<F: Field>(field: &F, keys: &[SubsetKey], context: &[u8]) -> F::Elem {
    let mut secret = field.zero();
    for entry in keys {
        secret = field.add(secret, prf(field, &entry.key, context, 0));
    }
    secret
}

/// This player's point of a degree-`2t` pseudo-random sharing of zero.
///
/// Each subset contributes `f_A(x) * h_A(x)` where `h_A` is a degree-`t`
/// polynomial with constant term zero and PRF-derived coefficients; the sum
/// has degree `2t` and constant term zero.
pub fn prss_zero<F: Field>(
    field: &F,
    num_players: usize,
    threshold: usize,
    my_id: PartyId,
    keys: &[SubsetKey],
    context: &[u8],
) -> Result<F::Elem, ArithmeticError> {
    let x = field.element(my_id as u64);
    let mut share = field.zero();
    for entry in keys {
        if !entry.subset.contains(&my_id) {
            continue;
        }
        let weight = subset_polynomial(field, num_players, &entry.subset, my_id)?;
        let mut masking = field.zero();
        let mut power = field.one();
        for k in 0..threshold {
            power = field.mul(power, x);
            let coefficient = prf(field, &entry.key, context, 1 + k as u32);
            masking = field.add(masking, field.mul(coefficient, power));
        }
        share = field.add(share, field.mul(weight, masking));
    }
    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::PrimeField;
    use crate::shamir;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn subsets_have_expected_count() {
        // 3 choose 2 and 4 choose 3.
        assert_eq!(prss_subsets(3, 1), vec![vec![1, 2], vec![1, 3], vec![2, 3]]);
        assert_eq!(prss_subsets(4, 1).len(), 4);
        assert_eq!(prss_subsets(7, 2).len(), 21);
    }

    #[test]
    fn shares_recombine_consistently() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(1);
        let keys = generate_keys(3, 1, &mut rng);

        let shares: Vec<_> = (1..=3)
            .map(|id| {
                (
                    id,
                    prss_share(&field, 3, id, &keys[id - 1].random, b"ctx").unwrap(),
                )
            })
            .collect();

        // Every pair of shares reconstructs the same secret.
        let secret = shamir::recombine(&field, &shares[..2]).unwrap();
        assert_eq!(shamir::recombine(&field, &shares[1..]).unwrap(), secret);
        assert_eq!(
            shamir::recombine(&field, &[shares[0], shares[2]]).unwrap(),
            secret
        );
    }

    #[test]
    fn same_context_same_share() {
        let field = PrimeField::new(31);
        let mut rng = SmallRng::seed_from_u64(2);
        let keys = generate_keys(3, 1, &mut rng);

        let a = prss_share(&field, 3, 1, &keys[0].random, b"one").unwrap();
        let b = prss_share(&field, 3, 1, &keys[0].random, b"one").unwrap();
        let c = prss_share(&field, 3, 1, &keys[0].random, b"two").unwrap();
        assert_eq!(a, b);
        // Not a hard guarantee for a 31-element field, but this seed differs.
        assert_ne!(a, c);
    }

    #[test]
    fn dealer_learns_the_secret() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(4);
        let keys = generate_keys(4, 1, &mut rng);

        let dealer = 2;
        let secret = prss_secret(&field, keys[dealer - 1].keys_of_dealer(dealer), b"deal");

        let shares: Vec<_> = (1..=4)
            .map(|id| {
                let held = keys[id - 1].keys_of_dealer(dealer);
                (id, prss_share(&field, 4, id, held, b"deal").unwrap())
            })
            .collect();
        assert_eq!(shamir::recombine(&field, &shares[..2]).unwrap(), secret);
    }

    #[test]
    fn zero_sharing_recombines_to_zero_at_double_degree() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(6);
        let keys = generate_keys(3, 1, &mut rng);

        let shares: Vec<_> = (1..=3)
            .map(|id| {
                (
                    id,
                    prss_zero(&field, 3, 1, id, &keys[id - 1].random, b"zero").unwrap(),
                )
            })
            .collect();

        // Degree 2t = 2 needs all three points.
        assert_eq!(shamir::recombine(&field, &shares).unwrap(), 0);
    }

    #[test]
    fn double_sharing_is_consistent() {
        let field = PrimeField::new(1031);
        let mut rng = SmallRng::seed_from_u64(8);
        let keys = generate_keys(3, 1, &mut rng);

        // Degree-t share plus degree-2t zero share is a degree-2t sharing of
        // the same secret.
        let single: Vec<_> = (1..=3)
            .map(|id| {
                (
                    id,
                    prss_share(&field, 3, id, &keys[id - 1].random, b"dbl").unwrap(),
                )
            })
            .collect();
        let double: Vec<_> = single
            .iter()
            .map(|&(id, s)| {
                let z = prss_zero(&field, 3, 1, id, &keys[id - 1].random, b"dbl").unwrap();
                (id, field.add(s, z))
            })
            .collect();

        let secret = shamir::recombine(&field, &single[..2]).unwrap();
        assert_eq!(shamir::recombine(&field, &double).unwrap(), secret);
    }
}
