//! Basic protocol operations: input sharing, opening, multiplication, and
//! the non-interactive PRSS sharings.

use std::rc::Rc;

use crate::error::MpcError;
use crate::fields::{Field, PrimeField};
use crate::prss;
use crate::shamir;
use crate::share::{gather, gather_threshold, Promise, Share};
use crate::PartyId;

use super::{MessageKind, Runtime, Security, WireMessage};

impl Runtime {
    /// Degree-zero sharing of a public constant; no communication.
    pub fn share_constant<F: Field>(self: &Rc<Self>, field: &F, value: F::Elem) -> Share<F> {
        Share::resolved(value, field.clone(), Rc::downgrade(self))
    }

    /// Shamir input sharing: every inputter deals a degree-t sharing of its
    /// value to all players. Returns one share per inputter, in caller
    /// order. Non-inputters pass `None`.
    pub fn input<F: Field>(
        self: &Rc<Self>,
        inputters: &[PartyId],
        field: &F,
        value: Option<F::Elem>,
    ) -> Vec<Share<F>> {
        assert_eq!(
            inputters.contains(&self.id()),
            value.is_some(),
            "exactly the inputters supply a value"
        );

        inputters
            .iter()
            .map(|&inputter| {
                let pc = self.tag();
                if inputter == self.id() {
                    let Some(secret) = value else {
                        panic!("inputter without a value");
                    };
                    let points = shamir::share(
                        field,
                        secret,
                        self.threshold(),
                        self.num_players(),
                        &mut *self.rng().borrow_mut(),
                    );
                    let mut own = None;
                    for (id, point) in points {
                        if id == self.id() {
                            own = Some(point);
                        } else {
                            self.send_to(
                                id,
                                WireMessage {
                                    pc: pc.clone(),
                                    kind: MessageKind::Share(field.to_u64(point)),
                                },
                            );
                        }
                    }
                    let Some(own) = own else {
                        panic!("own id outside the player set");
                    };
                    self.share_constant(field, own)
                } else {
                    let field_in = field.clone();
                    let promise = self
                        .expect_share(pc, inputter)
                        .map(move |&value| field_in.element(value));
                    Share::from_promise(promise, field.clone(), Rc::downgrade(self))
                }
            })
            .collect()
    }

    /// Reveal a degree-t sharing to every player.
    pub fn open<F: Field>(self: &Rc<Self>, share: &Share<F>) -> Promise<F::Elem> {
        let receivers: Vec<PartyId> = self.players().collect();
        let opened = self.open_impl(share, self.threshold(), &receivers);
        let Some(opened) = opened else {
            panic!("every player receives an unrestricted opening");
        };
        opened
    }

    /// Reveal a sharing only to the given receivers; the others learn
    /// nothing and get `None` back.
    pub fn open_to<F: Field>(
        self: &Rc<Self>,
        receivers: &[PartyId],
        share: &Share<F>,
    ) -> Option<Promise<F::Elem>> {
        self.open_impl(share, self.threshold(), receivers)
    }

    /// Opening at an explicit degree, for values shared by local products.
    pub(crate) fn open_with_degree<F: Field>(
        self: &Rc<Self>,
        share: &Share<F>,
        degree: usize,
    ) -> Promise<F::Elem> {
        let receivers: Vec<PartyId> = self.players().collect();
        match self.open_impl(share, degree, &receivers) {
            Some(opened) => opened,
            None => Promise::failed(MpcError::ProtocolSequence(
                "opening without being a receiver".into(),
            )),
        }
    }

    fn open_impl<F: Field>(
        self: &Rc<Self>,
        share: &Share<F>,
        degree: usize,
        receivers: &[PartyId],
    ) -> Option<Promise<F::Elem>> {
        let pc = self.tag();
        let field = share.field().clone();

        // Send the own point to every receiver as soon as it is known.
        {
            let weak = Rc::downgrade(self);
            let field = field.clone();
            let pc = pc.clone();
            let receivers: Vec<PartyId> = receivers.iter().copied().collect();
            share.promise().on_resolved(move |outcome| {
                let Some(runtime) = weak.upgrade() else { return };
                if let Ok(value) = outcome {
                    for &receiver in &receivers {
                        if receiver != runtime.id() {
                            runtime.send_to(
                                receiver,
                                WireMessage {
                                    pc: pc.clone(),
                                    kind: MessageKind::Share(field.to_u64(*value)),
                                },
                            );
                        }
                    }
                }
            });
        }

        if !receivers.contains(&self.id()) {
            return None;
        }

        let contributions: Vec<Promise<u64>> = self
            .players()
            .map(|player| {
                if player == self.id() {
                    let field = field.clone();
                    share.promise().map(move |&value| field.to_u64(value))
                } else {
                    self.expect_share(pc.clone(), player)
                }
            })
            .collect();

        // Passive: the first degree + 1 points interpolate. Active: wait for
        // n - t points and error-correct.
        let needed = match self.security() {
            Security::Passive => degree + 1,
            Security::Active => self.num_players() - self.threshold(),
        };
        let snapshot = gather_threshold(contributions, needed);

        let result = Promise::new();
        let output = result.clone();
        let security = self.security();
        let threshold = self.threshold();
        snapshot.on_resolved(move |outcome| {
            let list = match outcome {
                Ok(list) => list,
                Err(error) => {
                    output.resolve(Err(error.clone()));
                    return;
                }
            };
            let points: Vec<(PartyId, F::Elem)> = list
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| match entry {
                    Some(Ok(value)) => Some((index + 1, field.element(*value))),
                    _ => None,
                })
                .collect();

            let opened = if points.len() <= degree {
                // Not enough honest contributions; surface the first
                // failure we saw.
                Err(list
                    .iter()
                    .flatten()
                    .find_map(|entry| entry.as_ref().err().cloned())
                    .unwrap_or_else(|| {
                        MpcError::ShareConsistency("too few shares to open".into())
                    }))
            } else {
                match security {
                    Security::Passive => shamir::recombine(&field, &points[..degree + 1])
                        .map_err(MpcError::from),
                    Security::Active => {
                        let correctable = (points.len() - degree - 1) / 2;
                        shamir::decode_robust(
                            &field,
                            &points,
                            degree,
                            correctable.min(threshold),
                        )
                    }
                }
            };
            output.resolve(opened);
        });
        Some(result)
    }

    /// Share multiplication. One round of resharing under passive security,
    /// a Beaver triple under active security.
    pub fn mul<F: Field>(self: &Rc<Self>, a: &Share<F>, b: &Share<F>) -> Share<F> {
        match self.security() {
            Security::Passive => self.mul_passive(a, b),
            Security::Active => self.mul_active(a, b),
        }
    }

    /// Degree reduction by resharing: each player deals a degree-t sharing
    /// of its local product; the dealt sharings of players 1..=2t+1
    /// recombine into a degree-t sharing of the product.
    fn mul_passive<F: Field>(self: &Rc<Self>, a: &Share<F>, b: &Share<F>) -> Share<F> {
        let field = a.field().clone();
        let num_players = self.num_players();
        let threshold = self.threshold();

        // One resharing tag per dealer, issued in player order on every
        // player alike.
        let tags: Vec<_> = self.players().map(|_| self.tag()).collect();
        let my_tag = tags[self.id() - 1].clone();

        let my_subshare: Promise<F::Elem> = Promise::new();
        {
            let product = gather(vec![a.promise().clone(), b.promise().clone()]);
            let weak = Rc::downgrade(self);
            let field = field.clone();
            let my_subshare = my_subshare.clone();
            product.on_resolved(move |outcome| {
                let Some(runtime) = weak.upgrade() else { return };
                let factors = match outcome {
                    Ok(factors) => factors,
                    Err(error) => {
                        my_subshare.resolve(Err(error.clone()));
                        return;
                    }
                };
                let local_product = field.mul(factors[0], factors[1]);
                let points = shamir::share(
                    &field,
                    local_product,
                    threshold,
                    num_players,
                    &mut *runtime.rng().borrow_mut(),
                );
                for (id, point) in points {
                    if id == runtime.id() {
                        my_subshare.resolve(Ok(point));
                    } else {
                        runtime.send_to(
                            id,
                            WireMessage {
                                pc: my_tag.clone(),
                                kind: MessageKind::Share(field.to_u64(point)),
                            },
                        );
                    }
                }
            });
        }

        // Every player recombines the reshares of the same fixed dealer set
        // 1..=2t+1. Arrival order must not pick the set: Lagrange weights
        // depend on which dealers contribute, so differing sets would leave
        // the players' points on different polynomials.
        let reshare_count = 2 * threshold + 1;
        let contributions: Vec<Promise<u64>> = (1..=reshare_count)
            .map(|player| {
                if player == self.id() {
                    let field = field.clone();
                    my_subshare.map(move |&value| field.to_u64(value))
                } else {
                    self.expect_share(tags[player - 1].clone(), player)
                }
            })
            .collect();
        // Dealers beyond the set still reshare; receive and drop their points
        // so the registry does not accumulate them.
        for player in reshare_count + 1..=num_players {
            if player != self.id() {
                let _ = self.expect_share(tags[player - 1].clone(), player);
            }
        }

        let combined = gather(contributions);
        let result: Promise<F::Elem> = Promise::new();
        {
            let output = result.clone();
            let field = field.clone();
            combined.on_resolved(move |outcome| {
                let values = match outcome {
                    Ok(values) => values,
                    Err(error) => {
                        output.resolve(Err(error.clone()));
                        return;
                    }
                };
                let points: Vec<(PartyId, F::Elem)> = values
                    .iter()
                    .enumerate()
                    .map(|(index, value)| (index + 1, field.element(*value)))
                    .collect();
                output.resolve(shamir::recombine(&field, &points).map_err(MpcError::from));
            });
        }
        Share::from_promise(result, field, Rc::downgrade(self))
    }

    /// Non-interactive degree-t sharing of a pseudo-random element.
    pub fn prss_random<F: Field>(self: &Rc<Self>, field: &F) -> Share<F> {
        let pc = self.tag();
        let point = prss::prss_share(
            field,
            self.num_players(),
            self.id(),
            &self.prss_keys().random,
            &pc.to_bytes(),
        );
        let promise = match point {
            Ok(point) => Promise::resolved(point),
            Err(error) => Promise::failed(error.into()),
        };
        Share::from_promise(promise, field.clone(), Rc::downgrade(self))
    }

    /// Non-interactive degree-2t sharing of zero, for degree randomization.
    pub fn prss_zero_2t<F: Field>(self: &Rc<Self>, field: &F) -> Share<F> {
        let pc = self.tag();
        let point = prss::prss_zero(
            field,
            self.num_players(),
            self.threshold(),
            self.id(),
            &self.prss_keys().random,
            &pc.to_bytes(),
        );
        let promise = match point {
            Ok(point) => Promise::resolved(point),
            Err(error) => Promise::failed(error.into()),
        };
        Share::from_promise(promise, field.clone(), Rc::downgrade(self))
    }

    /// A degree-t and a degree-2t sharing of the same pseudo-random value.
    pub fn prss_double_random<F: Field>(self: &Rc<Self>, field: &F) -> (Share<F>, Share<F>) {
        let pc = self.tag();
        let context = pc.to_bytes();
        let single = prss::prss_share(
            field,
            self.num_players(),
            self.id(),
            &self.prss_keys().random,
            &context,
        );
        let zero = prss::prss_zero(
            field,
            self.num_players(),
            self.threshold(),
            self.id(),
            &self.prss_keys().random,
            &context,
        );
        match (single, zero) {
            (Ok(single), Ok(zero)) => (
                self.share_constant(field, single),
                self.share_constant(field, field.add(single, zero)),
            ),
            (Err(error), _) | (_, Err(error)) => {
                let failed: Promise<F::Elem> = Promise::failed(error.into());
                (
                    Share::from_promise(failed.clone(), field.clone(), Rc::downgrade(self)),
                    Share::from_promise(failed, field.clone(), Rc::downgrade(self)),
                )
            }
        }
    }

    /// A sharing of a uniformly random bit: take a pseudo-random r, open
    /// r^2 at degree 2t, and map r / sqrt(r^2) from {-1, 1} to {0, 1}. The
    /// opened square reveals nothing about the sign. Retries on the
    /// (1/p-probability) zero square.
    pub fn prss_random_bit(self: &Rc<Self>, field: &PrimeField) -> Share<PrimeField> {
        let result = Promise::new();
        self.random_bit_attempt(field.clone(), result.clone());
        Share::from_promise(result, field.clone(), Rc::downgrade(self))
    }

    fn random_bit_attempt(self: &Rc<Self>, field: PrimeField, output: Promise<u64>) {
        let r = self.prss_random(&field);
        let squared = r.map_value(|field, value| field.mul(value, value));
        let opened = self.open_with_degree(&squared, 2 * self.threshold());
        let r_point = r.promise().clone();

        self.schedule(&opened, move |runtime, outcome| {
            let square = match outcome {
                Ok(square) => *square,
                Err(error) => {
                    output.resolve(Err(error.clone()));
                    return;
                }
            };
            if square == 0 {
                runtime.random_bit_attempt(field, output);
                return;
            }
            let inverse_root = match field.inv(field.sqrt(square)) {
                Ok(inverse_root) => inverse_root,
                Err(error) => {
                    output.resolve(Err(error.into()));
                    return;
                }
            };
            let half = match field.inv(field.element(2)) {
                Ok(half) => half,
                Err(error) => {
                    output.resolve(Err(error.into()));
                    return;
                }
            };
            // r is known locally by now, its square just got opened.
            r_point.on_resolved(move |outcome| match outcome {
                Ok(point) => {
                    let sign = field.mul(*point, inverse_root);
                    output.resolve(Ok(field.mul(field.add(sign, field.one()), half)));
                }
                Err(error) => output.resolve(Err(error.clone())),
            });
        });
    }

    /// PRSS-masked input: the dealer hides its value under a pseudo-random
    /// mask every player holds a share of, and publishes only the
    /// difference. One field element on the wire per player.
    pub fn prss_input<F: Field>(
        self: &Rc<Self>,
        inputters: &[PartyId],
        field: &F,
        value: Option<F::Elem>,
    ) -> Vec<Share<F>> {
        assert_eq!(
            inputters.contains(&self.id()),
            value.is_some(),
            "exactly the inputters supply a value"
        );

        inputters
            .iter()
            .map(|&dealer| {
                let pc = self.tag();
                let context = pc.to_bytes();
                let held = self.prss_keys().keys_of_dealer(dealer);
                let mask_point = prss::prss_share(field, self.num_players(), self.id(), held, &context);
                let mask_point = match mask_point {
                    Ok(point) => point,
                    Err(error) => {
                        return Share::from_promise(
                            Promise::failed(error.into()),
                            field.clone(),
                            Rc::downgrade(self),
                        )
                    }
                };

                let correction: Promise<F::Elem> = if dealer == self.id() {
                    let Some(secret) = value else {
                        panic!("inputter without a value");
                    };
                    let mask = prss::prss_secret(field, held, &context);
                    let correction = field.sub(secret, mask);
                    self.send_to_peers(WireMessage {
                        pc,
                        kind: MessageKind::Share(field.to_u64(correction)),
                    });
                    Promise::resolved(correction)
                } else {
                    let field = field.clone();
                    self.expect_share(pc, dealer)
                        .map(move |&value| field.element(value))
                };

                let field_out = field.clone();
                let promise =
                    correction.map(move |&correction| field_out.add(mask_point, correction));
                Share::from_promise(promise, field.clone(), Rc::downgrade(self))
            })
            .collect()
    }

    /// Barrier: resolves once every peer has reached the same call site.
    pub fn synchronize(self: &Rc<Self>) -> Promise<()> {
        let pc = self.tag();
        self.send_to_peers(WireMessage {
            pc: pc.clone(),
            kind: MessageKind::Share(0),
        });
        let echoes: Vec<Promise<u64>> = self
            .peers()
            .map(|peer| self.expect_share(pc.clone(), peer))
            .collect();
        gather(echoes).map(|_| ())
    }
}
