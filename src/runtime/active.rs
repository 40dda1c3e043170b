//! Actively secure multiplication: Beaver triples generated from PRSS
//! double sharings, consumed one per product. Openings under active
//! security already error-correct (see `ops.rs`), so a corrupted minority
//! can neither falsify a product nor stall it.

use std::rc::Rc;

use crate::fields::Field;
use crate::share::{gather, Share};

use super::Runtime;

impl Runtime {
    /// A multiplication triple (a, b, c) with c = ab: a and b come straight
    /// from PRSS, c from opening the local products masked with a degree-2t
    /// pseudo-random sharing. One opening of communication, no dealer.
    pub fn generate_triple<F: Field>(
        self: &Rc<Self>,
        field: &F,
    ) -> (Share<F>, Share<F>, Share<F>) {
        let a = self.prss_random(field);
        let b = self.prss_random(field);
        let (mask, mask_double) = self.prss_double_random(field);

        // Local products of degree-t sharings form a degree-2t sharing of
        // ab; the degree-2t mask hides it during the opening.
        let masked = {
            let combine = field.clone();
            let promise = gather(vec![
                a.promise().clone(),
                b.promise().clone(),
                mask_double.promise().clone(),
            ])
            .map(move |points| combine.add(combine.mul(points[0], points[1]), points[2]));
            Share::from_promise(promise, field.clone(), Rc::downgrade(self))
        };
        let opened = self.open_with_degree(&masked, 2 * self.threshold());

        let c = {
            let combine = field.clone();
            let promise = gather(vec![opened, mask.promise().clone()])
                .map(move |points| combine.sub(points[0], points[1]));
            Share::from_promise(promise, field.clone(), Rc::downgrade(self))
        };
        (a, b, c)
    }

    /// Beaver rewriting: xy = c + d·b + e·a + d·e for d = x - a, e = y - b,
    /// both opened. The two openings are robust, so the result is correct
    /// against t actively corrupted players.
    pub(super) fn mul_active<F: Field>(self: &Rc<Self>, x: &Share<F>, y: &Share<F>) -> Share<F> {
        let field = x.field().clone();
        let (a, b, c) = self.generate_triple(&field);

        let d = self.open(&(x.clone() - a.clone()));
        let e = self.open(&(y.clone() - b.clone()));

        let promise = {
            let field = field.clone();
            gather(vec![
                d,
                e,
                a.promise().clone(),
                b.promise().clone(),
                c.promise().clone(),
            ])
            .map(move |points| {
                let (d, e, a, b, c) = (points[0], points[1], points[2], points[3], points[4]);
                let mut result = field.add(c, field.mul(d, b));
                result = field.add(result, field.mul(e, a));
                field.add(result, field.mul(d, e))
            })
        };
        Share::from_promise(promise, field, Rc::downgrade(self))
    }
}
