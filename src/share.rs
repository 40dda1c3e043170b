//! Single-assignment dataflow cells. A [`Promise`] resolves exactly once,
//! with a value or a protocol failure, and runs its callbacks in
//! registration order; a [`Share`] pairs a promise holding a field element
//! with the field descriptor and the runtime that will resolve it.
//!
//! Everything here is single-threaded (`Rc`/`RefCell`), matching the
//! runtime's `LocalSet` execution model.

use std::cell::RefCell;
use std::future::Future;
use std::ops::{Add, BitXor, Mul, Neg, Sub};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::MpcError;
use crate::fields::Field;
use crate::runtime::Runtime;

type Callback<T> = Box<dyn FnOnce(&Result<T, MpcError>)>;

struct Inner<T> {
    outcome: Option<Result<T, MpcError>>,
    callbacks: Vec<Callback<T>>,
    waker: Option<Waker>,
}

/// A cell that will eventually hold a `Result<T, MpcError>`.
///
/// Resolution is permanent: callbacks registered before it run in order when
/// it happens, callbacks registered after it run immediately with the frozen
/// outcome. Resolving twice is a protocol-logic bug; the second outcome is
/// dropped.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub fn new() -> Self {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                outcome: None,
                callbacks: Vec::new(),
                waker: None,
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        let promise = Promise::new();
        promise.resolve(Ok(value));
        promise
    }

    pub fn failed(error: MpcError) -> Self {
        let promise = Promise::new();
        promise.resolve(Err(error));
        promise
    }

    /// Freeze the outcome and run all pending callbacks in registration
    /// order. A no-op (with an error log) if already resolved.
    pub fn resolve(&self, outcome: Result<T, MpcError>) {
        let (outcome, callbacks, waker) = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                tracing::error!("promise resolved twice; dropping the second outcome");
                debug_assert!(false, "promise resolved twice");
                return;
            }
            inner.outcome = Some(outcome.clone());
            (
                outcome,
                std::mem::take(&mut inner.callbacks),
                inner.waker.take(),
            )
        };
        // Callbacks run with the borrow released so they may register
        // further callbacks on this same promise.
        for callback in callbacks {
            callback(&outcome);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Register a callback; runs immediately if the outcome is frozen.
    pub fn on_resolved(&self, callback: impl FnOnce(&Result<T, MpcError>) + 'static) {
        let frozen = self.inner.borrow().outcome.clone();
        match frozen {
            Some(outcome) => callback(&outcome),
            None => self.inner.borrow_mut().callbacks.push(Box::new(callback)),
        }
    }

    /// Snapshot of the outcome, if resolved.
    pub fn peek(&self) -> Option<Result<T, MpcError>> {
        self.inner.borrow().outcome.clone()
    }

    /// Derived promise transforming a successful outcome; failures pass
    /// through.
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(&T) -> U + 'static) -> Promise<U> {
        let derived = Promise::new();
        let output = derived.clone();
        self.on_resolved(move |outcome| match outcome {
            Ok(value) => output.resolve(Ok(f(value))),
            Err(error) => output.resolve(Err(error.clone())),
        });
        derived
    }
}

impl<T: Clone + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Result<T, MpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Combine promises into one resolving with all values in input order.
///
/// Fails eagerly: the first input failure fails the output immediately,
/// without waiting for the remaining inputs.
pub fn gather<T: Clone + 'static>(inputs: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let output = Promise::new();
    if inputs.is_empty() {
        output.resolve(Ok(Vec::new()));
        return output;
    }

    struct Progress<T> {
        values: Vec<Option<T>>,
        missing: usize,
    }
    let progress = Rc::new(RefCell::new(Progress {
        values: vec![None; inputs.len()],
        missing: inputs.len(),
    }));

    for (index, input) in inputs.iter().enumerate() {
        let progress = Rc::clone(&progress);
        let output = output.clone();
        input.on_resolved(move |outcome| {
            if output.peek().is_some() {
                return;
            }
            match outcome {
                Err(error) => output.resolve(Err(error.clone())),
                Ok(value) => {
                    let mut progress = progress.borrow_mut();
                    progress.values[index] = Some(value.clone());
                    progress.missing -= 1;
                    if progress.missing == 0 {
                        let values = progress.values.drain(..).flatten().collect();
                        drop(progress);
                        output.resolve(Ok(values));
                    }
                }
            }
        });
    }
    output
}

/// Combine promises into one resolving as soon as `threshold` of them have
/// succeeded, or once every input has resolved without reaching it.
///
/// The output value is a positional snapshot; inputs still pending at
/// resolution time appear as `None`. The caller inspects the successes and
/// decides whether the shortfall is fatal.
pub fn gather_threshold<T: Clone + 'static>(
    inputs: Vec<Promise<T>>,
    threshold: usize,
) -> Promise<Vec<Option<Result<T, MpcError>>>> {
    assert!(threshold <= inputs.len(), "threshold above input count");

    let output = Promise::new();
    if threshold == 0 && inputs.is_empty() {
        output.resolve(Ok(Vec::new()));
        return output;
    }

    struct Progress<T> {
        outcomes: Vec<Option<Result<T, MpcError>>>,
        successes: usize,
        resolved: usize,
    }
    let progress = Rc::new(RefCell::new(Progress {
        outcomes: vec![None; inputs.len()],
        successes: 0,
        resolved: 0,
    }));
    let total = inputs.len();

    for (index, input) in inputs.iter().enumerate() {
        let progress = Rc::clone(&progress);
        let output = output.clone();
        input.on_resolved(move |outcome| {
            if output.peek().is_some() {
                return;
            }
            let snapshot = {
                let mut progress = progress.borrow_mut();
                progress.outcomes[index] = Some(outcome.clone());
                progress.resolved += 1;
                if outcome.is_ok() {
                    progress.successes += 1;
                }
                if progress.successes == threshold || progress.resolved == total {
                    Some(progress.outcomes.clone())
                } else {
                    None
                }
            };
            if let Some(snapshot) = snapshot {
                output.resolve(Ok(snapshot));
            }
        });
    }
    output
}

/// A secret-shared field element: this player's point of the sharing, once
/// known.
///
/// Arithmetic operators build the dataflow graph; linear operations resolve
/// locally, multiplication and xor (outside characteristic two) go through
/// the runtime.
pub struct Share<F: Field> {
    promise: Promise<F::Elem>,
    field: F,
    runtime: Weak<Runtime>,
}

impl<F: Field> Clone for Share<F> {
    fn clone(&self) -> Self {
        Share {
            promise: self.promise.clone(),
            field: self.field.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<F: Field> Share<F> {
    pub fn from_promise(promise: Promise<F::Elem>, field: F, runtime: Weak<Runtime>) -> Self {
        Share {
            promise,
            field,
            runtime,
        }
    }

    /// An already-resolved share (degree-zero sharings, local results).
    pub fn resolved(value: F::Elem, field: F, runtime: Weak<Runtime>) -> Self {
        Share {
            promise: Promise::resolved(value),
            field,
            runtime,
        }
    }

    pub fn promise(&self) -> &Promise<F::Elem> {
        &self.promise
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn runtime(&self) -> Rc<Runtime> {
        self.runtime
            .upgrade()
            .unwrap_or_else(|| panic!("runtime dropped while shares were still live"))
    }

    /// Pointwise combination of two shares; valid only for operations that
    /// commute with the sharing (linear ones).
    fn zip_with(&self, other: &Share<F>, f: impl Fn(&F, F::Elem, F::Elem) -> F::Elem + 'static) -> Share<F> {
        let field = self.field.clone();
        let promise = gather(vec![self.promise.clone(), other.promise.clone()])
            .map(move |values| f(&field, values[0], values[1]));
        Share::from_promise(promise, self.field.clone(), self.runtime.clone())
    }

    pub(crate) fn map_value(&self, f: impl Fn(&F, F::Elem) -> F::Elem + 'static) -> Share<F> {
        let field = self.field.clone();
        let promise = self.promise.map(move |&value| f(&field, value));
        Share::from_promise(promise, self.field.clone(), self.runtime.clone())
    }

    /// Add a public constant: every player adjusts its point.
    pub fn add_clear(&self, constant: F::Elem) -> Share<F> {
        self.map_value(move |field, value| field.add(value, constant))
    }

    pub fn sub_clear(&self, constant: F::Elem) -> Share<F> {
        self.map_value(move |field, value| field.sub(value, constant))
    }

    /// Multiply by a public constant, no communication.
    pub fn mul_clear(&self, constant: F::Elem) -> Share<F> {
        self.map_value(move |field, value| field.mul(value, constant))
    }
}

// The promise is behind an `Rc` and the rest is plain data; nothing is
// address-sensitive.
impl<F: Field> Unpin for Share<F> {}

impl<F: Field> Future for Share<F> {
    type Output = Result<F::Elem, MpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().promise).poll(cx)
    }
}

impl<F: Field> Add for Share<F> {
    type Output = Share<F>;

    fn add(self, rhs: Share<F>) -> Share<F> {
        self.zip_with(&rhs, |field, a, b| field.add(a, b))
    }
}

impl<F: Field> Sub for Share<F> {
    type Output = Share<F>;

    fn sub(self, rhs: Share<F>) -> Share<F> {
        self.zip_with(&rhs, |field, a, b| field.sub(a, b))
    }
}

impl<F: Field> Neg for Share<F> {
    type Output = Share<F>;

    fn neg(self) -> Share<F> {
        self.map_value(|field, value| field.neg(value))
    }
}

impl<F: Field> Mul for Share<F> {
    type Output = Share<F>;

    fn mul(self, rhs: Share<F>) -> Share<F> {
        self.runtime().mul(&self, &rhs)
    }
}

impl<F: Field> BitXor for Share<F> {
    type Output = Share<F>;

    /// In characteristic two xor is addition; elsewhere a ^ b = a + b - 2ab,
    /// which costs one multiplication.
    fn bitxor(self, rhs: Share<F>) -> Share<F> {
        if F::BINARY {
            return self + rhs;
        }
        let field = self.field.clone();
        let sum = self.clone() + rhs.clone();
        let twice_product = (self * rhs).mul_clear(field.element(2));
        sum - twice_product
    }
}
