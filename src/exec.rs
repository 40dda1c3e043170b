//! Program counters: the sole mechanism correlating a message with the
//! logical operation it belongs to, independent of delivery order.
//!
//! Every player advances its counter deterministically at the same call
//! sites, so the tag a player attaches to an outgoing message equals the tag
//! its peers compute when expecting that message.

use std::cell::RefCell;

use serde::{Deserialize, Serialize};

/// Snapshot of the counter stack at one call site. Used as a message tag and
/// as a registry key; within one player's execution no two distinct logical
/// operations ever carry the same value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ProgramCounter(pub Vec<u32>);

impl ProgramCounter {
    /// Byte encoding used as PRF context material.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for part in &self.0 {
            out.extend_from_slice(&part.to_be_bytes());
        }
        out
    }
}

/// Mutable counter stack owned by the runtime.
///
/// The stack reflects nested protocol-invocation position. Issuing a tag
/// advances the innermost component; opening a subscope additionally pushes a
/// fresh component so operations issued from a deferred callback cannot
/// collide with operations issued inline after it.
#[derive(Debug)]
pub struct CounterStack {
    stack: RefCell<Vec<u32>>,
}

impl CounterStack {
    pub fn new() -> Self {
        CounterStack {
            stack: RefCell::new(vec![0]),
        }
    }

    /// Advance the innermost component and return the resulting tag.
    pub fn tag(&self) -> ProgramCounter {
        let mut stack = self.stack.borrow_mut();
        *stack.last_mut().unwrap() += 1;
        ProgramCounter(stack.clone())
    }

    /// Advance the innermost component and return a new nested scope for a
    /// deferred callback to execute under.
    pub fn subscope(&self) -> Vec<u32> {
        let mut stack = self.stack.borrow_mut();
        *stack.last_mut().unwrap() += 1;
        let mut saved = stack.clone();
        saved.push(0);
        saved
    }

    /// Replace the current stack, returning the previous one. Used when
    /// entering and leaving a deferred callback.
    pub fn swap(&self, other: Vec<u32>) -> Vec<u32> {
        std::mem::replace(&mut *self.stack.borrow_mut(), other)
    }
}

impl Default for CounterStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tags_are_unique() {
        let pc = CounterStack::new();
        let mut seen = HashSet::new();

        for _ in 0..10 {
            assert!(seen.insert(pc.tag()));
        }

        // Tags issued under a subscope never collide with tags issued inline
        // before or after it.
        let saved = pc.subscope();
        assert!(seen.insert(pc.tag()));

        let prev = pc.swap(saved);
        for _ in 0..10 {
            assert!(seen.insert(pc.tag()));
        }
        pc.swap(prev);

        for _ in 0..10 {
            assert!(seen.insert(pc.tag()));
        }
    }

    #[test]
    fn two_subscopes_diverge() {
        let pc = CounterStack::new();
        let a = pc.subscope();
        let b = pc.subscope();
        assert_ne!(a, b);
    }
}
