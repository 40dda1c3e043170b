use thiserror::Error;

use crate::PartyId;

/// Error raised synchronously by field operations that cannot be performed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ArithmeticError {
    #[error("cannot invert zero")]
    DivisionByZero,
}

/// Protocol-level failure, delivered through the failure channel of a
/// [`Promise`](crate::share::Promise) exactly like a value resolution.
///
/// None of these are retried by the runtime: retrying with stale randomness
/// can break privacy, so retry policy is left to the application.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MpcError {
    /// Reconstruction found more corrupted shares than the corruption bound
    /// tolerates. Fatal to the affected protocol instance.
    #[error("share consistency violated: {0}")]
    ShareConsistency(String),

    /// Duplicate or out-of-order program counter, or a malformed message
    /// where a well-formed one was required. Indicates a structural bug in
    /// the protocol logic and is surfaced immediately.
    #[error("protocol sequence violation: {0}")]
    ProtocolSequence(String),

    /// Connection to a peer was lost. Instances that already hold enough
    /// contributions complete despite it.
    #[error("connection to player {peer} lost")]
    Network { peer: PartyId },

    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),
}
