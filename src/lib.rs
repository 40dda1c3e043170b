//! Threshold secret-sharing MPC over a runtime-chosen prime field or
//! GF(2^8): Shamir sharing, pseudo-random secret sharing, a program-counter
//! tagged asynchronous runtime, and passively or actively secure arithmetic
//! with reliable broadcast and integer comparison on top.
//!
//! A computation runs one [`runtime::Runtime`] per player on a tokio
//! `LocalSet`; shares are single-assignment dataflow cells that resolve as
//! protocol messages arrive.

pub mod error;
pub mod exec;
pub mod fields;
pub mod prss;
pub mod runtime;
pub mod shamir;
pub mod share;
pub mod transport;

/// Player identifier; players are numbered 1..=n so that a player's id
/// doubles as its Shamir evaluation point.
pub type PartyId = usize;

pub use error::{ArithmeticError, MpcError};
pub use fields::{find_prime, Field, Gf256, PrimeField};
pub use runtime::{Runtime, RuntimeOptions, RuntimeParams, Security};
pub use share::{Promise, Share};
