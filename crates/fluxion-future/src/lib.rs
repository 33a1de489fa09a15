//! Deferred-result future/promise primitive.
//!
//! A [`Future`] is a read-only handle to a result that will become
//! available; a [`Promise`] is the write side held by the producer. Both
//! wrap the same shared, lock-protected state: status, an append-only list
//! of completion observers (drained exactly once on the pending→terminal
//! transition), and the terminal value or error once set.
//!
//! No lock is ever held while an observer runs — `resolve`/`reject` take the
//! observer list out from under the lock, drop the lock, then fire.

mod error;
mod future;
pub mod timeout;

pub use error::{AlreadyResolved, Error, Result};
pub use future::{chain, pending, race, Future, Outcome, Promise};
