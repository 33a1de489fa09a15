//! Common imports for embedding `fluxion`.
//!
//! ```
//! use fluxion::prelude::*;
//! let (future, promise) = pending::<i32>();
//! promise.resolve(7).unwrap();
//! assert_eq!(*future.peek().unwrap().unwrap(), 7);
//! ```

pub use fluxion_channel::Channel;
pub use fluxion_future::{chain, pending, race, Error, Future, Outcome, Promise, Result};
pub use fluxion_scheduler::{Context, HostLoopSource, Scheduler};

#[cfg(feature = "aio")]
pub use fluxion_aio::{AioBackend, AioResult};
