//! Bounded producer/consumer channel whose `send` and `receive` operations
//! are themselves futures: backpressure and delivery are both expressed as
//! completion rather than blocking.

mod channel;
mod error;
mod fifo;

pub use channel::Channel;
pub use error::Error;
