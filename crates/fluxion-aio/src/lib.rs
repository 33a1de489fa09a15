//! Asynchronous I/O backend: submits `read`/`write` operations against
//! caller-owned file descriptors and completes a [`fluxion_future::Future`]
//! per operation from kernel (or worker-thread) completion events.
//!
//! [`ring::RingAio`] is the primary, `io_uring`-backed implementation
//! (Linux only, enabled by the default `ring` feature).
//! [`threadpool::ThreadPoolAio`] is a portable fallback for platforms or
//! kernels without `io_uring`, behind the `thread-pool-aio` feature, built
//! on the same [`AioBackend`] contract so callers can swap backends without
//! touching call sites.

mod backend;
mod config;
#[cfg(unix)]
mod eventfd;
mod error;
#[cfg(all(unix, feature = "ring"))]
pub mod ring;
#[cfg(all(unix, feature = "thread-pool-aio"))]
pub mod threadpool;

pub use backend::{AioBackend, AioResult};
pub use config::RingConfig;

#[cfg(all(unix, feature = "ring"))]
pub use ring::RingAio;
#[cfg(all(unix, feature = "thread-pool-aio"))]
pub use threadpool::ThreadPoolAio;

/// Creates the default AIO context for this platform: `io_uring` when the
/// `ring` feature is enabled, otherwise the thread-pool fallback.
#[cfg(all(unix, feature = "ring"))]
pub fn create_context(config: RingConfig) -> std::io::Result<std::sync::Arc<RingAio>> {
    RingAio::new(config)
}

#[cfg(all(unix, feature = "thread-pool-aio", not(feature = "ring")))]
pub fn create_context(_config: RingConfig) -> std::io::Result<std::sync::Arc<ThreadPoolAio>> {
    ThreadPoolAio::new(threadpool::DEFAULT_WORKERS)
}
