use thiserror::Error;

/// Errors raised by the scheduler and its registry.
///
/// Kept separate from [`fluxion_future::Error`] (the domain error surfaced
/// through futures) because these are scheduler-setup/usage mistakes, not
/// outcomes a future can be rejected with.
#[derive(Debug, Error)]
pub enum Error {
    /// `registry::set_process_default` was called more than once.
    #[error("a process-default scheduler is already set")]
    AlreadyInitialized,

    /// A scheduler operation was attempted from a state that forbids it,
    /// e.g. dispatching with no thread-default scheduler bound.
    #[error("invalid scheduler state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
