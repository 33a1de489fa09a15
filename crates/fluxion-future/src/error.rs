use core::fmt;

/// The closed set of error kinds surfaced by the `fluxion` runtime core.
///
/// Every crate in the workspace shares this type so that chaining a future
/// from one component (a channel receive, a fiber await, an AIO read) into
/// another never has to translate between incompatible error domains.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A send was attempted on a closed send-side, or a receive could never
    /// be fulfilled because no sender remains.
    #[error("channel closed")]
    ChannelClosed,

    /// A timeout future's deadline elapsed before the race was won.
    #[error("operation timed out")]
    TimedOut,

    /// An operation was abandoned by rejecting the future it was waiting on.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// An AIO completion reported a non-successful kernel status.
    #[error("I/O error (errno {errno}): {message}")]
    Io { errno: i32, message: String },

    /// A program-logic error, e.g. resolving an already-terminal promise.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }

    pub fn io(errno: i32) -> Self {
        let message = io_error_message(errno);
        Error::Io { errno, message }
    }
}

#[cfg(unix)]
fn io_error_message(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

#[cfg(not(unix))]
fn io_error_message(errno: i32) -> String {
    format!("errno {errno}")
}

impl fmt::Display for AlreadyResolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise already resolved")
    }
}

/// Returned by a second `resolve`/`reject` attempt on a promise.
///
/// Kept distinct from [`Error`] because it is a benign, expected outcome of
/// racing multiple completers against one promise (e.g. a timeout racing an
/// operation) rather than a domain error to propagate to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyResolved;

impl std::error::Error for AlreadyResolved {}

pub type Result<T, E = Error> = core::result::Result<T, E>;
