use fluxion_future::Error;

/// Maps a negative io_uring/thread-pool completion result (a negated errno,
/// the kernel convention this backend's completions use) to the shared
/// error domain.
pub(crate) fn map_errno(result: i32) -> Error {
    Error::io(-result)
}
