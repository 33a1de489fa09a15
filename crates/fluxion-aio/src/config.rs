/// Tuning knobs for the ring-based [`crate::ring::RingAio`] backend.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Submission/completion ring depth. Rounded up to a power of two by the
    /// kernel. `0` means "pick the default."
    pub depth: u32,
    /// Whether to ask the kernel for a dedicated submission-queue-polling
    /// thread (`IORING_SETUP_SQPOLL`). Off by default: it trades a
    /// background kernel thread (and elevated privileges on some kernels)
    /// for lower per-submission latency, which isn't this crate's default
    /// tradeoff to make for callers.
    pub sqpoll: bool,
}

impl RingConfig {
    /// Depth 32, a reasonable default ring size, no SQPOLL.
    pub const DEFAULT_DEPTH: u32 = 32;
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            depth: Self::DEFAULT_DEPTH,
            sqpoll: false,
        }
    }
}
