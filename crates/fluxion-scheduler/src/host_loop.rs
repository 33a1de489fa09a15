use std::time::Duration;

/// The contract a readiness source registers with the host event loop.
///
/// This is the Rust-native shape of the GLib-`GSource`-style contract the
/// fiber scheduler and the AIO context both implement: the host loop polls
/// `prepare`/`check` to decide whether (and how long) to block, then calls
/// `dispatch` once the source is ready. Unlike `GSource::dispatch`, which
/// takes a host-supplied callback and user data, a source here already
/// knows what work it owns (its own ready queue, its own completion ring),
/// so `dispatch` takes no callback — a deliberate simplification over the
/// C original's generic dispatch signature, which exists to let arbitrary
/// callbacks share one source type; we don't need that indirection when
/// every source here is a concrete Rust type.
pub trait HostLoopSource: Send + Sync {
    /// Called before the loop blocks. Returns `true` if the source is
    /// already ready to dispatch (no blocking needed this iteration). May
    /// narrow `*timeout` to a shorter deadline (e.g. a fiber's timeout).
    fn prepare(&self, timeout: &mut Option<Duration>) -> bool;

    /// Called after blocking, to check whether this source became ready.
    fn check(&self) -> bool;

    /// Runs the source's ready work. Returns `true` if the source may still
    /// have more immediate work (the loop should dispatch it again before
    /// blocking) or `false` if it's drained for this iteration.
    fn dispatch(&self) -> bool;

    /// Called when the source is removed from the loop.
    fn finalize(&self) {}
}
